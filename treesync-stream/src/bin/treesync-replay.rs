//! treesync-replay — fold a recorded stream (or a live endpoint) into a tree.
//!
//! ```text
//! treesync-replay <transcript> [--chunk N] [--max-queued N] [--immediate] [--archive PATH]
//! treesync-replay --url <endpoint> <prompt> [--max-queued N] [--immediate] [--archive PATH]
//! ```
//!
//! Prints the final tree as pretty JSON on stdout. Set `RUST_LOG=debug`
//! to watch the stream.

use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};
use treesync_stream::{
    Connector, HttpConnector, ImmediateScheduler, ScriptedAttempt, ScriptedConnector, SendOptions,
    SendOutcome, Session, SessionConfig, SessionEvent, StreamConfig,
};

const USAGE: &str = "usage: treesync-replay <transcript> [--chunk N] [--max-queued N] [--immediate] [--archive PATH]\n       treesync-replay --url <endpoint> <prompt> [--max-queued N] [--immediate] [--archive PATH]";

#[derive(Debug, Default)]
struct Args {
    url: Option<String>,
    positional: Option<String>,
    chunk: Option<usize>,
    max_queued: Option<usize>,
    immediate: bool,
    archive: Option<String>,
}

fn parse_args(mut argv: impl Iterator<Item = String>) -> Result<Args, String> {
    let mut args = Args::default();
    let number = |flag: &str, value: Option<String>| -> Result<usize, String> {
        value
            .ok_or_else(|| format!("{flag} needs a value"))?
            .parse()
            .map_err(|e| format!("{flag}: {e}"))
    };
    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--url" => args.url = Some(argv.next().ok_or("--url needs a value")?),
            "--chunk" => args.chunk = Some(number("--chunk", argv.next())?),
            "--max-queued" => args.max_queued = Some(number("--max-queued", argv.next())?),
            "--archive" => args.archive = Some(argv.next().ok_or("--archive needs a value")?),
            "--immediate" => args.immediate = true,
            "-h" | "--help" => return Err(USAGE.to_string()),
            flag if flag.starts_with("--") => return Err(format!("unknown flag {flag}\n{USAGE}")),
            _ if args.positional.is_none() => args.positional = Some(arg),
            _ => return Err(format!("unexpected argument {arg}\n{USAGE}")),
        }
    }
    if args.positional.is_none() {
        return Err(USAGE.to_string());
    }
    Ok(args)
}

async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let positional = args.positional.clone().unwrap_or_default();
    let mut config = match &args.url {
        Some(url) => SessionConfig {
            stream: StreamConfig::new(url.clone()),
            ..SessionConfig::default()
        },
        None => SessionConfig::default(),
    };
    if let Some(max_queued) = args.max_queued {
        config.pipeline.max_queued_patches = max_queued;
    }

    let (connector, prompt): (Arc<dyn Connector>, String) = match &args.url {
        Some(_) => (Arc::new(HttpConnector::new(&config.stream)?) as Arc<dyn Connector>, positional),
        None => {
            let transcript = std::fs::read_to_string(&positional)?;
            info!("Replaying {} ({} bytes)", positional, transcript.len());
            let attempt = match args.chunk {
                Some(size) => ScriptedAttempt::chunked(&transcript, size),
                None => ScriptedAttempt::body(&transcript),
            };
            (Arc::new(ScriptedConnector::new([attempt])) as Arc<dyn Connector>, "replay".to_string())
        }
    };

    let mut session = Session::new(config, connector);
    if args.immediate {
        session = session.with_scheduler(Box::new(ImmediateScheduler));
    }
    let mut events = session.take_event_rx().ok_or("event receiver already taken")?;
    let logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Reconnecting { attempt, delay, resume_after } => {
                    info!("Reconnecting (attempt {attempt}, {delay:?}, resume after {resume_after:?})")
                }
                SessionEvent::TurnFailed { turn_id, error: e } => error!("Turn {turn_id} failed: {e}"),
                other => log::debug!("{other:?}"),
            }
        }
    });

    let outcome = session.send(prompt, SendOptions::default()).await;
    let stats = session.pipeline_stats().clone();
    info!(
        "Applied {} patches in {} batches ({} backpressure flushes, {} failed groups)",
        stats.flushed_patches, stats.flushed_batches, stats.backpressure_flushes, stats.failed_groups
    );

    if let Some(path) = &args.archive {
        session.archive().write_to(path)?;
        info!("Archived session to {path}");
    }
    println!("{}", serde_json::to_string_pretty(&session.tree())?);

    drop(session);
    let _ = logger.await;
    match outcome? {
        SendOutcome::Completed { turn_id } => info!("Turn {turn_id} complete"),
        SendOutcome::Cancelled { turn_id } => info!("Turn {turn_id} cancelled"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(2);
        }
    };
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
