//! Stream session: turns, transport and pipeline wired together.
//!
//! ```text
//!            send(prompt)
//!                 │
//!   TurnHistory ◄─┤ begin (pending)
//!                 ▼
//!   EventSource ──► handle_event ──► PatchPipeline ──► TreeStore
//!       │  ▲            │                  ▲
//!       │  └ backoff    ├─► ProgressSink   └── frame tick
//!       │               └─► TurnHistory (messages, questions, …)
//!       ▼
//!   done ─► flush ─► snapshot ─► complete
//! ```
//!
//! Observers subscribe through [`Session::take_event_rx`]. Events are
//! delivered best-effort: when the channel is full they are dropped rather
//! than stalling the stream.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use treesync_core::{prune_subtree, Tree};

use crate::archive::TurnArchive;
use crate::pipeline::{
    FlushReport, FrameScheduler, MemoryTreeStore, PatchPipeline, PipelineConfig, PipelineStats,
    PushOutcome, SelectionHost, TreeStore,
};
use crate::progress::{self, NoProgress, ProgressSink};
use crate::protocol::{ServerError, StreamEvent};
use crate::source::{EventSource, ReadError, SourceItem};
use crate::transport::{Attachment, Connector, StreamConfig, StreamRequest, TransportError};
use crate::turns::{TurnError, TurnHistory};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub stream: StreamConfig,
    pub pipeline: PipelineConfig,
    /// Paint cadence used when the host does not drive frames itself.
    pub frame_interval: Duration,
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            pipeline: PipelineConfig::default(),
            frame_interval: Duration::from_millis(16),
            event_buffer: 256,
        }
    }
}

impl SessionConfig {
    pub fn for_testing(endpoint: impl Into<String>) -> Self {
        Self {
            stream: StreamConfig::for_testing(endpoint),
            frame_interval: Duration::from_millis(1),
            ..Self::default()
        }
    }
}

/// Events emitted by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Request accepted, waiting for the first byte
    TurnStarted { turn_id: String },
    /// First response data arrived.
    TurnStreaming { turn_id: String },
    /// A flush published a new tree
    TreeUpdated { elements: usize },
    /// Stream finished cleanly
    TurnCompleted { turn_id: String },
    /// Turn ended with an error
    TurnFailed { turn_id: String, error: String },
    /// Turn was cancelled by the caller
    TurnCancelled { turn_id: String },
    /// Connection lost; retrying after `delay`
    Reconnecting {
        attempt: u32,
        delay: Duration,
        resume_after: Option<u64>,
    },
    /// A recoverable in-band server error; the stream continues.
    ServerWarning { turn_id: String, error: ServerError },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Completed { turn_id: String },
    Cancelled { turn_id: String },
}

impl SendOutcome {
    pub fn turn_id(&self) -> &str {
        match self {
            SendOutcome::Completed { turn_id } | SendOutcome::Cancelled { turn_id } => turn_id,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("server reported an error ({}): {message}", .code.as_deref().unwrap_or("unknown"))]
    Server { code: Option<String>, message: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Turn(#[from] TurnError),
}

/// Per-send options.
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub context: Option<Value>,
    pub attachments: Vec<Attachment>,
    /// Send the current tree so the backend edits rather than regenerates.
    pub include_tree: bool,
    pub include_history: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            context: None,
            attachments: Vec::new(),
            include_tree: true,
            include_history: true,
        }
    }
}

/// Cancels the in-flight send from anywhere.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    slot: Arc<Mutex<Option<CancellationToken>>>,
}

impl AbortHandle {
    /// Returns whether a send was in flight.
    pub fn abort(&self) -> bool {
        match self.slot.lock() {
            Ok(slot) => match slot.as_ref() {
                Some(token) if !token.is_cancelled() => {
                    token.cancel();
                    true
                }
                _ => false,
            },
            Err(_) => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.slot
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|t| !t.is_cancelled()))
            .unwrap_or(false)
    }

    fn install(&self, token: CancellationToken) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(token);
        }
    }

    fn clear(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}

enum DriveError {
    Cancelled,
    Failed(SessionError),
}

impl From<TurnError> for DriveError {
    fn from(e: TurnError) -> Self {
        DriveError::Failed(e.into())
    }
}

pub struct Session {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    store: Box<dyn TreeStore>,
    pipeline: PatchPipeline,
    turns: TurnHistory,
    progress: Box<dyn ProgressSink>,
    abort: AbortHandle,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
}

impl Session {
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        Self {
            pipeline: PatchPipeline::new(config.pipeline.clone()),
            config,
            connector,
            store: Box::new(MemoryTreeStore::new()),
            turns: TurnHistory::new(),
            progress: Box::new(NoProgress),
            abort: AbortHandle::default(),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    pub fn with_store(mut self, store: Box<dyn TreeStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Box<dyn FrameScheduler>) -> Self {
        self.pipeline = self.pipeline.with_scheduler(scheduler);
        self
    }

    pub fn with_selection(mut self, selection: Box<dyn SelectionHost>) -> Self {
        self.pipeline = self.pipeline.with_selection(selection);
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn tree(&self) -> Tree {
        self.store.tree()
    }

    pub fn turns(&self) -> &TurnHistory {
        &self.turns
    }

    pub fn pipeline_stats(&self) -> &PipelineStats {
        self.pipeline.stats()
    }

    /// Paint hook for hosts that drive frames themselves.
    pub fn on_frame(&mut self) -> FlushReport {
        let report = self.pipeline.on_frame(&mut *self.store);
        self.after_flush(report);
        report
    }

    /// Stream a new turn for `prompt` until the server finishes.
    ///
    /// Any previous send still registered is cancelled first. An abort
    /// resolves to [`SendOutcome::Cancelled`], not an error.
    pub async fn send(
        &mut self,
        prompt: impl Into<String>,
        options: SendOptions,
    ) -> Result<SendOutcome, SessionError> {
        let prompt = prompt.into();
        self.abort.abort();
        for stale in self.turns.unfinished() {
            log::warn!("Discarding unfinished turn {stale}");
            self.turns.remove(&stale);
            self.emit(SessionEvent::TurnCancelled { turn_id: stale });
        }
        self.pipeline.reset();

        let turn_id = self.turns.begin(prompt.clone());
        let cancel = CancellationToken::new();
        self.abort.install(cancel.clone());
        self.pipeline.set_turn(Some(turn_id.clone()));
        self.emit(SessionEvent::TurnStarted {
            turn_id: turn_id.clone(),
        });
        log::info!("Turn {turn_id} started");

        let mut request = StreamRequest::new(prompt, turn_id.clone()).with_attachments(options.attachments);
        if options.include_history {
            request = request.with_messages(self.turns.chat_messages());
        }
        if options.include_tree {
            request = request.with_current_tree(self.store.tree());
        }
        if let Some(context) = options.context {
            request = request.with_context(context);
        }

        let mut source = EventSource::new(self.connector.clone(), request, self.config.stream.clone());
        let result = self.drive(&mut source, &turn_id, &cancel).await;
        self.abort.clear();
        self.finish_turn(&turn_id, result)
    }

    /// Remove `turn_id` and everything after it, restoring the tree to the
    /// last surviving snapshot.
    pub fn delete_turn(&mut self, turn_id: &str) -> Result<(), SessionError> {
        self.abort.abort();
        self.pipeline.reset();
        let restored = self.turns.truncate_from(turn_id)?;
        log::info!("Deleted turn {turn_id}, restored tree with {} elements", restored.len());
        self.store.set_tree(restored);
        self.emit_tree_updated();
        Ok(())
    }

    /// Replace `turn_id` (and everything after it) with a fresh send.
    pub async fn edit_turn(
        &mut self,
        turn_id: &str,
        message: impl Into<String>,
        options: SendOptions,
    ) -> Result<SendOutcome, SessionError> {
        self.delete_turn(turn_id)?;
        self.send(message, options).await
    }

    pub fn answer_question(
        &mut self,
        turn_id: &str,
        question_id: &str,
        answer: Value,
    ) -> Result<(), SessionError> {
        self.turns.answer_question(turn_id, question_id, answer)?;
        Ok(())
    }

    /// Delete an element and whatever only it kept alive.
    pub fn delete_element(&mut self, key: &str) {
        let current = self.store.tree();
        let next = prune_subtree(&current, key);
        if !Tree::ptr_eq(&current, &next) {
            self.store.set_tree(next);
            self.emit_tree_updated();
        }
    }

    pub fn archive(&self) -> TurnArchive {
        TurnArchive::new(self.turns.clone(), self.store.tree())
    }

    /// Replace history and tree with an archived conversation.
    pub fn restore(&mut self, archive: TurnArchive) {
        self.abort.abort();
        self.pipeline.reset();
        self.turns = archive.turns;
        self.store.set_tree(archive.tree);
        self.emit_tree_updated();
    }

    async fn drive(
        &mut self,
        source: &mut EventSource,
        turn_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DriveError> {
        let mut ticker = tokio::time::interval(self.config.frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let frame_due = self.pipeline.frame_pending();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DriveError::Cancelled),
                _ = ticker.tick(), if frame_due => {
                    self.on_frame();
                }
                next = source.next_item(cancel) => {
                    for retry in source.take_retries() {
                        self.emit(SessionEvent::Reconnecting {
                            attempt: retry.attempt,
                            delay: retry.delay,
                            resume_after: retry.resume_after,
                        });
                    }
                    match next {
                        Ok(Some(SourceItem::FirstByte)) => {
                            self.turns.mark_streaming(turn_id)?;
                            self.emit(SessionEvent::TurnStreaming {
                                turn_id: turn_id.to_string(),
                            });
                        }
                        Ok(Some(SourceItem::Event(event))) => {
                            log::trace!("Event {} ({})", event.sequence, event.event.kind());
                            self.handle_event(turn_id, event.event)?;
                            source.mark_processed(event.sequence);
                        }
                        Ok(None) => return Ok(()),
                        Err(ReadError::Cancelled) => return Err(DriveError::Cancelled),
                        Err(ReadError::Transport(e)) => return Err(DriveError::Failed(e.into())),
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, turn_id: &str, event: StreamEvent) -> Result<(), DriveError> {
        match event {
            StreamEvent::Patch(patch) => {
                let outcome = self.pipeline.push(&mut *self.store, vec![patch], false);
                self.after_push(outcome);
            }
            StreamEvent::Patches { patches, atomic } => {
                let outcome = self.pipeline.push(&mut *self.store, patches, atomic);
                self.after_push(outcome);
            }
            StreamEvent::Message(message) => self.turns.record_message(turn_id, message)?,
            StreamEvent::Question(question) => self.turns.record_question(turn_id, question)?,
            StreamEvent::Suggestion(suggestion) => self.turns.record_suggestion(turn_id, suggestion)?,
            StreamEvent::PersistedAttachments(attachments) => {
                self.turns.record_attachments(turn_id, attachments)?
            }
            StreamEvent::Citations(citations) => self.turns.record_citations(turn_id, citations)?,
            StreamEvent::Error(error) if error.recoverable => {
                log::warn!("Server warning on turn {turn_id}: {}", error.message);
                self.emit(SessionEvent::ServerWarning {
                    turn_id: turn_id.to_string(),
                    error,
                });
            }
            StreamEvent::Error(error) => {
                return Err(DriveError::Failed(SessionError::Server {
                    code: error.code,
                    message: error.message,
                }));
            }
            StreamEvent::Start { message_id } => {
                log::debug!("Turn {turn_id} stream started (message {message_id:?})");
            }
            StreamEvent::TextDelta(_) | StreamEvent::Done => {}
            other => {
                progress::forward(&mut *self.progress, &other);
            }
        }
        Ok(())
    }

    fn finish_turn(
        &mut self,
        turn_id: &str,
        result: Result<(), DriveError>,
    ) -> Result<SendOutcome, SessionError> {
        match result {
            Ok(()) => {
                self.settle();
                self.turns.complete(turn_id, self.store.tree())?;
                log::info!("Turn {turn_id} complete ({} elements)", self.store.tree().len());
                self.emit(SessionEvent::TurnCompleted {
                    turn_id: turn_id.to_string(),
                });
                Ok(SendOutcome::Completed {
                    turn_id: turn_id.to_string(),
                })
            }
            Err(DriveError::Cancelled) => {
                self.pipeline.reset();
                self.turns.remove(turn_id);
                log::info!("Turn {turn_id} cancelled");
                self.emit(SessionEvent::TurnCancelled {
                    turn_id: turn_id.to_string(),
                });
                Ok(SendOutcome::Cancelled {
                    turn_id: turn_id.to_string(),
                })
            }
            Err(DriveError::Failed(error)) => {
                self.settle();
                self.turns.fail(turn_id, error.to_string())?;
                log::error!("Turn {turn_id} failed: {error}");
                self.emit(SessionEvent::TurnFailed {
                    turn_id: turn_id.to_string(),
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }

    /// Flush what is left of a turn and serve the frame that follows it,
    /// so a selection saved by that flush is restored.
    fn settle(&mut self) {
        let report = self.pipeline.flush(&mut *self.store);
        self.after_flush(report);
        if self.pipeline.frame_pending() || self.pipeline.restore_pending() {
            self.on_frame();
        }
    }

    fn after_push(&mut self, outcome: PushOutcome) {
        match outcome {
            PushOutcome::Flushed(report) | PushOutcome::Backpressure(report) => self.after_flush(report),
            PushOutcome::Queued | PushOutcome::Ignored => {}
        }
    }

    fn after_flush(&mut self, report: FlushReport) {
        if report.applied_any() {
            self.emit_tree_updated();
        }
    }

    fn emit_tree_updated(&self) {
        self.emit(SessionEvent::TreeUpdated {
            elements: self.store.tree().len(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            log::trace!("Session event not delivered: {e}");
        }
    }
}
