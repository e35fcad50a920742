//! Reconnecting event reader for one logical send.
//!
//! ```text
//!  Connector::open ──► bytes ──► LineDecoder ──► StreamEvent ──► caller
//!        ▲                │ error / idle
//!        └── backoff ◄────┘ (resume after last processed sequence)
//! ```
//!
//! The reader owns the send's [`ReconnectState`]; the caller reports each
//! event it finished handling through [`EventSource::mark_processed`], which
//! is what a reconnect resumes after. Events replayed by the server with a
//! sequence at or below one already delivered are skipped.
//!
//! [`EventSource::next_event`] is cancel-safe: the backoff deadline, the
//! idle deadline and an in-flight connect live in the reader, so dropping
//! the future (e.g. when a frame tick wins a `select!`) never re-issues a
//! request or restarts a wait.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::framing::{Frame, LineDecoder};
use crate::protocol::{payload_sequence, SequencedEvent, StreamEvent};
use crate::reconnect::{ReconnectState, RetryDecision};
use crate::transport::{ByteStream, Connector, StreamConfig, StreamRequest, TransportError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("stream cancelled")]
    Cancelled,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A retry the reader performed, for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryRecord {
    pub attempt: u32,
    pub delay: Duration,
    pub resume_after: Option<u64>,
}

/// What [`EventSource::next_item`] produced.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceItem {
    /// The first response bytes of the send arrived.
    FirstByte,
    Event(SequencedEvent),
}

type OpenFuture = BoxFuture<'static, Result<ByteStream, TransportError>>;

pub struct EventSource {
    connector: Arc<dyn Connector>,
    request: Arc<StreamRequest>,
    config: StreamConfig,
    state: ReconnectState,
    decoder: LineDecoder,
    body: Option<ByteStream>,
    /// Connect in flight; kept across dropped `next_item` futures.
    opening: Option<OpenFuture>,
    pending: VecDeque<SequencedEvent>,
    /// Highest sequence handed out so far.
    last_assigned: Option<u64>,
    finished: bool,
    /// Earliest instant the next connect may happen.
    retry_at: Option<Instant>,
    last_activity: Instant,
    bytes_received: u64,
    first_byte_unreported: bool,
    retries: Vec<RetryRecord>,
}

impl EventSource {
    pub fn new(connector: Arc<dyn Connector>, request: StreamRequest, config: StreamConfig) -> Self {
        Self {
            connector,
            request: Arc::new(request),
            config,
            state: ReconnectState::new(),
            decoder: LineDecoder::new(),
            body: None,
            opening: None,
            pending: VecDeque::new(),
            last_assigned: None,
            finished: false,
            retry_at: None,
            last_activity: Instant::now(),
            bytes_received: 0,
            first_byte_unreported: false,
            retries: Vec::new(),
        }
    }

    pub fn request(&self) -> &StreamRequest {
        &self.request
    }

    pub fn state(&self) -> &ReconnectState {
        &self.state
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Retries performed since the last call.
    pub fn take_retries(&mut self) -> Vec<RetryRecord> {
        std::mem::take(&mut self.retries)
    }

    /// The caller finished handling the event with this sequence.
    pub fn mark_processed(&mut self, sequence: u64) {
        self.state.record_sequence(sequence);
    }

    /// Next event, or `None` once the stream ended gracefully.
    pub async fn next_event(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<SequencedEvent>, ReadError> {
        loop {
            match self.next_item(cancel).await? {
                Some(SourceItem::Event(event)) => return Ok(Some(event)),
                Some(SourceItem::FirstByte) => continue,
                None => return Ok(None),
            }
        }
    }

    /// Like [`next_event`](Self::next_event), but also reports the arrival
    /// of the first response bytes, once per send.
    pub async fn next_item(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<SourceItem>, ReadError> {
        loop {
            if self.first_byte_unreported {
                self.first_byte_unreported = false;
                return Ok(Some(SourceItem::FirstByte));
            }
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(SourceItem::Event(event)));
            }
            if self.finished {
                return Ok(None);
            }
            if cancel.is_cancelled() {
                return Err(ReadError::Cancelled);
            }

            if self.body.is_none() {
                self.connect(cancel).await?;
                continue;
            }
            let Some(body) = self.body.as_mut() else {
                continue;
            };

            let idle = self.config.idle_timeout;
            let deadline = self.last_activity + idle;
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ReadError::Cancelled),
                read = tokio::time::timeout_at(deadline, body.next()) => read,
            };
            match read {
                Ok(Some(Ok(chunk))) => {
                    self.last_activity = Instant::now();
                    if !chunk.is_empty() && self.bytes_received == 0 {
                        self.first_byte_unreported = true;
                    }
                    self.bytes_received += chunk.len() as u64;
                    let frames = self.decoder.push(&chunk);
                    self.enqueue(frames);
                }
                Ok(Some(Err(e))) => self.recover(e)?,
                Ok(None) => {
                    let frames = self.decoder.finish();
                    self.enqueue(frames);
                    self.body = None;
                    if !self.finished {
                        log::debug!("Stream closed without a done marker");
                        self.finished = true;
                    }
                }
                Err(_) => self.recover(TransportError::IdleTimeout(idle))?,
            }
        }
    }

    /// Wait out any backoff, then drive the connect to completion.
    async fn connect(&mut self, cancel: &CancellationToken) -> Result<(), ReadError> {
        if self.opening.is_none() {
            if let Some(at) = self.retry_at {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ReadError::Cancelled),
                    _ = tokio::time::sleep_until(at) => {}
                }
                self.retry_at = None;
            }
            let resume_after = self.state.resume_after();
            let connector = Arc::clone(&self.connector);
            let request = Arc::clone(&self.request);
            self.opening = Some(Box::pin(async move {
                connector.open(&request, resume_after).await
            }));
        }
        let Some(opening) = self.opening.as_mut() else {
            return Ok(());
        };
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReadError::Cancelled),
            opened = opening => opened,
        };
        self.opening = None;
        match opened {
            Ok(body) => {
                self.body = Some(body);
                self.last_activity = Instant::now();
                Ok(())
            }
            Err(e) => self.recover(e),
        }
    }

    fn enqueue(&mut self, frames: Vec<Frame>) {
        for frame in frames {
            if self.finished {
                break;
            }
            let payload = match frame {
                Frame::Done => {
                    self.finished = true;
                    break;
                }
                Frame::Payload(payload) => payload,
            };
            let event = match StreamEvent::from_payload(&payload) {
                Ok(StreamEvent::Done) => {
                    self.finished = true;
                    break;
                }
                Ok(event) => event,
                Err(e) => {
                    log::warn!("Dropping stream payload: {e}");
                    continue;
                }
            };
            let explicit = payload_sequence(&payload);
            let sequence = match (explicit, self.last_assigned) {
                (Some(seq), Some(last)) if seq <= last => {
                    log::debug!("Skipping replayed event {seq} (already at {last})");
                    continue;
                }
                (Some(seq), _) => seq,
                (None, Some(last)) => match last.checked_add(1) {
                    Some(next) => next,
                    None => {
                        log::warn!("Dropping event: sequence space exhausted after {last}");
                        continue;
                    }
                },
                (None, None) => 1,
            };
            self.last_assigned = Some(sequence);
            self.pending.push_back(SequencedEvent {
                sequence,
                explicit: explicit.is_some(),
                event,
            });
        }
    }

    /// Tear down the connection and schedule the next attempt, or give up.
    fn recover(&mut self, error: TransportError) -> Result<(), ReadError> {
        self.body = None;
        self.decoder.reset();
        if !error.is_retryable() {
            log::error!("Stream failed permanently: {error}");
            return Err(error.into());
        }
        match self.state.next_retry(&self.config.reconnect) {
            RetryDecision::GiveUp { attempts } => {
                log::error!("Stream failed after {attempts} retries: {error}");
                Err(error.into())
            }
            RetryDecision::Retry { attempt, delay } => {
                log::warn!(
                    "Stream interrupted ({error}); retry {attempt} in {delay:?}, resuming after {:?}",
                    self.state.last_sequence()
                );
                self.retries.push(RetryRecord {
                    attempt,
                    delay,
                    resume_after: self.state.resume_after(),
                });
                self.retry_at = Some(Instant::now() + delay);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconnect::ReconnectConfig;
    use crate::transport::{ScriptedAttempt, ScriptedConnector};

    fn config() -> StreamConfig {
        StreamConfig::for_testing("scripted://")
    }

    async fn drain(source: &mut EventSource) -> Result<Vec<SequencedEvent>, ReadError> {
        let cancel = CancellationToken::new();
        let mut events = Vec::new();
        while let Some(event) = source.next_event(&cancel).await? {
            source.mark_processed(event.sequence);
            events.push(event);
        }
        Ok(events)
    }

    #[tokio::test]
    async fn test_reads_until_done() {
        let connector = Arc::new(ScriptedConnector::new([ScriptedAttempt::chunked(
            "2:{\"type\":\"start\"}\n2:{\"op\":\"set\",\"path\":\"/root\",\"value\":\"a\"}\n2:[DONE]\n2:{\"type\":\"start\"}\n",
            7,
        )]));
        let mut source = EventSource::new(connector, StreamRequest::new("hi", "t1"), config());
        let events = drain(&mut source).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 1);
        assert_eq!(events[1].sequence, 2);
        assert!(!events[1].explicit);
    }

    #[tokio::test]
    async fn test_done_event_payload_ends_stream() {
        let connector = Arc::new(ScriptedConnector::new([ScriptedAttempt::body(
            "data: {\"type\":\"start\"}\ndata: {\"type\":\"done\"}\ndata: {\"type\":\"start\"}\n",
        )]));
        let mut source = EventSource::new(connector, StreamRequest::new("hi", "t1"), config());
        assert_eq!(drain(&mut source).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumes_after_last_processed_sequence() {
        let connector = Arc::new(ScriptedConnector::new([
            ScriptedAttempt::dropped_after(
                "2:{\"type\":\"start\",\"sequence\":6}\n2:{\"type\":\"text-delta\",\"textDelta\":\"x\",\"sequence\":7}\n2:{\"type\":\"te",
                TransportError::Read("reset by peer".into()),
            ),
            ScriptedAttempt::Refuse(TransportError::Connect("refused".into())),
            ScriptedAttempt::body(
                "2:{\"type\":\"text-delta\",\"textDelta\":\"x\",\"sequence\":7}\n2:{\"type\":\"text-delta\",\"textDelta\":\"y\",\"sequence\":8}\n2:[DONE]\n",
            ),
        ]));
        let mut cfg = config();
        cfg.reconnect = ReconnectConfig {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(8_000),
            ..ReconnectConfig::default()
        };
        let mut source = EventSource::new(connector.clone(), StreamRequest::new("hi", "t1"), cfg);
        let events = drain(&mut source).await.unwrap();

        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![6, 7, 8]);

        let opened = connector.opened();
        assert_eq!(opened.len(), 3);
        assert_eq!(opened[0].resume_after, None);
        assert_eq!(opened[1].resume_after, Some(7));
        assert_eq!(opened[2].resume_after, Some(7));

        let retries = source.take_retries();
        assert_eq!(retries.len(), 2);
        assert!(retries[0].delay >= Duration::from_millis(1_100));
        assert!(retries[1].delay >= Duration::from_millis(2_200));
        assert!(retries[1].delay >= retries[0].delay);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let connector = Arc::new(ScriptedConnector::new([ScriptedAttempt::Refuse(
            TransportError::Status { status: 401, body: "no".into() },
        )]));
        let mut source = EventSource::new(connector.clone(), StreamRequest::new("hi", "t1"), config());
        let err = drain(&mut source).await.unwrap_err();
        assert!(matches!(err, ReadError::Transport(TransportError::Status { status: 401, .. })));
        assert_eq!(connector.opened().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let connector = Arc::new(ScriptedConnector::new(
            (0..10).map(|_| ScriptedAttempt::Refuse(TransportError::Connect("down".into()))),
        ));
        let mut source = EventSource::new(connector.clone(), StreamRequest::new("hi", "t1"), config());
        let err = drain(&mut source).await.unwrap_err();
        assert!(matches!(err, ReadError::Transport(TransportError::Connect(_))));
        let budget = ReconnectConfig::for_testing().max_retries as usize;
        assert_eq!(connector.opened().len(), budget + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_triggers_reconnect() {
        let connector = Arc::new(ScriptedConnector::new([
            ScriptedAttempt::Stall {
                chunks: vec![b"2:{\"type\":\"start\"}\n".to_vec()],
            },
            ScriptedAttempt::body("2:[DONE]\n"),
        ]));
        let mut source = EventSource::new(connector.clone(), StreamRequest::new("hi", "t1"), config());
        let events = drain(&mut source).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(connector.opened()[1].resume_after, Some(1));
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let connector = Arc::new(ScriptedConnector::new([ScriptedAttempt::Refuse(
            TransportError::Connect("down".into()),
        )]));
        let mut cfg = config();
        cfg.reconnect.base_delay = Duration::from_secs(60);
        let mut source = EventSource::new(connector, StreamRequest::new("hi", "t1"), cfg);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        assert_eq!(source.next_event(&cancel).await, Err(ReadError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_read_keeps_connect_in_flight() {
        let connector = Arc::new(ScriptedConnector::new([ScriptedAttempt::SlowConnect {
            delay: Duration::from_millis(200),
            chunks: vec![b"2:{\"type\":\"start\"}\n2:[DONE]\n".to_vec()],
        }]));
        let mut source = EventSource::new(connector.clone(), StreamRequest::new("hi", "t1"), config());
        let cancel = CancellationToken::new();

        let mut ticks = 0;
        let event = loop {
            match tokio::time::timeout(Duration::from_millis(16), source.next_event(&cancel)).await {
                Ok(result) => break result.unwrap(),
                Err(_) => ticks += 1,
            }
        };
        assert!(ticks >= 10);
        assert!(matches!(event.map(|e| e.event), Some(StreamEvent::Start { .. })));
        assert_eq!(connector.opened().len(), 1);
    }

    #[tokio::test]
    async fn test_first_byte_reported_before_any_event() {
        let connector = Arc::new(ScriptedConnector::new([ScriptedAttempt::chunked(
            "2:{\"type\":\"start\"}\n2:[DONE]\n",
            4,
        )]));
        let mut source = EventSource::new(connector, StreamRequest::new("hi", "t1"), config());
        let cancel = CancellationToken::new();
        assert_eq!(source.next_item(&cancel).await.unwrap(), Some(SourceItem::FirstByte));
        assert!(matches!(source.next_item(&cancel).await.unwrap(), Some(SourceItem::Event(_))));
        assert_eq!(source.next_item(&cancel).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sequence_overflow_drops_event() {
        let connector = Arc::new(ScriptedConnector::new([ScriptedAttempt::body(&format!(
            "2:{{\"type\":\"start\",\"sequence\":{}}}\n2:{{\"type\":\"start\"}}\n2:[DONE]\n",
            u64::MAX
        ))]));
        let mut source = EventSource::new(connector, StreamRequest::new("hi", "t1"), config());
        let events = drain(&mut source).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sequence, u64::MAX);
    }
}
