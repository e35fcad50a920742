//! Request model and connectors.
//!
//! A [`Connector`] turns a [`StreamRequest`] into a byte stream. The HTTP
//! connector POSTs JSON (or multipart when files are attached) and hands
//! back the response body; retry and resume policy live one layer up in
//! [`crate::source`].

use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use treesync_core::Tree;
use uuid::Uuid;

use crate::reconnect::ReconnectConfig;

pub const RESUME_HEADER: &str = "X-Resume-After-Sequence";
pub const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";

/// Multipart field carrying the JSON request body.
pub const PAYLOAD_FIELD: &str = "payload";
/// Multipart field carrying each attached file.
pub const FILES_FIELD: &str = "files";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("server responded with HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("stream read failed: {0}")]
    Read(String),
    #[error("no data received for {0:?}")]
    IdleTimeout(Duration),
    #[error("request could not be built: {0}")]
    Request(String),
}

impl TransportError {
    /// Client errors and unbuildable requests fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Status { status, .. } => {
                !(400..500).contains(status) || *status == 408 || *status == 429
            }
            TransportError::Request(_) => false,
            _ => true,
        }
    }
}

/// Connection settings for one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub endpoint: String,
    /// Longest silence tolerated on an open stream.
    pub idle_timeout: Duration,
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:3000/api/stream".to_string(),
            idle_timeout: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
            extra_headers: BTreeMap::new(),
        }
    }
}

impl StreamConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn for_testing(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            idle_timeout: Duration::from_millis(500),
            reconnect: ReconnectConfig::for_testing(),
            extra_headers: BTreeMap::new(),
        }
    }
}

/// A file sent alongside the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// JSON body of a send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBody {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_tree: Option<Tree>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    pub turn_id: String,
    pub idempotency_key: String,
}

/// Everything needed to (re)open the stream for one send.
///
/// The idempotency key is fixed at construction, so every reconnect of the
/// same send carries the same key.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub body: RequestBody,
    pub attachments: Vec<Attachment>,
}

impl StreamRequest {
    pub fn new(prompt: impl Into<String>, turn_id: impl Into<String>) -> Self {
        Self {
            body: RequestBody {
                prompt: prompt.into(),
                messages: Vec::new(),
                current_tree: None,
                context: None,
                turn_id: turn_id.into(),
                idempotency_key: Uuid::new_v4().to_string(),
            },
            attachments: Vec::new(),
        }
    }

    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.body.messages = messages;
        self
    }

    pub fn with_current_tree(mut self, tree: Tree) -> Self {
        self.body.current_tree = Some(tree);
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.body.context = Some(context);
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn idempotency_key(&self) -> &str {
        &self.body.idempotency_key
    }

    pub fn is_multipart(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Protocol headers for one connection attempt.
    pub fn headers(&self, resume_after: Option<u64>) -> Vec<(&'static str, String)> {
        let mut headers = vec![(IDEMPOTENCY_HEADER, self.body.idempotency_key.clone())];
        if let Some(sequence) = resume_after {
            headers.push((RESUME_HEADER, sequence.to_string()));
        }
        headers
    }

    fn to_multipart(&self) -> Result<reqwest::multipart::Form, TransportError> {
        let payload =
            serde_json::to_string(&self.body).map_err(|e| TransportError::Request(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new().text(PAYLOAD_FIELD, payload);
        for attachment in &self.attachments {
            let part = reqwest::multipart::Part::bytes(attachment.bytes.clone())
                .file_name(attachment.file_name.clone())
                .mime_str(&attachment.mime_type)
                .map_err(|e| TransportError::Request(e.to_string()))?;
            form = form.part(FILES_FIELD, part);
        }
        Ok(form)
    }
}

/// Raw response body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;

/// Opens one connection attempt for a request.
pub trait Connector: Send + Sync {
    fn open<'a>(
        &'a self,
        request: &'a StreamRequest,
        resume_after: Option<u64>,
    ) -> BoxFuture<'a, Result<ByteStream, TransportError>>;
}

/// Connector speaking HTTP via `reqwest`.
pub struct HttpConnector {
    client: reqwest::Client,
    endpoint: String,
    extra_headers: BTreeMap<String, String>,
}

impl HttpConnector {
    pub fn new(config: &StreamConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            extra_headers: config.extra_headers.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Connector for HttpConnector {
    fn open<'a>(
        &'a self,
        request: &'a StreamRequest,
        resume_after: Option<u64>,
    ) -> BoxFuture<'a, Result<ByteStream, TransportError>> {
        Box::pin(async move {
            let mut builder = self.client.post(&self.endpoint);
            for (name, value) in &self.extra_headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            for (name, value) in request.headers(resume_after) {
                builder = builder.header(name, value);
            }
            builder = if request.is_multipart() {
                builder.multipart(request.to_multipart()?)
            } else {
                builder.json(&request.body)
            };

            log::debug!(
                "Opening stream to {} (resume after {:?})",
                self.endpoint,
                resume_after
            );
            let response = builder
                .send()
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(TransportError::Status {
                    status: status.as_u16(),
                    body: body.chars().take(200).collect(),
                });
            }
            let body = response.bytes_stream().map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| TransportError::Read(e.to_string()))
            });
            Ok(Box::pin(body) as ByteStream)
        })
    }
}

/// One scripted connection attempt.
#[derive(Debug, Clone)]
pub enum ScriptedAttempt {
    /// The connect itself fails.
    Refuse(TransportError),
    /// Deliver the chunks, then end the body (or fail with the error).
    Body {
        chunks: Vec<Vec<u8>>,
        then: Option<TransportError>,
    },
    /// Deliver the chunks, then go silent forever.
    Stall { chunks: Vec<Vec<u8>> },
    /// Take `delay` to connect, then deliver the chunks and end.
    SlowConnect { delay: Duration, chunks: Vec<Vec<u8>> },
}

impl ScriptedAttempt {
    pub fn body(text: &str) -> Self {
        Self::Body {
            chunks: vec![text.as_bytes().to_vec()],
            then: None,
        }
    }

    /// Deliver `text` in `chunk_size` byte pieces.
    pub fn chunked(text: &str, chunk_size: usize) -> Self {
        Self::Body {
            chunks: text
                .as_bytes()
                .chunks(chunk_size.max(1))
                .map(<[u8]>::to_vec)
                .collect(),
            then: None,
        }
    }

    pub fn dropped_after(text: &str, error: TransportError) -> Self {
        Self::Body {
            chunks: vec![text.as_bytes().to_vec()],
            then: Some(error),
        }
    }
}

/// What a [`ScriptedConnector`] saw on one open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRecord {
    pub resume_after: Option<u64>,
    pub idempotency_key: String,
    pub prompt: String,
}

/// Connector that replays canned responses, for replays and tests.
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    attempts: Mutex<VecDeque<ScriptedAttempt>>,
    opened: Mutex<Vec<OpenRecord>>,
}

impl ScriptedConnector {
    pub fn new(attempts: impl IntoIterator<Item = ScriptedAttempt>) -> Self {
        Self {
            attempts: Mutex::new(attempts.into_iter().collect()),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Queue more attempts, e.g. for a following send.
    pub fn push(&self, attempt: ScriptedAttempt) {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push_back(attempt);
        }
    }

    pub fn opened(&self) -> Vec<OpenRecord> {
        self.opened.lock().map(|o| o.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.attempts.lock().map(|a| a.len()).unwrap_or_default()
    }
}

impl Connector for ScriptedConnector {
    fn open<'a>(
        &'a self,
        request: &'a StreamRequest,
        resume_after: Option<u64>,
    ) -> BoxFuture<'a, Result<ByteStream, TransportError>> {
        let poisoned = || TransportError::Connect("scripted connector poisoned".into());
        let next = self
            .opened
            .lock()
            .map_err(|_| poisoned())
            .and_then(|mut opened| {
                opened.push(OpenRecord {
                    resume_after,
                    idempotency_key: request.idempotency_key().to_string(),
                    prompt: request.body.prompt.clone(),
                });
                self.attempts.lock().map_err(|_| poisoned())
            })
            .and_then(|mut attempts| {
                attempts
                    .pop_front()
                    .ok_or_else(|| TransportError::Connect("no scripted response left".into()))
            });

        Box::pin(async move {
            match next? {
                ScriptedAttempt::Refuse(error) => Err(error),
                ScriptedAttempt::Body { chunks, then } => {
                    let body = stream::iter(chunks.into_iter().map(Ok).chain(then.map(Err)));
                    Ok(Box::pin(body) as ByteStream)
                }
                ScriptedAttempt::Stall { chunks } => {
                    let body = stream::iter(chunks.into_iter().map(Ok)).chain(stream::pending());
                    Ok(Box::pin(body) as ByteStream)
                }
                ScriptedAttempt::SlowConnect { delay, chunks } => {
                    tokio::time::sleep(delay).await;
                    Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))) as ByteStream)
                }
            }
        })
    }
}
