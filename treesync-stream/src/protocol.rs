//! Stream event vocabulary.
//!
//! Every framed payload is a JSON object discriminated either by a `type`
//! field (lifecycle and progress events) or by an `op` field (patches and
//! conversational events). Unknown kinds are rejected with
//! [`ProtocolError::UnknownKind`]; the reader logs and drops them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use treesync_core::{Patch, PatchOp};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload has neither a `type` nor an `op` discriminator")]
    MissingDiscriminator,
    #[error("unknown event kind {0:?}")]
    UnknownKind(String),
    #[error("malformed {kind} event: {reason}")]
    Malformed { kind: String, reason: String },
}

/// Status reported by a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolStatus {
    Starting,
    InProgress,
    Complete,
    Error,
    /// Any status this client does not know yet.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolProgress {
    pub tool_name: String,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    pub status: ToolStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub id: String,
    pub task: String,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub subtasks: Vec<Value>,
}

/// Multi-step plan announced before orchestration starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
}

/// Orchestration lifecycle markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestrationKind {
    LevelStarted,
    StepStarted,
    SubtaskStarted,
    StepDone,
    SubtaskDone,
    LevelCompleted,
    OrchestrationDone,
}

impl OrchestrationKind {
    pub fn from_type(kind: &str) -> Option<Self> {
        Some(match kind {
            "level-started" => Self::LevelStarted,
            "step-started" => Self::StepStarted,
            "subtask-started" => Self::SubtaskStarted,
            "step-done" => Self::StepDone,
            "subtask-done" => Self::SubtaskDone,
            "level-completed" => Self::LevelCompleted,
            "orchestration-done" => Self::OrchestrationDone,
            _ => return None,
        })
    }
}

/// An orchestration marker with its raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestrationEvent {
    pub kind: OrchestrationKind,
    pub payload: Value,
}

impl OrchestrationEvent {
    pub fn step_id(&self) -> Option<&str> {
        self.payload.get("stepId").and_then(Value::as_str)
    }

    pub fn subtask_id(&self) -> Option<&str> {
        self.payload.get("subtaskId").and_then(Value::as_str)
    }

    pub fn level(&self) -> Option<u64> {
        self.payload.get("level").and_then(Value::as_u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub content: String,
}

/// Error reported in-band by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
    #[serde(default)]
    pub recoverable: bool,
}

/// One decoded stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Response started
    Start { message_id: Option<String> },
    /// Assistant text fragment
    TextDelta(String),
    /// A single tree patch
    Patch(Patch),
    /// A group of patches; atomic groups are applied alone, never coalesced.
    Patches { patches: Vec<Patch>, atomic: bool },
    /// Progress of a tool invocation
    ToolProgress(ToolProgress),
    /// Plan announced before orchestration
    PlanCreated(Plan),
    /// Orchestration lifecycle marker
    Orchestration(OrchestrationEvent),
    /// Complete assistant message
    Message(AssistantMessage),
    /// Clarifying question for the user
    Question(Value),
    /// Follow-up suggestion
    Suggestion(Value),
    /// Attachments the server stored for this turn
    PersistedAttachments(Vec<Value>),
    /// Index of documents referenced by the response
    DocumentIndex(Value),
    /// Source citations
    Citations(Vec<Value>),
    /// In-band server error
    Error(ServerError),
    /// End of stream
    Done,
}

/// A stream event tagged with its position in the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedEvent {
    pub sequence: u64,
    /// Whether the server supplied the sequence or it was assigned locally.
    pub explicit: bool,
    pub event: StreamEvent,
}

/// Server-assigned sequence number carried by a payload, if any.
pub fn payload_sequence(payload: &Value) -> Option<u64> {
    payload.get("sequence").and_then(Value::as_u64)
}

fn field<T: serde::de::DeserializeOwned>(
    payload: &Value,
    kind: &str,
    name: &str,
) -> Result<T, ProtocolError> {
    let value = payload.get(name).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
        kind: kind.to_string(),
        reason: format!("{name}: {e}"),
    })
}

fn whole<T: serde::de::DeserializeOwned>(payload: &Value, kind: &str) -> Result<T, ProtocolError> {
    serde_json::from_value(payload.clone()).map_err(|e| ProtocolError::Malformed {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

/// The `value` field if present, otherwise the payload without its `op`.
fn op_body(payload: &Value) -> Value {
    match payload.get("value") {
        Some(v) => v.clone(),
        None => {
            let mut body = payload.clone();
            if let Some(map) = body.as_object_mut() {
                map.remove("op");
                map.remove("sequence");
            }
            body
        }
    }
}

fn message_content(payload: &Value) -> Option<String> {
    let from = |v: &Value| match v {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("content").and_then(Value::as_str).map(str::to_string),
        _ => None,
    };
    payload
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| payload.get("value").and_then(from))
}

impl StreamEvent {
    /// Classify a framed payload.
    pub fn from_payload(payload: &Value) -> Result<Self, ProtocolError> {
        if !payload.is_object() {
            return Err(ProtocolError::NotAnObject);
        }
        if let Some(kind) = payload.get("type").and_then(Value::as_str) {
            return Self::from_typed(kind, payload);
        }
        if let Some(op) = payload.get("op").and_then(Value::as_str) {
            return Self::from_op(op, payload);
        }
        Err(ProtocolError::MissingDiscriminator)
    }

    fn from_typed(kind: &str, payload: &Value) -> Result<Self, ProtocolError> {
        if let Some(kind) = OrchestrationKind::from_type(kind) {
            return Ok(Self::Orchestration(OrchestrationEvent {
                kind,
                payload: payload.clone(),
            }));
        }
        match kind {
            "start" => Ok(Self::Start {
                message_id: payload
                    .get("messageId")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            "text-delta" => Ok(Self::TextDelta(
                payload
                    .get("textDelta")
                    .or_else(|| payload.get("delta"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            )),
            "patches" => Ok(Self::Patches {
                patches: field(payload, kind, "patches")?,
                atomic: payload.get("atomic").and_then(Value::as_bool).unwrap_or(false),
            }),
            "tool-progress" => Ok(Self::ToolProgress(whole(payload, kind)?)),
            "plan-created" => Ok(Self::PlanCreated(field(payload, kind, "plan")?)),
            "persisted-attachments" => Ok(Self::PersistedAttachments(field(
                payload,
                kind,
                "attachments",
            )?)),
            "document-index-ui" => Ok(Self::DocumentIndex(
                payload.get("uiComponent").cloned().unwrap_or(Value::Null),
            )),
            "citations" => Ok(Self::Citations(field(payload, kind, "citations")?)),
            "error" => Ok(Self::Error(whole(payload, kind)?)),
            "done" | "finish" => Ok(Self::Done),
            other => Err(ProtocolError::UnknownKind(other.to_string())),
        }
    }

    fn from_op(op: &str, payload: &Value) -> Result<Self, ProtocolError> {
        match op {
            "message" => {
                let content = message_content(payload).ok_or_else(|| ProtocolError::Malformed {
                    kind: op.to_string(),
                    reason: "no message content".into(),
                })?;
                let id = payload
                    .get("id")
                    .or_else(|| payload.get("value").and_then(|v| v.get("id")))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(Self::Message(AssistantMessage { id, content }))
            }
            "question" => Ok(Self::Question(op_body(payload))),
            "suggestion" => Ok(Self::Suggestion(op_body(payload))),
            _ if PatchOp::parse(op).is_some() => Ok(Self::Patch(whole(payload, op)?)),
            other => Err(ProtocolError::UnknownKind(other.to_string())),
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::TextDelta(_) => "text-delta",
            Self::Patch(_) => "patch",
            Self::Patches { .. } => "patches",
            Self::ToolProgress(_) => "tool-progress",
            Self::PlanCreated(_) => "plan-created",
            Self::Orchestration(_) => "orchestration",
            Self::Message(_) => "message",
            Self::Question(_) => "question",
            Self::Suggestion(_) => "suggestion",
            Self::PersistedAttachments(_) => "persisted-attachments",
            Self::DocumentIndex(_) => "document-index-ui",
            Self::Citations(_) => "citations",
            Self::Error(_) => "error",
            Self::Done => "done",
        }
    }
}
