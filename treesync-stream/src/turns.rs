//! Conversation turns and their tree snapshots.
//!
//! ```text
//!  pending ──► streaming ──► complete (snapshot taken)
//!     │            │
//!     │            └──────► failed
//!     └── abort: removed from history
//! ```
//!
//! Deleting or editing a turn truncates history at that turn and rolls the
//! tree back to the snapshot of the last surviving completed turn.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use treesync_core::tree::now_millis;
use treesync_core::Tree;
use uuid::Uuid;

use crate::protocol::AssistantMessage;
use crate::transport::ChatMessage;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TurnError {
    #[error("turn {0} not found")]
    NotFound(String),
    #[error("turn {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: String,
        from: TurnStatus,
        to: TurnStatus,
    },
    #[error("turn {turn_id} has no question {question_id}")]
    UnknownQuestion { turn_id: String, question_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Pending,
    Streaming,
    Complete,
    Failed,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TurnStatus::Complete | TurnStatus::Failed)
    }

    fn can_move_to(self, next: TurnStatus) -> bool {
        use TurnStatus::*;
        matches!(
            (self, next),
            (Pending, Streaming) | (Pending, Complete) | (Pending, Failed) | (Streaming, Complete) | (Streaming, Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub id: String,
    pub user_message: String,
    #[serde(default)]
    pub assistant_messages: Vec<AssistantMessage>,
    /// Tree as of this turn's completion.
    #[serde(default)]
    pub tree_snapshot: Option<Tree>,
    pub status: TurnStatus,
    #[serde(default)]
    pub questions: Vec<Value>,
    #[serde(default)]
    pub question_answers: BTreeMap<String, Value>,
    #[serde(default)]
    pub suggestions: Vec<Value>,
    #[serde(default)]
    pub attachments: Vec<Value>,
    #[serde(default)]
    pub citations: Vec<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: u64,
}

impl Turn {
    pub fn new(user_message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_message: user_message.into(),
            assistant_messages: Vec::new(),
            tree_snapshot: None,
            status: TurnStatus::Pending,
            questions: Vec::new(),
            question_answers: BTreeMap::new(),
            suggestions: Vec::new(),
            attachments: Vec::new(),
            citations: Vec::new(),
            error: None,
            created_at: now_millis(),
        }
    }

    fn question_id(question: &Value) -> Option<&str> {
        question.get("id").and_then(Value::as_str)
    }

    /// Questions the user has not answered yet.
    pub fn open_questions(&self) -> impl Iterator<Item = &Value> + '_ {
        self.questions.iter().filter(|q| {
            Self::question_id(q).map_or(true, |id| !self.question_answers.contains_key(id))
        })
    }

    /// Concatenated assistant output.
    pub fn assistant_text(&self) -> String {
        self.assistant_messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Ordered turn log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnHistory {
    turns: Vec<Turn>,
}

impl TurnHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_turns(turns: Vec<Turn>) -> Self {
        Self { turns }
    }

    /// Append a pending turn and return its id.
    pub fn begin(&mut self, user_message: impl Into<String>) -> String {
        let turn = Turn::new(user_message);
        let id = turn.id.clone();
        self.turns.push(turn);
        id
    }

    pub fn get(&self, id: &str) -> Option<&Turn> {
        self.turns.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Turn> {
        self.turns.iter_mut().find(|t| t.id == id)
    }

    fn require(&mut self, id: &str) -> Result<&mut Turn, TurnError> {
        self.get_mut(id).ok_or_else(|| TurnError::NotFound(id.to_string()))
    }

    fn transition(&mut self, id: &str, next: TurnStatus) -> Result<&mut Turn, TurnError> {
        let turn = self.require(id)?;
        if turn.status == next {
            return Ok(turn);
        }
        if !turn.status.can_move_to(next) {
            return Err(TurnError::InvalidTransition {
                id: id.to_string(),
                from: turn.status,
                to: next,
            });
        }
        turn.status = next;
        Ok(turn)
    }

    /// First byte of the response arrived.
    pub fn mark_streaming(&mut self, id: &str) -> Result<(), TurnError> {
        self.transition(id, TurnStatus::Streaming).map(|_| ())
    }

    pub fn complete(&mut self, id: &str, snapshot: Tree) -> Result<(), TurnError> {
        let turn = self.transition(id, TurnStatus::Complete)?;
        turn.tree_snapshot = Some(snapshot);
        Ok(())
    }

    pub fn fail(&mut self, id: &str, error: impl Into<String>) -> Result<(), TurnError> {
        let turn = self.transition(id, TurnStatus::Failed)?;
        turn.error = Some(error.into());
        Ok(())
    }

    /// Remove a turn outright (abort of a send that never completed).
    pub fn remove(&mut self, id: &str) -> Option<Turn> {
        let index = self.turns.iter().position(|t| t.id == id)?;
        Some(self.turns.remove(index))
    }

    /// Drop `id` and every later turn; returns the tree to restore.
    pub fn truncate_from(&mut self, id: &str) -> Result<Tree, TurnError> {
        let index = self
            .turns
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| TurnError::NotFound(id.to_string()))?;
        let dropped = self.turns.len() - index;
        self.turns.truncate(index);
        log::debug!("Truncated {dropped} turns at {id}");
        Ok(self.last_snapshot())
    }

    /// Snapshot of the latest completed turn, or an empty tree.
    pub fn last_snapshot(&self) -> Tree {
        self.turns
            .iter()
            .rev()
            .find_map(|t| t.tree_snapshot.clone())
            .unwrap_or_default()
    }

    /// Turns left behind by an interrupted send.
    pub fn unfinished(&self) -> Vec<String> {
        self.turns
            .iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn record_message(&mut self, id: &str, message: AssistantMessage) -> Result<(), TurnError> {
        self.require(id)?.assistant_messages.push(message);
        Ok(())
    }

    pub fn record_question(&mut self, id: &str, question: Value) -> Result<(), TurnError> {
        self.require(id)?.questions.push(question);
        Ok(())
    }

    pub fn record_suggestion(&mut self, id: &str, suggestion: Value) -> Result<(), TurnError> {
        self.require(id)?.suggestions.push(suggestion);
        Ok(())
    }

    pub fn record_attachments(&mut self, id: &str, attachments: Vec<Value>) -> Result<(), TurnError> {
        self.require(id)?.attachments.extend(attachments);
        Ok(())
    }

    pub fn record_citations(&mut self, id: &str, citations: Vec<Value>) -> Result<(), TurnError> {
        self.require(id)?.citations.extend(citations);
        Ok(())
    }

    pub fn answer_question(
        &mut self,
        turn_id: &str,
        question_id: &str,
        answer: Value,
    ) -> Result<(), TurnError> {
        let turn = self.require(turn_id)?;
        let known = turn
            .questions
            .iter()
            .any(|q| Turn::question_id(q) == Some(question_id));
        if !known {
            return Err(TurnError::UnknownQuestion {
                turn_id: turn_id.to_string(),
                question_id: question_id.to_string(),
            });
        }
        turn.question_answers.insert(question_id.to_string(), answer);
        Ok(())
    }

    /// Prior conversation for the request body; only completed turns count.
    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        for turn in self.turns.iter().filter(|t| t.status == TurnStatus::Complete) {
            messages.push(ChatMessage::user(turn.user_message.clone()));
            let reply = turn.assistant_text();
            if !reply.is_empty() {
                messages.push(ChatMessage::assistant(reply));
            }
        }
        messages
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Turn> + '_ {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
