//! Core types shared by the bus, the sessions and the roster.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a colleague record in the persistence store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColleagueId(pub i64);

impl fmt::Debug for ColleagueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ColleagueId({})", self.0)
    }
}

impl fmt::Display for ColleagueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A colleague's presence flag flipped.
///
/// Published by the mutation path after the store write has been applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceChanged {
    pub colleague_id: ColleagueId,
    pub is_at_work: bool,
}

impl PresenceChanged {
    pub fn new(colleague_id: ColleagueId, is_at_work: bool) -> Self {
        Self {
            colleague_id,
            is_at_work,
        }
    }
}

/// One row of the presence snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColleaguePresence {
    pub id: ColleagueId,
    pub name: String,
    pub is_at_work: bool,
}

impl ColleaguePresence {
    pub fn new(id: i64, name: impl Into<String>, is_at_work: bool) -> Self {
        Self {
            id: ColleagueId(id),
            name: name.into(),
            is_at_work,
        }
    }
}

/// Logical messages written to a streaming client, one JSON object each.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamMessage {
    /// Full presence snapshot, sent once on open and again after a resync.
    Initial { colleagues: Vec<ColleaguePresence> },

    /// A single presence delta.
    #[serde(rename_all = "camelCase")]
    StatusChange {
        colleague_id: ColleagueId,
        is_at_work: bool,
    },

    /// Keep-alive, unrelated to presence data.
    Heartbeat,

    /// The client's inbox overflowed and `missed` deltas were dropped.
    MissedUpdates { missed: u64 },

    /// Terminal error notice written just before the server closes.
    Error { code: String, message: String },
}

impl StreamMessage {
    /// Message type tag as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::Initial { .. } => "initial",
            StreamMessage::StatusChange { .. } => "statusChange",
            StreamMessage::Heartbeat => "heartbeat",
            StreamMessage::MissedUpdates { .. } => "missedUpdates",
            StreamMessage::Error { .. } => "error",
        }
    }

    /// Encode as a single JSON line (no trailing newline).
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Encode as a server-sent-events frame: `data: <json>\n\n`.
    pub fn to_sse_frame(&self) -> Result<String> {
        Ok(format!("data: {}\n\n", self.to_json()?))
    }
}

impl From<PresenceChanged> for StreamMessage {
    fn from(event: PresenceChanged) -> Self {
        StreamMessage::StatusChange {
            colleague_id: event.colleague_id,
            is_at_work: event.is_at_work,
        }
    }
}
