//! Canonical JSON message envelope.
//!
//! Every inter-agent message is a single UTF-8 JSON object with a `type`
//! discriminator and a type-specific `payload` body. The Rust side models the
//! discriminator as an explicit enum — an unknown `type` fails to parse and
//! the delivery is rejected without requeue, never silently coerced.
//!
//! # Wire Format
//!
//! ```text
//! {
//!   "id":   "5b3f…",             // UUID, correlates across queues
//!   "type": "task",              // task | result | brainstorm_start | brainstorm_response
//!                                // | voting_start | voting_vote | voting_result | status
//!   "from": "agent-7",           // producing agent id
//!   "to":   "agent-3",           // optional target agent id
//!   "ts":   1722470400123,       // unix ms
//!   "retries_remaining": 3,      // task only; decremented per transient failure
//!   "payload": { … }             // type-specific body
//! }
//! ```
//!
//! Unknown fields are ignored on the way in, so envelopes from newer peers
//! parse cleanly.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::swarmq::error::SwarmError;
use crate::swarmq::tally::VotingAlgorithm;
use crate::swarmq::task::{Task, TaskResult};

/// Top-level wrapper around any inter-agent message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message id; correlates across queues.
    pub id: String,
    /// Producing agent id.
    pub from: String,
    /// Optional target agent id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Unix milliseconds at creation.
    pub ts: i64,
    /// Remaining retry budget; present on `task` envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries_remaining: Option<u32>,
    /// Typed body, serialized as the `type` + `payload` pair.
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Envelope {
    pub fn new(from: impl Into<String>, body: MessageBody) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from: from.into(),
            to: None,
            ts: Utc::now().timestamp_millis(),
            retries_remaining: None,
            body,
        }
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_retries_remaining(mut self, retries: u32) -> Self {
        self.retries_remaining = Some(retries);
        self
    }

    /// Serialize to the UTF-8 JSON wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SwarmError> {
        serde_json::to_vec(self).map_err(|e| SwarmError::Publish(e.to_string()))
    }

    /// Parse a delivery payload. Failures — malformed JSON, unknown `type` —
    /// map to [`SwarmError::DeliveryValidation`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SwarmError> {
        serde_json::from_slice(bytes).map_err(|e| SwarmError::DeliveryValidation(e.to_string()))
    }

    /// Short name of the body variant, for logs and routing decisions.
    pub fn type_name(&self) -> &'static str {
        self.body.type_name()
    }
}

/// Typed message bodies, discriminated by the envelope's `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MessageBody {
    Task(Task),
    Result(TaskResult),
    BrainstormStart(BrainstormStartPayload),
    BrainstormResponse(BrainstormResponsePayload),
    VotingStart(VotingStartPayload),
    VotingVote(VotePayload),
    VotingResult(VotingResultPayload),
    Status(StatusPayload),
}

impl MessageBody {
    pub fn type_name(&self) -> &'static str {
        match self {
            MessageBody::Task(_) => "task",
            MessageBody::Result(_) => "result",
            MessageBody::BrainstormStart(_) => "brainstorm_start",
            MessageBody::BrainstormResponse(_) => "brainstorm_response",
            MessageBody::VotingStart(_) => "voting_start",
            MessageBody::VotingVote(_) => "voting_vote",
            MessageBody::VotingResult(_) => "voting_result",
            MessageBody::Status(_) => "status",
        }
    }
}

/// Announcement opening a brainstorm session, broadcast on the fanout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrainstormStartPayload {
    pub session_id: String,
    pub topic: String,
    pub question: String,
    /// Unix ms after which the initiator stops collecting.
    pub deadline_ms: i64,
}

/// One suggestion routed back to the brainstorm initiator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrainstormResponsePayload {
    pub session_id: String,
    pub agent_id: String,
    pub suggestion: String,
}

/// Ballot announcement opening a voting session, broadcast on the fanout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotingStartPayload {
    pub session_id: String,
    pub topic: String,
    pub question: String,
    pub options: Vec<String>,
    pub algorithm: VotingAlgorithm,
    /// Unix ms after which ballots are rejected.
    pub deadline_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_agent: Option<u32>,
}

/// Algorithm-dependent ballot content.
///
/// The three shapes are distinguished structurally: a `choice` key, an
/// `allocation` map, or a `rankings` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VoteContent {
    /// Single choice with a confidence weight (majority / confidence /
    /// consensus algorithms).
    Choice {
        choice: String,
        #[serde(default = "default_confidence")]
        confidence: f64,
    },
    /// Token allocation across options (quadratic voting).
    Allocation { allocation: BTreeMap<String, u32> },
    /// Full preference ordering (ranked choice).
    Rankings { rankings: Vec<String> },
}

fn default_confidence() -> f64 {
    1.0
}

impl VoteContent {
    /// Ballot confidence; shapes without an explicit confidence count as 1.0.
    pub fn confidence(&self) -> f64 {
        match self {
            VoteContent::Choice { confidence, .. } => *confidence,
            _ => 1.0,
        }
    }
}

/// A cast ballot in flight to the session initiator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotePayload {
    pub session_id: String,
    #[serde(default)]
    pub agent_level: u8,
    #[serde(flatten)]
    pub content: VoteContent,
}

/// Final results broadcast once a session closes. The `results` body is the
/// serialized `VoteResults` so late subscribers need no session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotingResultPayload {
    pub session_id: String,
    pub status: String,
    pub results: serde_json::Value,
}

/// Status event body published on the topic exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    /// Dotted event name appended to the status routing key prefix, e.g.
    /// `heartbeat.agent-7` or `task.completed`.
    pub event: String,
    #[serde(default)]
    pub body: serde_json::Value,
}
