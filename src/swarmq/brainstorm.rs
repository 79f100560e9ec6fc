//! Brainstorm session state.
//!
//! A brainstorm is a deadline-bounded, fanout-announced call for suggestions.
//! The initiator collects replies into an append-only ordered sequence and
//! closes the session when the deadline passes; replies arriving after the
//! deadline (or after an explicit close) are discarded. Sessions are
//! memory-resident only.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::swarmq::envelope::BrainstormStartPayload;

/// One collected suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrainstormResponse {
    pub agent_id: String,
    pub suggestion: String,
    /// Unix ms when the initiator received the reply.
    pub received_at: i64,
}

/// An initiator-side brainstorm session.
#[derive(Debug, Clone)]
pub struct BrainstormSession {
    pub session_id: String,
    pub topic: String,
    pub question: String,
    pub initiator: String,
    /// Unix ms when the session opened.
    pub opened_at: i64,
    /// Unix ms after which replies are discarded.
    pub deadline: i64,
    pub closed: bool,
    responses: Vec<BrainstormResponse>,
}

impl BrainstormSession {
    pub fn new(
        initiator: impl Into<String>,
        topic: impl Into<String>,
        question: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            session_id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            question: question.into(),
            initiator: initiator.into(),
            opened_at: now,
            deadline: now + duration_ms as i64,
            closed: false,
            responses: Vec::new(),
        }
    }

    /// The fanout announcement for this session.
    pub fn announcement(&self) -> BrainstormStartPayload {
        BrainstormStartPayload {
            session_id: self.session_id.clone(),
            topic: self.topic.clone(),
            question: self.question.clone(),
            deadline_ms: self.deadline,
        }
    }

    /// Append a reply, unless the session is closed or the reply is late.
    /// Returns whether the reply was kept.
    pub fn push_response(&mut self, agent_id: impl Into<String>, suggestion: impl Into<String>) -> bool {
        let now = Utc::now().timestamp_millis();
        if self.closed || now > self.deadline {
            return false;
        }
        self.responses.push(BrainstormResponse {
            agent_id: agent_id.into(),
            suggestion: suggestion.into(),
            received_at: now,
        });
        true
    }

    /// Close the session and return the collected replies in arrival order.
    /// Idempotent.
    pub fn close(&mut self) -> Vec<BrainstormResponse> {
        self.closed = true;
        self.responses.clone()
    }

    pub fn responses(&self) -> &[BrainstormResponse] {
        &self.responses
    }

    /// Milliseconds until the deadline, zero if already past.
    pub fn remaining_ms(&self) -> u64 {
        let now = Utc::now().timestamp_millis();
        if self.deadline > now {
            (self.deadline - now) as u64
        } else {
            0
        }
    }
}

/// Participant-side seam: produce suggestions for an incoming announcement.
///
/// Returning an empty vector is a valid "nothing to contribute" answer.
#[async_trait]
pub trait BrainstormResponder: Send + Sync {
    async fn respond(&self, topic: &str, question: &str) -> Vec<String>;
}
