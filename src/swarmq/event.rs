//! In-process observability callbacks.
//!
//! Implement [`SwarmEventHandler`] to receive real-time notifications about
//! connection lifecycle, task routing decisions, brainstorm and voting
//! sessions, and audit appends. The handler is registered through
//! `SwarmConfig::with_event_handler` and shared across the agent's internal
//! tasks as `Arc<dyn SwarmEventHandler>`.
//!
//! This layer is purely local — it is distinct from the wire-level status
//! protocol, which other agents can subscribe to over the broker.
//!
//! # Example
//!
//! ```rust
//! use swarmq::event::{SwarmEvent, SwarmEventHandler};
//! use async_trait::async_trait;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl SwarmEventHandler for Printer {
//!     async fn on_event(&self, event: &SwarmEvent) {
//!         match event {
//!             SwarmEvent::TaskRetried { task_id, delay_ms, .. } => {
//!                 println!("retrying {} in {}ms", task_id, delay_ms);
//!             }
//!             SwarmEvent::TaskDeadLettered { task_id, reason } => {
//!                 println!("gave up on {}: {}", task_id, reason);
//!             }
//!             _ => {}
//!         }
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::swarmq::broker::ConnectionState;
use crate::swarmq::tally::VotingAlgorithm;
use crate::swarmq::voting::SessionStatus;

/// Events emitted by the runtime during its lifecycle.
#[derive(Debug, Clone)]
pub enum SwarmEvent {
    /// The broker connection supervisor changed state.
    ConnectionStateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },
    /// A (re)connection attempt is about to start after a backoff wait.
    ReconnectAttempt { attempt: u32, delay_ms: u64 },
    TaskAssigned {
        task_id: String,
        priority: &'static str,
    },
    TaskStarted { task_id: String },
    TaskCompleted { task_id: String, duration_ms: u64 },
    /// A transient failure was routed to the delayed-retry queue.
    TaskRetried {
        task_id: String,
        retries_remaining: u32,
        delay_ms: u64,
    },
    /// The task exhausted its budget or failed permanently.
    TaskDeadLettered { task_id: String, reason: String },
    BrainstormOpened { session_id: String },
    BrainstormClosed {
        session_id: String,
        responses: usize,
    },
    VoteOpened {
        session_id: String,
        algorithm: VotingAlgorithm,
    },
    BallotAccepted {
        session_id: String,
        agent_id: String,
    },
    BallotRejected { session_id: String, reason: String },
    VoteClosed {
        session_id: String,
        status: SessionStatus,
    },
    AuditAppended {
        session_id: String,
        record_id: String,
    },
    HeartbeatPublished { agent_id: String },
    ShutdownStarted,
    ShutdownCompleted,
}

/// Callback seam for [`SwarmEvent`]s. All methods default to no-ops, so
/// implementors only override what they care about.
#[async_trait]
pub trait SwarmEventHandler: Send + Sync {
    async fn on_event(&self, _event: &SwarmEvent) {}
}
