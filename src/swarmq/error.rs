//! Error taxonomy for swarmq.
//!
//! Every fallible operation in the crate returns a [`SwarmError`] tagged with
//! one of a small set of kinds so embedders can match on *what went wrong*
//! without parsing message strings:
//!
//! | Kind | Produced by | Retried? |
//! |------|-------------|----------|
//! | `Config` | invalid configuration, role violations | never |
//! | `Connect` | broker unreachable, publish while disconnected | by the supervisor, until its attempt budget |
//! | `Topology` | queue/exchange asserted with incompatible parameters | never |
//! | `Publish` | publisher-confirm timeout or negative ack | caller decides |
//! | `DeliveryValidation` | unparseable message or unknown `type` | rejected without requeue |
//! | `HandlerTransient` / `HandlerPermanent` | user task handlers | drives retry vs dead-letter |
//! | `Vote(..)` | voting session operations | never |
//! | `Integrity` | audit verification failure | never |
//! | `Cancelled` | operation aborted by shutdown | never |
//!
//! User task handlers classify their own failures via [`HandlerError`]; the
//! orchestration engine turns a `Transient` into a delayed retry and a
//! `Permanent` into a dead-letter rejection.

use std::error::Error;
use std::fmt;

/// Subkinds of voting failures, returned synchronously by the voting API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteError {
    /// No session with the given id exists.
    NotFound(String),
    /// The session exists but has already been closed.
    SessionClosed(String),
    /// The ballot arrived after the session deadline.
    DeadlinePassed(String),
    /// The ballot does not satisfy the session's algorithm constraints.
    InvalidBallot(String),
    /// The session closed without meeting its quorum.
    QuorumFailed(String),
}

impl fmt::Display for VoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteError::NotFound(id) => write!(f, "voting session not found: {}", id),
            VoteError::SessionClosed(id) => write!(f, "voting session already closed: {}", id),
            VoteError::DeadlinePassed(id) => write!(f, "ballot past deadline for session: {}", id),
            VoteError::InvalidBallot(msg) => write!(f, "invalid ballot: {}", msg),
            VoteError::QuorumFailed(id) => write!(f, "quorum failed for session: {}", id),
        }
    }
}

impl Error for VoteError {}

/// Failure classification returned by user task handlers.
///
/// The engine maps `Transient` to the exponential-backoff retry path and
/// `Permanent` straight to the dead-letter queue. A handler timeout is
/// treated as `Transient` by the engine itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Network, timeout, or temporary-resource failure. Worth retrying.
    Transient(String),
    /// Validation, authorization, or business failure. Retrying cannot help.
    Permanent(String),
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        HandlerError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        HandlerError::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            HandlerError::Transient(m) | HandlerError::Permanent(m) => m,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Transient(msg) => write!(f, "transient handler error: {}", msg),
            HandlerError::Permanent(msg) => write!(f, "permanent handler error: {}", msg),
        }
    }
}

impl Error for HandlerError {}

/// The crate-wide tagged error type.
#[derive(Debug, Clone, PartialEq)]
pub enum SwarmError {
    /// Invalid configuration or option value, including role violations.
    Config(String),
    /// Broker unreachable, authentication rejected, or not currently connected.
    Connect(String),
    /// A queue/exchange assertion conflicted with existing broker state.
    Topology(String),
    /// Publisher confirm timed out or the broker nacked the publish.
    Publish(String),
    /// A delivery could not be parsed or carried an unknown message type.
    DeliveryValidation(String),
    /// A user handler reported a transient failure.
    HandlerTransient(String),
    /// A user handler reported a permanent failure.
    HandlerPermanent(String),
    /// A voting operation failed; see [`VoteError`] for the subkind.
    Vote(VoteError),
    /// Audit verification found a record whose signature does not match.
    Integrity(String),
    /// The operation was aborted by a cancellation signal.
    Cancelled(String),
}

impl SwarmError {
    /// Stable machine-readable kind tag, suitable for status events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SwarmError::Config(_) => "ConfigError",
            SwarmError::Connect(_) => "ConnectError",
            SwarmError::Topology(_) => "TopologyError",
            SwarmError::Publish(_) => "PublishError",
            SwarmError::DeliveryValidation(_) => "DeliveryValidationError",
            SwarmError::HandlerTransient(_) => "HandlerTransientError",
            SwarmError::HandlerPermanent(_) => "HandlerPermanentError",
            SwarmError::Vote(_) => "VoteError",
            SwarmError::Integrity(_) => "IntegrityError",
            SwarmError::Cancelled(_) => "CancelledError",
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        SwarmError::Config(msg.into())
    }
}

impl fmt::Display for SwarmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwarmError::Config(msg) => write!(f, "configuration error: {}", msg),
            SwarmError::Connect(msg) => write!(f, "connection error: {}", msg),
            SwarmError::Topology(msg) => write!(f, "topology error: {}", msg),
            SwarmError::Publish(msg) => write!(f, "publish error: {}", msg),
            SwarmError::DeliveryValidation(msg) => write!(f, "delivery validation error: {}", msg),
            SwarmError::HandlerTransient(msg) => write!(f, "transient handler error: {}", msg),
            SwarmError::HandlerPermanent(msg) => write!(f, "permanent handler error: {}", msg),
            SwarmError::Vote(err) => write!(f, "{}", err),
            SwarmError::Integrity(msg) => write!(f, "audit integrity error: {}", msg),
            SwarmError::Cancelled(msg) => write!(f, "cancelled: {}", msg),
        }
    }
}

impl Error for SwarmError {}

impl From<VoteError> for SwarmError {
    fn from(err: VoteError) -> Self {
        SwarmError::Vote(err)
    }
}

impl From<HandlerError> for SwarmError {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Transient(msg) => SwarmError::HandlerTransient(msg),
            HandlerError::Permanent(msg) => SwarmError::HandlerPermanent(msg),
        }
    }
}

impl From<serde_json::Error> for SwarmError {
    fn from(err: serde_json::Error) -> Self {
        SwarmError::DeliveryValidation(err.to_string())
    }
}

/// Classify a lapin failure into the taxonomy.
///
/// `PRECONDITION_FAILED` (a queue or exchange re-declared with incompatible
/// arguments) becomes [`SwarmError::Topology`]; everything else is treated as
/// a connection-layer failure and left to the supervisor's retry policy.
impl From<lapin::Error> for SwarmError {
    fn from(err: lapin::Error) -> Self {
        // 406 is the AMQP reply code for PRECONDITION_FAILED.
        if let lapin::Error::ProtocolError(amqp) = &err {
            if amqp.get_id() == 406 {
                return SwarmError::Topology(err.to_string());
            }
        }
        SwarmError::Connect(err.to_string())
    }
}
