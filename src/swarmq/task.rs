//! Task, result, and retry-delay primitives.
//!
//! A [`Task`] is the unit of distributable work: identity, free-form payload,
//! a priority tier that maps to a dedicated broker queue, and a retry budget.
//! [`TaskResult`] is the mirror message a worker publishes once the handler
//! finishes. The retry backoff math lives here as a pure function so the
//! delay schedule is testable without a broker.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority tiers with their numeric weights.
///
/// The weight doubles as the AMQP per-message priority on the tier queues
/// (which are declared with `x-max-priority = 10`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// Numeric weight: critical 10, high 7, normal 5, low 2.
    pub fn weight(&self) -> u8 {
        match self {
            TaskPriority::Critical => 10,
            TaskPriority::High => 7,
            TaskPriority::Normal => 5,
            TaskPriority::Low => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Critical => "critical",
            TaskPriority::High => "high",
            TaskPriority::Normal => "normal",
            TaskPriority::Low => "low",
        }
    }

    /// All tiers, highest first — the order workers drain them in.
    pub fn descending() -> [TaskPriority; 4] {
        [
            TaskPriority::Critical,
            TaskPriority::High,
            TaskPriority::Normal,
            TaskPriority::Low,
        ]
    }
}

/// Engine-observable task state. Not persisted in the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Dispatched,
    Processing,
    Completed,
    Failed,
    Dead,
}

/// A unit of distributable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Globally unique id, assigned at construction.
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub priority: TaskPriority,
    /// Opaque handler input.
    #[serde(default)]
    pub context: serde_json::Value,
    /// Starting retry budget. `None` until assignment, when the runtime's
    /// `max_retries` default is stamped in. This field never changes across
    /// redeliveries; the live counter travels on the envelope and in delivery
    /// headers, and the retry delay exponent is derived from the gap between
    /// the two.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries_remaining: Option<u32>,
    /// Unix ms at construction.
    pub created_at: i64,
    /// Agent id of the assigning leader; empty until assigned.
    #[serde(default)]
    pub assigned_by: String,
    /// Optional handler deadline; the engine clamps it to the configured
    /// ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Budget applied when neither the task nor the assigning runtime set one.
pub const DEFAULT_RETRIES: u32 = 3;

impl Task {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            priority: TaskPriority::Normal,
            context: serde_json::Value::Null,
            retries_remaining: None,
            created_at: Utc::now().timestamp_millis(),
            assigned_by: String::new(),
            deadline_ms: None,
            correlation_id: None,
        }
    }

    /// The starting budget this task was (or will be) dispatched with.
    pub fn retry_budget(&self) -> u32 {
        self.retries_remaining.unwrap_or(DEFAULT_RETRIES)
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries_remaining = Some(retries);
        self
    }

    pub fn with_deadline_ms(mut self, ms: u64) -> Self {
        self.deadline_ms = Some(ms);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Outcome of a single handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Completed,
    Failed,
}

/// The message a worker publishes to the results queue after handling a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub producer_agent_id: String,
    pub status: ResultStatus,
    /// Handler output on success; error detail on failure.
    #[serde(default)]
    pub payload: serde_json::Value,
    pub duration_ms: u64,
    /// Unix ms at production.
    pub produced_at: i64,
}

/// Delay before redelivering a transiently failed task.
///
/// `starting_budget` is the budget the task was dispatched with (its embedded
/// value, not whatever the local configuration happens to say now) and
/// `retries_remaining` is the counter observed on the *failing* delivery (the
/// retry copy travels with `retries_remaining - 1`). The first retry of a
/// fresh task therefore waits exactly `base_ms` regardless of the budget's
/// size, and each subsequent retry doubles, capped at `max_ms`:
///
/// ```rust
/// use swarmq::task::retry_delay_ms;
///
/// assert_eq!(retry_delay_ms(1_000, 60_000, 3, 3), 1_000);  // first failure
/// assert_eq!(retry_delay_ms(1_000, 60_000, 3, 2), 2_000);  // second
/// assert_eq!(retry_delay_ms(1_000, 60_000, 3, 1), 4_000);  // third
/// assert_eq!(retry_delay_ms(1_000, 60_000, 5, 5), 1_000);  // bigger budget, same start
/// assert_eq!(retry_delay_ms(1_000, 5_000, 10, 1), 5_000);  // capped
/// ```
pub fn retry_delay_ms(
    base_ms: u64,
    max_ms: u64,
    starting_budget: u32,
    retries_remaining: u32,
) -> u64 {
    let attempt = starting_budget.saturating_sub(retries_remaining).min(32);
    let delay = base_ms.saturating_mul(1u64 << attempt);
    delay.min(max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_weights_and_ordering() {
        assert_eq!(TaskPriority::Critical.weight(), 10);
        assert_eq!(TaskPriority::High.weight(), 7);
        assert_eq!(TaskPriority::Normal.weight(), 5);
        assert_eq!(TaskPriority::Low.weight(), 2);
        assert!(TaskPriority::Critical > TaskPriority::Low);
    }

    #[test]
    fn task_ids_are_unique() {
        let a = Task::new("t", "d");
        let b = Task::new("t", "d");
        assert_ne!(a.task_id, b.task_id);
    }

    #[test]
    fn retry_delay_never_exceeds_cap() {
        for remaining in 0..10u32 {
            assert!(retry_delay_ms(1_000, 8_000, 10, remaining) <= 8_000);
        }
    }

    #[test]
    fn retry_budget_is_unset_until_chosen() {
        let task = Task::new("t", "d");
        assert_eq!(task.retries_remaining, None);
        assert_eq!(task.retry_budget(), DEFAULT_RETRIES);

        let task = Task::new("t", "d").with_retries(5);
        assert_eq!(task.retries_remaining, Some(5));
        assert_eq!(task.retry_budget(), 5);
    }
}
