//! Monotonic runtime counters.
//!
//! Counters are plain relaxed atomics — they are advisory observability data,
//! never synchronization. A [`StatsSnapshot`] is embedded in every heartbeat
//! and returned by the control-plane `stats()` call.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Shared counter registry, one per agent handle.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    pub tasks_assigned: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_retried: AtomicU64,
    pub tasks_dead_lettered: AtomicU64,
    pub messages_published: AtomicU64,
    pub messages_consumed: AtomicU64,
    pub ballots_cast: AtomicU64,
    pub ballots_rejected: AtomicU64,
    pub brainstorm_responses: AtomicU64,
    pub status_events: AtomicU64,
    pub reconnects: AtomicU64,
    pub heartbeats: AtomicU64,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tasks_assigned: self.tasks_assigned.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_retried: self.tasks_retried.load(Ordering::Relaxed),
            tasks_dead_lettered: self.tasks_dead_lettered.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            messages_consumed: self.messages_consumed.load(Ordering::Relaxed),
            ballots_cast: self.ballots_cast.load(Ordering::Relaxed),
            ballots_rejected: self.ballots_rejected.load(Ordering::Relaxed),
            brainstorm_responses: self.brainstorm_responses.load(Ordering::Relaxed),
            status_events: self.status_events.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub tasks_assigned: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub tasks_dead_lettered: u64,
    pub messages_published: u64,
    pub messages_consumed: u64,
    pub ballots_cast: u64,
    pub ballots_rejected: u64,
    pub brainstorm_responses: u64,
    pub status_events: u64,
    pub reconnects: u64,
    pub heartbeats: u64,
}
