//! Agent identity, roles, and capability sets.
//!
//! A role is nothing more than the set of control-plane operations the engine
//! will perform for an agent. Calling an operation outside the role's set is
//! a programming error: it fails fast with a `ConfigError` and produces no
//! broker traffic.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::swarmq::error::SwarmError;

/// The four agent roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Worker,
    Collaborator,
    Monitor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Worker => "worker",
            Role::Collaborator => "collaborator",
            Role::Monitor => "monitor",
        }
    }

    /// The operations this role may perform.
    pub fn capabilities(&self) -> &'static [Capability] {
        match self {
            Role::Leader => &[
                Capability::AssignTask,
                Capability::InitiateBrainstorm,
                Capability::InitiateVote,
                Capability::ConsumeResults,
                Capability::ConsumeStatus,
            ],
            Role::Worker => &[
                Capability::ConsumeTasks,
                Capability::PublishResult,
                Capability::ParticipateBrainstorm,
                Capability::ParticipateVote,
                Capability::PublishStatus,
            ],
            Role::Collaborator => &[
                Capability::ParticipateBrainstorm,
                Capability::ParticipateVote,
                Capability::PublishStatus,
            ],
            Role::Monitor => &[Capability::ConsumeStatus, Capability::QueryStats],
        }
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

/// Individual control-plane operations, gated per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    AssignTask,
    InitiateBrainstorm,
    InitiateVote,
    ConsumeResults,
    ConsumeStatus,
    ConsumeTasks,
    PublishResult,
    ParticipateBrainstorm,
    ParticipateVote,
    PublishStatus,
    QueryStats,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::AssignTask => "assign_task",
            Capability::InitiateBrainstorm => "initiate_brainstorm",
            Capability::InitiateVote => "initiate_vote",
            Capability::ConsumeResults => "consume_results",
            Capability::ConsumeStatus => "consume_status",
            Capability::ConsumeTasks => "consume_tasks",
            Capability::PublishResult => "publish_result",
            Capability::ParticipateBrainstorm => "participate_brainstorm",
            Capability::ParticipateVote => "participate_vote",
            Capability::PublishStatus => "publish_status",
            Capability::QueryStats => "query_stats",
        }
    }
}

/// Identity and attributes of one agent.
///
/// # Example
///
/// ```rust
/// use swarmq::agent::{AgentProfile, Role};
///
/// let profile = AgentProfile::new(Role::Worker, "image-worker-1")
///     .with_level(4)
///     .with_skill("image-processing");
///
/// assert_eq!(profile.role, Role::Worker);
/// assert!(profile.skills.contains("image-processing"));
/// ```
#[derive(Debug, Clone)]
pub struct AgentProfile {
    /// Opaque unique id, generated at construction.
    pub agent_id: String,
    /// Human-readable name for logging and status streams.
    pub name: String,
    pub role: Role,
    /// Expertise level in `[0, 5]`; level >= 4 counts as an expert ballot.
    pub level: Option<u8>,
    pub skills: HashSet<String>,
    /// Arbitrary metadata (e.g. region, team) carried in heartbeats.
    pub metadata: HashMap<String, String>,
}

impl AgentProfile {
    pub fn new(role: Role, name: impl Into<String>) -> Self {
        Self {
            agent_id: Uuid::new_v4().to_string(),
            name: name.into(),
            role,
            level: None,
            skills: HashSet::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_skill(mut self, skill: impl Into<String>) -> Self {
        self.skills.insert(skill.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Effective expertise level; unset defaults to 0.
    pub fn effective_level(&self) -> u8 {
        self.level.unwrap_or(0)
    }

    pub fn validate(&self) -> Result<(), SwarmError> {
        if self.name.is_empty() {
            return Err(SwarmError::config("agent name must not be empty"));
        }
        if let Some(level) = self.level {
            if level > 5 {
                return Err(SwarmError::config(format!(
                    "agent level must be within [0, 5], got {}",
                    level
                )));
            }
        }
        Ok(())
    }

    /// Fail fast when `capability` is outside this profile's role.
    pub fn require(&self, capability: Capability) -> Result<(), SwarmError> {
        if self.role.allows(capability) {
            Ok(())
        } else {
            Err(SwarmError::config(format!(
                "role {} does not permit {}",
                self.role.as_str(),
                capability.as_str()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_cannot_assign_tasks() {
        let profile = AgentProfile::new(Role::Worker, "w");
        let err = profile.require(Capability::AssignTask).unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
    }

    #[test]
    fn monitor_capabilities_are_read_only() {
        assert!(Role::Monitor.allows(Capability::ConsumeStatus));
        assert!(Role::Monitor.allows(Capability::QueryStats));
        assert!(!Role::Monitor.allows(Capability::PublishStatus));
        assert!(!Role::Monitor.allows(Capability::ConsumeTasks));
    }

    #[test]
    fn level_above_five_is_rejected() {
        let profile = AgentProfile::new(Role::Collaborator, "c").with_level(6);
        assert!(profile.validate().is_err());
    }
}
