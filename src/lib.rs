// src/lib.rs

// Import the top-level `swarmq` module.
pub mod swarmq;

// Re-export the module tree and key items at the crate root so external code
// can use swarmq::broker::BrokerClient / swarmq::Orchestrator directly
// without navigating the internal hierarchy.
pub use crate::swarmq::{
    agent, audit, brainstorm, broker, config, envelope, error, event, orchestration, stats,
    tally, task, voting,
};

pub use crate::swarmq::agent::{AgentProfile, Capability, Role};
pub use crate::swarmq::audit::{AuditLog, AuditRecord};
pub use crate::swarmq::brainstorm::{BrainstormResponder, BrainstormResponse};
pub use crate::swarmq::broker::{BrokerClient, ConnectionState, PublishOptions};
pub use crate::swarmq::config::{QuorumConfig, SwarmConfig, TopologyNames};
pub use crate::swarmq::envelope::{Envelope, MessageBody, VoteContent};
pub use crate::swarmq::error::{HandlerError, SwarmError, VoteError};
pub use crate::swarmq::event::{SwarmEvent, SwarmEventHandler};
pub use crate::swarmq::orchestration::{
    BallotProvider, Orchestrator, ResultHandler, StatusHandler, TaskContext, TaskHandler,
};
pub use crate::swarmq::stats::StatsSnapshot;
pub use crate::swarmq::tally::{Ballot, VoteResults, VotingAlgorithm};
pub use crate::swarmq::task::{Task, TaskPriority, TaskResult, TaskStatus};
pub use crate::swarmq::voting::{SessionStatus, VoteSessionConfig, VotingSystem};
