//! Voting session management.
//!
//! [`VotingSystem`] owns every locally initiated session and drives the
//! `open → {closed_success, closed_quorum_failed}` state machine. Ballot
//! ingestion, closure, and result queries are synchronous and never suspend;
//! deadline timers live in the orchestration layer and simply call
//! [`VotingSystem::close`] when they fire.
//!
//! A replacement ballot from the same agent overwrites the earlier one —
//! last write wins, and the tie-break timestamp is that of the last write.
//! Closure is idempotent: closing an already-closed session returns the
//! stored results unchanged, so recomputation can never diverge from what
//! was first announced.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::swarmq::config::QuorumConfig;
use crate::swarmq::envelope::{VoteContent, VotingStartPayload};
use crate::swarmq::error::{SwarmError, VoteError};
use crate::swarmq::tally::{
    check_quorum, quorum_failed_results, tally, Ballot, TallyContext, VoteResults,
    VotingAlgorithm,
};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    ClosedSuccess,
    ClosedQuorumFailed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::ClosedSuccess => "closed_success",
            SessionStatus::ClosedQuorumFailed => "closed_quorum_failed",
        }
    }
}

/// Parameters for opening a voting session.
///
/// # Example
///
/// ```rust
/// use swarmq::voting::VoteSessionConfig;
/// use swarmq::tally::VotingAlgorithm;
///
/// let config = VoteSessionConfig::new(
///     "deploy-window",
///     "When should we deploy?",
///     vec!["friday".into(), "monday".into()],
///     VotingAlgorithm::ConfidenceWeighted,
/// )
/// .with_duration_ms(30_000);
/// ```
#[derive(Debug, Clone)]
pub struct VoteSessionConfig {
    pub topic: String,
    pub question: String,
    pub options: Vec<String>,
    pub algorithm: VotingAlgorithm,
    /// Falls back to the runtime-wide default when `None`.
    pub quorum: Option<QuorumConfig>,
    /// Winner-share floor, only meaningful for the consensus algorithm.
    pub consensus_threshold: f64,
    /// Token budget per ballot, only meaningful for the quadratic algorithm.
    pub tokens_per_agent: u32,
    /// How long the session accepts ballots.
    pub duration_ms: u64,
}

impl VoteSessionConfig {
    pub fn new(
        topic: impl Into<String>,
        question: impl Into<String>,
        options: Vec<String>,
        algorithm: VotingAlgorithm,
    ) -> Self {
        Self {
            topic: topic.into(),
            question: question.into(),
            options,
            algorithm,
            quorum: None,
            consensus_threshold: 0.66,
            tokens_per_agent: 9,
            duration_ms: 60_000,
        }
    }

    pub fn with_quorum(mut self, quorum: QuorumConfig) -> Self {
        self.quorum = Some(quorum);
        self
    }

    pub fn with_consensus_threshold(mut self, threshold: f64) -> Self {
        self.consensus_threshold = threshold;
        self
    }

    pub fn with_tokens_per_agent(mut self, tokens: u32) -> Self {
        self.tokens_per_agent = tokens;
        self
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = ms;
        self
    }

    fn validate(&self) -> Result<(), SwarmError> {
        if self.options.is_empty() {
            return Err(SwarmError::config("voting options must not be empty"));
        }
        let mut seen = std::collections::HashSet::new();
        for option in &self.options {
            if !seen.insert(option.as_str()) {
                return Err(SwarmError::config(format!(
                    "duplicate voting option: {}",
                    option
                )));
            }
        }
        if self.algorithm == VotingAlgorithm::Consensus
            && !(self.consensus_threshold > 0.5 && self.consensus_threshold <= 1.0)
        {
            return Err(SwarmError::config(format!(
                "consensus_threshold must be within (0.5, 1], got {}",
                self.consensus_threshold
            )));
        }
        if self.algorithm == VotingAlgorithm::Quadratic && self.tokens_per_agent < 1 {
            return Err(SwarmError::config("tokens_per_agent must be at least 1"));
        }
        if self.duration_ms == 0 {
            return Err(SwarmError::config("vote duration_ms must be positive"));
        }
        if let Some(quorum) = &self.quorum {
            quorum.validate()?;
        }
        Ok(())
    }
}

/// One open or closed voting session.
#[derive(Debug, Clone)]
pub struct VotingSession {
    pub session_id: String,
    pub initiator: String,
    pub topic: String,
    pub question: String,
    pub options: Vec<String>,
    pub algorithm: VotingAlgorithm,
    pub quorum: QuorumConfig,
    pub consensus_threshold: f64,
    pub tokens_per_agent: u32,
    /// Unix ms when the session opened.
    pub opened_at: i64,
    /// Unix ms after which ballots are rejected.
    pub deadline: i64,
    pub status: SessionStatus,
    votes: HashMap<String, Ballot>,
    results: Option<VoteResults>,
}

impl VotingSession {
    /// The fanout announcement for this session.
    pub fn announcement(&self) -> VotingStartPayload {
        VotingStartPayload {
            session_id: self.session_id.clone(),
            topic: self.topic.clone(),
            question: self.question.clone(),
            options: self.options.clone(),
            algorithm: self.algorithm,
            deadline_ms: self.deadline,
            consensus_threshold: if self.algorithm == VotingAlgorithm::Consensus {
                Some(self.consensus_threshold)
            } else {
                None
            },
            tokens_per_agent: if self.algorithm == VotingAlgorithm::Quadratic {
                Some(self.tokens_per_agent)
            } else {
                None
            },
        }
    }

    pub fn ballot_count(&self) -> usize {
        self.votes.len()
    }

    fn validate_ballot(&self, ballot: &Ballot) -> Result<(), VoteError> {
        match (&self.algorithm, &ballot.content) {
            (
                VotingAlgorithm::SimpleMajority
                | VotingAlgorithm::ConfidenceWeighted
                | VotingAlgorithm::Consensus,
                VoteContent::Choice { choice, confidence },
            ) => {
                if !self.options.iter().any(|o| o == choice) {
                    return Err(VoteError::InvalidBallot(format!(
                        "choice {:?} is not among the session options",
                        choice
                    )));
                }
                if !(0.0..=1.0).contains(confidence) {
                    return Err(VoteError::InvalidBallot(format!(
                        "confidence must be within [0, 1], got {}",
                        confidence
                    )));
                }
                Ok(())
            }
            (VotingAlgorithm::Quadratic, VoteContent::Allocation { allocation }) => {
                let mut spent = 0u64;
                for (option, tokens) in allocation {
                    if !self.options.iter().any(|o| o == option) {
                        return Err(VoteError::InvalidBallot(format!(
                            "allocation option {:?} is not among the session options",
                            option
                        )));
                    }
                    spent += u64::from(*tokens);
                }
                if spent > u64::from(self.tokens_per_agent) {
                    return Err(VoteError::InvalidBallot(format!(
                        "allocation spends {} tokens, budget is {}",
                        spent, self.tokens_per_agent
                    )));
                }
                Ok(())
            }
            (VotingAlgorithm::RankedChoice, VoteContent::Rankings { rankings }) => {
                if rankings.len() != self.options.len() {
                    return Err(VoteError::InvalidBallot(
                        "rankings must order every option exactly once".into(),
                    ));
                }
                let mut seen = std::collections::HashSet::new();
                for option in rankings {
                    if !self.options.iter().any(|o| o == option) {
                        return Err(VoteError::InvalidBallot(format!(
                            "ranked option {:?} is not among the session options",
                            option
                        )));
                    }
                    if !seen.insert(option.as_str()) {
                        return Err(VoteError::InvalidBallot(format!(
                            "option {:?} appears more than once in rankings",
                            option
                        )));
                    }
                }
                Ok(())
            }
            _ => Err(VoteError::InvalidBallot(format!(
                "ballot shape does not match algorithm {}",
                self.algorithm.as_str()
            ))),
        }
    }
}

/// Owner of all locally initiated voting sessions.
#[derive(Debug)]
pub struct VotingSystem {
    sessions: Mutex<HashMap<String, VotingSession>>,
    default_quorum: QuorumConfig,
}

impl VotingSystem {
    pub fn new(default_quorum: QuorumConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            default_quorum,
        }
    }

    /// Open a session and return its id. Validation failures surface as
    /// `ConfigError` before any state is created.
    pub fn open(
        &self,
        initiator: impl Into<String>,
        config: VoteSessionConfig,
    ) -> Result<String, SwarmError> {
        config.validate()?;
        let now = Utc::now().timestamp_millis();
        let session = VotingSession {
            session_id: Uuid::new_v4().to_string(),
            initiator: initiator.into(),
            topic: config.topic,
            question: config.question,
            options: config.options,
            algorithm: config.algorithm,
            quorum: config.quorum.unwrap_or_else(|| self.default_quorum.clone()),
            consensus_threshold: config.consensus_threshold,
            tokens_per_agent: config.tokens_per_agent,
            opened_at: now,
            deadline: now + config.duration_ms as i64,
            status: SessionStatus::Open,
            votes: HashMap::new(),
            results: None,
        };
        let session_id = session.session_id.clone();
        self.sessions
            .lock()
            .expect("voting sessions lock poisoned")
            .insert(session_id.clone(), session);
        Ok(session_id)
    }

    /// Ingest a ballot. Last write wins: a repeated ballot from the same
    /// agent replaces the earlier one, timestamp included.
    pub fn cast(&self, session_id: &str, ballot: Ballot) -> Result<(), VoteError> {
        let mut sessions = self.sessions.lock().expect("voting sessions lock poisoned");
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| VoteError::NotFound(session_id.to_string()))?;

        match session.status {
            SessionStatus::Open => {}
            _ => return Err(VoteError::SessionClosed(session_id.to_string())),
        }
        if ballot.cast_at > session.deadline {
            return Err(VoteError::DeadlinePassed(session_id.to_string()));
        }
        session.validate_ballot(&ballot)?;
        session.votes.insert(ballot.agent_id.clone(), ballot);
        Ok(())
    }

    /// Close the session and compute results. Idempotent: a second close
    /// returns the stored results unchanged.
    pub fn close(&self, session_id: &str) -> Result<VoteResults, VoteError> {
        let mut sessions = self.sessions.lock().expect("voting sessions lock poisoned");
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| VoteError::NotFound(session_id.to_string()))?;

        if let Some(results) = &session.results {
            return Ok(results.clone());
        }

        let ballots: Vec<Ballot> = session.votes.values().cloned().collect();
        let quorum = check_quorum(&session.quorum, &ballots);
        let results = if quorum.satisfied {
            session.status = SessionStatus::ClosedSuccess;
            let ctx = TallyContext {
                session_id: &session.session_id,
                options: &session.options,
                consensus_threshold: session.consensus_threshold,
                tokens_per_agent: session.tokens_per_agent,
            };
            tally(session.algorithm, &ctx, &ballots, quorum)
        } else {
            session.status = SessionStatus::ClosedQuorumFailed;
            quorum_failed_results(session.algorithm, ballots.len(), quorum)
        };
        session.results = Some(results.clone());
        Ok(results)
    }

    /// Results of a session: `None` while it is still open.
    pub fn results(&self, session_id: &str) -> Result<Option<VoteResults>, VoteError> {
        let sessions = self.sessions.lock().expect("voting sessions lock poisoned");
        sessions
            .get(session_id)
            .map(|s| s.results.clone())
            .ok_or_else(|| VoteError::NotFound(session_id.to_string()))
    }

    pub fn status(&self, session_id: &str) -> Result<SessionStatus, VoteError> {
        let sessions = self.sessions.lock().expect("voting sessions lock poisoned");
        sessions
            .get(session_id)
            .map(|s| s.status)
            .ok_or_else(|| VoteError::NotFound(session_id.to_string()))
    }

    /// Unix ms deadline of a session.
    pub fn deadline(&self, session_id: &str) -> Result<i64, VoteError> {
        let sessions = self.sessions.lock().expect("voting sessions lock poisoned");
        sessions
            .get(session_id)
            .map(|s| s.deadline)
            .ok_or_else(|| VoteError::NotFound(session_id.to_string()))
    }

    /// Whether the session was initiated by the given agent.
    pub fn is_local(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .expect("voting sessions lock poisoned")
            .contains_key(session_id)
    }

    /// Snapshot of a session's announcement payload.
    pub fn announcement(&self, session_id: &str) -> Result<VotingStartPayload, VoteError> {
        let sessions = self.sessions.lock().expect("voting sessions lock poisoned");
        sessions
            .get(session_id)
            .map(|s| s.announcement())
            .ok_or_else(|| VoteError::NotFound(session_id.to_string()))
    }

    /// Drop every session. Only for embedders that explicitly recycle state.
    pub fn reset(&self) {
        self.sessions
            .lock()
            .expect("voting sessions lock poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_session(system: &VotingSystem, algorithm: VotingAlgorithm) -> String {
        system
            .open(
                "leader-1",
                VoteSessionConfig::new(
                    "t",
                    "q",
                    vec!["A".into(), "B".into()],
                    algorithm,
                ),
            )
            .unwrap()
    }

    fn ballot(agent: &str, option: &str, confidence: f64) -> Ballot {
        Ballot {
            agent_id: agent.into(),
            agent_level: 0,
            cast_at: Utc::now().timestamp_millis(),
            content: VoteContent::Choice {
                choice: option.into(),
                confidence,
            },
        }
    }

    #[test]
    fn last_write_wins() {
        let system = VotingSystem::new(QuorumConfig::default());
        let id = open_session(&system, VotingAlgorithm::SimpleMajority);

        system.cast(&id, ballot("a1", "A", 1.0)).unwrap();
        system.cast(&id, ballot("a1", "B", 1.0)).unwrap();
        system.cast(&id, ballot("a2", "B", 1.0)).unwrap();

        let results = system.close(&id).unwrap();
        assert_eq!(results.winner.as_deref(), Some("B"));
        assert_eq!(results.total_ballots, 2);
    }

    #[test]
    fn ballot_after_close_is_rejected() {
        let system = VotingSystem::new(QuorumConfig::default());
        let id = open_session(&system, VotingAlgorithm::SimpleMajority);
        system.cast(&id, ballot("a1", "A", 1.0)).unwrap();
        system.close(&id).unwrap();

        let err = system.cast(&id, ballot("a2", "B", 1.0)).unwrap_err();
        assert!(matches!(err, VoteError::SessionClosed(_)));
    }

    #[test]
    fn close_is_idempotent() {
        let system = VotingSystem::new(QuorumConfig::default());
        let id = open_session(&system, VotingAlgorithm::SimpleMajority);
        system.cast(&id, ballot("a1", "A", 1.0)).unwrap();

        let first = system.close(&id).unwrap();
        let second = system.close(&id).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn mismatched_ballot_shape_is_invalid() {
        let system = VotingSystem::new(QuorumConfig::default());
        let id = open_session(&system, VotingAlgorithm::RankedChoice);

        let err = system.cast(&id, ballot("a1", "A", 1.0)).unwrap_err();
        assert!(matches!(err, VoteError::InvalidBallot(_)));
    }

    #[test]
    fn quorum_failure_closes_without_winner() {
        let system = VotingSystem::new(
            QuorumConfig::default()
                .with_min_participation(0.9)
                .with_total_agents(10),
        );
        let id = open_session(&system, VotingAlgorithm::SimpleMajority);
        system.cast(&id, ballot("a1", "A", 1.0)).unwrap();

        let results = system.close(&id).unwrap();
        assert_eq!(results.winner, None);
        assert!(!results.quorum.satisfied);
        assert_eq!(
            system.status(&id).unwrap(),
            SessionStatus::ClosedQuorumFailed
        );
    }
}
