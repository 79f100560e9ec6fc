//! Pure tally functions for the five voting algorithms.
//!
//! The `algorithm` tag on a session selects one of five independent pure
//! functions from ballots to results. Nothing in this module suspends or
//! touches shared state, which keeps the determinism guarantee easy to hold:
//! ballots are sorted by `agent_id` before any floating-point accumulation,
//! per-option scores live in `BTreeMap`s, and the tie-break chain ends in a
//! draw seeded by the session id — so any permutation of the same ballot set
//! produces bit-identical results.
//!
//! | Algorithm | Score per ballot | Winner test |
//! |-----------|------------------|-------------|
//! | `simple_majority` | 1 unit on `choice` | argmax |
//! | `confidence_weighted` | `confidence` on `choice` | argmax |
//! | `quadratic` | `sqrt(tokens)` per option | argmax |
//! | `consensus` | as simple majority | argmax + threshold check |
//! | `ranked_choice` | instant-runoff rounds | first to half the ballots |

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::swarmq::config::QuorumConfig;
use crate::swarmq::envelope::VoteContent;

/// The five supported tally algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingAlgorithm {
    SimpleMajority,
    ConfidenceWeighted,
    Quadratic,
    Consensus,
    RankedChoice,
}

impl VotingAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            VotingAlgorithm::SimpleMajority => "simple_majority",
            VotingAlgorithm::ConfidenceWeighted => "confidence_weighted",
            VotingAlgorithm::Quadratic => "quadratic",
            VotingAlgorithm::Consensus => "consensus",
            VotingAlgorithm::RankedChoice => "ranked_choice",
        }
    }
}

/// One accepted ballot, as stored by the voting session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ballot {
    pub agent_id: String,
    pub agent_level: u8,
    /// Unix ms of the *last* write — a replacement ballot carries the
    /// replacement's timestamp.
    pub cast_at: i64,
    pub content: VoteContent,
}

impl Ballot {
    /// Ballot confidence; shapes without one count as 1.0.
    pub fn confidence(&self) -> f64 {
        self.content.confidence()
    }

    /// Whether this ballot counts as an expert ballot (level >= 4).
    pub fn is_expert(&self) -> bool {
        self.agent_level >= 4
    }
}

/// Session parameters a tally needs beyond the ballots themselves.
#[derive(Debug, Clone)]
pub struct TallyContext<'a> {
    /// Seeds the last-resort tie-break draw.
    pub session_id: &'a str,
    /// Declared options, in announcement order.
    pub options: &'a [String],
    /// Winner-share floor for the consensus algorithm.
    pub consensus_threshold: f64,
    /// Token budget per ballot for the quadratic algorithm.
    pub tokens_per_agent: u32,
}

/// Which rule resolved a tie, when one was needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakMethod {
    HighestConfidence,
    ExpertiseWeight,
    EarliestBallot,
    SeededDraw,
}

/// One instant-runoff round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedRound {
    /// 1-based round number.
    pub round: usize,
    /// First-preference counts among the options still standing.
    pub counts: BTreeMap<String, u32>,
    /// The option eliminated this round, or `None` for the winning round.
    pub eliminated: Option<String>,
}

/// Evaluated quorum predicates, kept in results for either outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuorumDetail {
    pub participation: f64,
    pub required_participation: f64,
    pub total_confidence: f64,
    pub required_confidence: f64,
    pub expert_count: usize,
    pub required_experts: usize,
    pub satisfied: bool,
}

/// The immutable outcome of a closed voting session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteResults {
    pub algorithm: VotingAlgorithm,
    /// Absent when quorum failed or no valid ballot was cast.
    pub winner: Option<String>,
    /// Per-option scores in the algorithm's unit (counts, confidence mass,
    /// or quadratic votes; final-round counts for ranked choice).
    pub scores: BTreeMap<String, f64>,
    /// Winner's share of the algorithm's total mass, in `[0, 1]`.
    pub winner_percentage: f64,
    pub total_ballots: usize,
    /// Mean ballot confidence, for the choice-shaped algorithms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_confidence: Option<f64>,
    /// Whether the winner share cleared the threshold (consensus only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_reached: Option<bool>,
    /// Instant-runoff round log (ranked choice only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rounds: Option<Vec<RankedRound>>,
    /// Number of eliminations performed (ranked choice only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elimination_rounds: Option<usize>,
    /// Which rule broke a tie, when the tally alone could not pick a winner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tie_break: Option<TieBreakMethod>,
    pub quorum: QuorumDetail,
}

/// Evaluate the three quorum predicates over a ballot set.
pub fn check_quorum(config: &QuorumConfig, ballots: &[Ballot]) -> QuorumDetail {
    let participation = ballots.len() as f64 / config.total_agents.max(1) as f64;
    let total_confidence: f64 = sorted(ballots).iter().map(|b| b.confidence()).sum();
    let expert_count = ballots.iter().filter(|b| b.is_expert()).count();

    QuorumDetail {
        participation,
        required_participation: config.min_participation,
        total_confidence,
        required_confidence: config.min_confidence,
        expert_count,
        required_experts: config.min_experts,
        satisfied: participation >= config.min_participation
            && total_confidence >= config.min_confidence
            && expert_count >= config.min_experts,
    }
}

/// Results for a session that closed without quorum: no winner, no scores.
pub fn quorum_failed_results(
    algorithm: VotingAlgorithm,
    total_ballots: usize,
    quorum: QuorumDetail,
) -> VoteResults {
    VoteResults {
        algorithm,
        winner: None,
        scores: BTreeMap::new(),
        winner_percentage: 0.0,
        total_ballots,
        average_confidence: None,
        consensus_reached: None,
        rounds: None,
        elimination_rounds: None,
        tie_break: None,
        quorum,
    }
}

/// Run the session's algorithm over the ballots. Pure: the same inputs
/// produce bit-identical results regardless of ballot order.
pub fn tally(
    algorithm: VotingAlgorithm,
    ctx: &TallyContext<'_>,
    ballots: &[Ballot],
    quorum: QuorumDetail,
) -> VoteResults {
    let ballots = sorted(ballots);
    match algorithm {
        VotingAlgorithm::SimpleMajority => choice_tally(algorithm, ctx, &ballots, quorum, false),
        VotingAlgorithm::Consensus => choice_tally(algorithm, ctx, &ballots, quorum, true),
        VotingAlgorithm::ConfidenceWeighted => confidence_weighted(ctx, &ballots, quorum),
        VotingAlgorithm::Quadratic => quadratic(ctx, &ballots, quorum),
        VotingAlgorithm::RankedChoice => ranked_choice(ctx, &ballots, quorum),
    }
}

/// Canonical ballot order: by agent id (unique within a session), so that
/// float accumulation is independent of arrival order.
fn sorted(ballots: &[Ballot]) -> Vec<Ballot> {
    let mut out = ballots.to_vec();
    out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
    out
}

fn zero_scores(options: &[String]) -> BTreeMap<String, f64> {
    options.iter().map(|o| (o.clone(), 0.0)).collect()
}

fn mean_confidence(ballots: &[Ballot]) -> Option<f64> {
    if ballots.is_empty() {
        None
    } else {
        Some(ballots.iter().map(|b| b.confidence()).sum::<f64>() / ballots.len() as f64)
    }
}

/// simple_majority and consensus: one unit per ballot's choice.
fn choice_tally(
    algorithm: VotingAlgorithm,
    ctx: &TallyContext<'_>,
    ballots: &[Ballot],
    quorum: QuorumDetail,
    consensus: bool,
) -> VoteResults {
    let mut scores = zero_scores(ctx.options);
    for ballot in ballots {
        if let VoteContent::Choice { choice, .. } = &ballot.content {
            if let Some(score) = scores.get_mut(choice) {
                *score += 1.0;
            }
        }
    }

    let (winner, tie_break) = resolve_winner(ctx, &scores, ballots);
    let total = ballots.len() as f64;
    let winner_percentage = winner
        .as_ref()
        .and_then(|w| scores.get(w))
        .map(|s| if total > 0.0 { s / total } else { 0.0 })
        .unwrap_or(0.0);

    VoteResults {
        algorithm,
        consensus_reached: if consensus {
            Some(winner.is_some() && winner_percentage >= ctx.consensus_threshold)
        } else {
            None
        },
        winner,
        scores,
        winner_percentage,
        total_ballots: ballots.len(),
        average_confidence: mean_confidence(ballots),
        rounds: None,
        elimination_rounds: None,
        tie_break,
        quorum,
    }
}

/// confidence_weighted: ballots contribute their confidence, and the winner
/// percentage is measured against the total confidence mass.
fn confidence_weighted(
    ctx: &TallyContext<'_>,
    ballots: &[Ballot],
    quorum: QuorumDetail,
) -> VoteResults {
    let mut scores = zero_scores(ctx.options);
    let mut total_mass = 0.0;
    for ballot in ballots {
        if let VoteContent::Choice { choice, confidence } = &ballot.content {
            if let Some(score) = scores.get_mut(choice) {
                *score += confidence;
                total_mass += confidence;
            }
        }
    }

    let (winner, tie_break) = resolve_winner(ctx, &scores, ballots);
    let winner_percentage = winner
        .as_ref()
        .and_then(|w| scores.get(w))
        .map(|s| if total_mass > 0.0 { s / total_mass } else { 0.0 })
        .unwrap_or(0.0);

    VoteResults {
        algorithm: VotingAlgorithm::ConfidenceWeighted,
        winner,
        scores,
        winner_percentage,
        total_ballots: ballots.len(),
        average_confidence: mean_confidence(ballots),
        consensus_reached: None,
        rounds: None,
        elimination_rounds: None,
        tie_break,
        quorum,
    }
}

/// quadratic: each allocated token bundle converts to `sqrt(tokens)` votes.
fn quadratic(ctx: &TallyContext<'_>, ballots: &[Ballot], quorum: QuorumDetail) -> VoteResults {
    let mut scores = zero_scores(ctx.options);
    for ballot in ballots {
        if let VoteContent::Allocation { allocation } = &ballot.content {
            for (option, tokens) in allocation {
                if let Some(score) = scores.get_mut(option) {
                    *score += (*tokens as f64).sqrt();
                }
            }
        }
    }

    let total_mass: f64 = scores.values().sum();
    let (winner, tie_break) = resolve_winner(ctx, &scores, ballots);
    let winner_percentage = winner
        .as_ref()
        .and_then(|w| scores.get(w))
        .map(|s| if total_mass > 0.0 { s / total_mass } else { 0.0 })
        .unwrap_or(0.0);

    VoteResults {
        algorithm: VotingAlgorithm::Quadratic,
        winner,
        scores,
        winner_percentage,
        total_ballots: ballots.len(),
        average_confidence: None,
        consensus_reached: None,
        rounds: None,
        elimination_rounds: None,
        tie_break,
        quorum,
    }
}

/// ranked_choice: instant runoff. Each round counts first surviving
/// preferences; an option holding at least half the ballots wins, otherwise
/// the lowest option is eliminated (lexicographically smallest among equals)
/// and the round repeats.
fn ranked_choice(ctx: &TallyContext<'_>, ballots: &[Ballot], quorum: QuorumDetail) -> VoteResults {
    let ranked: Vec<&Ballot> = ballots
        .iter()
        .filter(|b| matches!(b.content, VoteContent::Rankings { .. }))
        .collect();
    let total = ranked.len() as f64;

    let mut eliminated: BTreeSet<String> = BTreeSet::new();
    let mut rounds: Vec<RankedRound> = Vec::new();
    let mut eliminations = 0usize;
    let mut winner = None;
    let mut tie_break = None;
    let mut winner_percentage = 0.0;
    let mut final_counts: BTreeMap<String, u32> = BTreeMap::new();

    while total > 0.0 {
        let mut counts: BTreeMap<String, u32> = ctx
            .options
            .iter()
            .filter(|o| !eliminated.contains(*o))
            .map(|o| (o.clone(), 0))
            .collect();
        for ballot in &ranked {
            if let VoteContent::Rankings { rankings } = &ballot.content {
                if let Some(first) = rankings.iter().find(|o| !eliminated.contains(*o)) {
                    if let Some(count) = counts.get_mut(first) {
                        *count += 1;
                    }
                }
            }
        }

        let top = counts.values().max().copied().unwrap_or(0);
        if f64::from(2 * top) >= total && top > 0 {
            let leaders: Vec<String> = ctx
                .options
                .iter()
                .filter(|o| counts.get(*o) == Some(&top))
                .cloned()
                .collect();
            rounds.push(RankedRound {
                round: rounds.len() + 1,
                counts: counts.clone(),
                eliminated: None,
            });
            if leaders.len() == 1 {
                winner = Some(leaders[0].clone());
            } else {
                let (pick, method) = break_tie(ctx.session_id, leaders, ballots, &eliminated);
                winner = Some(pick);
                tie_break = Some(method);
            }
            winner_percentage = f64::from(top) / total;
            final_counts = counts;
            break;
        }

        // No majority: eliminate the lowest-standing option.
        let low = counts.values().min().copied().unwrap_or(0);
        let loser = ctx
            .options
            .iter()
            .filter(|o| counts.get(*o) == Some(&low))
            .min()
            .cloned();
        match loser {
            Some(loser) => {
                rounds.push(RankedRound {
                    round: rounds.len() + 1,
                    counts: counts.clone(),
                    eliminated: Some(loser.clone()),
                });
                eliminated.insert(loser);
                eliminations += 1;
            }
            None => break,
        }
    }

    VoteResults {
        algorithm: VotingAlgorithm::RankedChoice,
        winner,
        scores: final_counts
            .into_iter()
            .map(|(option, count)| (option, f64::from(count)))
            .collect(),
        winner_percentage,
        total_ballots: ranked.len(),
        average_confidence: None,
        consensus_reached: None,
        rounds: Some(rounds),
        elimination_rounds: Some(eliminations),
        tie_break,
        quorum,
    }
}

/// Pick the argmax over the scores, applying the tie-break chain when more
/// than one option holds the top score. All-zero scores produce no winner.
fn resolve_winner(
    ctx: &TallyContext<'_>,
    scores: &BTreeMap<String, f64>,
    ballots: &[Ballot],
) -> (Option<String>, Option<TieBreakMethod>) {
    let top = scores.values().cloned().fold(0.0f64, f64::max);
    if top <= 0.0 {
        return (None, None);
    }
    let tied: Vec<String> = ctx
        .options
        .iter()
        .filter(|o| scores.get(*o) == Some(&top))
        .cloned()
        .collect();
    if tied.len() == 1 {
        return (Some(tied[0].clone()), None);
    }
    // Only ranked choice eliminates options; the other tallies tie-break
    // against the full ballot set.
    let none_eliminated = BTreeSet::new();
    let (winner, method) = break_tie(ctx.session_id, tied, ballots, &none_eliminated);
    (Some(winner), Some(method))
}

/// Whether a ballot counts as supporting an option for tie-break purposes.
///
/// A ranked ballot supports its current effective preference — the first
/// option still standing in the round being tie-broken — so ballots that
/// reached an option by transfer weigh in for it, exactly as they did in the
/// round counts that produced the tie.
fn supports(ballot: &Ballot, option: &str, eliminated: &BTreeSet<String>) -> bool {
    match &ballot.content {
        VoteContent::Choice { choice, .. } => choice == option,
        VoteContent::Allocation { allocation } => {
            allocation.get(option).copied().unwrap_or(0) > 0
        }
        VoteContent::Rankings { rankings } => rankings
            .iter()
            .find(|o| !eliminated.contains(*o))
            .map(|o| o.as_str())
            == Some(option),
    }
}

/// The four-stage deterministic tie-break chain.
///
/// 1. Higher total confidence among supporting ballots.
/// 2. Higher expertise weight (2 per expert ballot, 1 otherwise).
/// 3. Earliest supporting ballot timestamp.
/// 4. Seeded draw: smallest `sha256(session_id | option)` digest.
fn break_tie(
    session_id: &str,
    tied: Vec<String>,
    ballots: &[Ballot],
    eliminated: &BTreeSet<String>,
) -> (String, TieBreakMethod) {
    let supporters = |option: &str| -> Vec<&Ballot> {
        ballots
            .iter()
            .filter(|b| supports(b, option, eliminated))
            .collect()
    };

    // Stage 1: confidence mass, higher wins.
    let survivors = keep_best(&tied, |option| {
        supporters(option).iter().map(|b| b.confidence()).sum::<f64>()
    });
    if survivors.len() == 1 {
        return (survivors[0].clone(), TieBreakMethod::HighestConfidence);
    }

    // Stage 2: expertise weight, higher wins.
    let survivors = keep_best(&survivors, |option| {
        supporters(option)
            .iter()
            .map(|b| if b.is_expert() { 2.0 } else { 1.0 })
            .sum::<f64>()
    });
    if survivors.len() == 1 {
        return (survivors[0].clone(), TieBreakMethod::ExpertiseWeight);
    }

    // Stage 3: earliest supporting ballot, earlier wins.
    let survivors = keep_best(&survivors, |option| {
        let earliest = supporters(option)
            .iter()
            .map(|b| b.cast_at)
            .min()
            .unwrap_or(i64::MAX);
        -(earliest as f64)
    });
    if survivors.len() == 1 {
        return (survivors[0].clone(), TieBreakMethod::EarliestBallot);
    }

    // Stage 4: seeded draw, always resolves.
    let winner = survivors
        .iter()
        .min_by_key(|option| seeded_digest(session_id, option))
        .cloned()
        .unwrap_or_else(|| survivors[0].clone());
    (winner, TieBreakMethod::SeededDraw)
}

/// Retain the candidates achieving the best metric value.
fn keep_best<F>(candidates: &[String], metric: F) -> Vec<String>
where
    F: Fn(&str) -> f64,
{
    let best = candidates
        .iter()
        .map(|c| metric(c))
        .fold(f64::NEG_INFINITY, f64::max);
    candidates
        .iter()
        .filter(|c| metric(c) == best)
        .cloned()
        .collect()
}

fn seeded_digest(session_id: &str, option: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}", session_id, option).as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn choice(agent: &str, option: &str, confidence: f64, level: u8, at: i64) -> Ballot {
        Ballot {
            agent_id: agent.into(),
            agent_level: level,
            cast_at: at,
            content: VoteContent::Choice {
                choice: option.into(),
                confidence,
            },
        }
    }

    fn options(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn ctx<'a>(session_id: &'a str, opts: &'a [String]) -> TallyContext<'a> {
        TallyContext {
            session_id,
            options: opts,
            consensus_threshold: 0.66,
            tokens_per_agent: 9,
        }
    }

    fn passed_quorum() -> QuorumDetail {
        check_quorum(&QuorumConfig::default(), &[])
    }

    #[test]
    fn empty_ballot_set_produces_no_winner() {
        let opts = options(&["A", "B"]);
        let results = tally(
            VotingAlgorithm::SimpleMajority,
            &ctx("s", &opts),
            &[],
            passed_quorum(),
        );
        assert_eq!(results.winner, None);
        assert_eq!(results.winner_percentage, 0.0);
    }

    #[test]
    fn tie_break_prefers_confidence_then_expertise() {
        let opts = options(&["A", "B"]);
        let ballots = vec![
            choice("a1", "A", 0.9, 1, 10),
            choice("a2", "B", 0.5, 1, 20),
        ];
        let results = tally(
            VotingAlgorithm::SimpleMajority,
            &ctx("s", &opts),
            &ballots,
            passed_quorum(),
        );
        assert_eq!(results.winner.as_deref(), Some("A"));
        assert_eq!(results.tie_break, Some(TieBreakMethod::HighestConfidence));

        let ballots = vec![
            choice("a1", "A", 1.0, 5, 10),
            choice("a2", "B", 1.0, 1, 20),
        ];
        let results = tally(
            VotingAlgorithm::SimpleMajority,
            &ctx("s", &opts),
            &ballots,
            passed_quorum(),
        );
        assert_eq!(results.winner.as_deref(), Some("A"));
        assert_eq!(results.tie_break, Some(TieBreakMethod::ExpertiseWeight));
    }

    #[test]
    fn tie_break_falls_back_to_earliest_then_seed() {
        let opts = options(&["A", "B"]);
        let ballots = vec![
            choice("a1", "B", 1.0, 1, 5),
            choice("a2", "A", 1.0, 1, 10),
        ];
        let results = tally(
            VotingAlgorithm::SimpleMajority,
            &ctx("s", &opts),
            &ballots,
            passed_quorum(),
        );
        assert_eq!(results.winner.as_deref(), Some("B"));
        assert_eq!(results.tie_break, Some(TieBreakMethod::EarliestBallot));

        // Identical confidences, levels, and timestamps: the seeded draw
        // decides, and it is stable for a given session id.
        let ballots = vec![
            choice("a1", "A", 1.0, 1, 10),
            choice("a2", "B", 1.0, 1, 10),
        ];
        let first = tally(
            VotingAlgorithm::SimpleMajority,
            &ctx("seed-session", &opts),
            &ballots,
            passed_quorum(),
        );
        let second = tally(
            VotingAlgorithm::SimpleMajority,
            &ctx("seed-session", &opts),
            &ballots,
            passed_quorum(),
        );
        assert_eq!(first.tie_break, Some(TieBreakMethod::SeededDraw));
        assert_eq!(first.winner, second.winner);
    }

    #[test]
    fn quadratic_counts_sqrt_votes() {
        let opts = options(&["A", "B"]);
        let mut allocation = BTreeMap::new();
        allocation.insert("A".to_string(), 9u32);
        let ballots = vec![Ballot {
            agent_id: "a1".into(),
            agent_level: 0,
            cast_at: 1,
            content: VoteContent::Allocation { allocation },
        }];
        let results = tally(
            VotingAlgorithm::Quadratic,
            &ctx("s", &opts),
            &ballots,
            passed_quorum(),
        );
        assert_eq!(results.scores["A"], 3.0);
        assert_eq!(results.winner.as_deref(), Some("A"));
    }

    #[test]
    fn quorum_detail_evaluates_all_predicates() {
        let config = QuorumConfig {
            min_participation: 0.5,
            min_confidence: 1.5,
            min_experts: 1,
            total_agents: 4,
        };
        let ballots = vec![
            choice("a1", "A", 0.9, 5, 1),
            choice("a2", "A", 0.9, 1, 2),
        ];
        let detail = check_quorum(&config, &ballots);
        assert!(detail.satisfied);
        assert_eq!(detail.expert_count, 1);

        let short = vec![choice("a1", "A", 0.9, 5, 1)];
        assert!(!check_quorum(&config, &short).satisfied);
    }
}
