use std::collections::BTreeMap;

use swarmq::envelope::VoteContent;
use swarmq::tally::{check_quorum, tally, Ballot, TallyContext, VotingAlgorithm};
use swarmq::QuorumConfig;

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

fn ranked(agent: &str, order: &[&str], at: i64) -> Ballot {
    ranked_level(agent, order, 0, at)
}

fn ranked_level(agent: &str, order: &[&str], level: u8, at: i64) -> Ballot {
    Ballot {
        agent_id: agent.into(),
        agent_level: level,
        cast_at: at,
        content: VoteContent::Rankings {
            rankings: order.iter().map(|o| o.to_string()).collect(),
        },
    }
}

fn options(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

fn ctx<'a>(session_id: &'a str, opts: &'a [String], threshold: f64) -> TallyContext<'a> {
    TallyContext {
        session_id,
        options: opts,
        consensus_threshold: threshold,
        tokens_per_agent: 9,
    }
}

fn open_quorum(ballots: &[Ballot]) -> swarmq::tally::QuorumDetail {
    check_quorum(&QuorumConfig::default(), ballots)
}

fn approx(a: f64, b: f64) {
    assert!((a - b).abs() < 1e-9, "expected {} ~ {}", a, b);
}

#[test]
fn confidence_weighted_vote_matches_hand_computed_scores() {
    // Three ballots: (A, 0.95, level 5), (B, 0.40, level 2), (A, 0.70, level 3).
    let opts = options(&["A", "B"]);
    let ballots = vec![
        choice("a1", "A", 0.95, 5, 1),
        choice("a2", "B", 0.40, 2, 2),
        choice("a3", "A", 0.70, 3, 3),
    ];
    let results = tally(
        VotingAlgorithm::ConfidenceWeighted,
        &ctx("s3", &opts, 0.66),
        &ballots,
        open_quorum(&ballots),
    );

    assert_eq!(results.winner.as_deref(), Some("A"));
    approx(results.scores["A"], 1.65);
    approx(results.scores["B"], 0.40);
    approx(results.winner_percentage, 1.65 / 2.05);
    approx(results.average_confidence.unwrap(), 2.05 / 3.0);
    assert_eq!(results.tie_break, None);
}

#[test]
fn ranked_choice_first_round_majority_needs_no_elimination() {
    let opts = options(&["R", "V", "S", "A"]);
    let ballots = vec![
        ranked("a1", &["R", "V", "S", "A"], 1),
        ranked("a2", &["V", "R", "S", "A"], 2),
        ranked("a3", &["R", "S", "V", "A"], 3),
        ranked("a4", &["S", "R", "V", "A"], 4),
        ranked("a5", &["R", "V", "S", "A"], 5),
    ];
    let results = tally(
        VotingAlgorithm::RankedChoice,
        &ctx("s4", &opts, 0.66),
        &ballots,
        open_quorum(&ballots),
    );

    assert_eq!(results.winner.as_deref(), Some("R"));
    approx(results.winner_percentage, 0.60);
    assert_eq!(results.elimination_rounds, Some(0));
    let rounds = results.rounds.unwrap();
    assert_eq!(rounds.len(), 1);
    assert_eq!(rounds[0].counts["R"], 3);
    assert_eq!(rounds[0].eliminated, None);
}

#[test]
fn ranked_choice_transfers_votes_after_elimination() {
    let opts = options(&["A", "B", "C"]);
    let ballots = vec![
        ranked("a1", &["A", "B", "C"], 1),
        ranked("a2", &["A", "C", "B"], 2),
        ranked("a3", &["B", "A", "C"], 3),
        ranked("a4", &["B", "C", "A"], 4),
        ranked("a5", &["C", "A", "B"], 5),
    ];
    let results = tally(
        VotingAlgorithm::RankedChoice,
        &ctx("irv", &opts, 0.66),
        &ballots,
        open_quorum(&ballots),
    );

    // Round 1: A=2, B=2, C=1 — no majority, C eliminated.
    // Round 2: C's ballot transfers to A — A=3 of 5 wins.
    assert_eq!(results.winner.as_deref(), Some("A"));
    assert_eq!(results.elimination_rounds, Some(1));
    let rounds = results.rounds.unwrap();
    assert_eq!(rounds.len(), 2);
    assert_eq!(rounds[0].eliminated.as_deref(), Some("C"));
    assert_eq!(rounds[1].counts["A"], 3);
}

#[test]
fn ranked_choice_tie_break_counts_transferred_ballots() {
    // Round 1 is a three-way 2-2-2 tie, so A (lexicographically smallest) is
    // eliminated; a1's expert ballot transfers to C and a2's to B, leaving
    // B and C tied 3-3. The tie-break must weigh the ballots that produced
    // those counts — transfers included. C then wins on expertise (a1 is
    // level 5); judging ballots by their original first preference instead
    // would drop both transfers and hand B the tie on earliest timestamp.
    let opts = options(&["A", "B", "C"]);
    let ballots = vec![
        ranked_level("a1", &["A", "C", "B"], 5, 1),
        ranked("a2", &["A", "B", "C"], 2),
        ranked("a3", &["B", "A", "C"], 3),
        ranked("a4", &["B", "C", "A"], 4),
        ranked("a5", &["C", "A", "B"], 5),
        ranked("a6", &["C", "B", "A"], 6),
    ];
    let results = tally(
        VotingAlgorithm::RankedChoice,
        &ctx("irv-tie", &opts, 0.66),
        &ballots,
        open_quorum(&ballots),
    );

    assert_eq!(results.winner.as_deref(), Some("C"));
    assert_eq!(
        results.tie_break,
        Some(swarmq::tally::TieBreakMethod::ExpertiseWeight)
    );
    assert_eq!(results.elimination_rounds, Some(1));
    let rounds = results.rounds.unwrap();
    assert_eq!(rounds.len(), 2);
    assert_eq!(rounds[0].eliminated.as_deref(), Some("A"));
    assert_eq!(rounds[1].counts["B"], 3);
    assert_eq!(rounds[1].counts["C"], 3);
}

#[test]
fn consensus_below_threshold_reports_no_consensus() {
    let opts = options(&["Y", "N"]);
    let ballots = vec![
        choice("a1", "Y", 1.0, 1, 10),
        choice("a2", "Y", 1.0, 1, 20),
        choice("a3", "N", 1.0, 1, 30),
        choice("a4", "N", 1.0, 1, 40),
    ];
    let quorum = check_quorum(
        &QuorumConfig::default().with_total_agents(4),
        &ballots,
    );
    assert!(quorum.satisfied);

    let results = tally(
        VotingAlgorithm::Consensus,
        &ctx("s5", &opts, 0.75),
        &ballots,
        quorum,
    );

    assert_eq!(results.consensus_reached, Some(false));
    approx(results.winner_percentage, 0.5);
    // The 2-2 split is resolved by the tie-break chain: confidences and
    // expertise are level, so the earliest ballot (Y at t=10) decides.
    assert_eq!(results.winner.as_deref(), Some("Y"));
    assert!(results.tie_break.is_some());
}

#[test]
fn tallies_are_order_independent() {
    let opts = options(&["A", "B", "C"]);
    let ballots = vec![
        choice("a1", "A", 0.9, 5, 10),
        choice("a2", "B", 0.4, 2, 20),
        choice("a3", "A", 0.7, 3, 30),
        choice("a4", "C", 0.8, 4, 40),
        choice("a5", "B", 0.6, 1, 50),
    ];

    let reference = tally(
        VotingAlgorithm::ConfidenceWeighted,
        &ctx("perm", &opts, 0.66),
        &ballots,
        open_quorum(&ballots),
    );

    // Feed every rotation and a reversal: same winner, same scores, same
    // tie-break, bit for bit.
    for rotation in 0..ballots.len() {
        let mut permuted = ballots.clone();
        permuted.rotate_left(rotation);
        let results = tally(
            VotingAlgorithm::ConfidenceWeighted,
            &ctx("perm", &opts, 0.66),
            &permuted,
            open_quorum(&permuted),
        );
        assert_eq!(results, reference);
    }
    let mut reversed = ballots.clone();
    reversed.reverse();
    let results = tally(
        VotingAlgorithm::ConfidenceWeighted,
        &ctx("perm", &opts, 0.66),
        &reversed,
        open_quorum(&reversed),
    );
    assert_eq!(results, reference);
}

#[test]
fn quadratic_allocations_sum_square_roots_across_ballots() {
    let opts = options(&["A", "B"]);
    let mut first = BTreeMap::new();
    first.insert("A".to_string(), 4u32);
    first.insert("B".to_string(), 4u32);
    let mut second = BTreeMap::new();
    second.insert("B".to_string(), 9u32);

    let ballots = vec![
        Ballot {
            agent_id: "a1".into(),
            agent_level: 0,
            cast_at: 1,
            content: VoteContent::Allocation { allocation: first },
        },
        Ballot {
            agent_id: "a2".into(),
            agent_level: 0,
            cast_at: 2,
            content: VoteContent::Allocation { allocation: second },
        },
    ];
    let results = tally(
        VotingAlgorithm::Quadratic,
        &ctx("quad", &opts, 0.66),
        &ballots,
        open_quorum(&ballots),
    );

    approx(results.scores["A"], 2.0);
    approx(results.scores["B"], 5.0);
    assert_eq!(results.winner.as_deref(), Some("B"));
    approx(results.winner_percentage, 5.0 / 7.0);
}

#[test]
fn failed_quorum_produces_detail_and_no_winner() {
    let ballots = vec![choice("a1", "A", 0.2, 1, 1)];
    let quorum = check_quorum(
        &QuorumConfig {
            min_participation: 0.5,
            min_confidence: 1.0,
            min_experts: 1,
            total_agents: 10,
        },
        &ballots,
    );
    assert!(!quorum.satisfied);
    assert!(quorum.participation < 0.5);
    assert!(quorum.total_confidence < 1.0);
    assert_eq!(quorum.expert_count, 0);

    let results = swarmq::tally::quorum_failed_results(
        VotingAlgorithm::SimpleMajority,
        ballots.len(),
        quorum,
    );
    assert_eq!(results.winner, None);
    assert!(results.scores.is_empty());
}
