use std::collections::HashSet;

use swarmq::orchestration::{failure_action, FailureAction, RETRIES_HEADER};
use swarmq::task::retry_delay_ms;
use swarmq::{AgentProfile, Capability, HandlerError, Role, SwarmConfig, Task, TaskPriority};

#[test]
fn assigned_task_ids_are_always_distinct() {
    let mut seen = HashSet::new();
    for _ in 0..200 {
        let task = Task::new("t", "d");
        assert!(seen.insert(task.task_id));
    }
}

#[test]
fn retry_schedule_doubles_from_base_and_caps() {
    // Starting budget 3: the three possible retry delays.
    assert_eq!(retry_delay_ms(1_000, 60_000, 3, 3), 1_000);
    assert_eq!(retry_delay_ms(1_000, 60_000, 3, 2), 2_000);
    assert_eq!(retry_delay_ms(1_000, 60_000, 3, 1), 4_000);
    // A small cap clamps the tail of the schedule.
    assert_eq!(retry_delay_ms(1_000, 3_000, 3, 1), 3_000);
}

#[test]
fn a_task_with_budget_k_is_delivered_at_most_k_plus_one_times() {
    // Walk the routing policy the way the worker does: every transient
    // failure routes to a retry with a decremented counter until it hits
    // zero, which dead-letters. A starting budget of 4 (not the type
    // default) is exactly five deliveries, with delays doubling from the
    // base on the very first failure.
    let starting_budget = 4u32;
    let mut deliveries = 0;
    let mut remaining = starting_budget;
    let mut delays = Vec::new();
    let error = HandlerError::transient("connection reset");
    loop {
        deliveries += 1;
        match failure_action(&error, remaining, 1_000, 60_000, starting_budget) {
            FailureAction::Retry {
                delay_ms,
                retries_remaining,
            } => {
                delays.push(delay_ms);
                remaining = retries_remaining;
            }
            FailureAction::DeadLetter => break,
        }
    }
    assert_eq!(deliveries, starting_budget + 1);
    assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000]);
}

#[test]
fn retry_schedule_is_anchored_to_the_tasks_own_budget() {
    // A runtime configured with max_retries = 5 stamps that budget onto a
    // plain task at assignment; the first failure still waits exactly the
    // base delay because the exponent is measured against the task's own
    // budget, never an unrelated local option.
    let task = Task::new("t", "d");
    assert_eq!(task.retries_remaining, None);
    let stamped = 5u32; // what assign_task embeds for this configuration
    assert_eq!(retry_delay_ms(1_000, 60_000, stamped, stamped), 1_000);
    assert_eq!(retry_delay_ms(1_000, 60_000, stamped, stamped - 1), 2_000);

    let explicit = Task::new("t", "d").with_retries(6);
    assert_eq!(explicit.retry_budget(), 6);
    match failure_action(
        &HandlerError::transient("timeout"),
        explicit.retry_budget(),
        1_000,
        60_000,
        explicit.retry_budget(),
    ) {
        FailureAction::Retry {
            delay_ms,
            retries_remaining,
        } => {
            assert_eq!(delay_ms, 1_000);
            assert_eq!(retries_remaining, 5);
        }
        other => panic!("expected retry, got {:?}", other),
    }
}

#[test]
fn permanent_failures_skip_the_retry_queue_entirely() {
    let error = HandlerError::permanent("schema validation failed");
    assert_eq!(
        failure_action(&error, 3, 1_000, 60_000, 3),
        FailureAction::DeadLetter
    );
    assert!(!error.is_transient());
}

#[test]
fn retry_decision_carries_the_decremented_budget() {
    match failure_action(&HandlerError::transient("timeout"), 3, 500, 60_000, 3) {
        FailureAction::Retry {
            delay_ms,
            retries_remaining,
        } => {
            assert_eq!(delay_ms, 500);
            assert_eq!(retries_remaining, 2);
        }
        other => panic!("expected retry, got {:?}", other),
    }
}

#[test]
fn role_enforcement_fails_fast_with_config_errors() {
    let worker = AgentProfile::new(Role::Worker, "w1");
    let err = worker.require(Capability::AssignTask).unwrap_err();
    assert_eq!(err.kind(), "ConfigError");

    let leader = AgentProfile::new(Role::Leader, "l1");
    assert!(leader.require(Capability::AssignTask).is_ok());
    assert!(leader.require(Capability::ConsumeTasks).is_err());

    let monitor = AgentProfile::new(Role::Monitor, "m1");
    assert!(monitor.require(Capability::ConsumeStatus).is_ok());
    assert!(monitor.require(Capability::InitiateVote).is_err());
}

#[test]
fn priority_tiers_map_to_queue_names_and_weights() {
    let config = SwarmConfig::new("amqp://localhost:5672");
    assert_eq!(
        config.topology.priority_queue(TaskPriority::Critical.as_str()),
        "agent.tasks.critical"
    );
    assert_eq!(
        config.topology.priority_queue(TaskPriority::Low.as_str()),
        "agent.tasks.low"
    );

    let weights: Vec<u8> = TaskPriority::descending().iter().map(|p| p.weight()).collect();
    assert_eq!(weights, vec![10, 7, 5, 2]);
}

#[test]
fn invalid_configurations_surface_at_startup() {
    assert_eq!(
        SwarmConfig::new("").validate().unwrap_err().kind(),
        "ConfigError"
    );
    assert!(SwarmConfig::new("amqp://h").with_prefetch(0).validate().is_err());
    assert!(SwarmConfig::new("amqp://h")
        .with_retry_base_ms(5_000)
        .with_retry_max_ms(1_000)
        .validate()
        .is_err());
    assert!(SwarmConfig::new("amqp://h")
        .with_reconnect_max_attempts(0)
        .validate()
        .is_err());
}

#[test]
fn retries_header_name_is_stable() {
    // Retry metadata rides in delivery headers; renaming the key would
    // break mid-flight redeliveries during a rolling upgrade.
    assert_eq!(RETRIES_HEADER, "x-retries-remaining");
}
