//! End-to-end scheduler behavior through the session store
//!
//! Each test runs a whole session against scripted agents and checks the
//! terminal snapshot and the stream that led to it:
//! - Retry recovery and retry exhaustion
//! - Budget breaches (cost, wall clock, tokens) are fatal and never retried
//! - Progress only moves forward and reaches 100 once, on completion


use proptest::prelude::*;
use serde_json::json;
use std::time::Duration;
use test_helpers::{drain, percentages, session_config, store_for};
use tripflow::budget::BudgetLimits;
use tripflow::config::SessionConfig;
use tripflow::pipeline::{Stage, TokenCounts, WorkflowErrorKind, WorkflowState};
use tripflow::testing::{AgentStep, ScriptedAgent, ScriptedAgents};

fn error_kinds(session: &tripflow::pipeline::Session) -> Vec<WorkflowErrorKind> {
    session.metadata.errors.iter().map(|e| e.kind).collect()
}

#[tokio::test]
async fn test_happy_path_streams_every_transition() {
    let agents = ScriptedAgents::succeeding();
    let store = store_for(&agents, 4);
    let id = store.start(json!({"destination": "Kyoto", "days": 5})).unwrap();

    let snapshots = drain(store.stream_session(&id).unwrap()).await;

    let terminal = snapshots.last().unwrap();
    assert_eq!(terminal.state, WorkflowState::Completed);
    assert_eq!(snapshots.first().unwrap().state, WorkflowState::Initialized);
    assert_eq!(terminal.metadata.completed_stages, Stage::ALL.to_vec());
    assert_eq!(terminal.metadata.total_tokens, TokenCounts::new(40, 20));
    assert!(terminal.metadata.total_execution_time_ms.is_some());
    assert!(terminal.metadata.errors.is_empty());

    let visited: Vec<WorkflowState> = snapshots.iter().map(|s| s.state).collect();
    for state in [
        WorkflowState::Planning,
        WorkflowState::Gathering,
        WorkflowState::Strategizing,
        WorkflowState::Compiling,
    ] {
        assert!(visited.contains(&state), "missing {state}");
    }
    assert_eq!(agents.cleanups(), [1, 1, 1, 1]);
}

#[tokio::test]
async fn test_percentage_is_monotonic_and_hits_100_once() {
    let agents = ScriptedAgents::succeeding().with(
        Stage::Strategize,
        ScriptedAgent::new("strategize", vec![AgentStep::fail("blip")]),
    );
    let store = store_for(&agents, 4);
    let id = store.start(json!({})).unwrap();

    let snapshots = drain(store.stream_session(&id).unwrap()).await;
    let pct = percentages(&snapshots);

    assert!(pct.windows(2).all(|w| w[0] <= w[1]), "{pct:?}");
    assert_eq!(pct.iter().filter(|p| **p == 100.0).count(), 1);
    assert_eq!(pct.last(), Some(&100.0));
}

#[tokio::test]
async fn test_two_failures_then_success_recovers() {
    let agents = ScriptedAgents::succeeding().with(
        Stage::Plan,
        ScriptedAgent::new("plan", vec![AgentStep::fail("503"), AgentStep::fail("503")]),
    );
    let store = store_for(&agents, 4);
    let id = store.start(json!({})).unwrap();

    let snapshots = drain(store.stream_session(&id).unwrap()).await;
    let terminal = snapshots.last().unwrap();

    assert_eq!(terminal.state, WorkflowState::Completed);
    assert_eq!(terminal.retry_budget.retry_count, 0);
    assert_eq!(
        error_kinds(terminal),
        vec![
            WorkflowErrorKind::StageFailure,
            WorkflowErrorKind::AgentRetry,
            WorkflowErrorKind::StageFailure,
            WorkflowErrorKind::AgentRetry,
        ]
    );
    let peak = snapshots
        .iter()
        .map(|s| s.retry_budget.retry_count)
        .max()
        .unwrap();
    assert_eq!(peak, 2);
    assert_eq!(terminal.stage_results[&Stage::Plan].metadata.retry_attempts, 2);
}

#[tokio::test]
async fn test_retry_budget_is_shared_and_reset_by_success() {
    // Two failures in each of three stages: six in total, never three in a row.
    let agents = ScriptedAgents::from_fn(|stage| {
        let steps = if stage == Stage::Compile {
            vec![]
        } else {
            vec![AgentStep::fail("x"), AgentStep::fail("x")]
        };
        ScriptedAgent::new(stage.as_str(), steps)
    });
    let store = store_for(&agents, 4);
    let id = store.start(json!({})).unwrap();

    let terminal = store.wait(&id).await.unwrap();

    assert_eq!(terminal.state, WorkflowState::Completed);
    assert_eq!(agents.plan.executions(), 3);
    assert_eq!(agents.strategize.executions(), 3);
}

#[tokio::test]
async fn test_retry_exhaustion_fails_session() {
    let agents = ScriptedAgents::succeeding()
        .with(Stage::Compile, ScriptedAgent::always("compile", AgentStep::fail("down")));
    let store = store_for(&agents, 4);
    let id = store.start(json!({})).unwrap();

    let snapshots = drain(store.stream_session(&id).unwrap()).await;
    let terminal = snapshots.last().unwrap();

    assert_eq!(terminal.state, WorkflowState::Failed);
    assert!(!terminal.should_continue);
    assert_eq!(agents.compile.executions(), 3);
    assert_eq!(
        error_kinds(terminal).last(),
        Some(&WorkflowErrorKind::RetryExhausted)
    );
    assert!(snapshots
        .iter()
        .all(|s| s.retry_budget.retry_count <= s.retry_budget.max_retries));
    // A failing last stage never shows 100%.
    assert!(percentages(&snapshots).iter().all(|p| *p < 100.0));
    assert_eq!(terminal.metadata.completed_stages.len(), 3);
    assert!(!terminal.stage_results[&Stage::Compile].success);
    assert_eq!(agents.cleanups(), [1, 1, 1, 1]);
}

#[tokio::test]
async fn test_rejected_input_fails_without_retry() {
    let agents = ScriptedAgents::succeeding()
        .with(Stage::Plan, ScriptedAgent::new("plan", vec![]).rejecting_input());
    let store = store_for(&agents, 4);
    let id = store.start(json!("")).unwrap();

    let terminal = store.wait(&id).await.unwrap();

    assert_eq!(terminal.state, WorkflowState::Failed);
    assert_eq!(agents.plan.executions(), 0);
    assert_eq!(error_kinds(&terminal), vec![WorkflowErrorKind::StageFailure]);
    assert_eq!(agents.gather.cleanups(), 1);
}

#[tokio::test]
async fn test_cost_breach_is_fatal() {
    let agents = ScriptedAgents::succeeding().with(
        Stage::Plan,
        ScriptedAgent::always("plan", AgentStep::succeed_with_cost(0.02)),
    );
    let store = store_for(&agents, 4);
    let config = SessionConfig {
        budget: BudgetLimits {
            max_cost: 0.01,
            ..Default::default()
        },
        ..session_config(3)
    };
    let id = store.start_session(json!({}), config).unwrap();

    let terminal = store.wait(&id).await.unwrap();

    assert_eq!(terminal.state, WorkflowState::Failed);
    assert_eq!(agents.plan.executions(), 1);
    assert_eq!(agents.gather.executions(), 0);
    assert_eq!(error_kinds(&terminal), vec![WorkflowErrorKind::BudgetExceeded]);
    assert_eq!(terminal.retry_budget.retry_count, 0);
}

#[tokio::test]
async fn test_projected_cost_stops_before_next_stage() {
    // 0.3 spent after Plan projects 0.6 after Gather, over the 0.5 ceiling.
    let agents = ScriptedAgents::succeeding().with(
        Stage::Plan,
        ScriptedAgent::always("plan", AgentStep::succeed_with_cost(0.3)),
    );
    let store = store_for(&agents, 4);
    let config = SessionConfig {
        budget: BudgetLimits {
            max_cost: 0.5,
            ..Default::default()
        },
        ..session_config(3)
    };
    let id = store.start_session(json!({}), config).unwrap();

    let terminal = store.wait(&id).await.unwrap();

    assert_eq!(terminal.state, WorkflowState::Failed);
    assert_eq!(terminal.metadata.completed_stages, vec![Stage::Plan]);
    assert_eq!(agents.gather.executions(), 0);
    let breach = terminal.last_failure().unwrap();
    assert_eq!(breach.kind, WorkflowErrorKind::BudgetExceeded);
    assert_eq!(breach.stage, Some(Stage::Gather));
}

#[tokio::test]
async fn test_token_ceiling_per_agent() {
    let agents = ScriptedAgents::succeeding().with(
        Stage::Gather,
        ScriptedAgent::always(
            "gather",
            AgentStep::succeed_with(json!({"big": true}), 0.0, TokenCounts::new(900, 200)),
        ),
    );
    let store = store_for(&agents, 4);
    let config = SessionConfig {
        budget: BudgetLimits {
            max_tokens_per_agent: 1000,
            ..Default::default()
        },
        ..session_config(3)
    };
    let id = store.start_session(json!({}), config).unwrap();

    let terminal = store.wait(&id).await.unwrap();

    assert_eq!(terminal.state, WorkflowState::Failed);
    assert_eq!(terminal.metadata.completed_stages, vec![Stage::Plan]);
    assert_eq!(terminal.metadata.total_tokens.total, 15 + 1100);
    assert!(terminal.stage_results.contains_key(&Stage::Gather));
    assert_eq!(agents.gather.executions(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_execution_time_budget_cuts_off_stage() {
    let slow = AgentStep::succeed().after(Duration::from_secs(2));
    let agents = ScriptedAgents::from_fn(|stage| ScriptedAgent::always(stage.as_str(), slow.clone()));
    let store = store_for(&agents, 4);
    let config = SessionConfig {
        budget: BudgetLimits {
            max_execution_time_ms: 3_000,
            ..Default::default()
        },
        ..session_config(3)
    };
    let id = store.start_session(json!({}), config).unwrap();

    let terminal = store.wait(&id).await.unwrap();

    assert_eq!(terminal.state, WorkflowState::Failed);
    assert_eq!(terminal.metadata.completed_stages, vec![Stage::Plan]);
    assert_eq!(agents.gather.executions(), 1);
    assert_eq!(error_kinds(&terminal), vec![WorkflowErrorKind::BudgetExceeded]);
}

#[tokio::test(start_paused = true)]
async fn test_stage_timeout_is_retried_as_timeout() {
    let agents = ScriptedAgents::succeeding().with(
        Stage::Gather,
        ScriptedAgent::new(
            "gather",
            vec![AgentStep::succeed().after(Duration::from_secs(10))],
        ),
    );
    let store = store_for(&agents, 4);
    let mut config = session_config(3);
    config.stage_timeouts.insert(Stage::Gather, 1_000);
    let id = store.start_session(json!({}), config).unwrap();

    let terminal = store.wait(&id).await.unwrap();

    assert_eq!(terminal.state, WorkflowState::Completed);
    assert_eq!(agents.gather.executions(), 2);
    assert_eq!(error_kinds(&terminal)[0], WorkflowErrorKind::Timeout);
    assert!(terminal.metadata.errors[0].retryable);
}

#[tokio::test]
async fn test_stage_receives_request_and_prior_results() {
    let agents = ScriptedAgents::succeeding();
    let store = store_for(&agents, 4);
    let id = store.start(json!({"destination": "Rome"})).unwrap();

    let terminal = store.wait(&id).await.unwrap();

    assert_eq!(terminal.request, json!({"destination": "Rome"}));
    assert_eq!(
        agents.strategize.prior_stages_seen(),
        vec![vec![Stage::Plan, Stage::Gather]]
    );
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Ok,
    Fail,
}

fn step_strategy() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(prop_oneof![Just(Step::Ok), Just(Step::Fail)], 0..5)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn progress_and_retry_invariants_hold(
        scripts in prop::collection::vec(step_strategy(), 4),
        max_retries in 1u32..4,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let snapshots = runtime.block_on(async {
            let agents = ScriptedAgents::from_fn(|stage| {
                let steps = scripts[stage.index()]
                    .iter()
                    .map(|step| match step {
                        Step::Ok => AgentStep::succeed(),
                        Step::Fail => AgentStep::fail("scripted"),
                    })
                    .collect();
                ScriptedAgent::new(stage.as_str(), steps)
            });
            let store = store_for(&agents, 1);
            let id = store.start_session(json!({}), session_config(max_retries)).unwrap();
            drain(store.stream_session(&id).unwrap()).await
        });

        let terminal = snapshots.last().unwrap();
        prop_assert!(terminal.state.is_terminal());

        let pct = percentages(&snapshots);
        prop_assert!(pct.windows(2).all(|w| w[0] <= w[1]));
        let full = pct.iter().filter(|p| **p == 100.0).count();
        if terminal.state == WorkflowState::Completed {
            prop_assert_eq!(full, 1);
        } else {
            prop_assert_eq!(full, 0);
            prop_assert!(!terminal.metadata.errors.is_empty());
        }

        for snapshot in &snapshots {
            prop_assert!(snapshot.retry_budget.retry_count <= snapshot.retry_budget.max_retries);
            let completed = &snapshot.metadata.completed_stages;
            prop_assert_eq!(completed.as_slice(), &Stage::ALL[..completed.len()]);
        }
    }
}
