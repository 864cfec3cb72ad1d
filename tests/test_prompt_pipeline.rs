//! End-to-end runs of the provider-backed prompt agents
//!
//! Each stage's prompt carries the earlier stages' output, so replies must
//! shrink as the session goes on to stay inside the per-agent token limit.


use serde_json::json;
use std::sync::Arc;
use test_helpers::registry_with;
use tripflow::agent::PromptAgentFactory;
use tripflow::config::{AgentsSection, SessionConfig};
use tripflow::pipeline::{SessionStore, Stage, WorkflowState};
use tripflow::testing::MockLlmProvider;

#[tokio::test]
async fn test_large_replies_stay_inside_token_limit() {
    let (registry, backends) = registry_with(
        true,
        vec![("primary", 1, MockLlmProvider::filling_replies(1200))],
    );
    let config = SessionConfig::default();
    let limit = config.budget.max_tokens_per_agent;
    let store = SessionStore::new(
        Arc::new(PromptAgentFactory::new(registry, AgentsSection::default())),
        config,
    );

    let id = store
        .start(json!({"destination": "Lisbon", "days": 3}))
        .unwrap();
    let session = store.wait(&id).await.unwrap();

    assert_eq!(
        session.state,
        WorkflowState::Completed,
        "errors: {:?}",
        session.metadata.errors
    );
    assert_eq!(session.metadata.completed_stages, Stage::ALL.to_vec());
    for result in session.stage_results.values() {
        assert!(result.metadata.tokens.total <= limit);
    }

    // Every request asked for less than the whole limit, and the last one
    // was squeezed below the filler cap by the accumulated prompt.
    let limits: Vec<u32> = backends[0]
        .requested_limits()
        .into_iter()
        .map(|l| l.unwrap())
        .collect();
    assert_eq!(limits.len(), 4);
    assert!(limits.iter().all(|l| *l < limit));
    assert!(limits.windows(2).all(|pair| pair[1] < pair[0]));
    assert!(limits[3] < 1200);
}
