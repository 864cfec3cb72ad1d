//! Stage agent contract
//!
//! The four agents are opaque units. The core only knows how to hand one a
//! session snapshot, bound its execution time, and clean it up once the
//! session ends.

pub mod invoker;
pub mod prompt_agent;

pub use invoker::{AgentInvoker, Invocation, InvocationFailure, StageTimeout};
pub use prompt_agent::{PromptAgent, PromptAgentFactory};

use crate::error::AgentError;
use crate::pipeline::{Session, Stage, StageResult, TokenCounts};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Everything an agent sees for one attempt
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Snapshot taken when the attempt started
    pub session: Session,
    pub stage: Stage,
    /// Zero-based attempt number within the current retry run
    pub attempt: u32,
    /// Per-agent token ceiling from the session budget
    pub max_tokens: u32,
}

impl StageContext {
    /// The caller's original request
    pub fn request(&self) -> &Value {
        &self.session.request
    }

    /// Successful results of all earlier stages, in pipeline order
    pub fn prior_results(&self) -> impl Iterator<Item = &StageResult> {
        self.session.prior_results(self.stage)
    }
}

/// What an agent reports back from a successful call
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AgentOutput {
    pub data: Value,
    pub cost: f64,
    pub provider: Option<String>,
    pub tokens: TokenCounts,
}

/// Contract every stage agent implements
#[async_trait]
pub trait StageAgent: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Run the stage. Errors are retryable unless marked otherwise.
    async fn execute(&self, ctx: &StageContext) -> Result<AgentOutput, AgentError>;

    /// Whether the agent can work with this request payload
    fn validate_input(&self, _payload: &Value) -> bool {
        true
    }

    /// Release resources. Called exactly once per session; must be idempotent.
    async fn cleanup(&self);
}

/// The four agents serving one session
#[derive(Clone)]
pub struct AgentSet {
    plan: Arc<dyn StageAgent>,
    gather: Arc<dyn StageAgent>,
    strategize: Arc<dyn StageAgent>,
    compile: Arc<dyn StageAgent>,
}

impl AgentSet {
    pub fn new(
        plan: Arc<dyn StageAgent>,
        gather: Arc<dyn StageAgent>,
        strategize: Arc<dyn StageAgent>,
        compile: Arc<dyn StageAgent>,
    ) -> Self {
        Self {
            plan,
            gather,
            strategize,
            compile,
        }
    }

    /// Build a set by calling `make` once per stage
    pub fn from_fn(mut make: impl FnMut(Stage) -> Arc<dyn StageAgent>) -> Self {
        Self::new(
            make(Stage::Plan),
            make(Stage::Gather),
            make(Stage::Strategize),
            make(Stage::Compile),
        )
    }

    pub fn get(&self, stage: Stage) -> &Arc<dyn StageAgent> {
        match stage {
            Stage::Plan => &self.plan,
            Stage::Gather => &self.gather,
            Stage::Strategize => &self.strategize,
            Stage::Compile => &self.compile,
        }
    }

    /// Agents in pipeline order
    pub fn iter(&self) -> impl Iterator<Item = (Stage, &Arc<dyn StageAgent>)> {
        Stage::ALL.into_iter().map(move |stage| (stage, self.get(stage)))
    }
}

/// Creates the agent set for a new session
pub trait AgentFactory: Send + Sync {
    fn create(&self, session_id: &str) -> AgentSet;
}

impl<F> AgentFactory for F
where
    F: Fn(&str) -> AgentSet + Send + Sync,
{
    fn create(&self, session_id: &str) -> AgentSet {
        self(session_id)
    }
}
