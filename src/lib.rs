//! tripflow - staged LLM agent pipeline
//!
//! Runs a fixed four-stage pipeline (Plan, Gather, Strategize, Compile) of
//! LLM-backed agents that turn a travel request into an itinerary.
//!
//! # Overview
//!
//! The crate is the execution core around those agents:
//! - A scheduler state machine that sequences stages and retries failures
//!   under a shared, success-resetting retry budget
//! - Cost, time and token ceilings enforced per session
//! - A provider registry that fails over across prioritized LLM backends
//!   and probes their health in the background
//! - A session store with cancellation, concurrent isolated sessions and a
//!   snapshot stream per session
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use serde_json::json;
//! use std::sync::Arc;
//! use tripflow::agent::AgentSet;
//! use tripflow::config::SessionConfig;
//! use tripflow::pipeline::SessionStore;
//! use tripflow::testing::ScriptedAgents;
//!
//! # async fn demo() -> Result<(), tripflow::PipelineError> {
//! let agents = ScriptedAgents::succeeding();
//! let store = SessionStore::new(
//!     Arc::new(move |_: &str| -> AgentSet { agents.agent_set() }),
//!     SessionConfig::default(),
//! );
//!
//! let id = store.start(json!({"destination": "Lisbon", "days": 3}))?;
//! let mut snapshots = store.stream_session(&id)?;
//! while let Some(session) = snapshots.next().await {
//!     println!("{} {:.0}%", session.state, session.metadata.progress.percentage);
//! }
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod budget;
pub mod config;
pub mod error;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod registry;
pub mod testing;

pub use agent::{AgentFactory, AgentOutput, AgentSet, StageAgent, StageContext};
pub use budget::{BudgetBreach, BudgetLimits, BudgetTracker};
pub use config::{ConfigError, PipelineConfig, SessionConfig};
pub use error::{AgentError, PipelineError, PipelineResult};
pub use pipeline::{
    Session, SessionStore, SessionStream, Stage, StageResult, WorkflowError, WorkflowErrorKind,
    WorkflowState,
};
pub use registry::{FailoverError, ProviderRegistry, ProviderRequest, ProviderResponse};
