//! Agent invocation wrapper
//!
//! Calls one agent once, bounded by a timeout, and turns whatever happens
//! into a [`StageResult`]. It never retries; the scheduler decides that.

use super::{StageAgent, StageContext};
use crate::error::{sanitize_error_message, AgentError};
use crate::observability::metrics::metrics;
use crate::observability::observer::ObserverHandle;
use crate::pipeline::{StageResult, StageResultMetadata, TokenCounts};
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

/// Why an invocation did not produce a usable result
#[derive(Debug, Error)]
pub enum InvocationFailure {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("Agent call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The session's execution-time budget ran out during the call
    #[error("Execution time budget ran out during the call ({remaining_ms}ms were left)")]
    BudgetTimeout { remaining_ms: u64 },
}

impl InvocationFailure {
    pub fn is_retryable(&self) -> bool {
        match self {
            InvocationFailure::Agent(e) => e.is_retryable(),
            InvocationFailure::Timeout { .. } => true,
            InvocationFailure::BudgetTimeout { .. } => false,
        }
    }
}

/// Timeout for one attempt: the stage's own limit, clipped by whatever is
/// left of the session's execution-time budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageTimeout {
    pub stage_timeout: Duration,
    pub remaining_budget: Duration,
}

impl StageTimeout {
    pub fn new(stage_timeout: Duration, remaining_budget: Duration) -> Self {
        Self {
            stage_timeout,
            remaining_budget,
        }
    }

    pub fn effective(&self) -> Duration {
        self.stage_timeout.min(self.remaining_budget)
    }

    /// Whether expiry of the effective timeout means the budget ran out
    pub fn is_budget_bound(&self) -> bool {
        self.remaining_budget < self.stage_timeout
    }

    fn expired(&self) -> InvocationFailure {
        if self.is_budget_bound() {
            InvocationFailure::BudgetTimeout {
                remaining_ms: self.remaining_budget.as_millis() as u64,
            }
        } else {
            InvocationFailure::Timeout {
                timeout_ms: self.stage_timeout.as_millis() as u64,
            }
        }
    }
}

/// Outcome of one agent call
#[derive(Debug)]
pub struct Invocation {
    pub result: StageResult,
    pub failure: Option<InvocationFailure>,
}

impl Invocation {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Invocation wrapper shared by every stage node of a session
#[derive(Clone)]
pub struct AgentInvoker {
    observer: ObserverHandle,
}

impl AgentInvoker {
    pub fn new(observer: ObserverHandle) -> Self {
        Self { observer }
    }

    /// Call `agent` once for `ctx`
    pub async fn invoke(
        &self,
        agent: &dyn StageAgent,
        ctx: StageContext,
        timeout: StageTimeout,
    ) -> Invocation {
        let stage = ctx.stage;
        let session_id = ctx.session.session_id.clone();
        let started_at = Utc::now();
        let started = Instant::now();

        self.observer.agent_started(&session_id, stage, ctx.attempt);
        debug!(
            session_id = %session_id,
            stage = %stage,
            agent = agent.name(),
            attempt = ctx.attempt,
            timeout_ms = timeout.effective().as_millis() as u64,
            "Invoking agent"
        );

        let outcome = if !agent.validate_input(ctx.request()) {
            Err(InvocationFailure::Agent(AgentError::invalid_input(format!(
                "{} rejected the request payload",
                agent.name()
            ))))
        } else {
            let call = AssertUnwindSafe(agent.execute(&ctx)).catch_unwind();
            match tokio::time::timeout(timeout.effective(), call).await {
                Ok(Ok(Ok(output))) => Ok(output),
                Ok(Ok(Err(e))) => Err(InvocationFailure::Agent(e)),
                Ok(Err(_)) => Err(InvocationFailure::Agent(AgentError::failed(format!(
                    "{} panicked",
                    agent.name()
                )))),
                Err(_) => Err(timeout.expired()),
            }
        };

        let duration = started.elapsed();
        let mut metadata = StageResultMetadata {
            started_at,
            completed_at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
            cost: 0.0,
            provider: None,
            tokens: TokenCounts::default(),
            retry_attempts: ctx.attempt,
        };

        let invocation = match outcome {
            Ok(output) => {
                metadata.cost = output.cost;
                metadata.provider = output.provider;
                metadata.tokens = output.tokens;
                Invocation {
                    result: StageResult {
                        stage_id: stage,
                        success: true,
                        data: output.data,
                        error: None,
                        metadata,
                    },
                    failure: None,
                }
            }
            Err(failure) => {
                warn!(
                    session_id = %session_id,
                    stage = %stage,
                    attempt = ctx.attempt,
                    error = %failure,
                    "Agent call failed"
                );
                Invocation {
                    result: StageResult {
                        stage_id: stage,
                        success: false,
                        data: Value::Null,
                        error: Some(sanitize_error_message(&failure.to_string())),
                        metadata,
                    },
                    failure: Some(failure),
                }
            }
        };

        metrics().stage_attempt(stage.as_str(), duration, invocation.succeeded());
        self.observer.agent_completed(&session_id, &invocation.result);
        invocation
    }
}
