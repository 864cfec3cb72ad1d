//! Pipeline scheduler
//!
//! An interpreter loop over a fixed set of nodes. Each node returns the next
//! node plus a [`SessionPatch`]; the loop applies the patch to the shared
//! session under its lock and publishes a snapshot. Only the finalizer moves
//! a session into a terminal state.

use super::patch::{PatchOp, SessionPatch};
use super::session::{Session, WorkflowError};
use super::state::{Stage, WorkflowState};
use crate::agent::{AgentInvoker, AgentSet, InvocationFailure, StageContext, StageTimeout};
use crate::budget::{BudgetBreach, BudgetTracker};
use crate::config::SessionConfig;
use crate::observability::metrics::metrics;
use crate::observability::observer::ObserverHandle;
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn, Instrument};

/// Snapshots one session run can publish when every stage burns its whole
/// retry budget: the initial one, three per attempt, and the terminal one.
pub fn snapshot_capacity(max_retries: u32) -> usize {
    let attempts_per_stage = max_retries as usize + 1;
    2 + Stage::COUNT as usize * attempts_per_stage * 3
}

/// The session record shared between the scheduler and the store
pub struct SharedSession {
    session: RwLock<Session>,
    cancel: watch::Sender<bool>,
    terminal: watch::Sender<bool>,
}

impl SharedSession {
    pub fn new(session: Session) -> Self {
        Self {
            session: RwLock::new(session),
            cancel: watch::channel(false).0,
            terminal: watch::channel(false).0,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Session> {
        self.session.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Session> {
        self.session.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn session_id(&self) -> String {
        self.read().session_id.clone()
    }

    /// Cloned copy of the current record
    pub fn snapshot(&self) -> Session {
        self.read().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.read().is_terminal()
    }

    /// Apply a patch atomically and return the resulting snapshot
    pub fn apply(&self, patch: SessionPatch) -> Session {
        let snapshot = {
            let mut session = self.write();
            patch.apply(&mut session);
            session.clone()
        };
        if snapshot.is_terminal() {
            self.terminal.send_replace(true);
        }
        snapshot
    }

    /// Flag the session for cancellation. Returns false if it already
    /// finished.
    pub fn request_cancel(&self) -> bool {
        {
            let mut session = self.write();
            if session.is_terminal() {
                return false;
            }
            session.cancel_requested = true;
        }
        self.cancel.send_replace(true);
        true
    }

    pub fn is_cancel_requested(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once cancellation has been requested
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Resolves once the session is terminal
    pub async fn finished(&self) {
        let mut rx = self.terminal.subscribe();
        let _ = rx.wait_for(|terminal| *terminal).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Stage(Stage),
    ErrorHandler(Stage),
    Finalize(WorkflowState),
}

struct NodeOutcome {
    next: Node,
    patch: SessionPatch,
}

impl NodeOutcome {
    fn new(next: Node, patch: SessionPatch) -> Self {
        Self { next, patch }
    }

    fn routes_to_finalizer(&self) -> bool {
        matches!(self.next, Node::Finalize(_))
    }
}

/// Drives one session through the pipeline
pub struct Scheduler {
    shared: std::sync::Arc<SharedSession>,
    agents: AgentSet,
    invoker: AgentInvoker,
    observer: ObserverHandle,
    config: SessionConfig,
    snapshots: mpsc::Sender<Session>,
}

impl Scheduler {
    pub fn new(
        shared: std::sync::Arc<SharedSession>,
        agents: AgentSet,
        observer: ObserverHandle,
        config: SessionConfig,
        snapshots: mpsc::Sender<Session>,
    ) -> Self {
        Self {
            shared,
            agents,
            invoker: AgentInvoker::new(observer.clone()),
            observer,
            config,
            snapshots,
        }
    }

    /// Run the session to a terminal state and return the final snapshot
    pub async fn run(self, mut budget: BudgetTracker) -> Session {
        let initial = self.shared.snapshot();
        self.observer.session_started(&initial);
        self.publish(initial);

        let mut node = Node::Stage(Stage::Plan);
        loop {
            let outcome = match node {
                Node::Stage(stage) => self.run_stage(stage, &mut budget).await,
                Node::ErrorHandler(stage) => self.handle_error(stage),
                Node::Finalize(state) => return self.finalize(state, &budget).await,
            };

            let coalesce = outcome.routes_to_finalizer();
            let snapshot = self.shared.apply(outcome.patch);
            // The finalizer publishes the merged terminal snapshot.
            if !coalesce {
                self.publish(snapshot);
            }
            node = outcome.next;
        }
    }

    fn publish(&self, snapshot: Session) {
        self.observer.session_updated(&snapshot);
        if let Err(e) = self.snapshots.try_send(snapshot) {
            debug!(error = %e, "Snapshot not delivered to stream");
        }
    }

    fn cancelled_outcome(&self, stage: Option<Stage>) -> NodeOutcome {
        info!(stage = ?stage, "Cancellation observed");
        NodeOutcome::new(
            Node::Finalize(WorkflowState::Cancelled),
            SessionPatch::new()
                .with(PatchOp::RecordError(WorkflowError::cancelled(stage)))
                .with(PatchOp::Halt),
        )
    }

    fn budget_outcome(&self, stage: Stage, breach: &BudgetBreach, mut patch: SessionPatch) -> NodeOutcome {
        warn!(stage = %stage, breach = %breach, "Budget exceeded");
        metrics().budget_breach();
        patch.push(PatchOp::RecordError(WorkflowError::budget_exceeded(
            Some(stage),
            breach.to_string(),
        )));
        patch.push(PatchOp::Halt);
        NodeOutcome::new(Node::Finalize(WorkflowState::Failed), patch)
    }

    async fn run_stage(&self, stage: Stage, budget: &mut BudgetTracker) -> NodeOutcome {
        if self.shared.is_cancel_requested() {
            return self.cancelled_outcome(Some(stage));
        }
        if let Err(breach) = budget.check_before_stage() {
            return self.budget_outcome(stage, &breach, SessionPatch::new());
        }

        let entered = self.shared.apply(SessionPatch::new().with(PatchOp::EnterStage {
            stage,
            at: Utc::now(),
        }));
        let attempt = entered.retry_budget.retry_count;
        self.publish(entered.clone());

        let ctx = StageContext {
            session: entered,
            stage,
            attempt,
            max_tokens: budget.limits().max_tokens_per_agent,
        };
        let timeout = StageTimeout::new(self.config.timeout_for(stage), budget.remaining_time());
        let agent = self.agents.get(stage).clone();

        let invocation = self
            .invoker
            .invoke(agent.as_ref(), ctx, timeout)
            .instrument(crate::stage_span!(stage = %stage, attempt))
            .await;

        let result = invocation.result;
        let cost = result.metadata.cost;
        let tokens = result.metadata.tokens;

        if self.shared.is_cancel_requested() {
            // The in-flight result is discarded; the spend still happened.
            let mut outcome = self.cancelled_outcome(Some(stage));
            outcome.patch.push(PatchOp::AddSpend { cost, tokens });
            return outcome;
        }

        match invocation.failure {
            None => {
                budget.record(stage, cost, tokens);
                let mut patch = SessionPatch::new().with(PatchOp::WriteResult(result));

                let post_check = budget
                    .check_stage_tokens(stage, tokens)
                    .and_then(|_| budget.check_cost());
                if let Err(breach) = post_check {
                    patch.push(PatchOp::AddSpend { cost, tokens });
                    return self.budget_outcome(stage, &breach, patch);
                }

                patch.push(PatchOp::CompleteStage {
                    stage,
                    cost,
                    tokens,
                });
                patch.push(PatchOp::ResetRetry);
                debug!(stage = %stage, cost, tokens = tokens.total, "Stage completed");

                let next = match stage.next() {
                    Some(next) => Node::Stage(next),
                    None => Node::Finalize(WorkflowState::Completed),
                };
                NodeOutcome::new(next, patch)
            }
            Some(InvocationFailure::BudgetTimeout { remaining_ms }) => {
                let breach = BudgetBreach::Time {
                    elapsed_ms: budget.elapsed().as_millis() as u64,
                    limit_ms: budget.limits().max_execution_time_ms,
                };
                debug!(stage = %stage, remaining_ms, "Stage cut off by execution budget");
                self.budget_outcome(stage, &breach, SessionPatch::new().with(PatchOp::WriteResult(result)))
            }
            Some(failure) => {
                let error = match &failure {
                    InvocationFailure::Timeout { timeout_ms } => {
                        WorkflowError::timeout(stage, *timeout_ms)
                    }
                    other => WorkflowError::stage_failure(stage, other.to_string(), other.is_retryable()),
                };
                NodeOutcome::new(
                    Node::ErrorHandler(stage),
                    SessionPatch::new()
                        .with(PatchOp::WriteResult(result))
                        .with(PatchOp::RecordError(error))
                        .with(PatchOp::IncrementRetry),
                )
            }
        }
    }

    fn handle_error(&self, stage: Stage) -> NodeOutcome {
        if self.shared.is_cancel_requested() {
            return self.cancelled_outcome(Some(stage));
        }

        let session = self.shared.snapshot();
        let retry = session.retry_budget;

        if let Some(error) = session.last_failure().filter(|e| !e.retryable) {
            warn!(stage = %stage, error = %error.message, "Non-retryable stage failure");
            return NodeOutcome::new(
                Node::Finalize(WorkflowState::Failed),
                SessionPatch::new().with(PatchOp::Halt),
            );
        }

        if retry.is_exhausted() {
            warn!(stage = %stage, max_retries = retry.max_retries, "Retry budget exhausted");
            return NodeOutcome::new(
                Node::Finalize(WorkflowState::Failed),
                SessionPatch::new()
                    .with(PatchOp::RecordError(WorkflowError::retry_exhausted(
                        stage,
                        retry.max_retries,
                    )))
                    .with(PatchOp::Halt),
            );
        }

        metrics().stage_retry();
        info!(
            stage = %stage,
            retry_count = retry.retry_count,
            max_retries = retry.max_retries,
            "Retrying stage"
        );
        NodeOutcome::new(
            Node::Stage(stage),
            SessionPatch::new().with(PatchOp::RecordError(WorkflowError::agent_retry(
                stage,
                retry.retry_count,
                retry.max_retries,
            ))),
        )
    }

    async fn finalize(self, state: WorkflowState, budget: &BudgetTracker) -> Session {
        // Every agent is cleaned up exactly once, whatever the outcome.
        for (stage, agent) in self.agents.iter() {
            let cleanup = AssertUnwindSafe(agent.cleanup()).catch_unwind();
            match tokio::time::timeout(self.config.stage_timeout(), cleanup).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => warn!(stage = %stage, "Agent cleanup panicked"),
                Err(_) => warn!(stage = %stage, "Agent cleanup timed out"),
            }
        }

        let terminal = self.shared.apply(SessionPatch::new().with(PatchOp::Finish {
            state,
            at: Utc::now(),
            total_execution_time_ms: budget.elapsed().as_millis() as u64,
        }));

        info!(
            state = %terminal.state,
            total_cost = terminal.metadata.total_cost,
            completed_stages = terminal.metadata.completed_stages.len(),
            "Session finished"
        );
        self.publish(terminal.clone());
        self.observer.session_completed(&terminal);
        terminal
    }
}
