//! Session mutations produced by scheduler nodes
//!
//! Nodes never touch the shared session record directly. Each node returns
//! a [`SessionPatch`] that the scheduler applies under the session lock.

use super::session::{Session, StageResult, TokenCounts, WorkflowError};
use super::state::{Stage, WorkflowState};
use chrono::{DateTime, Utc};
use tracing::warn;

/// A single mutation of a session record
#[derive(Debug, Clone)]
pub enum PatchOp {
    /// Record the stage being entered and move into its state
    EnterStage { stage: Stage, at: DateTime<Utc> },
    /// Write (or overwrite) the result of a stage attempt
    WriteResult(StageResult),
    /// Accept a successful stage: accumulate cost/tokens, advance progress
    CompleteStage {
        stage: Stage,
        cost: f64,
        tokens: TokenCounts,
    },
    /// Add spend that was not accepted as a completed stage
    AddSpend { cost: f64, tokens: TokenCounts },
    RecordError(WorkflowError),
    IncrementRetry,
    ResetRetry,
    /// Stop further stage execution
    Halt,
    /// Move into a terminal state and stamp completion
    Finish {
        state: WorkflowState,
        at: DateTime<Utc>,
        total_execution_time_ms: u64,
    },
}

/// Ordered list of mutations applied atomically
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    ops: Vec<PatchOp>,
}

impl SessionPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, op: PatchOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn push(&mut self, op: PatchOp) {
        self.ops.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[PatchOp] {
        &self.ops
    }

    /// Apply every op in order
    pub fn apply(self, session: &mut Session) {
        for op in self.ops {
            apply_op(session, op);
        }
    }
}

fn set_state(session: &mut Session, to: WorkflowState) {
    if session.state == to {
        return;
    }
    if !session.state.can_transition_to(to) {
        warn!(
            session_id = %session.session_id,
            from = %session.state,
            to = %to,
            "Ignoring invalid state transition"
        );
        return;
    }
    session.state = to;
}

fn apply_op(session: &mut Session, op: PatchOp) {
    match op {
        PatchOp::EnterStage { stage, at } => {
            set_state(session, stage.state());
            session.metadata.current_stage = Some(stage);
            session.metadata.current_stage_started_at = Some(at);
        }
        PatchOp::WriteResult(result) => {
            session.stage_results.insert(result.stage_id, result);
        }
        PatchOp::CompleteStage {
            stage,
            cost,
            tokens,
        } => {
            session.metadata.total_cost += cost;
            session.metadata.total_tokens.add(tokens);
            let expected = session.metadata.completed_stages.len();
            if stage.index() == expected {
                session.metadata.completed_stages.push(stage);
                session
                    .metadata
                    .progress
                    .advance_to(stage.index() as u32 + 1);
            } else if stage.index() > expected {
                warn!(
                    session_id = %session.session_id,
                    stage = %stage,
                    "Stage completed out of pipeline order; not recorded"
                );
            }
        }
        PatchOp::AddSpend { cost, tokens } => {
            session.metadata.total_cost += cost;
            session.metadata.total_tokens.add(tokens);
        }
        PatchOp::RecordError(error) => session.metadata.errors.push(error),
        PatchOp::IncrementRetry => {
            let budget = &mut session.retry_budget;
            budget.retry_count = (budget.retry_count + 1).min(budget.max_retries);
        }
        PatchOp::ResetRetry => session.retry_budget.retry_count = 0,
        PatchOp::Halt => session.should_continue = false,
        PatchOp::Finish {
            state,
            at,
            total_execution_time_ms,
        } => {
            set_state(session, state);
            session.should_continue = false;
            session.metadata.current_stage_started_at = None;
            session.metadata.completed_at = Some(at);
            session.metadata.total_execution_time_ms = Some(total_execution_time_ms);
        }
    }
}
