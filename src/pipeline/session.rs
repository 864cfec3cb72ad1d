//! Session record, stage results and workflow errors
//!
//! A [`Session`] is the single mutable record of one pipeline run. The
//! scheduler owns all writes (through [`SessionPatch`](super::SessionPatch));
//! everybody else sees cloned snapshots.

use super::state::{Stage, WorkflowState};
use crate::error::sanitize_error_message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Default number of consecutive stage failures tolerated before failing
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Token counts for one call or accumulated over a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input: u32,
    pub output: u32,
    pub total: u32,
}

impl TokenCounts {
    pub fn new(input: u32, output: u32) -> Self {
        Self {
            input,
            output,
            total: input + output,
        }
    }

    pub fn add(&mut self, other: TokenCounts) {
        self.input = self.input.saturating_add(other.input);
        self.output = self.output.saturating_add(other.output);
        self.total = self.total.saturating_add(other.total);
    }
}

/// Timing, cost and provenance of one stage attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResultMetadata {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub cost: f64,
    pub provider: Option<String>,
    pub tokens: TokenCounts,
    /// Zero-based attempt number of this result within the current retry run
    pub retry_attempts: u32,
}

/// Outcome of one stage attempt. A retried stage overwrites the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub stage_id: Stage,
    pub success: bool,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: StageResultMetadata,
}

/// Error taxonomy recorded on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowErrorKind {
    StageFailure,
    RetryExhausted,
    BudgetExceeded,
    Timeout,
    Cancelled,
    /// Informational marker that a failed stage is being re-entered
    AgentRetry,
}

/// One entry in a session's error log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowError {
    pub kind: WorkflowErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub timestamp: DateTime<Utc>,
    pub retryable: bool,
}

impl WorkflowError {
    pub fn new(
        kind: WorkflowErrorKind,
        message: impl AsRef<str>,
        stage: Option<Stage>,
        retryable: bool,
    ) -> Self {
        Self {
            kind,
            message: sanitize_error_message(message.as_ref()),
            stage,
            timestamp: Utc::now(),
            retryable,
        }
    }

    pub fn stage_failure(stage: Stage, message: impl AsRef<str>, retryable: bool) -> Self {
        Self::new(WorkflowErrorKind::StageFailure, message, Some(stage), retryable)
    }

    pub fn timeout(stage: Stage, timeout_ms: u64) -> Self {
        Self::new(
            WorkflowErrorKind::Timeout,
            format!("Stage {stage} did not finish within {timeout_ms}ms"),
            Some(stage),
            true,
        )
    }

    pub fn retry_exhausted(stage: Stage, max_retries: u32) -> Self {
        Self::new(
            WorkflowErrorKind::RetryExhausted,
            format!("Stage {stage} failed {max_retries} consecutive times"),
            Some(stage),
            false,
        )
    }

    pub fn agent_retry(stage: Stage, retry_count: u32, max_retries: u32) -> Self {
        Self::new(
            WorkflowErrorKind::AgentRetry,
            format!("Retrying stage {stage} ({retry_count}/{max_retries})"),
            Some(stage),
            true,
        )
    }

    pub fn budget_exceeded(stage: Option<Stage>, message: impl AsRef<str>) -> Self {
        Self::new(WorkflowErrorKind::BudgetExceeded, message, stage, false)
    }

    pub fn cancelled(stage: Option<Stage>) -> Self {
        Self::new(
            WorkflowErrorKind::Cancelled,
            "Session cancelled by request",
            stage,
            false,
        )
    }

    /// Whether this entry records an actual failure rather than a retry notice
    pub fn is_failure(&self) -> bool {
        self.kind != WorkflowErrorKind::AgentRetry
    }
}

/// Pipeline progress; `percentage` is derived from `current_step`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub current_step: u32,
    pub total_steps: u32,
    pub percentage: f64,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            current_step: 0,
            total_steps: Stage::COUNT,
            percentage: 0.0,
        }
    }

    /// Advance to `step`; never moves backwards
    pub fn advance_to(&mut self, step: u32) {
        let step = step.min(self.total_steps);
        if step > self.current_step {
            self.current_step = step;
            self.percentage = f64::from(step) / f64::from(self.total_steps) * 100.0;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.current_step == self.total_steps
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

/// Session bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub started_at: DateTime<Utc>,
    pub current_stage: Option<Stage>,
    pub current_stage_started_at: Option<DateTime<Utc>>,
    pub total_cost: f64,
    pub total_tokens: TokenCounts,
    pub completed_stages: Vec<Stage>,
    pub errors: Vec<WorkflowError>,
    pub progress: Progress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_execution_time_ms: Option<u64>,
}

/// Shared retry budget; reset by every successful stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryBudget {
    pub retry_count: u32,
    pub max_retries: u32,
}

impl RetryBudget {
    pub fn new(max_retries: u32) -> Self {
        Self {
            retry_count: 0,
            max_retries,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// One end-to-end run of the pipeline for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub state: WorkflowState,
    /// Opaque caller payload, never inspected by the core
    pub request: Value,
    pub stage_results: BTreeMap<Stage, StageResult>,
    pub metadata: SessionMetadata,
    pub retry_budget: RetryBudget,
    #[serde(rename = "continue")]
    pub should_continue: bool,
    pub cancel_requested: bool,
}

impl Session {
    pub fn new(session_id: impl Into<String>, request: Value, max_retries: u32) -> Self {
        Self {
            session_id: session_id.into(),
            state: WorkflowState::Initialized,
            request,
            stage_results: BTreeMap::new(),
            metadata: SessionMetadata {
                started_at: Utc::now(),
                current_stage: None,
                current_stage_started_at: None,
                total_cost: 0.0,
                total_tokens: TokenCounts::default(),
                completed_stages: Vec::new(),
                errors: Vec::new(),
                progress: Progress::new(),
                completed_at: None,
                total_execution_time_ms: None,
            },
            retry_budget: RetryBudget::new(max_retries),
            should_continue: true,
            cancel_requested: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Successful results of every stage before `stage`, in pipeline order
    pub fn prior_results(&self, stage: Stage) -> impl Iterator<Item = &StageResult> {
        self.stage_results
            .range(..stage)
            .map(|(_, result)| result)
            .filter(|result| result.success)
    }

    /// Most recent non-informational error
    pub fn last_failure(&self) -> Option<&WorkflowError> {
        self.metadata.errors.iter().rev().find(|e| e.is_failure())
    }
}
