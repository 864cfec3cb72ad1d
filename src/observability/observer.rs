//! Workflow observers
//!
//! Synchronous hooks fired as sessions and agent calls progress. Observers
//! are notified from the session task, so they must be quick. A panicking
//! observer is logged and otherwise ignored.

use crate::pipeline::{Session, Stage, StageResult};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hooks for session and agent lifecycle events. All methods default to
/// doing nothing.
pub trait WorkflowObserver: Send + Sync {
    fn session_started(&self, _session: &Session) {}

    /// Fired for every snapshot the scheduler publishes
    fn session_updated(&self, _session: &Session) {}

    fn session_completed(&self, _session: &Session) {}

    fn agent_started(&self, _session_id: &str, _stage: Stage, _attempt: u32) {}

    fn agent_completed(&self, _session_id: &str, _result: &StageResult) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpObserver;

impl WorkflowObserver for NoOpObserver {}

/// Observer that turns lifecycle events into log lines
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl WorkflowObserver for TracingObserver {
    fn session_started(&self, session: &Session) {
        info!(session_id = %session.session_id, "Session started");
    }

    fn session_updated(&self, session: &Session) {
        debug!(
            session_id = %session.session_id,
            state = %session.state,
            percentage = session.metadata.progress.percentage,
            "Session updated"
        );
    }

    fn session_completed(&self, session: &Session) {
        info!(
            session_id = %session.session_id,
            state = %session.state,
            total_cost = session.metadata.total_cost,
            total_tokens = session.metadata.total_tokens.total,
            execution_time_ms = session.metadata.total_execution_time_ms.unwrap_or_default(),
            "Session finished"
        );
    }

    fn agent_started(&self, session_id: &str, stage: Stage, attempt: u32) {
        debug!(session_id, stage = %stage, attempt, "Agent started");
    }

    fn agent_completed(&self, session_id: &str, result: &StageResult) {
        debug!(
            session_id,
            stage = %result.stage_id,
            success = result.success,
            duration_ms = result.metadata.duration_ms,
            "Agent finished"
        );
    }
}

/// Shared observer with panic containment around every hook
#[derive(Clone)]
pub struct ObserverHandle {
    inner: Arc<dyn WorkflowObserver>,
}

impl ObserverHandle {
    pub fn new(observer: Arc<dyn WorkflowObserver>) -> Self {
        Self { inner: observer }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoOpObserver))
    }

    fn notify(&self, hook: &'static str, f: impl FnOnce(&dyn WorkflowObserver)) {
        let observer = self.inner.as_ref();
        if catch_unwind(AssertUnwindSafe(|| f(observer))).is_err() {
            warn!(hook, "Workflow observer panicked; ignoring");
        }
    }

    pub fn session_started(&self, session: &Session) {
        self.notify("session_started", |o| o.session_started(session));
    }

    pub fn session_updated(&self, session: &Session) {
        self.notify("session_updated", |o| o.session_updated(session));
    }

    pub fn session_completed(&self, session: &Session) {
        self.notify("session_completed", |o| o.session_completed(session));
    }

    pub fn agent_started(&self, session_id: &str, stage: Stage, attempt: u32) {
        self.notify("agent_started", |o| o.agent_started(session_id, stage, attempt));
    }

    pub fn agent_completed(&self, session_id: &str, result: &StageResult) {
        self.notify("agent_completed", |o| o.agent_completed(session_id, result));
    }
}

impl Default for ObserverHandle {
    fn default() -> Self {
        Self::noop()
    }
}

impl<T: WorkflowObserver + 'static> From<Arc<T>> for ObserverHandle {
    fn from(observer: Arc<T>) -> Self {
        Self::new(observer)
    }
}
