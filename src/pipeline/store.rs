//! Session store
//!
//! Holds one shared record per session and spawns its scheduler run.
//! Sessions never share state; the only thing they contend for is a
//! process-wide permit limiting how many run at once.

use super::patch::{PatchOp, SessionPatch};
use super::scheduler::{snapshot_capacity, Scheduler, SharedSession};
use super::session::{Session, WorkflowError, WorkflowErrorKind};
use super::state::WorkflowState;
use super::stream::SessionStream;
use crate::agent::AgentFactory;
use crate::budget::BudgetTracker;
use crate::config::SessionConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::observability::metrics::{metrics, SessionOutcome};
use crate::observability::observer::ObserverHandle;
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tracing::{error, info, Instrument};
use uuid::Uuid;

struct SessionEntry {
    shared: Arc<SharedSession>,
    stream: Mutex<Option<mpsc::Receiver<Session>>>,
    task_failure: Mutex<Option<String>>,
}

impl SessionEntry {
    /// With nobody subscribed, keep only the terminal snapshot buffered so a
    /// finished session does not hold its whole history.
    fn compact_unclaimed_stream(&self, snapshots: &mpsc::Sender<Session>, terminal: &Session) {
        let Ok(mut stream) = self.stream.lock() else {
            return;
        };
        if let Some(rx) = stream.as_mut() {
            while rx.try_recv().is_ok() {}
            let _ = snapshots.try_send(terminal.clone());
        }
    }

    /// Force a session whose scheduler panicked to FAILED and publish that
    /// terminal snapshot, unless the run had already finished.
    fn fail_after_panic(&self, snapshots: &mpsc::Sender<Session>, started: Instant) -> Session {
        error!("Scheduler task panicked; failing session");
        if let Ok(mut failure) = self.task_failure.lock() {
            *failure = Some("scheduler task panicked".to_string());
        }
        if self.shared.is_terminal() {
            return self.shared.snapshot();
        }

        let stage = self.shared.snapshot().metadata.current_stage;
        let failed = self.shared.apply(
            SessionPatch::new()
                .with(PatchOp::RecordError(WorkflowError::new(
                    WorkflowErrorKind::StageFailure,
                    "Scheduler task panicked",
                    stage,
                    false,
                )))
                .with(PatchOp::Halt)
                .with(PatchOp::Finish {
                    state: WorkflowState::Failed,
                    at: Utc::now(),
                    total_execution_time_ms: started.elapsed().as_millis() as u64,
                }),
        );
        let _ = snapshots.try_send(failed.clone());
        failed
    }

    #[cfg(test)]
    fn buffered_snapshots(&self) -> Option<usize> {
        self.stream.lock().ok()?.as_ref().map(|rx| rx.len())
    }
}

/// Registry of sessions keyed by id
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    factory: Arc<dyn AgentFactory>,
    observer: ObserverHandle,
    permits: Arc<Semaphore>,
    defaults: SessionConfig,
}

fn outcome_of(state: WorkflowState) -> SessionOutcome {
    match state {
        WorkflowState::Completed => SessionOutcome::Completed,
        WorkflowState::Cancelled => SessionOutcome::Cancelled,
        _ => SessionOutcome::Failed,
    }
}

impl SessionStore {
    /// `defaults.budget.max_concurrent_workflows` fixes the process-wide
    /// concurrency limit.
    pub fn new(factory: Arc<dyn AgentFactory>, defaults: SessionConfig) -> Self {
        let permits = Arc::new(Semaphore::new(
            defaults.budget.max_concurrent_workflows.max(1),
        ));
        Self {
            sessions: RwLock::new(HashMap::new()),
            factory,
            observer: ObserverHandle::default(),
            permits,
            defaults,
        }
    }

    pub fn with_observer(mut self, observer: ObserverHandle) -> Self {
        self.observer = observer;
        self
    }

    pub fn defaults(&self) -> &SessionConfig {
        &self.defaults
    }

    fn entry(&self, session_id: &str) -> PipelineResult<Arc<SessionEntry>> {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(session_id)
            .cloned()
            .ok_or_else(|| PipelineError::SessionNotFound(session_id.to_string()))
    }

    /// Start a session with the store's default settings
    pub fn start(&self, request: Value) -> PipelineResult<String> {
        self.start_session(request, self.defaults.clone())
    }

    /// Register a new session and start running it in the background.
    /// Returns the generated session id immediately.
    pub fn start_session(&self, request: Value, config: SessionConfig) -> PipelineResult<String> {
        let session_id = Uuid::new_v4().to_string();
        self.start_session_with_id(session_id.clone(), request, config)?;
        Ok(session_id)
    }

    /// Like [`start_session`](Self::start_session) with a caller-chosen id
    pub fn start_session_with_id(
        &self,
        session_id: impl Into<String>,
        request: Value,
        config: SessionConfig,
    ) -> PipelineResult<()> {
        let session_id = session_id.into();
        config.validate()?;

        let shared = Arc::new(SharedSession::new(Session::new(
            session_id.clone(),
            request,
            config.max_retries,
        )));
        let (tx, rx) = mpsc::channel(snapshot_capacity(config.max_retries));
        let entry = Arc::new(SessionEntry {
            shared: shared.clone(),
            stream: Mutex::new(Some(rx)),
            task_failure: Mutex::new(None),
        });

        {
            let mut sessions = self
                .sessions
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if sessions.contains_key(&session_id) {
                return Err(PipelineError::DuplicateSession(session_id));
            }
            sessions.insert(session_id.clone(), entry.clone());
        }

        let agents = self.factory.create(&session_id);
        let observer = self.observer.clone();
        let permits = self.permits.clone();
        metrics().session_started();
        info!(session_id = %session_id, max_retries = config.max_retries, "Session registered");

        let span = crate::session_span!(session_id = %session_id);
        tokio::spawn(
            async move {
                let permit = tokio::select! {
                    biased;
                    permit = permits.acquire_owned() => permit.ok(),
                    _ = shared.cancelled() => None,
                };
                let was_running = permit.is_some();
                if was_running {
                    metrics().session_running();
                }

                let started = Instant::now();
                let budget = BudgetTracker::start(config.budget.clone());
                let snapshots = tx.clone();
                let scheduler = Scheduler::new(shared.clone(), agents, observer, config, tx);

                let terminal = match AssertUnwindSafe(scheduler.run(budget)).catch_unwind().await {
                    Ok(terminal) => terminal,
                    Err(_) => entry.fail_after_panic(&snapshots, started),
                };

                entry.compact_unclaimed_stream(&snapshots, &terminal);
                drop(snapshots);
                drop(permit);
                metrics().session_finished(outcome_of(terminal.state), started.elapsed(), was_running);
            }
            .instrument(span),
        );

        Ok(())
    }

    /// Read-only snapshot of a session
    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.entry(session_id).ok().map(|entry| entry.shared.snapshot())
    }

    /// Request cooperative cancellation. Returns false if the session had
    /// already finished.
    pub fn cancel_session(&self, session_id: &str) -> PipelineResult<bool> {
        let entry = self.entry(session_id)?;
        let requested = entry.shared.request_cancel();
        if requested {
            info!(session_id = %session_id, "Cancellation requested");
        }
        Ok(requested)
    }

    /// Take the snapshot stream of a session. Only one stream exists per
    /// session. Taken after the session finished, it yields just the
    /// terminal snapshot.
    pub fn stream_session(&self, session_id: &str) -> PipelineResult<SessionStream> {
        let entry = self.entry(session_id)?;
        let rx = entry
            .stream
            .lock()
            .ok()
            .and_then(|mut stream| stream.take())
            .ok_or_else(|| PipelineError::StreamUnavailable(session_id.to_string()))?;
        Ok(SessionStream::new(session_id.to_string(), rx))
    }

    /// Wait until the session is terminal and return its final snapshot
    pub async fn wait(&self, session_id: &str) -> PipelineResult<Session> {
        let entry = self.entry(session_id)?;
        entry.shared.finished().await;

        let failure = entry.task_failure.lock().ok().and_then(|f| f.clone());
        match failure {
            Some(message) => Err(PipelineError::TaskFailed(message)),
            None => Ok(entry.shared.snapshot()),
        }
    }

    /// Snapshots of every known session
    pub fn list_sessions(&self) -> Vec<Session> {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(|entry| entry.shared.snapshot())
            .collect()
    }

    /// Ids of sessions that have not reached a terminal state
    pub fn active_sessions(&self) -> Vec<String> {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|(_, entry)| !entry.shared.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Forget terminal sessions; returns how many were dropped
    pub fn prune_finished(&self) -> usize {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = sessions.len();
        sessions.retain(|_, entry| !entry.shared.is_terminal());
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentSet;
    use crate::budget::BudgetLimits;
    use crate::pipeline::Stage;
    use crate::testing::{AgentStep, ScriptedAgent, ScriptedAgents};
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    fn store_with(agents: ScriptedAgents, max_concurrent: usize) -> SessionStore {
        let defaults = SessionConfig {
            budget: BudgetLimits {
                max_concurrent_workflows: max_concurrent,
                ..Default::default()
            },
            ..Default::default()
        };
        let factory = move |_: &str| -> AgentSet { agents.agent_set() };
        SessionStore::new(Arc::new(factory), defaults)
    }

    #[tokio::test]
    async fn test_start_and_wait() {
        let store = store_with(ScriptedAgents::succeeding(), 2);
        let id = store.start(json!({"destination": "Oslo"})).unwrap();

        let terminal = store.wait(&id).await.unwrap();

        assert_eq!(terminal.state, WorkflowState::Completed);
        assert_eq!(terminal.request, json!({"destination": "Oslo"}));
        assert_eq!(store.get_session(&id), Some(terminal));
        assert!(store.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let store = store_with(ScriptedAgents::succeeding(), 2);
        store
            .start_session_with_id("fixed", json!({}), SessionConfig::default())
            .unwrap();

        let err = store
            .start_session_with_id("fixed", json!({}), SessionConfig::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateSession(id) if id == "fixed"));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let store = store_with(ScriptedAgents::succeeding(), 2);
        let config = SessionConfig {
            stage_timeout_ms: 0,
            ..Default::default()
        };

        assert!(matches!(
            store.start_session(json!({}), config),
            Err(PipelineError::Config(_))
        ));
        assert!(store.list_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let store = store_with(ScriptedAgents::succeeding(), 2);

        assert!(store.get_session("nope").is_none());
        assert!(matches!(
            store.cancel_session("nope"),
            Err(PipelineError::SessionNotFound(_))
        ));
        assert!(matches!(
            store.stream_session("nope"),
            Err(PipelineError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_is_not_restartable() {
        let store = store_with(ScriptedAgents::succeeding(), 2);
        let id = store.start(json!({})).unwrap();

        let stream = store.stream_session(&id).unwrap();
        assert!(matches!(
            store.stream_session(&id),
            Err(PipelineError::StreamUnavailable(_))
        ));

        let snapshots: Vec<Session> = stream.collect().await;
        assert_eq!(
            snapshots.last().map(|s| s.state),
            Some(WorkflowState::Completed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_run() {
        let agents = ScriptedAgents::succeeding().with(
            Stage::Gather,
            ScriptedAgent::always("gather", AgentStep::succeed().after(Duration::from_secs(2))),
        );
        let store = store_with(agents.clone(), 2);
        let id = store.start(json!({})).unwrap();

        let mut stream = store.stream_session(&id).unwrap();
        while let Some(snapshot) = stream.next().await {
            if snapshot.state == WorkflowState::Gathering {
                assert!(store.cancel_session(&id).unwrap());
                break;
            }
        }

        let terminal = store.wait(&id).await.unwrap();
        assert_eq!(terminal.state, WorkflowState::Cancelled);
        assert!(terminal.cancel_requested);
        assert!(!terminal.stage_results.contains_key(&Stage::Gather));
        assert_eq!(agents.cleanups(), [1, 1, 1, 1]);
        assert_eq!(agents.strategize.executions(), 0);
        assert!(!store.cancel_session(&id).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_queued_runs_no_agent() {
        let slow = ScriptedAgents::succeeding().with(
            Stage::Plan,
            ScriptedAgent::always("plan", AgentStep::succeed().after(Duration::from_secs(5))),
        );
        let store = store_with(slow.clone(), 1);
        let first = store.start(json!({"n": 1})).unwrap();
        let second = store.start(json!({"n": 2})).unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            store.get_session(&second).map(|s| s.state),
            Some(WorkflowState::Initialized)
        );
        store.cancel_session(&second).unwrap();

        let cancelled = store.wait(&second).await.unwrap();
        assert_eq!(cancelled.state, WorkflowState::Cancelled);
        assert!(cancelled.stage_results.is_empty());

        let completed = store.wait(&first).await.unwrap();
        assert_eq!(completed.state, WorkflowState::Completed);
        assert_eq!(slow.plan.executions(), 1);
    }

    #[tokio::test]
    async fn test_prune_finished() {
        let store = store_with(ScriptedAgents::succeeding(), 2);
        let id = store.start(json!({})).unwrap();
        store.wait(&id).await.unwrap();

        assert_eq!(store.prune_finished(), 1);
        assert!(store.get_session(&id).is_none());
    }

    async fn compacted_entry(store: &SessionStore, id: &str) -> Arc<SessionEntry> {
        let entry = store.entry(id).unwrap();
        for _ in 0..100 {
            if entry.buffered_snapshots() == Some(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        entry
    }

    #[tokio::test]
    async fn test_unclaimed_stream_keeps_only_terminal_snapshot() {
        let store = store_with(ScriptedAgents::succeeding(), 2);
        let id = store.start(json!({})).unwrap();
        store.wait(&id).await.unwrap();

        let entry = compacted_entry(&store, &id).await;
        assert_eq!(entry.buffered_snapshots(), Some(1));

        let snapshots: Vec<Session> = store.stream_session(&id).unwrap().collect().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].state, WorkflowState::Completed);
    }

    fn bare_entry(capacity: usize) -> (SessionEntry, mpsc::Sender<Session>) {
        let (tx, rx) = mpsc::channel(capacity);
        let entry = SessionEntry {
            shared: Arc::new(SharedSession::new(Session::new("s-panic", json!({}), 3))),
            stream: Mutex::new(Some(rx)),
            task_failure: Mutex::new(None),
        };
        (entry, tx)
    }

    #[tokio::test]
    async fn test_panicked_run_publishes_failed_terminal_snapshot() {
        let (entry, tx) = bare_entry(snapshot_capacity(3));

        let failed = entry.fail_after_panic(&tx, Instant::now());
        drop(tx);

        assert_eq!(failed.state, WorkflowState::Failed);
        assert!(entry.task_failure.lock().unwrap().is_some());
        let rx = entry.stream.lock().unwrap().take().unwrap();
        let snapshots: Vec<Session> = SessionStream::new("s-panic".to_string(), rx).collect().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].state, WorkflowState::Failed);
        assert_eq!(
            snapshots[0].last_failure().map(|e| e.kind),
            Some(WorkflowErrorKind::StageFailure)
        );
    }

    #[tokio::test]
    async fn test_panic_after_finish_keeps_terminal_state() {
        let (entry, tx) = bare_entry(4);
        entry.shared.apply(SessionPatch::new().with(PatchOp::Finish {
            state: WorkflowState::Completed,
            at: Utc::now(),
            total_execution_time_ms: 1,
        }));

        let terminal = entry.fail_after_panic(&tx, Instant::now());

        assert_eq!(terminal.state, WorkflowState::Completed);
        assert_eq!(entry.buffered_snapshots(), Some(0));
    }
}
