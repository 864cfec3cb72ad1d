//! Mock implementations for testing
//!
//! Scriptable LLM backends, stage agents and observers so the registry and
//! scheduler can be exercised without network access.

use crate::agent::{AgentOutput, AgentSet, StageAgent, StageContext};
use crate::error::AgentError;
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmError, LlmProvider, TokenUsage,
};
use crate::observability::WorkflowObserver;
use crate::pipeline::{Session, Stage, StageResult, TokenCounts, WorkflowState};
use crate::registry::ProviderSpec;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Provider spec with generous limits for tests
pub fn mock_spec(name: &str, priority: u32) -> ProviderSpec {
    ProviderSpec {
        name: name.to_string(),
        model: "mock-model".to_string(),
        priority,
        max_tokens: 8000,
        cost_per_token: 0.0001,
        timeout_ms: 1000,
    }
}

/// Mock LLM provider for testing
#[derive(Debug)]
pub struct MockLlmProvider {
    responses: Vec<String>,
    calls: AtomicUsize,
    /// Calls that fail before responses are served
    failures_before_success: usize,
    delay: Option<Duration>,
    report_usage: bool,
    healthy: AtomicBool,
    /// Reply with as many tokens as allowed, up to this cap
    fill_up_to: Option<u32>,
    requested_limits: Mutex<Vec<Option<u32>>>,
}

impl MockLlmProvider {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            calls: AtomicUsize::new(0),
            failures_before_success: 0,
            delay: None,
            report_usage: true,
            healthy: AtomicBool::new(true),
            fill_up_to: None,
            requested_limits: Mutex::new(Vec::new()),
        }
    }

    /// Reply with `min(max_tokens, cap)` tokens of filler and no usage
    /// report, so the registry's estimate counts exactly what was allowed
    pub fn filling_replies(cap: u32) -> Self {
        let mut mock = Self::new(vec![]).without_usage();
        mock.fill_up_to = Some(cap);
        mock
    }

    pub fn single_response(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    /// Every call and health check fails
    pub fn with_failure() -> Self {
        let mock = Self::new(vec![]).failing_first(usize::MAX);
        mock.set_healthy(false);
        mock
    }

    /// Fail the first `times` calls, then answer with `response`
    pub fn failing_times(times: usize, response: impl Into<String>) -> Self {
        Self::single_response(response).failing_first(times)
    }

    fn failing_first(mut self, times: usize) -> Self {
        self.failures_before_success = times;
        self
    }

    /// Sleep before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Omit token usage from responses
    pub fn without_usage(mut self) -> Self {
        self.report_usage = false;
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }

    /// `max_tokens` of every request received, in call order
    pub fn requested_limits(&self) -> Vec<Option<u32>> {
        self.requested_limits
            .lock()
            .map(|limits| limits.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut limits) = self.requested_limits.lock() {
            limits.push(request.max_tokens);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if call < self.failures_before_success {
            return Err(LlmError::RequestFailed("Mock LLM failure".to_string()));
        }

        let served = call - self.failures_before_success;
        let content = if let Some(cap) = self.fill_up_to {
            let tokens = request.max_tokens.unwrap_or(cap).min(cap) as usize;
            "x".repeat(tokens * 4)
        } else if self.responses.is_empty() {
            "Mock response".to_string()
        } else {
            self.responses[served % self.responses.len()].clone()
        };

        Ok(CompletionResponse {
            content: Some(content),
            model: request.model,
            usage: self.report_usage.then_some(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            finish_reason: FinishReason::Stop,
        })
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        if self.healthy.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(LlmError::RequestFailed(
                "Mock health check failure".to_string(),
            ))
        }
    }
}

#[derive(Debug, Clone)]
enum StepOutcome {
    Succeed {
        data: Value,
        cost: f64,
        tokens: TokenCounts,
    },
    Fail {
        message: String,
        retryable: bool,
    },
}

/// One scripted agent attempt
#[derive(Debug, Clone)]
pub struct AgentStep {
    outcome: StepOutcome,
    delay: Option<Duration>,
}

impl AgentStep {
    pub fn succeed() -> Self {
        Self::succeed_with(json!({"ok": true}), 0.0, TokenCounts::new(10, 5))
    }

    pub fn succeed_with_cost(cost: f64) -> Self {
        Self::succeed_with(json!({"ok": true}), cost, TokenCounts::new(10, 5))
    }

    pub fn succeed_with(data: Value, cost: f64, tokens: TokenCounts) -> Self {
        Self {
            outcome: StepOutcome::Succeed { data, cost, tokens },
            delay: None,
        }
    }

    /// Success whose data names the session and stage that produced it
    pub fn marked(marker: &str, stage: Stage) -> Self {
        Self::succeed_with(
            json!({"session": marker, "stage": stage.as_str()}),
            0.0,
            TokenCounts::new(10, 5),
        )
    }

    /// Retryable failure
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            outcome: StepOutcome::Fail {
                message: message.into(),
                retryable: true,
            },
            delay: None,
        }
    }

    /// Failure the agent marks as not retryable
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            outcome: StepOutcome::Fail {
                message: message.into(),
                retryable: false,
            },
            delay: None,
        }
    }

    /// Sleep this long before producing the outcome
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Stage agent that plays back a script of outcomes
#[derive(Debug)]
pub struct ScriptedAgent {
    name: String,
    steps: Mutex<VecDeque<AgentStep>>,
    /// Played once the script runs out
    fallback: AgentStep,
    accept_input: bool,
    executions: AtomicUsize,
    cleanups: AtomicUsize,
    attempts_seen: Mutex<Vec<u32>>,
    prior_stages_seen: Mutex<Vec<Vec<Stage>>>,
    requests_seen: Mutex<Vec<Value>>,
    prior_data_seen: Mutex<Vec<Value>>,
}

impl ScriptedAgent {
    pub fn new(name: impl Into<String>, steps: Vec<AgentStep>) -> Self {
        Self {
            name: name.into(),
            steps: Mutex::new(steps.into()),
            fallback: AgentStep::succeed(),
            accept_input: true,
            executions: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
            attempts_seen: Mutex::new(Vec::new()),
            prior_stages_seen: Mutex::new(Vec::new()),
            requests_seen: Mutex::new(Vec::new()),
            prior_data_seen: Mutex::new(Vec::new()),
        }
    }

    /// Agent that always plays `step`
    pub fn always(name: impl Into<String>, step: AgentStep) -> Self {
        Self::new(name, vec![]).then_always(step)
    }

    pub fn then_always(mut self, step: AgentStep) -> Self {
        self.fallback = step;
        self
    }

    /// Reject every request payload in `validate_input`
    pub fn rejecting_input(mut self) -> Self {
        self.accept_input = false;
        self
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::Acquire)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::Acquire)
    }

    /// Attempt numbers passed in, in call order
    pub fn attempts_seen(&self) -> Vec<u32> {
        self.attempts_seen
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    /// Stages whose successful results were visible on each call
    pub fn prior_stages_seen(&self) -> Vec<Vec<Stage>> {
        self.prior_stages_seen
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Request payload passed in on each call
    pub fn requests_seen(&self) -> Vec<Value> {
        self.requests_seen
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Data of every earlier stage result visible across all calls
    pub fn prior_data_seen(&self) -> Vec<Value> {
        self.prior_data_seen
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    fn next_step(&self) -> AgentStep {
        self.steps
            .lock()
            .ok()
            .and_then(|mut steps| steps.pop_front())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl StageAgent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> Result<AgentOutput, AgentError> {
        self.executions.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut attempts) = self.attempts_seen.lock() {
            attempts.push(ctx.attempt);
        }
        if let Ok(mut prior) = self.prior_stages_seen.lock() {
            prior.push(ctx.prior_results().map(|r| r.stage_id).collect());
        }
        if let Ok(mut requests) = self.requests_seen.lock() {
            requests.push(ctx.request().clone());
        }
        if let Ok(mut data) = self.prior_data_seen.lock() {
            data.extend(ctx.prior_results().map(|r| r.data.clone()));
        }

        let step = self.next_step();
        if let Some(delay) = step.delay {
            tokio::time::sleep(delay).await;
        }

        match step.outcome {
            StepOutcome::Succeed { data, cost, tokens } => Ok(AgentOutput {
                data,
                cost,
                provider: Some("scripted".to_string()),
                tokens,
            }),
            StepOutcome::Fail { message, retryable } => Err(AgentError::Failed { message, retryable }),
        }
    }

    fn validate_input(&self, _payload: &Value) -> bool {
        self.accept_input
    }

    async fn cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::AcqRel);
    }
}

/// Four scripted agents with handles kept for assertions
#[derive(Clone)]
pub struct ScriptedAgents {
    pub plan: Arc<ScriptedAgent>,
    pub gather: Arc<ScriptedAgent>,
    pub strategize: Arc<ScriptedAgent>,
    pub compile: Arc<ScriptedAgent>,
}

impl ScriptedAgents {
    /// Every agent succeeds on every call
    pub fn succeeding() -> Self {
        Self::from_fn(|stage| ScriptedAgent::new(stage.as_str(), vec![]))
    }

    /// Every agent succeeds with data tagged `{"session": marker, "stage": ..}`
    pub fn marked(marker: &str) -> Self {
        Self::from_fn(|stage| {
            ScriptedAgent::always(stage.as_str(), AgentStep::marked(marker, stage))
        })
    }

    pub fn from_fn(mut make: impl FnMut(Stage) -> ScriptedAgent) -> Self {
        Self {
            plan: Arc::new(make(Stage::Plan)),
            gather: Arc::new(make(Stage::Gather)),
            strategize: Arc::new(make(Stage::Strategize)),
            compile: Arc::new(make(Stage::Compile)),
        }
    }

    /// Replace the agent for one stage
    pub fn with(mut self, stage: Stage, agent: ScriptedAgent) -> Self {
        let agent = Arc::new(agent);
        match stage {
            Stage::Plan => self.plan = agent,
            Stage::Gather => self.gather = agent,
            Stage::Strategize => self.strategize = agent,
            Stage::Compile => self.compile = agent,
        }
        self
    }

    pub fn get(&self, stage: Stage) -> &Arc<ScriptedAgent> {
        match stage {
            Stage::Plan => &self.plan,
            Stage::Gather => &self.gather,
            Stage::Strategize => &self.strategize,
            Stage::Compile => &self.compile,
        }
    }

    pub fn agent_set(&self) -> AgentSet {
        AgentSet::from_fn(|stage| self.get(stage).clone() as Arc<dyn StageAgent>)
    }

    /// Cleanup calls per agent, in pipeline order
    pub fn cleanups(&self) -> [usize; 4] {
        Stage::ALL.map(|stage| self.get(stage).cleanups())
    }
}

/// Observer that records every event it sees
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<String>>,
    snapshots: Mutex<Vec<Session>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Snapshots delivered through `session_updated`
    pub fn snapshots(&self) -> Vec<Session> {
        self.snapshots.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Terminal states reported through `session_completed`
    pub fn completed_states(&self) -> Vec<WorkflowState> {
        self.events()
            .iter()
            .filter_map(|e| e.strip_prefix("completed:"))
            .filter_map(|state| serde_json::from_value(Value::String(state.to_string())).ok())
            .collect()
    }

    fn record(&self, event: String) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl WorkflowObserver for RecordingObserver {
    fn session_started(&self, session: &Session) {
        self.record(format!("started:{}", session.session_id));
    }

    fn session_updated(&self, session: &Session) {
        if let Ok(mut snapshots) = self.snapshots.lock() {
            snapshots.push(session.clone());
        }
    }

    fn session_completed(&self, session: &Session) {
        self.record(format!("completed:{}", session.state));
    }

    fn agent_started(&self, _session_id: &str, stage: Stage, attempt: u32) {
        self.record(format!("agent_started:{stage}:{attempt}"));
    }

    fn agent_completed(&self, _session_id: &str, result: &StageResult) {
        self.record(format!("agent_completed:{}:{}", result.stage_id, result.success));
    }
}
