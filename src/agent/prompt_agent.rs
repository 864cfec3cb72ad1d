//! Provider-backed stage agent
//!
//! Renders the request and earlier stage outputs into a prompt, sends it
//! through the provider registry and parses the reply as JSON when it can.

use super::{AgentFactory, AgentOutput, AgentSet, StageAgent, StageContext};
use crate::config::AgentsSection;
use crate::error::AgentError;
use crate::pipeline::Stage;
use crate::registry::{ProviderRegistry, ProviderRequest};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Default instructions for each stage
pub fn default_instructions(stage: Stage) -> &'static str {
    match stage {
        Stage::Plan => {
            "Break the request into a travel plan outline: destinations, dates, \
             travellers and the questions that research must answer. Reply with JSON."
        }
        Stage::Gather => {
            "Using the plan, list the options worth considering for transport, \
             lodging and activities, with rough prices. Reply with JSON."
        }
        Stage::Strategize => {
            "Choose between the gathered options and explain the trade-offs so the \
             itinerary stays inside the traveller's constraints. Reply with JSON."
        }
        Stage::Compile => {
            "Assemble the final day-by-day itinerary from the chosen strategy. \
             Reply with JSON."
        }
    }
}

/// Stage agent that delegates its work to an LLM through the registry
pub struct PromptAgent {
    name: String,
    stage: Stage,
    registry: Arc<ProviderRegistry>,
    system_prompt: String,
    instructions: String,
    temperature: Option<f32>,
    single_provider_only: bool,
    cleaned_up: AtomicBool,
}

impl PromptAgent {
    pub fn new(stage: Stage, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            name: format!("{stage}-agent"),
            stage,
            registry,
            system_prompt: String::new(),
            instructions: default_instructions(stage).to_string(),
            temperature: None,
            single_provider_only: false,
            cleaned_up: AtomicBool::new(false),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    /// Only ever try the best provider for this agent's calls
    pub fn single_provider_only(mut self, single: bool) -> Self {
        self.single_provider_only = single;
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up.load(Ordering::Acquire)
    }

    /// Render the user prompt for one attempt
    pub fn render_prompt(&self, ctx: &StageContext) -> String {
        let mut prompt = String::new();
        let _ = writeln!(prompt, "## Task\n{}\n", self.instructions);
        let _ = writeln!(prompt, "## Request\n{}\n", pretty(ctx.request()));

        let mut prior = ctx.prior_results().peekable();
        if prior.peek().is_some() {
            let _ = writeln!(prompt, "## Earlier stages");
            for result in prior {
                let _ = writeln!(prompt, "### {}\n{}\n", result.stage_id, pretty(&result.data));
            }
        }
        prompt
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Parse a reply as JSON, tolerating a fenced code block around it
fn parse_reply(content: &str) -> Value {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    serde_json::from_str(unfenced).unwrap_or_else(|_| Value::String(content.to_string()))
}

#[async_trait]
impl StageAgent for PromptAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> Result<AgentOutput, AgentError> {
        let mut request = ProviderRequest::new(self.render_prompt(ctx), ctx.max_tokens);
        if !self.system_prompt.is_empty() {
            request = request.with_system(self.system_prompt.clone());
        }
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }

        // The per-agent token ceiling covers prompt and reply together.
        let prompt_tokens = request.estimated_prompt_tokens();
        let reply_tokens = ctx.max_tokens.saturating_sub(prompt_tokens);
        if reply_tokens == 0 {
            return Err(AgentError::fatal(format!(
                "Prompt for {} needs about {prompt_tokens} tokens, leaving no room for a reply \
                 within {} per agent",
                self.stage, ctx.max_tokens
            )));
        }
        request.max_tokens = reply_tokens;
        request.required_tokens = prompt_tokens + reply_tokens;

        let response = self
            .registry
            .execute(&request, self.single_provider_only)
            .await?;

        debug!(
            agent = %self.name,
            provider = %response.provider_used,
            tokens = response.tokens.total,
            reply_limit = reply_tokens,
            fallbacks = response.fallbacks_used.len(),
            "Stage reply received"
        );

        Ok(AgentOutput {
            data: parse_reply(&response.content),
            cost: response.cost,
            provider: Some(response.provider_used),
            tokens: response.tokens,
        })
    }

    fn validate_input(&self, payload: &Value) -> bool {
        match payload {
            Value::Object(map) => !map.is_empty(),
            Value::String(s) => !s.trim().is_empty(),
            _ => false,
        }
    }

    async fn cleanup(&self) {
        if !self.cleaned_up.swap(true, Ordering::AcqRel) {
            debug!(agent = %self.name, "Agent cleaned up");
        }
    }
}

/// Builds a fresh set of [`PromptAgent`]s for every session
pub struct PromptAgentFactory {
    registry: Arc<ProviderRegistry>,
    agents: AgentsSection,
}

impl PromptAgentFactory {
    pub fn new(registry: Arc<ProviderRegistry>, agents: AgentsSection) -> Self {
        Self { registry, agents }
    }
}

impl AgentFactory for PromptAgentFactory {
    fn create(&self, session_id: &str) -> AgentSet {
        debug!(session_id, "Creating prompt agents");
        AgentSet::from_fn(|stage| {
            let instructions = self
                .agents
                .instructions
                .get(stage.as_str())
                .cloned()
                .unwrap_or_else(|| default_instructions(stage).to_string());

            Arc::new(
                PromptAgent::new(stage, self.registry.clone())
                    .with_system_prompt(self.agents.system_prompt.clone())
                    .with_instructions(instructions)
                    .with_temperature(self.agents.temperature)
                    .single_provider_only(self.agents.single_provider_only),
            )
        })
    }
}
