//! Provider registry and failover manager
//!
//! Holds the prioritized set of interchangeable backends, tracks their
//! health, and runs each call down an ordered fallback chain. One registry
//! is shared by every session in the process; each provider record has its
//! own statistics lock.

pub mod health_probe;
pub mod record;

pub use health_probe::{spawn_health_probes, ProbeReport};
pub use record::{
    chain_order, order_chain, ProviderSnapshot, ProviderSpec, ProviderStats,
    UNAVAILABLE_ERROR_THRESHOLD,
};

use crate::llm::provider::{estimate_tokens, CompletionRequest, LlmError, LlmProvider, Message};
use crate::observability::metrics::metrics;
use crate::pipeline::TokenCounts;
use record::ProviderEntry;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Failover errors
#[derive(Debug, Clone, Error)]
pub enum FailoverError {
    #[error("No available provider can serve {required_tokens} tokens")]
    NoEligibleProvider { required_tokens: u32 },

    #[error("All providers exhausted; last error: {last_error}")]
    AllProvidersExhausted {
        attempted: Vec<String>,
        last_error: LlmError,
    },

    #[error("Provider already registered: {0}")]
    DuplicateProvider(String),
}

/// One logical call to run against the fallback chain
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub system: Option<String>,
    pub prompt: String,
    /// Completion limit sent to the backend
    pub max_tokens: u32,
    /// Context a provider must fit: prompt plus reply. Defaults to `max_tokens`.
    pub required_tokens: u32,
    pub temperature: Option<f32>,
}

impl ProviderRequest {
    pub fn new(prompt: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            max_tokens,
            required_tokens: max_tokens,
            temperature: None,
        }
    }

    pub fn with_required_tokens(mut self, required_tokens: u32) -> Self {
        self.required_tokens = required_tokens;
        self
    }

    /// Estimated size of the prompt as sent, system message included
    pub fn estimated_prompt_tokens(&self) -> u32 {
        estimate_tokens(&self.to_completion("").prompt_text())
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    fn to_completion(&self, model: &str) -> CompletionRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system {
            messages.push(Message::system(system.clone()));
        }
        messages.push(Message::user(self.prompt.clone()));

        CompletionRequest {
            messages,
            model: model.to_string(),
            max_tokens: Some(self.max_tokens),
            temperature: self.temperature,
        }
    }
}

/// Successful result of a failover call
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub content: String,
    pub provider_used: String,
    pub tokens: TokenCounts,
    pub cost: f64,
    /// Providers that failed before `provider_used`, in the order tried
    pub fallbacks_used: Vec<String>,
}

/// Prioritized set of backends with health tracking
pub struct ProviderRegistry {
    entries: Vec<Arc<ProviderEntry>>,
    fallback_to_all: bool,
    probing: AtomicBool,
}

impl ProviderRegistry {
    /// Create an empty registry. With `fallback_to_all` a call walks the
    /// whole chain; otherwise only the best provider is tried.
    pub fn new(fallback_to_all: bool) -> Self {
        Self {
            entries: Vec::new(),
            fallback_to_all,
            probing: AtomicBool::new(false),
        }
    }

    /// Register a backend under `spec.name`
    pub fn register(
        &mut self,
        spec: ProviderSpec,
        backend: Arc<dyn LlmProvider>,
    ) -> Result<(), FailoverError> {
        if self.entries.iter().any(|e| e.spec.name == spec.name) {
            return Err(FailoverError::DuplicateProvider(spec.name));
        }
        info!(
            provider = %spec.name,
            backend = backend.name(),
            priority = spec.priority,
            "Registered provider"
        );
        self.entries.push(Arc::new(ProviderEntry::new(spec, backend)));
        Ok(())
    }

    /// Builder-style [`register`](Self::register)
    pub fn with_provider(
        mut self,
        spec: ProviderSpec,
        backend: Arc<dyn LlmProvider>,
    ) -> Result<Self, FailoverError> {
        self.register(spec, backend)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fallback_to_all(&self) -> bool {
        self.fallback_to_all
    }

    /// Read-only copies of every provider record, in registration order
    pub fn snapshots(&self) -> Vec<ProviderSnapshot> {
        self.entries.iter().map(|e| e.snapshot()).collect()
    }

    pub fn snapshot(&self, name: &str) -> Option<ProviderSnapshot> {
        self.entries
            .iter()
            .find(|e| e.spec.name == name)
            .map(|e| e.snapshot())
    }

    /// Providers able to serve `required_tokens`, best first
    pub fn select_chain(
        &self,
        required_tokens: u32,
        excluding: Option<&str>,
    ) -> Vec<ProviderSnapshot> {
        order_chain(self.snapshots(), required_tokens, excluding)
    }

    fn chain_entries(&self, required_tokens: u32) -> Vec<Arc<ProviderEntry>> {
        self.select_chain(required_tokens, None)
            .iter()
            .filter_map(|snapshot| {
                self.entries
                    .iter()
                    .find(|e| e.spec.name == snapshot.spec.name)
                    .cloned()
            })
            .collect()
    }

    /// Run one call down the fallback chain.
    ///
    /// With `single_provider_only`, or when the registry was built without
    /// `fallback_to_all`, only the best candidate is tried.
    pub async fn execute(
        &self,
        request: &ProviderRequest,
        single_provider_only: bool,
    ) -> Result<ProviderResponse, FailoverError> {
        let mut chain = self.chain_entries(request.required_tokens);
        if chain.is_empty() {
            warn!(
                required_tokens = request.required_tokens,
                "No eligible provider for request"
            );
            return Err(FailoverError::NoEligibleProvider {
                required_tokens: request.required_tokens,
            });
        }
        if single_provider_only || !self.fallback_to_all {
            chain.truncate(1);
        }

        let mut fallbacks_used = Vec::new();
        let mut last_error = None;
        let chain_len = chain.len();

        for (position, entry) in chain.into_iter().enumerate() {
            let name = entry.spec.name.clone();
            let started = Instant::now();
            debug!(provider = %name, position, "Calling provider");

            match Self::call(&entry, request).await {
                Ok((content, tokens)) => {
                    entry.stats().record_success();
                    metrics().provider_call_succeeded(&name, started.elapsed());
                    if !fallbacks_used.is_empty() {
                        info!(
                            provider = %name,
                            fallbacks = ?fallbacks_used,
                            "Provider call succeeded after fallback"
                        );
                    }
                    let cost = f64::from(tokens.total) * entry.spec.cost_per_token;
                    return Ok(ProviderResponse {
                        content,
                        provider_used: name,
                        tokens,
                        cost,
                        fallbacks_used,
                    });
                }
                Err(error) => {
                    let disabled = entry.stats().record_failure();
                    metrics().provider_call_failed(&name, started.elapsed());
                    if disabled {
                        warn!(
                            provider = %name,
                            "Provider marked unavailable after repeated failures"
                        );
                    }
                    if position + 1 < chain_len {
                        metrics().provider_fallback();
                        warn!(provider = %name, error = %error, "Provider failed, falling back");
                    } else {
                        warn!(provider = %name, error = %error, "Last provider in chain failed");
                    }
                    fallbacks_used.push(name);
                    last_error = Some(error);
                }
            }
        }

        Err(FailoverError::AllProvidersExhausted {
            attempted: fallbacks_used,
            last_error: last_error
                .unwrap_or_else(|| LlmError::RequestFailed("empty chain".to_string())),
        })
    }

    /// One provider call raced against the provider's timeout
    async fn call(
        entry: &ProviderEntry,
        request: &ProviderRequest,
    ) -> Result<(String, TokenCounts), LlmError> {
        let completion = request.to_completion(&entry.spec.model);
        let prompt_text = completion.prompt_text();

        let response = tokio::time::timeout(entry.spec.timeout(), entry.backend.complete(completion))
            .await
            .map_err(|_| LlmError::Timeout(entry.spec.timeout_ms))??;

        let content = response
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| LlmError::InvalidResponse("Empty completion".to_string()))?;

        let tokens = match response.usage {
            Some(usage) if usage.total_tokens > 0 || usage.prompt_tokens > 0 => TokenCounts {
                input: usage.prompt_tokens,
                output: usage.completion_tokens,
                total: usage
                    .total_tokens
                    .max(usage.prompt_tokens + usage.completion_tokens),
            },
            _ => TokenCounts::new(estimate_tokens(&prompt_text), estimate_tokens(&content)),
        };

        Ok((content, tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLlmProvider;

    fn spec(name: &str, priority: u32) -> ProviderSpec {
        ProviderSpec {
            name: name.to_string(),
            model: "mock-model".to_string(),
            priority,
            max_tokens: 8000,
            cost_per_token: 0.001,
            timeout_ms: 1000,
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ProviderRegistry::new(true);
        registry
            .register(spec("a", 1), Arc::new(MockLlmProvider::single_response("x")))
            .unwrap();
        let result = registry.register(spec("a", 2), Arc::new(MockLlmProvider::single_response("y")));

        assert!(matches!(result, Err(FailoverError::DuplicateProvider(name)) if name == "a"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_cost_is_tokens_times_rate() {
        let registry = ProviderRegistry::new(true)
            .with_provider(spec("a", 1), Arc::new(MockLlmProvider::single_response("hello")))
            .unwrap();

        let response = registry
            .execute(&ProviderRequest::new("hi", 100), false)
            .await
            .unwrap();

        assert_eq!(response.provider_used, "a");
        assert_eq!(response.tokens.total, 15);
        assert!((response.cost - 0.015).abs() < 1e-9);
        assert!(response.fallbacks_used.is_empty());
    }

    #[tokio::test]
    async fn test_missing_usage_falls_back_to_estimate() {
        let backend = MockLlmProvider::single_response("12345678").without_usage();
        let registry = ProviderRegistry::new(true)
            .with_provider(spec("a", 1), Arc::new(backend))
            .unwrap();

        let response = registry
            .execute(&ProviderRequest::new("abcd", 100), false)
            .await
            .unwrap();

        assert_eq!(response.tokens, TokenCounts::new(1, 2));
    }

    #[tokio::test]
    async fn test_no_eligible_provider() {
        let registry = ProviderRegistry::new(true)
            .with_provider(spec("a", 1), Arc::new(MockLlmProvider::single_response("x")))
            .unwrap();

        let result = registry
            .execute(&ProviderRequest::new("hi", 100_000), false)
            .await;
        assert!(matches!(
            result,
            Err(FailoverError::NoEligibleProvider {
                required_tokens: 100_000
            })
        ));
    }

    #[tokio::test]
    async fn test_required_tokens_include_prompt() {
        let registry = ProviderRegistry::new(true)
            .with_provider(spec("a", 1), Arc::new(MockLlmProvider::single_response("x")))
            .unwrap();

        // The reply fits on its own, prompt plus reply does not.
        let request = ProviderRequest::new("hi", 6000).with_required_tokens(9000);
        let result = registry.execute(&request, false).await;

        assert!(matches!(
            result,
            Err(FailoverError::NoEligibleProvider {
                required_tokens: 9000
            })
        ));
    }

    #[test]
    fn test_prompt_estimate_counts_system_message() {
        let bare = ProviderRequest::new("a".repeat(40), 100);
        assert_eq!(bare.estimated_prompt_tokens(), 10);

        let with_system = bare.with_system("b".repeat(39));
        // 40 + newline + 39 bytes
        assert_eq!(with_system.estimated_prompt_tokens(), 20);
    }
}
