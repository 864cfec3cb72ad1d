//! Provider records, statistics and chain ordering
//!
//! Ordering and availability rules are pure functions over
//! [`ProviderSnapshot`]s so they can be tested without a runtime.

use crate::llm::provider::LlmProvider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A provider is taken out of rotation once it has failed more than this
/// many times without a single success.
pub const UNAVAILABLE_ERROR_THRESHOLD: u64 = 5;

/// Static description of one backend provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    /// Model identifier sent to the backend
    pub model: String,
    /// Lower is preferred
    pub priority: u32,
    pub max_tokens: u32,
    pub cost_per_token: f64,
    pub timeout_ms: u64,
}

impl ProviderSpec {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Mutable health and success statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStats {
    pub available: bool,
    pub success_count: u64,
    pub error_count: u64,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl Default for ProviderStats {
    fn default() -> Self {
        Self {
            available: true,
            success_count: 0,
            error_count: 0,
            last_checked_at: None,
        }
    }
}

impl ProviderStats {
    /// `success / (success + error)`, with 0/0 treated as 0.
    ///
    /// An unproven provider therefore sorts after one with prior successes
    /// at equal priority: a deliberate cold-start penalty.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            0.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    pub fn record_success(&mut self) {
        self.success_count += 1;
    }

    /// Count a failure; returns true when this failure took the provider out
    /// of rotation.
    pub fn record_failure(&mut self) -> bool {
        self.error_count += 1;
        if self.available
            && self.error_count > UNAVAILABLE_ERROR_THRESHOLD
            && self.success_count == 0
        {
            self.available = false;
            return true;
        }
        false
    }
}

/// Read-only copy of a provider record handed out to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSnapshot {
    #[serde(flatten)]
    pub spec: ProviderSpec,
    #[serde(flatten)]
    pub stats: ProviderStats,
    pub success_rate: f64,
}

impl ProviderSnapshot {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Whether this provider may serve a call needing `required_tokens`
    pub fn is_eligible(&self, required_tokens: u32, excluding: Option<&str>) -> bool {
        self.stats.available
            && self.spec.max_tokens >= required_tokens
            && excluding != Some(self.spec.name.as_str())
    }
}

/// `(priority asc, success rate desc)`
pub fn chain_order(a: &ProviderSnapshot, b: &ProviderSnapshot) -> Ordering {
    a.spec.priority.cmp(&b.spec.priority).then_with(|| {
        b.success_rate
            .partial_cmp(&a.success_rate)
            .unwrap_or(Ordering::Equal)
    })
}

/// Filter and order snapshots into a fallback chain. Ties keep their
/// registration order.
pub fn order_chain(
    snapshots: Vec<ProviderSnapshot>,
    required_tokens: u32,
    excluding: Option<&str>,
) -> Vec<ProviderSnapshot> {
    let mut eligible: Vec<ProviderSnapshot> = snapshots
        .into_iter()
        .filter(|s| s.is_eligible(required_tokens, excluding))
        .collect();
    eligible.sort_by(chain_order);
    eligible
}

/// One registered provider: immutable spec and backend plus its own
/// statistics lock.
pub(crate) struct ProviderEntry {
    pub(crate) spec: ProviderSpec,
    pub(crate) backend: Arc<dyn LlmProvider>,
    stats: Mutex<ProviderStats>,
}

impl ProviderEntry {
    pub(crate) fn new(spec: ProviderSpec, backend: Arc<dyn LlmProvider>) -> Self {
        Self {
            spec,
            backend,
            stats: Mutex::new(ProviderStats::default()),
        }
    }

    /// Lock the stats; a poisoned lock still holds valid counters.
    pub(crate) fn stats(&self) -> MutexGuard<'_, ProviderStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn snapshot(&self) -> ProviderSnapshot {
        let stats = self.stats().clone();
        ProviderSnapshot {
            spec: self.spec.clone(),
            success_rate: stats.success_rate(),
            stats,
        }
    }
}
