//! Periodic provider health probes
//!
//! A single background task ticks on a fixed interval and probes every
//! provider with a minimal call. A provider that answers is put back into
//! rotation regardless of its failure history. Probe errors are logged and
//! never raised.

use super::record::ProviderEntry;
use super::ProviderRegistry;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Result of probing one provider
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub provider: String,
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Clears the re-entrancy flag however the probe cycle ends
struct ProbeCycleGuard<'a>(&'a AtomicBool);

impl Drop for ProbeCycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ProviderRegistry {
    /// Probe every provider once.
    ///
    /// Returns `None` without probing when another cycle is still running.
    pub async fn probe_all(&self) -> Option<Vec<ProbeReport>> {
        if self
            .probing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Previous health probe cycle still running, skipping");
            return None;
        }
        let _guard = ProbeCycleGuard(&self.probing);

        let reports = join_all(self.entries.iter().map(|entry| probe_one(entry))).await;
        let healthy = reports.iter().filter(|r| r.healthy).count();
        debug!(healthy, total = reports.len(), "Health probe cycle finished");
        Some(reports)
    }

    /// Whether a probe cycle is currently running
    pub fn is_probing(&self) -> bool {
        self.probing.load(Ordering::Acquire)
    }
}

async fn probe_one(entry: &ProviderEntry) -> ProbeReport {
    let started = Instant::now();
    let outcome = tokio::time::timeout(entry.spec.timeout(), entry.backend.health_check()).await;
    let latency_ms = started.elapsed().as_millis() as u64;

    let error = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(format!("health check timed out after {}ms", entry.spec.timeout_ms)),
    };

    let mut stats = entry.stats();
    stats.last_checked_at = Some(Utc::now());
    match &error {
        None => {
            if !stats.available {
                info!(provider = %entry.spec.name, "Provider healthy again, re-enabled");
            }
            stats.available = true;
        }
        Some(message) => {
            warn!(provider = %entry.spec.name, error = %message, "Provider health probe failed");
        }
    }
    drop(stats);

    ProbeReport {
        provider: entry.spec.name.clone(),
        healthy: error.is_none(),
        latency_ms,
        error,
    }
}

/// Spawn the periodic probe task. Each tick starts a probe cycle in its own
/// task; a tick that lands while a cycle is still running is skipped.
pub fn spawn_health_probes(registry: Arc<ProviderRegistry>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; probes start one interval in.
        ticker.tick().await;

        info!(interval_secs = interval.as_secs(), "Provider health probes started");
        loop {
            ticker.tick().await;
            let registry = registry.clone();
            tokio::spawn(async move {
                registry.probe_all().await;
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ProviderRegistry, ProviderSpec};
    use crate::testing::MockLlmProvider;

    fn spec(name: &str) -> ProviderSpec {
        ProviderSpec {
            name: name.to_string(),
            model: "m".to_string(),
            priority: 1,
            max_tokens: 1000,
            cost_per_token: 0.0,
            timeout_ms: 500,
        }
    }

    #[tokio::test]
    async fn test_probe_reports_each_provider() {
        let registry = ProviderRegistry::new(true)
            .with_provider(spec("up"), Arc::new(MockLlmProvider::single_response("ok")))
            .unwrap()
            .with_provider(spec("down"), Arc::new(MockLlmProvider::with_failure()))
            .unwrap();

        let reports = registry.probe_all().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().any(|r| r.provider == "up" && r.healthy));
        assert!(reports
            .iter()
            .any(|r| r.provider == "down" && !r.healthy && r.error.is_some()));

        for snapshot in registry.snapshots() {
            assert!(snapshot.stats.last_checked_at.is_some());
        }
        assert!(!registry.is_probing());
    }

    #[tokio::test]
    async fn test_overlapping_cycle_is_skipped() {
        let registry = ProviderRegistry::new(true)
            .with_provider(spec("up"), Arc::new(MockLlmProvider::single_response("ok")))
            .unwrap();

        registry.probing.store(true, Ordering::Release);
        assert!(registry.probe_all().await.is_none());

        registry.probing.store(false, Ordering::Release);
        assert!(registry.probe_all().await.is_some());
    }
}
