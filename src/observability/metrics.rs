//! Thread-safe metrics collection system
//!
//! Atomic counters for high-frequency events and mutex-protected maps for
//! per-stage and per-provider timing data.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Samples kept per timing series
const MAX_TIMING_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// How a session run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Session metrics
    sessions_started: AtomicU64,
    sessions_queued: AtomicU64,
    sessions_running: AtomicU64,
    max_sessions_running: AtomicU64,
    sessions_completed: AtomicU64,
    sessions_failed: AtomicU64,
    sessions_cancelled: AtomicU64,
    session_times: Mutex<Vec<u64>>,

    // Scheduler metrics
    stage_retries: AtomicU64,
    budget_breaches: AtomicU64,
    stage_stats: Mutex<HashMap<String, CallStats>>,

    // Provider metrics
    provider_fallbacks: AtomicU64,
    provider_stats: Mutex<HashMap<String, CallStats>>,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            sessions_started: AtomicU64::new(0),
            sessions_queued: AtomicU64::new(0),
            sessions_running: AtomicU64::new(0),
            max_sessions_running: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            sessions_cancelled: AtomicU64::new(0),
            session_times: Mutex::new(Vec::new()),
            stage_retries: AtomicU64::new(0),
            budget_breaches: AtomicU64::new(0),
            stage_stats: Mutex::new(HashMap::new()),
            provider_fallbacks: AtomicU64::new(0),
            provider_stats: Mutex::new(HashMap::new()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Session metrics
    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        self.sessions_queued.fetch_add(1, Ordering::Relaxed);
    }

    /// A queued session acquired a concurrency permit
    pub fn session_running(&self) {
        decrement(&self.sessions_queued);
        let running = self.sessions_running.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_sessions_running
            .fetch_max(running, Ordering::Relaxed);
    }

    /// A session reached a terminal state. `was_running` is false for a
    /// session cancelled while still queued.
    pub fn session_finished(&self, outcome: SessionOutcome, duration: Duration, was_running: bool) {
        if was_running {
            decrement(&self.sessions_running);
        } else {
            decrement(&self.sessions_queued);
        }

        let counter = match outcome {
            SessionOutcome::Completed => &self.sessions_completed,
            SessionOutcome::Failed => &self.sessions_failed,
            SessionOutcome::Cancelled => &self.sessions_cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut times) = self.session_times.lock() {
            push_sample(&mut times, duration);
        }
    }

    // Scheduler metrics
    pub fn stage_attempt(&self, stage: &str, duration: Duration, success: bool) {
        if let Ok(mut stats) = self.stage_stats.lock() {
            stats
                .entry(stage.to_string())
                .or_default()
                .record(duration, success);
        }
    }

    pub fn stage_retry(&self) {
        self.stage_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn budget_breach(&self) {
        self.budget_breaches.fetch_add(1, Ordering::Relaxed);
    }

    // Provider metrics
    pub fn provider_call_succeeded(&self, provider: &str, duration: Duration) {
        self.record_provider_call(provider, duration, true);
    }

    pub fn provider_call_failed(&self, provider: &str, duration: Duration) {
        self.record_provider_call(provider, duration, false);
    }

    pub fn provider_fallback(&self) {
        self.provider_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    fn record_provider_call(&self, provider: &str, duration: Duration, success: bool) {
        if let Ok(mut stats) = self.provider_stats.lock() {
            stats
                .entry(provider.to_string())
                .or_default()
                .record(duration, success);
        }
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.sessions_started,
            &self.sessions_queued,
            &self.sessions_running,
            &self.max_sessions_running,
            &self.sessions_completed,
            &self.sessions_failed,
            &self.sessions_cancelled,
            &self.stage_retries,
            &self.budget_breaches,
            &self.provider_fallbacks,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        if let Ok(mut times) = self.session_times.lock() {
            times.clear();
        }
        if let Ok(mut stats) = self.stage_stats.lock() {
            stats.clear();
        }
        if let Ok(mut stats) = self.provider_stats.lock() {
            stats.clear();
        }
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
    }

    fn session_time_statistics(&self) -> TimingSummary {
        self.session_times
            .lock()
            .map(|times| TimingSummary::from_samples(&times))
            .unwrap_or_default()
    }

    fn snapshot_calls(stats: &Mutex<HashMap<String, CallStats>>) -> HashMap<String, CallStatsSnapshot> {
        stats
            .lock()
            .map(|stats| {
                stats
                    .iter()
                    .map(|(name, s)| (name.clone(), s.snapshot()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let times = self.session_time_statistics();

        MetricsSnapshot {
            sessions: SessionMetrics {
                started: self.sessions_started.load(Ordering::Relaxed),
                queued: self.sessions_queued.load(Ordering::Relaxed),
                running: self.sessions_running.load(Ordering::Relaxed),
                max_running: self.max_sessions_running.load(Ordering::Relaxed),
                completed: self.sessions_completed.load(Ordering::Relaxed),
                failed: self.sessions_failed.load(Ordering::Relaxed),
                cancelled: self.sessions_cancelled.load(Ordering::Relaxed),
                avg_execution_time_ms: times.avg,
                execution_time_p50_ms: times.p50,
                execution_time_p95_ms: times.p95,
                execution_time_p99_ms: times.p99,
            },
            stages: StageMetrics {
                stage_stats: Self::snapshot_calls(&self.stage_stats),
                retries: self.stage_retries.load(Ordering::Relaxed),
                budget_breaches: self.budget_breaches.load(Ordering::Relaxed),
            },
            providers: ProviderMetrics {
                provider_stats: Self::snapshot_calls(&self.provider_stats),
                fallbacks: self.provider_fallbacks.load(Ordering::Relaxed),
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Internal call statistics (with timing data)
#[derive(Debug, Default)]
struct CallStats {
    calls: u64,
    failures: u64,
    call_times: Vec<u64>,
    last_call: u64,
}

impl CallStats {
    fn record(&mut self, duration: Duration, success: bool) {
        self.calls += 1;
        if !success {
            self.failures += 1;
        }
        self.last_call = current_timestamp();
        push_sample(&mut self.call_times, duration);
    }

    fn snapshot(&self) -> CallStatsSnapshot {
        let timing = TimingSummary::from_samples(&self.call_times);
        let success_rate = if self.calls == 0 {
            0.0
        } else {
            (self.calls - self.failures) as f64 / self.calls as f64
        };

        CallStatsSnapshot {
            calls: self.calls,
            failures: self.failures,
            success_rate,
            avg_time_ms: timing.avg,
            p95_time_ms: timing.p95,
            last_call: self.last_call,
        }
    }
}

#[derive(Debug, Default)]
struct TimingSummary {
    avg: f64,
    p50: f64,
    p95: f64,
    p99: f64,
}

impl TimingSummary {
    fn from_samples(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();

        Self {
            avg: sorted.iter().sum::<u64>() as f64 / sorted.len() as f64,
            p50: percentile(&sorted, 50.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
        }
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub sessions: SessionMetrics,
    pub stages: StageMetrics,
    pub providers: ProviderMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct SessionMetrics {
    pub started: u64,
    pub queued: u64,
    pub running: u64,
    pub max_running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub avg_execution_time_ms: f64,
    pub execution_time_p50_ms: f64,
    pub execution_time_p95_ms: f64,
    pub execution_time_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct StageMetrics {
    pub stage_stats: HashMap<String, CallStatsSnapshot>,
    pub retries: u64,
    pub budget_breaches: u64,
}

#[derive(Debug, Serialize)]
pub struct ProviderMetrics {
    pub provider_stats: HashMap<String, CallStatsSnapshot>,
    pub fallbacks: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallStatsSnapshot {
    pub calls: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub avg_time_ms: f64,
    pub p95_time_ms: f64,
    pub last_call: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

fn push_sample(samples: &mut Vec<u64>, duration: Duration) {
    samples.push(duration.as_millis() as u64);
    if samples.len() > MAX_TIMING_SAMPLES {
        samples.remove(0);
    }
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower = sorted_data[index.floor() as usize] as f64;
        let upper = sorted_data[index.ceil() as usize] as f64;
        lower + (upper - lower) * index.fract()
    }
}
