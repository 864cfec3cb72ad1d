//! Health check HTTP server
//!
//! Exposes provider availability, session counters and the metrics
//! snapshot for operators and container orchestration.

use crate::observability::metrics::metrics;
use crate::registry::{ProviderRegistry, ProviderSnapshot};
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::info;
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    service: String,
    port: u16,
    registry: Arc<ProviderRegistry>,
    additional_checks: Arc<RwLock<HashMap<String, HealthCheck>>>,
}

impl HealthServer {
    pub fn new(service: impl Into<String>, port: u16, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            service: service.into(),
            port,
            registry,
            additional_checks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Add custom health check
    pub async fn add_health_check(&self, name: impl Into<String>, check: HealthCheck) {
        self.additional_checks.write().await.insert(name.into(), check);
    }

    pub async fn remove_health_check(&self, name: &str) {
        self.additional_checks.write().await.remove(name);
    }

    /// Serve until the task is dropped
    pub async fn start(self: Arc<Self>) {
        let health_server = self.clone();
        let ready_server = self.clone();
        let providers_server = self.clone();

        // GET /health - overall status with per-check detail
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = health_server.clone();
            async move {
                let status = server.get_health_status().await;
                let code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            }
        });

        // GET /ready - at least one provider can take calls
        let ready_route = warp::path("ready").and(warp::get()).and_then(move || {
            let server = ready_server.clone();
            async move {
                let ready = server.check_providers().status == "healthy";
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
            }
        });

        // GET /live
        let live_route = warp::path("live").and(warp::get()).map(|| {
            warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            })
        });

        // GET /metrics
        let metrics_route = warp::path("metrics")
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().get_metrics()));

        // GET /providers - provider snapshots
        let providers_route = warp::path("providers").and(warp::get()).map(move || {
            let snapshots: Vec<ProviderSnapshot> = providers_server.registry.snapshots();
            warp::reply::json(&snapshots)
        });

        // GET / - endpoint listing
        let root_route = warp::path::end().and(warp::get()).map(|| {
            let endpoints: HashMap<&str, &str> = [
                ("/health", "Overall health with provider and session checks"),
                ("/ready", "Readiness: at least one provider available"),
                ("/live", "Liveness"),
                ("/metrics", "Session, stage and provider metrics"),
                ("/providers", "Provider records and statistics"),
            ]
            .into_iter()
            .collect();
            warp::reply::json(&endpoints)
        });

        let routes = health_route
            .or(ready_route)
            .or(live_route)
            .or(metrics_route)
            .or(providers_route)
            .or(root_route)
            .with(warp::cors().allow_any_origin());

        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        info!(port = self.port, "Starting health server");
        warp::serve(routes).run(addr).await;
    }

    async fn get_health_status(&self) -> HealthStatus {
        let mut checks = HashMap::new();
        checks.insert("providers".to_string(), self.check_providers());
        checks.insert("sessions".to_string(), check_sessions());

        for (name, check) in self.additional_checks.read().await.iter() {
            checks.insert(name.clone(), check.clone());
        }

        let healthy = checks.values().all(|check| check.status == "healthy");
        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: current_timestamp(),
            service: self.service.clone(),
            uptime_seconds: metrics().get_metrics().uptime_seconds,
            checks,
        }
    }

    fn check_providers(&self) -> HealthCheck {
        let snapshots = self.registry.snapshots();
        let available = snapshots.iter().filter(|s| s.stats.available).count();
        let message = format!("{available}/{} providers available", snapshots.len());

        if available > 0 {
            HealthCheck::healthy(message)
        } else {
            HealthCheck::new("unhealthy", message)
        }
    }
}

fn check_sessions() -> HealthCheck {
    let sessions = metrics().get_metrics().sessions;
    HealthCheck::healthy(format!(
        "{} running, {} queued, {} completed, {} failed",
        sessions.running, sessions.queued, sessions.completed, sessions.failed
    ))
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    pub fn new(status: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            message: Some(message.into()),
            last_check: current_timestamp(),
        }
    }

    pub fn healthy(message: impl Into<String>) -> Self {
        Self::new("healthy", message)
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    service: String,
    uptime_seconds: u64,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
