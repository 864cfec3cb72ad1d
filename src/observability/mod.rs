//! Observability: structured logging, metrics, lifecycle observers and the
//! health endpoint.

pub mod health;
pub mod logging;
pub mod metrics;
pub mod observer;

pub use health::{HealthCheck, HealthServer};
pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot, SessionOutcome};
pub use observer::{NoOpObserver, ObserverHandle, TracingObserver, WorkflowObserver};

// Span macros for structured logging
pub use logging::{provider_span, session_span, stage_span};
