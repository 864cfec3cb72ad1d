//! Error types for the pipeline core
//!
//! Scheduler-level failures are never raised to callers; they are recorded
//! on the session as `WorkflowError`s. The types here cover the agent
//! contract and the session-store surface.

use crate::registry::FailoverError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

const MAX_ERROR_MESSAGE_LEN: usize = 500;
const TRUNCATION_SUFFIX: &str = "...[truncated]";

static SECRET_ASSIGNMENT: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static BEARER_HEADER: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)bearer\s+[A-Za-z0-9._\-]+").ok());

/// Errors raised by a stage agent
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent failed: {message}")]
    Failed { message: String, retryable: bool },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Provider failure: {0}")]
    Provider(#[from] FailoverError),

    #[error("Agent call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl AgentError {
    /// Retryable agent failure
    pub fn failed<S: Into<String>>(message: S) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: true,
        }
    }

    /// Failure the agent marks as not worth retrying
    pub fn fatal<S: Into<String>>(message: S) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Every error is retryable unless the agent explicitly said otherwise
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Failed { retryable, .. } => *retryable,
            AgentError::InvalidInput { .. } => false,
            AgentError::Provider(_) | AgentError::Timeout { .. } => true,
        }
    }
}

/// Errors returned by the session store
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    DuplicateSession(String),

    #[error("Snapshot stream for session {0} was already taken")]
    StreamUnavailable(String),

    #[error("Session task failed: {0}")]
    TaskFailed(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Result type for session-store operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Redact credential-looking fragments and cap the length of an error
/// message before it is stored on a session or logged.
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(re) = SECRET_ASSIGNMENT.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}=***").into_owned();
    }
    if let Some(re) = BEARER_HEADER.as_ref() {
        sanitized = re.replace_all(&sanitized, "Bearer ***").into_owned();
    }

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let mut cut = MAX_ERROR_MESSAGE_LEN - TRUNCATION_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(TRUNCATION_SUFFIX);
    }

    sanitized
}
