//! LLM backend abstraction layer
//!
//! Provider-agnostic interface for the backends the registry fails over
//! between, plus the concrete OpenAI and Anthropic implementations.

pub mod provider;
pub mod providers;

pub use provider::*;
pub use providers::*;
