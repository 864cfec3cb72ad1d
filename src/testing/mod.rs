//! Testing utilities and mock implementations
//!
//! Lets the registry, scheduler and session store run end to end without
//! real LLM backends.

pub mod mocks;

pub use mocks::*;
