use std::time::Duration;

use thiserror::Error;

use crate::token::TokenError;

/// Failure of a single harness step.
///
/// Every variant is terminal for the step that produced it. Nothing in the crate
/// retries on any of them.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A collaborator could not be constructed or connected, or a step was run out of order
    #[error("setup failed: {0}")]
    Setup(String),
    /// A method name, payload or status did not match what the step expected
    #[error("validation mismatch: {0}")]
    ValidationMismatch(String),
    /// A fixed bound elapsed before the awaited event happened
    #[error("timed out after {after:?} waiting for {operation}")]
    Timeout {
        /// What was being waited on
        operation: &'static str,
        /// The bound that elapsed
        after: Duration,
    },
    /// A collaborator reported a failure other than a timeout
    #[error("transport error: {0}")]
    Transport(String),
}

impl HarnessError {
    /// Whether this is a [`HarnessError::Timeout`]
    pub fn is_timeout(&self) -> bool {
        matches!(self, HarnessError::Timeout { .. })
    }
}

impl From<TokenError> for HarnessError {
    fn from(err: TokenError) -> Self {
        HarnessError::Setup(format!("invalid credentials: {}", err))
    }
}

impl From<config::ConfigError> for HarnessError {
    fn from(err: config::ConfigError) -> Self {
        HarnessError::Setup(format!("invalid configuration: {}", err))
    }
}
