//! Unified error type for the acflow workspace
//!
//! [`AcFlowError`] covers every failure that can abort a load flow session:
//! malformed networks, bad parameters, collaborator failures and the
//! "throw" policy of active power distribution. Outer-loop `FAILED` statuses
//! and solver non-convergence are *not* errors; they are reported through
//! the engine result.
//!
//! # Example
//!
//! ```ignore
//! use acflow_core::{AcFlowError, AcFlowResult};
//!
//! fn solve(network: &mut Network) -> AcFlowResult<()> {
//!     let result = engine.run(network)?;
//!     if !result.is_ok() {
//!         return Err(AcFlowError::Solver("load flow failed".into()));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Unified error type for all acflow operations.
#[derive(Error, Debug)]
pub enum AcFlowError {
    /// I/O errors (parameter files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parsing/deserialization errors
    #[error("Parse error: {0}")]
    Parse(String),

    /// Parameter validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network structure errors (unknown ids, duplicates, dangling references)
    #[error("Network error: {0}")]
    Network(String),

    /// Nonlinear solver errors that are not a plain non-convergence
    #[error("Solver error: {0}")]
    Solver(String),

    /// Sensitivity computation errors
    #[error("Sensitivity error: {0}")]
    Sensitivity(String),

    /// Slack distribution left a residual and the configured policy is to throw
    #[error("Failed to distribute slack bus active power mismatch, {remaining_mw:.3} MW remaining")]
    ActivePowerDistribution { remaining_mw: f64 },

    /// Generic errors (for wrapping external errors)
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Results using AcFlowError.
pub type AcFlowResult<T> = Result<T, AcFlowError>;

impl From<anyhow::Error> for AcFlowError {
    fn from(err: anyhow::Error) -> Self {
        AcFlowError::Other(err.to_string())
    }
}

impl From<String> for AcFlowError {
    fn from(s: String) -> Self {
        AcFlowError::Other(s)
    }
}

impl From<&str> for AcFlowError {
    fn from(s: &str) -> Self {
        AcFlowError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for AcFlowError {
    fn from(err: serde_json::Error) -> Self {
        AcFlowError::Parse(err.to_string())
    }
}

impl From<toml::de::Error> for AcFlowError {
    fn from(err: toml::de::Error) -> Self {
        AcFlowError::Parse(err.to_string())
    }
}

impl From<toml::ser::Error> for AcFlowError {
    fn from(err: toml::ser::Error) -> Self {
        AcFlowError::Parse(err.to_string())
    }
}
