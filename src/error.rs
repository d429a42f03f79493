//! Error types for the check execution engine

use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Comprehensive error taxonomy for the execution engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Directed cycle detected while levelling the dependency graph
    #[error("dependency cycle detected: {0}")]
    Cycle(String),

    /// A check references a dependency id that does not resolve
    #[error("check {referrer} depends on unknown check {dep}")]
    UnknownDep {
        /// The dangling dependency id
        dep: String,
        /// The check that referenced it
        referrer: String,
    },

    /// Structural problem with the loaded configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configured provider tag has no registered implementation
    #[error("no provider registered for tag {0}")]
    UnknownProvider(String),

    /// A provider invocation returned an error result
    #[error("provider error in check {check_id}: {message}")]
    Provider {
        /// Check that failed
        check_id: String,
        /// Provider-supplied message
        message: String,
    },

    /// A check's effective deadline elapsed before it completed
    #[error("check {0} timed out")]
    Timeout(String),

    /// A check's execution was cancelled (fail-fast, run timeout, external stop)
    #[error("check {0} was cancelled")]
    Cancelled(String),

    /// Routing emitted more forward-runs than `max_loops` allows
    #[error("routing loop budget exceeded for check {0}")]
    LoopBudgetExceeded(String),

    /// A configured `fail_if` expression evaluated truthy
    #[error("fail_if triggered for check {0}")]
    FailIfTriggered(String),

    /// Sandbox expression evaluation failed
    #[error("expression error: {0}")]
    Expression(String),

    /// Memory store persistence failure (non-fatal; logged by caller)
    #[error("memory store error: {0}")]
    Memory(String),

    /// Catch-all for invariants that should never be violated
    #[error("internal engine error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Memory(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::InvalidConfig(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::InvalidConfig(err.to_string())
    }
}
