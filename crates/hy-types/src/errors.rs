use thiserror::Error;

/// Main error type for the Halyard system
#[derive(Error, Debug)]
pub enum HyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transient I/O error: {0}")]
    Io(#[from] TransientIoError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Logic error: {0}")]
    Logic(#[from] LogicError),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HyError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether the controller should retry the operation after a backoff.
    ///
    /// Only transient collaborator failures qualify; configuration and logic
    /// errors need a human to change something first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Invalid user input. Surfaced immediately, never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unsupported algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },

    #[error("invalid search space: parameter {parameter}: {message}")]
    InvalidSearchSpace { parameter: String, message: String },

    #[error("request count must not be negative, got {count}")]
    NegativeRequestCount { count: i32 },

    #[error("invalid algorithm parameter {name}={value}: {message}")]
    InvalidAlgorithmParameter {
        name: String,
        value: String,
        message: String,
    },

    #[error("invalid study configuration: {message}")]
    InvalidStudy { message: String },

    #[error("invalid setting {name}={value}: {message}")]
    InvalidSetting {
        name: String,
        value: String,
        message: String,
    },
}

/// Store or workload call failures. Retried with backoff by the controller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransientIoError {
    #[error("store unavailable: {message}")]
    Store { message: String },

    #[error("workload call failed: {message}")]
    Workload { message: String },

    #[error("operation timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
}

/// Malformed external input. Skipped locally and logged; never fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("line {line}: missing or invalid timestamp: {token}")]
    InvalidTimestamp { line: usize, token: String },

    #[error("line {line}: ignoring trailing garbage in {token}")]
    TrailingGarbage { line: usize, token: String },

    #[error("metric {metric}: value {value} is not numeric")]
    NonNumericValue { metric: String, value: String },
}

/// Inconsistent controller state. Blocks the current reconcile pass.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LogicError {
    #[error("experiment {experiment}: {remaining} trials left after cascade delete")]
    CascadeIncomplete { experiment: String, remaining: usize },

    #[error("trial {trial}: illegal transition from {from} to {to}")]
    IllegalTransition {
        trial: String,
        from: String,
        to: String,
    },

    #[error("{0}")]
    Inconsistent(String),
}

/// Result type alias for Halyard operations
pub type HyResult<T> = Result<T, HyError>;

/// Macro for creating configuration errors about the study as a whole
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::HyError::Config($crate::ConfigError::InvalidStudy {
            message: format!($($arg)*),
        })
    };
}

/// Macro for creating logic errors
#[macro_export]
macro_rules! logic_error {
    ($($arg:tt)*) => {
        $crate::HyError::Logic($crate::LogicError::Inconsistent(format!($($arg)*)))
    };
}
