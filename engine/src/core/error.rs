use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification attached to a result that did not finish cleanly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected by the validator before anything ran
    SecurityViolation,
    CompilationError,
    RuntimeError,
    /// Wall-clock limit exceeded, process was killed
    Timeout,
    MemoryLimitExceeded,
    /// Operational failure (runtime unreachable, image missing, unsupported
    /// in this environment). Never scored against the submitter.
    #[serde(rename = "infrastructure_error")]
    Infrastructure,
}

impl ErrorKind {
    /// Only infrastructure failures are worth retrying or escalating.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Infrastructure)
    }

    pub fn is_submission_fault(&self) -> bool {
        !self.is_retryable()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::SecurityViolation => "security_violation",
            ErrorKind::CompilationError => "compilation_error",
            ErrorKind::RuntimeError => "runtime_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::MemoryLimitExceeded => "memory_limit_exceeded",
            ErrorKind::Infrastructure => "infrastructure_error",
        };
        write!(f, "{}", s)
    }
}

/// Infrastructure failures raised inside the engine.
///
/// Submission defects (bad exit codes, timeouts, compile errors) are never
/// represented here; they travel as [`ErrorKind`] on a structured result.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("failed to launch sandbox: {0}")]
    Launch(String),

    #[error("language '{0}' is unsupported in this environment (restricted mode)")]
    UnsupportedInRestrictedMode(String),

    #[error("scratch directory error: {0}")]
    Scratch(#[source] std::io::Error),

    #[error("interpreter error: {0}")]
    Interpreter(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
