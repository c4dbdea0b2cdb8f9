//! Core types shared by every module: requests, results and the error taxonomy

pub mod error;
pub mod types;

pub use error::{EngineError, ErrorKind};
pub use types::{
    ExecutionId, ExecutionRequest, ExecutionResult, IsolationLevel, TestCase,
    ABNORMAL_EXIT_CODE, DEFAULT_TIME_LIMIT_MS, SECURITY_VIOLATION_EXIT_CODE, TIMEOUT_MARKER,
};
