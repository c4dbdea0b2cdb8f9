//! Secure multi-language code execution and grading engine
//!
//! Untrusted submissions are validated, run in an isolated container (or an
//! in-process interpreter when no container runtime exists) and scored
//! against test cases.

pub mod api;
pub mod compiler;
pub mod config;
pub mod core;
pub mod engine;
pub mod grader;
pub mod languages;
pub mod metrics;
pub mod pipeline;
pub mod policy;
pub mod runner;
pub mod sandbox;
pub mod validator;
pub mod worker;

pub use crate::config::EngineConfig;
pub use crate::core::{
    EngineError, ErrorKind, ExecutionId, ExecutionRequest, ExecutionResult, IsolationLevel, TestCase,
};
pub use crate::engine::Engine;
pub use crate::grader::{GradeReport, TestCaseResult};
pub use crate::metrics::{HealthReport, HealthStatus};
pub use crate::sandbox::SandboxMode;
