use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::error::ErrorKind;

/// Exit code placed on results for submissions rejected before execution
pub const SECURITY_VIOLATION_EXIT_CODE: i32 = 1;
/// Exit code for killed, never-started or infrastructure-failed runs
pub const ABNORMAL_EXIT_CODE: i32 = -1;
/// Stderr marker for runs killed by the wall-clock timer
pub const TIMEOUT_MARKER: &str = "Time limit exceeded";

/// Default wall-clock limit when the request does not carry one
pub const DEFAULT_TIME_LIMIT_MS: u32 = 5000;

/// Opaque per-invocation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short form used in container names and scratch directory prefixes
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..12].to_string()
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single test case supplied with a grading request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    /// Defaults to the 1-based position in the request
    #[serde(default)]
    pub id: Option<String>,
    pub input: String,
    pub expected_output: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub hidden: bool,
}

fn default_weight() -> u32 {
    1
}

impl TestCase {
    pub fn new(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            id: None,
            input: input.into(),
            expected_output: expected_output.into(),
            weight: default_weight(),
            hidden: false,
        }
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// Request accepted by the engine. The engine only ever borrows it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    /// ms, defaults to [`DEFAULT_TIME_LIMIT_MS`]
    #[serde(default)]
    pub time_limit_ms: Option<u32>,
    /// MB, defaults to the language's configured default
    #[serde(default)]
    pub memory_limit_mb: Option<u32>,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub submitter_id: Option<String>,
    #[serde(default)]
    pub problem_id: Option<String>,
}

impl ExecutionRequest {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
            test_cases: Vec::new(),
            time_limit_ms: None,
            memory_limit_mb: None,
            stdin: None,
            submitter_id: None,
            problem_id: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_time_limit(mut self, time_limit_ms: u32) -> Self {
        self.time_limit_ms = Some(time_limit_ms);
        self
    }

    pub fn with_memory_limit(mut self, memory_limit_mb: u32) -> Self {
        self.memory_limit_mb = Some(memory_limit_mb);
        self
    }

    pub fn with_test_cases(mut self, test_cases: Vec<TestCase>) -> Self {
        self.test_cases = test_cases;
        self
    }

    /// Requested wall-clock limit, or `default_ms` when the request has none
    pub fn time_limit(&self, default_ms: u32) -> u32 {
        self.time_limit_ms.unwrap_or(default_ms)
    }
}

/// Which backend produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Isolated container (secure mode)
    Container,
    /// Embedded interpreter inside the engine process (restricted mode)
    InProcess,
    /// Plain child process with rlimits (restricted mode, opt-in)
    DirectProcess,
    /// Nothing was executed
    None,
}

/// Result of one execute call. Never mutated after it is returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub runtime_ms: u64,
    pub memory_kb: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    pub security_violation: bool,
    pub isolation: IsolationLevel,
    #[serde(default)]
    pub output_truncated: bool,
}

impl ExecutionResult {
    /// Result for a submission the validator refused
    pub fn security_violation(execution_id: ExecutionId, reason: impl Into<String>) -> Self {
        Self {
            execution_id,
            stdout: String::new(),
            stderr: reason.into(),
            exit_code: SECURITY_VIOLATION_EXIT_CODE,
            runtime_ms: 0,
            memory_kb: 0,
            error: Some(ErrorKind::SecurityViolation),
            security_violation: true,
            isolation: IsolationLevel::None,
            output_truncated: false,
        }
    }

    /// Result for an operational failure
    pub fn infrastructure(execution_id: ExecutionId, message: impl Into<String>) -> Self {
        Self {
            execution_id,
            stdout: String::new(),
            stderr: message.into(),
            exit_code: ABNORMAL_EXIT_CODE,
            runtime_ms: 0,
            memory_kb: 0,
            error: Some(ErrorKind::Infrastructure),
            security_violation: false,
            isolation: IsolationLevel::None,
            output_truncated: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.exit_code == 0
    }

    /// Rejected submissions get an automatic low score upstream and must not
    /// be forwarded to the narrative review service.
    pub fn skip_narrative_review(&self) -> bool {
        self.security_violation
    }
}
