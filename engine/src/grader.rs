//! Grader module for scoring runs against test cases
//!
//! Pure scoring: takes one execution result per test case and turns them into
//! per-case verdicts, points and an aggregate report. Running the program is
//! the engine's job.

use serde::{Deserialize, Serialize};

use crate::core::{ErrorKind, ExecutionId, ExecutionResult, IsolationLevel, TestCase};

/// Fraction of a case's points available for near-miss output.
/// Kept from the scoring rules the platform already publishes; product owns it.
pub const PARTIAL_CREDIT_FACTOR: f64 = 0.5;

/// Largest differing span (after common prefix and suffix) compared byte by byte
const SIMILARITY_WINDOW: usize = 16 * 1024;

/// Full picture of a failed hidden case, for operators only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseDiagnostics {
    pub input: String,
    pub expected_output: String,
    pub actual_output: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub test_id: String,
    pub passed: bool,
    pub hidden: bool,
    /// None when the case is hidden
    pub input: Option<String>,
    pub expected_output: Option<String>,
    pub actual_output: Option<String>,
    pub runtime_ms: u64,
    pub memory_kb: u64,
    pub points_earned: u32,
    pub max_points: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<CaseDiagnostics>,
}

/// Result of grading a submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeReport {
    pub execution_id: ExecutionId,
    pub results: Vec<TestCaseResult>,
    pub all_passed: bool,
    /// 0-100
    pub score: u32,
    pub points_earned: u32,
    pub max_points: u32,
    pub total_runtime_ms: u64,
    pub peak_memory_kb: u64,
    /// Whole-submission failure (rejection, compile error, infrastructure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    pub security_violation: bool,
    pub isolation: IsolationLevel,
}

impl GradeReport {
    /// Report for a submission that never reached the test cases
    pub fn failed(result: &ExecutionResult) -> Self {
        Self {
            execution_id: result.execution_id,
            results: Vec::new(),
            all_passed: false,
            score: 0,
            points_earned: 0,
            max_points: 0,
            total_runtime_ms: result.runtime_ms,
            peak_memory_kb: result.memory_kb,
            error: result.error,
            stderr: Some(result.stderr.clone()),
            security_violation: result.security_violation,
            isolation: result.isolation,
        }
    }

    /// Strip operator-only diagnostics
    pub fn for_submitter(mut self) -> Self {
        for result in &mut self.results {
            result.diagnostics = None;
        }
        self
    }

    pub fn skip_narrative_review(&self) -> bool {
        self.security_violation
    }
}

/// Exact match after trimming surrounding whitespace
pub fn outputs_match(actual: &str, expected: &str) -> bool {
    actual.trim() == expected.trim()
}

/// `1 - levenshtein / max_len` over the full trimmed bytes. Only identical
/// outputs score 1; two empty outputs are identical.
pub fn similarity(actual: &str, expected: &str) -> f64 {
    let a = actual.trim().as_bytes();
    let e = expected.trim().as_bytes();

    let longest = a.len().max(e.len());
    if longest == 0 {
        return 1.0;
    }

    (1.0 - edit_distance(a, e) as f64 / longest as f64).max(0.0)
}

/// Levenshtein distance. Shared prefix and suffix cost nothing and are cut
/// first; the rest is exact up to the window, past it the unseen tail is
/// charged in full.
fn edit_distance(a: &[u8], e: &[u8]) -> usize {
    let prefix = a.iter().zip(e).take_while(|(x, y)| x == y).count();
    let (a, e) = (&a[prefix..], &e[prefix..]);
    let suffix = a
        .iter()
        .rev()
        .zip(e.iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let (a, e) = (&a[..a.len() - suffix], &e[..e.len() - suffix]);

    let head_a = &a[..a.len().min(SIMILARITY_WINDOW)];
    let head_e = &e[..e.len().min(SIMILARITY_WINDOW)];
    let unseen = (a.len() - head_a.len()).max(e.len() - head_e.len());

    triple_accel::levenshtein(head_a, head_e) as usize + unseen
}

pub fn partial_credit(max_points: u32, similarity: f64) -> u32 {
    (f64::from(max_points) * similarity.clamp(0.0, 1.0) * PARTIAL_CREDIT_FACTOR).floor() as u32
}

#[derive(Debug, Clone, Copy)]
pub struct Grader {
    points_per_weight: u32,
}

impl Grader {
    pub fn new(points_per_weight: u32) -> Self {
        Self { points_per_weight }
    }

    pub fn max_points(&self, case: &TestCase) -> u32 {
        case.weight.saturating_mul(self.points_per_weight)
    }

    /// Score one case. `index` is 0-based and names cases without an id.
    pub fn score_case(&self, index: usize, case: &TestCase, result: &ExecutionResult) -> TestCaseResult {
        let max_points = self.max_points(case);
        let exited_cleanly = result.exit_code == 0 && result.error.is_none();

        let passed = exited_cleanly && outputs_match(&result.stdout, &case.expected_output);
        let points_earned = if passed {
            max_points
        } else if exited_cleanly {
            partial_credit(max_points, similarity(&result.stdout, &case.expected_output))
        } else {
            0
        };

        let error = match result.error {
            Some(kind) => Some(kind),
            None if result.exit_code != 0 => Some(ErrorKind::RuntimeError),
            None => None,
        };

        let diagnostics = (case.hidden && !passed).then(|| CaseDiagnostics {
            input: case.input.clone(),
            expected_output: case.expected_output.clone(),
            actual_output: result.stdout.clone(),
            stderr: result.stderr.clone(),
        });

        let visible = |value: &str| (!case.hidden).then(|| value.to_string());

        TestCaseResult {
            test_id: case.id.clone().unwrap_or_else(|| (index + 1).to_string()),
            passed,
            hidden: case.hidden,
            input: visible(&case.input),
            expected_output: visible(&case.expected_output),
            actual_output: visible(&result.stdout),
            runtime_ms: result.runtime_ms,
            memory_kb: result.memory_kb,
            points_earned,
            max_points,
            error,
            diagnostics,
        }
    }

    pub fn aggregate(
        &self,
        execution_id: ExecutionId,
        results: Vec<TestCaseResult>,
        isolation: IsolationLevel,
    ) -> GradeReport {
        let points_earned: u32 = results.iter().map(|r| r.points_earned).sum();
        let max_points: u32 = results.iter().map(|r| r.max_points).sum();

        let score = if max_points == 0 {
            0
        } else {
            (100.0 * f64::from(points_earned) / f64::from(max_points)).round() as u32
        };
        let all_passed = !results.is_empty() && max_points > 0 && results.iter().all(|r| r.passed);

        GradeReport {
            execution_id,
            all_passed,
            score,
            points_earned,
            max_points,
            total_runtime_ms: results.iter().map(|r| r.runtime_ms).sum(),
            peak_memory_kb: results.iter().map(|r| r.memory_kb).max().unwrap_or(0),
            results,
            error: None,
            stderr: None,
            security_violation: false,
            isolation,
        }
    }
}
