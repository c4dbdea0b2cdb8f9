//! Engine module - execution and grading orchestration
//!
//! Validates a request, picks the backend the capability mode allows, prepares
//! the language pipeline in a fresh workspace, compiles once and runs. Every
//! failure leaves as a structured result: submission defects carry their
//! [`ErrorKind`], operational failures become `infrastructure_error`.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::compiler::{compile, compile_limits};
use crate::config::EngineConfig;
use crate::core::{
    EngineError, ErrorKind, ExecutionId, ExecutionRequest, ExecutionResult, IsolationLevel,
    ABNORMAL_EXIT_CODE, TIMEOUT_MARKER,
};
use crate::grader::{GradeReport, Grader};
use crate::languages::{LanguageConfig, LanguageTable, RestrictedPath};
use crate::metrics::{scratch_writable, ExecutionMetrics, HealthReport};
use crate::pipeline::{prepare, PreparedPipeline, Workspace};
use crate::policy::PolicyTable;
use crate::runner::{
    ContainerRunner, DirectRunner, RunLimits, RunOutcome, RunStatus, Runner, SafeModeRunner,
};
use crate::sandbox::SandboxMode;
use crate::validator::{CodeValidator, Validated};

/// Exit code reported when compilation fails
const COMPILATION_FAILED_EXIT_CODE: i32 = 1;
const MEMORY_LIMIT_MARKER: &str = "Memory limit exceeded";

/// Everything one invocation owns between validation and cleanup
struct Session<'a> {
    execution_id: ExecutionId,
    runner: &'a dyn Runner,
    workspace: Workspace,
    pipeline: PreparedPipeline,
    /// Limit as requested, before the language adjustment
    configured_time_ms: u32,
    run_limits: RunLimits,
    compile_limits: RunLimits,
}

impl Session<'_> {
    fn isolation(&self) -> IsolationLevel {
        self.runner.isolation()
    }

    fn close(self) {
        let path = self.workspace.path().to_path_buf();
        if let Err(e) = self.workspace.cleanup() {
            warn!("Failed to remove workspace {}: {}", path.display(), e);
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    mode: SandboxMode,
    policies: Arc<PolicyTable>,
    validator: CodeValidator,
    /// Container backend; present only in secure mode
    secure: Option<Box<dyn Runner>>,
    safe_mode: SafeModeRunner,
    direct: DirectRunner,
    grader: Grader,
    metrics: Arc<ExecutionMetrics>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        mode: SandboxMode,
        languages: Arc<LanguageTable>,
        policies: Arc<PolicyTable>,
    ) -> Self {
        let secure = if mode.is_secure() {
            match ContainerRunner::connect(&config) {
                Ok(runner) => Some(Box::new(runner) as Box<dyn Runner>),
                Err(e) => {
                    error!("Failed to build the container client: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Self::with_secure_runner(config, mode, languages, policies, secure)
    }

    /// Build with an explicit secure-mode backend
    pub fn with_secure_runner(
        config: EngineConfig,
        mode: SandboxMode,
        languages: Arc<LanguageTable>,
        policies: Arc<PolicyTable>,
        secure: Option<Box<dyn Runner>>,
    ) -> Self {
        Self {
            validator: CodeValidator::new(languages, Arc::clone(&policies)),
            secure,
            safe_mode: SafeModeRunner::new(),
            direct: DirectRunner::new(&config),
            grader: Grader::new(config.points_per_weight),
            metrics: ExecutionMetrics::new(),
            policies,
            mode,
            config,
        }
    }

    pub fn mode(&self) -> SandboxMode {
        self.mode
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<ExecutionMetrics> {
        &self.metrics
    }

    /// Run a submission once with the request's stdin
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let execution_id = ExecutionId::new();
        let guard = self.metrics.start(execution_id, request);
        info!("Executing {} ({})", execution_id, request.language);

        let result = self.execute_once(execution_id, request).await;

        guard.finish(result.exit_code, result.error);
        info!(
            "Execution {} finished: exit={} error={:?} runtime={}ms memory={}KB",
            execution_id, result.exit_code, result.error, result.runtime_ms, result.memory_kb
        );
        result
    }

    /// Compile once, run every test case in order, and score the runs
    pub async fn execute_with_test_cases(&self, request: &ExecutionRequest) -> GradeReport {
        let execution_id = ExecutionId::new();
        let guard = self.metrics.start(execution_id, request);
        info!(
            "Grading {} ({}, {} test cases)",
            execution_id,
            request.language,
            request.test_cases.len()
        );

        let report = self.grade(execution_id, request).await;

        let exit_code = match report.error {
            None => 0,
            Some(ErrorKind::SecurityViolation) | Some(ErrorKind::CompilationError) => 1,
            Some(_) => ABNORMAL_EXIT_CODE,
        };
        guard.finish(exit_code, report.error);
        info!(
            "Grading {} finished: score={} passed={} error={:?}",
            execution_id, report.score, report.all_passed, report.error
        );
        report
    }

    pub fn health_check(&self) -> HealthReport {
        HealthReport::new(
            self.mode,
            scratch_writable(&self.config.scratch_root),
            self.policies.is_loaded(),
            &self.metrics,
        )
    }

    async fn execute_once(&self, execution_id: ExecutionId, request: &ExecutionRequest) -> ExecutionResult {
        let validated = match self.validator.validate(&request.code, &request.language) {
            Ok(validated) => validated,
            Err(e) => {
                warn!("Rejected {}: {}", execution_id, e);
                return ExecutionResult::security_violation(execution_id, e.to_string());
            }
        };

        let session = match self.open_session(execution_id, request, validated) {
            Ok(session) => session,
            Err(e) => return infrastructure(execution_id, e),
        };

        let result = match self.compile_stage(&session).await {
            Ok(Some(failed)) => failed,
            Ok(None) => self
                .run_stage(&session, request.stdin.as_deref())
                .await
                .unwrap_or_else(|e| infrastructure(execution_id, e)),
            Err(e) => infrastructure(execution_id, e),
        };

        session.close();
        result
    }

    async fn grade(&self, execution_id: ExecutionId, request: &ExecutionRequest) -> GradeReport {
        let validated = match self.validator.validate(&request.code, &request.language) {
            Ok(validated) => validated,
            Err(e) => {
                warn!("Rejected {}: {}", execution_id, e);
                return GradeReport::failed(&ExecutionResult::security_violation(execution_id, e.to_string()));
            }
        };

        if request.test_cases.is_empty() {
            return self.grader.aggregate(execution_id, Vec::new(), IsolationLevel::None);
        }

        let session = match self.open_session(execution_id, request, validated) {
            Ok(session) => session,
            Err(e) => return GradeReport::failed(&infrastructure(execution_id, e)),
        };

        let report = match self.compile_stage(&session).await {
            Ok(Some(failed)) => GradeReport::failed(&failed),
            Ok(None) => self.run_test_cases(&session, request).await,
            Err(e) => GradeReport::failed(&infrastructure(execution_id, e)),
        };

        session.close();
        report
    }

    async fn run_test_cases(&self, session: &Session<'_>, request: &ExecutionRequest) -> GradeReport {
        let mut results = Vec::with_capacity(request.test_cases.len());

        for (index, case) in request.test_cases.iter().enumerate() {
            let run = match self.run_stage(session, Some(&case.input)).await {
                Ok(run) => run,
                Err(e) => return GradeReport::failed(&infrastructure(session.execution_id, e)),
            };
            let scored = self.grader.score_case(index, case, &run);
            info!(
                "Test case {}/{}: passed={} points={}/{}",
                index + 1,
                request.test_cases.len(),
                scored.passed,
                scored.points_earned,
                scored.max_points
            );
            results.push(scored);
        }

        self.grader.aggregate(session.execution_id, results, session.isolation())
    }

    /// Pick the backend for a language under the current capability mode
    fn select_runner(&self, language: &LanguageConfig) -> Result<&dyn Runner, EngineError> {
        if self.mode.is_secure() {
            return self
                .secure
                .as_deref()
                .ok_or_else(|| EngineError::RuntimeUnavailable("no container client".into()));
        }
        match language.restricted {
            RestrictedPath::InProcess => Ok(&self.safe_mode),
            RestrictedPath::DirectProcess if self.config.allow_direct_process => Ok(&self.direct),
            RestrictedPath::DirectProcess | RestrictedPath::Unsupported => Err(
                EngineError::UnsupportedInRestrictedMode(language.language.to_string()),
            ),
        }
    }

    /// Resolve limits, pick a backend, then create the workspace and write the source.
    /// Nothing touches the filesystem until a backend is known to exist.
    fn open_session(
        &self,
        execution_id: ExecutionId,
        request: &ExecutionRequest,
        validated: Validated<'_>,
    ) -> Result<Session<'_>, EngineError> {
        let language = validated.language;
        let runner = self.select_runner(language)?;

        let base_time = request.time_limit(self.config.default_time_limit_ms);
        let base_memory = request.memory_limit_mb.unwrap_or(language.default_memory_mb);
        let run_limits = RunLimits::new(
            language.calculate_time_limit(base_time),
            language.calculate_memory_limit(base_memory),
            validated.policy,
        );
        let compile_limits = compile_limits(
            &run_limits,
            self.config.compile_time_limit_ms,
            self.config.compile_memory_limit_mb,
        );

        let workspace = Workspace::create(&self.config.scratch_root, &execution_id)?;
        let pipeline = prepare(
            language,
            &request.code,
            execution_id,
            &workspace,
            runner.layout(),
            &run_limits,
            self.config.compile_memory_limit_mb,
        )?;

        Ok(Session {
            execution_id,
            runner,
            workspace,
            pipeline,
            configured_time_ms: base_time,
            run_limits,
            compile_limits,
        })
    }

    /// `Ok(Some(result))` when compilation failed and execution must stop
    async fn compile_stage(&self, session: &Session<'_>) -> Result<Option<ExecutionResult>, EngineError> {
        let Some(unit) = &session.pipeline.compile else {
            return Ok(None);
        };

        let compiled = compile(session.runner, unit, &session.compile_limits).await?;
        if compiled.success {
            return Ok(None);
        }

        info!("Compilation failed for {}", session.execution_id);
        Ok(Some(ExecutionResult {
            execution_id: session.execution_id,
            stdout: String::new(),
            stderr: compiled.message.unwrap_or_default(),
            exit_code: COMPILATION_FAILED_EXIT_CODE,
            runtime_ms: compiled.runtime_ms,
            memory_kb: compiled.memory_kb,
            error: Some(ErrorKind::CompilationError),
            security_violation: false,
            isolation: session.isolation(),
            output_truncated: false,
        }))
    }

    async fn run_stage(&self, session: &Session<'_>, stdin: Option<&str>) -> Result<ExecutionResult, EngineError> {
        let outcome = session
            .runner
            .run(&session.pipeline.run, &session.run_limits, stdin)
            .await?;
        Ok(to_result(
            session.execution_id,
            session.isolation(),
            session.configured_time_ms,
            outcome,
        ))
    }
}

fn infrastructure(execution_id: ExecutionId, e: EngineError) -> ExecutionResult {
    error!("Execution {} failed: {}", execution_id, e);
    ExecutionResult::infrastructure(execution_id, e.to_string())
}

/// Classify a raw outcome. A timed-out run reports the configured limit, not
/// the language-adjusted one it was killed at.
fn to_result(
    execution_id: ExecutionId,
    isolation: IsolationLevel,
    configured_time_ms: u32,
    outcome: RunOutcome,
) -> ExecutionResult {
    let runtime_ms = match outcome.status {
        RunStatus::TimeLimitExceeded => u64::from(configured_time_ms),
        _ => outcome.runtime_ms,
    };
    let (error, stderr) = match outcome.status {
        RunStatus::Exited(0) => (None, outcome.stderr),
        RunStatus::Exited(_) | RunStatus::Signaled(_) => (Some(ErrorKind::RuntimeError), outcome.stderr),
        RunStatus::TimeLimitExceeded => (Some(ErrorKind::Timeout), TIMEOUT_MARKER.to_string()),
        RunStatus::MemoryLimitExceeded => {
            let stderr = if outcome.stderr.trim().is_empty() {
                MEMORY_LIMIT_MARKER.to_string()
            } else {
                outcome.stderr
            };
            (Some(ErrorKind::MemoryLimitExceeded), stderr)
        }
    };

    ExecutionResult {
        execution_id,
        stdout: outcome.stdout,
        stderr,
        exit_code: outcome.status.exit_code(),
        runtime_ms,
        memory_kb: outcome.memory_kb,
        error,
        security_violation: false,
        isolation,
        output_truncated: outcome.truncated,
    }
}
