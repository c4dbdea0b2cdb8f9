//! Compiler module - Source code compilation
//!
//! Runs the compile unit of a pipeline through the same runner that will
//! execute the program, with the compile time/memory limits, and turns the
//! outcome into a pass/fail with diagnostics.

use tracing::debug;

use crate::core::EngineError;
use crate::runner::{RunLimits, RunStatus, Runner, RunnableUnit};

/// Compilers fork helpers (cc1plus, as, ld) and the JVM starts many threads
const COMPILE_MIN_PROCESSES: u32 = 128;

/// Result of a compilation attempt
#[derive(Debug, Clone)]
pub struct CompileResult {
    pub success: bool,
    pub message: Option<String>,
    pub runtime_ms: u64,
    pub memory_kb: u64,
}

/// Limits for the compile stage, derived from the run limits
pub fn compile_limits(run_limits: &RunLimits, time_limit_ms: u32, memory_limit_mb: u32) -> RunLimits {
    RunLimits {
        time_ms: time_limit_ms,
        memory_mb: memory_limit_mb,
        max_processes: run_limits.max_processes.max(COMPILE_MIN_PROCESSES),
        ..run_limits.clone()
    }
}

/// Compile a prepared unit
pub async fn compile(
    runner: &dyn Runner,
    unit: &RunnableUnit,
    limits: &RunLimits,
) -> Result<CompileResult, EngineError> {
    debug!("Compiling with {:?}", unit.command);

    let outcome = runner.run(unit, limits, None).await?;

    if outcome.is_success() {
        return Ok(CompileResult {
            success: true,
            message: None,
            runtime_ms: outcome.runtime_ms,
            memory_kb: outcome.memory_kb,
        });
    }

    let message = if !outcome.stderr.trim().is_empty() {
        outcome.stderr
    } else if !outcome.stdout.trim().is_empty() {
        outcome.stdout
    } else {
        match outcome.status {
            RunStatus::TimeLimitExceeded => "Compilation timed out".to_string(),
            RunStatus::MemoryLimitExceeded => "Compiler ran out of memory".to_string(),
            RunStatus::Signaled(_) => "Compiler crashed".to_string(),
            RunStatus::Exited(code) => format!("Compilation failed with exit code {}", code),
        }
    };

    Ok(CompileResult {
        success: false,
        message: Some(message),
        runtime_ms: outcome.runtime_ms,
        memory_kb: outcome.memory_kb,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ExecutionId, IsolationLevel};
    use crate::languages::Language;
    use crate::runner::{PathLayout, RunOutcome, Stage};
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct ScriptedRunner(RunOutcome);

    #[async_trait]
    impl Runner for ScriptedRunner {
        fn isolation(&self) -> IsolationLevel {
            IsolationLevel::Container
        }

        fn layout(&self) -> PathLayout {
            PathLayout::Mounted
        }

        async fn run(
            &self,
            _unit: &RunnableUnit,
            _limits: &RunLimits,
            _stdin: Option<&str>,
        ) -> Result<RunOutcome, EngineError> {
            Ok(self.0.clone())
        }
    }

    fn outcome(status: RunStatus, stderr: &str) -> RunOutcome {
        RunOutcome {
            status,
            runtime_ms: 10,
            memory_kb: 100,
            stdout: String::new(),
            stderr: stderr.to_string(),
            truncated: false,
        }
    }

    fn unit() -> RunnableUnit {
        RunnableUnit {
            execution_id: ExecutionId::new(),
            language: Language::Cpp,
            stage: Stage::Compile,
            image: "gcc:13".into(),
            command: vec!["g++".into()],
            source_dir: PathBuf::from("/s"),
            build_dir: PathBuf::from("/b"),
            source: String::new(),
        }
    }

    fn limits() -> RunLimits {
        RunLimits {
            time_ms: 1000,
            memory_mb: 128,
            max_output_bytes: 1024,
            max_processes: 16,
            max_open_files: 64,
            cpu_share: 0.5,
        }
    }

    #[tokio::test]
    async fn test_successful_compile() {
        let runner = ScriptedRunner(outcome(RunStatus::Exited(0), ""));
        let result = compile(&runner, &unit(), &limits()).await.unwrap();
        assert!(result.success);
        assert!(result.message.is_none());
    }

    #[tokio::test]
    async fn test_diagnostics_are_reported() {
        let runner = ScriptedRunner(outcome(
            RunStatus::Exited(1),
            "main.cpp:1:1: error: expected ';'",
        ));
        let result = compile(&runner, &unit(), &limits()).await.unwrap();
        assert!(!result.success);
        assert!(result.message.unwrap().contains("main.cpp:1:1"));
    }

    #[tokio::test]
    async fn test_silent_timeout_gets_message() {
        let runner = ScriptedRunner(outcome(RunStatus::TimeLimitExceeded, ""));
        let result = compile(&runner, &unit(), &limits()).await.unwrap();
        assert_eq!(result.message.as_deref(), Some("Compilation timed out"));
    }

    #[test]
    fn test_compile_limits() {
        let derived = compile_limits(&limits(), 30_000, 1024);
        assert_eq!(derived.time_ms, 30_000);
        assert_eq!(derived.memory_mb, 1024);
        assert_eq!(derived.max_processes, COMPILE_MIN_PROCESSES);
        assert_eq!(derived.max_open_files, 64);
    }
}
