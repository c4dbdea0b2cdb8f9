//! Runner module - Execution abstraction layer
//!
//! This module provides a unified interface for running one prepared unit:
//! - `ContainerRunner`: isolated container per run (secure mode)
//! - `SafeModeRunner`: embedded JavaScript interpreter (restricted mode)
//! - `DirectRunner`: rlimited child process (restricted mode, opt-in)
//!
//! The runner module does NOT:
//! - Compare outputs or score anything
//! - Validate source code
//! - Decide which backend handles a language

pub mod container;
pub mod direct;
pub mod safe_mode;

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::{EngineError, ExecutionId, IsolationLevel, ABNORMAL_EXIT_CODE};
use crate::languages::Language;
use crate::policy::SecurityPolicy;

pub use container::ContainerRunner;
pub use direct::DirectRunner;
pub use safe_mode::SafeModeRunner;

/// Which step of a language pipeline a unit belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Compile,
    Run,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Compile => "compile",
            Stage::Run => "run",
        }
    }
}

/// How a runner sees the scratch directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathLayout {
    /// Source and build directories are mounted at fixed container paths
    Mounted,
    /// Host paths are used as-is
    Host,
    /// No filesystem; the source text is evaluated directly
    InProcess,
}

/// A command ready to hand to a runner
#[derive(Debug, Clone)]
pub struct RunnableUnit {
    pub execution_id: ExecutionId,
    pub language: Language,
    pub stage: Stage,
    pub image: String,
    /// Fully resolved command (empty for in-process evaluation)
    pub command: Vec<String>,
    pub source_dir: PathBuf,
    pub build_dir: PathBuf,
    /// Wrapped source text, evaluated directly by in-process runners
    pub source: String,
}

/// Resource limits for one run
#[derive(Debug, Clone)]
pub struct RunLimits {
    /// Wall-clock limit in milliseconds
    pub time_ms: u32,
    /// Memory ceiling in MB
    pub memory_mb: u32,
    /// Per-stream cap on captured output
    pub max_output_bytes: usize,
    pub max_processes: u32,
    pub max_open_files: u32,
    pub cpu_share: f64,
}

impl RunLimits {
    pub fn new(time_ms: u32, memory_mb: u32, policy: &SecurityPolicy) -> Self {
        Self {
            time_ms,
            memory_mb,
            max_output_bytes: policy.max_output_bytes,
            max_processes: policy.max_processes,
            max_open_files: policy.max_open_files,
            cpu_share: policy.cpu_share,
        }
    }
}

/// Execution status (raw, no scoring)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Program exited normally with given exit code
    Exited(i32),
    /// Killed by the wall-clock timer
    TimeLimitExceeded,
    /// Killed for exceeding the memory ceiling
    MemoryLimitExceeded,
    /// Killed by signal
    Signaled(i32),
}

impl RunStatus {
    /// Check if execution was successful (exited with code 0)
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Exited(0))
    }

    /// Shell-style exit code; -1 for runs the engine killed
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Exited(code) => *code,
            RunStatus::Signaled(signal) => 128 + signal,
            RunStatus::TimeLimitExceeded | RunStatus::MemoryLimitExceeded => ABNORMAL_EXIT_CODE,
        }
    }
}

/// Outcome of running a program
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Wall-clock time in milliseconds
    pub runtime_ms: u64,
    /// Peak memory observed in KB (best effort)
    pub memory_kb: u64,
    pub stdout: String,
    pub stderr: String,
    /// Either stream hit its byte cap
    pub truncated: bool,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Runner trait for executing prepared units
#[async_trait]
pub trait Runner: Send + Sync {
    /// Isolation reported on results produced by this runner
    fn isolation(&self) -> IsolationLevel;

    /// How commands for this runner refer to the scratch directory
    fn layout(&self) -> PathLayout;

    /// Run a unit with the given limits and optional stdin
    async fn run(
        &self,
        unit: &RunnableUnit,
        limits: &RunLimits,
        stdin: Option<&str>,
    ) -> Result<RunOutcome, EngineError>;
}

/// Step of the stop sequence sent to a program past its time limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Terminate,
    Kill,
}

impl StopSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopSignal::Terminate => "SIGTERM",
            StopSignal::Kill => "SIGKILL",
        }
    }
}

/// Something a runner can signal: a process group, a container
#[async_trait]
pub trait Stoppable: Send + Sync {
    async fn stop(&self, signal: StopSignal);
}

/// Await `exited` under `limit`. Past the limit the target gets SIGTERM,
/// then SIGKILL once `grace` runs out. `None` means the limit was hit.
pub async fn wait_or_stop<F>(
    exited: F,
    limit: Duration,
    grace: Duration,
    target: &dyn Stoppable,
) -> Option<F::Output>
where
    F: Future,
{
    tokio::pin!(exited);
    if let Ok(output) = tokio::time::timeout(limit, &mut exited).await {
        return Some(output);
    }

    debug!("Time limit of {:?} exceeded, terminating", limit);
    target.stop(StopSignal::Terminate).await;
    if tokio::time::timeout(grace, &mut exited).await.is_err() {
        target.stop(StopSignal::Kill).await;
    }
    None
}

/// Give an output reader `grace` to reach EOF, then abort it.
/// A descendant that escaped the kill can hold a pipe open indefinitely.
pub async fn settle<T>(mut reader: JoinHandle<T>, grace: Duration) -> Option<T> {
    match tokio::time::timeout(grace, &mut reader).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!("Output reader failed: {}", e);
            None
        }
        Err(_) => {
            warn!("Output still open {:?} after exit, keeping what was read", grace);
            reader.abort();
            None
        }
    }
}
