//! Direct-process runner implementation
//!
//! Executes a submission as a plain child process in its own session with
//! rlimits applied before exec. Weaker than a container (shared kernel view,
//! shared uid) and therefore only used in restricted mode when explicitly
//! allowed.

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setsid, Pid};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{
    settle, wait_or_stop, PathLayout, RunLimits, RunOutcome, RunStatus, Runner, RunnableUnit,
    StopSignal, Stoppable,
};
use crate::config::EngineConfig;
use crate::core::{EngineError, IsolationLevel};
use crate::sandbox::{capture_into, SharedBuffer};

const MAX_FILE_BYTES: u64 = 16 * 1024 * 1024;
const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Runner that executes code as an rlimited child process
pub struct DirectRunner {
    kill_grace: Duration,
    sample_interval: Duration,
}

impl DirectRunner {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            kill_grace: Duration::from_millis(config.kill_grace_ms),
            sample_interval: Duration::from_millis(config.memory_sample_interval_ms),
        }
    }

    fn command(&self, unit: &RunnableUnit, limits: &RunLimits, has_stdin: bool) -> Result<Command, EngineError> {
        let (program, args) = unit
            .command
            .split_first()
            .ok_or_else(|| EngineError::Launch("empty command".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&unit.source_dir)
            .env_clear()
            .env("PATH", SAFE_PATH)
            .env("HOME", &unit.build_dir)
            .stdin(if has_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let cpu_seconds = u64::from(limits.time_ms).div_ceil(1000) + 1;
        let memory_bytes = u64::from(limits.memory_mb) * 1024 * 1024;
        let open_files = u64::from(limits.max_open_files);
        let processes = u64::from(limits.max_processes);

        // SAFETY: only async-signal-safe syscalls run between fork and exec
        unsafe {
            cmd.pre_exec(move || {
                setsid()?;
                setrlimit(Resource::RLIMIT_CPU, cpu_seconds, cpu_seconds)?;
                setrlimit(Resource::RLIMIT_AS, memory_bytes, memory_bytes)?;
                setrlimit(Resource::RLIMIT_NOFILE, open_files, open_files)?;
                setrlimit(Resource::RLIMIT_NPROC, processes, processes)?;
                setrlimit(Resource::RLIMIT_FSIZE, MAX_FILE_BYTES, MAX_FILE_BYTES)?;
                Ok(())
            });
        }

        Ok(cmd)
    }

    fn spawn_memory_sampler(&self, pid: u32, peak_kb: Arc<AtomicU64>) -> JoinHandle<()> {
        let interval = self.sample_interval;
        let status_path = format!("/proc/{}/status", pid);

        tokio::spawn(async move {
            loop {
                match tokio::fs::read_to_string(&status_path).await {
                    Ok(status) => {
                        if let Some(kb) = parse_vm_hwm(&status) {
                            peak_kb.fetch_max(kb, Ordering::Relaxed);
                        }
                    }
                    Err(_) => break,
                }
                tokio::time::sleep(interval).await;
            }
        })
    }
}

/// Peak resident set (`VmHWM`) in KB from a `/proc/<pid>/status` dump
fn parse_vm_hwm(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmHWM:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

/// The child's session; setsid made it the group leader
struct ProcessGroup(Pid);

impl ProcessGroup {
    fn signal(&self, signal: Signal) {
        if let Err(e) = killpg(self.0, signal) {
            debug!("killpg({}, {}) failed: {}", self.0, signal, e);
        }
    }
}

#[async_trait]
impl Stoppable for ProcessGroup {
    async fn stop(&self, signal: StopSignal) {
        self.signal(match signal {
            StopSignal::Terminate => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        });
    }
}

#[async_trait]
impl Runner for DirectRunner {
    fn isolation(&self) -> IsolationLevel {
        IsolationLevel::DirectProcess
    }

    fn layout(&self) -> PathLayout {
        PathLayout::Host
    }

    async fn run(
        &self,
        unit: &RunnableUnit,
        limits: &RunLimits,
        stdin: Option<&str>,
    ) -> Result<RunOutcome, EngineError> {
        debug!("Running {:?} as a direct process", unit.command);

        let started = Instant::now();
        let mut child = self
            .command(unit, limits, stdin.is_some())?
            .spawn()
            .map_err(|e| EngineError::Launch(format!("failed to spawn {:?}: {}", unit.command, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| EngineError::Launch("child exited before it could be tracked".into()))?;
        let group = ProcessGroup(Pid::from_raw(pid as i32));

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            let input = input.to_owned();
            tokio::spawn(async move {
                let _ = pipe.write_all(input.as_bytes()).await;
                let _ = pipe.shutdown().await;
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Launch("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Launch("stderr not captured".into()))?;
        let stdout_buf = SharedBuffer::new(limits.max_output_bytes);
        let stderr_buf = SharedBuffer::new(limits.max_output_bytes);
        let stdout_task = tokio::spawn(capture_into(stdout, stdout_buf.clone()));
        let stderr_task = tokio::spawn(capture_into(stderr, stderr_buf.clone()));

        let peak_kb = Arc::new(AtomicU64::new(0));
        let sampler = self.spawn_memory_sampler(pid, peak_kb.clone());

        let time_limit = Duration::from_millis(u64::from(limits.time_ms));
        let exit = wait_or_stop(child.wait(), time_limit, self.kill_grace, &group).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        sampler.abort();

        // stragglers left in the group would keep the pipes open
        group.signal(Signal::SIGKILL);
        let exit = exit.transpose()?;
        settle(stdout_task, self.kill_grace).await;
        settle(stderr_task, self.kill_grace).await;
        let stdout = stdout_buf.take();
        let stderr = stderr_buf.take();

        let (status, runtime_ms) = match exit {
            None => (RunStatus::TimeLimitExceeded, u64::from(limits.time_ms)),
            Some(status) => match (status.code(), status.signal()) {
                (Some(code), _) => (RunStatus::Exited(code), elapsed_ms),
                (None, Some(sig)) if sig == Signal::SIGXCPU as i32 => {
                    (RunStatus::TimeLimitExceeded, u64::from(limits.time_ms))
                }
                (None, Some(sig)) => (RunStatus::Signaled(sig), elapsed_ms),
                (None, None) => (RunStatus::Signaled(0), elapsed_ms),
            },
        };

        Ok(RunOutcome {
            status,
            runtime_ms,
            memory_kb: peak_kb.load(Ordering::Relaxed),
            truncated: stdout.truncated || stderr.truncated,
            stdout: stdout.text,
            stderr: stderr.text,
        })
    }
}
