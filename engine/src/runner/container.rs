//! Container runner implementation
//!
//! Executes untrusted code in a fresh container per run: create, attach,
//! start, enforce the wall clock, sample memory, inspect, remove.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::{AttachContainerOptions, AttachContainerResults, LogOutput, StartContainerOptions};
use bollard::Docker;
use futures::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    settle, wait_or_stop, PathLayout, RunLimits, RunOutcome, RunStatus, Runner, RunnableUnit, Stage,
    StopSignal, Stoppable,
};
use crate::config::EngineConfig;
use crate::core::{EngineError, IsolationLevel};
use crate::sandbox::container::{self, ContainerGuard, ContainerSpec};
use crate::sandbox::SharedBuffer;

type AttachedOutput = Pin<Box<dyn Stream<Item = Result<LogOutput, bollard::errors::Error>> + Send>>;

/// Runner that executes code in a throwaway container
pub struct ContainerRunner {
    docker: Docker,
    user: String,
    tmpfs_mb: u32,
    kill_grace: Duration,
    sample_interval: Duration,
}

/// A running container as the stop sequence sees it
struct RunningContainer<'a> {
    docker: &'a Docker,
    name: &'a str,
}

#[async_trait]
impl Stoppable for RunningContainer<'_> {
    async fn stop(&self, signal: StopSignal) {
        container::kill(self.docker, self.name, signal.as_str()).await;
    }
}

impl ContainerRunner {
    pub fn connect(config: &EngineConfig) -> Result<Self, EngineError> {
        Ok(Self {
            docker: container::connect(config)?,
            user: config.sandbox_user.clone(),
            tmpfs_mb: config.scratch_tmpfs_mb,
            kill_grace: Duration::from_millis(config.kill_grace_ms),
            sample_interval: Duration::from_millis(config.memory_sample_interval_ms),
        })
    }

    /// Attach, start the created container, feed stdin and wait under the time limit
    async fn attach(
        &self,
        name: &str,
        limits: &RunLimits,
        stdin: Option<&str>,
    ) -> Result<RunOutcome, EngineError> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(stdin.is_some()),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            ..Default::default()
        };
        let AttachContainerResults { output, mut input } = self
            .docker
            .attach_container(name, Some(options))
            .await
            .map_err(|e| EngineError::Launch(format!("failed to attach to container {}: {}", name, e)))?;

        let stdout = SharedBuffer::new(limits.max_output_bytes);
        let stderr = SharedBuffer::new(limits.max_output_bytes);
        let reader = tokio::spawn(collect_output(output, stdout.clone(), stderr.clone()));

        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| EngineError::Launch(format!("failed to start container {}: {}", name, e)))?;
        let started = Instant::now();

        if let Some(data) = stdin {
            let data = data.to_owned();
            tokio::spawn(async move {
                // the program may exit without reading; a broken pipe is expected
                let _ = input.write_all(data.as_bytes()).await;
                let _ = input.shutdown().await;
            });
        }

        let peak_kb = Arc::new(AtomicU64::new(0));
        let sampler = self.spawn_memory_sampler(name, peak_kb.clone());

        let time_limit = Duration::from_millis(u64::from(limits.time_ms));
        let target = RunningContainer {
            docker: &self.docker,
            name,
        };
        let exited = wait_or_stop(
            container::wait_for_exit(&self.docker, name),
            time_limit,
            self.kill_grace,
            &target,
        )
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        sampler.abort();

        let timed_out = match exited {
            Some(result) => {
                result?;
                false
            }
            None => true,
        };

        settle(reader, self.kill_grace).await;
        let stdout = stdout.take();
        let stderr = stderr.take();

        let (status, runtime_ms) = if timed_out {
            (RunStatus::TimeLimitExceeded, u64::from(limits.time_ms))
        } else {
            match container::inspect(&self.docker, name).await {
                Some(state) if state.oom_killed => (RunStatus::MemoryLimitExceeded, elapsed_ms),
                Some(state) => (RunStatus::Exited(state.exit_code), elapsed_ms),
                None => {
                    return Err(EngineError::Launch(format!(
                        "container {} vanished before inspection",
                        name
                    )))
                }
            }
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

    fn spawn_memory_sampler(&self, name: &str, peak_kb: Arc<AtomicU64>) -> JoinHandle<()> {
        let docker = self.docker.clone();
        let name = name.to_owned();
        let interval = self.sample_interval;

        tokio::spawn(async move {
            loop {
                if let Some(kb) = container::sample_memory_kb(&docker, &name).await {
                    peak_kb.fetch_max(kb, Ordering::Relaxed);
                }
                tokio::time::sleep(interval).await;
            }
        })
    }
}

/// Demultiplex the attach stream into the two capped buffers
async fn collect_output(mut output: AttachedOutput, stdout: SharedBuffer, stderr: SharedBuffer) {
    while let Some(frame) = output.next().await {
        match frame {
            Ok(LogOutput::StdOut { message }) => {
                stdout.push(&message);
            }
            Ok(LogOutput::StdErr { message }) => {
                stderr.push(&message);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Attach stream failed: {}", e);
                break;
            }
        }
    }
}

#[async_trait]
impl Runner for ContainerRunner {
    fn isolation(&self) -> IsolationLevel {
        IsolationLevel::Container
    }

    fn layout(&self) -> PathLayout {
        PathLayout::Mounted
    }

    async fn run(
        &self,
        unit: &RunnableUnit,
        limits: &RunLimits,
        stdin: Option<&str>,
    ) -> Result<RunOutcome, EngineError> {
        let name = container::container_name(&unit.execution_id, unit.stage.as_str());
        let spec = ContainerSpec {
            name: name.clone(),
            image: &unit.image,
            command: &unit.command,
            source_dir: &unit.source_dir,
            build_dir: &unit.build_dir,
            build_writable: unit.stage == Stage::Compile,
            memory_mb: limits.memory_mb,
            cpu_share: limits.cpu_share,
            max_processes: limits.max_processes,
            max_open_files: limits.max_open_files,
            tmpfs_mb: self.tmpfs_mb,
            user: &self.user,
            interactive: stdin.is_some(),
        };

        container::create(&self.docker, &spec).await?;
        let guard = ContainerGuard::new(&self.docker, &name);
        debug!("Created container {}", name);

        let result = self.attach(&name, limits, stdin).await;
        guard.remove().await;
        result
    }
}
