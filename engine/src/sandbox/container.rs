//! Container lifecycle helpers
//!
//! Low-level wrapper around the Docker Engine API. Builds the container
//! config carrying every isolation setting, reads memory usage and final
//! state, and owns removal of the container on every exit path.
//!
//! This module does NOT:
//! - Interpret exit statuses (that's the runner's job)
//! - Know about languages or compilation

use std::collections::HashMap;
use std::path::Path;

use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, RemoveContainerOptions, StatsOptions,
    WaitContainerOptions,
};
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::core::{EngineError, ExecutionId};

/// Mount point of the read-only source directory
pub const CONTAINER_SRC: &str = "/code";
/// Mount point of the build directory
pub const CONTAINER_BUILD: &str = "/build";

const ENGINE_LABEL: (&str, &str) = ("exec-engine.managed", "true");
const CLIENT_TIMEOUT_SECS: u64 = 120;
const NANO_CPUS_PER_CPU: f64 = 1_000_000_000.0;

/// Everything `create_container` needs for one sandboxed run
#[derive(Debug, Clone)]
pub struct ContainerSpec<'a> {
    pub name: String,
    pub image: &'a str,
    pub command: &'a [String],
    pub source_dir: &'a Path,
    pub build_dir: &'a Path,
    /// Build directory is writable only while compiling
    pub build_writable: bool,
    pub memory_mb: u32,
    pub cpu_share: f64,
    pub max_processes: u32,
    pub max_open_files: u32,
    pub tmpfs_mb: u32,
    pub user: &'a str,
    /// Keep stdin open so input can be attached
    pub interactive: bool,
}

/// Client for the configured daemon. Building it does no I/O.
pub fn connect(config: &EngineConfig) -> Result<Docker, EngineError> {
    let docker = match &config.docker_socket {
        Some(socket) => Docker::connect_with_socket(
            &socket.to_string_lossy(),
            CLIENT_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        ),
        None => Docker::connect_with_local_defaults(),
    };
    docker.map_err(|e| EngineError::RuntimeUnavailable(e.to_string()))
}

/// Container name for one stage of one execution
pub fn container_name(execution_id: &ExecutionId, stage: &str) -> String {
    format!("exec-{}-{}", execution_id.short(), stage)
}

fn ulimit(name: &str, value: u32) -> ResourcesUlimits {
    ResourcesUlimits {
        name: Some(name.to_string()),
        soft: Some(i64::from(value)),
        hard: Some(i64::from(value)),
    }
}

/// Build the container config. Pure so the isolation settings can be tested
/// without a daemon.
pub fn container_config(spec: &ContainerSpec<'_>) -> Config<String> {
    let memory = i64::from(spec.memory_mb) * 1024 * 1024;
    let build_mode = if spec.build_writable { "rw" } else { "ro" };

    let host_config = HostConfig {
        network_mode: Some("none".to_string()),
        memory: Some(memory),
        // equal to memory: no swap on top of the ceiling
        memory_swap: Some(memory),
        nano_cpus: Some((spec.cpu_share * NANO_CPUS_PER_CPU) as i64),
        pids_limit: Some(i64::from(spec.max_processes)),
        readonly_rootfs: Some(true),
        tmpfs: Some(HashMap::from([(
            "/tmp".to_string(),
            format!("rw,noexec,nosuid,size={}m", spec.tmpfs_mb),
        )])),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        ulimits: Some(vec![
            ulimit("nofile", spec.max_open_files),
            ulimit("nproc", spec.max_processes),
        ]),
        binds: Some(vec![
            format!("{}:{}:ro", spec.source_dir.display(), CONTAINER_SRC),
            format!("{}:{}:{}", spec.build_dir.display(), CONTAINER_BUILD, build_mode),
        ]),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.to_string()),
        cmd: Some(spec.command.to_vec()),
        user: Some(spec.user.to_string()),
        working_dir: Some(CONTAINER_SRC.to_string()),
        env: Some(vec!["HOME=/tmp".to_string()]),
        labels: Some(HashMap::from([(
            ENGINE_LABEL.0.to_string(),
            ENGINE_LABEL.1.to_string(),
        )])),
        network_disabled: Some(true),
        attach_stdin: Some(spec.interactive),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        open_stdin: Some(spec.interactive),
        stdin_once: Some(spec.interactive),
        tty: Some(false),
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// Create the container. Launch failures (daemon down, image missing) are
/// infrastructure errors.
pub async fn create(docker: &Docker, spec: &ContainerSpec<'_>) -> Result<(), EngineError> {
    debug!("Creating container {} from {}", spec.name, spec.image);

    let options = CreateContainerOptions {
        name: spec.name.as_str(),
        platform: None,
    };
    docker
        .create_container(Some(options), container_config(spec))
        .await
        .map_err(|e| EngineError::Launch(format!("failed to create container {}: {}", spec.name, e)))?;
    Ok(())
}

/// Resolve once the container stops running, whatever its exit code
pub async fn wait_for_exit(docker: &Docker, name: &str) -> Result<(), EngineError> {
    let options = WaitContainerOptions {
        condition: "not-running",
    };
    let mut stream = Box::pin(docker.wait_container(name, Some(options)));

    match stream.next().await {
        // a non-zero exit arrives as an error carrying the code
        Some(Ok(_)) | Some(Err(bollard::errors::Error::DockerContainerWaitError { .. })) => Ok(()),
        Some(Err(e)) => Err(EngineError::Launch(format!("waiting on container {} failed: {}", name, e))),
        None => Err(EngineError::Launch(format!("wait stream for container {} ended", name))),
    }
}

/// Send a signal to the container's init process
pub async fn kill(docker: &Docker, name: &str, signal: &str) {
    let options = KillContainerOptions { signal };
    if let Err(e) = docker.kill_container(name, Some(options)).await {
        // the container may have exited between the timeout and the signal
        debug!("Failed to send {} to container {}: {}", signal, name, e);
    }
}

/// Current memory usage in KB, None when the container is gone
pub async fn sample_memory_kb(docker: &Docker, name: &str) -> Option<u64> {
    let options = StatsOptions {
        stream: false,
        one_shot: true,
    };
    let mut stream = Box::pin(docker.stats(name, Some(options)));
    let stats = stream.next().await?.ok()?;
    stats.memory_stats.usage.map(|bytes| bytes / 1024)
}

/// Final state of an exited container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerState {
    pub exit_code: i32,
    pub oom_killed: bool,
}

pub async fn inspect(docker: &Docker, name: &str) -> Option<ContainerState> {
    let response = match docker.inspect_container(name, None).await {
        Ok(response) => response,
        Err(e) => {
            warn!("Failed to inspect container {}: {}", name, e);
            return None;
        }
    };
    let state = response.state?;
    Some(ContainerState {
        exit_code: state.exit_code.and_then(|code| i32::try_from(code).ok())?,
        oom_killed: state.oom_killed.unwrap_or(false),
    })
}

async fn remove(docker: &Docker, name: &str) -> Result<(), bollard::errors::Error> {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    docker.remove_container(name, Some(options)).await
}

/// Removes the container when dropped, so a cancelled or panicking run
/// never leaks one. Call [`ContainerGuard::remove`] on the normal path.
pub struct ContainerGuard {
    docker: Docker,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    pub fn new(docker: &Docker, name: impl Into<String>) -> Self {
        Self {
            docker: docker.clone(),
            name: name.into(),
            armed: true,
        }
    }

    pub async fn remove(mut self) {
        self.armed = false;
        match remove(&self.docker, &self.name).await {
            Ok(()) => debug!("Removed container {}", self.name),
            Err(e) => warn!("Failed to remove container {}: {}", self.name, e),
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let docker = self.docker.clone();
        let name = std::mem::take(&mut self.name);
        warn!("Removing container {} from drop guard", name);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = remove(&docker, &name).await {
                        warn!("Failed to remove container {}: {}", name, e);
                    }
                });
            }
            Err(_) => warn!("No runtime to remove container {}; it is labelled for sweeping", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec<'a>(command: &'a [String], src: &'a Path, build: &'a Path) -> ContainerSpec<'a> {
        ContainerSpec {
            name: "exec-abc-run".into(),
            image: "python:3.12-alpine",
            command,
            source_dir: src,
            build_dir: build,
            build_writable: false,
            memory_mb: 128,
            cpu_share: 0.5,
            max_processes: 16,
            max_open_files: 64,
            tmpfs_mb: 16,
            user: "65534:65534",
            interactive: true,
        }
    }

    #[test]
    fn test_config_carries_isolation_settings() {
        let command = vec!["python3".to_string(), "/code/main.py".to_string()];
        let src = PathBuf::from("/scratch/exec-1/src");
        let build = PathBuf::from("/scratch/exec-1/build");
        let config = container_config(&spec(&command, &src, &build));
        let host = config.host_config.clone().unwrap();

        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.memory, Some(128 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(host.pids_limit, Some(16));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.security_opt, Some(vec!["no-new-privileges".to_string()]));
        assert_eq!(
            host.tmpfs.unwrap().get("/tmp").map(String::as_str),
            Some("rw,noexec,nosuid,size=16m")
        );

        let ulimits = host.ulimits.unwrap();
        let nofile = ulimits.iter().find(|u| u.name.as_deref() == Some("nofile")).unwrap();
        assert_eq!((nofile.soft, nofile.hard), (Some(64), Some(64)));
        let nproc = ulimits.iter().find(|u| u.name.as_deref() == Some("nproc")).unwrap();
        assert_eq!((nproc.soft, nproc.hard), (Some(16), Some(16)));

        assert_eq!(
            host.binds.unwrap(),
            vec![
                "/scratch/exec-1/src:/code:ro".to_string(),
                "/scratch/exec-1/build:/build:ro".to_string(),
            ]
        );

        assert_eq!(config.image.as_deref(), Some("python:3.12-alpine"));
        assert_eq!(config.cmd, Some(command.clone()));
        assert_eq!(config.user.as_deref(), Some("65534:65534"));
        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(config.open_stdin, Some(true));
        assert_eq!(config.stdin_once, Some(true));
    }

    #[test]
    fn test_compile_stage_mounts_build_writable() {
        let command = vec!["g++".to_string()];
        let src = PathBuf::from("/s");
        let build = PathBuf::from("/b");
        let mut compile = spec(&command, &src, &build);
        compile.build_writable = true;
        compile.interactive = false;

        let config = container_config(&compile);
        let binds = config.host_config.unwrap().binds.unwrap();
        assert!(binds.contains(&"/b:/build:rw".to_string()));
        assert_eq!(config.open_stdin, Some(false));
        assert_eq!(config.attach_stdin, Some(false));
    }

    #[test]
    fn test_container_name_is_unique_per_execution() {
        let a = container_name(&ExecutionId::new(), "run");
        let b = container_name(&ExecutionId::new(), "run");
        assert_ne!(a, b);
        assert!(a.starts_with("exec-") && a.ends_with("-run"));
    }
}
