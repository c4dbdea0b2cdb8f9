//! Engine configuration
//!
//! Loaded once at startup from the environment (after `.env` via dotenvy) and
//! passed down by value; nothing reads the environment on the request path.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;

use crate::core::DEFAULT_TIME_LIMIT_MS;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// HTTP listen address (default: 0.0.0.0:8080)
    pub bind_addr: SocketAddr,
    /// Parent of every per-execution scratch directory
    pub scratch_root: PathBuf,
    /// Docker daemon socket; unset uses DOCKER_HOST or the platform default
    pub docker_socket: Option<PathBuf>,
    /// uid:gid submissions run as inside containers
    pub sandbox_user: String,
    /// Skip the capability probe and run restricted
    pub force_restricted: bool,
    /// Allow the plain child-process backend in restricted mode
    pub allow_direct_process: bool,
    pub default_time_limit_ms: u32,
    /// Compile time limit in milliseconds (default: 30000ms = 30s)
    pub compile_time_limit_ms: u32,
    /// Compile memory limit in MB (default: 1024MB)
    pub compile_memory_limit_mb: u32,
    /// Window between SIGTERM and SIGKILL on timeout
    pub kill_grace_ms: u64,
    pub memory_sample_interval_ms: u64,
    /// Size of the writable /tmp inside the container
    pub scratch_tmpfs_mb: u32,
    pub points_per_weight: u32,
    /// Unlocks operator diagnostics on the HTTP surface when set
    pub operator_token: Option<String>,
    /// Enables the queue worker when set
    pub redis_url: Option<String>,
    /// Language table file replacing the embedded one
    pub languages_config: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            scratch_root: std::env::temp_dir().join("exec-engine"),
            docker_socket: None,
            sandbox_user: "65534:65534".into(),
            force_restricted: false,
            allow_direct_process: false,
            default_time_limit_ms: DEFAULT_TIME_LIMIT_MS,
            compile_time_limit_ms: 30_000,
            compile_memory_limit_mb: 1024,
            kill_grace_ms: 500,
            memory_sample_interval_ms: 100,
            scratch_tmpfs_mb: 16,
            points_per_weight: 10,
            operator_token: None,
            redis_url: None,
            languages_config: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or empty keys keep their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            bind_addr: env_or(&get, "ENGINE_BIND_ADDR", defaults.bind_addr)?,
            scratch_root: get("SCRATCH_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_root),
            docker_socket: get("DOCKER_SOCKET").map(PathBuf::from),
            sandbox_user: get("SANDBOX_USER").unwrap_or(defaults.sandbox_user),
            force_restricted: flag(&get, "FORCE_RESTRICTED_MODE")?,
            allow_direct_process: flag(&get, "ALLOW_DIRECT_PROCESS")?,
            default_time_limit_ms: env_or(&get, "DEFAULT_TIME_LIMIT_MS", defaults.default_time_limit_ms)?,
            compile_time_limit_ms: env_or(&get, "COMPILE_TIME_LIMIT_MS", defaults.compile_time_limit_ms)?,
            compile_memory_limit_mb: env_or(
                &get,
                "COMPILE_MEMORY_LIMIT_MB",
                defaults.compile_memory_limit_mb,
            )?,
            kill_grace_ms: env_or(&get, "KILL_GRACE_MS", defaults.kill_grace_ms)?,
            memory_sample_interval_ms: env_or(
                &get,
                "MEMORY_SAMPLE_INTERVAL_MS",
                defaults.memory_sample_interval_ms,
            )?
            .max(10),
            scratch_tmpfs_mb: env_or(&get, "SCRATCH_TMPFS_MB", defaults.scratch_tmpfs_mb)?,
            points_per_weight: env_or(&get, "POINTS_PER_WEIGHT", defaults.points_per_weight)?,
            operator_token: get("OPERATOR_TOKEN"),
            redis_url: get("REDIS_URL"),
            languages_config: get("LANGUAGES_CONFIG").map(PathBuf::from),
        })
    }
}

fn env_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

fn flag(get: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<bool> {
    match get(key).as_deref().map(str::trim) {
        None => Ok(false),
        Some("1") | Some("true") | Some("TRUE") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("FALSE") | Some("no") => Ok(false),
        Some(other) => anyhow::bail!("Invalid boolean for {}: {:?}", key, other),
    }
}
