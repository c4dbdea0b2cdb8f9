//! Sandbox capability probe
//!
//! Decides once at startup whether a container runtime is usable. The result
//! is injected into the engine; nothing re-probes on the request path.

use std::fmt;

use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::languages::LanguageTable;
use crate::sandbox::container;

/// Execution capability of this host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    /// Container runtime reachable; every language runs isolated
    Secure,
    /// No container runtime; only the in-process interpreter (and the
    /// direct-process backend when allowed) are available
    Restricted,
}

impl SandboxMode {
    pub async fn detect(config: &EngineConfig, languages: &LanguageTable) -> Self {
        if config.force_restricted {
            warn!("FORCE_RESTRICTED_MODE is set; skipping the container probe");
            return SandboxMode::Restricted;
        }

        let docker = match container::connect(config) {
            Ok(docker) => docker,
            Err(e) => {
                warn!("{}; running in restricted mode", e);
                return SandboxMode::Restricted;
            }
        };

        match runtime_version(&docker).await {
            Some(version) => {
                info!("Container runtime available (server {})", version);
                for image in languages.images() {
                    ensure_image(&docker, &image).await;
                }
                SandboxMode::Secure
            }
            None => {
                warn!(
                    "Container runtime is not reachable; running in restricted mode. \
                     Only in-process execution is available."
                );
                SandboxMode::Restricted
            }
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, SandboxMode::Secure)
    }
}

impl fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxMode::Secure => write!(f, "secure"),
            SandboxMode::Restricted => write!(f, "restricted"),
        }
    }
}

/// Server version when the daemon answers, None otherwise
async fn runtime_version(docker: &Docker) -> Option<String> {
    if let Err(e) = docker.ping().await {
        debug!("Docker ping failed: {}", e);
        return None;
    }
    let version = docker.version().await.ok()?;
    Some(version.version.unwrap_or_else(|| "unknown".to_string()))
}

/// Pull `image` when it is not present locally. Failures only log: the
/// affected language reports an infrastructure error when used.
async fn ensure_image(docker: &Docker, image: &str) {
    if docker.inspect_image(image).await.is_ok() {
        return;
    }

    info!("Pulling image {}", image);
    let options = CreateImageOptions {
        from_image: image,
        ..Default::default()
    };
    let mut stream = docker.create_image(Some(options), None, None);

    while let Some(progress) = stream.next().await {
        match progress {
            Ok(info) => {
                if let Some(status) = info.status {
                    debug!("Pull {}: {}", image, status);
                }
            }
            Err(e) => {
                warn!("Failed to pull image {}: {}", image, e);
                return;
            }
        }
    }
    info!("Pulled image {}", image);
}
