//! Per-language security policies
//!
//! Static rules bounding source size, captured output, process/file counts and
//! the lexical constructs a submission may not contain. Loaded once from
//! `files/policies.toml` and shared read-only.

use std::collections::HashMap;

use anyhow::Context;
use serde::Deserialize;

use crate::languages::Language;

const EMBEDDED_POLICIES: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/policies.toml"));

/// Filesystem access granted to a running submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilesystemAccess {
    ReadOnly,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityPolicy {
    pub max_source_bytes: usize,
    pub max_output_bytes: usize,
    pub network_access: bool,
    pub filesystem: FilesystemAccess,
    pub max_processes: u32,
    pub max_open_files: u32,
    /// Fraction of one CPU the container may use
    pub cpu_share: f64,
    #[serde(default)]
    pub banned_constructs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: HashMap<Language, SecurityPolicy>,
}

impl PolicyTable {
    pub fn embedded() -> anyhow::Result<Self> {
        Self::from_toml_str(EMBEDDED_POLICIES)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let raw: HashMap<String, SecurityPolicy> =
            toml::from_str(content).context("Invalid policy table")?;

        let mut policies = HashMap::with_capacity(raw.len());
        for (name, policy) in raw {
            let language: Language = name.parse()?;
            if policy.network_access {
                anyhow::bail!("Policy for {} grants network access, which is never allowed", name);
            }
            if !(policy.cpu_share > 0.0 && policy.cpu_share <= 1.0) {
                anyhow::bail!("Policy for {} has cpu_share outside (0, 1]: {}", name, policy.cpu_share);
            }
            if policy.max_processes == 0 || policy.max_open_files == 0 {
                anyhow::bail!("Policy for {} must allow at least one process and one file", name);
            }
            policies.insert(language, policy);
        }

        Ok(Self { policies })
    }

    pub fn get(&self, language: Language) -> Option<&SecurityPolicy> {
        self.policies.get(&language)
    }

    /// Every configured language must have a policy before the engine starts
    pub fn ensure_covers(&self, languages: impl IntoIterator<Item = Language>) -> anyhow::Result<()> {
        for language in languages {
            if !self.policies.contains_key(&language) {
                anyhow::bail!("No security policy configured for {}", language);
            }
        }
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        !self.policies.is_empty()
    }
}
