//! Language configuration for wrapping, compilation and execution
//!
//! Each language is a small declarative pipeline (preamble template, optional
//! compile command, run command, image) loaded from `files/languages.toml`.
//! Adding a language means adding a table entry, a policy and a preamble.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

const EMBEDDED_LANGUAGES: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));

/// Supported languages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    JavaScript,
    Python,
    Cpp,
    Java,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::JavaScript,
        Language::Python,
        Language::Cpp,
        Language::Java,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::JavaScript => "javascript",
            Language::Python => "python",
            Language::Cpp => "cpp",
            Language::Java => "java",
        }
    }

    /// Embedded preamble template for this language, if it has one
    fn builtin_preamble(file: &str) -> Option<&'static str> {
        match file {
            "python.py" => Some(include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/files/preambles/python.py"
            ))),
            "javascript.js" => Some(include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/files/preambles/javascript.js"
            ))),
            "cpp.cpp" => Some(include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/files/preambles/cpp.cpp"
            ))),
            _ => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Language::ALL
            .into_iter()
            .find(|lang| lang.as_str() == s.to_lowercase())
            .ok_or_else(|| anyhow::anyhow!("Unknown language section: {}", s))
    }
}

/// Interpreted languages run their source directly; compiled ones need a build step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Interpreted,
    Compiled,
}

/// How a language runs when no container runtime is available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestrictedPath {
    /// Embedded interpreter inside the engine
    InProcess,
    /// Child process with rlimits; only when explicitly allowed
    DirectProcess,
    Unsupported,
}

/// Configuration for a supported programming language
#[derive(Debug, Clone)]
pub struct LanguageConfig {
    pub language: Language,
    pub family: Family,
    /// Name of the source file (e.g., "main.cpp")
    pub source_file: String,
    /// Container image used in secure mode
    pub image: String,
    /// Resource-limiting preamble template (None if the language cannot take one)
    pub preamble: Option<&'static str>,
    /// Compile command template (None if not needed)
    pub compile_command: Option<Vec<String>>,
    /// Run command template
    pub run_command: Vec<String>,
    /// Memory ceiling when the request carries none (MB)
    pub default_memory_mb: u32,
    /// Time limit multiplier and bonus: (multiplier, bonus_seconds)
    /// actual_time = base_time * multiplier + bonus
    pub time_limit: Option<(u32, u32)>,
    /// Memory limit multiplier and bonus: (multiplier, bonus_mb)
    /// actual_memory = base_memory * multiplier + bonus
    pub memory_limit: Option<(u32, u32)>,
    pub restricted: RestrictedPath,
}

impl LanguageConfig {
    /// Calculate actual time limit based on base time limit
    /// base_time_ms: base time limit in milliseconds (from the request)
    /// Returns: adjusted time limit in milliseconds
    pub fn calculate_time_limit(&self, base_time_ms: u32) -> u32 {
        match self.time_limit {
            Some((multiplier, bonus_seconds)) => base_time_ms
                .saturating_mul(multiplier)
                .saturating_add(bonus_seconds.saturating_mul(1000)),
            None => base_time_ms,
        }
    }

    /// Calculate actual memory limit based on base memory limit
    /// base_memory_mb: base memory limit in MB (from the request)
    /// Returns: adjusted memory limit in MB
    pub fn calculate_memory_limit(&self, base_memory_mb: u32) -> u32 {
        match self.memory_limit {
            Some((multiplier, bonus_mb)) => base_memory_mb
                .saturating_mul(multiplier)
                .saturating_add(bonus_mb),
            None => base_memory_mb,
        }
    }

    pub fn needs_compilation(&self) -> bool {
        self.family == Family::Compiled && self.compile_command.is_some()
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    family: Family,
    source_file: String,
    image: String,
    preamble: Option<String>,
    compile_command: Option<String>,
    run_command: String,
    default_memory_mb: u32,
    #[serde(default)]
    time_limit: Vec<u32>,
    #[serde(default)]
    memory_limit: Vec<u32>,
    restricted: RestrictedPath,
    #[serde(default)]
    aliases: Vec<String>,
}

/// All language pipelines, keyed by language, with alias lookup
#[derive(Debug, Clone)]
pub struct LanguageTable {
    configs: HashMap<Language, LanguageConfig>,
    aliases: HashMap<String, Language>,
}

impl LanguageTable {
    /// Load the table compiled into the binary
    pub fn embedded() -> anyhow::Result<Self> {
        Self::from_toml_str(EMBEDDED_LANGUAGES)
    }

    /// Load an operator-supplied table from disk
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read language table {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let raw_configs: HashMap<String, RawLanguageConfig> =
            toml::from_str(content).context("Invalid language table")?;

        let mut configs = HashMap::new();
        let mut aliases = HashMap::new();

        for (name, raw) in raw_configs {
            let language: Language = name.parse()?;

            let parse_limit = |raw_limit: Vec<u32>, kind: &str| -> anyhow::Result<Option<(u32, u32)>> {
                match raw_limit.as_slice() {
                    [] => Ok(None),
                    [multiplier, bonus] => Ok(Some((*multiplier, *bonus))),
                    _ => anyhow::bail!("Invalid {} limit for {}: {:?}", kind, name, raw_limit),
                }
            };

            let preamble = match raw.preamble.as_deref() {
                Some(file) => Some(Language::builtin_preamble(file).ok_or_else(|| {
                    anyhow::anyhow!("Unknown preamble '{}' for {}", file, name)
                })?),
                None => None,
            };

            if raw.family == Family::Compiled && raw.compile_command.is_none() {
                anyhow::bail!("Compiled language {} has no compile_command", name);
            }

            let config = LanguageConfig {
                language,
                family: raw.family,
                source_file: raw.source_file,
                image: raw.image,
                preamble,
                compile_command: raw.compile_command.map(|cmd| into_command(&cmd)),
                run_command: into_command(&raw.run_command),
                default_memory_mb: raw.default_memory_mb,
                time_limit: parse_limit(raw.time_limit, "time")?,
                memory_limit: parse_limit(raw.memory_limit, "memory")?,
                restricted: raw.restricted,
            };

            aliases.insert(language.as_str().to_string(), language);
            for alias in raw.aliases {
                aliases.insert(alias.to_lowercase(), language);
            }
            configs.insert(language, config);
        }

        Ok(Self { configs, aliases })
    }

    /// Resolve a language name or alias
    pub fn resolve(&self, name: &str) -> Option<&LanguageConfig> {
        let language = self.aliases.get(&name.trim().to_lowercase())?;
        self.configs.get(language)
    }

    pub fn get(&self, language: Language) -> Option<&LanguageConfig> {
        self.configs.get(&language)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LanguageConfig> {
        self.configs.values()
    }

    /// Distinct container images, for the capability probe
    pub fn images(&self) -> Vec<String> {
        let mut images: Vec<String> = self.configs.values().map(|c| c.image.clone()).collect();
        images.sort();
        images.dedup();
        images
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}
