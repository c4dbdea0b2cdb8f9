//! Language pipelines: wrap, place, and turn a language entry into runnable units
//!
//! A pipeline is data (see `files/languages.toml`). This module renders the
//! preamble, writes the wrapped source into a fresh scratch workspace and
//! resolves command templates for the runner that will execute them.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use crate::core::{EngineError, ExecutionId};
use crate::languages::LanguageConfig;
use crate::runner::{PathLayout, RunLimits, RunnableUnit, Stage};
use crate::sandbox::container::{CONTAINER_BUILD, CONTAINER_SRC};

/// Exclusive scratch directory for one execution: `exec-<id>-XXXX/{src,build}`.
/// Removed when dropped, so every exit path cleans up.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    src: PathBuf,
    build: PathBuf,
}

impl Workspace {
    pub fn create(scratch_root: &Path, execution_id: &ExecutionId) -> Result<Self, EngineError> {
        fs::create_dir_all(scratch_root).map_err(EngineError::Scratch)?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("exec-{}-", execution_id.short()))
            .tempdir_in(scratch_root)
            .map_err(EngineError::Scratch)?;

        let src = dir.path().join("src");
        let build = dir.path().join("build");
        fs::create_dir(&src).map_err(EngineError::Scratch)?;
        fs::create_dir(&build).map_err(EngineError::Scratch)?;

        // the sandbox user must traverse the tree and write compiler output
        set_mode(dir.path(), 0o755)?;
        set_mode(&src, 0o755)?;
        set_mode(&build, 0o777)?;

        Ok(Self { dir, src, build })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn source_dir(&self) -> &Path {
        &self.src
    }

    pub fn build_dir(&self) -> &Path {
        &self.build
    }

    /// Remove the workspace now, reporting failures instead of swallowing them in Drop
    pub fn cleanup(self) -> Result<(), EngineError> {
        self.dir.close().map_err(EngineError::Scratch)
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<(), EngineError> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(EngineError::Scratch)
}

/// Values substituted into a preamble template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreambleValues {
    pub cpu_seconds: u64,
    pub memory_bytes: u64,
    pub max_open_files: u32,
    pub max_processes: u32,
    pub time_limit_ms: u32,
}

impl PreambleValues {
    pub fn from_limits(limits: &RunLimits) -> Self {
        Self {
            cpu_seconds: u64::from(limits.time_ms).div_ceil(1000) + 1,
            memory_bytes: u64::from(limits.memory_mb) * 1024 * 1024,
            max_open_files: limits.max_open_files,
            max_processes: limits.max_processes,
            time_limit_ms: limits.time_ms,
        }
    }
}

pub fn render_preamble(template: &str, values: &PreambleValues) -> String {
    template
        .replace("{{CPU_SECONDS}}", &values.cpu_seconds.to_string())
        .replace("{{MEMORY_BYTES}}", &values.memory_bytes.to_string())
        .replace("{{MAX_OPEN_FILES}}", &values.max_open_files.to_string())
        .replace("{{MAX_PROCESSES}}", &values.max_processes.to_string())
        .replace("{{TIME_LIMIT_MS}}", &values.time_limit_ms.to_string())
}

/// Prepend the language's resource-limiting preamble to the submission.
/// The in-process interpreter brings its own hardening and takes code as-is.
pub fn wrap_source(config: &LanguageConfig, code: &str, layout: PathLayout, values: &PreambleValues) -> String {
    match (layout, config.preamble) {
        (PathLayout::InProcess, _) | (_, None) => code.to_string(),
        (_, Some(template)) => {
            let mut wrapped = render_preamble(template, values);
            if !wrapped.ends_with('\n') {
                wrapped.push('\n');
            }
            wrapped.push_str(code);
            wrapped
        }
    }
}

/// Substitute `{src}`, `{build}` and `{memory_mb}` in a command template
pub fn resolve_command(
    template: &[String],
    layout: PathLayout,
    workspace: &Workspace,
    memory_mb: u32,
) -> Vec<String> {
    let (src, build) = match layout {
        PathLayout::Mounted => (CONTAINER_SRC.to_string(), CONTAINER_BUILD.to_string()),
        PathLayout::Host | PathLayout::InProcess => (
            workspace.source_dir().display().to_string(),
            workspace.build_dir().display().to_string(),
        ),
    };
    let memory = memory_mb.to_string();

    template
        .iter()
        .map(|part| {
            part.replace("{src}", &src)
                .replace("{build}", &build)
                .replace("{memory_mb}", &memory)
        })
        .collect()
}

/// Units produced for one submission
#[derive(Debug, Clone)]
pub struct PreparedPipeline {
    pub compile: Option<RunnableUnit>,
    pub run: RunnableUnit,
}

/// Write the wrapped source into the workspace and build the compile/run units
pub fn prepare(
    config: &LanguageConfig,
    code: &str,
    execution_id: ExecutionId,
    workspace: &Workspace,
    layout: PathLayout,
    run_limits: &RunLimits,
    compile_memory_mb: u32,
) -> Result<PreparedPipeline, EngineError> {
    let values = PreambleValues::from_limits(run_limits);
    let source = wrap_source(config, code, layout, &values);

    let source_path = workspace.source_dir().join(&config.source_file);
    fs::write(&source_path, &source).map_err(EngineError::Scratch)?;
    set_mode(&source_path, 0o644)?;
    debug!("Wrote {} bytes of source to {}", source.len(), source_path.display());

    let unit = |stage: Stage, command: Vec<String>| RunnableUnit {
        execution_id,
        language: config.language,
        stage,
        image: config.image.clone(),
        command,
        source_dir: workspace.source_dir().to_path_buf(),
        build_dir: workspace.build_dir().to_path_buf(),
        source: source.clone(),
    };

    let compile = match &config.compile_command {
        Some(template) if config.needs_compilation() => Some(unit(
            Stage::Compile,
            resolve_command(template, layout, workspace, compile_memory_mb),
        )),
        _ => None,
    };
    let run_command = match layout {
        PathLayout::InProcess => Vec::new(),
        _ => resolve_command(&config.run_command, layout, workspace, run_limits.memory_mb),
    };

    Ok(PreparedPipeline {
        compile,
        run: unit(Stage::Run, run_command),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::{Language, LanguageTable};

    fn limits() -> RunLimits {
        RunLimits {
            time_ms: 2500,
            memory_mb: 128,
            max_output_bytes: 1024,
            max_processes: 16,
            max_open_files: 64,
            cpu_share: 0.5,
        }
    }

    #[test]
    fn test_workspace_layout_and_cleanup() {
        let root = tempfile::tempdir().unwrap();
        let id = ExecutionId::new();
        let workspace = Workspace::create(root.path(), &id).unwrap();

        assert!(workspace.source_dir().is_dir());
        assert!(workspace.build_dir().is_dir());
        let name = workspace.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(&format!("exec-{}-", id.short())));

        let path = workspace.path().to_path_buf();
        workspace.cleanup().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_workspaces_are_exclusive() {
        let root = tempfile::tempdir().unwrap();
        let a = Workspace::create(root.path(), &ExecutionId::new()).unwrap();
        let b = Workspace::create(root.path(), &ExecutionId::new()).unwrap();
        assert_ne!(a.path(), b.path());
        drop(a);
        drop(b);
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_render_preamble_fills_every_placeholder() {
        let table = LanguageTable::embedded().unwrap();
        let values = PreambleValues::from_limits(&limits());
        assert_eq!(values.cpu_seconds, 4);
        assert_eq!(values.memory_bytes, 128 * 1024 * 1024);

        for config in table.iter() {
            if let Some(template) = config.preamble {
                let rendered = render_preamble(template, &values);
                assert!(!rendered.contains("{{"), "{} preamble left a placeholder", config.language);
            }
        }
    }

    #[test]
    fn test_cpp_preamble_keeps_user_line_numbers() {
        let table = LanguageTable::embedded().unwrap();
        let cpp = table.get(Language::Cpp).unwrap();
        let values = PreambleValues::from_limits(&limits());
        let wrapped = wrap_source(cpp, "int main() {}", PathLayout::Mounted, &values);
        assert!(wrapped.contains("#line 1 \"main.cpp\"\nint main() {}"));
        assert!(wrapped.contains("setrlimit"));
    }

    #[test]
    fn test_javascript_self_timer_trails_the_limit() {
        let table = LanguageTable::embedded().unwrap();
        let js = table.get(Language::JavaScript).unwrap();
        let values = PreambleValues::from_limits(&limits());
        let wrapped = wrap_source(js, "print(1)", PathLayout::Mounted, &values);
        assert!(wrapped.contains("}, 2500 + 1000).unref();"));
        assert!(!wrapped.contains("}, 2500).unref();"));
    }

    #[test]
    fn test_python_preamble_keeps_no_global_import_handle() {
        let table = LanguageTable::embedded().unwrap();
        let python = table.get(Language::Python).unwrap();
        let values = PreambleValues::from_limits(&limits());
        let wrapped = wrap_source(python, "print(1)", PathLayout::Mounted, &values);

        assert!(wrapped.ends_with("\nprint(1)"));
        assert!(wrapped.contains("del __sandbox_install"));
        assert!(!wrapped.contains("__sandbox_import"));
        // only indented lines may bind the real import
        for line in wrapped.lines().filter(|line| line.contains("real_import =")) {
            assert!(line.starts_with(' '), "module-level binding: {}", line);
        }
    }

    #[test]
    fn test_in_process_source_is_not_wrapped() {
        let table = LanguageTable::embedded().unwrap();
        let js = table.get(Language::JavaScript).unwrap();
        let values = PreambleValues::from_limits(&limits());
        assert_eq!(wrap_source(js, "print(1)", PathLayout::InProcess, &values), "print(1)");
    }

    #[test]
    fn test_resolve_command_per_layout() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path(), &ExecutionId::new()).unwrap();
        let template: Vec<String> = ["java", "-Xmx{memory_mb}m", "-cp", "{build}", "{src}/Main"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let mounted = resolve_command(&template, PathLayout::Mounted, &workspace, 320);
        assert_eq!(mounted, ["java", "-Xmx320m", "-cp", "/build", "/code/Main"]);

        let host = resolve_command(&template, PathLayout::Host, &workspace, 320);
        assert_eq!(host[3], workspace.build_dir().display().to_string());
    }

    #[test]
    fn test_prepare_writes_source_and_units() {
        let root = tempfile::tempdir().unwrap();
        let table = LanguageTable::embedded().unwrap();
        let cpp = table.get(Language::Cpp).unwrap();
        let workspace = Workspace::create(root.path(), &ExecutionId::new()).unwrap();

        let prepared = prepare(
            cpp,
            "int main() { return 0; }",
            ExecutionId::new(),
            &workspace,
            PathLayout::Mounted,
            &limits(),
            1024,
        )
        .unwrap();

        let written = fs::read_to_string(workspace.source_dir().join("main.cpp")).unwrap();
        assert!(written.ends_with("int main() { return 0; }"));
        let compile = prepared.compile.unwrap();
        assert_eq!(compile.stage, Stage::Compile);
        assert!(compile.command.contains(&"/build/main".to_string()));
        assert_eq!(prepared.run.command, ["/build/main"]);
    }
}
