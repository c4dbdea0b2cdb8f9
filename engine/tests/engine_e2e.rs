//! End-to-end scenarios against the restricted-mode backends, so they run on
//! hosts without a container runtime. The Python ones need `python3` on PATH.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use engine::languages::LanguageTable;
use engine::policy::PolicyTable;
use engine::sandbox::TRUNCATION_MARKER;
use engine::{
    Engine, EngineConfig, ErrorKind, ExecutionRequest, IsolationLevel, SandboxMode, TestCase,
};
use tempfile::TempDir;

macro_rules! sample {
    ($name:literal) => {
        include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/../test-codes/", $name))
    };
}

fn restricted_engine() -> (Engine, TempDir) {
    let scratch = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        scratch_root: scratch.path().to_path_buf(),
        force_restricted: true,
        ..EngineConfig::default()
    };
    let engine = Engine::new(
        config,
        SandboxMode::Restricted,
        Arc::new(LanguageTable::embedded().unwrap()),
        Arc::new(PolicyTable::embedded().unwrap()),
    );
    (engine, scratch)
}

fn scratch_entries(root: &Path) -> usize {
    std::fs::read_dir(root).unwrap().count()
}

#[tokio::test]
async fn hello_world_runs_in_process() {
    let (engine, scratch) = restricted_engine();

    let result = engine
        .execute(&ExecutionRequest::new("javascript", "console.log('Hello, World!');"))
        .await;

    assert_eq!(result.stdout, "Hello, World!\n");
    assert_eq!(result.exit_code, 0);
    assert!(result.error.is_none());
    assert!(!result.security_violation);
    assert_eq!(result.isolation, IsolationLevel::InProcess);
    assert_eq!(scratch_entries(scratch.path()), 0);
}

#[tokio::test]
async fn banned_construct_is_rejected_before_anything_exists() {
    let (engine, scratch) = restricted_engine();

    let result = engine
        .execute(&ExecutionRequest::new("javascript", "const x = eval('2 + 2'); console.log(x);"))
        .await;

    assert!(result.security_violation);
    assert_eq!(result.error, Some(ErrorKind::SecurityViolation));
    assert_eq!(result.exit_code, 1);
    assert!(result.stdout.is_empty());
    assert!(result.stderr.contains("eval("));
    assert_eq!(result.isolation, IsolationLevel::None);
    assert!(result.skip_narrative_review());
    assert_eq!(scratch_entries(scratch.path()), 0);
}

#[tokio::test]
async fn every_malicious_sample_is_rejected() {
    let (engine, _scratch) = restricted_engine();
    let samples = [
        (sample!("01_python_eval.py"), "python"),
        (sample!("02_python_subprocess.py"), "python"),
        (sample!("03_js_child_process.js"), "javascript"),
        (sample!("04_js_function_constructor.js"), "javascript"),
        (sample!("05_cpp_system.cpp"), "cpp"),
        (sample!("06_cpp_socket.cpp"), "cpp"),
        (sample!("07_java_runtime_exec.java"), "java"),
    ];

    for (code, language) in samples {
        let result = engine.execute(&ExecutionRequest::new(language, code)).await;
        assert!(result.security_violation, "{} sample was not rejected", language);
    }
}

#[tokio::test]
async fn infinite_loop_times_out_and_cleans_up() {
    let (engine, scratch) = restricted_engine();

    let request =
        ExecutionRequest::new("javascript", sample!("08_js_infinite_loop.js")).with_time_limit(300);
    let result = engine.execute(&request).await;

    assert_eq!(result.error, Some(ErrorKind::Timeout));
    assert_eq!(result.exit_code, -1);
    assert_eq!(result.stderr, "Time limit exceeded");
    assert_eq!(result.runtime_ms, 300);
    assert_eq!(scratch_entries(scratch.path()), 0);
    assert_eq!(engine.metrics().active_count(), 0);
}

#[tokio::test]
async fn output_flood_is_capped_with_marker() {
    let (engine, _scratch) = restricted_engine();

    let request =
        ExecutionRequest::new("javascript", sample!("09_js_output_flood.js")).with_time_limit(500);
    let result = engine.execute(&request).await;

    assert!(result.output_truncated);
    assert!(result.stdout.ends_with(TRUNCATION_MARKER));
    assert!(result.stdout.len() <= 65536 + TRUNCATION_MARKER.len());
}

#[tokio::test]
async fn uncaught_exception_is_a_runtime_error() {
    let (engine, _scratch) = restricted_engine();

    let result = engine
        .execute(&ExecutionRequest::new("javascript", "print('before'); throw new Error('boom');"))
        .await;

    assert_eq!(result.error, Some(ErrorKind::RuntimeError));
    assert_eq!(result.exit_code, 1);
    assert_eq!(result.stdout, "before\n");
    assert!(result.stderr.contains("boom"));
}

#[tokio::test]
async fn compiled_language_is_unsupported_in_restricted_mode() {
    let (engine, scratch) = restricted_engine();

    for language in ["cpp", "java", "python"] {
        let result = engine
            .execute(&ExecutionRequest::new(language, "int main() { return 0; }"))
            .await;
        assert_eq!(result.error, Some(ErrorKind::Infrastructure), "{}", language);
        assert!(result.error.unwrap().is_retryable());
        assert!(result.stderr.contains("unsupported in this environment"));
    }
    assert_eq!(scratch_entries(scratch.path()), 0);
}

#[tokio::test]
async fn concurrent_executions_are_independent() {
    let (engine, scratch) = restricted_engine();
    let engine = Arc::new(engine);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let code = format!("let s = 0; for (let k = 0; k < 10000; k++) s += k; print({}, s);", i);
                (i, engine.execute(&ExecutionRequest::new("javascript", code)).await)
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        let (i, result) = handle.await.unwrap();
        assert_eq!(result.stdout, format!("{} 49995000\n", i));
        assert!(ids.insert(result.execution_id));
    }
    assert_eq!(ids.len(), 8);
    assert_eq!(scratch_entries(scratch.path()), 0);
    assert_eq!(engine.metrics().active_count(), 0);
}

#[tokio::test]
async fn grading_scores_partial_credit_and_redacts_hidden_cases() {
    let (engine, scratch) = restricted_engine();

    let code = "const [a, b] = readline().split(' ').map(Number); console.log(a + b);";
    let request = ExecutionRequest::new("javascript", code).with_test_cases(vec![
        TestCase::new("1 2", "3"),
        TestCase::new("10 20", "30"),
        TestCase::new("5 5", "11").hidden(),
    ]);
    let report = engine.execute_with_test_cases(&request).await;

    assert!(report.error.is_none());
    assert_eq!(report.results.len(), 3);
    assert!(report.results[0].passed);
    assert!(report.results[1].passed);

    let hidden = &report.results[2];
    assert!(!hidden.passed);
    assert!(hidden.input.is_none());
    assert!(hidden.expected_output.is_none());
    assert!(hidden.actual_output.is_none());
    // "10" vs "11": similarity 0.5, floor(10 * 0.5 * 0.5)
    assert_eq!(hidden.points_earned, 2);
    assert_eq!(hidden.diagnostics.as_ref().unwrap().actual_output, "10\n");

    assert_eq!(report.points_earned, 22);
    assert_eq!(report.max_points, 30);
    assert_eq!(report.score, 73);
    assert!(!report.all_passed);
    assert_eq!(report.isolation, IsolationLevel::InProcess);

    let submitter = report.for_submitter();
    assert!(submitter.results[2].diagnostics.is_none());
    assert_eq!(scratch_entries(scratch.path()), 0);
}

#[tokio::test]
async fn grading_a_rejected_submission_runs_nothing() {
    let (engine, scratch) = restricted_engine();

    let request = ExecutionRequest::new("javascript", "new Function('return 1')()")
        .with_test_cases(vec![TestCase::new("", "1")]);
    let report = engine.execute_with_test_cases(&request).await;

    assert!(report.security_violation);
    assert!(report.skip_narrative_review());
    assert_eq!(report.score, 0);
    assert!(report.results.is_empty());
    assert_eq!(scratch_entries(scratch.path()), 0);
}

#[tokio::test]
async fn all_cases_passing_scores_full_marks() {
    let (engine, _scratch) = restricted_engine();

    let request = ExecutionRequest::new("js", "print(readline().toUpperCase())").with_test_cases(vec![
        TestCase::new("abc", "ABC").with_weight(2),
        TestCase::new("x", "X\n"),
    ]);
    let report = engine.execute_with_test_cases(&request).await;

    assert!(report.all_passed);
    assert_eq!(report.score, 100);
    assert_eq!(report.max_points, 30);
    assert_eq!(report.results[0].test_id, "1");
}

fn direct_process_engine() -> (Engine, TempDir) {
    let scratch = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        scratch_root: scratch.path().to_path_buf(),
        force_restricted: true,
        allow_direct_process: true,
        ..EngineConfig::default()
    };
    let engine = Engine::new(
        config,
        SandboxMode::Restricted,
        Arc::new(LanguageTable::embedded().unwrap()),
        Arc::new(PolicyTable::embedded().unwrap()),
    );
    (engine, scratch)
}

fn python_on_host() -> bool {
    let found = std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false);
    if !found {
        eprintln!("python3 not installed, skipping");
    }
    found
}

#[tokio::test]
async fn python_runs_as_a_direct_process() {
    if !python_on_host() {
        return;
    }
    let (engine, scratch) = direct_process_engine();

    let code = "import sys\nimport random\na, b = map(int, sys.stdin.read().split())\nprint(a + b)\n";
    let result = engine.execute(&ExecutionRequest::new("python", code).with_stdin("2 3\n")).await;

    assert_eq!(result.stdout, "5\n");
    assert_eq!(result.exit_code, 0);
    assert!(result.error.is_none(), "stderr: {}", result.stderr);
    assert_eq!(result.isolation, IsolationLevel::DirectProcess);
    assert_eq!(scratch_entries(scratch.path()), 0);
}

#[tokio::test]
async fn python_import_guard_holds_at_runtime() {
    if !python_on_host() {
        return;
    }
    let (engine, _scratch) = direct_process_engine();

    let result = engine
        .execute(&ExecutionRequest::new("python", "import os\nprint('escaped', os.getcwd())\n"))
        .await;
    assert_eq!(result.error, Some(ErrorKind::RuntimeError));
    assert!(!result.stdout.contains("escaped"));
    assert!(result.stderr.contains("ImportError"));

    let result = engine
        .execute(&ExecutionRequest::new("python", "from os import path\nprint('escaped', path.sep)\n"))
        .await;
    assert_eq!(result.error, Some(ErrorKind::RuntimeError));
    assert!(!result.stdout.contains("escaped"));
    assert!(result.stderr.contains("ImportError"));
}

#[tokio::test]
async fn python_preamble_leaves_no_loader_behind() {
    if !python_on_host() {
        return;
    }
    let (engine, _scratch) = direct_process_engine();

    // a guessed name for a saved import hook must not resolve
    let code = "m = __sandbox_import('os')\nprint('escaped', m.getcwd())\n";
    let result = engine.execute(&ExecutionRequest::new("python", code)).await;
    assert_eq!(result.error, Some(ErrorKind::RuntimeError));
    assert!(!result.stdout.contains("escaped"));
    assert!(result.stderr.contains("NameError"));

    // passing globals that claim another module does not bypass the guard
    let code = "hook = getattr(print.__self__, '__imp' + 'ort__')\nm = hook('os', {'__name__': 'json'})\nprint('escaped', m.getcwd())\n";
    let result = engine.execute(&ExecutionRequest::new("python", code)).await;
    assert_eq!(result.error, Some(ErrorKind::RuntimeError));
    assert!(!result.stdout.contains("escaped"));
    assert!(result.stderr.contains("ImportError"));
}
