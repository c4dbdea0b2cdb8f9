//! Execution metrics and health
//!
//! A live table of in-flight executions keyed by execution id plus lifetime
//! outcome counters. Entries are removed by a drop guard, so a cancelled
//! request never leaves a stale row behind.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::{ErrorKind, ExecutionId, ExecutionRequest};
use crate::sandbox::SandboxMode;

/// One in-flight execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub submitter_id: Option<String>,
    pub problem_id: Option<String>,
    pub language: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

/// Lifetime totals per outcome
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounters {
    pub total: u64,
    pub succeeded: u64,
    pub security_violations: u64,
    pub compilation_errors: u64,
    pub runtime_errors: u64,
    pub timeouts: u64,
    pub memory_limit_exceeded: u64,
    pub infrastructure_errors: u64,
}

impl OutcomeCounters {
    fn record(&mut self, exit_code: i32, error: Option<ErrorKind>) {
        self.total += 1;
        match error {
            None if exit_code == 0 => self.succeeded += 1,
            None | Some(ErrorKind::RuntimeError) => self.runtime_errors += 1,
            Some(ErrorKind::SecurityViolation) => self.security_violations += 1,
            Some(ErrorKind::CompilationError) => self.compilation_errors += 1,
            Some(ErrorKind::Timeout) => self.timeouts += 1,
            Some(ErrorKind::MemoryLimitExceeded) => self.memory_limit_exceeded += 1,
            Some(ErrorKind::Infrastructure) => self.infrastructure_errors += 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct ExecutionMetrics {
    active: Mutex<HashMap<ExecutionId, ExecutionRecord>>,
    counters: Mutex<OutcomeCounters>,
}

// a panic while holding the lock leaves plain data behind; keep serving it
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ExecutionMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an execution; the entry lives as long as the returned guard
    pub fn start(self: &Arc<Self>, execution_id: ExecutionId, request: &ExecutionRequest) -> ExecutionGuard {
        let record = ExecutionRecord {
            execution_id,
            submitter_id: request.submitter_id.clone(),
            problem_id: request.problem_id.clone(),
            language: request.language.clone(),
            started_at: Utc::now(),
            finished_at: None,
            exit_code: None,
        };
        lock(&self.active).insert(execution_id, record);

        ExecutionGuard {
            metrics: Arc::clone(self),
            execution_id,
        }
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    pub fn counters(&self) -> OutcomeCounters {
        lock(&self.counters).clone()
    }
}

/// Removes its execution from the live table when dropped
pub struct ExecutionGuard {
    metrics: Arc<ExecutionMetrics>,
    execution_id: ExecutionId,
}

impl ExecutionGuard {
    /// Stamp the end time and exit code and count the outcome
    pub fn finish(&self, exit_code: i32, error: Option<ErrorKind>) {
        if let Some(record) = lock(&self.metrics.active).get_mut(&self.execution_id) {
            record.finished_at = Some(Utc::now());
            record.exit_code = Some(exit_code);
        }
        lock(&self.metrics.counters).record(exit_code, error);
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        lock(&self.metrics.active).remove(&self.execution_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub secure_mode_available: bool,
    pub scratch_dir_writable: bool,
    pub policy_table_loaded: bool,
    pub isolation: SandboxMode,
    pub active_executions: usize,
    pub counters: OutcomeCounters,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn new(
        mode: SandboxMode,
        scratch_dir_writable: bool,
        policy_table_loaded: bool,
        metrics: &ExecutionMetrics,
    ) -> Self {
        let status = if mode.is_secure() && scratch_dir_writable && policy_table_loaded {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        Self {
            status,
            secure_mode_available: mode.is_secure(),
            scratch_dir_writable,
            policy_table_loaded,
            isolation: mode,
            active_executions: metrics.active_count(),
            counters: metrics.counters(),
            checked_at: Utc::now(),
        }
    }
}

/// Create and remove a probe file under `root`
pub fn scratch_writable(root: &Path) -> bool {
    if std::fs::create_dir_all(root).is_err() {
        return false;
    }
    tempfile::Builder::new()
        .prefix(".health-")
        .tempfile_in(root)
        .and_then(|file| file.close())
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_removes_entry_on_drop() {
        let metrics = ExecutionMetrics::new();
        let id = ExecutionId::new();
        let request = ExecutionRequest::new("python", "print(1)");
        {
            let guard = metrics.start(id, &request);
            assert_eq!(metrics.active_count(), 1);
            guard.finish(0, None);
            let record = lock(&metrics.active).get(&id).cloned().unwrap();
            assert_eq!(record.exit_code, Some(0));
            assert!(record.finished_at.is_some());
        }
        assert_eq!(metrics.active_count(), 0);
        assert_eq!(metrics.counters().succeeded, 1);
    }

    #[test]
    fn test_counters_per_outcome() {
        let metrics = ExecutionMetrics::new();
        let request = ExecutionRequest::new("python", "");
        for (code, error) in [
            (0, None),
            (1, None),
            (-1, Some(ErrorKind::Timeout)),
            (1, Some(ErrorKind::SecurityViolation)),
            (-1, Some(ErrorKind::Infrastructure)),
        ] {
            metrics.start(ExecutionId::new(), &request).finish(code, error);
        }
        let counters = metrics.counters();
        assert_eq!(counters.total, 5);
        assert_eq!(counters.succeeded, 1);
        assert_eq!(counters.runtime_errors, 1);
        assert_eq!(counters.timeouts, 1);
        assert_eq!(counters.security_violations, 1);
        assert_eq!(counters.infrastructure_errors, 1);
        assert_eq!(metrics.active_count(), 0);
    }

    #[test]
    fn test_health_status() {
        let metrics = ExecutionMetrics::new();
        let healthy = HealthReport::new(SandboxMode::Secure, true, true, &metrics);
        assert_eq!(healthy.status, HealthStatus::Healthy);

        let degraded = HealthReport::new(SandboxMode::Restricted, true, true, &metrics);
        assert_eq!(degraded.status, HealthStatus::Degraded);
        assert!(!degraded.secure_mode_available);

        let json = serde_json::to_value(&degraded).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["isolation"], "restricted");
    }

    #[test]
    fn test_scratch_probe() {
        let root = tempfile::tempdir().unwrap();
        assert!(scratch_writable(root.path()));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
        assert!(!scratch_writable(Path::new("/proc/engine-not-writable")));
    }
}
