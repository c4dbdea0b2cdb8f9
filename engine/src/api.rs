//! HTTP surface
//!
//! `POST /execute`, `POST /execute/test-cases` and `GET /health` over a shared
//! [`Engine`]. Grading reports are trimmed to the submitter view unless the
//! caller presents the operator token.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::debug;

use crate::core::{ExecutionRequest, ExecutionResult};
use crate::engine::Engine;
use crate::grader::GradeReport;
use crate::metrics::HealthReport;

pub const OPERATOR_TOKEN_HEADER: &str = "x-operator-token";

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .route("/execute/test-cases", post(execute_with_test_cases))
        .route("/health", get(health))
        .with_state(engine)
}

async fn execute(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<ExecutionRequest>,
) -> Json<ExecutionResult> {
    Json(engine.execute(&request).await)
}

async fn execute_with_test_cases(
    State(engine): State<Arc<Engine>>,
    headers: HeaderMap,
    Json(request): Json<ExecutionRequest>,
) -> Json<GradeReport> {
    let report = engine.execute_with_test_cases(&request).await;

    if is_operator(engine.config().operator_token.as_deref(), &headers) {
        debug!("Returning operator view for {}", report.execution_id);
        Json(report)
    } else {
        Json(report.for_submitter())
    }
}

/// 503 only when requests cannot be served at all; restricted mode still answers 200
async fn health(State(engine): State<Arc<Engine>>) -> (StatusCode, Json<HealthReport>) {
    let report = engine.health_check();
    let status = if report.scratch_dir_writable && report.policy_table_loaded {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

fn is_operator(expected: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = expected else {
        return false;
    };
    headers
        .get(OPERATOR_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|presented| presented == expected)
}
