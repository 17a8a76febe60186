//! HTTP API for the control service.
//!
//! Provides endpoints for:
//! - Deployment management (create, query, list, stop, delete, logs)
//! - The framework catalogue and deployment statistics
//! - Platform inventory listing and import
//! - Health and readiness checks
//! - Prometheus metrics

mod deployments;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};
use tower_http::timeout::TimeoutLayer;

use crate::deployment::DeploymentManager;
use crate::state::DeploymentStatus;
use crate::store::{DeploymentFilter, DeploymentStore};

pub use deployments::{AcceptedResponse, ErrorResponse, ListDeploymentsQuery};

/// Shared application state for the control service.
#[derive(Clone)]
pub struct AppState {
    /// Deployment manager for orchestrating deployments.
    pub manager: DeploymentManager,
    /// Deployment store for direct queries.
    pub store: Arc<dyn DeploymentStore>,
}

/// Creates the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        // Deployment management
        .route(
            "/deployments",
            post(deployments::create_deployment).get(deployments::list_deployments),
        )
        .route(
            "/deployments/{id}",
            get(deployments::get_deployment).delete(deployments::delete_deployment),
        )
        .route("/deployments/{id}/stop", post(deployments::stop_deployment))
        .route("/deployments/{id}/logs", get(deployments::deployment_logs))
        // Catalogue and statistics
        .route("/frameworks", get(deployments::list_frameworks))
        .route("/stats", get(deployments::stats))
        // Platform
        .route("/platform/resources", get(deployments::platform_resources))
        .route("/platform/sync", post(deployments::sync_platform))
        // Metrics
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Answer requests that run longer than `timeout` with 408.
pub fn with_request_timeout(router: Router, timeout: Duration) -> Router {
    router.layer(TimeoutLayer::with_status_code(
        StatusCode::REQUEST_TIMEOUT,
        timeout,
    ))
}

/// Health check endpoint.
async fn health_check() -> axum::Json<HealthResponse> {
    axum::Json(HealthResponse { status: "healthy" })
}

/// Readiness check endpoint.
async fn readiness_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> (axum::http::StatusCode, axum::Json<ReadyResponse>) {
    let filter = DeploymentFilter::new().with_limit(1);

    match state.store.list(&filter).await {
        Ok(_) => (
            axum::http::StatusCode::OK,
            axum::Json(ReadyResponse { ready: true }),
        ),
        Err(_) => (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(ReadyResponse { ready: false }),
        ),
    }
}

/// Metrics endpoint.
async fn metrics(axum::extract::State(state): axum::extract::State<AppState>) -> String {
    let mut output = String::new();

    let mut counts: HashMap<DeploymentStatus, usize> = HashMap::new();
    if let Ok(records) = state
        .store
        .list(&DeploymentFilter::new().including_deleted())
        .await
    {
        for record in records {
            *counts.entry(record.status).or_default() += 1;
        }
    }

    output.push_str("# HELP hangar_deployments Number of deployments by status\n");
    output.push_str("# TYPE hangar_deployments gauge\n");

    for status in DeploymentStatus::ALL {
        let count = counts.get(&status).copied().unwrap_or(0);
        let _ = writeln!(output, "hangar_deployments{{status=\"{status}\"}} {count}");
    }

    output
}

/// Health response.
#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness response.
#[derive(serde::Serialize)]
struct ReadyResponse {
    ready: bool,
}
