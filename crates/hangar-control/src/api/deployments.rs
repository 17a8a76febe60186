//! Deployment management endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::deployment::SyncReport;
use crate::error::ControlError;
use crate::inventory::PlatformResource;
use crate::state::DeploymentStatus;
use crate::store::DeploymentFilter;
use crate::types::{
    DeploymentId, DeploymentRequest, DeploymentStats, DeploymentView, Framework, FrameworkInfo,
};

use super::AppState;

/// Query parameters for listing deployments.
#[derive(Debug, Default, Deserialize)]
pub struct ListDeploymentsQuery {
    /// Filter by status.
    pub status: Option<String>,
    /// Include soft-deleted deployments.
    #[serde(default)]
    pub include_deleted: bool,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

/// Response for an accepted asynchronous operation.
#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    /// Deployment ID.
    pub id: String,
    /// Status at the time of the response.
    pub status: String,
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message.
    pub error: String,
    /// Failure category.
    pub kind: &'static str,
    /// Individual problems, for rejected requests.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<T, ApiError>;

/// Create a new deployment.
pub async fn create_deployment(
    State(state): State<AppState>,
    Json(request): Json<DeploymentRequest>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    info!(
        name = %request.name,
        kind = %request.kind,
        framework = %request.framework,
        "creating deployment via API"
    );

    let deployment_id = state.manager.create(request).await.map_err(api_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            id: deployment_id.to_string(),
            status: DeploymentStatus::Pending.to_string(),
        }),
    ))
}

/// Get a deployment by ID.
pub async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeploymentView>> {
    let view = state
        .manager
        .get(&DeploymentId::new(id))
        .await
        .map_err(api_error)?;
    Ok(Json(view))
}

/// List deployments with optional filters.
pub async fn list_deployments(
    State(state): State<AppState>,
    Query(query): Query<ListDeploymentsQuery>,
) -> ApiResult<Json<Vec<DeploymentView>>> {
    let mut filter = DeploymentFilter::new();

    if let Some(raw) = query.status {
        let status = raw
            .to_lowercase()
            .parse::<DeploymentStatus>()
            .map_err(|e| api_error(ControlError::Validation(vec![e])))?;
        filter = filter.with_status(status);
    }
    if query.include_deleted {
        filter = filter.including_deleted();
    }
    if let Some(limit) = query.limit {
        filter = filter.with_limit(limit);
    }
    if let Some(offset) = query.offset {
        filter = filter.with_offset(offset);
    }

    let views = state.manager.list(&filter).await.map_err(api_error)?;
    Ok(Json(views))
}

/// Delete a deployment.
pub async fn delete_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    let deployment_id = DeploymentId::new(id);
    info!(deployment_id = %deployment_id, "deleting deployment via API");

    state
        .manager
        .delete(&deployment_id)
        .await
        .map_err(api_error)?;

    let status = state
        .manager
        .get(&deployment_id)
        .await
        .map(|view| view.record.status.to_string())
        .map_err(api_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            id: deployment_id.to_string(),
            status,
        }),
    ))
}

/// Stop a running deployment.
pub async fn stop_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeploymentView>> {
    let deployment_id = DeploymentId::new(id);
    info!(deployment_id = %deployment_id, "stopping deployment via API");

    let view = state
        .manager
        .stop(&deployment_id)
        .await
        .map_err(api_error)?;
    Ok(Json(view))
}

/// Full log text of a deployment.
pub async fn deployment_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<String> {
    state
        .manager
        .logs(&DeploymentId::new(id))
        .await
        .map_err(api_error)
}

/// Supported frameworks.
pub async fn list_frameworks() -> Json<Vec<FrameworkInfo>> {
    Json(Framework::SUPPORTED.iter().map(Framework::info).collect())
}

/// Deployment counts per status.
pub async fn stats(State(state): State<AppState>) -> ApiResult<Json<DeploymentStats>> {
    let stats = state.manager.stats().await.map_err(api_error)?;
    Ok(Json(stats))
}

/// Guests present on the platform.
pub async fn platform_resources(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<PlatformResource>>> {
    let resources = state
        .manager
        .platform_resources()
        .await
        .map_err(api_error)?;
    Ok(Json(resources))
}

/// Import untracked platform guests.
pub async fn sync_platform(State(state): State<AppState>) -> ApiResult<Json<SyncReport>> {
    let report = state.manager.sync_platform().await.map_err(api_error)?;
    Ok(Json(report))
}

fn api_error(error: ControlError) -> ApiError {
    let status = error_to_status(&error);
    let details = match &error {
        ControlError::Validation(problems) => problems.clone(),
        _ => Vec::new(),
    };
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            kind: error.kind(),
            details,
        }),
    )
}

const fn error_to_status(error: &ControlError) -> StatusCode {
    match error {
        ControlError::DeploymentNotFound(_) => StatusCode::NOT_FOUND,
        ControlError::Validation(_) => StatusCode::BAD_REQUEST,
        ControlError::DuplicateName(_)
        | ControlError::InvalidStateTransition { .. }
        | ControlError::StaleState { .. } => StatusCode::CONFLICT,
        ControlError::Inventory(_) | ControlError::RemoteUnreachable { .. } => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::config::ControlConfig;
    use crate::credentials::ManagedKey;
    use crate::deployment::{Collaborators, DeploymentManager};
    use crate::inventory::StaticInventory;
    use crate::provisioner::MockDriver;
    use crate::remote::{MockTransport, MockTransportMode, RemoteExecutor};
    use crate::store::{DeploymentStore, MemoryStore};

    fn make_app_state(dir: &std::path::Path) -> AppState {
        let mut config = ControlConfig::default();
        config.terraform.workspace_root = dir.join("workspaces");
        config.logs.dir = dir.join("logs");

        let store: Arc<dyn DeploymentStore> = Arc::new(MemoryStore::new());
        let manager = DeploymentManager::new(
            &config,
            Collaborators {
                store: Arc::clone(&store),
                inventory: Arc::new(StaticInventory::new()),
                driver: Arc::new(MockDriver::new()),
                executor: RemoteExecutor::with_retry(
                    Arc::new(MockTransport::new(MockTransportMode::Accept)),
                    Duration::from_millis(10),
                    Duration::from_millis(200),
                ),
                key: ManagedKey::from_parts("/keys/id", "ssh-ed25519 AAAA test"),
            },
        )
        .unwrap();

        AppState { manager, store }
    }

    async fn send(
        state: &AppState,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = super::super::router(state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn create_body(name: &str) -> Value {
        json!({
            "name": name,
            "kind": "lxc",
            "framework": "express",
            "repo_url": "https://github.com/acme/shop",
            "cores": 1,
            "memory_mb": 1024,
            "disk_gb": 10
        })
    }

    #[tokio::test]
    async fn create_returns_accepted_with_id() {
        let dir = tempfile::tempdir().unwrap();
        let state = make_app_state(dir.path());

        let (status, body) = send(&state, "POST", "/deployments", Some(create_body("shop"))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "pending");

        let id = body["id"].as_str().unwrap().to_owned();
        let (status, body) = send(&state, "GET", &format!("/deployments/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "shop");
    }

    #[tokio::test]
    async fn invalid_request_lists_every_problem() {
        let dir = tempfile::tempdir().unwrap();
        let state = make_app_state(dir.path());

        let mut body = create_body("x");
        body["repo_url"] = json!("not a url");
        body["cores"] = json!(64);

        let (status, body) = send(&state, "POST", "/deployments", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");
        assert_eq!(body["details"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn duplicate_name_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let state = make_app_state(dir.path());

        send(&state, "POST", "/deployments", Some(create_body("shop"))).await;
        let (status, body) = send(&state, "POST", "/deployments", Some(create_body("shop"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "duplicate_name");
    }

    #[tokio::test]
    async fn get_deployment_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = make_app_state(dir.path());

        let (status, _) = send(&state, "GET", "/deployments/nonexistent-id", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&state, "DELETE", "/deployments/nonexistent-id", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_rejects_unknown_status() {
        let dir = tempfile::tempdir().unwrap();
        let state = make_app_state(dir.path());

        let (status, body) = send(&state, "GET", "/deployments", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        let (status, _) = send(&state, "GET", "/deployments?status=sleeping", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stop_pending_deployment_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let state = make_app_state(dir.path());

        let record = crate::types::DeploymentRecord::new(crate::types::DeploymentData::new(
            serde_json::from_value(create_body("idle")).unwrap(),
            crate::types::ResourceSpec {
                cores: 1,
                memory_mb: 1024,
                disk_gb: 10,
            },
        ));
        state.store.insert(&record).await.unwrap();

        let (status, body) = send(
            &state,
            "POST",
            &format!("/deployments/{}/stop", record.data.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "invalid_transition");
    }

    #[tokio::test]
    async fn frameworks_catalogue() {
        let dir = tempfile::tempdir().unwrap();
        let state = make_app_state(dir.path());

        let (status, body) = send(&state, "GET", "/frameworks", None).await;
        assert_eq!(status, StatusCode::OK);
        let frameworks = body.as_array().unwrap();
        assert_eq!(frameworks.len(), 8);
        assert!(frameworks
            .iter()
            .any(|f| f["id"] == "flask" && f["port"] == 5000 && f["language"] == "python"));
    }
}
