//! Operator HTTP API
//!
//! JSON over HTTP. Mutating endpoints answer with an [`ActionResponse`] and,
//! when an admin token is configured, require it in `x-tenantmux-admin-token`.

use crate::config::DaemonConfig;
use crate::installer::Installer;
use crate::probe::Diagnostics;
use crate::proxy::ProxyManager;
use crate::reconciler::DriftDetector;
use crate::state::InstanceStore;
use crate::supervisor::Supervisor;
use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tenantmux_common::{types::*, Error, ErrorKind};
use tower_http::trace::TraceLayer;
use tracing::info;

pub const ADMIN_TOKEN_HEADER: &str = "x-tenantmux-admin-token";

const DEFAULT_LOG_LINES: usize = 100;
const MAX_LOG_LINES: usize = 5000;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<DaemonConfig>,
    pub store: InstanceStore,
    pub supervisor: Supervisor,
    pub installer: Arc<Installer>,
    pub proxy: Arc<ProxyManager>,
    pub diagnostics: Arc<Diagnostics>,
    pub drift: Arc<DriftDetector>,
}

// ============================================================================
// Errors
// ============================================================================

pub enum ApiError {
    Op(Error),
    Unauthorized,
    BadRequest(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Op(e)
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict | ErrorKind::ExhaustedRetries => StatusCode::CONFLICT,
        ErrorKind::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
        ErrorKind::ExternalFailure => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, outcome) = match self {
            ApiError::Op(e) => (status_for(e.kind()), OperationOutcome::from(&e)),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                OperationOutcome::Rejected {
                    kind: ErrorKind::PreconditionFailed,
                    reason: format!("missing or wrong {}", ADMIN_TOKEN_HEADER),
                },
            ),
            ApiError::BadRequest(reason) => (
                StatusCode::BAD_REQUEST,
                OperationOutcome::Rejected {
                    kind: ErrorKind::PreconditionFailed,
                    reason,
                },
            ),
        };
        let body = ActionResponse {
            outcome,
            instance: None,
        };
        (status, Json(body)).into_response()
    }
}

/// Extractor that admits a request only with the configured admin token
pub struct AdminGuard;

#[axum::async_trait]
impl FromRequestParts<AppState> for AdminGuard {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> ApiResult<Self> {
        match &state.config.admin_token {
            None => Ok(AdminGuard),
            Some(expected) => {
                let ok = parts
                    .headers
                    .get(ADMIN_TOKEN_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v == expected)
                    .unwrap_or(false);
                if ok {
                    Ok(AdminGuard)
                } else {
                    Err(ApiError::Unauthorized)
                }
            }
        }
    }
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/instances", get(list_instances).post(create_instance))
        .route(
            "/api/instances/:tenant",
            get(get_instance).delete(delete_instance),
        )
        .route("/api/instances/:tenant/start", post(start_instance))
        .route("/api/instances/:tenant/stop", post(stop_instance))
        .route("/api/instances/:tenant/restart", post(restart_instance))
        .route("/api/instances/:tenant/kill", post(kill_instance))
        .route("/api/instances/:tenant/install", post(install_instance))
        .route("/api/instances/:tenant/logs", get(instance_logs))
        .route("/api/instances/:tenant/diagnostics", get(instance_diagnostics))
        .route("/api/ports/:port", get(port_ownership))
        .route("/api/drift", get(drift))
        .route("/api/proxy", get(proxy_status))
        .route("/api/proxy/validate", get(proxy_validate))
        .route("/api/proxy/regenerate", post(proxy_regenerate))
        .route("/api/proxy/repair", post(proxy_repair))
        .route("/api/settings/branding", get(get_branding).put(set_branding))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until the listener fails
pub async fn serve(state: AppState, listen: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ============================================================================
// Instances
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub instances: usize,
    pub running: usize,
}

async fn health(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let instances = state.store.list()?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: tenantmux_common::VERSION.to_string(),
        running: instances.iter().filter(|i| i.is_running()).count(),
        instances: instances.len(),
    }))
}

async fn list_instances(State(state): State<AppState>) -> ApiResult<Json<Vec<Instance>>> {
    Ok(Json(state.store.list()?))
}

async fn get_instance(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> ApiResult<Json<Instance>> {
    Ok(Json(state.store.get(&tenant)?))
}

#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    pub tenant_id: String,
    #[serde(default)]
    pub app_dir: Option<PathBuf>,
}

async fn create_instance(
    State(state): State<AppState>,
    _admin: AdminGuard,
    Json(req): Json<CreateInstanceRequest>,
) -> ApiResult<Json<ActionResponse>> {
    let app_dir = req.app_dir.unwrap_or_else(|| state.config.app.app_dir.clone());
    let data_dir = state.config.tenant_data_dir(&req.tenant_id);
    let instance = state.store.provision(&req.tenant_id, data_dir, app_dir)?;
    Ok(Json(ActionResponse::applied(
        format!("provisioned {} on port {}", instance.tenant_id, instance.port),
        Some(instance),
    )))
}

async fn delete_instance(
    State(state): State<AppState>,
    _admin: AdminGuard,
    Path(tenant): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    state.supervisor.delete(&tenant).await?;
    Ok(Json(ActionResponse::applied(format!("deleted {}", tenant), None)))
}

#[derive(Debug, Default, Deserialize)]
pub struct StartParams {
    /// Wait for the health probe before answering
    #[serde(default)]
    pub wait: bool,
}

async fn start_instance(
    State(state): State<AppState>,
    _admin: AdminGuard,
    Path(tenant): Path<String>,
    Query(params): Query<StartParams>,
) -> ApiResult<Json<ActionResponse>> {
    let observed = if params.wait {
        state.supervisor.request_start_and_wait(&tenant).await?
    } else {
        state.supervisor.request_start(&tenant).await?
    };
    let instance = state.store.get(&tenant)?;
    Ok(Json(ActionResponse::applied(
        format!("{} is {}", tenant, observed),
        Some(instance),
    )))
}

async fn stop_instance(
    State(state): State<AppState>,
    _admin: AdminGuard,
    Path(tenant): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    state.supervisor.request_stop(&tenant).await?;
    let instance = state.store.get(&tenant)?;
    Ok(Json(ActionResponse::applied(
        format!("{} stopped", tenant),
        Some(instance),
    )))
}

async fn restart_instance(
    State(state): State<AppState>,
    _admin: AdminGuard,
    Path(tenant): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    let observed = state.supervisor.restart(&tenant).await?;
    let instance = state.store.get(&tenant)?;
    Ok(Json(ActionResponse::applied(
        format!("{} restarted ({})", tenant, observed),
        Some(instance),
    )))
}

async fn kill_instance(
    State(state): State<AppState>,
    _admin: AdminGuard,
    Path(tenant): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    state.supervisor.force_kill(&tenant).await?;
    let instance = state.store.get(&tenant)?;
    Ok(Json(ActionResponse::applied(
        format!("{} killed", tenant),
        Some(instance),
    )))
}

async fn install_instance(
    State(state): State<AppState>,
    _admin: AdminGuard,
    Path(tenant): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    let status = state.installer.install(&tenant).await?;
    let instance = state.store.get(&tenant)?;
    Ok(Json(ActionResponse::applied(
        format!("{} {}", tenant, status),
        Some(instance),
    )))
}

#[derive(Debug, Deserialize)]
pub struct LogParams {
    pub lines: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogResponse {
    pub tenant_id: String,
    pub lines: Vec<String>,
}

async fn instance_logs(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(params): Query<LogParams>,
) -> ApiResult<Json<LogResponse>> {
    let n = params.lines.unwrap_or(DEFAULT_LOG_LINES);
    if n == 0 || n > MAX_LOG_LINES {
        return Err(ApiError::BadRequest(format!(
            "lines must be between 1 and {}",
            MAX_LOG_LINES
        )));
    }
    let lines = state.diagnostics.tail_log(&tenant, n)?;
    Ok(Json(LogResponse {
        tenant_id: tenant,
        lines,
    }))
}

async fn instance_diagnostics(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> ApiResult<Json<crate::probe::InstanceHealth>> {
    Ok(Json(state.diagnostics.check_instance_health(&tenant)?))
}

async fn port_ownership(
    State(state): State<AppState>,
    Path(port): Path<u16>,
) -> ApiResult<Json<crate::probe::PortOwnership>> {
    Ok(Json(state.diagnostics.check_port_ownership(port).await?))
}

async fn drift(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<crate::reconciler::DriftReport>>> {
    Ok(Json(state.drift.detect_drift()?))
}

// ============================================================================
// Proxy
// ============================================================================

async fn proxy_status(
    State(state): State<AppState>,
) -> ApiResult<Json<crate::proxy::ProxyStatus>> {
    Ok(Json(state.proxy.status().await?))
}

async fn proxy_validate(
    State(state): State<AppState>,
) -> Json<crate::probe::ConfigValidity> {
    Json(
        state
            .diagnostics
            .check_proxy_config_validity(state.proxy.active_path())
            .await,
    )
}

async fn proxy_regenerate(
    State(state): State<AppState>,
    _admin: AdminGuard,
) -> ApiResult<Json<ActionResponse>> {
    let detail = match state.proxy.regenerate().await? {
        crate::proxy::SyncReport::Unchanged { snapshot_hash } => {
            format!("unchanged ({})", &snapshot_hash[..12.min(snapshot_hash.len())])
        }
        crate::proxy::SyncReport::Activated {
            config_id, routes, ..
        } => format!("activated config {} with {} routes", config_id, routes),
    };
    Ok(Json(ActionResponse::applied(detail, None)))
}

#[derive(Debug, Default, Deserialize)]
pub struct RepairRequest {
    #[serde(default)]
    pub dry_run: bool,
}

async fn proxy_repair(
    State(state): State<AppState>,
    _admin: AdminGuard,
    Json(req): Json<RepairRequest>,
) -> ApiResult<Json<crate::proxy::RepairReport>> {
    Ok(Json(state.proxy.repair(req.dry_run).await?))
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct Branding {
    pub site_title: Option<String>,
}

async fn get_branding(State(state): State<AppState>) -> ApiResult<Json<Branding>> {
    Ok(Json(Branding {
        site_title: Some(state.proxy.site_title()?),
    }))
}

async fn set_branding(
    State(state): State<AppState>,
    _admin: AdminGuard,
    Json(req): Json<Branding>,
) -> ApiResult<Json<ActionResponse>> {
    state.store.set_site_title(req.site_title.as_deref())?;
    state.proxy.regenerate().await?;
    let title = state.proxy.site_title()?;
    Ok(Json(ActionResponse::applied(
        format!("site title is now '{}'", title),
        None,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortConfig;
    use crate::launcher::fake::FakeLauncher;
    use crate::proxy::controller::fake::FakeController;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tenantmux_common::Database;
    use tower::ServiceExt;

    fn state(tmp: &TempDir, admin_token: Option<&str>) -> AppState {
        let mut config = DaemonConfig::default();
        config.store_path = tmp.path().join("store");
        config.data_root = tmp.path().join("tenants");
        config.app.app_dir = tmp.path().join("app");
        config.admin_token = admin_token.map(String::from);
        config.ports = PortConfig {
            range_start: 47100,
            range_end: 47199,
            reserved: vec![],
        };
        config.proxy.active_config_path = tmp.path().join("tenantmux.conf");

        let store = InstanceStore::new(Database::open_memory().unwrap(), config.ports.clone());
        let supervisor = Supervisor::new(
            store.clone(),
            FakeLauncher::healthy(),
            config.app.clone(),
            config.supervisor.clone(),
        );
        let controller = Arc::new(FakeController::default());
        let proxy = Arc::new(ProxyManager::new(
            store.clone(),
            &config.proxy,
            &config.app.original_title,
            controller.clone(),
        ));
        AppState {
            installer: Arc::new(Installer::new(store.clone(), config.app.clone())),
            diagnostics: Arc::new(Diagnostics::new(
                store.clone(),
                supervisor.clone(),
                config.app.clone(),
                controller,
            )),
            drift: Arc::new(DriftDetector::new(supervisor.clone())),
            config: Arc::new(config),
            store,
            supervisor,
            proxy,
        }
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header(ADMIN_TOKEN_HEADER, token);
        }
        let req = match body {
            Some(body) => req
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let tmp = TempDir::new().unwrap();
        let app = router(state(&tmp, None));
        let (status, body) = call(&app, "GET", "/api/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["instances"], 0);
    }

    #[tokio::test]
    async fn test_create_list_and_start_not_installed() {
        let tmp = TempDir::new().unwrap();
        let app = router(state(&tmp, None));

        let (status, body) = call(
            &app,
            "POST",
            "/api/instances",
            None,
            Some(serde_json::json!({ "tenant_id": "alice" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "applied");
        assert_eq!(body["instance"]["port"], 47100);

        let (_, list) = call(&app, "GET", "/api/instances", None, None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, body) = call(&app, "POST", "/api/instances/alice/start", None, None).await;
        assert_eq!(status, StatusCode::PRECONDITION_FAILED);
        assert_eq!(body["outcome"], "rejected");
        assert_eq!(body["kind"], "precondition_failed");
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_tenants() {
        let tmp = TempDir::new().unwrap();
        let app = router(state(&tmp, None));
        let create = serde_json::json!({ "tenant_id": "alice" });
        call(&app, "POST", "/api/instances", None, Some(create.clone())).await;

        let (status, body) = call(&app, "POST", "/api/instances", None, Some(create)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "conflict");

        let (status, _) = call(&app, "GET", "/api/instances/nobody", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_token_required_for_mutations() {
        let tmp = TempDir::new().unwrap();
        let app = router(state(&tmp, Some("s3cret")));
        let create = serde_json::json!({ "tenant_id": "alice" });

        let (status, _) = call(&app, "POST", "/api/instances", None, Some(create.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) =
            call(&app, "POST", "/api/instances", Some("wrong"), Some(create.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) =
            call(&app, "POST", "/api/instances", Some("s3cret"), Some(create)).await;
        assert_eq!(status, StatusCode::OK);

        // Reads stay open
        let (status, _) = call(&app, "GET", "/api/instances", None, None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_branding_roundtrip_regenerates_proxy() {
        let tmp = TempDir::new().unwrap();
        let app = router(state(&tmp, None));

        let (status, _) = call(
            &app,
            "PUT",
            "/api/settings/branding",
            None,
            Some(serde_json::json!({ "site_title": "Night Owls" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&app, "GET", "/api/settings/branding", None, None).await;
        assert_eq!(body["site_title"], "Night Owls");
        assert!(tmp.path().join("tenantmux.conf").exists());

        let (status, _) = call(
            &app,
            "PUT",
            "/api/settings/branding",
            None,
            Some(serde_json::json!({ "site_title": "$evil" })),
        )
        .await;
        assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    }

    #[tokio::test]
    async fn test_log_line_bounds() {
        let tmp = TempDir::new().unwrap();
        let app = router(state(&tmp, None));
        call(
            &app,
            "POST",
            "/api/instances",
            None,
            Some(serde_json::json!({ "tenant_id": "alice" })),
        )
        .await;

        let (status, body) = call(&app, "GET", "/api/instances/alice/logs?lines=5", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["lines"].as_array().unwrap().len(), 0);

        let (status, _) = call(&app, "GET", "/api/instances/alice/logs?lines=0", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_removes_instance() {
        let tmp = TempDir::new().unwrap();
        let app = router(state(&tmp, None));
        call(
            &app,
            "POST",
            "/api/instances",
            None,
            Some(serde_json::json!({ "tenant_id": "alice" })),
        )
        .await;

        let (status, body) = call(&app, "DELETE", "/api/instances/alice", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "applied");

        let (status, _) = call(&app, "GET", "/api/instances/alice", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "DELETE", "/api/instances/alice", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_port_ownership_free_port() {
        let tmp = TempDir::new().unwrap();
        let app = router(state(&tmp, None));
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let (status, body) = call(&app, "GET", &format!("/api/ports/{}", port), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["owner"], "free");
    }
}
