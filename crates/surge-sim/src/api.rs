//! HTTP Control API
//!
//! Thin REST layer over the engine's direct calls:
//! - Start/stop campaigns
//! - Campaign status (one or all)
//! - Profile catalog and its validation report
//! - Target port monitors
//! - Prometheus metrics

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use surge_core::{
    CampaignError, CampaignRequest, CampaignStatus, Engine, MonitorError, MonitorRequest,
    MonitorStatus, ProfileSpec,
};
use tracing::{info, warn};
use uuid::Uuid;

/// HTTP API server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Host to bind to (default: 127.0.0.1)
    pub host: String,
    /// Port to listen on (default: 8080)
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl ApiConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Handle to the engine shared by all handlers
pub type SharedState = Arc<Engine>;

// ============================================================================
// API Request/Response Types
// ============================================================================

/// Generic API response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub id: Uuid,
}

/// Loaded profiles plus the entries that failed validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilesResponse {
    pub profiles: Vec<ProfileSpec>,
    pub rejected: Vec<RejectedProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedProfile {
    pub name: String,
    pub reason: String,
}

/// Status code for a campaign error; the envelope carries the message.
pub fn status_for(err: &CampaignError) -> StatusCode {
    match err {
        CampaignError::Catalog(_) => StatusCode::NOT_FOUND,
        CampaignError::Validation(_) | CampaignError::InvalidTarget { .. } => {
            StatusCode::BAD_REQUEST
        }
        CampaignError::Unresolvable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        CampaignError::UnknownCampaign(_) => StatusCode::NOT_FOUND,
        CampaignError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub fn monitor_status_for(err: &MonitorError) -> StatusCode {
    match err {
        MonitorError::Target(inner) => status_for(inner),
        MonitorError::Invalid(_) => StatusCode::BAD_REQUEST,
        MonitorError::UnknownMonitor(_) => StatusCode::NOT_FOUND,
    }
}

type Reply<T> = (StatusCode, Json<ApiResponse<T>>);

fn reply<T>(result: Result<T, CampaignError>) -> Reply<T> {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::success(data))),
        Err(err) => (status_for(&err), Json(ApiResponse::error(&err.to_string()))),
    }
}

fn monitor_reply<T>(result: Result<T, MonitorError>) -> Reply<T> {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::success(data))),
        Err(err) => (
            monitor_status_for(&err),
            Json(ApiResponse::error(&err.to_string())),
        ),
    }
}

fn parse_id(raw: &str) -> Result<Uuid, CampaignError> {
    Uuid::parse_str(raw).map_err(|_| CampaignError::UnknownCampaign(raw.to_string()))
}

fn parse_monitor_id(raw: &str) -> Result<Uuid, MonitorError> {
    Uuid::parse_str(raw).map_err(|_| MonitorError::UnknownMonitor(raw.to_string()))
}

// ============================================================================
// API Handler Functions
// ============================================================================

/// Handle POST /campaigns - start a campaign
pub async fn handle_start(
    state: &SharedState,
    request: CampaignRequest,
) -> Result<StartResponse, CampaignError> {
    let id = state.orchestrator().start(request).await?;
    info!(%id, "Campaign started via API");
    Ok(StartResponse { id })
}

/// Handle POST /campaigns/{id}/stop - request cancellation
pub fn handle_stop(state: &SharedState, id: &str) -> Result<CampaignStatus, CampaignError> {
    let id = parse_id(id)?;
    state.orchestrator().stop(id)
}

/// Handle GET /campaigns/{id}
pub fn handle_get_status(state: &SharedState, id: &str) -> Result<CampaignStatus, CampaignError> {
    let id = parse_id(id)?;
    state.orchestrator().status(id)
}

/// Handle GET /campaigns
pub fn handle_list_campaigns(state: &SharedState) -> Vec<CampaignStatus> {
    state.orchestrator().status_all()
}

/// Handle GET /profiles
pub fn handle_list_profiles(state: &SharedState) -> ProfilesResponse {
    let catalog = state.catalog();
    let profiles = catalog
        .names()
        .iter()
        .filter_map(|name| catalog.get(name).ok())
        .map(|profile| profile.spec().clone())
        .collect();
    let rejected = state
        .rejected_profiles()
        .iter()
        .map(|(name, err)| RejectedProfile {
            name: name.clone(),
            reason: err.to_string(),
        })
        .collect();
    ProfilesResponse { profiles, rejected }
}

/// Handle POST /monitors - start checking a target's ports
pub async fn handle_start_monitor(
    state: &SharedState,
    request: MonitorRequest,
) -> Result<StartResponse, MonitorError> {
    let id = state.monitors().start(request).await?;
    info!(%id, "Monitor started via API");
    Ok(StartResponse { id })
}

/// Handle POST /monitors/{id}/stop
pub fn handle_stop_monitor(state: &SharedState, id: &str) -> Result<MonitorStatus, MonitorError> {
    let id = parse_monitor_id(id)?;
    state.monitors().stop(id)
}

/// Handle GET /monitors/{id}
pub fn handle_monitor_status(
    state: &SharedState,
    id: &str,
) -> Result<MonitorStatus, MonitorError> {
    let id = parse_monitor_id(id)?;
    state.monitors().status(id)
}

/// Handle GET /metrics - Prometheus text exposition
pub fn handle_metrics(state: &SharedState) -> Result<String, String> {
    state.metrics().encode().map_err(|e| e.to_string())
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/campaigns", post(start).get(list_campaigns))
        .route("/campaigns/{id}", get(campaign_status))
        .route("/campaigns/{id}/stop", post(stop))
        .route("/monitors", post(start_monitor).get(list_monitors))
        .route("/monitors/{id}", get(monitor_status))
        .route("/monitors/{id}/stop", post(stop_monitor))
        .route("/profiles", get(list_profiles))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn start(
    State(state): State<SharedState>,
    Json(request): Json<CampaignRequest>,
) -> Reply<StartResponse> {
    let result = handle_start(&state, request).await;
    if let Err(err) = &result {
        warn!(error = %err, "Campaign start rejected");
    }
    reply(result)
}

async fn stop(State(state): State<SharedState>, Path(id): Path<String>) -> Reply<CampaignStatus> {
    reply(handle_stop(&state, &id))
}

async fn campaign_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Reply<CampaignStatus> {
    reply(handle_get_status(&state, &id))
}

async fn list_campaigns(State(state): State<SharedState>) -> Json<ApiResponse<Vec<CampaignStatus>>> {
    Json(ApiResponse::success(handle_list_campaigns(&state)))
}

async fn start_monitor(
    State(state): State<SharedState>,
    Json(request): Json<MonitorRequest>,
) -> Reply<StartResponse> {
    let result = handle_start_monitor(&state, request).await;
    if let Err(err) = &result {
        warn!(error = %err, "Monitor start rejected");
    }
    monitor_reply(result)
}

async fn stop_monitor(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Reply<MonitorStatus> {
    monitor_reply(handle_stop_monitor(&state, &id))
}

async fn monitor_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Reply<MonitorStatus> {
    monitor_reply(handle_monitor_status(&state, &id))
}

async fn list_monitors(State(state): State<SharedState>) -> Json<ApiResponse<Vec<MonitorStatus>>> {
    Json(ApiResponse::success(state.monitors().status_all()))
}

async fn list_profiles(State(state): State<SharedState>) -> Json<ApiResponse<ProfilesResponse>> {
    Json(ApiResponse::success(handle_list_profiles(&state)))
}

async fn metrics(State(state): State<SharedState>) -> impl IntoResponse {
    match handle_metrics(&state) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            err,
        ),
    }
}

/// API routes definition for documentation
pub fn get_api_routes() -> Vec<(&'static str, &'static str, &'static str)> {
    vec![
        ("POST", "/campaigns", "Start a campaign"),
        ("GET", "/campaigns", "Status of every campaign"),
        ("GET", "/campaigns/{id}", "Status of one campaign"),
        ("POST", "/campaigns/{id}/stop", "Stop a running campaign"),
        ("POST", "/monitors", "Start a port monitor"),
        ("GET", "/monitors", "Status of every monitor"),
        ("GET", "/monitors/{id}", "Status of one monitor"),
        ("POST", "/monitors/{id}/stop", "Stop a monitor"),
        ("GET", "/profiles", "Loaded profiles and rejected entries"),
        ("GET", "/metrics", "Prometheus metrics"),
    ]
}

/// Print API documentation to stderr
pub fn print_api_docs(config: &ApiConfig) {
    eprintln!("surge control API on http://{}", config.bind_address());
    for (method, path, desc) in get_api_routes() {
        eprintln!("  {:5} {:22} {}", method, path, desc);
    }
    eprintln!(
        "  curl -X POST http://{}/campaigns -H 'Content-Type: application/json' \\",
        config.bind_address()
    );
    eprintln!("       -d '{{\"profile\": \"baseline\", \"target\": \"127.0.0.1\"}}'");
}
