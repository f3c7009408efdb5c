use std::sync::Arc;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use crate::config::RegistryConfig;
use crate::discovery::orchestrator::DiscoveryHandle;
use crate::error::RegistryError;
use crate::registry::Registry;
use shared::types::{
    ApplicationQuery, ApplicationRecord, ApplicationRegistration, ApplicationType,
    DiscoveryConfig, DiscoveryMode, DiscoveryStatus, EndpointQuery, EndpointRecord, Page,
    PurgeSummary, ReconcileSummary, SecurityMode,
};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub discovery: DiscoveryHandle,
    pub hash_rx: watch::Receiver<String>,
    pub config: Arc<RegistryConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationParams {
    pub continuation: Option<String>,
    pub page_size: Option<usize>,
    pub application_uri: Option<String>,
    pub application_name: Option<String>,
    pub application_type: Option<ApplicationType>,
    pub product_uri: Option<String>,
    pub supervisor_id: Option<String>,
    pub site_id: Option<String>,
    pub capability: Option<String>,
    #[serde(default)]
    pub include_disabled: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointParams {
    pub continuation: Option<String>,
    pub page_size: Option<usize>,
    pub application_id: Option<String>,
    pub url: Option<String>,
    pub security_mode: Option<SecurityMode>,
    pub security_policy: Option<String>,
    #[serde(default)]
    pub include_disabled: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeParams {
    pub not_seen_for_secs: Option<u64>,
}

#[derive(Deserialize)]
pub struct DiscoveryRequest {
    pub mode: DiscoveryMode,
    #[serde(flatten)]
    pub config: DiscoveryConfig,
}

#[derive(Serialize)]
pub struct DiscoveryResponse {
    pub restarted: bool,
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub url: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/applications", get(get_applications))
        .route(
            "/v1/applications/:id",
            get(get_application).delete(unregister_application),
        )
        .route("/v1/applications/:id/disable", post(disable_application))
        .route("/v1/applications/:id/enable", post(enable_application))
        .route("/v1/endpoints", get(get_endpoints))
        .route("/v1/endpoints/:id", get(get_endpoint))
        .route("/v1/registry/hash", get(get_hash))
        .route("/v1/registry/purge", post(purge))
        .route("/v1/discovery", get(get_discovery).put(put_discovery))
        .route("/v1/discovery/scan", post(trigger_scan))
        .route("/v1/discovery/cancel", post(cancel_scan))
        .route("/v1/discovery/register", post(register))
        .with_state(state)
}

fn status_of(e: &RegistryError) -> StatusCode {
    match e {
        RegistryError::NotFound { .. } => StatusCode::NOT_FOUND,
        RegistryError::InvalidContinuation => StatusCode::BAD_REQUEST,
        RegistryError::Conflict { .. } => StatusCode::CONFLICT,
        RegistryError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn registry_failure(what: &str) -> impl Fn(RegistryError) -> StatusCode + '_ {
    move |e| {
        let status = status_of(&e);
        if status.is_server_error() {
            tracing::error!("Failed to {}: {}", what, e);
        } else {
            tracing::debug!("Failed to {}: {}", what, e);
        }
        status
    }
}

async fn get_applications(
    State(state): State<AppState>,
    Query(params): Query<ApplicationParams>,
) -> Result<Json<Page<ApplicationRecord>>, StatusCode> {
    let filter = ApplicationQuery {
        application_uri: params.application_uri,
        application_name: params.application_name,
        application_type: params.application_type,
        product_uri: params.product_uri,
        supervisor_id: params.supervisor_id,
        site_id: params.site_id,
        capability: params.capability,
        include_disabled: params.include_disabled,
    };
    let continuation = params.continuation.as_deref();
    let page = if filter == ApplicationQuery::default() {
        state.registry.list_applications(continuation, params.page_size).await
    } else {
        state.registry.query_applications(&filter, continuation, params.page_size).await
    };
    page.map(Json)
        .map_err(registry_failure("query applications"))
}

async fn get_application(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApplicationRegistration>, StatusCode> {
    state
        .registry
        .get_application(&id)
        .await
        .map(|registration| Json(redact_registration(registration)))
        .map_err(registry_failure("get application"))
}

async fn unregister_application(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    state
        .registry
        .unregister_application(&id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(registry_failure("unregister application"))
}

async fn disable_application(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    state
        .registry
        .disable_application(&id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(registry_failure("disable application"))
}

async fn enable_application(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    state
        .registry
        .enable_application(&id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(registry_failure("enable application"))
}

async fn get_endpoints(
    State(state): State<AppState>,
    Query(params): Query<EndpointParams>,
) -> Result<Json<Page<EndpointRecord>>, StatusCode> {
    let filter = EndpointQuery {
        application_id: params.application_id,
        url: params.url,
        security_mode: params.security_mode,
        security_policy: params.security_policy,
        include_disabled: params.include_disabled,
    };
    let continuation = params.continuation.as_deref();
    let page = if filter == EndpointQuery::default() {
        state.registry.list_endpoints(continuation, params.page_size).await
    } else {
        state.registry.query_endpoints(&filter, continuation, params.page_size).await
    };
    page.map(|page| Json(redact_page(page)))
        .map_err(registry_failure("query endpoints"))
}

async fn get_endpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EndpointRecord>, StatusCode> {
    state
        .registry
        .get_endpoint(&id)
        .await
        .map(|record| Json(record.redacted()))
        .map_err(registry_failure("get endpoint"))
}

/// Credential secrets are stored for identity but never served
fn redact_page(page: Page<EndpointRecord>) -> Page<EndpointRecord> {
    Page {
        items: page.items.into_iter().map(EndpointRecord::redacted).collect(),
        continuation_token: page.continuation_token,
    }
}

fn redact_registration(mut registration: ApplicationRegistration) -> ApplicationRegistration {
    registration.endpoints = registration
        .endpoints
        .into_iter()
        .map(EndpointRecord::redacted)
        .collect();
    registration
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.hash_rx.borrow().clone()
}

async fn purge(
    State(state): State<AppState>,
    Query(params): Query<PurgeParams>,
) -> Result<Json<PurgeSummary>, StatusCode> {
    let secs = params.not_seen_for_secs.unwrap_or(state.config.purge_after_secs);
    let not_seen_for = chrono::Duration::seconds(secs.min(i64::MAX as u64) as i64);
    state
        .registry
        .purge_disabled(not_seen_for, Utc::now())
        .await
        .map(Json)
        .map_err(registry_failure("purge registry"))
}

async fn get_discovery(State(state): State<AppState>) -> Json<DiscoveryStatus> {
    Json(state.discovery.status())
}

async fn put_discovery(
    State(state): State<AppState>,
    Json(request): Json<DiscoveryRequest>,
) -> Result<Json<DiscoveryResponse>, StatusCode> {
    state
        .discovery
        .set_discovery_mode(request.mode, request.config)
        .await
        .map(|restarted| Json(DiscoveryResponse { restarted }))
        .map_err(|e| {
            tracing::error!("Failed to update discovery settings: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        })
}

async fn trigger_scan(State(state): State<AppState>) -> StatusCode {
    match state.discovery.trigger_scan().await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            tracing::error!("Failed to trigger scan: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn cancel_scan(State(state): State<AppState>) -> StatusCode {
    match state.discovery.cancel_scan().await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            tracing::error!("Failed to cancel scan: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<ReconcileSummary>, (StatusCode, String)> {
    state
        .discovery
        .register(request.url)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::debug!("Register request failed: {:#}", e);
            (StatusCode::BAD_GATEWAY, format!("{:#}", e))
        })
}
