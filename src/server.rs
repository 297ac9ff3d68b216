//! HTTP ingestion gateway.
//!
//! This module provides the HTTP surface of the platform:
//! - Signed provider webhooks via POST /webhooks/:provider
//! - Device connection lifecycle (connect, OAuth callback, sync, disconnect)
//! - Patient trend, baseline, and sample-count queries
//!
//! # Architecture
//!
//! ```text
//! Wearable providers ──→ POST /webhooks/:provider ──→ verify ──→ normalize ──→ store
//! Clinician dashboard ──→ GET /patients/:id/trends/:metric ──→ trend engine
//! ```

use crate::config::Config;
use crate::error::IngestError;
use crate::store::{DeviceStore, MemorySampleStore, SampleStore};
use crate::sync::{ConnectOutcome, SyncEngine};
use crate::trends::TrendEngine;
use crate::types::{Device, MetricType, ProviderKind};
use crate::vault;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Webhook batches larger than this are processed off the request path.
const INLINE_BATCH_LIMIT: usize = 500;

/// Shared server state
pub struct ServerState {
    config: Config,
    devices: Arc<DeviceStore>,
    samples: Arc<dyn SampleStore>,
    trends: Arc<TrendEngine>,
    sync: SyncEngine,
}

impl ServerState {
    pub fn new(config: Config) -> Self {
        let devices = Arc::new(DeviceStore::new());
        let samples: Arc<dyn SampleStore> = Arc::new(MemorySampleStore::new());
        let trends = Arc::new(TrendEngine::new(
            samples.clone(),
            config.thresholds.clone(),
            config.baseline_window_days,
            config.current_window_days,
        ));
        let sync = SyncEngine::new(&config, devices.clone(), samples.clone(), trends.clone());
        Self {
            config,
            devices,
            samples,
            trends,
            sync,
        }
    }
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

fn map_error(e: IngestError) -> ApiError {
    // Provider and crypto failures are logged in full but surfaced with a
    // fixed message; raw upstream error text never crosses the boundary.
    let (status, code, message): (_, _, Option<&str>) = match &e {
        IngestError::UnknownProvider(_) => (StatusCode::NOT_FOUND, "UNKNOWN_PROVIDER", None),
        IngestError::UnknownDevice(_) => (StatusCode::NOT_FOUND, "UNKNOWN_DEVICE", None),
        IngestError::UnsupportedCapability { .. } => {
            (StatusCode::NOT_FOUND, "UNSUPPORTED_CAPABILITY", None)
        }
        IngestError::InvalidSignature => (StatusCode::UNAUTHORIZED, "INVALID_SIGNATURE", None),
        IngestError::Json(_) | IngestError::Parse(_) => {
            (StatusCode::BAD_REQUEST, "INVALID_PAYLOAD", None)
        }
        IngestError::InvalidTimezone(_) => (StatusCode::BAD_REQUEST, "INVALID_TIMEZONE", None),
        IngestError::InvalidOauthState => (StatusCode::BAD_REQUEST, "INVALID_OAUTH_STATE", None),
        IngestError::UnsupportedMetric { .. } => {
            (StatusCode::BAD_REQUEST, "UNSUPPORTED_METRIC", None)
        }
        IngestError::InvalidTransition { .. }
        | IngestError::NotAuthorized { .. }
        | IngestError::MissingCredential(_) => (StatusCode::CONFLICT, "INVALID_STATE", None),
        IngestError::InsufficientSamples { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "INSUFFICIENT_SAMPLES", None)
        }
        IngestError::TokenExchange(_) | IngestError::TokenRefresh(_) => (
            StatusCode::BAD_GATEWAY,
            "PROVIDER_AUTH_FAILED",
            Some("provider authorization failed, reconnect the device"),
        ),
        IngestError::Http(_) | IngestError::ProviderApi { .. } | IngestError::FetchTimeout(_) => (
            StatusCode::BAD_GATEWAY,
            "PROVIDER_ERROR",
            Some("provider request failed"),
        ),
        IngestError::VaultUninitialized | IngestError::Encrypt | IngestError::Decrypt => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "CREDENTIAL_ERROR",
            Some("credential handling failed"),
        ),
    };
    if message.is_some() {
        tracing::error!(code, error = %e, "request failed");
    }
    api_error(status, code, message.map(String::from).unwrap_or_else(|| e.to_string()))
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Device representation returned by the API. Credentials never leave the
/// server, not even encrypted.
#[derive(Serialize)]
pub struct DeviceResponse {
    pub id: String,
    pub patient_id: String,
    pub provider: ProviderKind,
    pub state: crate::types::DeviceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    pub timezone: String,
    pub enabled_metrics: Vec<MetricType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<Device> for DeviceResponse {
    fn from(d: Device) -> Self {
        Self {
            id: d.id,
            patient_id: d.patient_id,
            provider: d.provider,
            state: d.state,
            serial_number: d.serial_number,
            timezone: d.timezone,
            enabled_metrics: d.enabled_metrics,
            last_sync: d.last_sync,
            created_at: d.created_at,
        }
    }
}

#[derive(Serialize)]
struct WebhookResponse {
    status: String,
    processed: usize,
}

/// POST /webhooks/:provider
///
/// Verifies the provider's HMAC signature before anything is parsed, then
/// normalizes and stores the batch for the device matching the payload's
/// serial number.
async fn webhook(
    State(state): State<Arc<ServerState>>,
    Path(provider_tag): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    let provider: ProviderKind = provider_tag.parse().map_err(map_error)?;
    let adapter = state.sync.registry().push(provider).map_err(map_error)?;

    let secret = state
        .config
        .providers
        .webhook_secret(provider)
        .ok_or_else(|| {
            api_error(
                StatusCode::UNAUTHORIZED,
                "NO_WEBHOOK_SECRET",
                format!("no webhook secret configured for {provider}"),
            )
        })?;

    let scheme = adapter.scheme();
    let signature = headers
        .get(scheme.header)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| map_error(IngestError::InvalidSignature))?;
    if !adapter.validate_webhook(signature, &body, secret) {
        return Err(map_error(IngestError::InvalidSignature));
    }

    let payload = adapter.parse_payload(&body).map_err(map_error)?;
    let device = state
        .devices
        .find_by_serial(provider, &payload.serial_number)
        .ok_or_else(|| map_error(IngestError::UnknownDevice(payload.serial_number.clone())))?;

    if payload.samples.len() > INLINE_BATCH_LIMIT {
        let received = payload.samples.len();
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = state.sync.ingest_samples(&device, payload.samples) {
                tracing::error!(device_id = %device.id, error = %e, "deferred webhook batch failed");
            }
        });
        return Ok(Json(WebhookResponse {
            status: "accepted".to_string(),
            processed: received,
        }));
    }

    let processed = state
        .sync
        .ingest_samples(&device, payload.samples)
        .map_err(map_error)?;
    Ok(Json(WebhookResponse {
        status: "ok".to_string(),
        processed,
    }))
}

#[derive(Deserialize)]
struct ConnectRequest {
    patient_id: String,
    provider: ProviderKind,
    serial_number: Option<String>,
    timezone: Option<String>,
}

#[derive(Serialize)]
struct ConnectResponse {
    device: DeviceResponse,
    /// Plaintext push token, returned exactly once at registration.
    #[serde(skip_serializing_if = "Option::is_none")]
    push_token: Option<String>,
    /// Webhook path the device's companion app should deliver to.
    #[serde(skip_serializing_if = "Option::is_none")]
    webhook_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    authorization_url: Option<String>,
}

/// POST /devices/connect
async fn connect(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<ConnectRequest>,
) -> Result<Json<ConnectResponse>, ApiError> {
    let outcome = state
        .sync
        .begin_connect(&req.patient_id, req.provider, req.serial_number, req.timezone)
        .await
        .map_err(map_error)?;

    let response = match outcome {
        ConnectOutcome::PushRegistered { device, push_token } => {
            let webhook_path = format!("/webhooks/{}", device.provider);
            ConnectResponse {
                device: device.into(),
                push_token: Some(push_token),
                webhook_path: Some(webhook_path),
                authorization_url: None,
            }
        }
        ConnectOutcome::PullPending {
            device,
            authorization_url,
        } => ConnectResponse {
            device: device.into(),
            push_token: None,
            webhook_path: None,
            authorization_url: Some(authorization_url),
        },
    };
    Ok(Json(response))
}

#[derive(Deserialize)]
struct OauthCallbackQuery {
    state: String,
    code: String,
}

/// GET /oauth/callback
async fn oauth_callback(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<OauthCallbackQuery>,
) -> Result<Json<DeviceResponse>, ApiError> {
    let device = state
        .sync
        .complete_oauth(&query.state, &query.code)
        .await
        .map_err(map_error)?;
    Ok(Json(device.into()))
}

#[derive(Serialize)]
struct SyncResponse {
    stored: std::collections::HashMap<MetricType, usize>,
    errors: Vec<SyncErrorEntry>,
}

#[derive(Serialize)]
struct SyncErrorEntry {
    metric: MetricType,
    error: String,
}

#[derive(Deserialize)]
struct SyncQuery {
    /// Fetch window start; defaults to the device's last sync.
    since: Option<chrono::DateTime<chrono::Utc>>,
}

/// POST /devices/:id/sync
async fn sync_device(
    State(state): State<Arc<ServerState>>,
    Path(device_id): Path<String>,
    Query(query): Query<SyncQuery>,
) -> Result<Json<SyncResponse>, ApiError> {
    let outcome = state
        .sync
        .sync_device(&device_id, query.since)
        .await
        .map_err(map_error)?;
    Ok(Json(SyncResponse {
        stored: outcome.stored,
        errors: outcome
            .errors
            .into_iter()
            .map(|(metric, error)| SyncErrorEntry { metric, error })
            .collect(),
    }))
}

/// GET /devices/:id
async fn get_device(
    State(state): State<Arc<ServerState>>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceResponse>, ApiError> {
    let device = state
        .devices
        .get(&device_id)
        .ok_or_else(|| map_error(IngestError::UnknownDevice(device_id)))?;
    Ok(Json(device.into()))
}

/// DELETE /devices/:id
///
/// Disconnects rather than deletes: credentials are cleared and the device
/// stops matching webhooks, while its historical samples remain queryable.
async fn disconnect_device(
    State(state): State<Arc<ServerState>>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceResponse>, ApiError> {
    let device = state.sync.disconnect(&device_id).await.map_err(map_error)?;
    Ok(Json(device.into()))
}

/// GET /devices
async fn list_devices(State(state): State<Arc<ServerState>>) -> Json<Vec<DeviceResponse>> {
    Json(state.devices.list().into_iter().map(Into::into).collect())
}

fn parse_metric(metric: &str) -> Result<MetricType, ApiError> {
    metric
        .parse()
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, "UNKNOWN_METRIC", format!("unknown metric type: {metric}")))
}

/// GET /patients/:patient_id/trends/:metric
async fn patient_trend(
    State(state): State<Arc<ServerState>>,
    Path((patient_id, metric)): Path<(String, String)>,
) -> Result<Json<crate::trends::TrendResult>, ApiError> {
    let metric = parse_metric(&metric)?;
    let trend = state.trends.trend(&patient_id, metric).map_err(map_error)?;
    Ok(Json(trend))
}

/// GET /patients/:patient_id/baseline/:metric
async fn patient_baseline(
    State(state): State<Arc<ServerState>>,
    Path((patient_id, metric)): Path<(String, String)>,
) -> Result<Json<crate::trends::Baseline>, ApiError> {
    let metric = parse_metric(&metric)?;
    let baseline = state
        .trends
        .baseline(&patient_id, metric)
        .map_err(map_error)?;
    Ok(Json(baseline))
}

#[derive(Serialize)]
struct CountResponse {
    patient_id: String,
    metric: MetricType,
    count: usize,
}

/// GET /patients/:patient_id/samples/:metric/count
async fn patient_sample_count(
    State(state): State<Arc<ServerState>>,
    Path((patient_id, metric)): Path<(String, String)>,
) -> Result<Json<CountResponse>, ApiError> {
    let metric = parse_metric(&metric)?;
    let count = state.samples.count(&patient_id, metric);
    Ok(Json(CountResponse {
        patient_id,
        metric,
        count,
    }))
}

/// Run the HTTP server
pub async fn run(config: Config) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    vault::init(&config.vault_secret);
    let port = config.port;
    let state = Arc::new(ServerState::new(config));

    let app = Router::new()
        .route("/health", get(health))
        .route("/webhooks/:provider", post(webhook))
        .route("/devices", get(list_devices))
        .route("/devices/connect", post(connect))
        .route("/devices/:id", get(get_device).delete(disconnect_device))
        .route("/devices/:id/sync", post(sync_device))
        .route("/oauth/callback", get(oauth_callback))
        .route("/patients/:patient_id/trends/:metric", get(patient_trend))
        .route(
            "/patients/:patient_id/baseline/:metric",
            get(patient_baseline),
        )
        .route(
            "/patients/:patient_id/samples/:metric/count",
            get(patient_sample_count),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("vitalgate listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
