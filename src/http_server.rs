use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::SystemTime};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::dnssec::DnsSecAlgorithm;
use crate::engine::SigningEngine;
use crate::error::SignerError;
use crate::keystore::EnableRequest;
use crate::model::{EntryId, Key, KeyId, NsecMode, ZoneId};

/// Default and maximum page size for audit log reads
const DEFAULT_LOG_LIMIT: usize = 50;
const MAX_LOG_LIMIT: usize = 1000;

/// Administrative HTTP API, metrics export and health check
pub struct HttpServer {
    engine: Arc<SigningEngine>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(engine: Arc<SigningEngine>, bind_addr: SocketAddr) -> Self {
        Self { engine, bind_addr }
    }

    /// Build the router; exposed for in-process tests
    pub fn router(engine: Arc<SigningEngine>) -> Router {
        let app_state = AppState {
            engine,
            startup_time: SystemTime::now(),
        };

        Router::new()
            .route("/health", get(health_check))
            .route("/metrics", get(prometheus_metrics))
            .route("/dnssec/zones", get(list_zones))
            .route("/dnssec/zones/{id}", get(get_zone))
            .route("/dnssec/zones/{id}/enable", post(enable_zone))
            .route("/dnssec/zones/{id}/disable", post(disable_zone))
            .route("/dnssec/zones/{id}/sign", post(sign_zone))
            // GET takes a zone id, DELETE a key id
            .route("/dnssec/keys/{id}", get(list_keys).delete(deactivate_key))
            .route("/dnssec/keys/{id}/ds", get(list_ds_records))
            .route("/dnssec/keys/{id}/generate", post(generate_key))
            .route("/dnssec/queue", get(list_queue))
            .route("/dnssec/queue/{id}/retry", post(retry_entry))
            .route("/dnssec/logs/{zone_id}", get(list_logs))
            .with_state(app_state)
            .layer(CorsLayer::permissive())
    }

    /// Serve until the shutdown signal fires
    pub async fn start(
        self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let app = Self::router(self.engine);

        info!("Starting HTTP server on {}", self.bind_addr);
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                debug!("HTTP server received shutdown signal");
            })
            .await?;

        Ok(())
    }
}

#[derive(Clone)]
struct AppState {
    engine: Arc<SigningEngine>,
    startup_time: SystemTime,
}

/// Error rendered as `{ "success": false, "error": kind, "message": ... }`
struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind,
            message: message.into(),
        }
    }
}

impl From<SignerError> for ApiError {
    fn from(err: SignerError) -> Self {
        let status = if err.is_validation() {
            StatusCode::BAD_REQUEST
        } else {
            match err {
                SignerError::NotFound(_) | SignerError::ZoneNotFound(_) => StatusCode::NOT_FOUND,
                SignerError::AlreadyEnabled(_)
                | SignerError::NotEnabled(_)
                | SignerError::AlreadyInactive(_)
                | SignerError::KeyInUse(_)
                | SignerError::ClaimLost { .. }
                | SignerError::ZoneNotSignable(_)
                | SignerError::KeyTagExhausted(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            }
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", err);
        }
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "success": false,
                "error": self.kind,
                "message": self.message
            })),
        )
            .into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

/// Run a core operation off the async runtime. Key generation and fsynced
/// writes can take a while.
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&SigningEngine) -> Result<T, SignerError> + Send + 'static,
    T: Send + 'static,
{
    let engine = state.engine.clone();
    match tokio::task::spawn_blocking(move || f(&engine)).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => {
            error!("Request task failed: {}", e);
            Err(SignerError::Storage("internal error".to_string()).into())
        }
    }
}

/// Algorithm given either as its number (13) or its mnemonic ("ECDSAP256SHA256")
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AlgorithmParam {
    Number(u8),
    Name(String),
}

impl AlgorithmParam {
    fn resolve(&self) -> Result<DnsSecAlgorithm, ApiError> {
        let parsed = match self {
            AlgorithmParam::Number(n) => DnsSecAlgorithm::from_u8(*n),
            AlgorithmParam::Name(name) => name
                .parse::<u8>()
                .ok()
                .and_then(DnsSecAlgorithm::from_u8)
                .or_else(|| name.parse().ok()),
        };
        parsed.ok_or_else(|| {
            ApiError::bad_request("invalid_algorithm", format!("unknown algorithm {:?}", self))
        })
    }
}

/// Basic health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = SystemTime::now()
        .duration_since(state.startup_time)
        .unwrap_or_default()
        .as_secs();
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": uptime
        })),
    )
}

/// Prometheus metrics endpoint
async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    state.engine.refresh_metrics();

    match state.engine.metrics().export() {
        Ok(metrics) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            metrics,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to export metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to export metrics".to_string(),
            )
                .into_response()
        }
    }
}

async fn list_zones(State(state): State<AppState>) -> ApiResult {
    let zones = state.engine.keystore().zone_views();
    Ok(Json(json!({ "success": true, "zones": zones })).into_response())
}

/// Zone detail with the signing policy it currently resolves to
async fn get_zone(State(state): State<AppState>, Path(id): Path<ZoneId>) -> ApiResult {
    let view = state.engine.keystore().zone_view(id)?;
    let policy = match state.engine.policy().resolve(&view) {
        Ok(policy) => json!({
            "algorithm": policy.algorithm,
            "algorithm_name": policy.algorithm.to_string(),
            "nsec_mode": policy.nsec_mode,
            "note": policy.denial_note,
            "validity_secs": policy.validity_window.as_secs(),
            "refresh_secs": policy.refresh_window.as_secs(),
            "auto_sign": policy.auto_sign,
        }),
        Err(e) => json!({ "error": e.kind(), "message": e.to_string() }),
    };
    let queue = state.engine.queue().open_entry(id);
    Ok(Json(json!({
        "success": true,
        "zone": view,
        "policy": policy,
        "queue": queue
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
struct EnableBody {
    algorithm: AlgorithmParam,
    #[serde(default)]
    nsec_mode: Option<String>,
    #[serde(default)]
    auto_sign: bool,
    #[serde(default)]
    signature_validity_secs: Option<u32>,
    #[serde(default)]
    signature_refresh_secs: Option<u32>,
}

async fn enable_zone(
    State(state): State<AppState>,
    Path(id): Path<ZoneId>,
    Json(body): Json<EnableBody>,
) -> ApiResult {
    let algorithm = body.algorithm.resolve()?;
    let nsec_mode = match &body.nsec_mode {
        Some(mode) => mode
            .parse::<NsecMode>()
            .map_err(|e| ApiError::bad_request("invalid_nsec_mode", e))?,
        None => NsecMode::default(),
    };
    let request = EnableRequest {
        algorithm,
        nsec_mode,
        auto_sign: body.auto_sign,
        signature_validity_secs: body.signature_validity_secs,
        signature_refresh_secs: body.signature_refresh_secs,
    };

    let zone = blocking(&state, move |engine| {
        engine.keystore().enable_dnssec(id, request)
    })
    .await?;
    Ok(Json(json!({ "success": true, "zone": zone })).into_response())
}

async fn disable_zone(State(state): State<AppState>, Path(id): Path<ZoneId>) -> ApiResult {
    let outcome = blocking(&state, move |engine| engine.keystore().disable_dnssec(id)).await?;
    Ok(Json(json!({
        "success": true,
        "zone": outcome.zone,
        "deactivated_keys": outcome.deactivated_keys,
        "cancelled_entries": outcome.cancelled_entries.len()
    }))
    .into_response())
}

#[derive(Debug, Default, Deserialize)]
struct SignBody {
    #[serde(default)]
    priority: Option<i32>,
}

async fn sign_zone(
    State(state): State<AppState>,
    Path(id): Path<ZoneId>,
    body: Option<Json<SignBody>>,
) -> ApiResult {
    let priority = body.and_then(|Json(b)| b.priority);
    let entry = blocking(&state, move |engine| engine.request_sign(id, priority)).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "entry": entry })),
    )
        .into_response())
}

async fn list_keys(State(state): State<AppState>, Path(zone_id): Path<ZoneId>) -> ApiResult {
    state.engine.keystore().zone(zone_id)?;
    let keys: Vec<_> = state
        .engine
        .keystore()
        .keys(zone_id)
        .iter()
        .map(Key::view)
        .collect();
    Ok(Json(json!({ "success": true, "keys": keys })).into_response())
}

async fn list_ds_records(State(state): State<AppState>, Path(zone_id): Path<ZoneId>) -> ApiResult {
    let records = state.engine.keystore().ds_records(zone_id)?;
    let records: Vec<_> = records
        .iter()
        .map(|ds| {
            json!({
                "key_tag": ds.key_tag,
                "algorithm": ds.algorithm,
                "digest_type": ds.digest_type,
                "digest": hex::encode_upper(&ds.digest),
                "record": ds.to_zone_format()
            })
        })
        .collect();
    Ok(Json(json!({ "success": true, "ds_records": records })).into_response())
}

#[derive(Debug, Deserialize)]
struct GenerateBody {
    algorithm: AlgorithmParam,
    #[serde(default)]
    key_size: Option<u32>,
    #[serde(default)]
    is_ksk: bool,
}

async fn generate_key(
    State(state): State<AppState>,
    Path(zone_id): Path<ZoneId>,
    Json(body): Json<GenerateBody>,
) -> ApiResult {
    let algorithm = body.algorithm.resolve()?;
    let key = blocking(&state, move |engine| {
        engine
            .keystore()
            .generate_key(zone_id, algorithm, body.is_ksk, body.key_size)
    })
    .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "key": key.view() })),
    )
        .into_response())
}

async fn deactivate_key(State(state): State<AppState>, Path(id): Path<KeyId>) -> ApiResult {
    let key = blocking(&state, move |engine| engine.keystore().deactivate_key(id)).await?;
    Ok(Json(json!({ "success": true, "key": key.view() })).into_response())
}

#[derive(Debug, Deserialize)]
struct QueueQuery {
    zone_id: Option<ZoneId>,
}

async fn list_queue(State(state): State<AppState>, Query(query): Query<QueueQuery>) -> ApiResult {
    let entries = state.engine.queue().list(query.zone_id);
    Ok(Json(json!({ "success": true, "entries": entries })).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct RetryBody {
    #[serde(default)]
    priority: Option<i32>,
}

async fn retry_entry(
    State(state): State<AppState>,
    Path(id): Path<EntryId>,
    body: Option<Json<RetryBody>>,
) -> ApiResult {
    let priority = body.and_then(|Json(b)| b.priority);
    let entry = blocking(&state, move |engine| engine.retry_entry(id, priority)).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "entry": entry })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_logs(
    State(state): State<AppState>,
    Path(zone_id): Path<ZoneId>,
    Query(query): Query<LogQuery>,
) -> ApiResult {
    state.engine.keystore().zone(zone_id)?;
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    if limit > MAX_LOG_LIMIT {
        warn!("Clamping audit log limit {} to {}", limit, MAX_LOG_LIMIT);
    }
    let limit = limit.min(MAX_LOG_LIMIT);
    let offset = query.offset.unwrap_or(0);

    let audit = state.engine.audit();
    let logs = audit.read(Some(zone_id), offset, limit);
    Ok(Json(json!({
        "success": true,
        "total": audit.count(Some(zone_id)),
        "offset": offset,
        "logs": logs
    }))
    .into_response())
}
