//! REST API v1: JSON endpoints over the gateway operations.
//!
//! All byte payloads (file contents, HTTP bodies) travel base64-encoded.
//! Errors are returned as `{"error": {"kind": ..., "reason": ...}}` with a
//! status code derived from the error kind.

use axum::{
    Router,
    extract::{ConnectInfo, Path as UrlPath, Request, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use warden_core::{CallerContext, ErrorKind, GatewayError};
use warden_executor::{CommandOutput, HttpResponse};
use warden_security::{AuditOp, AuditOutcome, AuditRecord, SecretMetadata};

use crate::gateway::{Gateway, GatewayStatus};

/// Header naming the caller recorded in the audit log.
pub const ACTOR_HEADER: &str = "x-warden-actor";
/// Optional header carrying a caller session id.
pub const SESSION_HEADER: &str = "x-warden-session";

const ANONYMOUS: &str = "anonymous";
const MAX_ACTOR_CHARS: usize = 64;

/// Shared state for all v1 API handlers.
pub struct ApiState {
    pub gateway: Arc<Gateway>,
    /// Accepted bearer tokens. Empty disables authentication.
    pub bearer_tokens: Vec<String>,
    pub rate_limiter: Option<RateLimiter>,
}

pub type SharedApiState = Arc<ApiState>;

impl ApiState {
    pub fn new(gateway: Arc<Gateway>, bearer_tokens: Vec<String>) -> Self {
        Self {
            gateway,
            bearer_tokens,
            rate_limiter: None,
        }
    }

    /// Limit each client to `per_minute` requests. `0` leaves it unlimited.
    pub fn with_rate_limit(mut self, per_minute: usize) -> Self {
        self.rate_limiter =
            (per_minute > 0).then(|| RateLimiter::new(per_minute, Duration::from_secs(60)));
        self
    }
}

/// Build the v1 API router.
pub fn v1_router(state: SharedApiState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/command", post(run_command_handler))
        .route("/files/read", post(read_file_handler))
        .route("/files/write", post(write_file_handler))
        .route("/http/get", post(http_get_handler))
        .route("/http/post", post(http_post_handler))
        .route("/secrets", get(list_secrets_handler).post(add_secret_handler))
        .route(
            "/secrets/{key}",
            get(get_secret_handler)
                .put(rotate_secret_handler)
                .delete(delete_secret_handler),
        )
        .route("/vault/reload", post(reload_vault_handler))
        .with_state(state)
}

// ── Errors ────────────────────────────────────────────────────────────────

/// A gateway error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    kind: ErrorKind,
    reason: &'a str,
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        // The extractor's own text can quote the body back; keep it in the log.
        debug!(error = %rejection.body_text(), "Rejected request body");
        let reason = match rejection {
            JsonRejection::MissingJsonContentType(_) => "content-type must be application/json",
            JsonRejection::JsonSyntaxError(_) => "request body is not valid JSON",
            JsonRejection::JsonDataError(_) => "request body does not match the expected fields",
            _ => "request body could not be read",
        };
        Self(GatewayError::new(ErrorKind::MalformedInput, reason))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.0.kind,
                reason: &self.0.reason,
            },
        };
        (status_for(self.0.kind), Json(body)).into_response()
    }
}

/// HTTP status for an error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::DisallowedCommand
        | ErrorKind::DangerousCharacter
        | ErrorKind::PathTraversal
        | ErrorKind::InvalidScheme
        | ErrorKind::ForbiddenHost
        | ErrorKind::MalformedInput => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound | ErrorKind::KeyNotFound => StatusCode::NOT_FOUND,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::KeyAlreadyExists => StatusCode::CONFLICT,
        ErrorKind::VaultLocked => StatusCode::LOCKED,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::ExecutionFailed => StatusCode::BAD_GATEWAY,
        ErrorKind::Truncated | ErrorKind::LoggingDegraded => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn decode_base64(field: &str, encoded: &str) -> Result<Vec<u8>, ApiError> {
    BASE64.decode(encoded).map_err(|_| {
        ApiError(GatewayError::new(
            ErrorKind::MalformedInput,
            format!("{field} is not valid base64"),
        ))
    })
}

/// Caller identity from request headers. Control characters are dropped and
/// the name is capped; a missing or empty header means `anonymous`.
pub fn caller_from_headers(headers: &HeaderMap) -> CallerContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                v.chars()
                    .filter(|c| !c.is_control())
                    .take(MAX_ACTOR_CHARS)
                    .collect::<String>()
                    .trim()
                    .to_string()
            })
            .filter(|v| !v.is_empty())
    };

    let ctx = CallerContext::new(header(ACTOR_HEADER).unwrap_or_else(|| ANONYMOUS.into()));
    match header(SESSION_HEADER) {
        Some(session) => ctx.with_session(session),
        None => ctx,
    }
}

/// Run a vault operation on the blocking pool.
async fn blocking<T, F>(state: &SharedApiState, op: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Gateway) -> Result<T, GatewayError> + Send + 'static,
{
    let gateway = state.gateway.clone();
    tokio::task::spawn_blocking(move || op(&gateway))
        .await
        .map_err(|e| {
            ApiError(GatewayError::new(
                ErrorKind::ExecutionFailed,
                format!("vault task failed: {e}"),
            ))
        })?
        .map_err(ApiError)
}

// ── Status ────────────────────────────────────────────────────────────────

async fn status_handler(State(state): State<SharedApiState>) -> Json<GatewayStatus> {
    Json(state.gateway.status())
}

// ── Commands ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    /// Seconds; `0` or absent uses the configured default.
    #[serde(default)]
    pub timeout_secs: u64,
}

async fn run_command_handler(
    State(state): State<SharedApiState>,
    headers: HeaderMap,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> ApiResult<CommandOutput> {
    let Json(req) = payload?;
    let ctx = caller_from_headers(&headers);
    let output = state
        .gateway
        .run_command(&ctx, &req.command, req.timeout_secs)
        .await?;
    Ok(Json(output))
}

// ── Files ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct FileReadRequest {
    pub path: String,
    pub base_dir: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct FileReadResponse {
    pub content_base64: String,
    pub bytes: usize,
    pub truncated: bool,
}

async fn read_file_handler(
    State(state): State<SharedApiState>,
    headers: HeaderMap,
    payload: Result<Json<FileReadRequest>, JsonRejection>,
) -> ApiResult<FileReadResponse> {
    let Json(req) = payload?;
    let ctx = caller_from_headers(&headers);
    let content = state
        .gateway
        .read_file(&ctx, &req.path, &req.base_dir)
        .await?;
    Ok(Json(FileReadResponse {
        content_base64: BASE64.encode(&content.bytes),
        bytes: content.bytes.len(),
        truncated: content.truncated,
    }))
}

#[derive(Debug, Deserialize)]
pub struct FileWriteRequest {
    pub path: String,
    pub base_dir: PathBuf,
    pub content_base64: String,
}

#[derive(Debug, Serialize)]
pub struct FileWriteResponse {
    pub path: PathBuf,
    pub bytes_written: usize,
}

async fn write_file_handler(
    State(state): State<SharedApiState>,
    headers: HeaderMap,
    payload: Result<Json<FileWriteRequest>, JsonRejection>,
) -> ApiResult<FileWriteResponse> {
    let Json(req) = payload?;
    let content = decode_base64("content_base64", &req.content_base64)?;
    let ctx = caller_from_headers(&headers);
    let receipt = state
        .gateway
        .write_file(&ctx, &req.path, &req.base_dir, &content)
        .await?;
    Ok(Json(FileWriteResponse {
        path: receipt.path,
        bytes_written: receipt.bytes_written,
    }))
}

// ── HTTP ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HttpGetRequest {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct HttpPostRequest {
    pub url: String,
    #[serde(default)]
    pub body_base64: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HttpFetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body_base64: String,
    pub truncated: bool,
}

impl From<HttpResponse> for HttpFetchResponse {
    fn from(response: HttpResponse) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            body_base64: BASE64.encode(&response.body),
            truncated: response.truncated,
        }
    }
}

async fn http_get_handler(
    State(state): State<SharedApiState>,
    headers: HeaderMap,
    payload: Result<Json<HttpGetRequest>, JsonRejection>,
) -> ApiResult<HttpFetchResponse> {
    let Json(req) = payload?;
    let ctx = caller_from_headers(&headers);
    let response = state.gateway.http_get(&ctx, &req.url).await?;
    Ok(Json(response.into()))
}

async fn http_post_handler(
    State(state): State<SharedApiState>,
    headers: HeaderMap,
    payload: Result<Json<HttpPostRequest>, JsonRejection>,
) -> ApiResult<HttpFetchResponse> {
    let Json(req) = payload?;
    let body = decode_base64("body_base64", &req.body_base64)?;
    let ctx = caller_from_headers(&headers);
    let response = state
        .gateway
        .http_post(&ctx, &req.url, body, req.content_type.as_deref())
        .await?;
    Ok(Json(response.into()))
}

// ── Secrets ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AddSecretRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct RotateSecretRequest {
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct SecretValueResponse {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct SecretListResponse {
    pub secrets: Vec<SecretMetadata>,
}

async fn list_secrets_handler(
    State(state): State<SharedApiState>,
    headers: HeaderMap,
) -> ApiResult<SecretListResponse> {
    let ctx = caller_from_headers(&headers);
    let secrets = blocking(&state, move |gw| gw.secret_list(&ctx)).await?;
    Ok(Json(SecretListResponse { secrets }))
}

async fn add_secret_handler(
    State(state): State<SharedApiState>,
    headers: HeaderMap,
    payload: Result<Json<AddSecretRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let Json(req) = payload?;
    let ctx = caller_from_headers(&headers);
    let key = req.key.clone();
    blocking(&state, move |gw| gw.secret_add(&ctx, &req.key, &req.value)).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "key": key }))))
}

async fn get_secret_handler(
    State(state): State<SharedApiState>,
    headers: HeaderMap,
    UrlPath(key): UrlPath<String>,
) -> ApiResult<SecretValueResponse> {
    let ctx = caller_from_headers(&headers);
    let lookup = key.clone();
    let value = blocking(&state, move |gw| gw.secret_get(&ctx, &lookup)).await?;
    Ok(Json(SecretValueResponse { key, value }))
}

async fn rotate_secret_handler(
    State(state): State<SharedApiState>,
    headers: HeaderMap,
    UrlPath(key): UrlPath<String>,
    payload: Result<Json<RotateSecretRequest>, JsonRejection>,
) -> ApiResult<serde_json::Value> {
    let Json(req) = payload?;
    let ctx = caller_from_headers(&headers);
    let target = key.clone();
    blocking(&state, move |gw| gw.secret_rotate(&ctx, &target, &req.value)).await?;
    Ok(Json(serde_json::json!({ "key": key, "rotated": true })))
}

async fn delete_secret_handler(
    State(state): State<SharedApiState>,
    headers: HeaderMap,
    UrlPath(key): UrlPath<String>,
) -> Result<StatusCode, ApiError> {
    let ctx = caller_from_headers(&headers);
    blocking(&state, move |gw| gw.secret_delete(&ctx, &key)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reload_vault_handler(
    State(state): State<SharedApiState>,
    headers: HeaderMap,
) -> ApiResult<serde_json::Value> {
    let ctx = caller_from_headers(&headers);
    let count = blocking(&state, move |gw| gw.secret_reload(&ctx)).await?;
    Ok(Json(serde_json::json!({ "secrets": count })))
}

// ── Middleware ────────────────────────────────────────────────────────────

/// Bearer token authentication for `/v1`.
///
/// With no tokens configured every request passes. Failures are audited.
pub async fn auth_middleware(
    State(state): State<SharedApiState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if state.bearer_tokens.is_empty() {
        return Ok(next.run(req).await);
    }

    let presented = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if state.bearer_tokens.iter().any(|t| t == token) => Ok(next.run(req).await),
        _ => {
            let ctx = caller_from_headers(req.headers());
            warn!(actor = %ctx.actor, path = %req.uri().path(), "Unauthorized request to /v1 API");
            state.gateway.write_audit(AuditRecord::new(
                &ctx.actor,
                AuditOp::AuthFailure,
                req.uri().path(),
                AuditOutcome::Rejected,
                "missing or invalid bearer token",
            ));
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// Rate limiting for `/v1`.
///
/// Runs after authentication, so with tokens configured the presented token
/// is a valid one and names the client. Everything else is keyed on the peer
/// address; caller-supplied headers never pick the bucket.
pub async fn rate_limit_middleware(
    State(state): State<SharedApiState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(limiter) = &state.rate_limiter else {
        return Ok(next.run(req).await);
    };

    let token = if state.bearer_tokens.is_empty() {
        None
    } else {
        req.headers()
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
    };
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |ConnectInfo(addr)| addr.ip().to_string());
    let client_key = match token {
        Some(token) => format!("token:{token}"),
        None => format!("peer:{peer}"),
    };

    if !limiter.check(&client_key) {
        warn!(peer = %peer, authenticated = token.is_some(), "Rate limit exceeded");
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }
    Ok(next.run(req).await)
}

/// Sliding-window request counter per client key.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    clients: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Count a request. Returns `false` when the client is over the limit.
    pub fn check(&self, client_key: &str) -> bool {
        let now = Instant::now();
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);

        if clients.len() > 10_000 {
            clients.retain(|_, stamps| {
                stamps
                    .last()
                    .is_some_and(|t| now.duration_since(*t) < self.window)
            });
        }

        let stamps = clients.entry(client_key.to_string()).or_default();
        stamps.retain(|t| now.duration_since(*t) < self.window);
        if stamps.len() >= self.max_requests {
            return false;
        }
        stamps.push(now);
        true
    }
}
