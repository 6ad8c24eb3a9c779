//! Warden gateway: the only entry point for side effects.
//!
//! [`Gateway`] chains validation, audit and execution for every operation.
//! The [`api`] module exposes the same operations over HTTP.
//!
//! Built on Axum.

pub mod api;
pub mod gateway;

pub use gateway::{Gateway, GatewayStatus, InitError, WriteReceipt};

use axum::extract::DefaultBodyLimit;
use axum::{Router, middleware, response::Json, routing::get};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{info, warn};

use warden_config::AppConfig;

/// Request body limit for every route.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Errors starting the HTTP server.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error(transparent)]
    Init(#[from] InitError),

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build the full router: `/health` plus the authenticated, rate-limited `/v1`.
///
/// Security layers applied:
/// - Bearer token authentication on all /v1 routes
/// - Per-client rate limiting on all /v1 routes
/// - Request body size limit (1 MB)
/// - HTTP trace logging
pub fn build_router(state: api::SharedApiState) -> Router {
    let v1 = api::v1_router(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api::rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(state, api::auth_middleware));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", v1)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Start the gateway HTTP server and run until Ctrl-C.
pub async fn start(config: AppConfig) -> Result<(), ServeError> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let gateway = Arc::new(Gateway::from_config(&config)?);
    let tokens = config.server.bearer_tokens();

    let exposed = config
        .server
        .host
        .parse::<IpAddr>()
        .map_or(true, |ip| !ip.is_loopback());
    if tokens.is_empty() && exposed {
        warn!(host = %config.server.host, "No API tokens configured on a non-loopback address; /v1 is unauthenticated");
    }

    let state = Arc::new(
        api::ApiState::new(gateway, tokens).with_rate_limit(config.server.rate_limit_per_minute),
    );
    let app = build_router(state);

    info!(addr = %addr, "Warden gateway listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    info!("Warden gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl-C; running until killed");
        std::future::pending::<()>().await;
    }
}
