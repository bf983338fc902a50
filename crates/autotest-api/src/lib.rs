//! HTTP front end of the autotest grading service
//!
//! Clients register for an api key, upload test settings, submit work for
//! testing and poll for results. Every authenticated route runs the
//! authorization chain in [`auth`]; failed requests are written to the error
//! log and answered with a `{message}` body.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod logs;

#[cfg(test)]
mod tests;

pub use error::{ApiError, Result};
pub use logs::{Fallback, LogSink};

use autotest_core::{AutotestConfig, AutotestError, Broker, SharedStore};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post, put};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Error bodies larger than this are not inspected.
const MAX_ERROR_BODY: usize = 1024 * 1024;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AutotestConfig>,
    pub kv: SharedStore,
    pub broker: Broker,
    pub access_log: LogSink,
    pub error_log: LogSink,
}

impl AppState {
    pub fn new(config: Arc<AutotestConfig>, kv: SharedStore) -> Self {
        let access_log = LogSink::new(config.server.access_log.clone(), Fallback::Stdout);
        let error_log = LogSink::new(config.server.error_log.clone(), Fallback::Stderr);
        Self {
            broker: Broker::new(kv.clone()),
            config,
            kv,
            access_log,
            error_log,
        }
    }
}

pub struct ApiServer {
    state: AppState,
}

impl ApiServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/register", post(handlers::register))
            .route("/reset_credentials", put(handlers::reset_credentials))
            .route("/schema", get(handlers::get_schema))
            .route("/settings", post(handlers::create_settings))
            .route(
                "/settings/{settings_id}",
                get(handlers::get_settings).put(handlers::update_settings),
            )
            .route("/settings/{settings_id}/test", put(handlers::run_tests))
            .route(
                "/settings/{settings_id}/test/{test_id}",
                get(handlers::get_result),
            )
            .route(
                "/settings/{settings_id}/test/{test_id}/feedback/{feedback_id}",
                get(handlers::get_feedback),
            )
            .route(
                "/settings/{settings_id}/tests/status",
                get(handlers::get_statuses),
            )
            .route(
                "/settings/{settings_id}/tests/cancel",
                delete(handlers::cancel_tests),
            )
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                report_errors,
            ))
            .layer(middleware::from_fn(
                |request: Request, next: Next| async move {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    let method = request.method().clone();
                    let uri = request.uri().clone();
                    log::info!("Request {} {} {}", request_id, method, uri);

                    let start = std::time::Instant::now();
                    let response = next.run(request).await;
                    log::info!(
                        "Response {} {} completed in {:?}",
                        request_id,
                        response.status(),
                        start.elapsed()
                    );
                    response
                },
            ))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown_signal` resolves.
    pub async fn serve_with_shutdown<F>(self, shutdown_signal: F) -> std::result::Result<(), AutotestError>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.state.config.server.bind_addr.clone();
        let router = self.build_router();
        let listener = TcpListener::bind(bind_addr.as_str()).await.map_err(|e| {
            AutotestError::ConfigError(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        log::info!("autotest server listening on {}", bind_addr);
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| AutotestError::InternalError(format!("Server error: {}", e)))?;

        log::info!("autotest server shut down gracefully");
        Ok(())
    }
}

/// Log failed requests to the error log and rewrite their body to
/// `{message}`, redacting the caller's api key unless running in debug mode.
async fn report_errors(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let api_key = auth::api_key(request.headers()).map(str::to_string);
    let url = request.uri().clone();
    let response = next.run(request).await;
    let status = response.status();
    if !(status.is_client_error() || status.is_server_error()) {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_ERROR_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("Could not read error body for {}: {}", url, e);
            Default::default()
        }
    };
    let message = serde_json::from_slice::<Value>(&bytes)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(&bytes).trim().to_string());
    let redacted = error::redact(&message, api_key.as_deref());

    let user = api_key
        .as_deref()
        .map(auth::key_label)
        .unwrap_or_else(|| "ERROR: user not found".to_string());
    state
        .error_log
        .append(&format!(
            "{}\n\tuser: {}\n\turl: {}\n\t{} {}\n",
            chrono::Utc::now().to_rfc3339(),
            user,
            url,
            status.as_u16(),
            redacted
        ))
        .await;

    let public = if state.config.server.debug {
        message
    } else if status.is_server_error() {
        "Internal server error".to_string()
    } else {
        redacted
    };
    parts.headers.remove(header::CONTENT_LENGTH);
    parts.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    Response::from_parts(parts, Body::from(json!({ "message": public }).to_string()))
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}
