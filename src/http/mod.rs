//! HTTP surface.
//!
//! Exposes the book store over JSON:
//!
//! | Route | Method | Success | Failure |
//! |-------|--------|---------|---------|
//! | `/records` | `POST` | 201 `{success, id}` | 400 / 500 `{success, message}` |
//! | `/records` | `GET` | 200 `{success, records}` | 500 `{success, message}` |
//! | `/records/{id}` | `GET` | 200 `{success, record}` | 404 / 500 |
//! | `/health` | `GET` | 200 `{success, status}` | 503 |
//!
//! Any other method on these routes answers 405 with the same envelope.

use crate::config::ServerConfig;
use crate::models::{BookId, NewBook};
use crate::observability::{
    REQUEST_ID_HEADER, RequestContext, current_request_id, scope_request_context,
};
use crate::services::BookStore;
use crate::storage::KeyValueStore;
use crate::{Error, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

/// Shared handler state.
pub struct AppState<S: KeyValueStore> {
    books: Arc<BookStore<S>>,
}

impl<S: KeyValueStore> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            books: Arc::clone(&self.books),
        }
    }
}

/// An [`Error`] rendered as a `{success: false, message}` response.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let request_id = current_request_id().unwrap_or_default();
        let message = match &self.0 {
            Error::OperationFailed { .. } => {
                tracing::error!(%request_id, error = %self.0, "Request failed");
                "Internal server error".to_string()
            },
            Error::StoreUnavailable(_) => {
                tracing::error!(%request_id, error = %self.0, "Store unavailable");
                self.0.to_string()
            },
            Error::Validation { .. } | Error::NotFound(_) => self.0.to_string(),
        };
        failure(status, message)
    }
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "success": false,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Builds the application router.
pub fn router<S: KeyValueStore>(books: Arc<BookStore<S>>, max_body_bytes: usize) -> Router {
    let state = AppState { books };

    Router::new()
        .route(
            "/records",
            get(list_records::<S>)
                .post(create_record::<S>)
                .fallback(method_not_allowed),
        )
        .route(
            "/records/{id}",
            get(get_record::<S>).fallback(method_not_allowed),
        )
        .route("/health", get(health::<S>).fallback(method_not_allowed))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(middleware::from_fn(track_request))
        // Security headers (OWASP recommendations)
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn create_record<S: KeyValueStore>(
    State(state): State<AppState<S>>,
    body: std::result::Result<Json<NewBook>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            let status = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                StatusCode::PAYLOAD_TOO_LARGE
            } else {
                StatusCode::BAD_REQUEST
            };
            tracing::debug!(error = %rejection, "Rejected request body");
            return failure(status, format!("invalid request body: {}", rejection.body_text()));
        },
    };

    match state.books.create(request).await {
        Ok(id) => (
            StatusCode::CREATED,
            Json(json!({
                "success": true,
                "id": id,
            })),
        )
            .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn list_records<S: KeyValueStore>(
    State(state): State<AppState<S>>,
) -> std::result::Result<Response, ApiError> {
    let records = state.books.list().await?;
    Ok(Json(json!({
        "success": true,
        "records": records,
    }))
    .into_response())
}

async fn get_record<S: KeyValueStore>(
    State(state): State<AppState<S>>,
    Path(id): Path<String>,
) -> std::result::Result<Response, ApiError> {
    let record = state.books.get(&BookId::from(id)).await?;
    Ok(Json(json!({
        "success": true,
        "record": record,
    }))
    .into_response())
}

async fn health<S: KeyValueStore>(State(state): State<AppState<S>>) -> Response {
    let manager = state.books.manager();
    match manager.ensure_healthy().await {
        Ok(()) => Json(json!({
            "success": true,
            "status": manager.state().as_str(),
            "backend": manager.store().name(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "success": false,
                "status": manager.state().as_str(),
                "backend": manager.store().name(),
                "message": e.to_string(),
            })),
        )
            .into_response(),
    }
}

async fn method_not_allowed() -> Response {
    failure(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
}

async fn not_found() -> Response {
    failure(StatusCode::NOT_FOUND, "Not found")
}

/// Assigns a request ID, scopes it over the handler, and records metrics.
async fn track_request(request: Request, next: Next) -> Response {
    let context = RequestContext::from_header(
        request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok()),
    );
    let request_id = context.request_id().to_string();
    let method = request.method().to_string();
    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %method,
        path = %request.uri().path()
    );

    let start = Instant::now();
    let mut response = scope_request_context(context, next.run(request))
        .instrument(span)
        .await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    let status = response.status().as_u16().to_string();
    metrics::counter!("http_requests_total", "method" => method.clone(), "status" => status)
        .increment(1);
    metrics::histogram!("http_request_duration_ms", "method" => method)
        .record(start.elapsed().as_secs_f64() * 1000.0);
    response
}

/// Serves the router until `shutdown` resolves.
///
/// In-flight requests are drained before this returns. Closing the store
/// connection is left to the caller.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn serve<S, F>(books: Arc<BookStore<S>>, config: &ServerConfig, shutdown: F) -> Result<()>
where
    S: KeyValueStore,
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(books, config.max_body_bytes);
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::OperationFailed {
            operation: "bind".to_string(),
            cause: format!("{addr}: {e}"),
        })?;

    tracing::info!(%addr, "Starting bookshelf HTTP server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::OperationFailed {
            operation: "serve".to_string(),
            cause: e.to_string(),
        })?;
    tracing::info!("HTTP server stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or on SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
