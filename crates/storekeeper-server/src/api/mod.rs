//! The REST surface: router, middleware, handlers, errors.
//!
//! Base path is `/api`. Rate limiting runs as middleware so handlers stay
//! guard-and-mutate only; the stricter creation limit wraps just the
//! `/stores` collection route and only bites on POST.

pub mod error;
pub mod handlers;
pub mod rate_limit;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::Method;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;

use self::error::ApiError;
use crate::state::SharedState;

/// Builds the full application router.
pub fn router(state: SharedState) -> Router {
    let stores = Router::new()
        .route(
            "/stores",
            get(handlers::list_stores).post(handlers::create_store),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            create_rate_limit,
        ));

    let api = Router::new()
        .merge(stores)
        .route("/health", get(handlers::health))
        .route(
            "/stores/:id",
            get(handlers::get_store).delete(handlers::delete_store),
        )
        .route("/stores/:id/retry", post(handlers::retry_store))
        .route("/stores/:id/audit", get(handlers::store_audit))
        .route("/audit", get(handlers::list_audit))
        .route("/metrics", get(handlers::metrics))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            general_rate_limit,
        ))
        .layer(middleware::from_fn(log_requests));

    Router::new()
        .nest("/api", api)
        .fallback(fallback)
        .with_state(state)
}

/// Envelope-shaped 404 for unknown routes.
async fn fallback() -> ApiError {
    ApiError::route_not_found()
}

/// General per-IP limit over every API request. Failed requests hand
/// their slot back so they do not consume quota.
async fn general_rate_limit(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let ip = addr.ip();
    if state.general_limiter.check(ip).is_err() {
        return ApiError::rate_limited().into_response();
    }
    let response = next.run(request).await;
    if response.status().is_client_error() || response.status().is_server_error() {
        state.general_limiter.forget_one(ip);
    }
    response
}

/// Stricter limit on store creation. Pass-through for anything but POST.
async fn create_rate_limit(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::POST {
        return next.run(request).await;
    }
    let ip = addr.ip();
    if state.create_limiter.check(ip).is_err() {
        return ApiError::rate_limited().into_response();
    }
    let response = next.run(request).await;
    if response.status().is_client_error() || response.status().is_server_error() {
        state.create_limiter.forget_one(ip);
    }
    response
}

/// One structured log line per request.
async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    tracing::info!(
        method = %method,
        path,
        status = response.status().as_u16(),
        "request handled"
    );
    response
}
