//! API — Axum JSON server over the transfer desk.
//!
//! Exposes excess, transfer-out, batch undo, wagers, caps, rounds and
//! dealer credit. CORS enabled for the dealer back-office frontend.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    routing::{delete, get, post},
    Router,
};
use std::future::Future;
use tower_http::cors::CorsLayer;
use tracing::info;

pub use routes::AppState;

/// Serve the API on `port` until `shutdown` resolves.
pub async fn serve<F>(state: AppState, port: u16, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API port {port}"))?;
    info!(port, "API server listening on http://localhost:{port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;
    Ok(())
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(routes::health))
        // Rounds
        .route("/api/rounds/:round_id", get(routes::get_round).put(routes::put_round))
        .route("/api/rounds/:round_id/excess", get(routes::get_excess))
        .route(
            "/api/rounds/:round_id/caps",
            get(routes::get_caps).put(routes::put_caps),
        )
        .route(
            "/api/rounds/:round_id/wagers",
            get(routes::get_wagers).post(routes::post_wager),
        )
        .route(
            "/api/rounds/:round_id/transfers",
            get(routes::get_transfers).post(routes::post_transfers),
        )
        .route("/api/rounds/:round_id/batches", get(routes::get_batches))
        // Undo / soft delete
        .route("/api/batches/:batch_id", delete(routes::delete_batch))
        .route("/api/wagers/:wager_id", delete(routes::delete_wager))
        // Dealer credit
        .route(
            "/api/dealers/:dealer_id/credit",
            get(routes::get_credit).put(routes::put_credit),
        )
        .route("/api/dealers/:dealer_id/credit/check", get(routes::get_credit_check))
        .route("/api/dealers/:dealer_id/credit/recompute", post(routes::post_recompute))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
