//! HTTP API server.
//!
//! A thin adapter over the key manager: JSON in and out, error kinds
//! mapped to wire codes. Handlers offload onto the blocking pool because
//! most operations run the Argon2id KDF.

pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::keymgr::KeyMgr;
use crate::store::Store;

/// Shared application state available to all handlers.
pub struct AppState<S> {
    pub keymgr: Arc<KeyMgr<S>>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            keymgr: self.keymgr.clone(),
        }
    }
}

/// Build the router with all routes and middleware.
pub fn build_app<S: Store + 'static>(state: AppState<S>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    routes::api_routes()
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Serve until the shutdown token fires.
pub async fn serve<S: Store + 'static>(
    state: AppState<S>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
