//! HTTP surface of the storage service
//!
//! | Method | Path                       | Handler                           |
//! |--------|----------------------------|-----------------------------------|
//! | POST   | `/store`                   | [`routes::store_files`]           |
//! | POST   | `/upload/:id`              | [`routes::upload_files`]          |
//! | GET    | `/content/:id?file=`       | [`routes::file_content`]          |
//! | GET    | `/download/:id?file=`      | [`routes::download_file`]         |
//! | GET    | `/download/:id/*path`      | [`routes::download_file_by_path`] |
//! | GET    | `/zip/:id`, `/download-zip/:id` | [`routes::download_zip`]     |
//! | GET    | `/health`                  | [`routes::health`]                |

pub mod error;
pub mod routes;


use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::storage::StorageService;

/// Assemble the router. Upload routes carry the request body cap; every
/// other route only reads query strings.
pub fn app(service: Arc<StorageService>) -> Router {
    let upload_limit = service.config().max_upload_size;

    let uploads = Router::new()
        .route("/store", post(routes::store_files))
        .route("/upload/:id", post(routes::upload_files))
        .layer(DefaultBodyLimit::max(upload_limit));

    Router::new()
        .merge(uploads)
        .route("/content/:id", get(routes::file_content))
        .route("/download/:id", get(routes::download_file))
        .route("/download/:id/*path", get(routes::download_file_by_path))
        .route("/zip/:id", get(routes::download_zip))
        .route("/download-zip/:id", get(routes::download_zip))
        .route("/health", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Serve until Ctrl+C or SIGTERM
pub async fn run(addr: SocketAddr, service: Arc<StorageService>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Storage server listening on {}", listener.local_addr()?);
    tracing::info!("Storage directory: {}", service.config().root.display());

    axum::serve(listener, app(service))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(
                "Failed to set up SIGTERM handler: {:?}. Only Ctrl+C will work for shutdown.",
                e
            );
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Storage server shutting down (Ctrl+C)");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Storage server shutting down (Ctrl+C)");
        }
        _ = sigterm.recv() => {
            tracing::info!("Storage server shutting down (SIGTERM)");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Storage server shutting down (Ctrl+C)");
}
