//! Registry HTTP server
//!
//! Binds the listener, serves the router and drains on shutdown. Shared
//! process state (validation cache, trust registry, event bus) is
//! initialized by the caller before the listener accepts connections and
//! torn down after it drains.

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, instrument};

use plugon_common::{PlugonError, Result};

use crate::routes::{create_router, AppState};

/// Serve the API until the shutdown signal fires
#[instrument(level = "info", skip(state))]
pub async fn serve(state: AppState, addr: SocketAddr) -> Result<()> {
    let app = create_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| PlugonError::Config(format!("failed to bind {}: {}", addr, e)))?;
    info!("✅ Plugon registry listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| {
            error!("❌ server error: {}", e);
            PlugonError::Internal(e.to_string())
        })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("❌ failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("🛑 ctrl-c received, draining"),
        _ = terminate => info!("🛑 SIGTERM received, draining"),
    }
}
