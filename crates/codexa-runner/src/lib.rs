//! Codexa workspace runner.
//!
//! Serves one workspace container: a WebSocket per client session carrying
//! filesystem operations, an interactive terminal and dev-server port controls,
//! plus a `/health` endpoint for the provisioner.

pub mod api;
pub mod config;
pub mod observability;
pub mod ports;
pub mod session;
pub mod terminal;

use std::future::Future;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use api::{AppState, create_router};
pub use config::AppConfig;

/// Serve the API on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let sweeper = state.spawn_idle_sweeper(cancel.clone());
    let app = create_router(state);

    if let Ok(addr) = listener.local_addr() {
        info!("Listening on {}", addr);
    }
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    cancel.cancel();
    let _ = sweeper.await;
    result
}
