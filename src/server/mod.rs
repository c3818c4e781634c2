//! Server side of the tunnel: an axum handler that multiplexes many
//! virtual connections, each backed by one real TCP socket to an origin,
//! over a sequence of HTTP POST requests.

mod handler;
mod reaper;
mod registry;

pub use handler::router;
pub use registry::{ConnEntry, Registry};

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;

struct HandlerState {
    registry: Registry,
    sticky_url: Option<String>,
}

/// Owns the connection registry and the idle-connection reaper for one
/// running server instance. Dropping (or explicitly [`ServerHandler::shutdown`]ing)
/// it stops the reaper; in-flight virtual connections are left to the
/// caller to deal with (normally by shutting down the listener too).
pub struct ServerHandler {
    state: Arc<HandlerState>,
    reaper: JoinHandle<()>,
}

impl ServerHandler {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Registry::new();
        let reaper = reaper::spawn(registry.clone(), config.idle_timeout());
        let state = Arc::new(HandlerState {
            registry,
            sticky_url: config.sticky_url,
        });
        Self { state, reaper }
    }

    pub fn router(&self) -> axum::Router {
        handler::router(self.state.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.state.registry.len()
    }

    pub fn shutdown(&self) {
        self.reaper.abort();
    }
}

impl Drop for ServerHandler {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

/// Convenience entry point: builds a [`ServerHandler`] from `config` and
/// serves it on `listener` until the process is interrupted or the
/// listener errors out.
pub async fn serve(listener: TcpListener, config: ServerConfig) -> std::io::Result<()> {
    let handler = ServerHandler::new(config);
    let app = handler.router();
    let result = axum::serve(listener, app).await;
    handler.shutdown();
    result
}
