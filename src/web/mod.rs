//! Web service layer

mod handlers;
mod websocket;

pub use handlers::*;
pub use websocket::*;

use crate::config::Config;
use crate::session::SessionRegistry;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Debug, Clone, Copy, Default)]
pub struct WebServerRunOptions {
    pub port_retry: u16,
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub config: Arc<Config>,
}

pub struct WebServer {
    registry: Arc<SessionRegistry>,
    config: Arc<Config>,
}

impl WebServer {
    pub fn new(registry: Arc<SessionRegistry>, config: Arc<Config>) -> Self {
        Self { registry, config }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        self.run_with_options(WebServerRunOptions::default()).await
    }

    pub async fn run_with_options(&self, options: WebServerRunOptions) -> anyhow::Result<()> {
        let host: IpAddr = self.config.server.host.parse()?;
        let listener = bind_listener(host, self.config.server.port, options.port_retry).await?;

        // Port may differ if the configured port was 0 (ephemeral) or due to retry.
        let server_port = listener.local_addr()?.port();
        tracing::info!("Web server bound to {}", listener.local_addr()?);
        tracing::info!(
            "WebSocket endpoint: ws://{}/ws",
            ui_addr_for_bind(host, server_port)
        );

        let app = router(AppState {
            registry: self.registry.clone(),
            config: self.config.clone(),
        });

        axum::serve(listener, app).await?;

        Ok(())
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(api_health))
        .route("/api/sessions", get(api_list_sessions))
        .route("/api/sessions/:id/output", get(api_get_output))
        .route("/api/sessions/:id/save", post(api_save_output))
        .route("/api/sessions/:id/kill", post(api_kill_session))
        .route("/api/sessions/:id/multiplexer", get(api_multiplexer_exists))
        .route("/api/sessions/:id/status", get(api_session_status))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn bind_listener(
    host: IpAddr,
    base_port: u16,
    port_retry: u16,
) -> anyhow::Result<tokio::net::TcpListener> {
    let bind_port_once = base_port == 0 || port_retry == 0;
    if bind_port_once {
        let addr = SocketAddr::new(host, base_port);
        return Ok(tokio::net::TcpListener::bind(addr).await?);
    }

    let mut retries_left = port_retry;
    let mut port = base_port;
    loop {
        let addr = SocketAddr::new(host, port);
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && retries_left > 0 => {
                if port == u16::MAX {
                    return Err(anyhow::anyhow!(
                        "Port {} is in use and cannot retry past u16::MAX",
                        port
                    ));
                }
                let next_port = port + 1;
                tracing::warn!("Port {} is in use, trying {}", port, next_port);
                port = next_port;
                retries_left -= 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn ui_addr_for_bind(bind_host: IpAddr, port: u16) -> SocketAddr {
    match bind_host {
        IpAddr::V4(v4) if v4.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
        }
        IpAddr::V6(v6) if v6.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port)
        }
        _ => SocketAddr::new(bind_host, port),
    }
}
