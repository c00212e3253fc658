//! HTTP server setup and lifecycle.
//!
//! Builds the axum router, binds the listener, and drives graceful
//! shutdown through a cancellation token shared with the rest of the
//! runtime.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::routes;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::job::JobRegistry;
use crate::storage::PartStore;
use crate::stream::OutputStreamer;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Address to bind to
    pub bind_address: String,
    /// Port to listen on
    pub port: u16,
    /// Attach permissive cross-origin headers to every response
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            enable_cors: true,
        }
    }
}

impl From<&ServerConfig> for ApiServerConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            bind_address: config.bind_address.clone(),
            port: config.port,
            enable_cors: config.enable_cors,
        }
    }
}

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server start time for uptime reporting
    pub start_time: Instant,
    /// Job registry holding all tracked jobs
    pub registry: Arc<JobRegistry>,
    /// Path layout for part, manifest, and output files
    pub store: Arc<PartStore>,
    /// Download streamer enforcing per-address and global stream caps
    pub streamer: Arc<OutputStreamer>,
}

impl AppState {
    pub fn new(
        registry: Arc<JobRegistry>,
        store: Arc<PartStore>,
        streamer: Arc<OutputStreamer>,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            registry,
            store,
            streamer,
        }
    }
}

/// The API server.
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    /// Create a new API server with the given configuration and state.
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Get a handle to the cancellation token for graceful shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Build the router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        // The upload handler enforces declared part lengths itself, so the
        // framework's default body cap is disabled rather than duplicated.
        let mut router =
            routes::create_router(self.state.clone()).layer(DefaultBodyLimit::disable());

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            router = router.layer(cors);
        }

        router.layer(TraceLayer::new_for_http())
    }

    /// Run the server until the cancellation token fires.
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| Error::config(format!("invalid bind address: {e}")))?;

        info!("starting API server on {}", addr);
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve requests on an already-bound listener.
    ///
    /// Split out from [`run`](Self::run) so tests can bind an ephemeral
    /// port first. Client addresses are captured per connection for the
    /// ownership checks in the job routes.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("API server listening on {}", addr);
        }

        let router = self.build_router();
        let cancel_token = self.cancel_token.clone();

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            cancel_token.cancelled().await;
            info!("API server shutting down gracefully");
        })
        .await?;

        Ok(())
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        info!("shutting down API server");
        self.cancel_token.cancel();
    }
}
