//! `ParleyServer`: Axum HTTP + `WebSocket` host for the broker.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use parley_broker::Broker;
use parley_core::errors::ParleyError;
use parley_resilience::{ErrorContext, RetryOptions};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::health;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::run_ws_session;

/// Retries spent on binding the listener.
const BIND_RETRIES: u32 = 2;

/// Errors starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Last bind failure.
        #[source]
        source: ParleyError,
    },
    /// The bound listener has no local address.
    #[error("listener address unavailable: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The broker peers are attached to.
    pub broker: Arc<Broker>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Host configuration.
    pub config: Arc<ServerConfig>,
    /// Prometheus handle for `/metrics`.
    pub metrics: Option<PrometheusHandle>,
}

/// The parley server.
pub struct ParleyServer {
    config: Arc<ServerConfig>,
    broker: Arc<Broker>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
}

impl ParleyServer {
    /// Create a new server around `broker`.
    pub fn new(config: ServerConfig, broker: Arc<Broker>) -> Self {
        Self {
            config: Arc::new(config),
            broker,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics: None,
        }
    }

    /// Serve `/metrics` from `handle` when diagnostics are enabled.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            broker: self.broker.clone(),
            shutdown: self.shutdown.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
        };

        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler));
        if self.config.diagnostics_enabled {
            router = router.route("/metrics", get(metrics_handler));
        }
        let router = router.with_state(state).layer(TraceLayer::new_for_http());
        match self.config.cors_layer() {
            Some(cors) => router.layer(cors),
            None => router,
        }
    }

    /// Bind, start the broker's background loops and serve until shutdown.
    ///
    /// Returns the bound address and a handle that completes once the server
    /// has stopped and the broker has been drained (see [`ShutdownCoordinator`]).
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let addr = self.config.bind_addr();
        let opts = RetryOptions {
            max_retries: BIND_RETRIES,
            context: ErrorContext::new("server"),
        };
        let listener = self
            .broker
            .resilience()
            .with_retry("server.bind", opts, || {
                let addr = addr.clone();
                async move {
                    TcpListener::bind(&addr)
                        .await
                        .map_err(|e| ParleyError::connection(format!("bind {addr}: {e}")))
                }
            })
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let background = self.broker.spawn_background(&self.shutdown.token());
        let router = self.router();
        let broker = self.broker.clone();
        let coordinator = self.shutdown.clone();

        info!(%local_addr, "parley server listening");

        let handle = tokio::spawn(async move {
            let stop = coordinator.clone();
            let closing = broker.clone();
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    stop.token().cancelled().await;
                    // Upgraded sockets are not tracked by the listener; closing
                    // the broker sends each of them a close frame.
                    let _ = stop.close_broker(&closing);
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "server error");
            }
            let report = coordinator.drain(&broker, background).await;
            info!(
                sessions_closed = report.sessions_closed,
                timed_out = report.timed_out,
                "parley server stopped"
            );
        });

        Ok((local_addr, handle))
    }

    /// Get the broker.
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl std::fmt::Debug for ParleyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParleyServer")
            .field("config", &self.config)
            .field("shutting_down", &self.shutdown.is_shutting_down())
            .finish_non_exhaustive()
    }
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let queue_capacity = state.broker.settings().queue_capacity;
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, state.broker, queue_capacity))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let resp = health::health_check(state.broker.snapshot(), state.config.diagnostics_enabled);
    (resp.http_status(), Json(resp))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
