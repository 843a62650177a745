//! ---
//! cc_section: "05-networking-external-interfaces"
//! cc_subsection: "module"
//! cc_type: "source"
//! cc_scope: "code"
//! cc_description: "REST request surface for experiment lifecycle operations."
//! cc_version: "v0.1.0"
//! cc_owner: "tbd"
//! ---

mod error;
mod handlers;

use std::fmt;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::{MatchedPath, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chaoscraft_common::VersionInfo;
use chaoscraft_core::LifecycleEngine;
use chaoscraft_metrics::{HttpMetrics, SharedRegistry};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub use error::ApiError;
pub use handlers::{IDEMPOTENCY_KEY_HEADER, MAX_LIST_LIMIT, REPLAYED_HEADER};

/// Shared API state exposed to handlers.
pub struct ApiState {
    engine: Arc<LifecycleEngine>,
    version: VersionInfo,
    registry: Option<SharedRegistry>,
    http_metrics: Option<HttpMetrics>,
}

impl ApiState {
    pub fn new(engine: Arc<LifecycleEngine>, version: VersionInfo) -> Self {
        Self {
            engine,
            version,
            registry: None,
            http_metrics: None,
        }
    }

    /// Expose `registry` at `/metrics` and record request metrics into it.
    pub fn with_metrics(mut self, registry: SharedRegistry) -> Result<Self> {
        let http_metrics = HttpMetrics::new(registry.clone())
            .context("failed to register http request metrics")?;
        self.registry = Some(registry);
        self.http_metrics = Some(http_metrics);
        Ok(self)
    }
}

impl fmt::Debug for ApiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiState")
            .field("version", &self.version)
            .field("metrics", &self.registry.is_some())
            .finish_non_exhaustive()
    }
}

async fn track_requests(State(state): State<Arc<ApiState>>, request: Request, next: Next) -> Response {
    let Some(metrics) = state.http_metrics.clone() else {
        return next.run(request).await;
    };
    let method = request.method().as_str().to_owned();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let started = Instant::now();
    let response = next.run(request).await;
    metrics.observe(&method, &path, response.status().as_u16(), started.elapsed());
    response
}

/// Answer with a JSON `timeout` error once `deadline` passes. Dropping the
/// handler future does not cancel a detached start or stop.
async fn enforce_deadline(
    State(deadline): State<Duration>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    match tokio::time::timeout(deadline, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(%method, %uri, deadline_ms = deadline.as_millis() as u64, "request deadline exceeded");
            ApiError::timeout(deadline).into_response()
        }
    }
}

/// Build the router serving every endpoint of the control plane.
pub fn router(state: Arc<ApiState>, request_timeout: Duration) -> Router {
    Router::new()
        .route(
            "/api/v1/experiments",
            get(handlers::list_experiments).post(handlers::create_experiment),
        )
        .route(
            "/api/v1/experiments/:id",
            get(handlers::get_experiment).delete(handlers::delete_experiment),
        )
        .route("/api/v1/experiments/:id/start", post(handlers::start_experiment))
        .route("/api/v1/experiments/:id/stop", post(handlers::stop_experiment))
        .route("/api/v1/version", get(handlers::get_version))
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/metrics", get(handlers::metrics))
        .layer(middleware::from_fn_with_state(request_timeout, enforce_deadline))
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Handle to the running API server.
#[derive(Debug)]
pub struct ApiServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ApiServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections, drain in-flight requests and wait for exit.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        }
    }
}

/// Bind `addr` and serve the API until [`ApiServer::shutdown`] is called.
pub fn spawn_api_server(
    state: Arc<ApiState>,
    addr: SocketAddr,
    request_timeout: Duration,
) -> Result<ApiServer> {
    let router = router(state, request_timeout);

    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind API listener {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure API listener as non-blocking")?;
    let addr = listener
        .local_addr()
        .context("failed to read API listener address")?;
    let tcp_listener =
        TcpListener::from_std(listener).context("failed to create tokio listener")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        info!(address = %addr, "api server listening");
        if let Err(err) = axum::serve(tcp_listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            error!(address = %addr, error = %err, "api server exited with error");
            return Err(err.into());
        }
        Ok(())
    });

    Ok(ApiServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}
