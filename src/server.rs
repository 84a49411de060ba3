use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use poem::http::StatusCode;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::web::Data;
use poem::{EndpointExt, Response, Route, Server, get, handler};
use prometheus::Registry;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::WebArgs;
use crate::exporter;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state of the metrics route.
pub struct MetricsEndpoint {
    registry: Registry,
    in_flight: Option<Arc<Semaphore>>,
}

impl MetricsEndpoint {
    /// `max_requests == 0` disables the in-flight limit.
    pub fn new(registry: Registry, max_requests: usize) -> Self {
        Self {
            registry,
            in_flight: (max_requests > 0).then(|| Arc::new(Semaphore::new(max_requests))),
        }
    }
}

#[handler]
async fn serve_metrics(Data(endpoint): Data<&Arc<MetricsEndpoint>>) -> Response {
    let _permit = match &endpoint.in_flight {
        Some(limit) => match Arc::clone(limit).try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                warn!("too many concurrent scrapes, rejecting request");
                return Response::builder()
                    .status(StatusCode::SERVICE_UNAVAILABLE)
                    .body("too many concurrent scrape requests");
            }
        },
        None => None,
    };

    let registry = endpoint.registry.clone();
    match tokio::task::spawn_blocking(move || exporter::encode_text(&registry)).await {
        Ok(body) => Response::builder()
            .content_type(prometheus::TEXT_FORMAT)
            .body(body),
        Err(err) => {
            error!(%err, "scrape task failed");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body("scrape failed")
        }
    }
}

pub fn routes(telemetry_path: &str, endpoint: MetricsEndpoint) -> impl poem::Endpoint + use<> {
    Route::new()
        .at(telemetry_path, get(serve_metrics))
        .data(Arc::new(endpoint))
        .with(Tracing)
}

async fn shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(%err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    info!("shutdown requested");
}

/// Serves `registry` until SIGINT or SIGTERM.
pub async fn serve(web: &WebArgs, registry: Registry) -> anyhow::Result<()> {
    let address = web.socket_address();
    let app = routes(&web.telemetry_path, MetricsEndpoint::new(registry, web.max_requests));

    info!(addr = %address, metrics_path = %web.telemetry_path, "starting exporter");
    Server::new(TcpListener::bind(address.clone()))
        .run_with_graceful_shutdown(app, shutdown_signal(), Some(SHUTDOWN_TIMEOUT))
        .await
        .with_context(|| format!("server error on {address}"))?;

    info!("exporter stopped");
    Ok(())
}
