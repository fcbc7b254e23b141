//! Optional HTTP server exposing `/metrics`, `/health`, and `/`. Started by
//! the host binary; not required by the library's own tests.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::metrics::GridMetricsRegistry;

#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    pub listen_addr: SocketAddr,
    pub metrics_path: String,
}

impl Default for MetricsServerConfig {
    fn default() -> Self {
        Self { listen_addr: "127.0.0.1:9898".parse().unwrap(), metrics_path: "/metrics".to_string() }
    }
}

pub struct MetricsServer {
    config: MetricsServerConfig,
    registry: Arc<GridMetricsRegistry>,
}

impl MetricsServer {
    pub fn new(config: MetricsServerConfig, registry: Arc<GridMetricsRegistry>) -> Self {
        Self { config, registry }
    }

    /// Runs indefinitely, serving metrics on the configured address. Spawn
    /// in a dedicated task.
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await.context("failed to bind metrics server")?;
        info!("grid metrics server listening on http://{}{}", self.config.listen_addr, self.config.metrics_path);

        let registry = self.registry.clone();
        let metrics_path = self.config.metrics_path.clone();

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("failed to accept metrics connection: {}", e);
                    continue;
                }
            };

            let registry = registry.clone();
            let metrics_path = metrics_path.clone();

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let registry = registry.clone();
                    let metrics_path = metrics_path.clone();
                    async move { handle_request(req, registry, metrics_path).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("metrics connection error from {}: {}", remote_addr, err);
                }
            });
        }
    }

    /// Encodes the current metric families once, synchronously — for tests
    /// that don't want to stand up a real listener.
    pub fn serve_metrics_once(&self) -> Result<String> {
        encode_metrics(&self.registry)
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    registry: Arc<GridMetricsRegistry>,
    metrics_path: String,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    debug!("metrics request: {} {}", req.method(), path);

    if path == "/health" || path == "/healthz" {
        return Ok(Response::builder().status(StatusCode::OK).body(Full::new(Bytes::from("OK"))).unwrap());
    }

    if path == metrics_path {
        return match encode_metrics(&registry) {
            Ok(text) => Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4")
                .body(Full::new(Bytes::from(text)))
                .unwrap()),
            Err(e) => {
                error!("failed to encode grid metrics: {}", e);
                Ok(Response::builder().status(StatusCode::INTERNAL_SERVER_ERROR).body(Full::new(Bytes::from(format!("error: {e}")))).unwrap())
            }
        };
    }

    if path == "/" {
        let help = format!("gridkeep metrics\n\nEndpoints:\n  {metrics_path} - Prometheus metrics\n  /health - Health check\n");
        return Ok(Response::builder().status(StatusCode::OK).body(Full::new(Bytes::from(help))).unwrap());
    }

    warn!("unknown metrics endpoint requested: {}", path);
    Ok(Response::builder().status(StatusCode::NOT_FOUND).body(Full::new(Bytes::from("Not Found"))).unwrap())
}

fn encode_metrics(registry: &GridMetricsRegistry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).context("failed to encode metrics")?;
    String::from_utf8(buffer).context("invalid utf-8 in metrics output")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::metrics::GridMetricsRegistry;

    #[test]
    fn serve_metrics_once_produces_prometheus_text() {
        let registry = Arc::new(GridMetricsRegistry::new().unwrap());
        registry.grid().grid_version.set(3);
        let server = MetricsServer::new(MetricsServerConfig::default(), registry);
        let text = server.serve_metrics_once().unwrap();
        assert!(text.contains("gridkeep_grid_version"));
    }
}
