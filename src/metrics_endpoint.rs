//! Metrics HTTP Endpoint
//!
//! Serves the relay's Prometheus registry on a separate address so that
//! scrapes never compete with image traffic.

use crate::metrics::RelayMetrics;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Metrics endpoint server
pub struct MetricsEndpoint {
    metrics: RelayMetrics,
    addr: SocketAddr,
}

impl MetricsEndpoint {
    /// Create a new metrics endpoint
    ///
    /// # Arguments
    /// * `metrics` - Shared metrics collector
    /// * `addr` - Address to bind the HTTP server to
    ///
    /// # Example
    /// ```no_run
    /// use pixrelay::metrics::RelayMetrics;
    /// use pixrelay::metrics_endpoint::MetricsEndpoint;
    ///
    /// let metrics = RelayMetrics::new().unwrap();
    /// let endpoint = MetricsEndpoint::new(metrics, "127.0.0.1:9090".parse().unwrap());
    /// ```
    pub fn new(metrics: RelayMetrics, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    /// Start the metrics endpoint server
    ///
    /// Serves `/metrics` and `/health` until `shutdown` is cancelled.
    pub async fn start(
        self,
        shutdown: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Metrics endpoint listening on http://{}", self.addr);
        info!("Metrics available at http://{}/metrics", self.addr);

        loop {
            let (stream, _) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.cancelled() => return Ok(()),
            };
            let io = TokioIo::new(stream);
            let metrics = self.metrics.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let metrics = metrics.clone();
                    async move { Ok::<_, Infallible>(handle_request(req, &metrics)) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving connection: {:?}", err);
                }
            });
        }
    }
}

/// Handle incoming HTTP requests
pub fn handle_request<B>(req: Request<B>, metrics: &RelayMetrics) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/metrics" => metrics_response(metrics),
        "/health" => health_response(),
        _ => not_found_response(),
    }
}

/// Generate the metrics response in Prometheus format
fn metrics_response(metrics: &RelayMetrics) -> Response<Full<Bytes>> {
    match metrics.encode() {
        Ok(body) => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            Bytes::from(body),
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                Bytes::from_static(b"failed to encode metrics"),
            )
        }
    }
}

/// Generate health check response
fn health_response() -> Response<Full<Bytes>> {
    text_response(
        StatusCode::OK,
        "application/json",
        Bytes::from_static(br#"{"status":"healthy"}"#),
    )
}

/// Generate 404 response
fn not_found_response() -> Response<Full<Bytes>> {
    text_response(
        StatusCode::NOT_FOUND,
        "text/plain",
        Bytes::from_static(b"404 Not Found"),
    )
}

fn text_response(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static(content_type),
    );
    response
}
