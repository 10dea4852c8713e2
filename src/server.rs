//! HTTP front end for the relay
//!
//! One task per connection, one [`RequestContext`] per request. When a client
//! disconnects, hyper drops the request future, which ends that request's
//! wait on any shared load without touching the load itself.

use crate::context::RequestContext;
use crate::models::Params;
use crate::proxy::RelayProxy;
use crate::response::{
    error_response, method_not_allowed_response, service_info_response, shape_response,
};
use bytes::Bytes;
use http::{Method, Request, Response};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

/// Image server bound to a listener
pub struct RelayServer {
    proxy: Arc<RelayProxy>,
    listener: TcpListener,
}

impl RelayServer {
    /// Bind the server to `addr`
    pub async fn bind(proxy: Arc<RelayProxy>, addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(RelayServer { proxy, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` is cancelled
    pub async fn serve(self, shutdown: CancellationToken) -> std::io::Result<()> {
        info!("Image server listening on http://{}", self.local_addr()?);

        loop {
            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => accepted?,
                _ = shutdown.cancelled() => {
                    info!("Image server stopped accepting connections");
                    return Ok(());
                }
            };
            let io = TokioIo::new(stream);
            let proxy = Arc::clone(&self.proxy);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let proxy = Arc::clone(&proxy);
                    async move { Ok::<_, Infallible>(handle_request(req, proxy).await) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(peer = %peer, "Error serving connection: {:?}", err);
                }
            });
        }
    }
}

/// Route one request
///
/// `GET /` returns the service descriptor; any other `GET` path is parsed as
/// an image request. Other methods get 405.
pub async fn handle_request<B>(req: Request<B>, proxy: Arc<RelayProxy>) -> Response<Full<Bytes>> {
    let started = Instant::now();
    let ctx = RequestContext::new();
    let span = info_span!("request", id = ctx.request_id());
    let is_get = req.method() == Method::GET;
    let path = req.uri().path().to_string();
    drop(req);

    let response = async {
        if !is_get {
            return method_not_allowed_response();
        }
        if path == "/" {
            return service_info_response();
        }

        let params = match Params::parse(&path) {
            Ok(params) => params,
            Err(e) => {
                debug!(path = %path, error = %e, "rejecting request");
                return error_response(&e);
            }
        };

        let outcome = proxy.handle(&ctx, &params).await;
        if let Some(ref err) = outcome.err {
            if err.is_cancellation() {
                debug!(image = %params.image, error = %err, "request interrupted");
            } else if err.to_http_status() >= 500 {
                error!(image = %params.image, error = %err, "request failed");
            }
        }
        shape_response(&params, outcome)
    }
    .instrument(span)
    .await;

    if let Some(metrics) = proxy.metrics() {
        metrics.record_request(response.status().as_u16(), started.elapsed());
    }
    response
}
