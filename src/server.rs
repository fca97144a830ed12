//! HTTP surface
//!
//! One hyper server routing requests to the registered handlers: the
//! index page, the configuration dump, per-command pages and their chart
//! SVGs, plus the daemon's own `/metrics` endpoint.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::error::{MadError, Result};
use crate::handler::{text_response, Registry};
use crate::metrics::DaemonMetrics;

/// Bind the address and serve the registry until the shutdown signal
/// fires
pub async fn serve(
    addr: SocketAddr,
    registry: Arc<Registry>,
    metrics: Arc<DaemonMetrics>,
    shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = std::net::TcpListener::bind(addr).map_err(MadError::Io)?;
    serve_from(listener, registry, metrics, shutdown).await
}

/// Serve the registry on an already-bound listener until the shutdown
/// signal fires
pub async fn serve_from(
    listener: std::net::TcpListener,
    registry: Arc<Registry>,
    metrics: Arc<DaemonMetrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = listener.local_addr().map_err(MadError::Io)?;
    listener.set_nonblocking(true).map_err(MadError::Io)?;

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        let metrics = metrics.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle(req, registry.clone(), metrics.clone())
            }))
        }
    });

    let server = Server::from_tcp(listener).map_err(MadError::Http)?.serve(make_svc);
    info!(addr = %addr, "HTTP server listening");

    server
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            info!("HTTP server shutting down");
        })
        .await
        .map_err(MadError::Http)
}

/// Route one request through the registry
pub(crate) async fn handle(
    req: Request<Body>,
    registry: Arc<Registry>,
    metrics: Arc<DaemonMetrics>,
) -> std::result::Result<Response<Body>, Infallible> {
    let path = req.uri().path().to_string();

    if path == "/metrics" {
        return Ok(match metrics.gather() {
            Ok(text) => Response::builder()
                .status(200)
                .header("Content-Type", "text/plain; version=0.0.4")
                .body(Body::from(text))
                .unwrap(),
            Err(e) => text_response(500, &format!("metrics encoding failed: {}", e)),
        });
    }

    let Some((handler, sub)) = registry.route(&path) else {
        return Ok(text_response(404, "not found"));
    };
    metrics.record_http_request(handler.path());

    match handler.serve(&sub).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(path = %path, error = %e, "Request handling failed");
            Ok(text_response(500, &format!("internal error: {}", e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::handler::{html_response, Handler, RootHandler};
    use async_trait::async_trait;
    use std::time::Duration;

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        fn name(&self) -> &str {
            "Echo"
        }
        fn path(&self) -> &str {
            "/echo"
        }
        fn poll_interval(&self) -> Option<Duration> {
            None
        }
        async fn execute(&self) -> Result<usize> {
            Ok(0)
        }
        async fn serve(&self, sub: &str) -> Result<Response<Body>> {
            if sub == "boom" {
                return Err(MadError::Generic("render failed".to_string()));
            }
            Ok(html_response(format!("echo sub={}", sub)))
        }
    }

    fn setup() -> (Arc<Registry>, Arc<DaemonMetrics>) {
        let mut registry = Registry::new();
        registry.register(Arc::new(EchoHandler));
        registry.register(Arc::new(RootHandler::new(vec![(
            "/echo".to_string(),
            "Echo".to_string(),
        )])));
        (Arc::new(registry), Arc::new(DaemonMetrics::new().unwrap()))
    }

    async fn get(path: &str) -> Response<Body> {
        let (registry, metrics) = setup();
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        handle(req, registry, metrics).await.unwrap()
    }

    #[tokio::test]
    async fn test_handler_page_and_sub_path() {
        let resp = get("/echo").await;
        assert_eq!(resp.status(), 200);

        let resp = get("/echo/memory/2").await;
        assert_eq!(resp.status(), 200);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(body, "echo sub=memory/2");
    }

    #[tokio::test]
    async fn test_index_served_at_root() {
        let resp = get("/").await;
        assert_eq!(resp.status(), 200);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("Registered Commands"));
        assert!(text.contains("/echo"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (registry, metrics) = setup();

        // Serve one page first so the request counter has a sample
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        handle(req, registry.clone(), metrics.clone()).await.unwrap();

        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = handle(req, registry, metrics).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("mad_http_requests_total"));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_500() {
        let resp = get("/echo/boom").await;
        assert_eq!(resp.status(), 500);
    }
}
