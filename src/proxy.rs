use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig, PoolError};
use crate::router::Router;
use crate::websocket::{is_websocket_upgrade, WebSocketProxy};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Public listener routing every request by its Host header
pub struct ProxyServer {
    bind_addr: SocketAddr,
    router: Router,
    websocket: WebSocketProxy,
    shutdown_rx: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        router: Router,
        websocket: WebSocketProxy,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(bind_addr, router, websocket, shutdown_rx, PoolConfig::default())
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        router: Router,
        websocket: WebSocketProxy,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(pool_config));
        Self {
            bind_addr,
            router,
            websocket,
            shutdown_rx,
            pool,
        }
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = self.router.clone();
                            let websocket = self.websocket.clone();
                            let pool = Arc::clone(&self.pool);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, router, websocket, pool).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let stats = self.pool.stats();
                        info!(
                            forwarded = stats.forwarded,
                            failed = stats.failed,
                            "Proxy server shutting down"
                        );
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    router: Router,
    websocket: WebSocketProxy,
    pool: Arc<ConnectionPool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = router.clone();
        let websocket = websocket.clone();
        let pool = Arc::clone(&pool);
        async move { handle_request(req, router, websocket, pool, addr).await }
    });

    // HTTP/1.1 connections keep WebSocket upgrades working
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    router: Router,
    websocket: WebSocketProxy,
    pool: Arc<ConnectionPool>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let hostname = match extract_hostname(&req) {
        Some(h) => h,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        }
    };

    if websocket.serves_path(req.uri().path()) && is_websocket_upgrade(&req) {
        debug!(hostname, request_id, "WebSocket upgrade request");
        return Ok(websocket.handle_upgrade(req, &hostname));
    }

    // X-Forwarded-* are overwritten, never appended; this proxy is the first hop
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(hostname, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let backend = match router.resolve(&hostname) {
        Ok(backend) => backend,
        Err(e) => {
            debug!(hostname, request_id, reason = e.message(), "Cannot route request");
            return Ok(json_error_response(e.error_code(), e.message()));
        }
    };

    match pool.send_request(req, backend.port).await {
        Ok(response) => Ok(response),
        Err(PoolError::Timeout(limit)) => {
            warn!(hostname, port = backend.port, timeout_secs = limit.as_secs(), "Request timed out");
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", limit.as_secs()),
            ))
        }
        Err(e) => {
            // Details stay in the log
            error!(hostname, port = backend.port, error = %e, "Failed to proxy request");
            Ok(json_error_response(
                ProxyErrorCode::UpstreamFailed,
                "Failed to proxy request",
            ))
        }
    }
}

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())
        .and_then(|h| {
            let hostname = h.split(':').next()?;

            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }

            // Keeps log lines clean of injected characters
            if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
                return None;
            }

            Some(hostname.to_lowercase())
        })
}
