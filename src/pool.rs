//! Pooled HTTP client for forwarding requests to notebook processes
//!
//! Notebook processes listen on loopback; connections to them are kept alive
//! and reused across requests for the same port.

use crate::config::ServerConfig;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Content type assumed when a notebook response does not declare one
const DEFAULT_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("invalid upstream request: {0}")]
    RequestBuild(#[from] hyper::http::Error),

    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),
}

/// Point-in-time forwarding counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub forwarded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    /// Upper bound on one upstream round trip, `None` waits indefinitely
    pub request_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            request_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl From<&ServerConfig> for PoolConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            max_idle_per_host: server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(server.pool_idle_timeout_secs),
            request_timeout: server.request_timeout(),
        }
    }
}

/// Keep-alive client shared by every proxied request
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    config: PoolConfig,
    forwarded: AtomicU64,
    failed: AtomicU64,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            request_timeout = ?config.request_timeout,
            "Connection pool initialized"
        );

        Self {
            client,
            config,
            forwarded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Replay `req` against the notebook listening on `port` and hand back its response
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        port: u16,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let upstream = upstream_request(req, port)?;
        self.forwarded.fetch_add(1, Ordering::Relaxed);

        let sent = self.client.request(upstream);
        let result = match self.config.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, sent).await {
                Ok(result) => result.map_err(PoolError::from),
                Err(_) => Err(PoolError::Timeout(limit)),
            },
            None => sent.await.map_err(PoolError::from),
        };

        match result {
            Ok(response) => Ok(with_default_content_type(response).map(|body| body.boxed())),
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

/// Same method, headers and body, re-targeted at `http://127.0.0.1:<port><path>?<query>`
fn upstream_request<B>(req: Request<B>, port: u16) -> Result<Request<B>, PoolError> {
    let (parts, body) = req.into_parts();
    let target = backend_uri(port, parts.uri.path_and_query().map(|pq| pq.as_str()));

    let mut builder = Request::builder().method(parts.method).uri(target);
    if let Some(headers) = builder.headers_mut() {
        *headers = parts.headers;
    }
    Ok(builder.body(body)?)
}

fn with_default_content_type<B>(mut response: Response<B>) -> Response<B> {
    response
        .headers_mut()
        .entry(CONTENT_TYPE)
        .or_insert(HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    response
}

fn backend_uri(port: u16, path_and_query: Option<&str>) -> String {
    format!("http://127.0.0.1:{}{}", port, path_and_query.unwrap_or("/"))
}
