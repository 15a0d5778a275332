//! WebSocket termination and relay
//!
//! The edge handshake is answered here (hostname, path, query, headers and cookies
//! are captured before the connection is upgraded). Each session then resolves the
//! hostname, dials `ws://127.0.0.1:<port><path>[?<query>]` and relays data frames
//! both ways until one side goes away.

use crate::config::WebSocketConfig;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::router::{RouteError, Router};
use futures::{FutureExt, SinkExt, StreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{
    HeaderMap, HeaderValue, CONNECTION, COOKIE, ORIGIN, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::borrow::Cow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Request details captured at upgrade time
#[derive(Debug, Clone)]
pub struct UpgradeContext {
    pub hostname: String,
    pub path: String,
    pub raw_query: Option<String>,
    pub headers: HeaderMap,
    pub cookies: Vec<HeaderValue>,
    /// Subprotocol agreed with the client, if any
    pub subprotocol: Option<String>,
}

impl UpgradeContext {
    pub fn from_request<B>(req: &Request<B>, hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            path: req.uri().path().to_string(),
            raw_query: req.uri().query().map(str::to_string),
            headers: req.headers().clone(),
            cookies: req.headers().get_all(COOKIE).iter().cloned().collect(),
            subprotocol: None,
        }
    }

    /// Backend endpoint for this session
    pub fn backend_url(&self, port: u16) -> String {
        match self.raw_query.as_deref() {
            Some(query) if !query.is_empty() => {
                format!("ws://127.0.0.1:{}{}?{}", port, self.path, query)
            }
            _ => format!("ws://127.0.0.1:{}{}", port, self.path),
        }
    }
}

/// Check for `Connection: upgrade` plus `Upgrade: websocket`
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")));

    let upgrade_websocket = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    connection_upgrade && upgrade_websocket
}

/// First supported subprotocol the client also offered
pub fn negotiate_subprotocol(headers: &HeaderMap, supported: &[String]) -> Option<String> {
    let offered: Vec<&str> = headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    supported
        .iter()
        .find(|s| offered.iter().any(|o| o == s))
        .cloned()
}

/// Close code sent when a hostname cannot be routed
pub fn close_code_for(err: &RouteError) -> CloseCode {
    match err {
        RouteError::UnknownHost => CloseCode::Normal,
        RouteError::PortUnavailable { .. } => CloseCode::Error,
        RouteError::NotRunning { .. } => CloseCode::Again,
    }
}

/// Accepts upgrades at the edge and runs relay sessions
#[derive(Clone)]
pub struct WebSocketProxy {
    router: Router,
    config: Arc<WebSocketConfig>,
    connect_timeout: Duration,
}

impl WebSocketProxy {
    pub fn new(router: Router, config: WebSocketConfig, connect_timeout: Duration) -> Self {
        Self {
            router,
            config: Arc::new(config),
            connect_timeout,
        }
    }

    /// Whether `path` is where upgrades are accepted
    pub fn serves_path(&self, path: &str) -> bool {
        path == self.config.path
    }

    /// Answer the handshake and spawn the session on the upgraded connection
    pub fn handle_upgrade<B>(&self, req: Request<B>, hostname: &str) -> Response<BoxBody<Bytes, hyper::Error>>
    where
        B: Send + 'static,
    {
        let version_ok = req
            .headers()
            .get(SEC_WEBSOCKET_VERSION)
            .map(|v| v.as_bytes() == b"13")
            .unwrap_or(false);
        if !version_ok {
            return json_error_response(ProxyErrorCode::InvalidUpgrade, "Unsupported WebSocket version");
        }

        let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY) else {
            return json_error_response(ProxyErrorCode::InvalidUpgrade, "Missing Sec-WebSocket-Key");
        };
        let accept = derive_accept_key(key.as_bytes());

        let origin = req.headers().get(ORIGIN).and_then(|v| v.to_str().ok());
        if !self.config.origin_allowed(origin) {
            warn!(hostname, origin, "WebSocket origin rejected");
            return json_error_response(ProxyErrorCode::OriginNotAllowed, "Origin not allowed");
        }

        let mut ctx = UpgradeContext::from_request(&req, hostname);
        ctx.subprotocol = negotiate_subprotocol(req.headers(), &self.config.subprotocols);

        let mut response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_ACCEPT, accept);
        if let Some(protocol) = &ctx.subprotocol {
            response = response.header(SEC_WEBSOCKET_PROTOCOL, protocol.as_str());
        }

        let response = match response.body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed()) {
            Ok(response) => response,
            Err(e) => {
                error!(hostname, error = %e, "Failed to build upgrade response");
                return json_error_response(ProxyErrorCode::InternalError, "Internal error");
            }
        };

        debug!(hostname, path = %ctx.path, "Accepting WebSocket upgrade");

        let proxy = self.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let socket =
                        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                    proxy.run_session(socket, ctx).await;
                }
                Err(e) => {
                    error!(hostname = %ctx.hostname, error = %e, "Failed to upgrade client connection");
                }
            }
        });

        response
    }

    /// Run one session; a panic inside it is contained and reported to the client
    async fn run_session<S>(&self, mut client: WebSocketStream<S>, ctx: UpgradeContext)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let outcome = AssertUnwindSafe(self.serve(&mut client, &ctx)).catch_unwind().await;

        if let Err(panic) = outcome {
            let message = panic_message(&panic);
            error!(hostname = %ctx.hostname, panic = %message, "WebSocket session panicked");
            let payload = serde_json::json!({ "error": message }).to_string();
            let _ = client.send(Message::Text(payload)).await;
            let _ = client.close(None).await;
        }
    }

    async fn serve<S>(&self, client: &mut WebSocketStream<S>, ctx: &UpgradeContext)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let backend = match self.router.resolve(&ctx.hostname) {
            Ok(backend) => backend,
            Err(e) => {
                debug!(hostname = %ctx.hostname, reason = e.message(), "Rejecting WebSocket session");
                close_with(client, close_code_for(&e), e.message().to_string()).await;
                return;
            }
        };

        let url = ctx.backend_url(backend.port);
        let mut request = match url.as_str().into_client_request() {
            Ok(request) => request,
            Err(e) => {
                error!(url = %url, error = %e, "Invalid backend WebSocket URL");
                close_with(client, CloseCode::Error, "invalid backend url".to_string()).await;
                return;
            }
        };
        for cookie in &ctx.cookies {
            request.headers_mut().append(COOKIE, cookie.clone());
        }
        if let Some(protocol) = &ctx.subprotocol {
            if let Ok(value) = HeaderValue::from_str(protocol) {
                request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
            }
        }

        let dial = tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request)).await;
        let mut upstream = match dial {
            Ok(Ok((upstream, _))) => upstream,
            Ok(Err(e)) => {
                warn!(url = %url, error = %e, "Failed to dial notebook WebSocket");
                close_with(client, CloseCode::Again, e.to_string()).await;
                return;
            }
            Err(_) => {
                warn!(url = %url, timeout = ?self.connect_timeout, "Timed out dialing notebook WebSocket");
                close_with(client, CloseCode::Again, "backend dial timed out".to_string()).await;
                return;
            }
        };

        info!(hostname = %ctx.hostname, notebook = %backend.notebook_id, url = %url, "WebSocket session established");
        relay(client, &mut upstream).await;
        debug!(hostname = %ctx.hostname, "WebSocket session closed");
    }
}

/// Copy data frames both ways. When one side closes or errors, the other side
/// gets a normal closure.
pub async fn relay<A, B>(client: &mut WebSocketStream<A>, upstream: &mut WebSocketStream<B>)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    enum Ended {
        Client,
        Upstream,
    }

    let ended = loop {
        tokio::select! {
            msg = client.next() => match msg {
                Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                    if upstream.send(msg).await.is_err() {
                        break Ended::Upstream;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break Ended::Client,
                Some(Ok(_)) => {}
            },
            msg = upstream.next() => match msg {
                Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                    if client.send(msg).await.is_err() {
                        break Ended::Client;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break Ended::Upstream,
                Some(Ok(_)) => {}
            },
        }
    };

    match ended {
        Ended::Client => {
            close_with(upstream, CloseCode::Normal, String::new()).await;
            let _ = client.close(None).await;
        }
        Ended::Upstream => {
            close_with(client, CloseCode::Normal, String::new()).await;
            let _ = upstream.close(None).await;
        }
    }
}

async fn close_with<S>(socket: &mut WebSocketStream<S>, code: CloseCode, reason: String)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: Cow::Owned(reason),
    };
    if let Err(e) = socket.close(Some(frame)).await {
        debug!(error = %e, "Close frame not delivered");
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "internal error".to_string()
    }
}
