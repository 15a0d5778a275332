//! Error taxonomy for the registry and runner, and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Errors surfaced by synchronous registry and runner operations
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// A required field is missing or malformed
    #[error("{0}")]
    Validation(String),

    #[error("domain {0} is already in use")]
    DomainConflict(String),

    #[error("notebook {0} not found")]
    NotFound(String),

    #[error("notebook {0} already running")]
    AlreadyRunning(String),

    #[error("notebook {0} not running")]
    NotRunning(String),

    #[error("failed to start notebook {id}: {source}")]
    ProcessLaunch {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to kill process {pid}: {source}")]
    ProcessKill {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("no free notebook ports left in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl From<anyhow::Error> for HubError {
    fn from(err: anyhow::Error) -> Self {
        HubError::Storage(err)
    }
}

impl HubError {
    /// HTTP status used when this error reaches the management API
    pub fn status_code(&self) -> StatusCode {
        match self {
            HubError::Validation(_) => StatusCode::BAD_REQUEST,
            HubError::DomainConflict(_) => StatusCode::CONFLICT,
            HubError::NotFound(_) => StatusCode::NOT_FOUND,
            HubError::AlreadyRunning(_) | HubError::NotRunning(_) => StatusCode::CONFLICT,
            HubError::ProcessLaunch { .. }
            | HubError::ProcessKill { .. }
            | HubError::PortsExhausted { .. }
            | HubError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Malformed WebSocket upgrade request
    InvalidUpgrade,
    /// WebSocket Origin not in the allowed list
    OriginNotAllowed,
    /// No notebook is registered for the host
    UnknownHost,
    /// Notebook exists but the runner has no port for it
    PortUnavailable,
    /// Notebook process is not in the Running state
    NotebookNotRunning,
    /// Forwarding to the notebook process failed
    UpstreamFailed,
    /// Request timed out waiting for the notebook process
    RequestTimeout,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::InvalidUpgrade => StatusCode::BAD_REQUEST,
            ProxyErrorCode::OriginNotAllowed => StatusCode::FORBIDDEN,
            ProxyErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ProxyErrorCode::PortUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::NotebookNotRunning => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::UpstreamFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::InvalidUpgrade => "INVALID_UPGRADE",
            ProxyErrorCode::OriginNotAllowed => "ORIGIN_NOT_ALLOWED",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::PortUnavailable => "PORT_UNAVAILABLE",
            ProxyErrorCode::NotebookNotRunning => "NOTEBOOK_NOT_RUNNING",
            ProxyErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub error: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            error: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","error":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.error.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
