//! Per-request backend resolution
//!
//! Routing keeps no table of its own: every request asks the registry for the
//! notebook owning the hostname and the runner for that notebook's port and status.

use crate::error::{HubError, ProxyErrorCode};
use crate::notebook::{Notebook, Status};
use crate::registry::Registry;
use crate::runner::Runner;
use std::sync::Arc;

/// Looks up notebooks by routing domain
pub trait NotebookDirectory: Send + Sync {
    fn notebook_for_domain(&self, domain: &str) -> Option<Notebook>;
}

/// Looks up where a notebook's process listens and whether it is up
pub trait BackendDirectory: Send + Sync {
    fn port(&self, id: &str) -> Option<u16>;
    fn status(&self, id: &str) -> Result<Status, HubError>;
}

impl NotebookDirectory for Registry {
    fn notebook_for_domain(&self, domain: &str) -> Option<Notebook> {
        self.get_by_domain(domain)
    }
}

impl BackendDirectory for Runner {
    fn port(&self, id: &str) -> Option<u16> {
        self.get_port(id)
    }

    fn status(&self, id: &str) -> Result<Status, HubError> {
        self.get_status(id)
    }
}

/// Where a request for a hostname should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub notebook_id: String,
    pub port: u16,
}

/// Why a hostname could not be routed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// No notebook owns the hostname
    UnknownHost,
    /// Notebook exists but has no port assigned
    PortUnavailable { notebook_id: String },
    /// Notebook has a port but its process is not `Running`
    NotRunning { notebook_id: String, status: Option<Status> },
}

impl RouteError {
    pub fn error_code(&self) -> ProxyErrorCode {
        match self {
            RouteError::UnknownHost => ProxyErrorCode::UnknownHost,
            RouteError::PortUnavailable { .. } => ProxyErrorCode::PortUnavailable,
            RouteError::NotRunning { .. } => ProxyErrorCode::NotebookNotRunning,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            RouteError::UnknownHost => "Notebook not found for this domain",
            RouteError::PortUnavailable { .. } => "Notebook port not available",
            RouteError::NotRunning { .. } => "Notebook not running",
        }
    }
}

/// Resolves hostnames to running notebook backends
#[derive(Clone)]
pub struct Router {
    notebooks: Arc<dyn NotebookDirectory>,
    backends: Arc<dyn BackendDirectory>,
}

impl Router {
    pub fn new(notebooks: Arc<dyn NotebookDirectory>, backends: Arc<dyn BackendDirectory>) -> Self {
        Self { notebooks, backends }
    }

    pub fn resolve(&self, hostname: &str) -> Result<Backend, RouteError> {
        let notebook = self
            .notebooks
            .notebook_for_domain(hostname)
            .ok_or(RouteError::UnknownHost)?;

        let port = self
            .backends
            .port(&notebook.id)
            .ok_or_else(|| RouteError::PortUnavailable {
                notebook_id: notebook.id.clone(),
            })?;

        match self.backends.status(&notebook.id) {
            Ok(Status::Running) => Ok(Backend {
                notebook_id: notebook.id,
                port,
            }),
            status => Err(RouteError::NotRunning {
                notebook_id: notebook.id,
                status: status.ok(),
            }),
        }
    }
}
