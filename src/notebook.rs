//! Notebook records and the events published when they change

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted notebook definition.
///
/// `id`, `created_at` are fixed at creation. `domain` is the routing key and is
/// unique across all records held by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notebook {
    pub id: String,
    pub name: String,
    pub path: String,
    pub domain: String,
    #[serde(default)]
    pub show_code: bool,
    #[serde(default)]
    pub watch: bool,
    pub created_at: DateTime<Utc>,
}

/// Create or partial-update request.
///
/// Every field is optional so that an update can distinguish "leave unchanged"
/// (absent) from an explicit value. Empty strings count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotebookRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_code: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch: Option<bool>,
}

impl NotebookRequest {
    /// Request carrying the three fields required for creation
    pub fn new(name: &str, path: &str, domain: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            path: Some(path.to_string()),
            domain: Some(domain.to_string()),
            show_code: None,
            watch: None,
        }
    }

    pub fn with_domain(mut self, domain: &str) -> Self {
        self.domain = Some(domain.to_string());
        self
    }

    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch = Some(watch);
        self
    }

    pub fn with_show_code(mut self, show_code: bool) -> Self {
        self.show_code = Some(show_code);
        self
    }

    pub fn name(&self) -> Option<&str> {
        non_empty(&self.name)
    }

    pub fn path(&self) -> Option<&str> {
        non_empty(&self.path)
    }

    pub fn domain(&self) -> Option<&str> {
        non_empty(&self.domain)
    }

    /// Check field formats. Presence of required fields is checked by the registry.
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();

        if let Some(name) = self.name() {
            if name.chars().count() > MAX_NAME_LEN {
                errors.push(format!("name: must be at most {} characters", MAX_NAME_LEN));
            }
        }

        if let Some(path) = self.path() {
            if path.contains("..") {
                errors.push("path: must not contain '..'".to_string());
            }
        }

        if let Some(domain) = self.domain() {
            if !is_valid_hostname(domain) {
                errors.push("domain: must be a valid hostname".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(format!("validation failed: {}", errors.join("; ")))
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

const MAX_NAME_LEN: usize = 100;

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Form a domain is stored and looked up in; hostnames compare case-insensitively
pub fn canonical_domain(domain: &str) -> String {
    domain.to_ascii_lowercase()
}

/// RFC 1123 hostname check
pub fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return false;
    }

    host.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Kind of mutation published by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryAction {
    #[serde(rename = "add")]
    Added,
    #[serde(rename = "update")]
    Updated,
    #[serde(rename = "delete")]
    Deleted,
}

/// Run status of a notebook process as tracked by the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Handle created, process not started yet
    Pending,
    Running,
    /// Exited cleanly or stopped on purpose
    Stopped,
    /// Failed to launch or exited abnormally
    Error,
    /// Being replaced after a configuration change
    Restarting,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pending => "Pending",
            Status::Running => "Running",
            Status::Stopped => "Stopped",
            Status::Error => "Error",
            Status::Restarting => "Restarting",
        };
        f.write_str(s)
    }
}
