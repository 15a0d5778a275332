use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Global configuration for the hub
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Edge WebSocket policy
    #[serde(default)]
    pub websocket: WebSocketConfig,

    #[serde(default)]
    pub notebooks: NotebooksConfig,

    /// How notebook processes are launched
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Optional shared editor process
    #[serde(default)]
    pub editor: EditorConfig,

    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the API and proxy listeners (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Management API port (default: 8081)
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Public proxy port (default: 80)
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Maximum idle connections per notebook backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Upstream HTTP round-trip timeout in seconds, 0 disables it (default: 60)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for dialing a notebook's WebSocket endpoint (default: 10)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            api_port: default_api_port(),
            proxy_port: default_proxy_port(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebSocketConfig {
    /// Path on which upgrades are accepted (default: /ws)
    #[serde(default = "default_ws_path")]
    pub path: String,

    /// Allowed Origin values, `*` allows any (default: ["*"])
    #[serde(default = "default_origins")]
    pub origins: Vec<String>,

    /// Subprotocols the edge is willing to negotiate
    #[serde(default)]
    pub subprotocols: Vec<String>,
}

impl WebSocketConfig {
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.origins.iter().any(|o| o == "*") {
            return true;
        }
        match origin {
            Some(origin) => self.origins.iter().any(|o| o == origin),
            None => false,
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: default_ws_path(),
            origins: default_origins(),
            subprotocols: Vec::new(),
        }
    }
}

/// Inclusive port range notebooks are assigned from
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Parse the `start-end` form used by `NOTEBOOK_PORT_RANGE`
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| anyhow::anyhow!("port range must be in format 'start-end'"))?;
        let start = start
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid start port: {}", e))?;
        let end = end
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid end port: {}", e))?;
        Ok(Self { start, end })
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 3000,
            end: 4000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotebooksConfig {
    /// Root directory notebooks are stored under (default: /notebooks)
    #[serde(default = "default_notebooks_path")]
    pub path: String,

    #[serde(default)]
    pub port_range: PortRange,
}

impl Default for NotebooksConfig {
    fn default() -> Self {
        Self {
            path: default_notebooks_path(),
            port_range: PortRange::default(),
        }
    }
}

/// Command line used to launch one notebook process
///
/// The process is started as
/// `<program> <args..> <notebook path> --port <port> --host <host> --headless --no-token`
/// with `--watch` and `--include-code` appended when the notebook asks for them.
#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    #[serde(default = "default_runner_program")]
    pub program: String,

    #[serde(default = "default_runner_args")]
    pub args: Vec<String>,

    /// Address notebook processes bind to (default: 127.0.0.1)
    #[serde(default = "default_runner_host")]
    pub host: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: default_runner_program(),
            args: default_runner_args(),
            host: default_runner_host(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EditorConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_editor_port")]
    pub port: u16,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_editor_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8081
}

fn default_proxy_port() -> u16 {
    80
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_notebooks_path() -> String {
    "/notebooks".to_string()
}

fn default_runner_program() -> String {
    "marimo".to_string()
}

fn default_runner_args() -> Vec<String> {
    vec!["run".to_string()]
}

fn default_runner_host() -> String {
    "127.0.0.1".to_string()
}

fn default_editor_port() -> u16 {
    8080
}

fn default_database_path() -> String {
    "/data/notebook-hub.db".to_string()
}

impl Config {
    /// Load the config file (all defaults when it does not exist), apply
    /// environment overrides and validate the result.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config: Config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            info!(path = %path.display(), "Config file not found, using defaults");
            Config::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `API_PORT`, `PROXY_PORT`, `MARIMO_PORT`, `NOTEBOOKS_PATH`,
    /// `NOTEBOOK_PORT_RANGE` and `DB_PATH` overrides.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = |key: &str, value: String| -> anyhow::Result<u16> {
            value
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("failed to parse environment variable {}: {}", key, e))
        };

        if let Some(v) = lookup("API_PORT") {
            self.server.api_port = port("API_PORT", v)?;
        }
        if let Some(v) = lookup("PROXY_PORT") {
            self.server.proxy_port = port("PROXY_PORT", v)?;
        }
        if let Some(v) = lookup("MARIMO_PORT") {
            self.editor.port = port("MARIMO_PORT", v)?;
        }
        if let Some(v) = lookup("NOTEBOOKS_PATH") {
            self.notebooks.path = v;
        }
        if let Some(v) = lookup("NOTEBOOK_PORT_RANGE") {
            self.notebooks.port_range = PortRange::parse(&v)
                .map_err(|e| anyhow::anyhow!("invalid port range: {}", e))?;
        }
        if let Some(v) = lookup("DB_PATH") {
            self.database.path = v;
        }

        debug!(
            api_port = self.server.api_port,
            proxy_port = self.server.proxy_port,
            db_path = %self.database.path,
            "Environment overrides applied"
        );
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let ports = [
            ("API port", self.server.api_port),
            ("proxy port", self.server.proxy_port),
            ("editor port", self.editor.port),
            ("notebook port range start", self.notebooks.port_range.start),
            ("notebook port range end", self.notebooks.port_range.end),
        ];
        for (name, port) in ports {
            if port == 0 {
                errors.push(format!("invalid {}: port must be between 1 and 65535", name));
            }
        }

        let range = self.notebooks.port_range;
        if range.start >= range.end {
            errors.push("invalid notebook port range: start port must be less than end port".to_string());
        }

        let mut listeners = vec![
            ("API port", self.server.api_port),
            ("proxy port", self.server.proxy_port),
        ];
        if self.editor.enabled {
            listeners.push(("editor port", self.editor.port));
        }
        for (name, port) in listeners {
            if range.contains(port) {
                errors.push(format!(
                    "port conflict: {} ({}) conflicts with notebook port range",
                    name, port
                ));
            }
        }

        if !self.notebooks.path.starts_with('/') {
            errors.push("notebooks path must be absolute".to_string());
        }
        if !self.database.path.starts_with('/') {
            errors.push("database path must be absolute".to_string());
        }
        if !self.websocket.path.starts_with('/') {
            errors.push("websocket path must start with '/'".to_string());
        }
        if self.runner.program.is_empty() {
            errors.push("runner program must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "127.0.0.1"
api_port = 9081
proxy_port = 8000
request_timeout_secs = 0

[websocket]
path = "/socket"
origins = ["https://hub.example.com"]

[notebooks]
path = "/srv/notebooks"
port_range = { start = 5000, end = 5100 }

[runner]
program = "/usr/local/bin/marimo"

[database]
path = "/var/lib/hub.db"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.api_port, 9081);
        assert_eq!(config.server.proxy_port, 8000);
        assert_eq!(config.server.request_timeout(), None);
        assert_eq!(config.websocket.path, "/socket");
        assert_eq!(config.notebooks.port_range, PortRange { start: 5000, end: 5100 });
        assert_eq!(config.runner.program, "/usr/local/bin/marimo");
        assert_eq!(config.runner.args, vec!["run".to_string()]);
        assert_eq!(config.database.path, "/var/lib/hub.db");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.api_port, 8081);
        assert_eq!(config.server.proxy_port, 80);
        assert_eq!(config.server.request_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.server.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.editor.port, 8080);
        assert!(!config.editor.enabled);
        assert_eq!(config.notebooks.path, "/notebooks");
        assert_eq!(config.notebooks.port_range, PortRange { start: 3000, end: 4000 });
        assert_eq!(config.runner.host, "127.0.0.1");
        assert_eq!(config.database.path, "/data/notebook-hub.db");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_minimal_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.websocket.path, "/ws");
        assert_eq!(config.websocket.origins, vec!["*".to_string()]);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("API_PORT", "7000"),
            ("PROXY_PORT", "7001"),
            ("MARIMO_PORT", "7002"),
            ("NOTEBOOKS_PATH", "/data/nb"),
            ("NOTEBOOK_PORT_RANGE", "6000-6500"),
            ("DB_PATH", "/data/test.db"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.api_port, 7000);
        assert_eq!(config.server.proxy_port, 7001);
        assert_eq!(config.editor.port, 7002);
        assert_eq!(config.notebooks.path, "/data/nb");
        assert_eq!(config.notebooks.port_range, PortRange { start: 6000, end: 6500 });
        assert_eq!(config.database.path, "/data/test.db");
    }

    #[test]
    fn test_env_override_rejects_bad_port() {
        let mut config = Config::default();
        let result = config.apply_env(|k| (k == "API_PORT").then(|| "http".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(
            PortRange::parse("3000-4000").unwrap(),
            PortRange { start: 3000, end: 4000 }
        );
        assert!(PortRange::parse("3000").is_err());
        assert!(PortRange::parse("a-4000").is_err());
        assert!(PortRange::parse("3000-99999").is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let mut config = Config::default();
        config.notebooks.port_range = PortRange { start: 4000, end: 3000 };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("start port must be less than end port"));
    }

    #[test]
    fn test_validate_rejects_listener_inside_range() {
        let mut config = Config::default();
        config.server.api_port = 3500;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("API port (3500) conflicts"));
    }

    #[test]
    fn test_validate_rejects_relative_paths() {
        let mut config = Config::default();
        config.notebooks.path = "notebooks".to_string();
        config.database.path = "hub.db".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("notebooks path must be absolute"));
        assert!(err.contains("database path must be absolute"));
    }

    #[test]
    fn test_origin_policy() {
        let any = WebSocketConfig::default();
        assert!(any.origin_allowed(None));
        assert!(any.origin_allowed(Some("https://evil.example")));

        let strict = WebSocketConfig {
            origins: vec!["https://hub.example.com".to_string()],
            ..Default::default()
        };
        assert!(strict.origin_allowed(Some("https://hub.example.com")));
        assert!(!strict.origin_allowed(Some("https://evil.example")));
        assert!(!strict.origin_allowed(None));
    }
}
