//! Gateway configuration.
//!
//! Every knob has a default, so `GatewayConfig::default()` yields a runnable
//! gateway; deployments override fields from TOML or through the `with_*`
//! builders.

use crate::httpd::HttpServerConfig;
use serde::Deserialize;
use std::time::Duration;

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_true() -> bool {
    true
}

fn default_binary_port() -> u16 {
    8080
}

fn default_http_port() -> u16 {
    8082
}

fn default_ws_port() -> u16 {
    8083
}

fn default_udp_port() -> u16 {
    8084
}

fn default_num_slaves() -> usize {
    4
}

fn default_udp_workers() -> usize {
    1
}

fn default_session_timeout_secs() -> u64 {
    300
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_max_frame_size() -> usize {
    crate::codec::DEFAULT_MAX_FRAME_SIZE
}

fn default_root_path() -> String {
    "/".into()
}

fn default_max_request_size() -> usize {
    1024 * 1024
}

/// One TCP listener: the binary, HTTP and WebSocket entry points each carry
/// one of these.
#[derive(Debug, Clone, Deserialize)]
pub struct TcpListenerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub port: u16,
    #[serde(default = "default_num_slaves")]
    pub num_slaves: usize,
    /// Classify each connection from its first bytes instead of assuming
    /// the listener's protocol. Used when several protocols share a port.
    #[serde(default)]
    pub protocol_detection: bool,
}

impl TcpListenerConfig {
    fn with_port(port: u16) -> Self {
        Self {
            enabled: true,
            port,
            num_slaves: default_num_slaves(),
            protocol_detection: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UdpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_udp_port")]
    pub port: u16,
    #[serde(default = "default_udp_workers")]
    pub workers: usize,
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_udp_port(),
            workers: default_udp_workers(),
            session_timeout_secs: default_session_timeout_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl UdpConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

fn default_http_server_port() -> u16 {
    HttpServerConfig::default().port
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpFrontendConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_http_server_port")]
    pub port: u16,
    #[serde(default)]
    pub threads: usize,
    #[serde(default = "default_root_path")]
    pub root_path: String,
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
}

impl Default for HttpFrontendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: HttpServerConfig::default().port,
            threads: 0,
            root_path: default_root_path(),
            max_request_size: default_max_request_size(),
        }
    }
}

fn default_binary_listener() -> TcpListenerConfig {
    TcpListenerConfig::with_port(default_binary_port())
}

fn default_http_listener() -> TcpListenerConfig {
    TcpListenerConfig::with_port(default_http_port())
}

fn default_ws_listener() -> TcpListenerConfig {
    TcpListenerConfig::with_port(default_ws_port())
}

/// Top-level gateway configuration.
///
/// # Examples
///
/// ```rust
/// use shield::GatewayConfig;
///
/// let config = GatewayConfig::default()
///     .with_host("127.0.0.1")
///     .with_request_timeout_ms(2500);
/// assert_eq!(config.binary.port, 8080);
/// assert_eq!(config.http.port, 8082);
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_binary_listener")]
    pub binary: TcpListenerConfig,

    #[serde(default = "default_http_listener")]
    pub http: TcpListenerConfig,

    #[serde(default = "default_ws_listener")]
    pub websocket: TcpListenerConfig,

    #[serde(default)]
    pub http_server: HttpFrontendConfig,

    #[serde(default)]
    pub udp: UdpConfig,

    /// Ceiling on one binary frame, checked before payload allocation.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Deadline on an outstanding application call.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            binary: default_binary_listener(),
            http: default_http_listener(),
            websocket: default_ws_listener(),
            http_server: HttpFrontendConfig::default(),
            udp: UdpConfig::default(),
            max_frame_size: default_max_frame_size(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl GatewayConfig {
    /// Parse a TOML document. Missing fields fall back to defaults.
    pub fn from_toml_str(input: &str) -> crate::Result<Self> {
        Ok(toml::from_str(input)?)
    }

    /// Read and parse a TOML config file.
    pub fn load(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_request_timeout_ms(mut self, request_timeout_ms: u64) -> Self {
        self.request_timeout_ms = request_timeout_ms;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// The server config handed to the axum front-end.
    pub fn http_server_config(&self) -> HttpServerConfig {
        HttpServerConfig {
            host: self.host.clone(),
            port: self.http_server.port,
            root_path: self.http_server.root_path.clone(),
            max_request_size: self.http_server.max_request_size,
            threads: self.http_server.threads,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_endpoints() {
        let config = GatewayConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.binary.port, 8080);
        assert_eq!(config.http.port, 8082);
        assert_eq!(config.websocket.port, 8083);
        assert_eq!(config.udp.port, 8084);
        assert_eq!(config.udp.session_timeout(), Duration::from_secs(300));
        assert_eq!(config.udp.cleanup_interval(), Duration::from_secs(60));
        assert_eq!(config.request_timeout(), Duration::from_millis(5000));
        assert_eq!(config.max_frame_size, 16 * 1024 * 1024);
        assert!(!config.binary.protocol_detection);
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let config = GatewayConfig::from_toml_str(
            r#"
            host = "127.0.0.1"
            request_timeout_ms = 1500

            [binary]
            port = 9000
            num_slaves = 2

            [udp]
            port = 9100
            session_timeout_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.binary.port, 9000);
        assert_eq!(config.binary.num_slaves, 2);
        assert!(config.binary.enabled);
        // Untouched sections keep their defaults.
        assert_eq!(config.http.port, 8082);
        assert_eq!(config.udp.port, 9100);
        assert_eq!(config.udp.session_timeout(), Duration::from_secs(30));
        assert_eq!(config.request_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn empty_toml_is_all_defaults() {
        let config = GatewayConfig::from_toml_str("").unwrap();
        assert_eq!(config.binary.port, GatewayConfig::default().binary.port);
        assert!(config.udp.enabled);
    }
}
