//! Server configuration: the options surface this core consumes.
//!
//! `ServerOptions` is normally handed over by the process spawner, but it can
//! also be loaded from a TOML file for standalone runs. Fields annotated with
//! `#[serde(default = "...")]` fall back to their defaults when absent, so a
//! partial file (or none at all) still produces a working configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// An endpoint string was not of the `unix:<path>` or `tcp:<addr>` form.
    #[error("invalid endpoint {0:?}: expected \"unix:<path>\" or \"tcp:<host:port>\"")]
    InvalidEndpoint(String),
}

// ── Endpoints ─────────────────────────────────────────────────────────────────

/// Where a server socket listens: a filesystem-path local socket or a TCP
/// address. Serialized as `unix:<path>` / `tcp:<host:port>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl Endpoint {
    pub fn is_unix(&self) -> bool {
        matches!(self, Endpoint::Unix(_))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

impl TryFrom<String> for Endpoint {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if let Some(path) = value.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(ConfigError::InvalidEndpoint(value));
            }
            Ok(Endpoint::Unix(PathBuf::from(path)))
        } else if let Some(addr) = value.strip_prefix("tcp:") {
            if addr.is_empty() {
                return Err(ConfigError::InvalidEndpoint(value));
            }
            Ok(Endpoint::Tcp(addr.to_string()))
        } else {
            Err(ConfigError::InvalidEndpoint(value))
        }
    }
}

/// Per-socket endpoint overrides. Unset sockets fall back to defaults derived
/// from [`ServerOptions::socket_dir`] (local sockets for the native and
/// console endpoints, loopback TCP for HTTP).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketEndpoints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub irb: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub async_irb: Option<Endpoint>,
}

// ── Options ───────────────────────────────────────────────────────────────────

/// The full options surface consumed by [`crate::server::RequestServer`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerOptions {
    /// Identity string of the application group this process serves.
    #[serde(default = "default_app_group_name")]
    pub app_group_name: String,
    /// Shared secret required from every connection; `None` disables
    /// authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_password: Option<String>,
    /// Process memory ceiling in bytes. 0 disables the check.
    #[serde(default)]
    pub memory_limit: u64,
    /// Maximum cumulative request header bytes per request.
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    /// Number of connections served concurrently.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Directory holding the local socket files. Created with owner-only
    /// permissions.
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    /// Per-socket endpoint overrides.
    #[serde(default)]
    pub sockets: SocketEndpoints,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_app_group_name() -> String {
    "default".to_string()
}
fn default_max_header_size() -> usize {
    128 * 1024
}
fn default_pool_size() -> usize {
    16
}
fn default_socket_dir() -> PathBuf {
    std::env::temp_dir().join("appgate").join("backends")
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            app_group_name: default_app_group_name(),
            connect_password: None,
            memory_limit: 0,
            max_header_size: default_max_header_size(),
            pool_size: default_pool_size(),
            socket_dir: default_socket_dir(),
            sockets: SocketEndpoints::default(),
            log_level: default_log_level(),
        }
    }
}

/// Loads `ServerOptions` from a TOML file, returning defaults if the file
/// does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_options(path: &std::path::Path) -> Result<ServerOptions, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let options: ServerOptions = toml::from_str(&content)?;
            Ok(options)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerOptions::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_have_expected_limits() {
        let options = ServerOptions::default();
        assert_eq!(options.max_header_size, 128 * 1024);
        assert_eq!(options.memory_limit, 0, "memory check disabled by default");
        assert_eq!(options.pool_size, 16);
        assert_eq!(options.connect_password, None);
        assert_eq!(options.log_level, "info");
    }

    #[test]
    fn test_endpoint_parses_unix_and_tcp_forms() {
        let unix = Endpoint::try_from("unix:/tmp/appgate/main.sock".to_string()).expect("unix");
        assert_eq!(unix, Endpoint::Unix(PathBuf::from("/tmp/appgate/main.sock")));

        let tcp = Endpoint::try_from("tcp:127.0.0.1:8080".to_string()).expect("tcp");
        assert_eq!(tcp, Endpoint::Tcp("127.0.0.1:8080".to_string()));
    }

    #[test]
    fn test_endpoint_rejects_unknown_scheme_and_empty_target() {
        assert!(Endpoint::try_from("udp:1.2.3.4:1".to_string()).is_err());
        assert!(Endpoint::try_from("unix:".to_string()).is_err());
        assert!(Endpoint::try_from("tcp:".to_string()).is_err());
        assert!(Endpoint::try_from("/bare/path".to_string()).is_err());
    }

    #[test]
    fn test_endpoint_display_round_trips() {
        for text in ["unix:/run/appgate/main.sock", "tcp:0.0.0.0:3000"] {
            let endpoint = Endpoint::try_from(text.to_string()).expect("parse");
            assert_eq!(endpoint.to_string(), text);
        }
    }

    #[test]
    fn test_options_toml_round_trip() {
        // Arrange
        let mut options = ServerOptions::default();
        options.app_group_name = "acme/main".to_string();
        options.connect_password = Some("1234".to_string());
        options.memory_limit = 512 * 1024 * 1024;
        options.sockets.http = Some(Endpoint::Tcp("127.0.0.1:0".to_string()));

        // Act
        let text = toml::to_string_pretty(&options).expect("serialize");
        let restored: ServerOptions = toml::from_str(&text).expect("deserialize");

        // Assert
        assert_eq!(options, restored);
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let options: ServerOptions = toml::from_str("app_group_name = \"foobar\"\n")
            .expect("deserialize minimal");
        assert_eq!(options.app_group_name, "foobar");
        assert_eq!(options.max_header_size, 128 * 1024);
        assert_eq!(options.sockets, SocketEndpoints::default());
    }

    #[test]
    fn test_absent_password_is_omitted_from_toml() {
        let text = toml::to_string_pretty(&ServerOptions::default()).expect("serialize");
        assert!(
            !text.contains("connect_password"),
            "unset password must not appear in serialized config"
        );
    }

    #[test]
    fn test_load_options_returns_defaults_for_missing_file() {
        let path = std::path::Path::new("/nonexistent/appgate/config.toml");
        let options = load_options(path).expect("missing file is not an error");
        assert_eq!(options, ServerOptions::default());
    }
}
