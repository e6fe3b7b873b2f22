//! Configuration management.
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then environment variables (a `.env` file is loaded first when present).

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Default Redis host.
pub const DEFAULT_REDIS_HOST: &str = "localhost";

/// Default Redis port.
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Default per-command store timeout.
const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;

/// Default delay between background reconnection attempts.
pub const DEFAULT_RECONNECT_INTERVAL_SECS: u64 = 60;

/// Default bound on background reconnection attempts.
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 20;

/// Maximum request body size (1 MiB).
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Main configuration for bookshelf.
#[derive(Debug, Clone, Default)]
pub struct BookshelfConfig {
    /// Key-value store connection settings.
    pub store: StoreConfig,
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Background reconnection settings.
    pub reconnect: ReconnectConfig,
    /// Logging settings.
    pub logging: LoggingSettings,
    /// Metrics settings.
    pub metrics: MetricsSettings,
    /// Problems skipped while loading, kept until logging is initialized.
    pub load_warnings: Vec<String>,
}

/// Which store implementation to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    /// A Redis server.
    #[default]
    Redis,
    /// An in-process map (local development and tests).
    Memory,
}

impl StoreBackend {
    /// Parses a backend name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "redis" => Some(Self::Redis),
            "memory" | "in-memory" | "inmemory" => Some(Self::Memory),
            _ => None,
        }
    }

    /// Returns the backend name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::Memory => "memory",
        }
    }
}

/// Key-value store connection settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Store implementation.
    pub backend: StoreBackend,
    /// Redis host.
    pub host: String,
    /// Redis port.
    pub port: u16,
    /// Full connection URL; takes precedence over host and port.
    pub url: Option<SecretString>,
    /// Optional password used with host and port.
    pub password: Option<SecretString>,
    /// Per-command timeout.
    pub timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            host: DEFAULT_REDIS_HOST.to_string(),
            port: DEFAULT_REDIS_PORT,
            url: None,
            password: None,
            timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
        }
    }
}

impl StoreConfig {
    /// Returns the Redis connection URL.
    ///
    /// The password is percent-encoded, so reserved characters such as `@`
    /// or `/` reach the server unchanged.
    #[must_use]
    pub fn connection_url(&self) -> SecretString {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let url = match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/",
                utf8_percent_encode(password.expose_secret(), NON_ALPHANUMERIC),
                self.host,
                self.port
            ),
            None => format!("redis://{}:{}/", self.host, self.port),
        };
        SecretString::from(url)
    }

    /// Returns a human-readable target with credentials removed.
    #[must_use]
    pub fn display_target(&self) -> String {
        match self.backend {
            StoreBackend::Memory => "memory".to_string(),
            StoreBackend::Redis if self.url.is_some() => "redis (REDIS_URL)".to_string(),
            StoreBackend::Redis => format!("redis://{}:{}", self.host, self.port),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub host: IpAddr,
    /// Bind port.
    pub port: u16,
    /// Maximum accepted request body, in bytes.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 3000,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl ServerConfig {
    /// Returns the socket address to bind.
    #[must_use]
    pub const fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Background reconnection settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay between attempts.
    pub interval: Duration,
    /// Attempts made before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_RECONNECT_INTERVAL_SECS),
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, multi-line output.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Parses a format name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Returns the format name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone)]
pub struct LoggingSettings {
    /// Output format.
    pub format: LogFormat,
    /// `EnvFilter` directive string.
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: "info".to_string(),
        }
    }
}

/// Metrics settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSettings {
    /// Whether the Prometheus exporter is installed.
    pub enabled: bool,
    /// Port for the Prometheus scrape listener.
    pub port: u16,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    /// Store section.
    pub store: Option<ConfigFileStore>,
    /// Server section.
    pub server: Option<ConfigFileServer>,
    /// Reconnect section.
    pub reconnect: Option<ConfigFileReconnect>,
    /// Logging section.
    pub logging: Option<ConfigFileLogging>,
    /// Metrics section.
    pub metrics: Option<ConfigFileMetrics>,
}

/// Store section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileStore {
    /// Backend name.
    pub backend: Option<String>,
    /// Redis host.
    pub host: Option<String>,
    /// Redis port.
    pub port: Option<u16>,
    /// Connection URL.
    pub url: Option<String>,
    /// Password.
    pub password: Option<String>,
    /// Command timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

/// Server section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileServer {
    /// Bind address.
    pub host: Option<IpAddr>,
    /// Bind port.
    pub port: Option<u16>,
    /// Maximum body size in bytes.
    pub max_body_bytes: Option<usize>,
}

/// Reconnect section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileReconnect {
    /// Seconds between attempts.
    pub interval_secs: Option<u64>,
    /// Attempt bound.
    pub max_attempts: Option<u32>,
}

/// Logging section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileLogging {
    /// `pretty` or `json`.
    pub format: Option<String>,
    /// Filter directives.
    pub filter: Option<String>,
}

/// Metrics section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileMetrics {
    /// Exporter toggle.
    pub enabled: Option<bool>,
    /// Listener port.
    pub port: Option<u16>,
}

impl BookshelfConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the effective configuration.
    ///
    /// Reads `path` if given, otherwise the default config file location,
    /// then loads `.env` and applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly given file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut base = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_default(),
        };
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                base.load_warnings
                    .push(format!("ignoring unreadable .env file: {e}"));
            }
        }
        Ok(base.with_env_overrides())
    }

    /// Loads configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> crate::Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| crate::Error::OperationFailed {
                operation: "read_config_file".to_string(),
                cause: format!("{}: {e}", path.display()),
            })?;

        Self::from_toml_str(&contents)
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid configuration TOML.
    pub fn from_toml_str(contents: &str) -> crate::Result<Self> {
        let file: ConfigFile =
            toml::from_str(contents).map_err(|e| crate::Error::OperationFailed {
                operation: "parse_config_file".to_string(),
                cause: e.to_string(),
            })?;

        Ok(Self::from_config_file(file))
    }

    /// Loads configuration from the platform config directory.
    ///
    /// Returns default configuration if no readable config file is found.
    #[must_use]
    pub fn load_default() -> Self {
        let Some(base_dirs) = directories::BaseDirs::new() else {
            return Self::default();
        };

        Self::load_optional(&base_dirs.config_dir().join("bookshelf").join("config.toml"))
    }

    /// Loads `path` if it exists, falling back to defaults.
    ///
    /// An unreadable or invalid file is recorded in `load_warnings` instead
    /// of failing.
    #[must_use]
    pub fn load_optional(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from_file(path) {
            Ok(config) => config,
            Err(e) => Self {
                load_warnings: vec![format!("ignoring invalid config file: {e}")],
                ..Self::default()
            },
        }
    }

    /// Converts a `ConfigFile` to `BookshelfConfig`.
    fn from_config_file(file: ConfigFile) -> Self {
        let mut config = Self::default();

        if let Some(store) = file.store {
            if let Some(backend) = store.backend.as_deref().and_then(StoreBackend::parse) {
                config.store.backend = backend;
            }
            if let Some(host) = store.host {
                config.store.host = host;
            }
            if let Some(port) = store.port {
                config.store.port = port;
            }
            config.store.url = store.url.map(SecretString::from);
            config.store.password = store.password.map(SecretString::from);
            if let Some(ms) = store.timeout_ms {
                config.store.timeout = Duration::from_millis(ms);
            }
        }
        if let Some(server) = file.server {
            if let Some(host) = server.host {
                config.server.host = host;
            }
            if let Some(port) = server.port {
                config.server.port = port;
            }
            if let Some(max) = server.max_body_bytes {
                config.server.max_body_bytes = max;
            }
        }
        if let Some(reconnect) = file.reconnect {
            if let Some(secs) = reconnect.interval_secs {
                config.reconnect.interval = Duration::from_secs(secs);
            }
            if let Some(max) = reconnect.max_attempts {
                config.reconnect.max_attempts = max;
            }
        }
        if let Some(logging) = file.logging {
            if let Some(format) = logging.format.as_deref().and_then(LogFormat::parse) {
                config.logging.format = format;
            }
            if let Some(filter) = logging.filter {
                config.logging.filter = filter;
            }
        }
        if let Some(metrics) = file.metrics {
            if let Some(enabled) = metrics.enabled {
                config.metrics.enabled = enabled;
            }
            if let Some(port) = metrics.port {
                config.metrics.port = port;
            }
        }

        config
    }

    /// Applies overrides from the process environment.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary variable lookup.
    ///
    /// Values that fail to parse are ignored and the current value is kept.
    #[must_use]
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup("BOOKSHELF_STORE_BACKEND")
            .as_deref()
            .and_then(StoreBackend::parse)
        {
            self.store.backend = backend;
        }
        if let Some(host) = lookup("REDIS_HOST").filter(|h| !h.is_empty()) {
            self.store.host = host;
        }
        if let Some(port) = lookup("REDIS_PORT").and_then(|v| v.parse().ok()) {
            self.store.port = port;
        }
        if let Some(url) = lookup("REDIS_URL").filter(|u| !u.is_empty()) {
            self.store.url = Some(SecretString::from(url));
        }
        if let Some(password) = lookup("REDIS_PASSWORD").filter(|p| !p.is_empty()) {
            self.store.password = Some(SecretString::from(password));
        }
        if let Some(ms) = lookup("BOOKSHELF_STORE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.store.timeout = Duration::from_millis(ms);
        }
        if let Some(host) = lookup("BOOKSHELF_HOST").and_then(|v| v.parse().ok()) {
            self.server.host = host;
        }
        if let Some(port) = lookup("BOOKSHELF_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(secs) =
            lookup("BOOKSHELF_RECONNECT_INTERVAL_SECS").and_then(|v| v.parse().ok())
        {
            self.reconnect.interval = Duration::from_secs(secs);
        }
        if let Some(max) = lookup("BOOKSHELF_RECONNECT_MAX_ATTEMPTS").and_then(|v| v.parse().ok())
        {
            self.reconnect.max_attempts = max;
        }
        if let Some(format) = lookup("BOOKSHELF_LOG_FORMAT")
            .as_deref()
            .and_then(LogFormat::parse)
        {
            self.logging.format = format;
        }
        if let Some(filter) = lookup("BOOKSHELF_LOG").filter(|f| !f.is_empty()) {
            self.logging.filter = filter;
        }
        if let Some(enabled) = lookup("BOOKSHELF_METRICS_ENABLED").and_then(|v| parse_bool(&v)) {
            self.metrics.enabled = enabled;
        }
        if let Some(port) = lookup("BOOKSHELF_METRICS_PORT").and_then(|v| v.parse().ok()) {
            self.metrics.port = port;
        }
        self
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
