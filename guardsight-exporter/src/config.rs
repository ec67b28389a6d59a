//! Configuration for the exporter.
//!
//! Sources, lowest precedence first: built-in defaults, an optional JSON5
//! file, a `.env` file ([`read_dotenv`]), process environment variables
//! ([`ExporterConfig::apply_env`]) and finally command-line flags applied by
//! the binary.

use std::collections::HashMap;
use std::path::Path;

use guardsight_adguard::{ApplianceConfig, Schema};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::parse_level;
use crate::mapping::is_valid_metric_name;

/// Default scrape port.
pub const DEFAULT_PORT: u16 = 9617;

/// Default poll interval in seconds.
pub const DEFAULT_INTERVAL_SECS: u64 = 15;

/// Longest accepted poll interval (one day).
pub const MAX_INTERVAL_SECS: u64 = 86_400;

/// Paths served next to the metrics endpoint.
const RESERVED_PATHS: [&str; 2] = ["/health", "/ready"];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Failed to read .env file: {0}")]
    Dotenv(#[from] dotenvy::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Appliance connection settings.
    #[serde(default)]
    pub adguard: ApplianceConfig,

    /// Poll loop settings.
    #[serde(default)]
    pub poll: PollConfig,

    /// Prometheus endpoint settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Query log handling.
    #[serde(default)]
    pub querylog: QueryLogConfig,

    /// Field mapping for the appliance's JSON documents.
    #[serde(default)]
    pub schema: Schema,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Poll loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Seconds between poll cycles (default: 15, at most one day).
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
        }
    }
}

/// Prometheus HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Address to listen on (default: "0.0.0.0:9617").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,

    /// Metric name prefix (default: "adguard").
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_listen() -> String {
    format!("0.0.0.0:{}", DEFAULT_PORT)
}

fn default_path() -> String {
    "/metrics".to_string()
}

fn default_prefix() -> String {
    "adguard".to_string()
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            prefix: default_prefix(),
        }
    }
}

/// Query log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLogConfig {
    /// Skip entries already counted on an earlier poll (default: true).
    #[serde(default = "default_dedupe")]
    pub dedupe: bool,
}

fn default_dedupe() -> bool {
    true
}

impl Default for QueryLogConfig {
    fn default() -> Self {
        Self {
            dedupe: default_dedupe(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment variables read through `lookup`.
    ///
    /// Recognized: `ADGUARD_HOST`, `ADGUARD_USER`, `ADGUARD_PASS`,
    /// `EXPORTER_PORT`, `SCRAPE_INTERVAL`, `LOG_LEVEL`, `LOG_FORMAT`.
    /// Unusable values never fail; they fall back to defaults and are
    /// returned as warnings to log once tracing is up.
    pub fn apply_env<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(host) = get("ADGUARD_HOST") {
            self.adguard.url = if host.contains("://") {
                host
            } else {
                format!("http://{}", host)
            };
        }
        if let Some(user) = get("ADGUARD_USER") {
            self.adguard.username = Some(user);
        }
        if let Some(pass) = lookup("ADGUARD_PASS") {
            self.adguard.password = Some(pass);
        }

        if let Some(raw) = get("EXPORTER_PORT") {
            let port = match raw.parse::<u16>() {
                Ok(port) if port > 0 => port,
                _ => {
                    warnings.push(format!(
                        "Invalid EXPORTER_PORT {:?}, using {}",
                        raw, DEFAULT_PORT
                    ));
                    DEFAULT_PORT
                }
            };
            self.prometheus.listen = with_port(&self.prometheus.listen, port);
        }

        if let Some(raw) = get("SCRAPE_INTERVAL") {
            self.poll.interval_secs = match raw.parse::<u64>() {
                Ok(secs) if secs > 0 && secs <= MAX_INTERVAL_SECS => secs,
                _ => {
                    warnings.push(format!(
                        "Invalid SCRAPE_INTERVAL {:?}, using {}s",
                        raw, DEFAULT_INTERVAL_SECS
                    ));
                    DEFAULT_INTERVAL_SECS
                }
            };
        }

        if let Some(raw) = get("LOG_LEVEL") {
            match parse_level(&raw) {
                Some(level) => self.logging.level = level.to_string(),
                None => warnings.push(format!(
                    "Invalid LOG_LEVEL {:?}, keeping {}",
                    raw, self.logging.level
                )),
            }
        }

        if let Some(raw) = get("LOG_FORMAT") {
            match raw.to_ascii_lowercase().as_str() {
                "text" => self.logging.format = LogFormat::Text,
                "json" => self.logging.format = LogFormat::Json,
                _ => warnings.push(format!("Invalid LOG_FORMAT {:?}, keeping current", raw)),
            }
        }

        warnings
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.adguard.url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Validation(format!(
                "Appliance URL must start with http:// or https://: {}",
                url
            )));
        }

        if self.adguard.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "timeout_secs must be > 0".to_string(),
            ));
        }

        if self.poll.interval_secs == 0 || self.poll.interval_secs > MAX_INTERVAL_SECS {
            return Err(ConfigError::Validation(format!(
                "interval_secs must be between 1 and {}",
                MAX_INTERVAL_SECS
            )));
        }

        if self
            .prometheus
            .listen
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.prometheus.listen
            )));
        }

        let path = &self.prometheus.path;
        if !path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }
        if RESERVED_PATHS.contains(&path.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Metrics path {} is already served by the exporter",
                path
            )));
        }
        // Route syntax for captures and wildcards.
        if path.contains(':') || path.contains('*') {
            return Err(ConfigError::Validation(format!(
                "Metrics path must not contain ':' or '*': {}",
                path
            )));
        }

        if !self.prometheus.prefix.is_empty() && !is_valid_metric_name(&self.prometheus.prefix) {
            return Err(ConfigError::Validation(format!(
                "Invalid metric prefix: {}",
                self.prometheus.prefix
            )));
        }

        Ok(())
    }
}

/// Read `KEY=value` pairs from a dotenv file. A missing file yields no pairs.
pub fn read_dotenv<P: AsRef<Path>>(path: P) -> Result<HashMap<String, String>, ConfigError> {
    match dotenvy::from_path_iter(path.as_ref()) {
        Ok(pairs) => Ok(pairs.collect::<Result<HashMap<_, _>, _>>()?),
        Err(e) if e.not_found() => Ok(HashMap::new()),
        Err(e) => Err(e.into()),
    }
}

/// Lookup that consults `primary` first and falls back to `file` pairs, so
/// variables set in the process win over the `.env` file.
pub fn layered_lookup<'a, P>(
    primary: P,
    file: &'a HashMap<String, String>,
) -> impl Fn(&str) -> Option<String> + 'a
where
    P: Fn(&str) -> Option<String> + 'a,
{
    move |key: &str| primary(key).or_else(|| file.get(key).cloned())
}

/// Replace the port of a `host:port` listen address.
fn with_port(listen: &str, port: u16) -> String {
    match listen.parse::<std::net::SocketAddr>() {
        Ok(mut addr) => {
            addr.set_port(port);
            addr.to_string()
        }
        Err(_) => format!("0.0.0.0:{}", port),
    }
}
