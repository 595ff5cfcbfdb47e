use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server settings, read once at startup from `SHAREIT_*` environment variables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    /// Directory holding `shareit.wal`. Created if missing.
    pub data_dir: PathBuf,
    /// Shared password for every login.
    pub password: String,
    /// Connections beyond this are dropped at accept.
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    /// Prometheus listener port; no exporter when unset.
    pub metrics_port: Option<u16>,
    /// Upper bound on a single engine call issued by a query.
    pub request_timeout: Duration,
    /// PEM certificate chain and key; TLS is offered only when both are set.
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "shareit".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            request_timeout: Duration::from_millis(5000),
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or unparsable values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| parse(&v));
        Self {
            port: parsed("SHAREIT_PORT").unwrap_or(defaults.port),
            bind: lookup("SHAREIT_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("SHAREIT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("SHAREIT_PASSWORD").unwrap_or(defaults.password),
            max_connections: lookup("SHAREIT_MAX_CONNECTIONS")
                .and_then(|v| parse(&v))
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_connections),
            compact_threshold: lookup("SHAREIT_COMPACT_THRESHOLD")
                .and_then(|v| parse(&v))
                .unwrap_or(defaults.compact_threshold),
            metrics_port: lookup("SHAREIT_METRICS_PORT").and_then(|v| parse(&v)),
            request_timeout: lookup("SHAREIT_REQUEST_TIMEOUT_MS")
                .and_then(|v| parse(&v))
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            tls_cert: lookup("SHAREIT_TLS_CERT"),
            tls_key: lookup("SHAREIT_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse<T: FromStr>(value: &str) -> Option<T> {
    value.trim().parse().ok()
}
