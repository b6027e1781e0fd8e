use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read from `FLEETD_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last rewrite before the compactor runs.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers fall back to defaults
    /// with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| -> Option<String> { lookup(key).filter(|v| !v.is_empty()) };
        Self {
            bind: parsed("FLEETD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: number(&lookup, "FLEETD_PORT").unwrap_or(5433),
            data_dir: PathBuf::from(parsed("FLEETD_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: parsed("FLEETD_PASSWORD").unwrap_or_else(|| "fleetd".into()),
            max_connections: number(&lookup, "FLEETD_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: number(&lookup, "FLEETD_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: number(&lookup, "FLEETD_METRICS_PORT"),
            tls_cert: parsed("FLEETD_TLS_CERT"),
            tls_key: parsed("FLEETD_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn number<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring {key}={raw:?}: not a valid number");
            None
        }
    }
}
