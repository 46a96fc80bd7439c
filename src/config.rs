use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::{EnginePolicy, PackingPolicy};
use crate::model::OverlapRule;

#[derive(Debug)]
pub struct ConfigError {
    pub var: &'static str,
    pub reason: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid {}: {}", self.var, self.reason)
    }
}

impl std::error::Error for ConfigError {}

/// Process configuration, read once at start-up.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub http_port: u16,
    pub console_port: u16,
    pub console_password: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// Bearer token for `/admin`; admin routes refuse everything when unset.
    pub admin_token: Option<String>,
    pub operator_email: Option<String>,
    pub from_email: String,
    /// Mail relay webhook; mails are only logged when unset.
    pub mail_relay_url: Option<String>,
    pub outbox_capacity: usize,
    pub cache_enabled: bool,
    /// `None` keeps cached lists until evicted.
    pub cache_ttl: Option<Duration>,
    pub policy: EnginePolicy,
    pub customer_header: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            bind: text("PARKKING_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            http_port: parsed(&lookup, "PARKKING_HTTP_PORT")?.unwrap_or(8080),
            console_port: parsed(&lookup, "PARKKING_CONSOLE_PORT")?.unwrap_or(5433),
            console_password: text("PARKKING_CONSOLE_PASSWORD").unwrap_or_else(|| "parkking".into()),
            data_dir: text("PARKKING_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            max_connections: parsed(&lookup, "PARKKING_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&lookup, "PARKKING_COMPACT_THRESHOLD")?.unwrap_or(1000),
            metrics_port: parsed(&lookup, "PARKKING_METRICS_PORT")?,
            tls_cert: text("PARKKING_TLS_CERT"),
            tls_key: text("PARKKING_TLS_KEY"),
            admin_token: text("PARKKING_ADMIN_TOKEN"),
            operator_email: text("PARKKING_OPERATOR_EMAIL"),
            from_email: text("PARKKING_FROM_EMAIL").unwrap_or_else(|| "noreply@parkking.local".into()),
            mail_relay_url: text("PARKKING_MAIL_RELAY_URL"),
            outbox_capacity: parsed(&lookup, "PARKKING_OUTBOX_CAPACITY")?.unwrap_or(1024),
            cache_enabled: parsed(&lookup, "PARKKING_CACHE_ENABLED")?.unwrap_or(true),
            cache_ttl: parsed::<u64>(&lookup, "PARKKING_CACHE_TTL_SECS")?.map(Duration::from_secs),
            policy: EnginePolicy {
                overlap: parsed::<OverlapRule>(&lookup, "PARKKING_OVERLAP_RULE")?.unwrap_or_default(),
                packing: parsed::<PackingPolicy>(&lookup, "PARKKING_PACKING")?.unwrap_or_default(),
            },
            customer_header: text("PARKKING_CUSTOMER_HEADER")
                .map(|h| h.to_ascii_lowercase())
                .unwrap_or_else(|| "x-customer-user".into()),
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("parkking.wal")
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| ConfigError {
            var,
            reason: format!("{raw:?}: {e}"),
        }),
    }
}
