//! Process configuration read from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::import::DEFAULT_CHUNK_SIZE;
use crate::intake::DEFAULT_MAX_UPLOAD_BYTES;
use crate::webhooks::RetryPolicy;
use crate::workers::WorkerPoolConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub uploads_dir: PathBuf,
    pub staging_retain_files: bool,
    pub max_upload_bytes: u64,
    pub import_chunk_size: usize,
    pub import_workers: usize,
    pub webhook_workers: usize,
    pub webhook_timeout: Duration,
    pub webhook_max_attempts: u32,
    pub webhook_retry_base: Duration,
    pub webhook_retry_max: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            use_persistent_stores: false,
            database_url: None,
            redis_url: "redis://localhost:6379".to_string(),
            uploads_dir: PathBuf::from("storage/uploads"),
            staging_retain_files: false,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            import_chunk_size: DEFAULT_CHUNK_SIZE,
            import_workers: 2,
            webhook_workers: 8,
            webhook_timeout: Duration::from_secs(10),
            webhook_max_attempts: 5,
            webhook_retry_base: Duration::from_millis(1_000),
            webhook_retry_max: Duration::from_millis(60_000),
        }
    }
}

fn parse<T>(key: &'static str, raw: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: raw.clone(),
        reason: e.to_string(),
    })
}

fn parse_bool(key: &'static str, raw: String) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: "expected true or false".to_string(),
        }),
    }
}

fn positive(key: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut s = Self::default();

        if let Some(v) = lookup("BIND_ADDR") {
            s.bind_addr = parse("BIND_ADDR", v)?;
        }
        if let Some(v) = lookup("USE_PERSISTENT_STORES") {
            s.use_persistent_stores = parse_bool("USE_PERSISTENT_STORES", v)?;
        }
        s.database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());
        if let Some(v) = lookup("REDIS_URL").filter(|v| !v.trim().is_empty()) {
            s.redis_url = v;
        }
        if let Some(v) = lookup("UPLOADS_DIR").filter(|v| !v.trim().is_empty()) {
            s.uploads_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("STAGING_RETAIN_FILES") {
            s.staging_retain_files = parse_bool("STAGING_RETAIN_FILES", v)?;
        }
        if let Some(v) = lookup("MAX_UPLOAD_BYTES") {
            s.max_upload_bytes = parse("MAX_UPLOAD_BYTES", v)?;
        }
        if let Some(v) = lookup("IMPORT_CHUNK_SIZE") {
            s.import_chunk_size = positive("IMPORT_CHUNK_SIZE", parse("IMPORT_CHUNK_SIZE", v)?)?;
        }
        if let Some(v) = lookup("IMPORT_WORKERS") {
            s.import_workers = positive("IMPORT_WORKERS", parse("IMPORT_WORKERS", v)?)?;
        }
        if let Some(v) = lookup("WEBHOOK_WORKERS") {
            s.webhook_workers = positive("WEBHOOK_WORKERS", parse("WEBHOOK_WORKERS", v)?)?;
        }
        if let Some(v) = lookup("WEBHOOK_TIMEOUT_SECS") {
            s.webhook_timeout = Duration::from_secs(parse("WEBHOOK_TIMEOUT_SECS", v)?);
        }
        if let Some(v) = lookup("WEBHOOK_MAX_ATTEMPTS") {
            let attempts = positive("WEBHOOK_MAX_ATTEMPTS", parse("WEBHOOK_MAX_ATTEMPTS", v)?)?;
            s.webhook_max_attempts = u32::try_from(attempts).unwrap_or(u32::MAX);
        }
        if let Some(v) = lookup("WEBHOOK_RETRY_BASE_MS") {
            s.webhook_retry_base = Duration::from_millis(parse("WEBHOOK_RETRY_BASE_MS", v)?);
        }
        if let Some(v) = lookup("WEBHOOK_RETRY_MAX_MS") {
            s.webhook_retry_max = Duration::from_millis(parse("WEBHOOK_RETRY_MAX_MS", v)?);
        }

        if s.use_persistent_stores && s.database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }
        Ok(s)
    }

    pub fn with_uploads_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.uploads_dir = dir.into();
        self
    }

    pub fn with_import_chunk_size(mut self, size: usize) -> Self {
        self.import_chunk_size = size.max(1);
        self
    }

    pub fn with_workers(mut self, import_workers: usize, webhook_workers: usize) -> Self {
        self.import_workers = import_workers;
        self.webhook_workers = webhook_workers;
        self
    }

    pub fn with_webhook_retry(mut self, max_attempts: u32, base: Duration, max: Duration) -> Self {
        self.webhook_max_attempts = max_attempts;
        self.webhook_retry_base = base;
        self.webhook_retry_max = max;
        self
    }

    pub fn with_webhook_timeout(mut self, timeout: Duration) -> Self {
        self.webhook_timeout = timeout;
        self
    }

    pub fn with_staging_retention(mut self, retain: bool) -> Self {
        self.staging_retain_files = retain;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.webhook_max_attempts,
            self.webhook_retry_base,
            self.webhook_retry_max,
        )
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_import_workers(self.import_workers)
            .with_webhook_workers(self.webhook_workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Settings::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let s = from_pairs(&[]).unwrap();
        assert_eq!(s, Settings::default());
        assert_eq!(s.import_chunk_size, 1000);
        assert_eq!(s.import_workers, 2);
        assert_eq!(s.webhook_workers, 8);
        assert_eq!(s.max_upload_bytes, 104_857_600);

        let policy = s.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(1_000));
        assert_eq!(policy.max_delay, Duration::from_millis(60_000));
    }

    #[test]
    fn values_override_defaults() {
        let s = from_pairs(&[
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("IMPORT_CHUNK_SIZE", "250"),
            ("WEBHOOK_MAX_ATTEMPTS", "3"),
            ("WEBHOOK_TIMEOUT_SECS", "2"),
            ("STAGING_RETAIN_FILES", "TRUE"),
        ])
        .unwrap();
        assert_eq!(s.bind_addr.port(), 9000);
        assert_eq!(s.import_chunk_size, 250);
        assert_eq!(s.webhook_max_attempts, 3);
        assert_eq!(s.webhook_timeout, Duration::from_secs(2));
        assert!(s.staging_retain_files);
    }

    #[test]
    fn malformed_values_are_errors() {
        assert!(matches!(
            from_pairs(&[("IMPORT_WORKERS", "many")]),
            Err(ConfigError::Invalid { key: "IMPORT_WORKERS", .. })
        ));
        assert!(matches!(
            from_pairs(&[("IMPORT_CHUNK_SIZE", "0")]),
            Err(ConfigError::Invalid { key: "IMPORT_CHUNK_SIZE", .. })
        ));
        assert!(matches!(
            from_pairs(&[("USE_PERSISTENT_STORES", "maybe")]),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn persistent_mode_needs_a_database() {
        assert_eq!(
            from_pairs(&[("USE_PERSISTENT_STORES", "true")]),
            Err(ConfigError::Missing("DATABASE_URL"))
        );
        let s = from_pairs(&[
            ("USE_PERSISTENT_STORES", "true"),
            ("DATABASE_URL", "postgres://localhost/shelfsync"),
        ])
        .unwrap();
        assert!(s.use_persistent_stores);
    }
}
