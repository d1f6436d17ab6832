//! Service configuration.
//!
//! [`StrataConfig`] is a nested structure mirroring the sections of the
//! service's TOML configuration file. Every field has a default so a bare
//! `StrataConfig::default()` is a runnable development configuration; the
//! most commonly tuned values can also be overridden through environment
//! variables (see [`StrataConfig::apply_env`]).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 5 MiB, the S3 minimum size for all multipart parts but the last.
const DEFAULT_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// 5 GiB, the S3 maximum size for a single part.
const DEFAULT_MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read config file {path}: {source}")]
    Io {
        /// Path that failed to load.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for this schema.
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        /// Path that failed to parse.
        path: String,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    /// HTTP front-end settings (consumed by the external server layer).
    pub server: ServerConfig,
    /// Metadata database settings.
    pub database: DatabaseConfig,
    /// Blob storage settings.
    pub storage: StorageConfig,
    /// Authentication settings.
    pub auth: AuthConfig,
    /// Request rate limiting.
    pub rate_limit: RateLimitConfig,
    /// Garbage collection.
    pub gc: GcConfig,
    /// Metrics exposure (consumed by the external metrics layer).
    pub metrics: MetricsConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Read timeout in seconds.
    pub read_timeout_secs: u64,
    /// Write timeout in seconds.
    pub write_timeout_secs: u64,
    /// Idle connection timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Maximum accepted request body size in bytes.
    pub max_body_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 9000,
            read_timeout_secs: 300,
            write_timeout_secs: 300,
            idle_timeout_secs: 60,
            max_body_size: DEFAULT_MAX_PART_SIZE,
        }
    }
}

/// Metadata database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database driver. Only `sqlite` is bundled; `postgres` deployments
    /// supply their own connection URL.
    pub driver: String,
    /// SQLite database path (ignored for other drivers).
    pub path: String,
    /// Full connection URL, overriding `path` when set.
    pub url: Option<String>,
    /// Maximum connections in the pool.
    pub max_connections: u32,
    /// Minimum idle connections kept in the pool.
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: "sqlite".to_owned(),
            path: "strata.db".to_owned(),
            url: None,
            max_connections: 16,
            min_connections: 1,
        }
    }
}

impl DatabaseConfig {
    /// Resolve the connection URL for the configured driver.
    #[must_use]
    pub fn connection_url(&self) -> String {
        self.url
            .clone()
            .unwrap_or_else(|| format!("sqlite://{}?mode=rwc", self.path))
    }
}

/// Blob storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for sharded blob files.
    pub data_dir: String,
    /// Directory for in-flight temp files; must be on the same filesystem
    /// as `data_dir` so the final rename is atomic.
    pub temp_dir: String,
    /// Multipart upload limits.
    pub multipart: MultipartConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "data/blobs".to_owned(),
            temp_dir: "data/tmp".to_owned(),
            multipart: MultipartConfig::default(),
        }
    }
}

/// Multipart upload limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultipartConfig {
    /// Minimum part size in bytes (all parts but the last).
    pub min_part_size: u64,
    /// Maximum part size in bytes.
    pub max_part_size: u64,
    /// Maximum number of parts per upload.
    pub max_parts: u32,
    /// Seconds after initiation at which an upload expires.
    pub upload_expiration_secs: u64,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            min_part_size: DEFAULT_MIN_PART_SIZE,
            max_part_size: DEFAULT_MAX_PART_SIZE,
            max_parts: 10_000,
            upload_expiration_secs: 7 * 24 * 60 * 60,
        }
    }
}

/// Authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Base64-encoded 32-byte master key protecting access-key secrets.
    pub encryption_key: String,
    /// Region accepted in credential scopes.
    pub region: String,
    /// Service accepted in credential scopes.
    pub service: String,
    /// Default expiry for generated presigned URLs, in seconds.
    pub presigned_url_expiration_secs: u64,
    /// Maximum allowed clock skew for signed requests, in seconds.
    pub max_signature_age_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            encryption_key: String::new(),
            region: "us-east-1".to_owned(),
            service: "s3".to_owned(),
            presigned_url_expiration_secs: 15 * 60,
            max_signature_age_secs: 15 * 60,
        }
    }
}

impl AuthConfig {
    /// Maximum clock skew as a [`Duration`].
    #[must_use]
    pub fn max_signature_age(&self) -> Duration {
        Duration::from_secs(self.max_signature_age_secs)
    }
}

/// Request rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained requests per second.
    pub requests_per_second: u32,
    /// Burst capacity above the sustained rate.
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 200,
            burst_size: 400,
        }
    }
}

/// Garbage collection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Whether the periodic collector runs at all.
    pub enabled: bool,
    /// Seconds between collection runs.
    pub interval_secs: u64,
    /// Seconds an orphan blob is retained after its refcount hits zero.
    pub grace_period_secs: u64,
    /// Maximum orphans reclaimed per run.
    pub batch_size: u32,
    /// Log what would be deleted without mutating anything.
    pub dry_run: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60 * 60,
            grace_period_secs: 24 * 60 * 60,
            batch_size: 1000,
            dry_run: false,
        }
    }
}

impl GcConfig {
    /// Interval between runs as a [`Duration`].
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Grace period as a [`Duration`].
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// TTL for the collector's advisory lock: half the interval, but never
    /// below five minutes.
    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs((self.interval_secs / 2).max(5 * 60))
    }
}

/// Metrics exposure settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether the metrics endpoint is served.
    pub enabled: bool,
    /// Metrics port.
    pub port: u16,
    /// Metrics path.
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
            path: "/metrics".to_owned(),
        }
    }
}

impl StrataConfig {
    /// Load configuration from a TOML file.
    ///
    /// Missing sections and keys fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Override the most commonly tuned values from environment variables.
    ///
    /// Recognized variables: `STRATA_HOST`, `STRATA_PORT`, `STRATA_DB_PATH`,
    /// `STRATA_DATA_DIR`, `STRATA_TEMP_DIR`, `STRATA_ENCRYPTION_KEY`,
    /// `STRATA_REGION`, `STRATA_GC_ENABLED`, `STRATA_GC_DRY_RUN`.
    #[must_use]
    pub fn apply_env(mut self) -> Self {
        if let Ok(v) = std::env::var("STRATA_HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("STRATA_PORT") {
            if let Ok(port) = v.parse() {
                self.server.port = port;
            }
        }
        if let Ok(v) = std::env::var("STRATA_DB_PATH") {
            self.database.path = v;
        }
        if let Ok(v) = std::env::var("STRATA_DATA_DIR") {
            self.storage.data_dir = v;
        }
        if let Ok(v) = std::env::var("STRATA_TEMP_DIR") {
            self.storage.temp_dir = v;
        }
        if let Ok(v) = std::env::var("STRATA_ENCRYPTION_KEY") {
            self.auth.encryption_key = v;
        }
        if let Ok(v) = std::env::var("STRATA_REGION") {
            self.auth.region = v;
        }
        if let Ok(v) = std::env::var("STRATA_GC_ENABLED") {
            self.gc.enabled = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("STRATA_GC_DRY_RUN") {
            self.gc.dry_run = parse_bool(&v);
        }
        self
    }
}

/// Parse a string as a boolean, accepting `"1"` and `"true"` (case-insensitive).
fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_create_default_config() {
        let config = StrataConfig::default();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.database.driver, "sqlite");
        assert_eq!(config.auth.region, "us-east-1");
        assert_eq!(config.auth.service, "s3");
        assert_eq!(config.storage.multipart.max_parts, 10_000);
        assert_eq!(config.storage.multipart.min_part_size, 5 * 1024 * 1024);
        assert_eq!(config.gc.interval_secs, 3600);
        assert_eq!(config.gc.grace_period_secs, 86_400);
        assert_eq!(config.gc.batch_size, 1000);
        assert!(config.gc.enabled);
        assert!(!config.gc.dry_run);
    }

    #[test]
    fn test_should_parse_partial_toml() {
        let toml_text = r#"
            [server]
            port = 9999

            [gc]
            dry_run = true
        "#;
        let config: StrataConfig = toml::from_str(toml_text).expect("test parse");
        assert_eq!(config.server.port, 9999);
        assert!(config.gc.dry_run);
        // Unspecified sections keep defaults.
        assert_eq!(config.auth.region, "us-east-1");
        assert_eq!(config.storage.data_dir, "data/blobs");
    }

    #[test]
    fn test_should_load_from_file() {
        let dir = tempfile::tempdir().expect("test tempdir");
        let path = dir.path().join("strata.toml");
        std::fs::write(&path, "[database]\npath = \"meta.db\"\n").expect("test write");

        let config = StrataConfig::from_toml_file(&path).expect("test load");
        assert_eq!(config.database.path, "meta.db");
        assert_eq!(config.database.connection_url(), "sqlite://meta.db?mode=rwc");
    }

    #[test]
    fn test_should_fail_on_missing_file() {
        let result = StrataConfig::from_toml_file("/nonexistent/strata.toml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_should_fail_on_malformed_file() {
        let dir = tempfile::tempdir().expect("test tempdir");
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[server\nport=").expect("test write");
        assert!(matches!(
            StrataConfig::from_toml_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_should_compute_gc_lock_ttl_floor() {
        let mut gc = GcConfig::default();
        gc.interval_secs = 120;
        // Half of two minutes is below the five-minute floor.
        assert_eq!(gc.lock_ttl(), Duration::from_secs(300));

        gc.interval_secs = 7200;
        assert_eq!(gc.lock_ttl(), Duration::from_secs(3600));
    }

    #[test]
    fn test_should_prefer_explicit_database_url() {
        let mut db = DatabaseConfig::default();
        db.url = Some("postgres://meta/strata".to_owned());
        assert_eq!(db.connection_url(), "postgres://meta/strata");
    }

    #[test]
    fn test_should_parse_bool_values() {
        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        assert!(parse_bool("TRUE"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool(""));
    }
}
