//! Environment-driven framework configuration.
//!
//! Configuration is read once from environment variables into an immutable
//! [`Config`] held in a process-wide container. Call [`current`] anywhere to
//! get the active configuration; [`install`] replaces it at startup and
//! [`reset`] re-reads the environment, which is the documented seam for
//! tests that need to vary settings.

use std::{path::PathBuf, sync::Arc, time::Duration};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Deployment mode derived from `APP_ENV` (or legacy `CRYSTAL_ENV`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Development,
    Production,
}

impl Mode {
    pub fn is_development(self) -> bool {
        matches!(self, Mode::Development)
    }
}

/// Upload handling settings (`UPLOAD_*` variables).
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Maximum accepted size for a single uploaded file, in bytes.
    pub max_file_size: u64,
    /// Directory temp files are spilled into.
    pub temp_dir: PathBuf,
    /// Copy buffer size used while spilling multipart parts to disk.
    pub buffer_size: usize,
    /// How often the reaper scans the temp directory.
    pub cleanup_interval: Duration,
    /// Temp files older than this are deleted by the reaper.
    pub max_temp_age: Duration,
}

/// Framework configuration snapshot.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub port_reuse: bool,
    pub mode: Mode,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
    pub ssl_ca: Option<String>,
    pub ssl_mode: Option<String>,
    pub templates_path: String,
    /// Template rendered by the rescuer's development exception page, when set.
    pub error_template: Option<String>,
    pub upload: UploadConfig,
    /// Requests slower than this are logged as warnings by the monitor.
    pub slow_request_threshold: Duration,
    /// Memory deltas larger than this (bytes) are logged as warnings.
    pub memory_threshold: u64,
}

impl Config {
    /// Builds a configuration from the process environment, falling back to
    /// development defaults for anything unset.
    pub fn from_env() -> Self {
        let mode = match env_str("APP_ENV")
            .or_else(|| env_str("CRYSTAL_ENV"))
            .as_deref()
        {
            Some("production") | Some("prod") => Mode::Production,
            _ => Mode::Development,
        };

        Self {
            host: env_str("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env_parse("PORT").unwrap_or(4000),
            port_reuse: env_parse("PORT_REUSE").unwrap_or(false),
            mode,
            ssl_cert: env_str("SSL_CERT"),
            ssl_key: env_str("SSL_KEY"),
            ssl_ca: env_str("SSL_CA"),
            ssl_mode: env_str("SSL_MODE"),
            templates_path: env_str("TEMPLATES_PATH").unwrap_or_else(|| "templates".to_string()),
            error_template: env_str("ERROR_TEMPLATE"),
            upload: UploadConfig {
                max_file_size: env_parse("UPLOAD_MAX_FILE_SIZE").unwrap_or(10 * 1024 * 1024),
                temp_dir: env_str("UPLOAD_TEMP_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(std::env::temp_dir),
                buffer_size: env_parse("UPLOAD_BUFFER_SIZE").unwrap_or(8192),
                cleanup_interval: Duration::from_secs(
                    env_parse("UPLOAD_CLEANUP_INTERVAL").unwrap_or(3600),
                ),
                max_temp_age: Duration::from_secs(
                    env_parse("UPLOAD_MAX_TEMP_AGE").unwrap_or(3600),
                ),
            },
            slow_request_threshold: Duration::from_millis(
                env_parse("PERFORMANCE_SLOW_REQUEST_THRESHOLD").unwrap_or(1000),
            ),
            memory_threshold: env_parse("PERFORMANCE_MEMORY_THRESHOLD")
                .unwrap_or(50 * 1024 * 1024),
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_str(key).and_then(|v| v.parse().ok())
}

static CURRENT: Lazy<RwLock<Arc<Config>>> =
    Lazy::new(|| RwLock::new(Arc::new(Config::from_env())));

/// Returns the active configuration.
pub fn current() -> Arc<Config> {
    CURRENT.read().clone()
}

/// Replaces the active configuration. Call once during startup.
pub fn install(config: Config) {
    *CURRENT.write() = Arc::new(config);
}

/// Re-reads configuration from the environment. Test seam.
pub fn reset() {
    *CURRENT.write() = Arc::new(Config::from_env());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_development_shaped() {
        let config = Config::from_env();
        assert_eq!(config.templates_path, "templates");
        assert!(config.upload.max_file_size > 0);
        assert!(config.slow_request_threshold > Duration::ZERO);
    }

    #[test]
    fn install_replaces_current() {
        let mut config = Config::from_env();
        config.port = 9099;
        install(config);
        assert_eq!(current().port, 9099);
        reset();
    }
}
