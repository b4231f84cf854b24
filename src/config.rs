//! Runtime configuration from `ORGANGUARD_*` environment variables.
//!
//! Every setting has a default; an unparsable value is ignored (with a
//! warning) rather than failing startup. Secrets are never read here, see
//! [`crate::adapters::keyring`].

use std::path::PathBuf;

use crate::adapters::sanitize::DEFAULT_SANITIZE_MAX_BYTES;
use crate::application::permissions::PermissionMatrix;
use crate::domain::UrgencyThresholds;

pub const DB_PATH_ENV: &str = "ORGANGUARD_DB_PATH";
pub const PERMISSIONS_FILE_ENV: &str = "ORGANGUARD_PERMISSIONS_FILE";
pub const KEY_VERSION_ENV: &str = "ORGANGUARD_KEY_VERSION";
pub const INSTALLATION_SALT_ENV: &str = "ORGANGUARD_INSTALLATION_SALT";
pub const URGENCY_CRITICAL_ENV: &str = "ORGANGUARD_URGENCY_CRITICAL_HOURS";
pub const URGENCY_WARNING_ENV: &str = "ORGANGUARD_URGENCY_WARNING_HOURS";
pub const LOCKOUT_THRESHOLD_ENV: &str = "ORGANGUARD_LOCKOUT_THRESHOLD";
pub const BACKUPS_ENV: &str = "ORGANGUARD_BACKUPS_CONFIGURED";
pub const MFA_ENV: &str = "ORGANGUARD_MFA_CONFIGURED";
pub const MONITORING_ENV: &str = "ORGANGUARD_MONITORING_ENDPOINT";
pub const LOG_MODE_ENV: &str = "ORGANGUARD_LOG_MODE";
pub const LOG_FILE_ENV: &str = "ORGANGUARD_LOG_FILE";
pub const SANITIZE_MAX_BYTES_ENV: &str = "ORGANGUARD_SANITIZE_MAX_BYTES";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read permissions file {}: {source}", path.display())]
    PermissionsFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid permission matrix: {0}")]
    InvalidPermissions(String),
}

/// Where log output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogMode {
    /// File when attached to a terminal, console otherwise.
    #[default]
    Auto,
    File,
    /// Standard error; standard output is kept for command output.
    Console,
}

/// Operational controls reported by the compliance self-check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ComplianceSettings {
    pub backups_configured: bool,
    pub mfa_configured: bool,
    pub monitoring_endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub db_path: PathBuf,
    /// Permission matrix document; the built-in matrix when unset.
    pub permissions_file: Option<PathBuf>,
    pub key_version: u32,
    pub installation_salt: String,
    pub urgency: UrgencyThresholds,
    /// Consecutive failed logins before a lockout event is recorded.
    pub lockout_threshold: u32,
    pub compliance: ComplianceSettings,
    pub log_mode: LogMode,
    pub log_file: PathBuf,
    /// Bytes of each log line scanned by the sanitizer.
    pub sanitize_max_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/app/data/organguard.db"),
            permissions_file: None,
            key_version: 1,
            installation_salt: "organguard".to_string(),
            urgency: UrgencyThresholds::default(),
            lockout_threshold: 5,
            compliance: ComplianceSettings::default(),
            log_mode: LogMode::Auto,
            log_file: PathBuf::from("/app/data/organguard.log"),
            sanitize_max_bytes: DEFAULT_SANITIZE_MAX_BYTES,
        }
    }
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_hours(v: &str) -> Option<f64> {
    v.trim().parse::<f64>().ok().filter(|x| x.is_finite() && *x > 0.0)
}

impl Config {
    /// Defaults overridden by the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        let ignored = |var: &str| tracing::warn!(var, "Ignoring invalid configuration value");

        if let Some(v) = lookup(DB_PATH_ENV).filter(|v| !v.trim().is_empty()) {
            cfg.db_path = PathBuf::from(v.trim());
        }

        if let Some(v) = lookup(PERMISSIONS_FILE_ENV).filter(|v| !v.trim().is_empty()) {
            cfg.permissions_file = Some(PathBuf::from(v.trim()));
        }

        if let Some(v) = lookup(KEY_VERSION_ENV) {
            match v.trim().parse::<u32>() {
                Ok(x) if x > 0 => cfg.key_version = x,
                _ => ignored(KEY_VERSION_ENV),
            }
        }

        if let Some(v) = lookup(INSTALLATION_SALT_ENV).filter(|v| !v.trim().is_empty()) {
            cfg.installation_salt = v.trim().to_string();
        }

        let mut urgency = cfg.urgency;
        match lookup(URGENCY_CRITICAL_ENV).map(|v| parse_hours(&v)) {
            Some(Some(h)) => urgency.critical_hours = h,
            Some(None) => ignored(URGENCY_CRITICAL_ENV),
            None => {}
        }
        match lookup(URGENCY_WARNING_ENV).map(|v| parse_hours(&v)) {
            Some(Some(h)) => urgency.warning_hours = h,
            Some(None) => ignored(URGENCY_WARNING_ENV),
            None => {}
        }
        if urgency.critical_hours < urgency.warning_hours {
            cfg.urgency = urgency;
        } else {
            ignored(URGENCY_WARNING_ENV);
        }

        if let Some(v) = lookup(LOCKOUT_THRESHOLD_ENV) {
            match v.trim().parse::<u32>() {
                Ok(x) if x > 0 => cfg.lockout_threshold = x,
                _ => ignored(LOCKOUT_THRESHOLD_ENV),
            }
        }

        if let Some(v) = lookup(BACKUPS_ENV) {
            match parse_flag(&v) {
                Some(b) => cfg.compliance.backups_configured = b,
                None => ignored(BACKUPS_ENV),
            }
        }

        if let Some(v) = lookup(MFA_ENV) {
            match parse_flag(&v) {
                Some(b) => cfg.compliance.mfa_configured = b,
                None => ignored(MFA_ENV),
            }
        }

        cfg.compliance.monitoring_endpoint = lookup(MONITORING_ENV)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        if let Some(v) = lookup(LOG_MODE_ENV) {
            cfg.log_mode = match v.trim() {
                "file" => LogMode::File,
                "stdout" | "stderr" | "console" => LogMode::Console,
                _ => LogMode::Auto,
            };
        }

        if let Some(v) = lookup(LOG_FILE_ENV).filter(|v| !v.trim().is_empty()) {
            cfg.log_file = PathBuf::from(v.trim());
        }

        if let Some(v) = lookup(SANITIZE_MAX_BYTES_ENV) {
            match v.trim().parse::<usize>() {
                Ok(x) if x > 0 => cfg.sanitize_max_bytes = x,
                _ => ignored(SANITIZE_MAX_BYTES_ENV),
            }
        }

        cfg
    }

    /// The configured permission matrix document, or the built-in one.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read or parsed.
    pub fn load_permissions(&self) -> Result<PermissionMatrix, ConfigError> {
        let Some(path) = &self.permissions_file else {
            return Ok(PermissionMatrix::standard());
        };

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::PermissionsFile {
            path: path.clone(),
            source,
        })?;
        PermissionMatrix::from_json(&text)
    }
}
