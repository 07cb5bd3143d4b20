//! TOML configuration for tablewatch.
//!
//! Layered lookup: an explicit path, then the `TABLEWATCH_CONFIG` environment
//! variable, then `./tablewatch.toml`, then compiled-in defaults. Every section
//! is `#[serde(default)]` so partial files are fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::control::{RetryPolicy, Service};
use crate::detect::correlate::CorrelationSettings;
use crate::focus::StoreSettings;
use crate::investigation::InvestigationSettings;
use crate::verify::VerificationSettings;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "TABLEWATCH_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG: &str = "tablewatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub investigation: InvestigationConfig,
    #[serde(default)]
    pub verification: VerificationSettings,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub client_bridge: ClientBridgeConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MonitorConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve configuration. An explicit path must load; the environment and
    /// working-directory candidates fall through to defaults with a warning.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "{} set but file could not be loaded, trying fallback",
                        CONFIG_ENV
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.log.poll_interval_ms == 0 {
            bail!("log.poll_interval_ms must be greater than zero");
        }
        let c = &self.investigation.correlation;
        for (name, value) in [
            ("related_similarity", c.related_similarity),
            ("duplicate_similarity", c.duplicate_similarity),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("investigation.correlation.{} must be within 0.0..=1.0, got {}", name, value);
            }
        }
        if self.control.retry_attempts == 0 {
            bail!("control.retry_attempts must be at least 1");
        }
        if self.control.call_timeout_secs == 0 {
            bail!("control.call_timeout_secs must be greater than zero");
        }
        if self.verification.restart_grace_secs == 0 || self.verification.restart_timeout_secs == 0 {
            bail!("verification.restart_grace_secs and verification.restart_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn investigation_settings(&self) -> InvestigationSettings {
        InvestigationSettings {
            enabled: self.investigation.enabled,
            timeout_seconds: self.investigation.timeout_seconds,
        }
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            correlation: self.investigation.correlation.clone(),
            duplicate_window_seconds: self.investigation.duplicate_window_seconds,
            failed_attempt_warning: self.investigation.failed_attempt_warning,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.control.retry_attempts,
            call_timeout: Duration::from_secs(self.control.call_timeout_secs),
            backoff: Duration::from_millis(self.control.backoff_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Log stream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log file to tail.
    pub path: PathBuf,
    /// How often the file is polled for new data.
    pub poll_interval_ms: u64,
    /// Skip content already in the file at startup.
    pub start_at_end: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logs/game-server.log"),
            poll_interval_ms: 500,
            start_at_end: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Investigation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvestigationConfig {
    /// When false (or timeout is 0) severe issues pause immediately.
    pub enabled: bool,
    /// Investigation window length.
    pub timeout_seconds: u64,
    /// Window for the "same problem seen recently" duplicate check.
    pub duplicate_window_seconds: u64,
    /// Surface a warning once this many fix attempts have failed.
    pub failed_attempt_warning: usize,
    pub correlation: CorrelationSettings,
}

impl Default for InvestigationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: 15,
            duplicate_window_seconds: 300,
            failed_attempt_warning: 5,
            correlation: CorrelationSettings::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Services and control
// ---------------------------------------------------------------------------

/// How to reach one collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceEndpoint {
    /// HTTP endpoint returning 2xx when healthy. Unset means "assume healthy".
    pub health_url: Option<String>,
    /// Program and arguments used to restart the service.
    pub restart_command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub database: ServiceEndpoint,
    pub server: ServiceEndpoint,
    pub client: ServiceEndpoint,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            database: ServiceEndpoint::default(),
            server: ServiceEndpoint {
                health_url: Some("http://127.0.0.1:3000/api/health".to_string()),
                restart_command: Vec::new(),
            },
            client: ServiceEndpoint::default(),
        }
    }
}

impl ServicesConfig {
    pub fn endpoint(&self, service: Service) -> &ServiceEndpoint {
        match service {
            Service::Database => &self.database,
            Service::Server => &self.server,
            Service::Client => &self.client,
        }
    }
}

/// HTTP bridge into the running client used for pause/resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientBridgeConfig {
    pub pause_url: Option<String>,
    pub resume_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub call_timeout_secs: u64,
    pub retry_attempts: u32,
    pub backoff_ms: u64,
    /// Background health poll feeding the snapshot's service metrics. 0 disables it.
    pub health_poll_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 5,
            retry_attempts: 3,
            backoff_ms: 500,
            health_poll_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Paths, API, logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Status snapshot written for external viewers.
    pub status_file: PathBuf,
    /// Where collaborators drop fix descriptors.
    pub fix_file: PathBuf,
    /// SQLite database with issue and fix-attempt history.
    pub database: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            status_file: PathBuf::from("data/status.json"),
            fix_file: PathBuf::from("data/fix-applied.json"),
            database: PathBuf::from("data/tablewatch.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:7340".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = MonitorConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.investigation.timeout_seconds, 15);
        assert_eq!(cfg.investigation.correlation.window_seconds, 30);
        assert_eq!(cfg.verification.base_critical_secs, 90);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let cfg: MonitorConfig = toml::from_str(
            r#"
            [log]
            path = "/tmp/server.log"

            [investigation]
            timeout_seconds = 20

            [services.client]
            restart_command = ["./restart-client.sh", "--quiet"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.log.path, PathBuf::from("/tmp/server.log"));
        assert_eq!(cfg.log.poll_interval_ms, 500);
        assert_eq!(cfg.investigation.timeout_seconds, 20);
        assert!(cfg.investigation.enabled);
        assert_eq!(cfg.services.client.restart_command.len(), 2);
        assert_eq!(cfg.api.bind, "127.0.0.1:7340");
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let mut cfg = MonitorConfig::default();
        cfg.investigation.correlation.duplicate_similarity = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_restart_budget_rejected() {
        let mut cfg = MonitorConfig::default();
        cfg.verification.restart_grace_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tablewatch.toml");
        std::fs::write(&path, "[logging]\nformat = \"json\"\n").unwrap();
        let cfg = MonitorConfig::resolve(Some(&path)).unwrap();
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_default_round_trips_through_toml() {
        let text = toml::to_string_pretty(&MonitorConfig::default()).unwrap();
        let back: MonitorConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.paths.fix_file, PathBuf::from("data/fix-applied.json"));
    }
}
