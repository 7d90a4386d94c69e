//! Runtime configuration.
//!
//! Every value has a default so an empty TOML document is a valid
//! configuration. Environment variables are applied on top of the file.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AdmiralError, Result};

pub const ENV_WAIT_RETRY: &str = "ADMIRAL_PROVISION_WAIT_RETRY";
pub const ENV_WAIT_DELAY_SECONDS: &str = "ADMIRAL_PROVISION_WAIT_DELAY_SECONDS";
pub const ENV_SELF_DELETE: &str = "ADMIRAL_TASK_SELF_DELETE";
pub const ENV_LOG_LEVEL: &str = "ADMIRAL_LOG_LEVEL";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdmiralConfig {
    pub orchestrator: OrchestratorConfig,
    pub provisioning: ProvisioningConfig,
    pub logging: LoggingConfig,
}

/// Settings of the task engine itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Delete the task document once it reached FINISHED or FAILED.
    pub self_delete: bool,
    /// How often a terminal request-tracker update is retried.
    pub tracker_retries: u32,
    pub tracker_retry_interval_ms: u64,
    /// `info` or `debug`: level of the per-transition log line.
    pub transition_log_level: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            self_delete: false,
            tracker_retries: 3,
            tracker_retry_interval_ms: 3_000,
            transition_log_level: "info".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn tracker_retry_interval(&self) -> Duration {
        Duration::from_millis(self.tracker_retry_interval_ms)
    }

    pub fn log_transitions_at_debug(&self) -> bool {
        self.transition_log_level.eq_ignore_ascii_case("debug")
    }
}

/// Settings of the self-provisioning task.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Re-checks of a freshly provisioned host before giving up.
    pub wait_retries: u32,
    pub wait_delay_secs: u64,
    pub placement_max_instances: u32,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            wait_retries: 30,
            wait_delay_secs: 20,
            placement_max_instances: 10,
        }
    }
}

impl ProvisioningConfig {
    pub fn wait_delay(&self) -> Duration {
        Duration::from_secs(self.wait_delay_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AdmiralConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Read a TOML file and apply the process environment on top of it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AdmiralError::Config(format!("{}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Defaults plus the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_WAIT_RETRY) {
            self.provisioning.wait_retries = parse_env(ENV_WAIT_RETRY, &v)?;
        }
        if let Some(v) = lookup(ENV_WAIT_DELAY_SECONDS) {
            self.provisioning.wait_delay_secs = parse_env(ENV_WAIT_DELAY_SECONDS, &v)?;
        }
        if let Some(v) = lookup(ENV_SELF_DELETE) {
            self.orchestrator.self_delete = parse_env(ENV_SELF_DELETE, &v)?;
        }
        if let Some(v) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = v;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| AdmiralError::Config(format!("{key}={value}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_document_yields_defaults() {
        let config = AdmiralConfig::from_toml_str("").unwrap();
        assert_eq!(config.provisioning.wait_retries, 30);
        assert_eq!(config.provisioning.wait_delay(), Duration::from_secs(20));
        assert!(!config.orchestrator.self_delete);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = AdmiralConfig::from_toml_str(
            r#"
            [provisioning]
            wait_retries = 5

            [orchestrator]
            self_delete = true
            "#,
        )
        .unwrap();
        assert_eq!(config.provisioning.wait_retries, 5);
        assert_eq!(config.provisioning.wait_delay_secs, 20);
        assert!(config.orchestrator.self_delete);
        assert_eq!(config.orchestrator.tracker_retries, 3);
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_WAIT_RETRY, "2"),
            (ENV_WAIT_DELAY_SECONDS, "1"),
            (ENV_LOG_LEVEL, "debug"),
        ]);
        let mut config = AdmiralConfig::default();
        config
            .apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.provisioning.wait_retries, 2);
        assert_eq!(config.provisioning.wait_delay_secs, 1);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn malformed_environment_value_is_a_config_error() {
        let mut config = AdmiralConfig::default();
        let err = config
            .apply_env_overrides(|k| (k == ENV_WAIT_RETRY).then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, AdmiralError::Config(_)));
    }
}
