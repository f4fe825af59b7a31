use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs, path::Path};
use tracing::info;

pub static DEFAULT_CONFIG_PATH: &str = "/etc/kube-agent-updater/config.yaml";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub webserver: Webserver,
    /// Minimum time between two update cycles of the same instance
    #[serde(default = "default_update_interval_seconds")]
    pub update_interval_seconds: u64,
    /// Schedule on which all instances are re-checked, in addition to watch events
    #[serde(default = "default_cron_schedule")]
    pub cron_schedule: String,
    #[serde(default = "default_registry_timeout_seconds")]
    pub registry_timeout_seconds: u64,
    /// Registries queried over plain HTTP
    #[serde(default)]
    pub insecure_registries: Vec<String>,
    #[serde(default)]
    pub tls: Tls,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

impl Default for Webserver {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tls {
    #[serde(default)]
    pub ca_certificate_paths: Vec<PathBuf>,
}

fn default_update_interval_seconds() -> u64 {
    15 * 60
}

fn default_cron_schedule() -> String {
    "0 */5 * * * *".to_string()
}

fn default_registry_timeout_seconds() -> u64 {
    30
}

impl Config {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_seconds)
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.registry_timeout_seconds)
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    if config.update_interval_seconds == 0 {
        anyhow::bail!("updateIntervalSeconds must be greater than zero");
    }

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming the first missing variable.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| var_name.to_string());
            String::new()
        })
    });

    match missing {
        Some(var_name) => Err(anyhow!("Missing environment variable: {}", var_name)),
        None => Ok(result.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_expand_env_vars_success() {
        unsafe {
            env::set_var("UPDATER_TEST_VAR", "value123");
        }
        let input = "This is a test: ${UPDATER_TEST_VAR}";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, "This is a test: value123");
        unsafe {
            env::remove_var("UPDATER_TEST_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_missing_var() {
        let input = "This will fail: ${UPDATER_MISSING_VAR}";
        let err = expand_env_vars(input).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing environment variable: UPDATER_MISSING_VAR"
        );
    }

    #[test]
    fn test_expand_env_vars_no_vars() {
        let input = "No variables here";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, input);
    }

    #[test]
    fn test_load_config_file() {
        unsafe {
            env::set_var("UPDATER_TEST_REGISTRY", "registry.local:5000");
        }
        let yaml_content = r#"
        webserver:
          port: 9090
        updateIntervalSeconds: 600
        cronSchedule: "0 * * * * *"
        registryTimeoutSeconds: 10
        insecureRegistries:
          - ${UPDATER_TEST_REGISTRY}
        tls:
          caCertificatePaths:
            - /etc/ssl/custom/ca.pem
        "#;

        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        let path = tmp_file.path();
        fs::write(path, yaml_content).expect("Failed to write to temp file");

        let config = load_config(path).expect("Should load config");
        unsafe {
            env::remove_var("UPDATER_TEST_REGISTRY");
        }

        assert_eq!(config.webserver.port, 9090);
        assert_eq!(config.update_interval(), Duration::from_secs(600));
        assert_eq!(config.cron_schedule, "0 * * * * *");
        assert_eq!(config.registry_timeout(), Duration::from_secs(10));
        assert_eq!(config.insecure_registries, vec!["registry.local:5000"]);
        assert_eq!(
            config.tls.ca_certificate_paths,
            vec![PathBuf::from("/etc/ssl/custom/ca.pem")]
        );
    }

    #[test]
    fn test_load_config_defaults() {
        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        fs::write(tmp_file.path(), "{}").expect("Failed to write to temp file");

        let config = load_config(tmp_file.path()).expect("Should load config");

        assert_eq!(config.webserver.port, 8080);
        assert_eq!(config.update_interval(), Duration::from_secs(900));
        assert_eq!(config.cron_schedule, "0 */5 * * * *");
        assert!(config.insecure_registries.is_empty());
        assert!(config.tls.ca_certificate_paths.is_empty());
    }

    #[test]
    fn test_load_config_rejects_zero_interval() {
        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        fs::write(tmp_file.path(), "updateIntervalSeconds: 0").expect("Failed to write");

        assert!(load_config(tmp_file.path()).is_err());
    }
}
