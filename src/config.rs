use crate::crd::DEFAULT_MAX_SCAN_ATTEMPTS;
use crate::secret_string::SecretString;
use anyhow::{Context, Result};
use globset::Glob;
use regex::Regex;
use serde::Deserialize;
use std::time::Duration;
use std::{env, fs, path::Path};
use tracing::info;

pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/imgscanner/config.yaml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub max_scan_attempts: usize,
    pub workers: usize,
    pub sync_timeout_seconds: u64,
    pub resync_schedule: String,
    pub webserver: Webserver,
    pub scanner: ScannerConfig,
    pub registries: Vec<Registry>,
    pub leader_election: LeaderElection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_scan_attempts: DEFAULT_MAX_SCAN_ATTEMPTS,
            workers: 1,
            sync_timeout_seconds: 60,
            resync_schedule: "0 * * * * *".to_string(),
            webserver: Webserver::default(),
            scanner: ScannerConfig::default(),
            registries: Vec::new(),
            leader_election: LeaderElection::default(),
        }
    }
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

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScannerConfig {
    pub trivy_path: String,
    pub severities: String,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            trivy_path: "/usr/local/bin/trivy".to_string(),
            severities: "MEDIUM,HIGH,CRITICAL".to_string(),
        }
    }
}

/// Static credentials for registries whose hostname matches the `hostname` glob.
#[derive(Debug, Clone, Deserialize)]
pub struct Registry {
    pub hostname: String,
    pub username: Option<String>,
    pub token: SecretString,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LeaderElection {
    pub lease_name: String,
    pub namespace: Option<String>,
    pub lease_duration_seconds: u64,
    pub renew_interval_seconds: u64,
}

impl Default for LeaderElection {
    fn default() -> Self {
        Self {
            lease_name: "imgscanner-leader-election".to_string(),
            namespace: None,
            lease_duration_seconds: 15,
            renew_interval_seconds: 5,
        }
    }
}

impl Config {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_seconds)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.max_scan_attempts > 0, "maxScanAttempts must be positive");
        anyhow::ensure!(self.workers > 0, "workers must be positive");
        anyhow::ensure!(self.sync_timeout_seconds > 0, "syncTimeoutSeconds must be positive");
        anyhow::ensure!(
            self.leader_election.renew_interval_seconds
                < self.leader_election.lease_duration_seconds,
            "leaderElection.renewIntervalSeconds must be lower than leaseDurationSeconds"
        );
        for registry in &self.registries {
            Glob::new(&registry.hostname).with_context(|| {
                format!("Invalid registry hostname pattern {}", registry.hostname)
            })?;
        }
        Ok(())
    }
}

/// Loads the config file named by `CONFIG_PATH`, falling back to the defaults when the file
/// does not exist.
pub fn load_from_env() -> Result<Config> {
    let path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    if !Path::new(&path).exists() {
        info!("Config file {} not found, using defaults", path);
        return Ok(Config::default());
    }
    load_config(path)
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;
    config.validate()?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error if any env var is missing.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable: {}", missing.join(", "));
    }

    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_expand_env_vars_success() {
        unsafe {
            env::set_var("IMGSCANNER_TEST_VAR", "value123");
        }
        let input = "This is a test: ${IMGSCANNER_TEST_VAR}";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, "This is a test: value123");
        unsafe {
            env::remove_var("IMGSCANNER_TEST_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_missing_var() {
        let input = "This will fail: ${IMGSCANNER_MISSING_VAR}";
        let err = expand_env_vars(input).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing environment variable: IMGSCANNER_MISSING_VAR"
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
        let yaml_content = r#"
        maxScanAttempts: 3
        workers: 2
        webserver:
          port: 9090
        scanner:
          severities: HIGH,CRITICAL
        registries:
          - hostname: "*.example.com"
            username: user
            token: secret_token
        leaderElection:
          namespace: scanners
        "#;

        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        let path = tmp_file.path();
        fs::write(path, yaml_content).expect("Failed to write to temp file");

        let config = load_config(path).expect("Should load config");

        assert_eq!(config.max_scan_attempts, 3);
        assert_eq!(config.workers, 2);
        assert_eq!(config.sync_timeout(), Duration::from_secs(60));
        assert_eq!(config.webserver.port, 9090);
        assert_eq!(config.scanner.severities, "HIGH,CRITICAL");
        assert_eq!(config.scanner.trivy_path, "/usr/local/bin/trivy");
        assert_eq!(config.registries.len(), 1);
        assert_eq!(config.registries[0].username.as_deref(), Some("user"));
        assert_eq!(config.registries[0].token.expose_secret(), "secret_token");
        assert_eq!(config.leader_election.namespace.as_deref(), Some("scanners"));
        assert_eq!(
            config.leader_election.lease_name,
            "imgscanner-leader-election"
        );
    }

    #[test]
    fn test_load_config_rejects_zero_attempts() {
        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        fs::write(tmp_file.path(), "maxScanAttempts: 0\n").unwrap();
        assert!(load_config(tmp_file.path()).is_err());
    }
}
