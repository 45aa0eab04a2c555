use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs, path::Path};
use tracing::level_filters::LevelFilter;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Kubernetes API server URL, the in-cluster or kubeconfig default when unset
    pub host: Option<String>,
    /// Namespace to scan, the client's default namespace when unset
    pub namespace: Option<String>,
    pub log_level: String,
    pub dry_run: bool,
    pub label_selector: String,
    /// Cron expression, a single pass is run when unset
    pub schedule: Option<String>,
    pub webserver: Webserver,
    pub gate: Gate,
    pub tls: Tls,
    /// Registry hosts reached over plain HTTP
    pub insecure_registries: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: None,
            namespace: None,
            log_level: "info".to_string(),
            dry_run: false,
            label_selector: "autoupdate".to_string(),
            schedule: None,
            webserver: Webserver::default(),
            gate: Gate::default(),
            tls: Tls::default(),
            insecure_registries: Vec::new(),
        }
    }
}

impl Config {
    pub fn log_level_filter(&self) -> Result<LevelFilter> {
        self.log_level
            .parse()
            .with_context(|| format!("Invalid log level {}", self.log_level))
    }

    fn validate(&self) -> Result<()> {
        let factor = self.gate.backoff_factor;
        if !factor.is_finite() || factor < 1.0 {
            anyhow::bail!("gate.backoffFactor must be a finite number >= 1, got {}", factor);
        }
        Ok(())
    }

    pub fn is_insecure_registry(&self, host: &str) -> bool {
        self.insecure_registries.iter().any(|h| h == host)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Webserver {
    pub port: u16,
}

impl Default for Webserver {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Gate {
    pub poll_interval_seconds: u64,
    pub max_poll_interval_seconds: u64,
    pub backoff_factor: f64,
    pub timeout_seconds: u64,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 3,
            max_poll_interval_seconds: 30,
            backoff_factor: 1.0,
            timeout_seconds: 1800,
        }
    }
}

impl Gate {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_secs(self.max_poll_interval_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tls {
    pub ca_certificate_paths: Vec<PathBuf>,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;
    config.validate()?;

    Ok(config)
}

/// Loads the file named by `CONFIG_PATH`, or the defaults when it is not set.
pub fn load_from_env() -> Result<(Config, Option<PathBuf>)> {
    match env::var_os("CONFIG_PATH") {
        Some(path) => {
            let path = PathBuf::from(path);
            Ok((load_config(&path)?, Some(path)))
        }
        None => Ok((Config::default(), None)),
    }
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming the first missing variable.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    if let Some(missing) = re
        .captures_iter(input)
        .map(|caps| caps[1].to_string())
        .find(|name| env::var(name).is_err())
    {
        anyhow::bail!("Missing environment variable: {}", missing);
    }

    let result = re.replace_all(input, |caps: &regex::Captures| {
        env::var(&caps[1]).unwrap_or_default()
    });

    Ok(result.into_owned())
}
