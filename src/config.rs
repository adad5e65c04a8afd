use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::{env, fs, path::Path};
use tracing::{info, warn};

use crate::event::DEFAULT_QUEUE_CAPACITY;
use crate::repository::RepositoryServiceOptions;

pub static CONTROLLER_KINDS: [&str; 3] = ["deployment", "configmap", "job"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub webserver: Webserver,
    pub repository: RepositoryServiceOptions,
    pub event_bus: EventBus,
    /// Controllers started for every managed namespace, in this order.
    pub controllers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            webserver: Webserver::default(),
            repository: RepositoryServiceOptions::default(),
            event_bus: EventBus::default(),
            controllers: CONTROLLER_KINDS.iter().map(|kind| kind.to_string()).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Webserver {
    pub host: String,
    pub port: u16,
}

impl Default for Webserver {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9080,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EventBus {
    pub capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.repository.validate()?;

        if self.event_bus.capacity == 0 {
            anyhow::bail!("eventBus.capacity must be greater than 0");
        }

        let mut seen = HashSet::new();
        for kind in &self.controllers {
            if !CONTROLLER_KINDS.contains(&kind.as_str()) {
                anyhow::bail!(
                    "Unknown controller {}, expected one of {:?}",
                    kind,
                    CONTROLLER_KINDS
                );
            }
            if !seen.insert(kind) {
                anyhow::bail!("Controller {} is listed more than once", kind);
            }
        }
        Ok(())
    }
}

/// Loads the config file, or the defaults if there is none.
pub fn load_config_or_default<P: AsRef<Path>>(path: P) -> Result<Config> {
    if !path.as_ref().exists() {
        warn!(
            "Config file {} does not exist, using defaults",
            path.as_ref().display()
        );
        return Ok(Config::default());
    }
    load_config(path)
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming every missing variable.
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
