//! Configuration loading and types

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use hostrun_exec::ConnectOptions;
use hostrun_exec::group::DEFAULT_CONCURRENCY;
use serde::{Deserialize, Serialize};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "HOSTRUN_CONFIG";

/// Environment variable holding the sudo password
pub const SUDO_PASSWORD_ENV: &str = "HOSTRUN_SUDO_PASSWORD";

/// Top-level configuration, read from `hostrun.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Hosts executing at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Connection options applied to every host
    #[serde(default)]
    pub defaults: ConnectOptions,
    /// Named hosts
    #[serde(default)]
    pub host: Vec<HostEntry>,
}

/// A named host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEntry {
    /// Alias used on the command line
    pub name: String,
    /// `[user@]host[:port]`
    pub target: String,
    /// Tags for selecting groups of hosts
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            concurrency: default_concurrency(),
            defaults: ConnectOptions::default(),
            host: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("cannot read {}: {e}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("cannot parse {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Load from an explicit path, the default paths, or use defaults
    ///
    /// # Errors
    /// Returns error if a config file exists but is invalid
    pub fn load_default(explicit: Option<&Path>) -> eyre::Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        // Check environment variable
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(&PathBuf::from(path));
        }

        let paths = [
            Some(PathBuf::from("hostrun.toml")),
            dirs::config_dir().map(|p| p.join("hostrun").join("hostrun.toml")),
        ];

        for path in paths.into_iter().flatten() {
            if path.exists() {
                return Self::load(&path);
            }
        }

        tracing::debug!("no config file found, using defaults");
        Ok(Config::default())
    }

    /// Connection defaults with the sudo password taken from the environment
    /// when the file sets none
    pub fn connect_options(&self) -> ConnectOptions {
        let mut options = self.defaults.clone();
        if options.sudo.password.is_none()
            && let Ok(password) = std::env::var(SUDO_PASSWORD_ENV)
        {
            options.sudo.password = Some(password);
        }
        options
    }

    /// Turn `-H` names and `-t` tags into target strings
    ///
    /// Aliases map to their target; anything else is taken as a target
    /// string. Tagged hosts follow in config order, skipping ones already
    /// named.
    pub fn resolve(&self, hosts: &[String], tags: &[String]) -> Vec<String> {
        let mut selected: Vec<String> = hosts
            .iter()
            .map(|name| {
                self.host
                    .iter()
                    .find(|entry| &entry.name == name)
                    .map_or_else(|| name.clone(), |entry| entry.target.clone())
            })
            .collect();

        if !tags.is_empty() {
            let mut seen: HashSet<String> = selected.iter().cloned().collect();
            for entry in &self.host {
                if entry.tags.iter().any(|t| tags.contains(t)) && seen.insert(entry.target.clone())
                {
                    selected.push(entry.target.clone());
                }
            }
        }

        selected
    }
}
