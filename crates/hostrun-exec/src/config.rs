//! Connection options shared by every member of a fleet

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::keys::KeySource;

/// Prompt passed to `sudo -p` and watched for in its output
pub const DEFAULT_SUDO_PROMPT: &str = "[sudo] password: ";

/// Options used to open a channel and to escalate over it
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Default login user when the target names none
    #[serde(default)]
    pub user: Option<String>,
    /// Default port when the target names none
    #[serde(default)]
    pub port: Option<u16>,
    /// Path to an SSH private key
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// Environment variable holding a base64-encoded private key
    #[serde(default)]
    pub key_env: Option<String>,
    /// Passphrase for the private key
    #[serde(default)]
    pub key_passphrase: Option<String>,
    /// Password for password authentication
    #[serde(default)]
    pub password: Option<String>,
    /// Seconds to wait for channel establishment
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    /// Privilege escalation settings
    #[serde(default)]
    pub sudo: SudoConfig,
}

/// Default seconds to wait for channel establishment
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

impl ConnectOptions {
    /// Time bound for `open()`
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(
            self.connect_timeout_secs
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        )
    }

    /// Where to get the private key from
    #[must_use]
    pub fn key_source(&self) -> KeySource {
        if let Some(path) = &self.key_path {
            KeySource::Path(path.clone())
        } else if let Some(var) = &self.key_env {
            KeySource::Env(var.clone())
        } else {
            KeySource::DefaultFiles
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("user", &self.user)
            .field("port", &self.port)
            .field("key_path", &self.key_path)
            .field("key_env", &self.key_env)
            .field("key_passphrase", &redacted(self.key_passphrase.as_ref()))
            .field("password", &redacted(self.password.as_ref()))
            .field("connect_timeout", &self.connect_timeout())
            .field("sudo", &self.sudo)
            .finish()
    }
}

/// Sudo escalation settings
#[derive(Clone, Serialize, Deserialize)]
pub struct SudoConfig {
    /// Password written when sudo prompts
    #[serde(default)]
    pub password: Option<String>,
    /// Prompt text handed to `sudo -p`
    #[serde(default = "default_prompt")]
    pub prompt: String,
    /// Run as this user instead of root
    #[serde(default)]
    pub user: Option<String>,
    /// How long to wait for the prompt before assuming password-less sudo
    #[serde(default = "default_detection_window_ms")]
    pub detection_window_ms: u64,
    /// How much output to scan for the prompt
    #[serde(default = "default_detection_window_bytes")]
    pub detection_window_bytes: usize,
}

fn default_prompt() -> String {
    DEFAULT_SUDO_PROMPT.to_string()
}

fn default_detection_window_ms() -> u64 {
    1000
}

fn default_detection_window_bytes() -> usize {
    8192
}

impl SudoConfig {
    /// Time window for prompt detection
    #[must_use]
    pub fn detection_window(&self) -> Duration {
        Duration::from_millis(self.detection_window_ms)
    }
}

impl Default for SudoConfig {
    fn default() -> Self {
        Self {
            password: None,
            prompt: default_prompt(),
            user: None,
            detection_window_ms: default_detection_window_ms(),
            detection_window_bytes: default_detection_window_bytes(),
        }
    }
}

impl fmt::Debug for SudoConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SudoConfig")
            .field("password", &redacted(self.password.as_ref()))
            .field("prompt", &self.prompt)
            .field("user", &self.user)
            .field("detection_window_ms", &self.detection_window_ms)
            .field("detection_window_bytes", &self.detection_window_bytes)
            .finish()
    }
}

fn redacted(secret: Option<&String>) -> Option<&'static str> {
    secret.map(|_| "<redacted>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let options: ConnectOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options.connect_timeout(), Duration::from_secs(10));
        assert_eq!(options.sudo.prompt, DEFAULT_SUDO_PROMPT);
        assert_eq!(options.sudo.detection_window(), Duration::from_secs(1));
        assert!(matches!(options.key_source(), KeySource::DefaultFiles));
    }

    #[test]
    fn test_key_path_wins_over_env() {
        let options = ConnectOptions {
            key_path: Some(PathBuf::from("/keys/id")),
            key_env: Some("DEPLOY_KEY".to_string()),
            ..ConnectOptions::default()
        };
        assert!(matches!(options.key_source(), KeySource::Path(p) if p == PathBuf::from("/keys/id")));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let options = ConnectOptions {
            password: Some("hunter2".to_string()),
            sudo: SudoConfig {
                password: Some("s3cret".to_string()),
                ..SudoConfig::default()
            },
            ..ConnectOptions::default()
        };
        let debug = format!("{options:?}");
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("<redacted>"));
    }
}
