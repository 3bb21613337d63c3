//! SSH key management and resolution

use std::env;
use std::path::{Path, PathBuf};

use russh::keys::{PrivateKey, decode_secret_key, load_secret_key};
use tracing::debug;

/// Identity files tried when no key is configured, in order
const DEFAULT_IDENTITY_FILES: [&str; 3] = ["id_ed25519", "id_ecdsa", "id_rsa"];

/// SSH key resolution strategy
#[derive(Debug, Clone)]
pub enum KeySource {
    /// Explicit path to key file
    Path(PathBuf),
    /// Base64-encoded key from environment
    Env(String),
    /// Whatever default identity files exist under `~/.ssh`
    DefaultFiles,
}

impl KeySource {
    /// Load every private key this source yields
    ///
    /// `DefaultFiles` yields an empty list when no identity file exists.
    ///
    /// # Errors
    /// Returns `KeyError` if an explicitly configured key cannot be loaded
    pub fn load(&self, passphrase: Option<&str>) -> Result<Vec<PrivateKey>, KeyError> {
        match self {
            KeySource::Path(path) => {
                if !path.exists() {
                    return Err(KeyError::NotFound(path.display().to_string()));
                }
                validate_key_permissions(path)?;
                let key = load_secret_key(path, passphrase)
                    .map_err(|e| KeyError::Decode(e.to_string()))?;
                Ok(vec![key])
            }
            KeySource::Env(var_name) => {
                let base64_key =
                    env::var(var_name).map_err(|_| KeyError::EnvNotSet(var_name.clone()))?;
                let key_data = base64_decode(&base64_key).map_err(|_| KeyError::InvalidBase64)?;
                let text = String::from_utf8(key_data).map_err(|_| KeyError::InvalidBase64)?;
                let key = decode_secret_key(&text, passphrase)
                    .map_err(|e| KeyError::Decode(e.to_string()))?;
                debug!(var = %var_name, "decoded SSH key from environment");
                Ok(vec![key])
            }
            KeySource::DefaultFiles => Ok(default_identity_paths()
                .into_iter()
                .filter(|path| path.exists())
                .filter_map(|path| match load_secret_key(&path, passphrase) {
                    Ok(key) => Some(key),
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "skipping identity file");
                        None
                    }
                })
                .collect()),
        }
    }
}

/// Key resolution errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("key file not found: {0}")]
    NotFound(String),

    #[error("cannot decode key: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn default_identity_paths() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    DEFAULT_IDENTITY_FILES
        .iter()
        .map(|name| home.join(".ssh").join(name))
        .collect()
}

fn base64_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input.trim())
}

#[cfg(unix)]
fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)?.permissions().mode();

    // group and other bits must be clear
    if mode & 0o77 != 0 {
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_key_permissions(_path: &Path) -> Result<(), KeyError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_file() {
        let source = KeySource::Path(PathBuf::from("/nonexistent/hostrun/id_ed25519"));
        assert!(matches!(source.load(None), Err(KeyError::NotFound(_))));
    }

    #[test]
    fn test_env_key_not_set() {
        let source = KeySource::Env("HOSTRUN_TEST_KEY_THAT_IS_NEVER_SET".to_string());
        assert!(matches!(source.load(None), Err(KeyError::EnvNotSet(_))));
    }

    #[test]
    fn test_base64_decode_trims_whitespace() {
        assert_eq!(base64_decode("aGk=\n").unwrap(), b"hi");
        assert!(base64_decode("not base64!").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_world_readable_key_is_refused() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not really a key").unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644)).unwrap();

        let source = KeySource::Path(file.path().to_path_buf());
        assert!(matches!(source.load(None), Err(KeyError::BadPermissions(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_garbage_key_fails_to_decode() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not really a key").unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600)).unwrap();

        let source = KeySource::Path(file.path().to_path_buf());
        assert!(matches!(source.load(None), Err(KeyError::Decode(_))));
    }
}
