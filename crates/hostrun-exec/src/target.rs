//! Target descriptors and the identities derived from them

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ConnectOptions;
use crate::error::ExecError;

/// Default SSH port
pub const DEFAULT_PORT: u16 = 22;

/// Host descriptor as written by the caller: `[user@]host[:port]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Login user, if given
    pub user: Option<String>,
    /// Hostname or address
    pub host: String,
    /// Port, if given
    pub port: Option<u16>,
}

impl Target {
    /// Create a target for a bare host
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            user: None,
            host: host.into(),
            port: None,
        }
    }

    /// Set login user
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Fill in defaults to get the comparison-stable endpoint
    #[must_use]
    pub fn endpoint(&self, options: &ConnectOptions) -> Endpoint {
        let user = self
            .user
            .clone()
            .or_else(|| options.user.clone())
            .unwrap_or_else(local_username);
        let port = self.port.or(options.port).unwrap_or(DEFAULT_PORT);
        Endpoint {
            user,
            host: self.host.to_ascii_lowercase(),
            port,
        }
    }
}

impl FromStr for Target {
    type Err = ExecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = |why: &str| ExecError::InvalidTarget(format!("{s:?}: {why}"));

        let (user, rest) = match s.rsplit_once('@') {
            Some(("", _)) => return Err(invalid("empty user")),
            Some((user, rest)) => (Some(user.to_string()), rest),
            None => (None, s),
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unclosed '['"))?;
            match after {
                "" => (host, None),
                _ => {
                    let port = after
                        .strip_prefix(':')
                        .ok_or_else(|| invalid("junk after ']'"))?;
                    (host, Some(port))
                }
            }
        } else if rest.matches(':').count() > 1 {
            // bare IPv6 literal, no port possible
            (rest, None)
        } else {
            match rest.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port = port
            .map(|p| p.parse::<u16>().map_err(|_| invalid("bad port")))
            .transpose()?;

        Ok(Self {
            user,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        write_host(f, &self.host, self.port)
    }
}

/// Normalized `(user, host, port)` identity of a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    /// Effective login user
    pub user: String,
    /// Lower-cased host
    pub host: String,
    /// Effective port
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@", self.user)?;
        write_host(f, &self.host, Some(self.port))
    }
}

/// Aggregation key for one Group member
///
/// Pairs the endpoint with the ordinal of its occurrence in the Group, so
/// members addressing the same endpoint never share a result slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId {
    /// Member endpoint
    pub endpoint: Endpoint,
    /// 0 for the first member with this endpoint, 1 for the second, ...
    pub ordinal: usize,
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ordinal == 0 {
            write!(f, "{}", self.endpoint)
        } else {
            write!(f, "{}#{}", self.endpoint, self.ordinal)
        }
    }
}

fn write_host(f: &mut fmt::Formatter<'_>, host: &str, port: Option<u16>) -> fmt::Result {
    match port {
        Some(port) if host.contains(':') => write!(f, "[{host}]:{port}"),
        Some(port) => write!(f, "{host}:{port}"),
        None => f.write_str(host),
    }
}

/// Name of the local login user
pub(crate) fn local_username() -> String {
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "root".to_string())
}
