//! Per-call execution options

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ExecError;
use crate::pty::PtyRequest;
use crate::result::Stream;
use crate::sink::OutputSink;

/// Which streams to keep off the local console
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Hide {
    /// Echo everything
    #[default]
    None,
    /// Hide stdout only
    Stdout,
    /// Hide stderr only
    Stderr,
    /// Hide both streams
    Both,
}

impl Hide {
    /// Whether echo of `stream` is suppressed
    #[must_use]
    pub fn hides(self, stream: Stream) -> bool {
        matches!(
            (self, stream),
            (Hide::Both, _) | (Hide::Stdout, Stream::Stdout) | (Hide::Stderr, Stream::Stderr)
        )
    }
}

impl From<bool> for Hide {
    fn from(hide: bool) -> Self {
        if hide { Hide::Both } else { Hide::None }
    }
}

impl FromStr for Hide {
    type Err = ExecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "false" => Ok(Hide::None),
            "out" | "stdout" => Ok(Hide::Stdout),
            "err" | "stderr" => Ok(Hide::Stderr),
            "both" | "true" => Ok(Hide::Both),
            other => Err(ExecError::ConfigError(format!(
                "unknown hide value {other:?} (expected none, out, err or both)"
            ))),
        }
    }
}

/// Options for one `run`/`local`/`sudo` call
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Streams kept off the console; capture is unaffected
    pub hide: Hide,
    /// Pseudo-terminal request
    pub pty: PtyRequest,
    /// Return nonzero exits as data instead of `CommandFailed`
    pub warn: bool,
    /// Extra environment for the command
    pub env: BTreeMap<String, String>,
    /// Working directory for the command
    pub cwd: Option<String>,
    /// Bound on execution time
    pub timeout: Option<Duration>,
    /// Additional live destinations for output
    pub sinks: Vec<Arc<dyn OutputSink>>,
}

impl RunOptions {
    /// Default options: echo on, no pty, raise on failure
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set which streams to hide
    #[must_use]
    pub fn hide(mut self, hide: impl Into<Hide>) -> Self {
        self.hide = hide.into();
        self
    }

    /// Request a pseudo-terminal
    #[must_use]
    pub fn pty(mut self, pty: impl Into<PtyRequest>) -> Self {
        self.pty = pty.into();
        self
    }

    /// Return nonzero exits instead of raising
    #[must_use]
    pub fn warn(mut self, warn: bool) -> Self {
        self.warn = warn;
        self
    }

    /// Add an environment variable
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set working directory
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Bound execution time
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add a live output destination
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("hide", &self.hide)
            .field("pty", &self.pty)
            .field("warn", &self.warn)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("cwd", &self.cwd)
            .field("timeout", &self.timeout)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}
