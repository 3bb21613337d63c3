//! Interfaces to the secure channel and local process providers

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ConnectOptions;
use crate::error::ExecError;
use crate::local::LocalProcessProvider;
use crate::pty::PtyDescriptor;
use crate::result::Stream;
use crate::ssh::SshChannelProvider;
use crate::target::Endpoint;

/// Something a running process reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A chunk of output
    Output(Stream, Vec<u8>),
    /// Exit status
    Exited(i32),
}

/// A started process, local or remote
#[async_trait]
pub trait ProcessHandle: Send {
    /// Next event, `None` once all output and the exit status are delivered
    async fn next_event(&mut self) -> Result<Option<ProcessEvent>, ExecError>;

    /// Write to the process's stdin
    async fn write_stdin(&mut self, data: &[u8]) -> Result<(), ExecError>;

    /// Signal end of input
    async fn close_stdin(&mut self) -> Result<(), ExecError>;

    /// Kill the process; best-effort
    async fn terminate(&mut self);

    /// Whether the process actually got a pty
    fn has_pty(&self) -> bool;
}

/// An open, authenticated session to a remote host
#[async_trait]
pub trait SecureChannel: Send {
    /// Start `command`, optionally on a pty
    async fn exec(
        &mut self,
        command: &str,
        pty: Option<PtyDescriptor>,
    ) -> Result<Box<dyn ProcessHandle>, ExecError>;

    /// Tear the session down
    async fn close(&mut self) -> Result<(), ExecError>;
}

/// Opens secure channels
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Establish a channel to `endpoint`
    async fn open(
        &self,
        endpoint: &Endpoint,
        options: &ConnectOptions,
    ) -> Result<Box<dyn SecureChannel>, ExecError>;
}

/// A local command ready to be spawned
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    /// Shell command line
    pub command: String,
    /// Pty geometry, `None` for plain pipes
    pub pty: Option<PtyDescriptor>,
    /// Extra environment
    pub env: BTreeMap<String, String>,
    /// Working directory
    pub cwd: Option<String>,
}

/// Spawns local processes
#[async_trait]
pub trait ProcessProvider: Send + Sync {
    /// Start the requested command
    async fn spawn(&self, request: &ExecRequest) -> Result<Box<dyn ProcessHandle>, ExecError>;
}

/// Interactive source for the sudo password
///
/// Called from a blocking thread, so implementations may read a terminal.
pub trait PasswordPrompt: Send + Sync {
    /// Ask for the password used on `endpoint`; `None` gives up
    fn prompt(&self, endpoint: &Endpoint) -> Option<String>;
}

/// The collaborators a Connection executes through
#[derive(Clone)]
pub struct Providers {
    /// Secure channel provider
    pub channels: Arc<dyn ChannelProvider>,
    /// Local process provider
    pub processes: Arc<dyn ProcessProvider>,
    /// Interactive sudo password source
    pub password_prompt: Option<Arc<dyn PasswordPrompt>>,
}

impl Providers {
    /// Use the given channel and process providers
    pub fn new(channels: Arc<dyn ChannelProvider>, processes: Arc<dyn ProcessProvider>) -> Self {
        Self {
            channels,
            processes,
            password_prompt: None,
        }
    }

    /// Ask this prompt when sudo wants a password nobody configured
    #[must_use]
    pub fn with_password_prompt(mut self, prompt: Arc<dyn PasswordPrompt>) -> Self {
        self.password_prompt = Some(prompt);
        self
    }
}

impl Default for Providers {
    fn default() -> Self {
        Self::new(
            Arc::new(SshChannelProvider::new()),
            Arc::new(LocalProcessProvider::new()),
        )
    }
}

impl fmt::Debug for Providers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Providers")
            .field("password_prompt", &self.password_prompt.is_some())
            .finish_non_exhaustive()
    }
}
