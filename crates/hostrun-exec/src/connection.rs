//! Connection: target identity plus a lazily opened channel

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::ExecutionBackend;
use crate::config::ConnectOptions;
use crate::error::ExecError;
use crate::options::RunOptions;
use crate::result::CommandResult;
use crate::target::{Endpoint, Target};
use crate::traits::{Providers, SecureChannel};

/// Which backend a call goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Remote command on the channel
    Run,
    /// Local process, no channel
    Local,
    /// Remote command through sudo
    Sudo,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Run => write!(f, "run"),
            Operation::Local => write!(f, "local"),
            Operation::Sudo => write!(f, "sudo"),
        }
    }
}

enum ChannelState {
    Closed,
    Open(Box<dyn SecureChannel>),
}

/// A single execution target
///
/// The channel is opened on the first `run`/`sudo` and owned until `close`.
/// Calls on one Connection are serialized; share it behind an `Arc` to use
/// it from several tasks.
pub struct Connection {
    target: Target,
    endpoint: Endpoint,
    options: ConnectOptions,
    providers: Providers,
    channel: Mutex<ChannelState>,
    connected: AtomicBool,
}

impl Connection {
    /// Parse `[user@]host[:port]` and build an unopened connection
    ///
    /// # Errors
    /// Returns `ExecError::InvalidTarget` if the target cannot be parsed
    pub fn new(target: &str, options: ConnectOptions) -> Result<Self, ExecError> {
        Ok(Self::from_target(target.parse()?, options))
    }

    /// Build an unopened connection from a parsed target
    pub fn from_target(target: Target, options: ConnectOptions) -> Self {
        let endpoint = target.endpoint(&options);
        Self {
            target,
            endpoint,
            options,
            providers: Providers::default(),
            channel: Mutex::new(ChannelState::Closed),
            connected: AtomicBool::new(false),
        }
    }

    /// Replace the channel and process providers
    #[must_use]
    pub fn with_providers(mut self, providers: Providers) -> Self {
        self.providers = providers;
        self
    }

    /// Host as given
    pub fn host(&self) -> &str {
        &self.target.host
    }

    /// Effective login user
    pub fn user(&self) -> &str {
        &self.endpoint.user
    }

    /// Effective port
    pub fn port(&self) -> u16 {
        self.endpoint.port
    }

    /// Target as given, before defaults
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Normalized `(user, host, port)` identity
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn connect_options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Whether a channel is currently open
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Open the channel; no-op if already open
    ///
    /// # Errors
    /// Connect-kind errors: authentication, network, `ConnectTimeout`
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn open(&self) -> Result<(), ExecError> {
        let mut state = self.channel.lock().await;
        self.open_locked(&mut state).await
    }

    async fn open_locked(&self, state: &mut ChannelState) -> Result<(), ExecError> {
        if matches!(state, ChannelState::Open(_)) {
            debug!("already connected");
            return Ok(());
        }

        let timeout = self.options.connect_timeout();
        let channel = tokio::time::timeout(
            timeout,
            self.providers.channels.open(&self.endpoint, &self.options),
        )
        .await
        .map_err(|_| {
            error!(endpoint = %self.endpoint, timeout = ?timeout, "connect timed out");
            ExecError::ConnectTimeout {
                endpoint: self.endpoint.to_string(),
                timeout,
            }
        })??;

        *state = ChannelState::Open(channel);
        self.connected.store(true, Ordering::SeqCst);
        info!(endpoint = %self.endpoint, "connection opened");
        Ok(())
    }

    /// Release the channel; no-op if not open. Close errors are only logged.
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn close(&self) {
        let mut state = self.channel.lock().await;
        if let ChannelState::Open(mut channel) = std::mem::replace(&mut *state, ChannelState::Closed)
        {
            self.connected.store(false, Ordering::SeqCst);
            match channel.close().await {
                Ok(()) => info!(endpoint = %self.endpoint, "connection closed"),
                Err(e) => warn!(endpoint = %self.endpoint, error = %e, "error while closing connection"),
            }
        }
    }

    /// Run `command` on the remote host, opening the channel if needed
    ///
    /// # Errors
    /// Connect errors, execution errors, timeouts, and `CommandFailed` on a
    /// nonzero exit unless `options.warn` is set
    pub async fn run(&self, command: &str, options: &RunOptions) -> Result<CommandResult, ExecError> {
        self.dispatch(Operation::Run, command, options).await
    }

    /// Run `command` on this machine; never opens the channel
    ///
    /// # Errors
    /// Same as [`Connection::run`], minus connect errors
    pub async fn local(
        &self,
        command: &str,
        options: &RunOptions,
    ) -> Result<CommandResult, ExecError> {
        self.dispatch(Operation::Local, command, options).await
    }

    /// Run `command` through sudo on the remote host
    ///
    /// # Errors
    /// Same as [`Connection::run`], plus `EscalationFailed` when the password
    /// is rejected (returned as a failed result under `warn`)
    pub async fn sudo(
        &self,
        command: &str,
        options: &RunOptions,
    ) -> Result<CommandResult, ExecError> {
        self.dispatch(Operation::Sudo, command, options).await
    }

    /// Execute through the backend matching `operation`
    ///
    /// # Errors
    /// See [`Connection::run`]
    #[instrument(skip(self, options), fields(endpoint = %self.endpoint, op = %operation))]
    pub async fn dispatch(
        &self,
        operation: Operation,
        command: &str,
        options: &RunOptions,
    ) -> Result<CommandResult, ExecError> {
        let mut state = self.channel.lock().await;

        let outcome = match operation {
            Operation::Local => {
                ExecutionBackend::Local {
                    provider: self.providers.processes.as_ref(),
                }
                .execute(command, options)
                .await
            }
            Operation::Run | Operation::Sudo => {
                self.open_locked(&mut state).await?;
                let ChannelState::Open(channel) = &mut *state else {
                    return Err(ExecError::NotConnected);
                };
                let backend = if operation == Operation::Sudo {
                    ExecutionBackend::RemoteSudo {
                        channel: channel.as_mut(),
                        sudo: &self.options.sudo,
                        endpoint: &self.endpoint,
                        prompt: self.providers.password_prompt.clone(),
                    }
                } else {
                    ExecutionBackend::Remote {
                        channel: channel.as_mut(),
                    }
                };
                backend.execute(command, options).await
            }
        };

        self.apply_warn(outcome, options.warn)
    }

    fn apply_warn(
        &self,
        outcome: Result<CommandResult, ExecError>,
        warn: bool,
    ) -> Result<CommandResult, ExecError> {
        match outcome {
            Ok(result) if result.failed() && !warn => {
                debug!(
                    endpoint = %self.endpoint,
                    status = result.exited(),
                    "command failed"
                );
                Err(ExecError::CommandFailed {
                    result: Box::new(result),
                })
            }
            Err(ExecError::EscalationFailed { reason, result }) if warn => {
                warn!(endpoint = %self.endpoint, %reason, "sudo escalation failed, returning result");
                Ok(*result)
            }
            other => other,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
