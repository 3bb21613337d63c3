//! Execution backends: local process, remote session, remote sudo session

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};

use crate::config::SudoConfig;
use crate::error::ExecError;
use crate::options::RunOptions;
use crate::result::CommandResult;
use crate::sink::Capture;
use crate::sudo::{EscalationState, PromptWatcher, WatchAction};
use crate::target::Endpoint;
use crate::traits::{
    ExecRequest, PasswordPrompt, ProcessEvent, ProcessHandle, ProcessProvider, SecureChannel,
};

/// How long sudo gets to exit on its own after a rejected password
const REJECTION_GRACE: Duration = Duration::from_secs(3);

/// Lifecycle of one command invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    NotStarted,
    Running,
    /// Exited with status 0
    Succeeded,
    /// Exited with a nonzero status
    Failed,
    /// No exit status: spawn failure, transport failure or timeout
    Errored,
}

impl ExecState {
    /// Check if transition to `next` is valid
    #[must_use]
    pub fn can_transition_to(self, next: ExecState) -> bool {
        matches!(
            (self, next),
            (ExecState::NotStarted, ExecState::Running | ExecState::Errored)
                | (
                    ExecState::Running,
                    ExecState::Succeeded | ExecState::Failed | ExecState::Errored
                )
        )
    }

    /// Whether the invocation is over
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecState::Succeeded | ExecState::Failed | ExecState::Errored
        )
    }
}

impl fmt::Display for ExecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecState::NotStarted => "not_started",
            ExecState::Running => "running",
            ExecState::Succeeded => "succeeded",
            ExecState::Failed => "failed",
            ExecState::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Tracks the state of a single invocation
#[derive(Debug)]
struct Invocation<'a> {
    command: &'a str,
    state: ExecState,
}

impl<'a> Invocation<'a> {
    fn new(command: &'a str) -> Self {
        Self {
            command,
            state: ExecState::NotStarted,
        }
    }

    fn transition_to(&mut self, next: ExecState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid execution transition {} -> {}",
            self.state,
            next
        );
        debug!(command = %self.command, from = %self.state, to = %next, "execution state");
        self.state = next;
    }
}

/// Strategy used to execute one command
///
/// Picked by the calling `Connection` method; `Local` never touches a channel.
pub enum ExecutionBackend<'a> {
    /// Local process provider
    Local {
        /// Spawns the process
        provider: &'a dyn ProcessProvider,
    },
    /// Plain exec session on an open channel
    Remote {
        /// Open channel owned by the connection
        channel: &'a mut dyn SecureChannel,
    },
    /// Exec session wrapped in sudo
    RemoteSudo {
        /// Open channel owned by the connection
        channel: &'a mut dyn SecureChannel,
        /// Escalation settings
        sudo: &'a SudoConfig,
        /// Endpoint, handed to the password prompt
        endpoint: &'a Endpoint,
        /// Interactive fallback when no password is configured
        prompt: Option<Arc<dyn PasswordPrompt>>,
    },
}

impl ExecutionBackend<'_> {
    /// Short name for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionBackend::Local { .. } => "local",
            ExecutionBackend::Remote { .. } => "remote",
            ExecutionBackend::RemoteSudo { .. } => "sudo",
        }
    }

    /// Execute `command` and capture its outcome
    ///
    /// A nonzero exit is returned as data here; the caller applies `warn`.
    ///
    /// # Errors
    /// - `SpawnError`/`IoError` if the process or session cannot be driven
    /// - `Timeout` with partial output if `options.timeout` elapses
    /// - `EscalationFailed` if sudo rejects the password
    #[instrument(skip(self, options), fields(backend = self.kind()), level = "debug")]
    pub async fn execute(
        self,
        command: &str,
        options: &RunOptions,
    ) -> Result<CommandResult, ExecError> {
        let start = Instant::now();
        let mut invocation = Invocation::new(command);
        let pty = options.pty.resolve();

        debug!(command = %command, pty = pty.is_some(), "executing command");

        let started = self.start(command, options, pty).await;
        let (mut process, escalation) = match started {
            Ok(started) => started,
            Err(e) => {
                invocation.transition_to(ExecState::Errored);
                error!(command = %command, error = %e, "failed to start command");
                return Err(e);
            }
        };
        invocation.transition_to(ExecState::Running);

        let mut capture = Capture::new(options.hide, options.sinks.clone());
        let completion = match drive(
            process.as_mut(),
            &mut capture,
            escalation,
            options.timeout,
        )
        .await
        {
            Ok(completion) => completion,
            Err(e) => {
                process.terminate().await;
                invocation.transition_to(ExecState::Errored);
                return Err(e);
            }
        };

        let (stdout, stderr) = capture.snapshot();
        let duration = start.elapsed();

        if let (true, Some(timeout)) = (completion.timed_out, options.timeout) {
            invocation.transition_to(ExecState::Errored);
            error!(
                command = %command,
                timeout = ?timeout,
                elapsed = ?duration,
                "command timed out"
            );
            let partial =
                CommandResult::new(command, stdout, stderr, -1, process.has_pty(), duration);
            return Err(ExecError::Timeout {
                timeout,
                partial: Box::new(partial),
            });
        }

        let exited = match (completion.status, &completion.rejection) {
            (Some(status), _) => status,
            // sudo exits 1 when it gives up
            (None, Some(_)) => 1,
            (None, None) => -1,
        };
        let result = CommandResult::new(command, stdout, stderr, exited, process.has_pty(), duration);

        // a command that exits 0 got past sudo, whatever its output says
        if let Some(reason) = completion.rejection
            && exited != 0
        {
            invocation.transition_to(ExecState::Failed);
            warn!(command = %command, %reason, "sudo escalation failed");
            return Err(ExecError::EscalationFailed {
                reason,
                result: Box::new(result),
            });
        }

        invocation.transition_to(if result.ok() {
            ExecState::Succeeded
        } else {
            ExecState::Failed
        });
        debug!(
            command = %command,
            status = result.exited(),
            duration = ?duration,
            "command completed"
        );
        Ok(result)
    }

    async fn start(
        self,
        command: &str,
        options: &RunOptions,
        pty: Option<crate::pty::PtyDescriptor>,
    ) -> Result<(Box<dyn ProcessHandle>, Option<Escalation>), ExecError> {
        match self {
            ExecutionBackend::Local { provider } => {
                let request = ExecRequest {
                    command: command.to_string(),
                    pty,
                    env: options.env.clone(),
                    cwd: options.cwd.clone(),
                };
                let mut process = provider.spawn(&request).await?;
                close_unused_stdin(process.as_mut()).await;
                Ok((process, None))
            }
            ExecutionBackend::Remote { channel } => {
                let line = remote_command(command, options)?;
                let mut process = channel.exec(&line, pty).await?;
                close_unused_stdin(process.as_mut()).await;
                Ok((process, None))
            }
            ExecutionBackend::RemoteSudo {
                channel,
                sudo,
                endpoint,
                prompt,
            } => {
                let line = sudo_command(command, options, sudo)?;
                let process = channel.exec(&line, pty).await?;
                let escalation = Escalation {
                    watcher: PromptWatcher::new(sudo, process.has_pty()),
                    password: sudo.password.clone(),
                    prompt,
                    endpoint: endpoint.clone(),
                    password_sent: false,
                    stdin_closed: false,
                };
                Ok((process, Some(escalation)))
            }
        }
    }
}

impl fmt::Debug for ExecutionBackend<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionBackend")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

/// Nobody types into a non-interactive command; EOF keeps `cat`-like
/// commands from waiting forever. A pty keeps its input open.
async fn close_unused_stdin(process: &mut dyn ProcessHandle) {
    if process.has_pty() {
        return;
    }
    if let Err(e) = process.close_stdin().await {
        debug!(error = %e, "failed to close stdin");
    }
}

/// Sudo side of a running invocation
struct Escalation {
    watcher: PromptWatcher,
    password: Option<String>,
    prompt: Option<Arc<dyn PasswordPrompt>>,
    endpoint: Endpoint,
    password_sent: bool,
    stdin_closed: bool,
}

impl Escalation {
    async fn password(&mut self) -> Option<String> {
        if self.password.is_none()
            && let Some(prompt) = &self.prompt
        {
            let prompt = Arc::clone(prompt);
            let endpoint = self.endpoint.clone();
            self.password = tokio::task::spawn_blocking(move || prompt.prompt(&endpoint))
                .await
                .ok()
                .flatten();
        }
        self.password.clone()
    }

    /// Carry out watcher actions; returns a rejection reason if escalation failed
    async fn apply(
        &mut self,
        actions: Vec<WatchAction>,
        process: &mut dyn ProcessHandle,
        capture: &mut Capture,
    ) -> Result<Option<String>, ExecError> {
        let mut rejection = None;
        for action in actions {
            match action {
                WatchAction::Emit(stream, data) => capture.record(stream, &data),
                WatchAction::SendPassword => {
                    if let Some(password) = self.password().await {
                        process
                            .write_stdin(format!("{password}\n").as_bytes())
                            .await?;
                        self.watcher.password_sent();
                        self.password_sent = true;
                        debug!(endpoint = %self.endpoint, "sent sudo password");
                    } else {
                        self.watcher.reject();
                        rejection =
                            Some("sudo asked for a password but none is available".to_string());
                    }
                }
                WatchAction::Reject(reason) => rejection = Some(reason),
            }
        }
        if rejection.is_some() && !self.stdin_closed {
            if let Err(e) = process.close_stdin().await {
                debug!(error = %e, "failed to close stdin after rejection");
            }
            self.stdin_closed = true;
        }
        // password-less sudo: nobody will type into it
        if self.watcher.state() == EscalationState::Running
            && !self.password_sent
            && !self.stdin_closed
        {
            close_unused_stdin(process).await;
            self.stdin_closed = true;
        }
        Ok(rejection)
    }
}

/// How the event loop ended
#[derive(Debug, Default)]
struct Completion {
    status: Option<i32>,
    timed_out: bool,
    rejection: Option<String>,
}

/// Pump process events into the capture until the process is done
async fn drive(
    process: &mut dyn ProcessHandle,
    capture: &mut Capture,
    mut escalation: Option<Escalation>,
    timeout: Option<Duration>,
) -> Result<Completion, ExecError> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut grace: Option<Instant> = None;
    let mut completion = Completion::default();

    loop {
        let watch = escalation.as_ref().and_then(|e| e.watcher.deadline());
        let wake = [deadline, grace, watch].into_iter().flatten().min();

        let next = match wake {
            Some(at) => match tokio::time::timeout_at(at, process.next_event()).await {
                Ok(next) => next?,
                Err(_) => {
                    let now = Instant::now();
                    if deadline.is_some_and(|d| now >= d) {
                        process.terminate().await;
                        completion.timed_out = true;
                        break;
                    }
                    if grace.is_some_and(|g| now >= g) {
                        process.terminate().await;
                        break;
                    }
                    if let Some(esc) = escalation.as_mut() {
                        // no prompt in time
                        let actions = esc.watcher.expire();
                        esc.apply(actions, process, capture).await?;
                    }
                    continue;
                }
            },
            None => process.next_event().await?,
        };

        match next {
            None => break,
            Some(ProcessEvent::Exited(code)) => completion.status = Some(code),
            Some(ProcessEvent::Output(stream, data)) => match escalation.as_mut() {
                None => capture.record(stream, &data),
                Some(esc) => {
                    let actions = esc.watcher.feed(stream, &data);
                    if let Some(reason) = esc.apply(actions, process, capture).await?
                        && completion.rejection.is_none()
                    {
                        completion.rejection = Some(reason);
                        grace = Some(Instant::now() + REJECTION_GRACE);
                    }
                }
            },
        }
    }

    if let Some(esc) = escalation.as_mut() {
        let actions = esc.watcher.finish();
        esc.apply(actions, process, capture).await?;
    }

    Ok(completion)
}

/// Inline `cwd` and `env` into a remote command line
///
/// # Errors
/// Returns `ExecError::ConfigError` for environment names that are not
/// shell identifiers
pub fn remote_command(command: &str, options: &RunOptions) -> Result<String, ExecError> {
    let mut line = String::new();
    if let Some(cwd) = &options.cwd {
        line.push_str("cd ");
        line.push_str(&shell_quote(cwd));
        line.push_str(" && ");
    }
    if !options.env.is_empty() {
        let mut assignments = Vec::with_capacity(options.env.len());
        for (key, value) in &options.env {
            validate_env_name(key)?;
            assignments.push(format!("{key}={}", shell_quote(value)));
        }
        line.push_str("export ");
        line.push_str(&assignments.join(" "));
        line.push_str(" && ");
    }
    line.push_str(command);
    Ok(line)
}

/// Wrap a command in sudo, after the `cwd`/`env` prefix
///
/// # Errors
/// Same as [`remote_command`]
pub fn sudo_command(
    command: &str,
    options: &RunOptions,
    sudo: &SudoConfig,
) -> Result<String, ExecError> {
    let mut wrapped = format!("sudo -S -p {} ", shell_quote(&sudo.prompt));
    if !options.env.is_empty() {
        let names: Vec<&str> = options.env.keys().map(String::as_str).collect();
        wrapped.push_str(&format!("--preserve-env={} ", shell_quote(&names.join(","))));
    }
    if let Some(user) = &sudo.user {
        wrapped.push_str(&format!("-H -u {} ", shell_quote(user)));
    }
    wrapped.push_str(command);
    remote_command(&wrapped, options)
}

/// Shell escape a string for safe use in shell commands
#[must_use]
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn validate_env_name(name: &str) -> Result<(), ExecError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ExecError::ConfigError(format!(
            "invalid environment variable name {name:?}"
        )))
    }
}
