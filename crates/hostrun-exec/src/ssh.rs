//! SSH channel provider using russh crate

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, ssh_key};
use russh::{ChannelMsg, Disconnect, Sig, client};
use tracing::{debug, info, instrument};

use crate::config::ConnectOptions;
use crate::error::ExecError;
use crate::keys::KeySource;
use crate::pty::PtyDescriptor;
use crate::result::Stream;
use crate::target::Endpoint;
use crate::traits::{ChannelProvider, ProcessEvent, ProcessHandle, SecureChannel};

/// Terminal type announced in pty requests
const PTY_TERM: &str = "xterm";

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Accept all server keys (like StrictHostKeyChecking=no)
        Ok(true)
    }
}

/// Opens SSH sessions
#[derive(Debug, Clone, Default)]
pub struct SshChannelProvider;

impl SshChannelProvider {
    /// Create a new provider
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChannelProvider for SshChannelProvider {
    #[instrument(skip(self, options), fields(endpoint = %endpoint))]
    async fn open(
        &self,
        endpoint: &Endpoint,
        options: &ConnectOptions,
    ) -> Result<Box<dyn SecureChannel>, ExecError> {
        info!(
            host = %endpoint.host,
            port = endpoint.port,
            user = %endpoint.user,
            "connecting to SSH"
        );

        let config = Arc::new(client::Config::default());
        let mut session = client::connect(
            config,
            (endpoint.host.as_str(), endpoint.port),
            SshClientHandler,
        )
        .await
        .map_err(|e| ExecError::ConnectionFailed {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

        authenticate(&mut session, endpoint, options).await?;

        info!(endpoint = %endpoint, "SSH connected and authenticated");

        Ok(Box::new(SshChannel {
            endpoint: endpoint.clone(),
            session,
        }))
    }
}

/// Explicit key first, then password, then default identity files
async fn authenticate(
    session: &mut client::Handle<SshClientHandler>,
    endpoint: &Endpoint,
    options: &ConnectOptions,
) -> Result<(), ExecError> {
    let source = options.key_source();
    let passphrase = options.key_passphrase.as_deref();
    let explicit_key = !matches!(source, KeySource::DefaultFiles);

    if explicit_key {
        let keys = source
            .load(passphrase)
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?;
        if try_keys(session, endpoint, keys).await? {
            return Ok(());
        }
    }

    if let Some(password) = &options.password {
        let auth_res = session
            .authenticate_password(&endpoint.user, password)
            .await
            .map_err(|e| auth_error(endpoint, e))?;
        if auth_res.success() {
            debug!("password authentication succeeded");
            return Ok(());
        }
    }

    if !explicit_key {
        let keys = source
            .load(passphrase)
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?;
        if try_keys(session, endpoint, keys).await? {
            return Ok(());
        }
    }

    Err(ExecError::AuthenticationFailed {
        endpoint: endpoint.to_string(),
        reason: "no authentication method succeeded".to_string(),
    })
}

async fn try_keys(
    session: &mut client::Handle<SshClientHandler>,
    endpoint: &Endpoint,
    keys: Vec<PrivateKey>,
) -> Result<bool, ExecError> {
    for key in keys {
        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        let auth_res = session
            .authenticate_publickey(
                &endpoint.user,
                PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
            )
            .await
            .map_err(|e| auth_error(endpoint, e))?;
        if auth_res.success() {
            debug!("public key authentication succeeded");
            return Ok(true);
        }
    }
    Ok(false)
}

fn auth_error(endpoint: &Endpoint, e: russh::Error) -> ExecError {
    ExecError::AuthenticationFailed {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    }
}

/// An authenticated SSH session
struct SshChannel {
    endpoint: Endpoint,
    session: client::Handle<SshClientHandler>,
}

impl fmt::Debug for SshChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshChannel")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SecureChannel for SshChannel {
    #[instrument(skip(self, command), fields(endpoint = %self.endpoint))]
    async fn exec(
        &mut self,
        command: &str,
        pty: Option<PtyDescriptor>,
    ) -> Result<Box<dyn ProcessHandle>, ExecError> {
        let channel = self
            .session
            .channel_open_session()
            .await
            .map_err(|e| ExecError::SpawnError(e.to_string()))?;

        if let Some(size) = pty {
            channel
                .request_pty(
                    true,
                    PTY_TERM,
                    u32::from(size.cols()),
                    u32::from(size.rows()),
                    0,
                    0,
                    &[],
                )
                .await
                .map_err(|e| ExecError::SpawnError(e.to_string()))?;
        }

        channel
            .exec(true, command)
            .await
            .map_err(|e| ExecError::SpawnError(e.to_string()))?;

        debug!(command = %command, pty = pty.is_some(), "remote command started");

        Ok(Box::new(SshProcess {
            channel,
            pty: pty.is_some(),
            closed: false,
        }))
    }

    async fn close(&mut self) -> Result<(), ExecError> {
        self.session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;
        info!(endpoint = %self.endpoint, "SSH disconnected");
        Ok(())
    }
}

/// One exec session on an SSH connection
struct SshProcess {
    channel: russh::Channel<client::Msg>,
    pty: bool,
    closed: bool,
}

#[async_trait]
impl ProcessHandle for SshProcess {
    async fn next_event(&mut self) -> Result<Option<ProcessEvent>, ExecError> {
        // exit-status may arrive after EOF, so read until the channel closes
        while !self.closed {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    return Ok(Some(ProcessEvent::Output(Stream::Stdout, data.to_vec())));
                }
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    return Ok(Some(ProcessEvent::Output(Stream::Stderr, data.to_vec())));
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    return Ok(Some(ProcessEvent::Exited(exit_status.cast_signed())));
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    return Ok(Some(ProcessEvent::Exited(signal_exit_code(&signal_name))));
                }
                Some(ChannelMsg::Close) | None => self.closed = true,
                Some(_) => {}
            }
        }
        Ok(None)
    }

    async fn write_stdin(&mut self, data: &[u8]) -> Result<(), ExecError> {
        self.channel
            .data(data)
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))
    }

    async fn close_stdin(&mut self) -> Result<(), ExecError> {
        self.channel
            .eof()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))
    }

    async fn terminate(&mut self) {
        if let Err(e) = self.channel.signal(Sig::KILL).await {
            debug!(error = %e, "failed to signal remote process");
        }
        if let Err(e) = self.channel.close().await {
            debug!(error = %e, "failed to close session channel");
        }
    }

    fn has_pty(&self) -> bool {
        self.pty
    }
}

/// Shell convention for death by signal: `128 + signo`
fn signal_exit_code(signal: &Sig) -> i32 {
    let number = match signal {
        Sig::HUP => 1,
        Sig::INT => 2,
        Sig::QUIT => 3,
        Sig::ILL => 4,
        Sig::ABRT => 6,
        Sig::FPE => 8,
        Sig::KILL => 9,
        Sig::USR1 => 10,
        Sig::SEGV => 11,
        Sig::PIPE => 13,
        Sig::ALRM => 14,
        Sig::TERM => 15,
        _ => return 255,
    };
    128 + number
}
