//! Local process provider using `tokio::process` and `portable-pty`

use std::io::{Read, Write};
use std::process::Stdio;

use async_trait::async_trait;
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtyPair, PtySize, native_pty_system};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::error::ExecError;
use crate::pty::PtyDescriptor;
use crate::result::Stream;
use crate::traits::{ExecRequest, ProcessEvent, ProcessHandle, ProcessProvider};

const READ_CHUNK: usize = 8192;

/// Local process provider
///
/// Runs commands through `sh -c` so pipes and redirections work.
#[derive(Debug, Clone)]
pub struct LocalProcessProvider {
    shell: String,
}

impl LocalProcessProvider {
    /// Create a provider using `sh`
    #[must_use]
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    /// Use a different shell (must accept `-c <command>`)
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    fn spawn_piped(&self, request: &ExecRequest) -> Result<PipedProcess, ExecError> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&request.command)
            .envs(&request.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecError::SpawnError(e.to_string()))?;

        let (tx, events) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, Stream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, Stream::Stderr, tx));
        }
        let stdin = child.stdin.take();

        Ok(PipedProcess {
            child,
            stdin,
            events,
            exited: false,
        })
    }

    fn spawn_pty(&self, request: &ExecRequest, size: PtyDescriptor) -> Result<PtyProcess, String> {
        let PtyPair { master, slave } = native_pty_system()
            .openpty(PtySize {
                rows: size.rows(),
                cols: size.cols(),
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| format!("failed to open pty: {e}"))?;

        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.arg("-c");
        cmd.arg(&request.command);
        cmd.env("TERM", "xterm");
        for (key, value) in &request.env {
            cmd.env(key, value);
        }
        // portable-pty would otherwise start in $HOME
        if let Some(cwd) = &request.cwd {
            cmd.cwd(cwd);
        } else if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        let child = slave
            .spawn_command(cmd)
            .map_err(|e| format!("failed to spawn on pty: {e}"))?;
        // parent must not hold the slave side or EOF never arrives
        drop(slave);

        let mut reader = master
            .try_clone_reader()
            .map_err(|e| format!("failed to get pty reader: {e}"))?;
        let writer = master
            .take_writer()
            .map_err(|e| format!("failed to get pty writer: {e}"))?;

        let (tx, events) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    // EIO on Linux once the child side is gone
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(PtyProcess {
            _master: master,
            writer: Some(writer),
            child: Some(child),
            events,
        })
    }
}

impl Default for LocalProcessProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessProvider for LocalProcessProvider {
    #[instrument(skip(self, request), fields(command = %request.command), level = "debug")]
    async fn spawn(&self, request: &ExecRequest) -> Result<Box<dyn ProcessHandle>, ExecError> {
        if let Some(size) = request.pty {
            match self.spawn_pty(request, size) {
                Ok(process) => {
                    debug!(rows = size.rows(), cols = size.cols(), "spawned local command on pty");
                    return Ok(Box::new(process));
                }
                Err(reason) => {
                    warn!(%reason, "pty unavailable, falling back to pipes");
                }
            }
        }
        let process = self.spawn_piped(request)?;
        debug!("spawned local command");
        Ok(Box::new(process))
    }
}

async fn forward_output<R>(mut reader: R, stream: Stream, tx: mpsc::UnboundedSender<ProcessEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx
                    .send(ProcessEvent::Output(stream, buf[..n].to_vec()))
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

/// Child process with piped stdio
struct PipedProcess {
    child: tokio::process::Child,
    stdin: Option<ChildStdin>,
    events: mpsc::UnboundedReceiver<ProcessEvent>,
    exited: bool,
}

#[async_trait]
impl ProcessHandle for PipedProcess {
    async fn next_event(&mut self) -> Result<Option<ProcessEvent>, ExecError> {
        if let Some(event) = self.events.recv().await {
            return Ok(Some(event));
        }
        if self.exited {
            return Ok(None);
        }
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;
        self.exited = true;
        Ok(Some(ProcessEvent::Exited(exit_code(status))))
    }

    async fn write_stdin(&mut self, data: &[u8]) -> Result<(), ExecError> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            ExecError::IoError("stdin already closed".to_string())
        })?;
        stdin
            .write_all(data)
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))
    }

    async fn close_stdin(&mut self) -> Result<(), ExecError> {
        self.stdin = None;
        Ok(())
    }

    async fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "kill failed, process likely already gone");
        }
    }

    fn has_pty(&self) -> bool {
        false
    }
}

/// Child process attached to a pseudo-terminal
struct PtyProcess {
    _master: Box<dyn MasterPty + Send>,
    writer: Option<Box<dyn Write + Send>>,
    child: Option<Box<dyn Child + Send + Sync>>,
    events: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl ProcessHandle for PtyProcess {
    async fn next_event(&mut self) -> Result<Option<ProcessEvent>, ExecError> {
        if let Some(data) = self.events.recv().await {
            return Ok(Some(ProcessEvent::Output(Stream::Stdout, data)));
        }
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };
        let status = tokio::task::spawn_blocking(move || wait_pty_child(child.as_mut()))
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))??;
        Ok(Some(ProcessEvent::Exited(status)))
    }

    async fn write_stdin(&mut self, data: &[u8]) -> Result<(), ExecError> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            ExecError::IoError("stdin already closed".to_string())
        })?;
        writer
            .write_all(data)
            .and_then(|()| writer.flush())
            .map_err(|e| ExecError::IoError(e.to_string()))
    }

    async fn close_stdin(&mut self) -> Result<(), ExecError> {
        self.writer = None;
        Ok(())
    }

    async fn terminate(&mut self) {
        if let Some(child) = self.child.as_mut()
            && let Err(e) = child.kill()
        {
            debug!(error = %e, "kill failed, process likely already gone");
        }
    }

    fn has_pty(&self) -> bool {
        true
    }
}

/// Exit status as an integer; death by signal maps to `128 + signo`
fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Reap a pty child; portable-pty hides the signal, so wait on the pid directly
#[cfg(unix)]
fn wait_pty_child(child: &mut (dyn Child + Send + Sync)) -> Result<i32, ExecError> {
    use nix::errno::Errno;
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::Pid;

    let Some(pid) = child.process_id().and_then(|pid| i32::try_from(pid).ok()) else {
        return wait_portable(child);
    };
    loop {
        match waitpid(Pid::from_raw(pid), None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
            Ok(_) | Err(Errno::EINTR) => {}
            Err(e) => return Err(ExecError::IoError(format!("waitpid {pid}: {e}"))),
        }
    }
}

#[cfg(not(unix))]
fn wait_pty_child(child: &mut (dyn Child + Send + Sync)) -> Result<i32, ExecError> {
    wait_portable(child)
}

fn wait_portable(child: &mut (dyn Child + Send + Sync)) -> Result<i32, ExecError> {
    child
        .wait()
        .map(|status| status.exit_code().cast_signed())
        .map_err(|e| ExecError::IoError(e.to_string()))
}
