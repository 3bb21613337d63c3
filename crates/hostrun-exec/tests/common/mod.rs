// Fake providers shared by the integration tests
#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use hostrun_exec::config::{ConnectOptions, DEFAULT_SUDO_PROMPT};
use hostrun_exec::error::ExecError;
use hostrun_exec::local::LocalProcessProvider;
use hostrun_exec::pty::PtyDescriptor;
use hostrun_exec::result::Stream;
use hostrun_exec::target::Endpoint;
use hostrun_exec::traits::{
    ChannelProvider, ExecRequest, PasswordPrompt, ProcessEvent, ProcessHandle, ProcessProvider,
    Providers, SecureChannel,
};

/// Counters shared between a fake provider and its channels
#[derive(Debug, Default)]
pub struct Counters {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub commands: Mutex<Vec<String>>,
}

impl Counters {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

/// "Remote" channel that runs commands on this machine
#[derive(Debug, Default)]
pub struct LoopbackProvider {
    pub counters: Arc<Counters>,
    unreachable: HashSet<String>,
}

impl LoopbackProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse connections to `host`
    pub fn unreachable(mut self, host: &str) -> Self {
        self.unreachable.insert(host.to_string());
        self
    }
}

#[async_trait]
impl ChannelProvider for LoopbackProvider {
    async fn open(
        &self,
        endpoint: &Endpoint,
        _options: &ConnectOptions,
    ) -> Result<Box<dyn SecureChannel>, ExecError> {
        if self.unreachable.contains(&endpoint.host) {
            return Err(ExecError::ConnectionFailed {
                endpoint: endpoint.to_string(),
                reason: "no route to host".to_string(),
            });
        }
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackChannel {
            counters: Arc::clone(&self.counters),
            processes: LocalProcessProvider::new(),
        }))
    }
}

struct LoopbackChannel {
    counters: Arc<Counters>,
    processes: LocalProcessProvider,
}

#[async_trait]
impl SecureChannel for LoopbackChannel {
    async fn exec(
        &mut self,
        command: &str,
        pty: Option<PtyDescriptor>,
    ) -> Result<Box<dyn ProcessHandle>, ExecError> {
        self.counters
            .commands
            .lock()
            .unwrap()
            .push(command.to_string());
        let request = ExecRequest {
            command: command.to_string(),
            pty,
            ..ExecRequest::default()
        };
        self.processes.spawn(&request).await
    }

    async fn close(&mut self) -> Result<(), ExecError> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Provider whose connection attempts never finish
#[derive(Debug, Default)]
pub struct HangingProvider;

#[async_trait]
impl ChannelProvider for HangingProvider {
    async fn open(
        &self,
        _endpoint: &Endpoint,
        _options: &ConnectOptions,
    ) -> Result<Box<dyn SecureChannel>, ExecError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(ExecError::NotConnected)
    }
}

/// Provider whose sessions behave like `sudo -S` with a fixed password
///
/// `None` as password means password-less sudo.
#[derive(Debug, Default)]
pub struct SudoProvider {
    pub counters: Arc<Counters>,
    password: Option<String>,
}

impl SudoProvider {
    pub fn with_password(password: &str) -> Self {
        Self {
            counters: Arc::default(),
            password: Some(password.to_string()),
        }
    }

    pub fn passwordless() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelProvider for SudoProvider {
    async fn open(
        &self,
        _endpoint: &Endpoint,
        _options: &ConnectOptions,
    ) -> Result<Box<dyn SecureChannel>, ExecError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SudoChannel {
            counters: Arc::clone(&self.counters),
            password: self.password.clone(),
        }))
    }
}

struct SudoChannel {
    counters: Arc<Counters>,
    password: Option<String>,
}

#[async_trait]
impl SecureChannel for SudoChannel {
    async fn exec(
        &mut self,
        command: &str,
        _pty: Option<PtyDescriptor>,
    ) -> Result<Box<dyn ProcessHandle>, ExecError> {
        self.counters
            .commands
            .lock()
            .unwrap()
            .push(command.to_string());

        let mut process = SudoProcess {
            password: self.password.clone(),
            events: VecDeque::new(),
            stdin: Vec::new(),
            stdin_closed: false,
            done: false,
        };
        if process.password.is_some() {
            process.prompt();
        } else {
            process.succeed();
        }
        Ok(Box::new(process))
    }

    async fn close(&mut self) -> Result<(), ExecError> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct SudoProcess {
    password: Option<String>,
    events: VecDeque<ProcessEvent>,
    stdin: Vec<u8>,
    stdin_closed: bool,
    done: bool,
}

impl SudoProcess {
    fn prompt(&mut self) {
        self.events.push_back(ProcessEvent::Output(
            Stream::Stderr,
            DEFAULT_SUDO_PROMPT.as_bytes().to_vec(),
        ));
    }

    fn succeed(&mut self) {
        self.events
            .push_back(ProcessEvent::Output(Stream::Stdout, b"root\n".to_vec()));
        self.events.push_back(ProcessEvent::Exited(0));
        self.done = true;
    }

    fn give_up(&mut self, message: &str) {
        self.events.push_back(ProcessEvent::Output(
            Stream::Stderr,
            message.as_bytes().to_vec(),
        ));
        self.events.push_back(ProcessEvent::Exited(1));
        self.done = true;
    }
}

#[async_trait]
impl ProcessHandle for SudoProcess {
    async fn next_event(&mut self) -> Result<Option<ProcessEvent>, ExecError> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }
            if self.done {
                return Ok(None);
            }
            if let Some(end) = self.stdin.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.stdin.drain(..=end).collect();
                let attempt = String::from_utf8_lossy(&line[..end]).to_string();
                if Some(attempt) == self.password {
                    self.succeed();
                } else {
                    self.events.push_back(ProcessEvent::Output(
                        Stream::Stderr,
                        b"Sorry, try again.\n".to_vec(),
                    ));
                    self.prompt();
                }
                continue;
            }
            if self.stdin_closed {
                self.give_up("sudo: no password was provided\n");
                continue;
            }
            // waiting for a password that nobody sends
            std::future::pending::<()>().await;
        }
    }

    async fn write_stdin(&mut self, data: &[u8]) -> Result<(), ExecError> {
        self.stdin.extend_from_slice(data);
        Ok(())
    }

    async fn close_stdin(&mut self) -> Result<(), ExecError> {
        self.stdin_closed = true;
        Ok(())
    }

    async fn terminate(&mut self) {
        self.done = true;
    }

    fn has_pty(&self) -> bool {
        false
    }
}

/// Channel whose sessions run a fixed shell script instead of the command
///
/// Stands in for a host where `sudo` is whatever the script does.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    pub counters: Arc<Counters>,
    script: String,
}

impl ScriptedProvider {
    pub fn new(script: &str) -> Self {
        Self {
            counters: Arc::default(),
            script: script.to_string(),
        }
    }
}

#[async_trait]
impl ChannelProvider for ScriptedProvider {
    async fn open(
        &self,
        _endpoint: &Endpoint,
        _options: &ConnectOptions,
    ) -> Result<Box<dyn SecureChannel>, ExecError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedChannel {
            counters: Arc::clone(&self.counters),
            script: self.script.clone(),
            processes: LocalProcessProvider::new(),
        }))
    }
}

struct ScriptedChannel {
    counters: Arc<Counters>,
    script: String,
    processes: LocalProcessProvider,
}

#[async_trait]
impl SecureChannel for ScriptedChannel {
    async fn exec(
        &mut self,
        command: &str,
        pty: Option<PtyDescriptor>,
    ) -> Result<Box<dyn ProcessHandle>, ExecError> {
        self.counters
            .commands
            .lock()
            .unwrap()
            .push(command.to_string());
        let request = ExecRequest {
            command: self.script.clone(),
            pty,
            ..ExecRequest::default()
        };
        self.processes.spawn(&request).await
    }

    async fn close(&mut self) -> Result<(), ExecError> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Password prompt that always answers the same and counts calls
#[derive(Debug)]
pub struct StaticPrompt {
    answer: Option<String>,
    pub calls: AtomicUsize,
}

impl StaticPrompt {
    pub fn answering(answer: Option<&str>) -> Self {
        Self {
            answer: answer.map(str::to_string),
            calls: AtomicUsize::new(0),
        }
    }
}

impl PasswordPrompt for StaticPrompt {
    fn prompt(&self, _endpoint: &Endpoint) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone()
    }
}

/// Providers with the given channel provider and the real local one
pub fn providers(channels: Arc<dyn ChannelProvider>) -> Providers {
    Providers::new(channels, Arc::new(LocalProcessProvider::new()))
}
