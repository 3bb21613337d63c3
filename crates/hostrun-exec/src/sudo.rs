//! Sudo password prompt detection
//!
//! Sudo is invoked with `-S -p <prompt>`, so it prints a known prompt and
//! reads the password from stdin. [`PromptWatcher`] sits between the process
//! output and the capture: it holds back output until it can tell whether a
//! prompt is coming, strips the prompt, asks for the password to be sent, and
//! then watches for sudo rejecting it.
//!
//! Sudo talks on stderr, or on the merged stream when a pty is attached. Any
//! output on the other stream comes from the command itself, so escalation is
//! over and the watcher steps aside.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::SudoConfig;
use crate::result::Stream;

/// What sudo prints after a wrong password
pub const REJECTION_SENTINEL: &str = "Sorry, try again.";

/// Escalation progress for one sudo invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationState {
    AwaitingPromptOrOutput,
    PromptSeen,
    PasswordSent,
    Running,
    Rejected,
}

impl fmt::Display for EscalationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EscalationState::AwaitingPromptOrOutput => "awaiting_prompt_or_output",
            EscalationState::PromptSeen => "prompt_seen",
            EscalationState::PasswordSent => "password_sent",
            EscalationState::Running => "running",
            EscalationState::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Instruction from the watcher to the execution loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchAction {
    /// Pass this output on to the capture
    Emit(Stream, Vec<u8>),
    /// Write the password to stdin, then call [`PromptWatcher::password_sent`]
    SendPassword,
    /// Escalation failed
    Reject(String),
}

/// Scans early sudo output for the password prompt
#[derive(Debug)]
pub struct PromptWatcher {
    prompt: Vec<u8>,
    sudo_stream: Stream,
    window_bytes: usize,
    deadline: Instant,
    state: EscalationState,
    held: Vec<u8>,
    scanned: usize,
}

impl PromptWatcher {
    /// Start watching; the time window starts now
    #[must_use]
    pub fn new(config: &SudoConfig, pty: bool) -> Self {
        Self::with_window(
            &config.prompt,
            pty,
            config.detection_window_bytes,
            config.detection_window(),
        )
    }

    /// Start watching with explicit windows
    #[must_use]
    pub fn with_window(prompt: &str, pty: bool, window_bytes: usize, window: Duration) -> Self {
        Self {
            prompt: prompt.as_bytes().to_vec(),
            sudo_stream: if pty { Stream::Stdout } else { Stream::Stderr },
            window_bytes,
            deadline: Instant::now() + window,
            state: EscalationState::AwaitingPromptOrOutput,
            held: Vec::new(),
            scanned: 0,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> EscalationState {
        self.state
    }

    /// When prompt detection gives up, if it is still waiting
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        (self.state == EscalationState::AwaitingPromptOrOutput).then_some(self.deadline)
    }

    /// Feed one chunk of process output
    pub fn feed(&mut self, stream: Stream, data: &[u8]) -> Vec<WatchAction> {
        match self.state {
            EscalationState::Running => vec![WatchAction::Emit(stream, data.to_vec())],
            EscalationState::Rejected => {
                let data = if stream == self.sudo_stream {
                    strip_all(data, &self.prompt)
                } else {
                    data.to_vec()
                };
                emit(stream, data)
            }
            _ if stream != self.sudo_stream => {
                // the command is already running
                self.state = EscalationState::Running;
                let mut actions = self.flush();
                actions.push(WatchAction::Emit(stream, data.to_vec()));
                actions
            }
            EscalationState::AwaitingPromptOrOutput => self.feed_awaiting(data),
            EscalationState::PromptSeen | EscalationState::PasswordSent => {
                self.feed_after_send(data)
            }
        }
    }

    /// The password has been written to stdin
    pub fn password_sent(&mut self) {
        if self.state == EscalationState::PromptSeen {
            self.state = EscalationState::PasswordSent;
        }
    }

    /// Escalation failed for a reason found outside the output
    pub fn reject(&mut self) {
        self.state = EscalationState::Rejected;
    }

    /// The time window ran out; assume password-less sudo
    pub fn expire(&mut self) -> Vec<WatchAction> {
        if self.state != EscalationState::AwaitingPromptOrOutput {
            return Vec::new();
        }
        self.state = EscalationState::Running;
        self.flush()
    }

    /// Process output ended; release anything still held back
    pub fn finish(&mut self) -> Vec<WatchAction> {
        if matches!(
            self.state,
            EscalationState::AwaitingPromptOrOutput | EscalationState::PasswordSent
        ) {
            self.state = EscalationState::Running;
        }
        self.flush()
    }

    fn feed_awaiting(&mut self, data: &[u8]) -> Vec<WatchAction> {
        self.scanned += data.len();
        self.held.extend_from_slice(data);

        // sudo blocks on stdin right after printing the prompt
        if self.held.ends_with(&self.prompt) {
            self.held.truncate(self.held.len() - self.prompt.len());
            self.state = EscalationState::PromptSeen;
            let mut actions = self.flush();
            actions.push(WatchAction::SendPassword);
            return actions;
        }

        if self.scanned > self.window_bytes {
            self.state = EscalationState::Running;
            return self.flush();
        }

        Vec::new()
    }

    fn feed_after_send(&mut self, data: &[u8]) -> Vec<WatchAction> {
        self.held.extend_from_slice(data);
        let reply = self.held.trim_ascii_start();
        let sentinel = REJECTION_SENTINEL.as_bytes();

        if reply.starts_with(sentinel) || reply.starts_with(&self.prompt) {
            self.state = EscalationState::Rejected;
            let held = std::mem::take(&mut self.held);
            let mut actions = emit(self.sudo_stream, strip_all(&held, &self.prompt));
            actions.push(WatchAction::Reject("sudo rejected the password".to_string()));
            return actions;
        }

        let undecided = sentinel.starts_with(reply) || self.prompt.starts_with(reply);
        if undecided && self.held.len() <= self.window_bytes {
            return Vec::new();
        }

        self.state = EscalationState::Running;
        self.flush()
    }

    fn flush(&mut self) -> Vec<WatchAction> {
        emit(self.sudo_stream, std::mem::take(&mut self.held))
    }
}

fn emit(stream: Stream, data: Vec<u8>) -> Vec<WatchAction> {
    if data.is_empty() {
        Vec::new()
    } else {
        vec![WatchAction::Emit(stream, data)]
    }
}

/// Remove every occurrence of `needle`
fn strip_all(haystack: &[u8], needle: &[u8]) -> Vec<u8> {
    if needle.is_empty() {
        return haystack.to_vec();
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(pos) = rest.windows(needle.len()).position(|w| w == needle) {
        out.extend_from_slice(&rest[..pos]);
        rest = &rest[pos + needle.len()..];
    }
    out.extend_from_slice(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_SUDO_PROMPT;

    fn watcher() -> PromptWatcher {
        PromptWatcher::with_window(DEFAULT_SUDO_PROMPT, false, 64, Duration::from_secs(60))
    }

    fn sent() -> PromptWatcher {
        let mut watcher = watcher();
        watcher.feed(Stream::Stderr, b"[sudo] password: ");
        watcher.password_sent();
        watcher
    }

    #[test]
    fn test_prompt_is_stripped_and_password_requested() {
        let mut watcher = watcher();
        let actions = watcher.feed(Stream::Stderr, b"[sudo] password: ");
        assert_eq!(actions, vec![WatchAction::SendPassword]);
        assert_eq!(watcher.state(), EscalationState::PromptSeen);

        watcher.password_sent();
        assert_eq!(watcher.state(), EscalationState::PasswordSent);
        assert!(watcher.deadline().is_none());

        let actions = watcher.feed(Stream::Stdout, b"root\n");
        assert_eq!(actions, vec![WatchAction::Emit(Stream::Stdout, b"root\n".to_vec())]);
        assert_eq!(watcher.state(), EscalationState::Running);
    }

    #[test]
    fn test_prompt_split_across_chunks() {
        let mut watcher = watcher();
        assert!(watcher.feed(Stream::Stderr, b"[sudo] pass").is_empty());
        let actions = watcher.feed(Stream::Stderr, b"word: ");
        assert_eq!(actions, vec![WatchAction::SendPassword]);
    }

    #[test]
    fn test_output_before_prompt_is_kept() {
        let mut watcher = watcher();
        let actions = watcher.feed(Stream::Stderr, b"sudo: unable to resolve host\n[sudo] password: ");
        assert_eq!(
            actions,
            vec![
                WatchAction::Emit(Stream::Stderr, b"sudo: unable to resolve host\n".to_vec()),
                WatchAction::SendPassword,
            ]
        );
    }

    #[test]
    fn test_stdout_never_holds_the_prompt() {
        let mut watcher = watcher();
        let line = b"doc: [sudo] password: is the default\n";
        let actions = watcher.feed(Stream::Stdout, line);
        assert_eq!(actions, vec![WatchAction::Emit(Stream::Stdout, line.to_vec())]);
        assert_eq!(watcher.state(), EscalationState::Running);

        // later prompt text is command output too
        let actions = watcher.feed(Stream::Stderr, b"[sudo] password: ");
        assert_eq!(
            actions,
            vec![WatchAction::Emit(Stream::Stderr, b"[sudo] password: ".to_vec())]
        );
    }

    #[test]
    fn test_prompt_text_mid_output_is_not_a_prompt() {
        let mut watcher = watcher();
        assert!(watcher.feed(Stream::Stderr, b"[sudo] password: is the default\n").is_empty());
        let actions = watcher.expire();
        assert_eq!(
            actions,
            vec![WatchAction::Emit(
                Stream::Stderr,
                b"[sudo] password: is the default\n".to_vec()
            )]
        );
    }

    #[test]
    fn test_pty_prompt_arrives_on_stdout() {
        let mut watcher =
            PromptWatcher::with_window(DEFAULT_SUDO_PROMPT, true, 64, Duration::from_secs(60));
        let actions = watcher.feed(Stream::Stdout, b"[sudo] password: ");
        assert_eq!(actions, vec![WatchAction::SendPassword]);
        watcher.password_sent();

        assert!(watcher.feed(Stream::Stdout, b"\r\n").is_empty());
        let actions = watcher.feed(Stream::Stdout, b"root\r\n");
        assert_eq!(
            actions,
            vec![WatchAction::Emit(Stream::Stdout, b"\r\nroot\r\n".to_vec())]
        );
        assert_eq!(watcher.state(), EscalationState::Running);
    }

    #[test]
    fn test_wrong_password_is_rejected_and_reprompt_dropped() {
        let mut watcher = sent();

        let actions = watcher.feed(Stream::Stderr, b"Sorry, try again.\n");
        assert_eq!(
            actions,
            vec![
                WatchAction::Emit(Stream::Stderr, b"Sorry, try again.\n".to_vec()),
                WatchAction::Reject("sudo rejected the password".to_string()),
            ]
        );
        assert_eq!(watcher.state(), EscalationState::Rejected);

        assert!(watcher.feed(Stream::Stderr, b"[sudo] password: ").is_empty());
        let actions = watcher.feed(Stream::Stderr, b"sudo: no password was provided\n");
        assert_eq!(
            actions,
            vec![WatchAction::Emit(
                Stream::Stderr,
                b"sudo: no password was provided\n".to_vec()
            )]
        );
    }

    #[test]
    fn test_sentinel_and_reprompt_in_one_chunk() {
        let mut watcher = sent();
        let actions = watcher.feed(Stream::Stderr, b"Sorry, try again.\n[sudo] password: ");
        assert_eq!(
            actions[0],
            WatchAction::Emit(Stream::Stderr, b"Sorry, try again.\n".to_vec())
        );
        assert!(matches!(actions[1], WatchAction::Reject(_)));
    }

    #[test]
    fn test_reprompt_alone_is_rejected() {
        let mut watcher = sent();
        let actions = watcher.feed(Stream::Stderr, b"\n[sudo] password: ");
        assert_eq!(
            actions,
            vec![
                WatchAction::Emit(Stream::Stderr, b"\n".to_vec()),
                WatchAction::Reject("sudo rejected the password".to_string()),
            ]
        );
    }

    #[test]
    fn test_sentinel_in_command_output_is_not_a_rejection() {
        let mut watcher = sent();
        let actions = watcher.feed(Stream::Stdout, b"log: Sorry, try again.\n");
        assert_eq!(
            actions,
            vec![WatchAction::Emit(Stream::Stdout, b"log: Sorry, try again.\n".to_vec())]
        );
        assert_eq!(watcher.state(), EscalationState::Running);

        let mut watcher = sent();
        let actions = watcher.feed(Stream::Stderr, b"warning: Sorry, try again.\n");
        assert_eq!(actions.len(), 1);
        assert_eq!(watcher.state(), EscalationState::Running);
    }

    #[test]
    fn test_partial_sentinel_is_held_until_decided() {
        let mut watcher = sent();
        assert!(watcher.feed(Stream::Stderr, b"Sorry, ").is_empty());
        assert_eq!(watcher.state(), EscalationState::PasswordSent);
        let actions = watcher.feed(Stream::Stderr, b"try again.\n");
        assert!(matches!(actions.last(), Some(WatchAction::Reject(_))));
    }

    #[test]
    fn test_byte_window_means_passwordless() {
        let mut watcher = watcher();
        assert!(watcher.feed(Stream::Stderr, b"some warning\n").is_empty());
        let big = vec![b'x'; 64];
        let actions = watcher.feed(Stream::Stderr, &big);
        assert_eq!(watcher.state(), EscalationState::Running);

        let mut expected = b"some warning\n".to_vec();
        expected.extend_from_slice(&big);
        assert_eq!(actions, vec![WatchAction::Emit(Stream::Stderr, expected)]);
    }

    #[test]
    fn test_expire_flushes_held_output() {
        let mut watcher = watcher();
        watcher.feed(Stream::Stderr, b"note\n");
        assert!(watcher.deadline().is_some());

        let actions = watcher.expire();
        assert_eq!(
            actions,
            vec![WatchAction::Emit(Stream::Stderr, b"note\n".to_vec())]
        );
        assert_eq!(watcher.state(), EscalationState::Running);
        assert!(watcher.expire().is_empty());
    }

    #[test]
    fn test_finish_releases_output() {
        let mut watcher = watcher();
        watcher.feed(Stream::Stderr, b"done\n");
        assert_eq!(
            watcher.finish(),
            vec![WatchAction::Emit(Stream::Stderr, b"done\n".to_vec())]
        );
    }

    #[test]
    fn test_strip_all() {
        assert_eq!(strip_all(b"a--b--c", b"--"), b"abc".to_vec());
        assert_eq!(strip_all(b"abc", b""), b"abc".to_vec());
    }
}
