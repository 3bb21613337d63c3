//! Result types for command execution

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One of the two output streams of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    /// Standard output (also carries everything under a pty)
    Stdout,
    /// Standard error
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => f.write_str("stdout"),
            Stream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Outcome of one command executed on one target
///
/// Read-only once built. A command run under a pty reports everything
/// through `stdout` with `\r\n` line endings; `stderr` stays empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    command: String,
    stdout: String,
    stderr: String,
    exited: i32,
    pty: bool,
    duration: Duration,
}

impl CommandResult {
    /// Build a result record
    pub fn new(
        command: impl Into<String>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        exited: i32,
        pty: bool,
        duration: Duration,
    ) -> Self {
        Self {
            command: command.into(),
            stdout: stdout.into(),
            stderr: stderr.into(),
            exited,
            pty,
            duration,
        }
    }

    /// Command as issued by the caller
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Captured stdout
    #[must_use]
    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    /// Captured stderr
    #[must_use]
    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Exit status (-1 when none was reported)
    #[must_use]
    pub fn exited(&self) -> i32 {
        self.exited
    }

    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn ok(&self) -> bool {
        self.exited == 0
    }

    /// Check if command failed
    #[must_use]
    pub fn failed(&self) -> bool {
        !self.ok()
    }

    /// Whether a pseudo-terminal was used
    #[must_use]
    pub fn pty(&self) -> bool {
        self.pty
    }

    /// Time taken to execute
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Captured text of one stream
    #[must_use]
    pub fn stream(&self, stream: Stream) -> &str {
        match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        }
    }

    /// Combine stdout and stderr
    #[must_use]
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Last `lines` lines of a stream, newline-terminated
    #[must_use]
    pub fn tail(&self, stream: Stream, lines: usize) -> String {
        let text = self.stream(stream);
        let all: Vec<&str> = text.lines().collect();
        let start = all.len().saturating_sub(lines);
        let mut out = String::new();
        for line in &all[start..] {
            out.push_str(line.trim_end_matches('\r'));
            out.push('\n');
        }
        out
    }
}
