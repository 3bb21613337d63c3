//! Output capture and live forwarding

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use crate::options::Hide;
use crate::result::Stream;

/// Destination for live-forwarded command output
pub trait OutputSink: Send + Sync {
    /// Receive one chunk of output
    fn write(&self, stream: Stream, data: &[u8]);
}

/// Echoes output to this process's own stdout/stderr
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleSink;

impl OutputSink for ConsoleSink {
    fn write(&self, stream: Stream, data: &[u8]) {
        // best-effort
        let _ = match stream {
            Stream::Stdout => {
                let mut out = std::io::stdout().lock();
                out.write_all(data).and_then(|()| out.flush())
            }
            Stream::Stderr => {
                let mut err = std::io::stderr().lock();
                err.write_all(data).and_then(|()| err.flush())
            }
        };
    }
}

/// Accumulates both streams for the result and forwards them live
pub(crate) struct Capture {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    hide: Hide,
    console: Arc<dyn OutputSink>,
    sinks: Vec<Arc<dyn OutputSink>>,
}

impl Capture {
    pub(crate) fn new(hide: Hide, sinks: Vec<Arc<dyn OutputSink>>) -> Self {
        Self::with_console(hide, Arc::new(ConsoleSink), sinks)
    }

    pub(crate) fn with_console(
        hide: Hide,
        console: Arc<dyn OutputSink>,
        sinks: Vec<Arc<dyn OutputSink>>,
    ) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            hide,
            console,
            sinks,
        }
    }

    /// Record a chunk; capture happens regardless of `hide`
    pub(crate) fn record(&mut self, stream: Stream, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        match stream {
            Stream::Stdout => self.stdout.extend_from_slice(data),
            Stream::Stderr => self.stderr.extend_from_slice(data),
        }
        if !self.hide.hides(stream) {
            self.console.write(stream, data);
        }
        for sink in &self.sinks {
            sink.write(stream, data);
        }
    }

    /// Captured text so far, without consuming the buffers
    pub(crate) fn snapshot(&self) -> (String, String) {
        (
            String::from_utf8_lossy(&self.stdout).into_owned(),
            String::from_utf8_lossy(&self.stderr).into_owned(),
        )
    }
}

impl fmt::Debug for Capture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capture")
            .field("stdout_bytes", &self.stdout.len())
            .field("stderr_bytes", &self.stderr.len())
            .field("hide", &self.hide)
            .field("sinks", &self.sinks.len())
            .finish_non_exhaustive()
    }
}
