//! Pseudo-terminal geometry

use serde::{Deserialize, Serialize};

use crate::error::ExecError;

/// Geometry used when there is no terminal to ask
pub const FALLBACK_COLS: u16 = 80;
/// Geometry used when there is no terminal to ask
pub const FALLBACK_ROWS: u16 = 24;

/// Requested or negotiated terminal geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyDescriptor {
    rows: u16,
    cols: u16,
}

impl PtyDescriptor {
    /// Create a descriptor
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` if either dimension is zero
    pub fn new(rows: u16, cols: u16) -> Result<Self, ExecError> {
        if rows == 0 || cols == 0 {
            return Err(ExecError::ConfigError(format!(
                "pty geometry must be positive, got {rows} rows x {cols} cols"
            )));
        }
        Ok(Self { rows, cols })
    }

    /// Geometry of the invoking terminal, or 80x24 without one
    #[must_use]
    pub fn from_terminal() -> Self {
        match crossterm::terminal::size() {
            Ok((cols, rows)) if cols > 0 && rows > 0 => Self { rows, cols },
            _ => Self {
                rows: FALLBACK_ROWS,
                cols: FALLBACK_COLS,
            },
        }
    }

    /// Terminal height
    #[must_use]
    pub fn rows(&self) -> u16 {
        self.rows
    }

    /// Terminal width
    #[must_use]
    pub fn cols(&self) -> u16 {
        self.cols
    }
}

/// Caller intent for a pseudo-terminal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PtyRequest {
    /// No pty
    #[default]
    Off,
    /// Use a pty sized like the invoking terminal
    Auto,
    /// Use a pty of exactly this size
    Fixed(PtyDescriptor),
}

impl PtyRequest {
    /// Turn intent into a concrete geometry, `None` meaning no pty
    #[must_use]
    pub fn resolve(&self) -> Option<PtyDescriptor> {
        match self {
            PtyRequest::Off => None,
            PtyRequest::Auto => Some(PtyDescriptor::from_terminal()),
            PtyRequest::Fixed(descriptor) => Some(*descriptor),
        }
    }
}

impl From<bool> for PtyRequest {
    fn from(enabled: bool) -> Self {
        if enabled {
            PtyRequest::Auto
        } else {
            PtyRequest::Off
        }
    }
}

impl From<PtyDescriptor> for PtyRequest {
    fn from(descriptor: PtyDescriptor) -> Self {
        PtyRequest::Fixed(descriptor)
    }
}
