//! Terminal password prompt for sudo

use std::io::{self, Write};

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use hostrun_exec::Endpoint;
use hostrun_exec::traits::PasswordPrompt;
use tracing::warn;

/// Reads the sudo password from the controlling terminal without echo
#[derive(Debug, Default)]
pub struct TerminalPrompt;

impl PasswordPrompt for TerminalPrompt {
    fn prompt(&self, endpoint: &Endpoint) -> Option<String> {
        let mut stderr = io::stderr();
        let _ = write!(stderr, "[sudo] password for {endpoint}: ");
        let _ = stderr.flush();

        if let Err(e) = enable_raw_mode() {
            warn!(error = %e, "cannot switch terminal to raw mode");
            return None;
        }
        let password = read_password();
        let _ = disable_raw_mode();

        let _ = writeln!(stderr);
        password
    }
}

/// `None` on Esc, Ctrl-C or a read error
fn read_password() -> Option<String> {
    let mut password = String::new();
    loop {
        let KeyEvent {
            code,
            modifiers,
            kind,
            ..
        } = match event::read() {
            Ok(Event::Key(key)) => key,
            Ok(_) => continue,
            Err(_) => return None,
        };
        if kind == KeyEventKind::Release {
            continue;
        }
        match code {
            KeyCode::Enter => return Some(password),
            KeyCode::Esc => return None,
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => return None,
            KeyCode::Backspace => {
                password.pop();
            }
            KeyCode::Char(c) => password.push(c),
            _ => {}
        }
    }
}
