//! Debug console exposed by boards with a debug service
//!
//! The terminal characteristic carries stdout (notifications) and stdin (writes); the
//! stderr characteristic carries error output. Writes are limited to 20 bytes each.

use super::{NodeSession, SessionShared};
use std::fmt;
use std::sync::{Arc, Weak};

/// Console traffic reported by the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEvent {
    Stdout(String),
    Stderr(String),
    /// A write to the terminal completed
    StdinSent { message: String, ok: bool },
}

pub trait DebugListener: Send + Sync {
    fn on_stdout(&self, console: &DebugConsole, message: &str);

    fn on_stderr(&self, console: &DebugConsole, message: &str);

    fn on_stdin_sent(&self, _console: &DebugConsole, _message: &str, _ok: bool) {}
}

/// Handle to a session's debug console
#[derive(Clone)]
pub struct DebugConsole {
    session: Weak<SessionShared>,
}

impl DebugConsole {
    pub(super) fn new(session: &Arc<SessionShared>) -> Self {
        Self {
            session: Arc::downgrade(session),
        }
    }

    /// Session owning the console, if it is still alive
    pub fn node(&self) -> Option<NodeSession> {
        self.session.upgrade().map(NodeSession::from_shared)
    }

    /// Send a message to the board's stdin; returns how many bytes were queued.
    ///
    /// At most 20 bytes are taken per call. Callers resend the remainder.
    pub fn write(&self, message: &str) -> usize {
        match self.session.upgrade() {
            Some(shared) => shared.write_debug(message.as_bytes()),
            None => 0,
        }
    }

    /// Install (or with `None` remove) the console listener.
    ///
    /// Installing a listener enables stdout/stderr notifications; removing it disables
    /// them. Returns false if nothing changed.
    pub fn set_listener(&self, listener: Option<Arc<dyn DebugListener>>) -> bool {
        match self.session.upgrade() {
            Some(shared) => shared.set_debug_listener(listener),
            None => false,
        }
    }
}

impl fmt::Debug for DebugConsole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugConsole")
            .field("alive", &(self.session.strong_count() > 0))
            .finish()
    }
}
