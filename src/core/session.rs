//! Session lifecycle
//!
//! ```text
//! AwaitingHeader -> Authenticated -> Relaying -> Closing -> Closed
//!       |               |
//!       |               +-> Closing
//!       +-> Rejected
//!       +-> Closing
//! ```

use std::net::SocketAddr;

use super::dns::DNS_PORT;
use super::protocol::{Command, HeaderDescriptor, ProtocolKind};
use crate::error::TunnelError;
use crate::logger::log;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the first inbound chunk
    AwaitingHeader,
    /// Header decoded and credentials accepted
    Authenticated,
    /// Outbound path established
    Relaying,
    /// Teardown in progress
    Closing,
    Closed,
    /// Header or credentials refused; no outbound was ever attempted
    Rejected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::AwaitingHeader => "awaiting_header",
            SessionState::Authenticated => "authenticated",
            SessionState::Relaying => "relaying",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (AwaitingHeader, Authenticated)
                | (AwaitingHeader, Rejected)
                | (AwaitingHeader, Closing)
                | (Authenticated, Relaying)
                | (Authenticated, Closing)
                | (Relaying, Closing)
                | (Closing, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Rejected)
    }
}

/// Outbound path chosen for a decoded header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Tcp,
    /// UDP to port 53, answered over DNS-over-HTTPS
    Dns,
}

/// Pick the outbound path. UDP to anything but port 53 is refused.
pub fn select_route(header: &HeaderDescriptor) -> Result<Route, TunnelError> {
    match header.command {
        Command::Tcp => Ok(Route::Tcp),
        Command::Udp if header.target_port() == DNS_PORT => Ok(Route::Dns),
        Command::Udp => Err(TunnelError::UdpNotAllowed(header.target_port())),
    }
}

/// State of one session, with transitions logged
#[derive(Debug)]
pub struct Session {
    peer: SocketAddr,
    protocol: ProtocolKind,
    state: SessionState,
}

impl Session {
    pub fn new(peer: SocketAddr, protocol: ProtocolKind) -> Self {
        Self {
            peer,
            protocol,
            state: SessionState::AwaitingHeader,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    /// Move to `next`. Illegal transitions are ignored and return false.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            log::debug!(
                peer = %self.peer,
                from = %self.state,
                to = %next,
                "Ignoring invalid session transition"
            );
            return false;
        }
        log::session(&self.peer.to_string(), self.state, next);
        self.state = next;
        true
    }

    /// Closing then Closed, from wherever the session is. No-op once
    /// terminal.
    pub fn close(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if self.state != SessionState::Closing {
            self.transition(SessionState::Closing);
        }
        self.transition(SessionState::Closed);
    }
}
