//! Protocol state of one host connection.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolState {
    /// No command read yet.
    #[default]
    Offline,
    /// A command is being handled and has not been acknowledged.
    Command,
    /// The current command was acknowledged.
    Complete,
    /// The link failed; the connection is torn down.
    Error,
}

impl ProtocolState {
    /// Whether an acknowledgement would reach the host.
    pub fn accepts_ack(&self) -> bool {
        matches!(self, ProtocolState::Command)
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolState::Offline => write!(f, "OFFLINE"),
            ProtocolState::Command => write!(f, "COMMAND"),
            ProtocolState::Complete => write!(f, "COMPLETE"),
            ProtocolState::Error => write!(f, "ERROR"),
        }
    }
}
