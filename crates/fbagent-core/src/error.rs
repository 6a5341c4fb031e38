//! Error taxonomy shared by every layer of the agent.
//!
//! Each module owns its own `thiserror` enum; `ErrorKind` is the coarse
//! classification the protocol engine uses to decide between dropping the
//! connection and reporting `FAIL` to the host.

use std::fmt;

/// Coarse error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// I/O failure on the host link. Terminates the connection.
    Transport,
    /// Malformed or unknown command, oversized response.
    Protocol,
    /// Read/write/seek/ioctl failure on a block device or file.
    Storage,
    /// Corrupt image or table (sparse header, OSIP checksum, ...).
    Format,
    /// No free slot or not enough room on the device.
    Capacity,
}

impl ErrorKind {
    /// Short label used as a fallback `FAIL` reason.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport error",
            ErrorKind::Protocol => "protocol error",
            ErrorKind::Storage => "storage error",
            ErrorKind::Format => "format error",
            ErrorKind::Capacity => "no space",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}
