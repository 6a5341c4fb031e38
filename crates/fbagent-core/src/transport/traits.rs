//! Transport layer abstraction.
//!
//! Defines the `Transport` trait the protocol engine talks through,
//! allowing different backends (USB function device, FunctionFS, TCP, mock).

use std::fmt;

use thiserror::Error;

use crate::error::ErrorKind;
use crate::protocol::COMMAND_FRAME_SIZE;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No transport available: {0}")]
    NotAvailable(String),

    #[error("Failed to open {path}: {message}")]
    OpenFailed { path: String, message: String },

    #[error("Descriptor handshake failed: {0}")]
    Handshake(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("Host disconnected")]
    Disconnected,

    #[error("Wait failed: {0}")]
    Poll(#[from] nix::errno::Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Transport
    }
}

/// Which backend carries a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Dedicated USB function device node.
    UsbDevice,
    /// Kernel FunctionFS gadget endpoints.
    FunctionFs,
    /// TCP fallback socket.
    Tcp,
    /// In-process test or script transport.
    Loopback,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::UsbDevice => write!(f, "usb"),
            TransportKind::FunctionFs => write!(f, "functionfs"),
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Loopback => write!(f, "loopback"),
        }
    }
}

/// Byte-stream link to the host.
///
/// Implementations are blocking; a read returning `Ok(0)` means the host
/// went away.
pub trait Transport: Send {
    /// Read up to `buf.len()` bytes.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write bytes, returning how many were accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Backend carrying this link.
    fn kind(&self) -> TransportKind;

    /// Write the whole buffer.
    fn write_all(&mut self, mut data: &[u8]) -> Result<(), TransportError> {
        while !data.is_empty() {
            match self.write(data)? {
                0 => return Err(TransportError::Disconnected),
                n => data = &data[n..],
            }
        }
        Ok(())
    }

    /// Read one command frame.
    ///
    /// A frame is exactly one read of at most 64 bytes. A failed or empty
    /// read is a hard error; a partial frame is never completed by a second
    /// read since that would consume the next command.
    fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut frame = [0u8; COMMAND_FRAME_SIZE];
        match self.read(&mut frame)? {
            0 => Err(TransportError::Disconnected),
            n => Ok(frame[..n].to_vec()),
        }
    }
}
