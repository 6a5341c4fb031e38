//! Protocol module - fastboot wire definitions.

pub mod command;
pub mod constants;
pub mod response;

use thiserror::Error;

use crate::error::ErrorKind;

pub use command::{decode_frame, parse_download_length, split_oem_args};
pub use constants::*;
pub use response::{Response, ResponseCode};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown command")]
    UnknownCommand(String),

    #[error("response too long: {len} bytes (max {max})")]
    ResponseTooLong { len: usize, max: usize },

    #[error("{0}")]
    InvalidArgument(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Protocol
    }
}
