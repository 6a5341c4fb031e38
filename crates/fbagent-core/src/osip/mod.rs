//! OSIP (OS Image Profile) table management.
//!
//! The OSIP header at the start of the boot device lists up to eight
//! images (kernel, recovery, provisioning OS, firmware, splash screens...).
//! Images live in fixed slots; updates are write-then-commit.

pub mod commands;
pub mod header;
pub mod manager;
pub mod slots;

use thiserror::Error;

use crate::error::ErrorKind;
use crate::storage::StorageError;

pub use commands::OsipPlugin;
pub use header::{Attribute, ImageClass, Osii, OsipHeader};
pub use manager::{IndexMode, OsipManager, destination_attribute};
pub use slots::{FIRMWARE_POOL, OS_POOL, SlotPool};

#[derive(Error, Debug)]
pub enum OsipError {
    #[error("OSIP is corrupt (checksum residue 0x{checksum:02X})")]
    Corrupt { checksum: u8 },

    #[error("OSIP header too short: {0} bytes")]
    TooShort(usize),

    #[error("no space in the {pool} slot pool")]
    NoSpace { pool: &'static str },

    #[error("image of {sectors} sectors exceeds slot size {max}")]
    ImageTooLarge { sectors: u64, max: u32 },

    #[error("unhandled attribute 0x{0:02X}")]
    UnhandledAttribute(u8),

    #[error("descriptor index {0} out of range")]
    BadIndex(usize),

    #[error("malformed image: {0}")]
    MalformedImage(String),

    #[error("unknown OSIP destination '{0}'")]
    UnknownDestination(String),

    #[error("no OSII for '{0}'")]
    DescriptorNotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OsipError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OsipError::Corrupt { .. } | OsipError::TooShort(_) | OsipError::MalformedImage(_) => {
                ErrorKind::Format
            }
            OsipError::NoSpace { .. } | OsipError::ImageTooLarge { .. } => ErrorKind::Capacity,
            OsipError::BadIndex(_)
            | OsipError::UnhandledAttribute(_)
            | OsipError::UnknownDestination(_)
            | OsipError::DescriptorNotFound(_) => ErrorKind::Protocol,
            OsipError::Storage(_) | OsipError::Io(_) => ErrorKind::Storage,
        }
    }
}
