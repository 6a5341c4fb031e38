//! MBR/EBR partition table writer.
//!
//! Up to three partitions go into the MBR itself. Every further partition
//! gets its own Extended Boot Record one track before its first sector,
//! chained from the previous one.

pub mod commands;
pub mod table;

use thiserror::Error;

use crate::error::ErrorKind;
use crate::storage::StorageError;

pub use commands::MbrPlugin;
pub use table::{
    PartitionEntry, PartitionKind, PartitionPlan, layout_from_volumes, read_partitions,
};

#[derive(Error, Debug)]
pub enum MbrError {
    #[error("no space left: plan needs {needed} sectors, device has {available}")]
    NoSpace { needed: u64, available: u64 },

    #[error("partition plan is empty")]
    EmptyPlan,

    #[error("sector {0} does not fit in a partition entry")]
    OutOfRange(u64),

    #[error("bad partition table signature at sector {0}")]
    BadSignature(u64),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MbrError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MbrError::NoSpace { .. } | MbrError::OutOfRange(_) => ErrorKind::Capacity,
            MbrError::EmptyPlan => ErrorKind::Protocol,
            MbrError::BadSignature(_) => ErrorKind::Format,
            MbrError::Storage(e) => e.kind(),
            MbrError::Io(_) => ErrorKind::Storage,
        }
    }
}
