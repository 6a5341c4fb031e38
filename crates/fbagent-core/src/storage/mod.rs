//! Storage primitives: block devices and the volume table.
//!
//! Everything above this layer addresses storage as "bytes at an offset of
//! a named device". The Linux backend goes through the block ioctls; the
//! in-memory backend stands in for it in tests.

pub mod block;
pub mod linux;
pub mod mem;
pub mod volumes;

use thiserror::Error;

use crate::error::ErrorKind;

pub use block::{BlockDevice, SECTOR_SIZE, StorageProvider};
pub use linux::{LinuxBlockDevice, LinuxStorage};
pub use mem::{MemBlockDevice, MemStorage};
pub use volumes::{Volume, VolumeTable};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("unknown volume '{0}'")]
    UnknownVolume(String),

    #[error("cannot open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported sector size {0}")]
    SectorSize(u32),

    #[error("{name} failed: {errno}")]
    Ioctl {
        name: &'static str,
        errno: nix::errno::Errno,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Storage
    }
}
