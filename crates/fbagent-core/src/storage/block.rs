//! Block device abstraction.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::StorageError;

/// Logical sector size every on-disk structure is expressed in.
pub const SECTOR_SIZE: u64 = 512;

/// A seekable raw device (whole disk, partition, or image file).
pub trait BlockDevice: Read + Write + Seek + Send {
    /// Total size in bytes.
    fn size_bytes(&mut self) -> Result<u64, StorageError>;

    /// Logical sector size in bytes.
    fn sector_size(&mut self) -> Result<u32, StorageError>;

    /// Sectors per track from the drive geometry.
    fn sectors_per_track(&mut self) -> Result<u32, StorageError>;

    /// Discard `len` bytes starting at `offset`.
    fn discard(&mut self, offset: u64, len: u64) -> Result<(), StorageError>;

    /// Flush written data to stable storage.
    fn sync(&mut self) -> Result<(), StorageError>;

    /// Ask the kernel to re-read the partition table.
    fn reload_partition_table(&mut self) -> Result<(), StorageError>;

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)?;
        Ok(())
    }

    fn write_all_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(data)?;
        Ok(())
    }
}

/// Opens block devices by path.
pub trait StorageProvider: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn BlockDevice>, StorageError>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for Box<T> {
    fn size_bytes(&mut self) -> Result<u64, StorageError> {
        (**self).size_bytes()
    }

    fn sector_size(&mut self) -> Result<u32, StorageError> {
        (**self).sector_size()
    }

    fn sectors_per_track(&mut self) -> Result<u32, StorageError> {
        (**self).sectors_per_track()
    }

    fn discard(&mut self, offset: u64, len: u64) -> Result<(), StorageError> {
        (**self).discard(offset, len)
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        (**self).sync()
    }

    fn reload_partition_table(&mut self) -> Result<(), StorageError> {
        (**self).reload_partition_table()
    }
}
