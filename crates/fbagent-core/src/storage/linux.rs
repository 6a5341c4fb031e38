//! Block device backend over Linux device nodes.
//!
//! Regular files are accepted as well (disk images); ioctls are only issued
//! against real block devices.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::mem::MaybeUninit;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::block::{BlockDevice, SECTOR_SIZE, StorageProvider};
use super::StorageError;

/// Sectors per track assumed for image files.
const DEFAULT_SECTORS_PER_TRACK: u32 = 63;

/// An open block device node or image file.
pub struct LinuxBlockDevice {
    file: File,
    path: PathBuf,
    is_block: bool,
}

impl LinuxBlockDevice {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| StorageError::Open {
                path: path.display().to_string(),
                source,
            })?;
        let is_block = file.metadata()?.file_type().is_block_device();
        debug!(path = %path.display(), is_block, "Opened storage device");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            is_block,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Read for LinuxBlockDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for LinuxBlockDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for LinuxBlockDevice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl BlockDevice for LinuxBlockDevice {
    fn size_bytes(&mut self) -> Result<u64, StorageError> {
        if !self.is_block {
            return Ok(self.file.metadata()?.len());
        }
        let mut size = 0u64;
        unsafe { ioctl::blkgetsize64(self.file.as_raw_fd(), &mut size) }
            .map_err(|errno| StorageError::Ioctl {
                name: "BLKGETSIZE64",
                errno,
            })?;
        Ok(size)
    }

    fn sector_size(&mut self) -> Result<u32, StorageError> {
        if !self.is_block {
            return Ok(SECTOR_SIZE as u32);
        }
        let mut size: nix::libc::c_int = 0;
        unsafe { ioctl::blksszget(self.file.as_raw_fd(), &mut size) }.map_err(|errno| {
            StorageError::Ioctl {
                name: "BLKSSZGET",
                errno,
            }
        })?;
        Ok(size as u32)
    }

    fn sectors_per_track(&mut self) -> Result<u32, StorageError> {
        if !self.is_block {
            return Ok(DEFAULT_SECTORS_PER_TRACK);
        }
        let geometry = unsafe {
            let mut geo = MaybeUninit::<ioctl::hd_geometry>::uninit();
            ioctl::hdio_getgeo(self.file.as_raw_fd(), geo.as_mut_ptr()).map_err(|errno| {
                StorageError::Ioctl {
                    name: "HDIO_GETGEO",
                    errno,
                }
            })?;
            geo.assume_init()
        };
        Ok(geometry.sectors as u32)
    }

    fn discard(&mut self, offset: u64, len: u64) -> Result<(), StorageError> {
        if !self.is_block {
            // Image files: zero the range instead
            self.file.seek(SeekFrom::Start(offset))?;
            io::copy(&mut io::repeat(0).take(len), &mut self.file)?;
            return Ok(());
        }
        let range = [offset, len];
        unsafe { ioctl::blkdiscard(self.file.as_raw_fd(), &range) }.map_err(|errno| {
            StorageError::Ioctl {
                name: "BLKDISCARD",
                errno,
            }
        })?;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.file.sync_all()?;
        Ok(())
    }

    fn reload_partition_table(&mut self) -> Result<(), StorageError> {
        if !self.is_block {
            return Ok(());
        }
        unsafe { ioctl::blkrrpart(self.file.as_raw_fd()) }.map_err(|errno| {
            StorageError::Ioctl {
                name: "BLKRRPART",
                errno,
            }
        })?;
        Ok(())
    }
}

/// Opens device nodes from the real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxStorage;

impl StorageProvider for LinuxStorage {
    fn open(&self, path: &Path) -> Result<Box<dyn BlockDevice>, StorageError> {
        Ok(Box::new(LinuxBlockDevice::open(path)?))
    }
}

mod ioctl {
    //! Block layer ioctls from `linux/fs.h` and `linux/hdreg.h`

    use nix::{ioctl_none, ioctl_read, ioctl_read_bad, ioctl_write_ptr_bad, request_code_none};

    const BLK_IOC_MAGIC: u8 = 0x12;

    #[allow(non_camel_case_types)]
    #[repr(C)]
    pub struct hd_geometry {
        pub heads: u8,
        pub sectors: u8,
        pub cylinders: u16,
        pub start: nix::libc::c_ulong,
    }

    ioctl_none!(blkrrpart, BLK_IOC_MAGIC, 95);
    ioctl_read_bad!(
        blksszget,
        request_code_none!(BLK_IOC_MAGIC, 104),
        nix::libc::c_int
    );
    ioctl_read!(blkgetsize64, BLK_IOC_MAGIC, 114, u64);
    ioctl_write_ptr_bad!(blkdiscard, request_code_none!(BLK_IOC_MAGIC, 119), [u64; 2]);
    ioctl_read_bad!(hdio_getgeo, 0x0301, hd_geometry);
}
