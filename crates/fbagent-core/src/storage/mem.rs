//! In-memory block devices for testing.
//!
//! Storage is kept per sector, so a device can declare a size far larger
//! than the bytes actually touched. Clones share the same contents, which
//! lets a test inspect a device after handing a handle to the code under
//! test.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use super::block::{BlockDevice, SECTOR_SIZE, StorageProvider};
use super::StorageError;

const SECTOR: usize = SECTOR_SIZE as usize;

#[derive(Debug, Default)]
struct MemDisk {
    size: u64,
    sectors: BTreeMap<u64, Box<[u8; SECTOR]>>,
    sectors_per_track: u32,
    discards: Vec<(u64, u64)>,
    syncs: usize,
    reloads: usize,
}

impl MemDisk {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let end = (offset + buf.len() as u64).min(self.size);
        let mut pos = offset;
        while pos < end {
            let lba = pos / SECTOR_SIZE;
            let within = (pos % SECTOR_SIZE) as usize;
            let n = (SECTOR - within).min((end - pos) as usize);
            let dst = &mut buf[(pos - offset) as usize..][..n];
            match self.sectors.get(&lba) {
                Some(sector) => dst.copy_from_slice(&sector[within..within + n]),
                None => dst.fill(0),
            }
            pos += n as u64;
        }
        end.saturating_sub(offset) as usize
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> usize {
        let end = (offset + data.len() as u64).min(self.size);
        let mut pos = offset;
        while pos < end {
            let lba = pos / SECTOR_SIZE;
            let within = (pos % SECTOR_SIZE) as usize;
            let n = (SECTOR - within).min((end - pos) as usize);
            let sector = self
                .sectors
                .entry(lba)
                .or_insert_with(|| Box::new([0u8; SECTOR]));
            sector[within..within + n].copy_from_slice(&data[(pos - offset) as usize..][..n]);
            pos += n as u64;
        }
        end.saturating_sub(offset) as usize
    }
}

/// A fixed-size device backed by memory.
#[derive(Debug, Clone)]
pub struct MemBlockDevice {
    disk: Arc<Mutex<MemDisk>>,
    pos: u64,
}

impl MemBlockDevice {
    /// Create a zero-filled device of `size` bytes with 63 sectors per track.
    pub fn new(size: u64) -> Self {
        Self::with_geometry(size, 63)
    }

    pub fn with_geometry(size: u64, sectors_per_track: u32) -> Self {
        Self {
            disk: Arc::new(Mutex::new(MemDisk {
                size,
                sectors_per_track,
                ..Default::default()
            })),
            pos: 0,
        }
    }

    fn disk(&self) -> std::sync::MutexGuard<'_, MemDisk> {
        self.disk.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A new handle on the same contents, positioned at the start.
    pub fn handle(&self) -> Self {
        Self {
            disk: Arc::clone(&self.disk),
            pos: 0,
        }
    }

    /// Copy `len` bytes starting at `offset`.
    pub fn contents(&self, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let n = self.disk().read_at(offset, &mut buf);
        buf.truncate(n);
        buf
    }

    /// Fill a range with `byte`.
    pub fn fill(&self, offset: u64, len: usize, byte: u8) {
        self.disk().write_at(offset, &vec![byte; len]);
    }

    pub fn discards(&self) -> Vec<(u64, u64)> {
        self.disk().discards.clone()
    }

    pub fn sync_count(&self) -> usize {
        self.disk().syncs
    }

    pub fn reload_count(&self) -> usize {
        self.disk().reloads
    }
}

impl Read for MemBlockDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.disk().read_at(self.pos, buf);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MemBlockDevice {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let n = self.disk().write_at(self.pos, data);
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write past end of device",
            ));
        }
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemBlockDevice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.disk().size as i128;
        let target = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::End(n) => size + n as i128,
            SeekFrom::Current(n) => self.pos as i128 + n as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of device",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

impl BlockDevice for MemBlockDevice {
    fn size_bytes(&mut self) -> Result<u64, StorageError> {
        Ok(self.disk().size)
    }

    fn sector_size(&mut self) -> Result<u32, StorageError> {
        Ok(SECTOR_SIZE as u32)
    }

    fn sectors_per_track(&mut self) -> Result<u32, StorageError> {
        Ok(self.disk().sectors_per_track)
    }

    fn discard(&mut self, offset: u64, len: u64) -> Result<(), StorageError> {
        let mut disk = self.disk();
        let first = offset / SECTOR_SIZE;
        let last = (offset + len).div_ceil(SECTOR_SIZE);
        disk.sectors.retain(|lba, _| *lba < first || *lba >= last);
        disk.discards.push((offset, len));
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.disk().syncs += 1;
        Ok(())
    }

    fn reload_partition_table(&mut self) -> Result<(), StorageError> {
        self.disk().reloads += 1;
        Ok(())
    }
}

/// A set of in-memory devices addressed by path.
#[derive(Debug, Default, Clone)]
pub struct MemStorage {
    devices: Arc<Mutex<HashMap<PathBuf, MemBlockDevice>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device of `size` bytes and return a handle on it.
    pub fn add(&self, path: impl AsRef<Path>, size: u64) -> MemBlockDevice {
        let dev = MemBlockDevice::new(size);
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.as_ref().to_path_buf(), dev.handle());
        dev
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<MemBlockDevice> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path.as_ref())
            .map(MemBlockDevice::handle)
    }
}

impl StorageProvider for MemStorage {
    fn open(&self, path: &Path) -> Result<Box<dyn BlockDevice>, StorageError> {
        self.get(path)
            .map(|dev| Box::new(dev) as Box<dyn BlockDevice>)
            .ok_or_else(|| StorageError::Open {
                path: path.display().to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such device"),
            })
    }
}
