//! USB gadget backends.
//!
//! Two ways the device side exposes the fastboot interface:
//! - a dedicated function device node that reads and writes bulk data
//! - a FunctionFS mount whose `ep0` needs a descriptor handshake before the
//!   bulk endpoints `ep1` (OUT) and `ep2` (IN) can be opened

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use tracing::{debug, info, instrument, warn};

use super::descriptors::{descriptor_blob, strings_blob};
use super::traits::{Transport, TransportError, TransportKind};
use crate::protocol::{FFS_OPEN_RETRIES, FFS_OPEN_RETRY_MS};

fn open_failed(path: &Path, err: std::io::Error) -> TransportError {
    TransportError::OpenFailed {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

/// Dedicated USB function device (e.g. `/dev/android_adb`).
pub struct UsbFunctionDevice {
    file: File,
    path: PathBuf,
}

impl UsbFunctionDevice {
    #[instrument]
    pub fn open(path: &Path) -> Result<Self, TransportError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| open_failed(path, e))?;
        info!(path = %path.display(), "USB function device opened");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsFd for UsbFunctionDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Transport for UsbFunctionDevice {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.file
            .read(buf)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.file
            .write(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::UsbDevice
    }
}

/// FunctionFS gadget endpoints.
pub struct FunctionFs {
    // Kept open: closing ep0 unbinds the function.
    _control: File,
    bulk_out: File,
    bulk_in: File,
}

impl FunctionFs {
    /// Open `ep0`, write descriptors and strings, then open the bulk endpoints.
    #[instrument]
    pub fn open(dir: &Path) -> Result<Self, TransportError> {
        let ep0 = dir.join("ep0");
        let mut control = open_control(&ep0)?;

        let descriptors = descriptor_blob()?;
        control
            .write_all(&descriptors)
            .map_err(|e| TransportError::Handshake(format!("descriptors: {e}")))?;
        let strings = strings_blob()?;
        control
            .write_all(&strings)
            .map_err(|e| TransportError::Handshake(format!("strings: {e}")))?;
        debug!(
            descriptors = descriptors.len(),
            strings = strings.len(),
            "FunctionFS descriptors written"
        );

        let ep1 = dir.join("ep1");
        let bulk_out = OpenOptions::new()
            .read(true)
            .open(&ep1)
            .map_err(|e| open_failed(&ep1, e))?;
        let ep2 = dir.join("ep2");
        let bulk_in = OpenOptions::new()
            .write(true)
            .open(&ep2)
            .map_err(|e| open_failed(&ep2, e))?;

        info!(path = %dir.display(), "FunctionFS endpoints opened");
        Ok(Self {
            _control: control,
            bulk_out,
            bulk_in,
        })
    }
}

/// `ep0` stays busy for a moment after the previous user closed it.
fn open_control(path: &Path) -> Result<File, TransportError> {
    let mut attempt = 0;
    loop {
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => return Ok(file),
            Err(e) if e.raw_os_error() == Some(Errno::EBUSY as i32) => {
                attempt += 1;
                if attempt >= FFS_OPEN_RETRIES {
                    warn!(path = %path.display(), attempts = attempt, "ep0 still busy");
                    return Err(open_failed(path, e));
                }
                thread::sleep(Duration::from_millis(FFS_OPEN_RETRY_MS));
            }
            Err(e) => return Err(open_failed(path, e)),
        }
    }
}

impl AsFd for FunctionFs {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.bulk_out.as_fd()
    }
}

impl Transport for FunctionFs {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.bulk_out
            .read(buf)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.bulk_in
            .write(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::FunctionFs
    }
}

/// Whichever USB backend could be opened.
pub enum UsbLink {
    Device(UsbFunctionDevice),
    FunctionFs(FunctionFs),
}

impl UsbLink {
    /// Try the dedicated device node first, then FunctionFS.
    pub fn open(device_path: &Path, ffs_path: &Path) -> Result<Self, TransportError> {
        match UsbFunctionDevice::open(device_path) {
            Ok(dev) => return Ok(UsbLink::Device(dev)),
            Err(e) => debug!(error = %e, "USB function device unavailable"),
        }
        FunctionFs::open(ffs_path).map(UsbLink::FunctionFs)
    }
}

impl AsFd for UsbLink {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            UsbLink::Device(d) => d.as_fd(),
            UsbLink::FunctionFs(f) => f.as_fd(),
        }
    }
}

impl Transport for UsbLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self {
            UsbLink::Device(d) => d.read(buf),
            UsbLink::FunctionFs(f) => f.read(buf),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        match self {
            UsbLink::Device(d) => d.write(data),
            UsbLink::FunctionFs(f) => f.write(data),
        }
    }

    fn kind(&self) -> TransportKind {
        match self {
            UsbLink::Device(d) => d.kind(),
            UsbLink::FunctionFs(f) => f.kind(),
        }
    }
}
