//! Download buffer management.
//!
//! Downloads that fit land in a scratch buffer reserved once at startup.
//! Larger ones are streamed into an overflow file instead, and the payload
//! is then referred to by path. The two cases are kept apart by
//! `DownloadPayload` rather than by inspecting the buffer contents.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::protocol::{MAX_SCRATCH_SIZE, USB_CHUNK_SIZE};
use crate::transport::{Transport, TransportError};

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("cannot allocate a {size} byte scratch buffer")]
    Alloc { size: usize },

    #[error("scratch size {requested} exceeds free memory {free}")]
    InsufficientMemory { requested: usize, free: u64 },

    #[error("unable to create download file")]
    CreateOverflow {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl DownloadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DownloadError::Transport(_) => ErrorKind::Transport,
            DownloadError::Alloc { .. } | DownloadError::InsufficientMemory { .. } => {
                ErrorKind::Capacity
            }
            DownloadError::CreateOverflow { .. } | DownloadError::Io(_) => ErrorKind::Storage,
        }
    }
}

/// Where the last completed download lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadPayload {
    /// The first `len` bytes of the scratch buffer.
    InMemory { len: usize },
    /// A file holding the whole payload.
    Spilled { path: PathBuf, len: u64 },
}

/// Borrowed view of the last download.
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    InMemory(&'a [u8]),
    Spilled { path: &'a Path, len: u64 },
}

impl<'a> Payload<'a> {
    pub fn len(&self) -> u64 {
        match self {
            Payload::InMemory(data) => data.len() as u64,
            Payload::Spilled { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self, Payload::Spilled { .. })
    }

    /// Up to `n` leading bytes, for format probing.
    pub fn head(&self, n: usize) -> io::Result<Vec<u8>> {
        match self {
            Payload::InMemory(data) => Ok(data[..n.min(data.len())].to_vec()),
            Payload::Spilled { path, .. } => {
                let mut buf = Vec::with_capacity(n);
                File::open(path)?.take(n as u64).read_to_end(&mut buf)?;
                Ok(buf)
            }
        }
    }

    /// Seekable reader over the payload.
    pub fn reader(&self) -> io::Result<PayloadReader<'a>> {
        match *self {
            Payload::InMemory(data) => Ok(PayloadReader::Memory(Cursor::new(data))),
            Payload::Spilled { path, .. } => Ok(PayloadReader::File(BufReader::new(File::open(
                path,
            )?))),
        }
    }

    /// The whole payload in memory.
    pub fn to_vec(&self) -> io::Result<Vec<u8>> {
        match self {
            Payload::InMemory(data) => Ok(data.to_vec()),
            Payload::Spilled { path, .. } => fs::read(path),
        }
    }
}

pub enum PayloadReader<'a> {
    Memory(Cursor<&'a [u8]>),
    File(BufReader<File>),
}

impl Read for PayloadReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            PayloadReader::Memory(c) => c.read(buf),
            PayloadReader::File(f) => f.read(buf),
        }
    }
}

impl Seek for PayloadReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            PayloadReader::Memory(c) => c.seek(pos),
            PayloadReader::File(f) => f.seek(pos),
        }
    }
}

/// Destination chosen by `begin`.
pub enum DownloadTarget {
    Scratch,
    Overflow(File),
}

pub struct DownloadBuffer {
    scratch: Vec<u8>,
    capacity: usize,
    overflow_path: PathBuf,
    current: Option<DownloadPayload>,
}

impl DownloadBuffer {
    /// Reserve the scratch buffer. Failure here is fatal for the agent.
    pub fn new(capacity: usize, overflow_path: impl Into<PathBuf>) -> Result<Self, DownloadError> {
        let mut scratch = Vec::new();
        scratch
            .try_reserve_exact(capacity)
            .map_err(|_| DownloadError::Alloc { size: capacity })?;
        info!(capacity, "Scratch buffer reserved");
        Ok(Self {
            scratch,
            capacity,
            overflow_path: overflow_path.into(),
            current: None,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn overflow_path(&self) -> &Path {
        &self.overflow_path
    }

    pub fn current(&self) -> Option<&DownloadPayload> {
        self.current.as_ref()
    }

    /// View of the last completed download.
    pub fn payload(&self) -> Option<Payload<'_>> {
        match self.current.as_ref()? {
            DownloadPayload::InMemory { len } => Some(Payload::InMemory(&self.scratch[..*len])),
            DownloadPayload::Spilled { path, len } => Some(Payload::Spilled {
                path: path.as_path(),
                len: *len,
            }),
        }
    }

    /// Forget the last download, removing its overflow file if any.
    pub fn clear(&mut self) {
        if let Some(DownloadPayload::Spilled { path, .. }) = self.current.take() {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Overflow file removed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Cannot remove overflow file"),
            }
        }
        self.scratch.clear();
    }

    /// Pick the destination for a transfer of `len` bytes.
    pub fn begin(&mut self, len: usize) -> Result<DownloadTarget, DownloadError> {
        self.clear();
        if len <= self.capacity {
            return Ok(DownloadTarget::Scratch);
        }
        if let Some(dir) = self.overflow_path.parent() {
            fs::create_dir_all(dir).map_err(|source| DownloadError::CreateOverflow {
                path: self.overflow_path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.overflow_path)
            .map_err(|source| DownloadError::CreateOverflow {
                path: self.overflow_path.clone(),
                source,
            })?;
        info!(len, path = %self.overflow_path.display(), "Download exceeds scratch, spilling to file");
        Ok(DownloadTarget::Overflow(file))
    }

    /// Pull `len` bytes from the transport into `target`.
    ///
    /// Reads are bounded to `USB_CHUNK_SIZE`. Any shortfall leaves no
    /// payload behind.
    pub fn receive(
        &mut self,
        target: DownloadTarget,
        transport: &mut dyn Transport,
        len: usize,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<&DownloadPayload, DownloadError> {
        let result = match target {
            DownloadTarget::Scratch => self.receive_scratch(transport, len, progress),
            DownloadTarget::Overflow(file) => self.receive_file(file, transport, len, progress),
        };
        match result {
            Ok(payload) => Ok(self.current.insert(payload)),
            Err(e) => {
                if let Err(rm) = fs::remove_file(&self.overflow_path) {
                    if rm.kind() != io::ErrorKind::NotFound {
                        warn!(error = %rm, "Cannot remove partial overflow file");
                    }
                }
                self.scratch.clear();
                Err(e)
            }
        }
    }

    fn receive_scratch(
        &mut self,
        transport: &mut dyn Transport,
        len: usize,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<DownloadPayload, DownloadError> {
        self.scratch.clear();
        self.scratch.resize(len, 0);
        let mut received = 0;
        while received < len {
            let n = (len - received).min(USB_CHUNK_SIZE);
            let got = transport.read(&mut self.scratch[received..received + n])?;
            if got == 0 {
                return Err(TransportError::ShortTransfer {
                    expected: len,
                    actual: received,
                }
                .into());
            }
            received += got;
            progress(received as u64, len as u64);
        }
        Ok(DownloadPayload::InMemory { len })
    }

    fn receive_file(
        &mut self,
        mut file: File,
        transport: &mut dyn Transport,
        len: usize,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<DownloadPayload, DownloadError> {
        let mut chunk = vec![0u8; len.min(USB_CHUNK_SIZE)];
        let mut received = 0;
        while received < len {
            let n = (len - received).min(chunk.len());
            let got = transport.read(&mut chunk[..n])?;
            if got == 0 {
                return Err(TransportError::ShortTransfer {
                    expected: len,
                    actual: received,
                }
                .into());
            }
            file.write_all(&chunk[..got])?;
            received += got;
            progress(received as u64, len as u64);
        }
        file.sync_all()?;
        Ok(DownloadPayload::Spilled {
            path: self.overflow_path.clone(),
            len: len as u64,
        })
    }

    /// Stage a local file as the current payload.
    pub fn load_file(&mut self, path: &Path) -> Result<&DownloadPayload, DownloadError> {
        self.clear();
        let len = fs::metadata(path)?.len();
        let payload = if len <= self.capacity as u64 {
            let mut file = File::open(path)?;
            self.scratch.clear();
            file.read_to_end(&mut self.scratch)?;
            if self.scratch.len() > self.capacity {
                self.scratch.clear();
                return Err(io::Error::other("file grew while loading").into());
            }
            DownloadPayload::InMemory {
                len: self.scratch.len(),
            }
        } else {
            if let Some(dir) = self.overflow_path.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::copy(path, &self.overflow_path).map_err(|source| {
                DownloadError::CreateOverflow {
                    path: self.overflow_path.clone(),
                    source,
                }
            })?;
            DownloadPayload::Spilled {
                path: self.overflow_path.clone(),
                len,
            }
        };
        debug!(path = %path.display(), len, "File staged for flashing");
        Ok(self.current.insert(payload))
    }
}

/// Parse `MemFree` out of `/proc/meminfo` contents, in bytes.
pub fn parse_meminfo(text: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        let rest = line.strip_prefix("MemFree:")?;
        let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
        Some(kb * 1024)
    })
}

/// Free memory as reported by the kernel.
pub fn free_memory() -> Option<u64> {
    fs::read_to_string("/proc/meminfo")
        .ok()
        .as_deref()
        .and_then(parse_meminfo)
}

/// Decide the scratch capacity.
///
/// `requested == 0` picks the smaller of the built-in maximum and two
/// thirds of free memory. An explicit request larger than free memory is
/// refused.
pub fn scratch_size(requested: usize, free: Option<u64>) -> Result<usize, DownloadError> {
    let Some(free) = free else {
        return Ok(if requested == 0 {
            MAX_SCRATCH_SIZE
        } else {
            requested
        });
    };
    let two_thirds = free / 3 * 2;
    if requested == 0 {
        return Ok((MAX_SCRATCH_SIZE as u64).min(two_thirds) as usize);
    }
    if requested as u64 > free {
        return Err(DownloadError::InsufficientMemory { requested, free });
    }
    if requested as u64 > two_thirds {
        warn!(requested, free, "Scratch buffer uses more than 2/3 of free memory");
    }
    Ok(requested)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("fbagent-{}-{}", tag, std::process::id()))
    }

    #[test]
    fn test_in_memory_round_trip() {
        let mut buf = DownloadBuffer::new(8192, temp_path("unused")).unwrap();
        let mut mock = MockTransport::new();
        let sent: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        mock.queue_read(&sent[..1000]);
        mock.queue_read(&sent[1000..]);

        let target = buf.begin(4096).unwrap();
        assert!(matches!(target, DownloadTarget::Scratch));
        let payload = buf.receive(target, &mut mock, 4096, &mut |_, _| {}).unwrap();
        assert_eq!(payload, &DownloadPayload::InMemory { len: 4096 });

        match buf.payload().unwrap() {
            Payload::InMemory(data) => assert_eq!(data, &sent[..]),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_overflow_file_has_exact_length() {
        let path = temp_path("overflow").join("download.tmp");
        let mut buf = DownloadBuffer::new(1024, &path).unwrap();
        let mut mock = MockTransport::new();
        mock.queue_read(&[0x5Au8; 3000]);

        let target = buf.begin(3000).unwrap();
        assert!(matches!(target, DownloadTarget::Overflow(_)));
        let payload = buf.receive(target, &mut mock, 3000, &mut |_, _| {}).unwrap();
        assert_eq!(
            payload,
            &DownloadPayload::Spilled {
                path: path.clone(),
                len: 3000
            }
        );
        assert_eq!(fs::metadata(&path).unwrap().len(), 3000);

        let view = buf.payload().unwrap();
        assert!(view.is_spilled());
        assert_eq!(view.head(2).unwrap(), vec![0x5A, 0x5A]);

        buf.clear();
        assert!(!path.exists());
        fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_short_transfer_leaves_no_payload() {
        let mut buf = DownloadBuffer::new(8192, temp_path("short")).unwrap();
        let mut mock = MockTransport::new();
        mock.queue_read(&[1u8; 100]);

        let target = buf.begin(200).unwrap();
        let err = buf.receive(target, &mut mock, 200, &mut |_, _| {}).unwrap_err();
        assert!(matches!(
            err,
            DownloadError::Transport(TransportError::ShortTransfer {
                expected: 200,
                actual: 100
            })
        ));
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(buf.payload().is_none());
    }

    #[test]
    fn test_unwritable_overflow() {
        let mut buf = DownloadBuffer::new(16, "/proc/fbagent/nope/download.tmp").unwrap();
        assert!(matches!(
            buf.begin(17),
            Err(DownloadError::CreateOverflow { .. })
        ));
    }

    #[test]
    fn test_load_file() {
        let src = temp_path("load-src");
        fs::write(&src, b"hello").unwrap();
        let mut buf = DownloadBuffer::new(16, temp_path("load-overflow")).unwrap();
        assert_eq!(
            buf.load_file(&src).unwrap(),
            &DownloadPayload::InMemory { len: 5 }
        );

        let mut small = DownloadBuffer::new(2, temp_path("load-overflow2")).unwrap();
        let payload = small.load_file(&src).unwrap().clone();
        assert!(matches!(payload, DownloadPayload::Spilled { len: 5, .. }));
        assert_eq!(small.payload().unwrap().to_vec().unwrap(), b"hello");
        small.clear();
        fs::remove_file(&src).unwrap();
    }

    #[test]
    fn test_meminfo_parsing() {
        let text = "MemTotal:        2048000 kB\nMemFree:          300000 kB\n";
        assert_eq!(parse_meminfo(text), Some(300000 * 1024));
        assert_eq!(parse_meminfo("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn test_scratch_size_policy() {
        let free = 3 * 1024 * 1024 * 1024u64;
        assert_eq!(scratch_size(0, Some(free)).unwrap(), MAX_SCRATCH_SIZE);
        assert_eq!(scratch_size(0, Some(300)).unwrap(), 200);
        assert_eq!(scratch_size(100, Some(300)).unwrap(), 100);
        assert!(matches!(
            scratch_size(400, Some(300)),
            Err(DownloadError::InsufficientMemory { .. })
        ));
        assert_eq!(scratch_size(0, None).unwrap(), MAX_SCRATCH_SIZE);
    }
}
