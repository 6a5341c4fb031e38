//! Image flashing dispatcher.
//!
//! A named destination resolves, in order, to a handler registered for
//! that name, a file path (names starting with `/`), or a volume from the
//! volume table. Volume writes pick the decoder from the payload's leading
//! bytes: sparse, gzip, otherwise raw.

use std::fs;
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::download::Payload;
use crate::engine::Services;
use crate::error::ErrorKind;
use crate::events::AgentEvent;
use crate::mbr::MbrError;
use crate::osip::OsipError;
use crate::power::RebootTarget;
use crate::registry::Registry;
use crate::sparse::{self, SparseError};
use crate::storage::{BlockDevice, StorageError};

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("no image downloaded")]
    NoPayload,

    #[error("{0}")]
    Rejected(String),

    #[error("image of {len} bytes exceeds partition ({size})")]
    TooLarge { len: u64, size: u64 },

    #[error("compressed image of {0} bytes does not fit the download buffer")]
    CompressedSpill(u64),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Sparse(#[from] SparseError),

    #[error(transparent)]
    Osip(#[from] OsipError),

    #[error(transparent)]
    Mbr(#[from] MbrError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl FlashError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlashError::NoPayload | FlashError::Rejected(_) => ErrorKind::Protocol,
            FlashError::TooLarge { .. } | FlashError::CompressedSpill(_) => ErrorKind::Capacity,
            FlashError::Storage(e) => e.kind(),
            FlashError::Sparse(e) => e.kind(),
            FlashError::Osip(e) => e.kind(),
            FlashError::Mbr(e) => e.kind(),
            FlashError::Io(_) => ErrorKind::Storage,
        }
    }
}

/// What the caller should do once the host has been acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashOutcome {
    Done,
    Reboot(RebootTarget),
}

/// Inputs handed to a registered flash handler.
pub struct FlashContext<'a> {
    /// Destination name as sent by the host.
    pub name: &'a str,
    pub services: &'a Services,
}

/// How a payload is encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageEncoding {
    Sparse,
    Gzip,
    Raw,
}

pub fn detect_encoding(head: &[u8]) -> ImageEncoding {
    if sparse::is_sparse(head) {
        ImageEncoding::Sparse
    } else if sparse::is_gzip(head) {
        ImageEncoding::Gzip
    } else {
        ImageEncoding::Raw
    }
}

/// Flash `payload` to the destination called `name`.
#[instrument(skip(registry, services, payload), fields(len = payload.len()))]
pub fn flash(
    registry: &Registry,
    services: &Services,
    name: &str,
    payload: Payload<'_>,
) -> Result<FlashOutcome, FlashError> {
    if let Some(handler) = registry.flash_handler(name) {
        debug!(name, "Using registered flash handler");
        return handler(&FlashContext { name, services }, payload);
    }

    if name.starts_with('/') {
        write_file(Path::new(name), payload)?;
        return Ok(FlashOutcome::Done);
    }

    let volume = services.volumes.lookup(name)?;
    info!(name, device = %volume.device.display(), "Flashing volume");
    let mut device = services.storage.open(&volume.device)?;
    let written = write_image(device.as_mut(), payload)?;
    services.emit(AgentEvent::Progress {
        operation: format!("flash {name}"),
        current: written,
        total: written,
    });
    Ok(FlashOutcome::Done)
}

/// Decode `payload` onto `device` from offset 0.
///
/// Every encoding is checked against the device size before the first
/// write, so an oversized image leaves the partition untouched.
pub fn write_image(device: &mut dyn BlockDevice, payload: Payload<'_>) -> Result<u64, FlashError> {
    let head = payload.head(4)?;
    let size = device.size_bytes()?;
    device.seek(SeekFrom::Start(0))?;
    let written = match detect_encoding(&head) {
        ImageEncoding::Sparse => {
            let mut reader = payload.reader()?;
            let summary = sparse::write_sparse(&mut reader, device, size)?;
            debug!(blocks = summary.blocks, bytes = summary.bytes_written, "Sparse image written");
            summary.bytes_written
        }
        ImageEncoding::Gzip => {
            // Inflation needs the whole stream in memory
            if payload.is_spilled() {
                return Err(FlashError::CompressedSpill(payload.len()));
            }
            let compressed = payload.to_vec()?;
            sparse::write_gzip(&compressed, device, size)?
        }
        ImageEncoding::Raw => {
            if payload.len() > size {
                return Err(FlashError::TooLarge {
                    len: payload.len(),
                    size,
                });
            }
            let mut reader = payload.reader()?;
            io::copy(&mut reader, device)?
        }
    };
    device.sync()?;
    Ok(written)
}

/// Replace the file at `path` with `payload`.
///
/// The new contents go to a sibling first and are renamed into place, so a
/// failed write leaves the old file untouched. A spilled payload is moved
/// directly when it lives on the same filesystem.
pub fn write_file(path: &Path, payload: Payload<'_>) -> Result<(), FlashError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    if let Payload::Spilled { path: spilled, .. } = payload {
        match fs::rename(spilled, path) {
            Ok(()) => {
                info!(path = %path.display(), "Spilled download moved into place");
                return Ok(());
            }
            Err(e) => debug!(error = %e, "Rename failed, copying instead"),
        }
    }

    let staging = staging_path(path);
    let result = (|| -> io::Result<()> {
        let mut reader = payload.reader()?;
        let mut file = fs::File::create(&staging)?;
        io::copy(&mut reader, &mut file)?;
        file.sync_all()?;
        fs::rename(&staging, path)
    })();
    if let Err(e) = result {
        if let Err(rm) = fs::remove_file(&staging) {
            warn!(error = %rm, "Cannot remove staging file");
        }
        return Err(e.into());
    }
    info!(path = %path.display(), len = payload.len(), "File written");
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".new");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::test_services;
    use crate::sparse::tests::build_sparse;
    use crate::storage::{MemStorage, Volume, VolumeTable};
    use std::sync::Arc;

    fn services_with_volume(size: u64) -> (Services, crate::storage::MemBlockDevice) {
        let storage = MemStorage::new();
        let disk = storage.add("/dev/block/system", size);
        let mut services = test_services();
        services.storage = Arc::new(storage);
        services.volumes = VolumeTable::new(vec![Volume {
            name: "system".into(),
            mount_point: Some("/system".into()),
            fs_type: "ext4".into(),
            device: "/dev/block/system".into(),
            size_hint_mb: None,
        }]);
        (services, disk)
    }

    #[test]
    fn test_flash_sparse_raw_chunk() {
        let (services, disk) = services_with_volume(4096);
        let registry = Registry::builder().build();
        let img = build_sparse(512, 2, &[(0xCAC1, 2, vec![0x11; 1024])]);

        let outcome = flash(&registry, &services, "system", Payload::InMemory(&img)).unwrap();
        assert_eq!(outcome, FlashOutcome::Done);
        assert!(disk.contents(0, 1024).iter().all(|&b| b == 0x11));
        assert!(disk.sync_count() > 0);
    }

    #[test]
    fn test_flash_corrupt_sparse_is_format_error() {
        let (services, disk) = services_with_volume(4096);
        let registry = Registry::builder().build();
        let img = build_sparse(512, 3, &[(0xCAC1, 2, vec![0x11; 1024])]);

        let err = flash(&registry, &services, "system", Payload::InMemory(&img)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
        assert!(disk.contents(0, 1024).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_flash_raw() {
        let (services, disk) = services_with_volume(4096);
        let registry = Registry::builder().build();
        flash(&registry, &services, "system", Payload::InMemory(&[7u8; 600])).unwrap();
        assert_eq!(disk.contents(0, 600), vec![7u8; 600]);

        let err = flash(&registry, &services, "system", Payload::InMemory(&[7u8; 5000])).unwrap_err();
        assert!(matches!(err, FlashError::TooLarge { len: 5000, size: 4096 }));
        assert_eq!(err.kind(), ErrorKind::Capacity);
    }

    #[test]
    fn test_oversized_sparse_leaves_partition_untouched() {
        let (services, disk) = services_with_volume(1024);
        disk.fill(0, 1024, 0xEE);
        let registry = Registry::builder().build();
        let img = build_sparse(512, 4, &[(0xCAC1, 4, vec![0x11; 2048])]);

        let err = flash(&registry, &services, "system", Payload::InMemory(&img)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capacity);
        assert!(disk.contents(0, 1024).iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn test_oversized_gzip_leaves_partition_untouched() {
        // gzip of b"hello\n"
        let gz: [u8; 26] = [
            0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0xcb, 0x48, 0xcd, 0xc9,
            0xc9, 0xe7, 0x02, 0x00, 0x20, 0x30, 0x3a, 0x36, 0x06, 0x00, 0x00, 0x00,
        ];
        let (services, disk) = services_with_volume(4);
        disk.fill(0, 4, 0xEE);
        let registry = Registry::builder().build();

        let err = flash(&registry, &services, "system", Payload::InMemory(&gz)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capacity);
        assert_eq!(disk.contents(0, 4), vec![0xEE; 4]);

        let (services, disk) = services_with_volume(4096);
        flash(&registry, &services, "system", Payload::InMemory(&gz)).unwrap();
        assert_eq!(disk.contents(0, 6), b"hello\n");
    }

    #[test]
    fn test_spilled_gzip_refused() {
        let spilled = std::env::temp_dir().join(format!("fbagent-gz-spill-{}", std::process::id()));
        fs::write(&spilled, [0x1f, 0x8b, 0x08, 0x00]).unwrap();
        let (services, disk) = services_with_volume(4096);
        let registry = Registry::builder().build();

        let err = flash(
            &registry,
            &services,
            "system",
            Payload::Spilled { path: &spilled, len: 4 },
        )
        .unwrap_err();
        assert!(matches!(err, FlashError::CompressedSpill(4)));
        assert_eq!(disk.contents(0, 4), vec![0; 4]);
        fs::remove_file(&spilled).unwrap();
    }

    #[test]
    fn test_unknown_volume() {
        let (services, _) = services_with_volume(4096);
        let registry = Registry::builder().build();
        let err = flash(&registry, &services, "vendor", Payload::InMemory(b"x")).unwrap_err();
        assert!(matches!(err, FlashError::Storage(StorageError::UnknownVolume(_))));
    }

    #[test]
    fn test_registered_handler_wins() {
        let (services, disk) = services_with_volume(4096);
        let mut builder = Registry::builder();
        builder
            .register_flash("system", |ctx, payload| {
                assert_eq!(ctx.name, "system");
                assert_eq!(payload.len(), 3);
                Ok(FlashOutcome::Reboot(RebootTarget::Recovery))
            })
            .unwrap();
        let registry = builder.build();
        let outcome = flash(&registry, &services, "system", Payload::InMemory(b"abc")).unwrap();
        assert_eq!(outcome, FlashOutcome::Reboot(RebootTarget::Recovery));
        assert!(disk.contents(0, 3).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_flash_file_path() {
        let dir = std::env::temp_dir().join(format!("fbagent-flash-{}", std::process::id()));
        let target = dir.join("sub").join("file.bin");
        let name = target.to_str().unwrap().to_string();
        let services = test_services();
        let registry = Registry::builder().build();

        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, b"old").unwrap();
        flash(&registry, &services, &name, Payload::InMemory(b"new contents")).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"new contents");
        assert!(!staging_path(&target).exists());

        let spilled = dir.join("spill.tmp");
        fs::write(&spilled, b"spilled").unwrap();
        flash(
            &registry,
            &services,
            &name,
            Payload::Spilled { path: &spilled, len: 7 },
        )
        .unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"spilled");
        assert!(!spilled.exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_detect_encoding() {
        assert_eq!(detect_encoding(&[0x3A, 0xFF, 0x26, 0xED]), ImageEncoding::Sparse);
        assert_eq!(detect_encoding(&[0x1f, 0x8b, 8, 0]), ImageEncoding::Gzip);
        assert_eq!(detect_encoding(b"ANDR"), ImageEncoding::Raw);
        assert_eq!(detect_encoding(&[]), ImageEncoding::Raw);
    }
}
