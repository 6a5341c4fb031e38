//! Flash handlers and OEM commands backed by the OSIP table.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use super::manager::{IndexMode, OsipManager};
use crate::download::Payload;
use crate::engine::CommandContext;
use crate::flash::{FlashContext, FlashError, FlashOutcome};
use crate::registry::{Plugin, RegistryBuilder, RegistryError};
use crate::storage::BlockDevice;

/// Destination names whose images live in OSIP slots.
pub const OSIP_DESTINATIONS: &[&str] = &[
    "boot",
    "recovery",
    "fastboot",
    "droidboot",
    "splashscreen",
    "splashscreen1",
    "splashscreen2",
    "splashscreen3",
    "splashscreen4",
    "silent_binary",
    "ramdump",
];

/// Routes stitched OS and firmware images through the OSIP manager.
pub struct OsipPlugin {
    device: Arc<PathBuf>,
}

impl OsipPlugin {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: Arc::new(device.into()),
        }
    }
}

impl Plugin for OsipPlugin {
    fn name(&self) -> &str {
        "osip"
    }

    fn register(&self, builder: &mut RegistryBuilder) -> Result<(), RegistryError> {
        for &name in OSIP_DESTINATIONS {
            let device = Arc::clone(&self.device);
            builder.register_flash(name, move |ctx, payload| {
                flash_stitched(&device, ctx, payload)
            })?;
        }

        let device = Arc::clone(&self.device);
        builder.register_oem("write_osip_header", move |ctx, _| {
            open_manager(ctx, &device)?.write_default_header()?;
            Ok(())
        })?;
        let device = Arc::clone(&self.device);
        builder.register_oem("erase_osip_header", move |ctx, _| {
            open_manager(ctx, &device)?.erase_header()?;
            Ok(())
        })?;
        Ok(())
    }
}

type DynManager = OsipManager<Box<dyn BlockDevice>>;

fn open_manager(ctx: &CommandContext<'_>, device: &Path) -> anyhow::Result<DynManager> {
    Ok(OsipManager::new(ctx.services.storage.open(device)?))
}

fn flash_stitched(
    device: &Path,
    ctx: &FlashContext<'_>,
    payload: Payload<'_>,
) -> Result<FlashOutcome, FlashError> {
    let data = payload.to_vec()?;
    let mut manager = OsipManager::new(ctx.services.storage.open(device)?);
    let index = manager.named_index(ctx.name, IndexMode::Write)?;
    let osii = manager.write_stitched(&data, index)?;
    info!(
        name = ctx.name,
        index,
        start_lba = osii.start_lba,
        sectors = osii.size_in_sectors,
        "OSIP image written"
    );
    Ok(FlashOutcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{converse, test_engine, test_services};
    use crate::flash;
    use crate::osip::header::{
        Attribute, DEFAULT_ENTRY_POINT, DEFAULT_LOAD_ADDRESS, LBA_SIZE, Osii, OsipHeader,
    };
    use crate::osip::slots::OS_START_OFFSET;
    use crate::protocol::Response;
    use crate::registry::Registry;
    use crate::storage::{MemBlockDevice, MemStorage};

    const OSIP_DEV: &str = "/dev/mmcblk0";

    fn setup() -> (crate::engine::Services, MemBlockDevice) {
        let storage = MemStorage::new();
        let disk = storage.add(OSIP_DEV, 64 * 1024 * 1024);
        let mut services = test_services();
        services.storage = Arc::new(storage);
        (services, disk)
    }

    fn stitched_kernel(blob: &[u8]) -> Vec<u8> {
        let mut header = OsipHeader::new_default();
        header.descriptors[0] = Osii {
            attribute: Attribute::SIGNED_KERNEL,
            load_address: DEFAULT_LOAD_ADDRESS,
            entry_point: DEFAULT_ENTRY_POINT,
            size_in_sectors: (blob.len() / LBA_SIZE) as u32,
            ..Default::default()
        };
        header.update_checksum();
        let mut data = header.to_bytes().to_vec();
        data.resize(LBA_SIZE, 0);
        data.extend_from_slice(blob);
        data
    }

    #[test]
    fn test_flash_boot_through_registry() {
        let (services, disk) = setup();
        OsipManager::new(disk.handle())
            .write_default_header()
            .unwrap();

        let mut builder = Registry::builder();
        builder.with_plugin(&OsipPlugin::new(OSIP_DEV)).unwrap();
        let registry = builder.build();

        let image = stitched_kernel(&[0x5A; 2 * LBA_SIZE]);
        let outcome = flash::flash(&registry, &services, "boot", Payload::InMemory(&image)).unwrap();
        assert_eq!(outcome, FlashOutcome::Done);

        let header = OsipManager::new(disk.handle()).read().unwrap();
        assert_eq!(header.descriptors[0].start_lba, OS_START_OFFSET);
        assert_eq!(
            disk.contents(u64::from(OS_START_OFFSET) * LBA_SIZE as u64, 2 * LBA_SIZE),
            vec![0x5A; 2 * LBA_SIZE]
        );
    }

    #[test]
    fn test_flash_on_corrupt_header_fails() {
        let (services, disk) = setup();
        disk.fill(0, 3, 0x01);
        let mut builder = Registry::builder();
        builder.with_plugin(&OsipPlugin::new(OSIP_DEV)).unwrap();
        let registry = builder.build();

        let image = stitched_kernel(&[0x5A; LBA_SIZE]);
        let err = flash::flash(&registry, &services, "boot", Payload::InMemory(&image)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Format);
    }

    #[test]
    fn test_oem_header_commands() {
        let (services, disk) = setup();
        let engine = test_engine(services, 4096, |b| {
            b.with_plugin(&crate::commands::CorePlugin::new("x")).unwrap();
            b.with_plugin(&OsipPlugin::new(OSIP_DEV)).unwrap();
        });

        let responses = converse(&engine, &["oem write_osip_header"]);
        assert_eq!(responses, vec![Response::okay("")]);
        assert!(OsipManager::new(disk.handle()).read().is_ok());

        let responses = converse(&engine, &["oem erase_osip_header"]);
        assert_eq!(responses, vec![Response::okay("")]);
        assert!(disk.contents(0, 224).iter().all(|&b| b == 0));
    }
}
