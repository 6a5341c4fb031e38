//! `oem repart`: rebuild the partition table from the volume table.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use super::MbrError;
use super::table::{PartitionPlan, layout_from_volumes};
use crate::engine::Services;
use crate::registry::{Plugin, RegistryBuilder, RegistryError};
use crate::storage::Volume;

pub struct MbrPlugin {
    disk: Arc<PathBuf>,
}

impl MbrPlugin {
    pub fn new(disk: impl Into<PathBuf>) -> Self {
        Self {
            disk: Arc::new(disk.into()),
        }
    }
}

impl Plugin for MbrPlugin {
    fn name(&self) -> &str {
        "mbr"
    }

    fn register(&self, builder: &mut RegistryBuilder) -> Result<(), RegistryError> {
        let disk = Arc::clone(&self.disk);
        builder.register_oem("repart", move |ctx, _| {
            repartition(ctx.services, &disk)?;
            Ok(())
        })
    }
}

/// Volumes living on `disk`, in table order.
fn volumes_on<'a>(services: &'a Services, disk: &'a Path) -> impl Iterator<Item = &'a Volume> {
    let prefix = disk.to_string_lossy().into_owned();
    services
        .volumes
        .iter()
        .filter(move |v| v.device.to_string_lossy().starts_with(&prefix))
}

pub fn repartition(services: &Services, disk: &Path) -> Result<(), MbrError> {
    let mut device = services.storage.open(disk)?;
    let plan = PartitionPlan::for_device(device.as_mut())?;
    let plan = layout_from_volumes(plan, volumes_on(services, disk))?;
    plan.commit(device.as_mut())?;
    info!(disk = %disk.display(), partitions = plan.partitions().len(), "Disk repartitioned");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{converse, test_engine, test_services};
    use crate::mbr::read_partitions;
    use crate::protocol::Response;
    use crate::storage::{MemStorage, VolumeTable};

    fn volume(name: &str, device: &str, hint: Option<u64>) -> Volume {
        Volume {
            name: name.into(),
            mount_point: Some(format!("/{name}")),
            fs_type: "ext4".into(),
            device: device.into(),
            size_hint_mb: hint,
        }
    }

    #[test]
    fn test_oem_repart() {
        let storage = MemStorage::new();
        let disk = storage.add("/dev/block/mmcblk0", 256 * 1024 * 1024);
        let mut services = test_services();
        services.storage = Arc::new(storage);
        services.volumes = VolumeTable::new(vec![
            volume("system", "/dev/block/mmcblk0p1", Some(100)),
            volume("cache", "/dev/block/mmcblk0p2", Some(20)),
            volume("sdcard", "/dev/block/mmcblk1p1", None),
            volume("data", "/dev/block/mmcblk0p3", None),
        ]);
        let engine = test_engine(services, 4096, |b| {
            b.with_plugin(&crate::commands::CorePlugin::new("x")).unwrap();
            b.with_plugin(&MbrPlugin::new("/dev/block/mmcblk0")).unwrap();
        });

        assert_eq!(converse(&engine, &["oem repart"]), vec![Response::okay("")]);
        let parts = read_partitions(&mut disk.handle()).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].lba_count, 100 * 2048);
        assert_eq!(parts[1].lba_count, 20 * 2048);
    }

    #[test]
    fn test_oem_repart_too_small() {
        let storage = MemStorage::new();
        storage.add("/dev/block/mmcblk0", 16 * 1024 * 1024);
        let mut services = test_services();
        services.storage = Arc::new(storage);
        services.volumes = VolumeTable::new(vec![volume("system", "/dev/block/mmcblk0p1", Some(100))]);
        let engine = test_engine(services, 4096, |b| {
            b.with_plugin(&crate::commands::CorePlugin::new("x")).unwrap();
            b.with_plugin(&MbrPlugin::new("/dev/block/mmcblk0")).unwrap();
        });
        assert_eq!(converse(&engine, &["oem repart"]), vec![Response::fail("repart")]);
    }
}
