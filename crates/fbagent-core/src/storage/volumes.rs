//! Named volumes and the devices backing them.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::StorageError;

/// One entry of the device's volume table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Partition name used on the wire (`system`, `data`, ...).
    pub name: String,
    /// Mount point, if the volume holds a filesystem.
    #[serde(default)]
    pub mount_point: Option<String>,
    /// Filesystem type reported by `partition-type` (`ext4`, `vfat`, `emmc`...).
    pub fs_type: String,
    /// Block device node.
    pub device: PathBuf,
    /// Requested size when repartitioning; `None` shares the remaining space.
    #[serde(default)]
    pub size_hint_mb: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct VolumeTable {
    volumes: Vec<Volume>,
}

impl VolumeTable {
    pub fn new(volumes: Vec<Volume>) -> Self {
        Self { volumes }
    }

    /// Resolve a partition name to its volume.
    ///
    /// `userdata` is the host-side name of the `data` volume. A volume also
    /// matches by its mount point without the leading slash.
    pub fn lookup(&self, name: &str) -> Result<&Volume, StorageError> {
        let wanted = if name == "userdata" { "data" } else { name };
        self.volumes
            .iter()
            .find(|v| {
                v.name == wanted
                    || v.mount_point
                        .as_deref()
                        .and_then(|m| m.strip_prefix('/'))
                        .is_some_and(|m| m == wanted)
            })
            .ok_or_else(|| StorageError::UnknownVolume(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Volume> {
        self.volumes.iter()
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> VolumeTable {
        VolumeTable::new(vec![
            Volume {
                name: "system".into(),
                mount_point: Some("/system".into()),
                fs_type: "ext4".into(),
                device: "/dev/block/mmcblk0p3".into(),
                size_hint_mb: Some(1024),
            },
            Volume {
                name: "data".into(),
                mount_point: Some("/data".into()),
                fs_type: "ext4".into(),
                device: "/dev/block/mmcblk0p5".into(),
                size_hint_mb: None,
            },
        ])
    }

    #[test]
    fn test_lookup_by_name() {
        let t = table();
        assert_eq!(
            t.lookup("system").unwrap().device,
            PathBuf::from("/dev/block/mmcblk0p3")
        );
        assert!(matches!(
            t.lookup("cache"),
            Err(StorageError::UnknownVolume(_))
        ));
    }

    #[test]
    fn test_userdata_alias() {
        assert_eq!(table().lookup("userdata").unwrap().name, "data");
    }
}
