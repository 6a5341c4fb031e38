//! Agent configuration.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::protocol::{
    DEFAULT_PRODUCT, DOWNLOAD_OVERFLOW_PATH, FASTBOOT_TCP_PORT, FFS_PATH, USB_DEVICE_PATH,
};
use crate::storage::Volume;
use crate::transport::HubConfig;

/// Partition table backend used for layout operations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageLayout {
    /// OSIP firmware/OS image table.
    #[default]
    Osip,
    /// Classic MBR with chained EBRs.
    Mbr,
}

/// Configuration for the flashing agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Value of the `product` variable.
    pub product: String,
    /// Scratch buffer size in bytes; 0 sizes it from free memory.
    pub scratch_size: usize,
    /// TCP fallback port.
    pub tcp_port: u16,
    /// Dedicated USB function device node.
    pub usb_device_path: PathBuf,
    /// FunctionFS mount point.
    pub ffs_path: PathBuf,
    /// Spill file for downloads larger than the scratch buffer.
    pub overflow_path: PathBuf,
    /// OTA staging directory.
    pub cache_dir: PathBuf,
    pub layout: StorageLayout,
    /// Raw device holding the OSIP header.
    pub osip_device: PathBuf,
    /// Whole disk partitioned by the MBR writer.
    pub disk_device: PathBuf,
    pub volumes: Vec<Volume>,
    /// Optional scripted install command file.
    pub script_path: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            product: DEFAULT_PRODUCT.to_string(),
            scratch_size: 0,
            tcp_port: FASTBOOT_TCP_PORT,
            usb_device_path: PathBuf::from(USB_DEVICE_PATH),
            ffs_path: PathBuf::from(FFS_PATH),
            overflow_path: PathBuf::from(DOWNLOAD_OVERFLOW_PATH),
            cache_dir: PathBuf::from("/cache"),
            layout: StorageLayout::Osip,
            osip_device: PathBuf::from("/dev/mmcblk0"),
            disk_device: PathBuf::from("/dev/block/mmcblk0"),
            volumes: Vec::new(),
            script_path: None,
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AgentConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            usb_device_path: self.usb_device_path.clone(),
            ffs_path: self.ffs_path.clone(),
            tcp_port: self.tcp_port,
        }
    }
}
