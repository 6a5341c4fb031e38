//! Fixed slot pools for OSIP images.
//!
//! Firmware and OS images each get a pool of candidate start LBAs. A slot is
//! free when its whole range misses every image the current header points
//! at. Nothing is persisted about slots; they are recomputed on every write.

use super::header::{Attribute, ImageClass, Osii};

pub const FW_START_OFFSET: u32 = 50;
pub const FW_MAX_LBA: u32 = 2000;
pub const OS_START_OFFSET: u32 = FW_START_OFFSET + FW_MAX_LBA * 2;
pub const OS_MAX_LBA: u32 = 32768;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPool {
    pub name: &'static str,
    /// Candidate start LBAs, scanned in order.
    pub slots: &'static [u32],
    /// Largest image a slot can hold, in sectors.
    pub max_sectors: u32,
}

pub const FIRMWARE_POOL: SlotPool = SlotPool {
    name: "firmware",
    slots: &[FW_START_OFFSET, FW_START_OFFSET + FW_MAX_LBA],
    max_sectors: FW_MAX_LBA,
};

/// One more slot than there are descriptors, so a replacement always has
/// somewhere to go while the old copy stays referenced.
pub const OS_POOL: SlotPool = SlotPool {
    name: "os",
    slots: &[
        OS_START_OFFSET,
        OS_START_OFFSET + OS_MAX_LBA,
        OS_START_OFFSET + OS_MAX_LBA * 2,
        OS_START_OFFSET + OS_MAX_LBA * 3,
        OS_START_OFFSET + OS_MAX_LBA * 4,
        OS_START_OFFSET + OS_MAX_LBA * 5,
        OS_START_OFFSET + OS_MAX_LBA * 6,
        OS_START_OFFSET + OS_MAX_LBA * 7,
        OS_START_OFFSET + OS_MAX_LBA * 8,
    ],
    max_sectors: OS_MAX_LBA,
};

impl SlotPool {
    /// Pool an image with this attribute is stored in.
    pub fn for_attribute(attribute: Attribute) -> Option<&'static SlotPool> {
        match attribute.class() {
            ImageClass::Firmware => Some(&FIRMWARE_POOL),
            class if class.is_os() => Some(&OS_POOL),
            _ => None,
        }
    }

    /// First slot whose range misses every descriptor's occupied range.
    pub fn find_free(&self, descriptors: &[Osii]) -> Option<u32> {
        self.slots.iter().copied().find(|&slot| {
            let start = u64::from(slot);
            let end = start + u64::from(self.max_sectors);
            descriptors.iter().all(|d| {
                let used = d.occupied();
                used.is_empty() || used.end <= start || used.start >= end
            })
        })
    }
}
