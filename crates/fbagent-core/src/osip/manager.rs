//! OSIP table updates.
//!
//! Image writes follow one rule: the new image goes into a free slot first,
//! and the header is rewritten only after that write is synced. Until then
//! the previous image stays intact at its old slot and remains referenced.

use tracing::{debug, info, instrument, warn};

use super::OsipError;
use super::header::{
    Attribute, DEFAULT_ENTRY_POINT, DEFAULT_LOAD_ADDRESS, ImageClass, LBA_SIZE, MAX_OSII,
    OSIP_BACKUP_OFFSET, OSIP_SIGNATURE, OSIP_SIZE, Osii, OsipHeader, xor_checksum,
};
use super::slots::SlotPool;
use crate::storage::BlockDevice;

/// Whether a descriptor lookup may append a new slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    Read,
    Write,
}

/// Map a destination name to the attribute class and instance it targets.
pub fn destination_attribute(name: &str) -> Option<(Attribute, usize)> {
    match name {
        "boot" => Some((Attribute::SIGNED_KERNEL, 1)),
        "recovery" => Some((Attribute::SIGNED_ROS, 1)),
        "fastboot" | "droidboot" => Some((Attribute::SIGNED_POS, 1)),
        "splashscreen" | "splashscreen1" => Some((Attribute::SIGNED_SPLASHSCREEN, 1)),
        "splashscreen2" => Some((Attribute::SIGNED_SPLASHSCREEN, 2)),
        "splashscreen3" => Some((Attribute::SIGNED_SPLASHSCREEN, 3)),
        "splashscreen4" => Some((Attribute::SIGNED_SPLASHSCREEN, 4)),
        "silent_binary" => Some((Attribute::SIGNED_FW, 1)),
        "ramdump" => Some((Attribute::SIGNED_RAMDUMPOS, 1)),
        _ => None,
    }
}

/// Reads and updates the OSIP header of one device.
pub struct OsipManager<D: BlockDevice> {
    device: D,
}

impl<D: BlockDevice> OsipManager<D> {
    pub fn new(device: D) -> Self {
        Self { device }
    }

    pub fn into_inner(self) -> D {
        self.device
    }

    /// Read the header and check its checksum.
    pub fn read(&mut self) -> Result<OsipHeader, OsipError> {
        let mut buf = [0u8; OSIP_SIZE];
        self.device.read_exact_at(0, &mut buf)?;
        let checksum = xor_checksum(&buf);
        if checksum != 0 {
            return Err(OsipError::Corrupt { checksum });
        }
        OsipHeader::from_bytes(&buf)
    }

    /// Recompute the checksum and persist the header.
    pub fn write_header(&mut self, header: &mut OsipHeader) -> Result<(), OsipError> {
        header.update_checksum();
        self.device.write_all_at(0, &header.to_bytes())?;
        self.device.sync()?;
        debug!(
            descriptors = header.descriptor_count,
            checksum = header.checksum,
            "OSIP header written"
        );
        Ok(())
    }

    /// Invalidate the backup header so it is never preferred over ours.
    pub fn destroy_backup(&mut self) -> Result<(), OsipError> {
        let mut sig = [0u8; 4];
        self.device.read_exact_at(OSIP_BACKUP_OFFSET, &mut sig)?;
        if u32::from_le_bytes(sig) == OSIP_SIGNATURE {
            self.device
                .write_all_at(OSIP_BACKUP_OFFSET, &[0xFF; 4])?;
            self.device.sync()?;
            info!("OSIP backup destroyed");
        }
        Ok(())
    }

    /// Write `blob` into a free slot and point descriptor `index` at it.
    ///
    /// `template` supplies the revision, load address, entry point and
    /// attribute of the new image; its location and size are filled in here.
    #[instrument(skip(self, template, blob), fields(len = blob.len(), attribute = ?template.attribute))]
    pub fn write_image(
        &mut self,
        template: Osii,
        blob: &[u8],
        index: usize,
    ) -> Result<Osii, OsipError> {
        let mut header = self.read()?;

        let pool = SlotPool::for_attribute(template.attribute)
            .ok_or(OsipError::UnhandledAttribute(template.attribute.0))?;
        let sectors = blob.len().div_ceil(LBA_SIZE) as u64;
        if sectors > u64::from(pool.max_sectors) {
            return Err(OsipError::ImageTooLarge {
                sectors,
                max: pool.max_sectors,
            });
        }
        if index > header.count() || index >= MAX_OSII {
            return Err(OsipError::BadIndex(index));
        }
        let lba = pool
            .find_free(header.descriptors())
            .ok_or(OsipError::NoSpace { pool: pool.name })?;
        debug!(lba, pool = pool.name, index, "Slot selected");

        self.destroy_backup()?;

        self.device.write_all_at(lba as u64 * LBA_SIZE as u64, blob)?;
        self.device.sync()?;

        let mut osii = template;
        osii.start_lba = lba;
        osii.size_in_sectors = sectors as u32;
        merge_descriptor(&mut header, index, osii);
        self.write_header(&mut header)?;

        info!(lba, sectors, index, "OSIP image committed");
        Ok(header.descriptors[index])
    }

    /// Write a stitched image: a one-descriptor OSIP header in the first
    /// sector followed by the image itself.
    pub fn write_stitched(&mut self, data: &[u8], index: usize) -> Result<Osii, OsipError> {
        if data.len() <= LBA_SIZE {
            return Err(OsipError::MalformedImage(format!(
                "{} bytes is too small for a stitched image",
                data.len()
            )));
        }
        let stitched = OsipHeader::from_bytes(&data[..LBA_SIZE])?;
        if stitched.descriptor_count != 1 {
            return Err(OsipError::MalformedImage(format!(
                "expected 1 descriptor, found {}",
                stitched.descriptor_count
            )));
        }
        let template = stitched.descriptors[0];
        let blob = &data[LBA_SIZE..];
        if template.size_in_sectors as usize * LBA_SIZE != blob.len() {
            return Err(OsipError::MalformedImage(format!(
                "descriptor says {} sectors, payload is {} bytes",
                template.size_in_sectors,
                blob.len()
            )));
        }
        self.write_image(template, blob, index)
    }

    /// Index of the descriptor a destination name refers to.
    ///
    /// The N-th descriptor of the destination's class is returned; in
    /// `Write` mode the next free index is returned when that instance does
    /// not exist yet.
    pub fn named_index(&mut self, name: &str, mode: IndexMode) -> Result<usize, OsipError> {
        let (attribute, instance) = destination_attribute(name)
            .ok_or_else(|| OsipError::UnknownDestination(name.to_string()))?;
        let header = self.read()?;
        find_index(&header, attribute.class(), instance, mode)
            .ok_or_else(|| OsipError::DescriptorNotFound(name.to_string()))
    }

    /// Set the load address and entry point of a named image.
    pub fn update_osii(
        &mut self,
        name: &str,
        load_address: u32,
        entry_point: u32,
    ) -> Result<(), OsipError> {
        let index = self.named_index(name, IndexMode::Read)?;
        let mut header = self.read()?;
        header.descriptors[index].load_address = load_address;
        header.descriptors[index].entry_point = entry_point;
        self.write_header(&mut header)
    }

    /// Keep the image but make it unbootable.
    pub fn invalidate(&mut self, name: &str) -> Result<(), OsipError> {
        info!(name, "Invalidating OSII");
        self.update_osii(name, 0, 0)
    }

    /// Make an invalidated image bootable again.
    pub fn restore(&mut self, name: &str) -> Result<(), OsipError> {
        info!(name, "Restoring OSII");
        self.update_osii(name, DEFAULT_LOAD_ADDRESS, DEFAULT_ENTRY_POINT)
    }

    /// Replace the header with a default one and re-enable the boot images.
    pub fn write_default_header(&mut self) -> Result<(), OsipError> {
        let mut header = OsipHeader::new_default();
        self.write_header(&mut header)?;
        for name in ["boot", "recovery", "fastboot"] {
            if let Err(e) = self.restore(name) {
                warn!(name, error = %e, "Cannot restore OSII");
            }
        }
        Ok(())
    }

    /// Zero the whole header.
    pub fn erase_header(&mut self) -> Result<(), OsipError> {
        self.device.write_all_at(0, &[0u8; OSIP_SIZE])?;
        self.device.sync()?;
        info!("OSIP header erased");
        Ok(())
    }
}

fn find_index(
    header: &OsipHeader,
    class: ImageClass,
    instance: usize,
    mode: IndexMode,
) -> Option<usize> {
    let mut seen = 0;
    for (i, d) in header.descriptors().iter().enumerate() {
        if d.attribute.class() == class {
            seen += 1;
            if seen == instance {
                return Some(i);
            }
        }
    }
    let next = header.count();
    (mode == IndexMode::Write && seen + 1 == instance && next < MAX_OSII).then_some(next)
}

/// Place `osii` at `index`, growing or reshuffling the table as needed.
fn merge_descriptor(header: &mut OsipHeader, index: usize, mut osii: Osii) {
    let count = header.count();
    if index >= count {
        header.set_count(index + 1);
        header.descriptors[index] = osii;
        return;
    }

    let old = header.descriptors[index];
    if old.is_invalidated() {
        osii.load_address = 0;
        osii.entry_point = 0;
    }

    let old_class = old.attribute.class();
    let displace = !old_class.replaced_in_place() && old_class != osii.attribute.class();
    if displace {
        if count < MAX_OSII {
            // Keep the other image reachable by moving it to the end
            header.descriptors[count] = old;
            header.set_count(count + 1);
        } else {
            warn!(index, class = %old_class, "No room to keep displaced OSII");
        }
    }
    header.descriptors[index] = osii;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osip::slots::{FW_START_OFFSET, OS_MAX_LBA, OS_START_OFFSET};
    use crate::storage::MemBlockDevice;

    const DISK: u64 = 256 * 1024 * 1024;

    fn kernel_at(start_lba: u32, size_in_sectors: u32) -> Osii {
        Osii {
            start_lba,
            size_in_sectors,
            load_address: DEFAULT_LOAD_ADDRESS,
            entry_point: DEFAULT_ENTRY_POINT,
            attribute: Attribute::SIGNED_KERNEL,
            ..Default::default()
        }
    }

    fn manager_with(descriptors: &[Osii]) -> (OsipManager<MemBlockDevice>, MemBlockDevice) {
        let dev = MemBlockDevice::new(DISK);
        let mut mgr = OsipManager::new(dev.handle());
        let mut header = OsipHeader::new_default();
        for (i, d) in descriptors.iter().enumerate() {
            header.descriptors[i] = *d;
        }
        header.set_count(descriptors.len().max(1));
        mgr.write_header(&mut header).unwrap();
        (mgr, dev)
    }

    fn stitched(template: Osii, blob: &[u8]) -> Vec<u8> {
        let mut header = OsipHeader::new_default();
        let mut d = template;
        d.size_in_sectors = (blob.len() / LBA_SIZE) as u32;
        header.descriptors[0] = d;
        header.update_checksum();
        let mut data = header.to_bytes().to_vec();
        data.resize(LBA_SIZE, 0);
        data.extend_from_slice(blob);
        data
    }

    #[test]
    fn test_corrupt_header_detected() {
        let (mut mgr, dev) = manager_with(&[kernel_at(OS_START_OFFSET, 10)]);
        dev.fill(0x30, 1, 0x77);
        assert!(matches!(mgr.read(), Err(OsipError::Corrupt { .. })));
    }

    #[test]
    fn test_third_slot_chosen_when_first_two_overlap() {
        let recovery = Osii {
            attribute: Attribute::SIGNED_ROS,
            ..kernel_at(OS_START_OFFSET + OS_MAX_LBA + 100, 50)
        };
        let (mut mgr, dev) = manager_with(&[kernel_at(OS_START_OFFSET, 2000), recovery]);

        let image = vec![0x5A; 10 * 1024 * 1024];
        let template = Osii {
            attribute: Attribute::UNSIGNED_KERNEL,
            ..kernel_at(0, 0)
        };
        let osii = mgr.write_image(template, &image, 2).unwrap();

        let third = OS_START_OFFSET + 2 * OS_MAX_LBA;
        assert_eq!(osii.start_lba, third);
        assert_eq!(osii.size_in_sectors, 20480);

        let header = mgr.read().unwrap();
        assert_eq!(header.descriptor_count, 3);
        assert_eq!(header.descriptors[2].start_lba, third);
        // Old images untouched
        assert_eq!(header.descriptors[0].start_lba, OS_START_OFFSET);
        assert_eq!(dev.contents(third as u64 * 512, 4), vec![0x5A; 4]);
        assert_eq!(
            dev.contents((third as u64 + 20480) * 512 - 1, 1),
            vec![0x5A]
        );
    }

    #[test]
    fn test_full_pool_leaves_header_unchanged() {
        let fw = |lba| Osii {
            attribute: Attribute::SIGNED_FW,
            ..kernel_at(lba, 10)
        };
        let (mut mgr, dev) = manager_with(&[fw(FW_START_OFFSET), fw(FW_START_OFFSET + 2000)]);
        let before = dev.contents(0, 512);

        let template = Osii {
            attribute: Attribute::SIGNED_FW,
            ..Default::default()
        };
        let err = mgr.write_image(template, &[1u8; 1024], 0).unwrap_err();
        assert!(matches!(err, OsipError::NoSpace { pool: "firmware" }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Capacity);
        assert_eq!(dev.contents(0, 512), before);
    }

    #[test]
    fn test_oversized_image_rejected() {
        let (mut mgr, _dev) = manager_with(&[]);
        let template = Osii {
            attribute: Attribute::SIGNED_FW,
            ..Default::default()
        };
        let err = mgr
            .write_image(template, &vec![0u8; 2001 * 512], 0)
            .unwrap_err();
        assert!(matches!(err, OsipError::ImageTooLarge { sectors: 2001, .. }));
    }

    #[test]
    fn test_stitched_image_and_invalidation_preserved() {
        let (mut mgr, _dev) = manager_with(&[kernel_at(OS_START_OFFSET, 8)]);
        mgr.invalidate("boot").unwrap();
        assert!(mgr.read().unwrap().descriptors[0].is_invalidated());

        let template = kernel_at(0, 0);
        let data = stitched(template, &[0xAB; 4 * 512]);
        let index = mgr.named_index("boot", IndexMode::Write).unwrap();
        assert_eq!(index, 0);
        let osii = mgr.write_stitched(&data, index).unwrap();
        assert_eq!(osii.start_lba, OS_START_OFFSET + OS_MAX_LBA);
        assert!(osii.is_invalidated());

        mgr.restore("boot").unwrap();
        let d = mgr.read().unwrap().descriptors[0];
        assert_eq!(d.load_address, DEFAULT_LOAD_ADDRESS);
        assert_eq!(d.entry_point, DEFAULT_ENTRY_POINT);
    }

    #[test]
    fn test_stitched_size_mismatch() {
        let (mut mgr, _dev) = manager_with(&[]);
        let mut data = stitched(kernel_at(0, 0), &[0u8; 1024]);
        data.push(0);
        assert!(matches!(
            mgr.write_stitched(&data, 0),
            Err(OsipError::MalformedImage(_))
        ));
    }

    #[test]
    fn test_named_index_appends_on_write() {
        let (mut mgr, _dev) = manager_with(&[kernel_at(OS_START_OFFSET, 8)]);
        assert_eq!(mgr.named_index("boot", IndexMode::Read).unwrap(), 0);
        assert!(matches!(
            mgr.named_index("recovery", IndexMode::Read),
            Err(OsipError::DescriptorNotFound(_))
        ));
        assert_eq!(mgr.named_index("recovery", IndexMode::Write).unwrap(), 1);
        // Second splashscreen needs the first to exist
        assert!(mgr.named_index("splashscreen2", IndexMode::Write).is_err());
        assert!(matches!(
            mgr.named_index("bogus", IndexMode::Write),
            Err(OsipError::UnknownDestination(_))
        ));
    }

    #[test]
    fn test_displaced_descriptor_moves_to_end() {
        let fw = Osii {
            attribute: Attribute::SIGNED_FW,
            ..kernel_at(FW_START_OFFSET, 10)
        };
        let (mut mgr, _dev) = manager_with(&[fw]);
        let osii = mgr
            .write_image(kernel_at(0, 0), &[1u8; 512], 0)
            .unwrap();

        let header = mgr.read().unwrap();
        assert_eq!(header.descriptor_count, 2);
        assert_eq!(header.descriptors[0], osii);
        assert_eq!(header.descriptors[1], fw);
    }

    #[test]
    fn test_splashscreen_displaced_by_kernel() {
        let splash = Osii {
            attribute: Attribute::SIGNED_SPLASHSCREEN,
            ..kernel_at(OS_START_OFFSET, 8)
        };
        let (mut mgr, _dev) = manager_with(&[splash]);
        let osii = mgr
            .write_image(kernel_at(0, 0), &[1u8; 512], 0)
            .unwrap();

        let header = mgr.read().unwrap();
        assert_eq!(header.descriptor_count, 2);
        assert_eq!(header.descriptors[0], osii);
        assert_eq!(header.descriptors[1], splash);
    }

    #[test]
    fn test_recovery_overwritten_by_kernel() {
        let recovery = Osii {
            attribute: Attribute::SIGNED_ROS,
            ..kernel_at(OS_START_OFFSET, 8)
        };
        let (mut mgr, _dev) = manager_with(&[recovery]);
        let osii = mgr
            .write_image(kernel_at(0, 0), &[1u8; 512], 0)
            .unwrap();

        let header = mgr.read().unwrap();
        assert_eq!(header.descriptor_count, 1);
        assert_eq!(header.descriptors[0], osii);
    }

    #[test]
    fn test_index_past_table_is_protocol_error() {
        let (mut mgr, _dev) = manager_with(&[]);
        let err = mgr
            .write_image(kernel_at(0, 0), &[1u8; 512], 3)
            .unwrap_err();
        assert!(matches!(err, OsipError::BadIndex(3)));
        assert_eq!(err.kind(), crate::error::ErrorKind::Protocol);
    }

    #[test]
    fn test_backup_destroyed_before_update() {
        let (mut mgr, dev) = manager_with(&[]);
        let mut sig = [0u8; 4];
        sig.copy_from_slice(&OSIP_SIGNATURE.to_le_bytes());
        let mut raw = dev.handle();
        raw.write_all_at(OSIP_BACKUP_OFFSET, &sig).unwrap();

        mgr.write_image(kernel_at(0, 0), &[1u8; 512], 0).unwrap();
        assert_eq!(dev.contents(OSIP_BACKUP_OFFSET, 4), vec![0xFF; 4]);
    }

    #[test]
    fn test_default_and_erased_header() {
        let (mut mgr, dev) = manager_with(&[kernel_at(OS_START_OFFSET, 8)]);
        mgr.write_default_header().unwrap();
        let header = mgr.read().unwrap();
        assert_eq!(header.signature, OSIP_SIGNATURE);
        assert_eq!(header.header_rev_major, 1);
        assert_eq!(header.descriptor_count, 1);

        mgr.erase_header().unwrap();
        assert!(dev.contents(0, OSIP_SIZE).iter().all(|&b| b == 0));
    }
}
