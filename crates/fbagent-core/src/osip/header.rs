//! OSIP header and OSII descriptor layout.
//!
//! The header lives at byte 0 of the boot device: a 32-byte fixed part
//! followed by eight 24-byte OSII descriptors, all little-endian. The XOR of
//! every byte (checksum included) is zero for a valid header.

use std::fmt;
use std::io::Cursor;
use std::ops::Range;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};

use super::OsipError;

/// `$OS$`
pub const OSIP_SIGNATURE: u32 = 0x2453_4F24;
pub const MAX_OSII: usize = 8;
pub const OSIP_FIXED_SIZE: usize = 0x20;
pub const OSII_SIZE: usize = 0x18;
/// Header plus every descriptor slot.
pub const OSIP_SIZE: usize = OSIP_FIXED_SIZE + MAX_OSII * OSII_SIZE;
/// A backup copy of the header may follow the primary one.
pub const OSIP_BACKUP_OFFSET: u64 = 0xE0;
/// Sector size OSII addresses and sizes are expressed in.
pub const LBA_SIZE: usize = 512;

pub const DEFAULT_LOAD_ADDRESS: u32 = 0x0110_0000;
pub const DEFAULT_ENTRY_POINT: u32 = 0x0110_1000;

/// OSII attribute byte. Bit 0 set means unsigned; the rest is the class.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Attribute(pub u8);

impl Attribute {
    pub const SIGNED_KERNEL: Self = Self(0x00);
    pub const UNSIGNED_KERNEL: Self = Self(0x01);
    pub const HIDDEN: Self = Self(0x02);
    pub const SIGNED_SPLASHSCREEN: Self = Self(0x04);
    pub const FILESYSTEM: Self = Self(0x06);
    pub const SIGNED_FW: Self = Self(0x08);
    pub const UNSIGNED_FW: Self = Self(0x09);
    pub const SIGNED_COS: Self = Self(0x0A);
    pub const SIGNED_ROS: Self = Self(0x0C);
    pub const SIGNED_POS: Self = Self(0x0E);
    pub const SIGNED_COMB: Self = Self(0x10);
    pub const SIGNED_RAMDUMPOS: Self = Self(0x14);
    pub const NOT_USED: Self = Self(0xFF);

    pub fn is_signed(self) -> bool {
        self.0 & 1 == 0
    }

    pub fn class(self) -> ImageClass {
        ImageClass::from_bits(self.0 & !1)
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Attribute(0x{:02X} {} {})",
            self.0,
            self.class(),
            if self.is_signed() { "signed" } else { "unsigned" }
        )
    }
}

/// What an OSII describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageClass {
    Kernel,
    Hidden,
    Splashscreen,
    Filesystem,
    Firmware,
    ChargingOs,
    Recovery,
    Provisioning,
    Combined,
    RamdumpOs,
    NotUsed,
    Unknown(u8),
}

impl ImageClass {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0x00 => ImageClass::Kernel,
            0x02 => ImageClass::Hidden,
            0x04 => ImageClass::Splashscreen,
            0x06 => ImageClass::Filesystem,
            0x08 => ImageClass::Firmware,
            0x0A => ImageClass::ChargingOs,
            0x0C => ImageClass::Recovery,
            0x0E => ImageClass::Provisioning,
            0x10 => ImageClass::Combined,
            0x14 => ImageClass::RamdumpOs,
            0xFE => ImageClass::NotUsed,
            other => ImageClass::Unknown(other),
        }
    }

    /// Classes stored in the OS slot pool.
    pub fn is_os(self) -> bool {
        matches!(
            self,
            ImageClass::Kernel
                | ImageClass::Splashscreen
                | ImageClass::ChargingOs
                | ImageClass::Recovery
                | ImageClass::Provisioning
                | ImageClass::Combined
                | ImageClass::RamdumpOs
        )
    }

    /// Classes whose descriptor a new image simply overwrites. Any other
    /// class of a different kind is kept and moved to the end of the table.
    pub fn replaced_in_place(self) -> bool {
        matches!(
            self,
            ImageClass::Kernel
                | ImageClass::ChargingOs
                | ImageClass::Recovery
                | ImageClass::Provisioning
                | ImageClass::Combined
                | ImageClass::RamdumpOs
                | ImageClass::NotUsed
        )
    }
}

impl fmt::Display for ImageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageClass::Kernel => write!(f, "kernel"),
            ImageClass::Hidden => write!(f, "hidden"),
            ImageClass::Splashscreen => write!(f, "splashscreen"),
            ImageClass::Filesystem => write!(f, "filesystem"),
            ImageClass::Firmware => write!(f, "firmware"),
            ImageClass::ChargingOs => write!(f, "cos"),
            ImageClass::Recovery => write!(f, "recovery"),
            ImageClass::Provisioning => write!(f, "pos"),
            ImageClass::Combined => write!(f, "combined"),
            ImageClass::RamdumpOs => write!(f, "ramdump"),
            ImageClass::NotUsed => write!(f, "unused"),
            ImageClass::Unknown(bits) => write!(f, "class 0x{bits:02X}"),
        }
    }
}

/// OS Image Identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Osii {
    pub os_rev_minor: u16,
    pub os_rev_major: u16,
    pub start_lba: u32,
    pub load_address: u32,
    pub entry_point: u32,
    pub size_in_sectors: u32,
    pub attribute: Attribute,
    pub reserved: [u8; 3],
}

impl Osii {
    fn read_from(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        let mut osii = Self {
            os_rev_minor: cursor.read_u16::<LittleEndian>()?,
            os_rev_major: cursor.read_u16::<LittleEndian>()?,
            start_lba: cursor.read_u32::<LittleEndian>()?,
            load_address: cursor.read_u32::<LittleEndian>()?,
            entry_point: cursor.read_u32::<LittleEndian>()?,
            size_in_sectors: cursor.read_u32::<LittleEndian>()?,
            attribute: Attribute(cursor.read_u8()?),
            reserved: [0; 3],
        };
        for b in osii.reserved.iter_mut() {
            *b = cursor.read_u8()?;
        }
        Ok(osii)
    }

    fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u16(&mut buf[0..2], self.os_rev_minor);
        LittleEndian::write_u16(&mut buf[2..4], self.os_rev_major);
        LittleEndian::write_u32(&mut buf[4..8], self.start_lba);
        LittleEndian::write_u32(&mut buf[8..12], self.load_address);
        LittleEndian::write_u32(&mut buf[12..16], self.entry_point);
        LittleEndian::write_u32(&mut buf[16..20], self.size_in_sectors);
        buf[20] = self.attribute.0;
        buf[21..24].copy_from_slice(&self.reserved);
    }

    /// Sectors this image occupies on disk.
    pub fn occupied(&self) -> Range<u64> {
        let start = u64::from(self.start_lba);
        start..start + u64::from(self.size_in_sectors)
    }

    /// An invalidated image keeps its bytes but cannot be booted.
    pub fn is_invalidated(&self) -> bool {
        self.load_address == 0 && self.entry_point == 0
    }
}

/// OS Image Profile header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OsipHeader {
    pub signature: u32,
    pub intel_reserved: u8,
    pub header_rev_minor: u8,
    pub header_rev_major: u8,
    pub checksum: u8,
    pub descriptor_count: u8,
    pub image_count: u8,
    pub header_size: u16,
    pub reserved: [u32; 5],
    pub descriptors: [Osii; MAX_OSII],
}

impl OsipHeader {
    /// A fresh header with one descriptor slot in use.
    pub fn new_default() -> Self {
        let mut header = Self {
            signature: OSIP_SIGNATURE,
            header_rev_major: 1,
            header_rev_minor: 0,
            image_count: 1,
            ..Default::default()
        };
        header.set_count(1);
        header.update_checksum();
        header
    }

    /// Parse a header. The checksum is not verified here.
    pub fn from_bytes(data: &[u8]) -> Result<Self, OsipError> {
        if data.len() < OSIP_SIZE {
            return Err(OsipError::TooShort(data.len()));
        }
        let mut cursor = Cursor::new(&data[..OSIP_SIZE]);
        let mut header = Self {
            signature: cursor.read_u32::<LittleEndian>()?,
            intel_reserved: cursor.read_u8()?,
            header_rev_minor: cursor.read_u8()?,
            header_rev_major: cursor.read_u8()?,
            checksum: cursor.read_u8()?,
            descriptor_count: cursor.read_u8()?,
            image_count: cursor.read_u8()?,
            header_size: cursor.read_u16::<LittleEndian>()?,
            ..Default::default()
        };
        for r in header.reserved.iter_mut() {
            *r = cursor.read_u32::<LittleEndian>()?;
        }
        for d in header.descriptors.iter_mut() {
            *d = Osii::read_from(&mut cursor)?;
        }
        Ok(header)
    }

    pub fn to_bytes(&self) -> [u8; OSIP_SIZE] {
        let mut buf = [0u8; OSIP_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.signature);
        buf[4] = self.intel_reserved;
        buf[5] = self.header_rev_minor;
        buf[6] = self.header_rev_major;
        buf[7] = self.checksum;
        buf[8] = self.descriptor_count;
        buf[9] = self.image_count;
        LittleEndian::write_u16(&mut buf[10..12], self.header_size);
        for (i, r) in self.reserved.iter().enumerate() {
            LittleEndian::write_u32(&mut buf[12 + i * 4..16 + i * 4], *r);
        }
        for (i, d) in self.descriptors.iter().enumerate() {
            let off = OSIP_FIXED_SIZE + i * OSII_SIZE;
            d.write_to(&mut buf[off..off + OSII_SIZE]);
        }
        buf
    }

    /// Recompute the checksum so the XOR of all bytes is zero.
    pub fn update_checksum(&mut self) {
        self.checksum = 0;
        self.checksum = xor_checksum(&self.to_bytes());
    }

    pub fn is_checksum_valid(&self) -> bool {
        xor_checksum(&self.to_bytes()) == 0
    }

    /// Descriptors in use.
    pub fn descriptors(&self) -> &[Osii] {
        let n = usize::from(self.descriptor_count).min(MAX_OSII);
        &self.descriptors[..n]
    }

    pub fn count(&self) -> usize {
        usize::from(self.descriptor_count).min(MAX_OSII)
    }

    /// Set the number of descriptors in use and the matching header size.
    pub fn set_count(&mut self, count: usize) {
        self.descriptor_count = count as u8;
        self.header_size = (count * OSII_SIZE + OSIP_FIXED_SIZE) as u16;
    }
}

/// XOR of every byte.
pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> OsipHeader {
        let mut header = OsipHeader::new_default();
        header.descriptors[0] = Osii {
            os_rev_minor: 3,
            os_rev_major: 1,
            start_lba: 4050,
            load_address: DEFAULT_LOAD_ADDRESS,
            entry_point: DEFAULT_ENTRY_POINT,
            size_in_sectors: 1234,
            attribute: Attribute::SIGNED_KERNEL,
            reserved: [0; 3],
        };
        header.set_count(1);
        header.update_checksum();
        header
    }

    #[test]
    fn test_layout_size() {
        assert_eq!(OSIP_SIZE, 0xE0);
        assert_eq!(OSIP_SIZE as u64, OSIP_BACKUP_OFFSET);
    }

    #[test]
    fn test_xor_of_all_bytes_is_zero() {
        let header = sample();
        assert_eq!(xor_checksum(&header.to_bytes()), 0);
        assert!(header.is_checksum_valid());

        let mut broken = header.clone();
        broken.descriptors[0].size_in_sectors += 1;
        assert!(!broken.is_checksum_valid());
    }

    #[test]
    fn test_parse_serialize() {
        let header = sample();
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], b"$OS$");
        assert_eq!(LittleEndian::read_u32(&bytes[0x24..0x28]), 4050);

        let parsed = OsipHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert!(matches!(
            OsipHeader::from_bytes(&bytes[..100]),
            Err(OsipError::TooShort(100))
        ));
    }

    #[test]
    fn test_attribute_classes() {
        assert!(Attribute::SIGNED_KERNEL.is_signed());
        assert!(!Attribute::UNSIGNED_KERNEL.is_signed());
        assert_eq!(Attribute::UNSIGNED_KERNEL.class(), ImageClass::Kernel);
        assert_eq!(Attribute::UNSIGNED_FW.class(), ImageClass::Firmware);
        assert_eq!(Attribute::NOT_USED.class(), ImageClass::NotUsed);
        assert!(ImageClass::Recovery.is_os());
        assert!(!ImageClass::Firmware.is_os());
    }

    #[test]
    fn test_set_count_updates_header_size() {
        let mut header = OsipHeader::new_default();
        header.set_count(3);
        assert_eq!(header.descriptors().len(), 3);
        assert_eq!(header.header_size, 3 * 0x18 + 0x20);
    }
}
