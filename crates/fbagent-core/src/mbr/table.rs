//! Partition planning and on-disk MBR/EBR encoding.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, info, instrument};

use super::MbrError;
use crate::storage::{BlockDevice, SECTOR_SIZE, StorageError, Volume};

// ============================================================================
// On-disk layout
// ============================================================================

/// Offset of the partition table inside an MBR or EBR sector.
pub const PART_TABLE_OFFSET: usize = 0x1BE;

pub const PART_ENTRY_SIZE: usize = 16;

/// Boot signature at the end of every table sector.
pub const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

pub const NUM_PRIMARY_PARTITIONS: usize = 3;

pub const TYPE_EMPTY: u8 = 0x00;
pub const TYPE_EXTENDED: u8 = 0x05;
pub const TYPE_VFAT: u8 = 0x0C;
pub const TYPE_LINUX: u8 = 0x83;

const SECTORS_PER_MB: u64 = 1024 * 1024 / SECTOR_SIZE;

// ============================================================================
// Plan
// ============================================================================

/// What a requested partition turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    Linux,
    Vfat,
    /// Space skipped without a table entry.
    Hidden,
}

impl PartitionKind {
    pub fn from_fs_type(fs_type: &str) -> Self {
        match fs_type {
            "vfat" => PartitionKind::Vfat,
            "hidden" => PartitionKind::Hidden,
            _ => PartitionKind::Linux,
        }
    }

    fn type_byte(self) -> Option<u8> {
        match self {
            PartitionKind::Linux => Some(TYPE_LINUX),
            PartitionKind::Vfat => Some(TYPE_VFAT),
            PartitionKind::Hidden => None,
        }
    }
}

/// One partition entry, in absolute sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionEntry {
    pub part_type: u8,
    pub lba_start: u64,
    pub lba_count: u64,
}

impl PartitionEntry {
    pub fn end(&self) -> u64 {
        self.lba_start + self.lba_count
    }
}

/// Partitions laid out in request order.
#[derive(Debug, Clone)]
pub struct PartitionPlan {
    max_lba: u64,
    /// Sectors reserved before each chained EBR (one track).
    gap: u64,
    partitions: Vec<PartitionEntry>,
    pending_hidden: u64,
}

impl PartitionPlan {
    pub fn new(max_lba: u64, gap: u64) -> Self {
        Self {
            max_lba,
            gap,
            partitions: Vec::new(),
            pending_hidden: 0,
        }
    }

    /// Plan for `device`, which must use 512-byte sectors.
    pub fn for_device(device: &mut dyn BlockDevice) -> Result<Self, MbrError> {
        let sector_size = device.sector_size()?;
        if u64::from(sector_size) != SECTOR_SIZE {
            return Err(StorageError::SectorSize(sector_size).into());
        }
        let max_lba = device.size_bytes()? / SECTOR_SIZE;
        let gap = u64::from(device.sectors_per_track()?);
        debug!(max_lba, gap, "Disk geometry");
        Ok(Self::new(max_lba, gap))
    }

    pub fn max_lba(&self) -> u64 {
        self.max_lba
    }

    pub fn gap(&self) -> u64 {
        self.gap
    }

    pub fn partitions(&self) -> &[PartitionEntry] {
        &self.partitions
    }

    /// Append a partition of `size_mb` megabytes.
    pub fn add_partition(&mut self, size_mb: u64, kind: PartitionKind) -> Result<(), MbrError> {
        let count = size_mb * SECTORS_PER_MB;
        let Some(part_type) = kind.type_byte() else {
            self.pending_hidden += count;
            return Ok(());
        };

        let index = self.partitions.len();
        let start = match self.partitions.last() {
            None => self.gap,
            Some(prev) if index < NUM_PRIMARY_PARTITIONS => prev.end(),
            Some(prev) => prev.end() + self.gap,
        } + self.pending_hidden;

        let entry = PartitionEntry {
            part_type,
            lba_start: start,
            lba_count: count,
        };
        if entry.end() > self.max_lba {
            return Err(MbrError::NoSpace {
                needed: entry.end(),
                available: self.max_lba,
            });
        }
        self.partitions.push(entry);
        self.pending_hidden = 0;
        Ok(())
    }

    /// Last sector used by the plan.
    pub fn end(&self) -> u64 {
        self.partitions.last().map_or(0, PartitionEntry::end)
    }

    /// Start of the extended partition, if one is needed.
    pub fn extended_start(&self) -> Option<u64> {
        self.partitions
            .get(NUM_PRIMARY_PARTITIONS)
            .map(|p| p.lba_start - self.gap)
    }

    /// Write the MBR and every EBR, then have the kernel reload the table.
    #[instrument(skip_all, fields(partitions = self.partitions.len()))]
    pub fn commit(&self, device: &mut dyn BlockDevice) -> Result<(), MbrError> {
        if self.partitions.is_empty() {
            return Err(MbrError::EmptyPlan);
        }
        let available = device.size_bytes()? / SECTOR_SIZE;
        if available < self.end() {
            return Err(MbrError::NoSpace {
                needed: self.end(),
                available,
            });
        }

        self.write_mbr(device)?;
        for index in NUM_PRIMARY_PARTITIONS..self.partitions.len() {
            self.write_ebr(device, index)?;
        }
        device.sync()?;
        device.reload_partition_table()?;
        info!(end = self.end(), "Partition table written");
        Ok(())
    }

    fn write_mbr(&self, device: &mut dyn BlockDevice) -> Result<(), MbrError> {
        let mut sector = [0u8; SECTOR_SIZE as usize];
        // keep the boot code area
        device.read_exact_at(0, &mut sector)?;

        let mut entries = [None; 4];
        for (slot, part) in entries
            .iter_mut()
            .zip(self.partitions.iter().take(NUM_PRIMARY_PARTITIONS))
        {
            *slot = Some(*part);
        }
        if let Some(ext_start) = self.extended_start() {
            entries[NUM_PRIMARY_PARTITIONS] = Some(PartitionEntry {
                part_type: TYPE_EXTENDED,
                lba_start: ext_start,
                lba_count: self.end() - ext_start,
            });
        }
        encode_table(&mut sector, &entries)?;
        device.write_all_at(0, &sector)?;
        debug!("MBR written");
        Ok(())
    }

    fn write_ebr(&self, device: &mut dyn BlockDevice, index: usize) -> Result<(), MbrError> {
        let part = &self.partitions[index];
        let ext_start = self.extended_start().unwrap_or_default();
        let ebr_lba = part.lba_start - self.gap;

        let mut entries = [None; 4];
        entries[0] = Some(PartitionEntry {
            part_type: part.part_type,
            lba_start: self.gap,
            lba_count: part.lba_count,
        });
        if let Some(next) = self.partitions.get(index + 1) {
            entries[1] = Some(PartitionEntry {
                part_type: TYPE_EXTENDED,
                lba_start: next.lba_start - ext_start - self.gap,
                lba_count: next.lba_count + self.gap,
            });
        }

        let mut sector = [0u8; SECTOR_SIZE as usize];
        encode_table(&mut sector, &entries)?;
        device.write_all_at(ebr_lba * SECTOR_SIZE, &sector)?;
        debug!(index, ebr_lba, "EBR written");
        Ok(())
    }
}

fn encode_table(sector: &mut [u8], entries: &[Option<PartitionEntry>; 4]) -> Result<(), MbrError> {
    let table = &mut sector[PART_TABLE_OFFSET..PART_TABLE_OFFSET + 4 * PART_ENTRY_SIZE];
    let mut cursor = Cursor::new(table);
    for entry in entries {
        let entry = entry.unwrap_or(PartitionEntry {
            part_type: TYPE_EMPTY,
            lba_start: 0,
            lba_count: 0,
        });
        let start = u32::try_from(entry.lba_start).map_err(|_| MbrError::OutOfRange(entry.lba_start))?;
        let count = u32::try_from(entry.lba_count).map_err(|_| MbrError::OutOfRange(entry.lba_count))?;
        // status and CHS fields stay zero; Linux only reads the LBA fields
        cursor.write_all(&[0; 4])?;
        cursor.write_u8(entry.part_type)?;
        cursor.write_all(&[0; 3])?;
        cursor.write_u32::<LittleEndian>(start)?;
        cursor.write_u32::<LittleEndian>(count)?;
    }
    sector[510..512].copy_from_slice(&BOOT_SIGNATURE);
    Ok(())
}

fn decode_table(sector: &[u8], lba: u64) -> Result<[PartitionEntry; 4], MbrError> {
    if sector[510..512] != BOOT_SIGNATURE {
        return Err(MbrError::BadSignature(lba));
    }
    let mut cursor = Cursor::new(&sector[PART_TABLE_OFFSET..PART_TABLE_OFFSET + 4 * PART_ENTRY_SIZE]);
    let mut out = [PartitionEntry {
        part_type: TYPE_EMPTY,
        lba_start: 0,
        lba_count: 0,
    }; 4];
    for entry in out.iter_mut() {
        let _status = cursor.read_u32::<LittleEndian>()?;
        entry.part_type = cursor.read_u8()?;
        let mut chs = [0u8; 3];
        cursor.read_exact(&mut chs)?;
        entry.lba_start = u64::from(cursor.read_u32::<LittleEndian>()?);
        entry.lba_count = u64::from(cursor.read_u32::<LittleEndian>()?);
    }
    Ok(out)
}

/// Read back every partition, following the EBR chain.
pub fn read_partitions(device: &mut dyn BlockDevice) -> Result<Vec<PartitionEntry>, MbrError> {
    let mut sector = [0u8; SECTOR_SIZE as usize];
    device.read_exact_at(0, &mut sector)?;
    let mbr = decode_table(&sector, 0)?;

    let mut partitions = Vec::new();
    let mut extended = None;
    for entry in mbr {
        match entry.part_type {
            TYPE_EMPTY => {}
            TYPE_EXTENDED => extended = Some(entry.lba_start),
            _ => partitions.push(entry),
        }
    }

    let Some(ext_start) = extended else {
        return Ok(partitions);
    };
    let mut ebr_lba = ext_start;
    loop {
        device.read_exact_at(ebr_lba * SECTOR_SIZE, &mut sector)?;
        let ebr = decode_table(&sector, ebr_lba)?;
        partitions.push(PartitionEntry {
            part_type: ebr[0].part_type,
            lba_start: ebr_lba + ebr[0].lba_start,
            lba_count: ebr[0].lba_count,
        });
        if ebr[1].part_type != TYPE_EXTENDED {
            break;
        }
        let next = ext_start + ebr[1].lba_start;
        if next <= ebr_lba {
            return Err(MbrError::BadSignature(next));
        }
        ebr_lba = next;
    }
    Ok(partitions)
}

/// Plan partitions for `volumes` in order.
///
/// Volumes with a size hint get `hint + 1` MB reserved up front, the
/// extra megabyte covering EBR gaps. Volumes without one share what is
/// left evenly.
pub fn layout_from_volumes<'a>(
    mut plan: PartitionPlan,
    volumes: impl IntoIterator<Item = &'a Volume>,
) -> Result<PartitionPlan, MbrError> {
    let volumes: Vec<&Volume> = volumes.into_iter().collect();
    let mut reserved = 0u64;
    let mut auto_parts = 0u64;
    for v in &volumes {
        match v.size_hint_mb {
            Some(hint) if hint > 0 => reserved += hint + 1,
            _ => auto_parts += 1,
        }
    }

    let max_mb = plan.max_lba() / SECTORS_PER_MB;
    if max_mb < reserved {
        return Err(MbrError::NoSpace {
            needed: reserved * SECTORS_PER_MB,
            available: plan.max_lba(),
        });
    }
    let auto_size = if auto_parts > 0 {
        (max_mb - reserved) / auto_parts
    } else {
        0
    };

    for v in volumes {
        let size = match v.size_hint_mb {
            Some(hint) if hint > 0 => hint,
            _ => auto_size,
        };
        let kind = PartitionKind::from_fs_type(&v.fs_type);
        debug!(volume = %v.name, size_mb = size, kind = ?kind, "Planning partition");
        plan.add_partition(size, kind)?;
    }
    Ok(plan)
}
