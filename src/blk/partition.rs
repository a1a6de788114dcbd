//! MBR partition tables.
//!
//! Disk drivers map partition minors onto sector ranges by reading block 0
//! of the whole disk and handing it here.

use static_assertions::const_assert_eq;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::error::Error;
use crate::param::BLOCK_SIZE;

/// Byte offset of the four partition entries.
const PARTITION_TABLE_OFFSET: usize = 446;

/// Byte offset of the boot signature.
const SIGNATURE_OFFSET: usize = 510;

const SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// One on-disk partition entry.
#[repr(C)]
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy)]
struct RawPartition {
    boot_ind: u8,
    head: u8,
    sector: u8,
    cyl: u8,
    sys_ind: u8,
    end_head: u8,
    end_sector: u8,
    end_cyl: u8,
    start_sect: U32<LittleEndian>,
    nr_sects: U32<LittleEndian>,
}

const_assert_eq!(core::mem::size_of::<RawPartition>(), 16);

/// A partition's sector range. Empty entries parse as zero length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Partition {
    pub start_sect: u32,
    pub nr_sects: u32,
}

/// Parses the partition table out of a whole-disk block 0.
pub fn parse_partition_table(block0: &[u8; BLOCK_SIZE]) -> Result<[Partition; 4], Error> {
    if block0[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 2] != SIGNATURE {
        return Err(Error::BadPartitionTable);
    }
    let mut parts = [Partition::default(); 4];
    for (i, part) in parts.iter_mut().enumerate() {
        let off = PARTITION_TABLE_OFFSET + i * core::mem::size_of::<RawPartition>();
        let raw = RawPartition::read_from_prefix(&block0[off..]).ok_or(Error::BadPartitionTable)?;
        part.start_sect = raw.start_sect.get();
        part.nr_sects = raw.nr_sects.get();
    }
    Ok(parts)
}
