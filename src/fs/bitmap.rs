//! Inode and zone bitmaps.
//!
//! Each bitmap is a run of cached blocks pinned by the superblock, 8192
//! bits apiece. Allocation scans for the first zero bit; bit 0 is reserved
//! set, so a scan can report "none" as the bit count.

use crate::dev::DevId;
use crate::fs::BITS_PER_BLOCK;
use crate::fs::inode::Inode;
use crate::kernel::{now, Kernel};
use crate::param::BLOCK_SIZE;

/// First zero bit in a bitmap block, or `BITS_PER_BLOCK` if it is full.
fn find_first_zero(data: &[u8; BLOCK_SIZE]) -> usize {
    for (byte, &b) in data.iter().enumerate() {
        if b != 0xff {
            return byte * 8 + (!b).trailing_zeros() as usize;
        }
    }
    BITS_PER_BLOCK
}

/// Sets a bit, returning its previous value.
fn set_bit(data: &mut [u8; BLOCK_SIZE], nr: usize) -> bool {
    let prev = data[nr / 8] & (1 << (nr % 8)) != 0;
    data[nr / 8] |= 1 << (nr % 8);
    prev
}

/// Clears a bit, returning whether it was already clear.
fn clear_bit(data: &mut [u8; BLOCK_SIZE], nr: usize) -> bool {
    let clear = data[nr / 8] & (1 << (nr % 8)) == 0;
    data[nr / 8] &= !(1 << (nr % 8));
    clear
}

impl Kernel {
    /// Allocates a data zone on `dev`: first zero zmap bit, zone zeroed in
    /// cache and marked dirty. `None` when the map or the device is full.
    pub fn new_block(&self, dev: DevId) -> Option<u32> {
        let zone = self
            .with_super(dev, |sb| {
                let (i, j) = sb
                    .zmap
                    .iter()
                    .enumerate()
                    .find_map(|(i, buf)| {
                        let j = find_first_zero(buf.data());
                        (j < BITS_PER_BLOCK).then_some((i, j))
                    })?;
                if set_bit(sb.zmap[i].data_mut(), j) {
                    panic!("new_block: bit already set");
                }
                sb.zmap[i].mark_dirty();
                let zone = (j + i * BITS_PER_BLOCK) as u32 + sb.first_data_zone as u32 - 1;
                if zone >= sb.nzones as u32 {
                    clear_bit(sb.zmap[i].data_mut(), j);
                    return None;
                }
                Some(zone)
            })
            .unwrap_or_else(|| panic!("trying to get new block from nonexistent device"))?;

        let mut buf = self.getblk(dev, zone);
        if self.bcache().ref_count(buf.index()) != 1 {
            panic!("new block: count is != 1");
        }
        buf.data_mut().fill(0);
        buf.mark_uptodate();
        buf.mark_dirty();
        self.brelse(buf);
        Some(zone)
    }

    /// Frees a data zone. Returns false when the block is still referenced
    /// in the cache and was left alone.
    pub fn free_block(&self, dev: DevId, block: u32) -> bool {
        let bit = self
            .with_super(dev, |sb| {
                if block < sb.first_data_zone as u32 || block >= sb.nzones as u32 {
                    panic!("trying to free block not in datazone");
                }
                block as usize - (sb.first_data_zone as usize - 1)
            })
            .unwrap_or_else(|| panic!("trying to free block on nonexistent device"));

        if let Some(buf) = self.get_hash_table(dev, block) {
            if self.bcache().ref_count(buf.index()) > 1 {
                self.brelse(buf);
                return false;
            }
            let sh = self.bcache().shared(buf.index());
            sh.set_dirty(false);
            sh.set_uptodate(false);
            self.brelse(buf);
        }

        self.with_super(dev, |sb| {
            let map = bit / BITS_PER_BLOCK;
            if clear_bit(sb.zmap[map].data_mut(), bit % BITS_PER_BLOCK) {
                tracing::warn!(?dev, block, "free_block: bit already cleared");
            }
            sb.zmap[map].mark_dirty();
        })
        .unwrap_or_else(|| panic!("trying to free block on nonexistent device"));
        true
    }

    /// Allocates an inode on `dev`: an empty in-memory slot, the first zero
    /// imap bit, and fresh metadata. `None` when the device is out of
    /// inodes.
    pub fn new_inode(&self, dev: DevId) -> Option<Inode> {
        let spare = self.get_empty_inode();
        let num = self
            .with_super(dev, |sb| {
                let (i, j) = sb
                    .imap
                    .iter()
                    .enumerate()
                    .find_map(|(i, buf)| {
                        let j = find_first_zero(buf.data());
                        (j < BITS_PER_BLOCK).then_some((i, j))
                    })?;
                if (j + i * BITS_PER_BLOCK) as u32 > sb.ninodes as u32 {
                    return None;
                }
                if set_bit(sb.imap[i].data_mut(), j) {
                    panic!("new_inode: bit already set");
                }
                sb.imap[i].mark_dirty();
                Some((j + i * BITS_PER_BLOCK) as u16)
            })
            .unwrap_or_else(|| panic!("new_inode with unknown device"));
        let Some(num) = num else {
            self.iput(spare);
            return None;
        };

        let (uid, gid) = self.fsids();
        let mut spare = spare;
        spare.retag(dev, num);
        self.with_inode(&spare, |slot| {
            slot.nlinks = 1;
            slot.dev = dev;
            slot.num = num;
            slot.uid = uid;
            slot.gid = gid;
            slot.dirty = true;
            let t = now();
            slot.mtime = t;
            slot.atime = t;
            slot.ctime = t;
        });
        Some(spare)
    }

    /// Frees the on-disk inode behind table slot `idx` and clears the slot.
    /// The caller holds the last reference.
    pub(crate) fn free_inode_slot(&self, idx: u16) {
        let (dev, num, count, nlinks) = {
            let table = self.itable().lock.lock();
            let s = &table.slots[idx as usize];
            (s.dev, s.num, s.count, s.nlinks)
        };
        if dev.is_none() {
            self.itable().lock.lock().slots[idx as usize].clear();
            return;
        }
        if count > 1 {
            tracing::error!(count, "trying to free inode with count>1");
            panic!("free_inode");
        }
        if nlinks > 0 {
            panic!("trying to free inode with links");
        }
        self.with_super(dev, |sb| {
            if num < 1 || num > sb.ninodes {
                panic!("trying to free inode 0 or nonexistent inode");
            }
            let map = num as usize / BITS_PER_BLOCK;
            let Some(buf) = sb.imap.get_mut(map) else {
                panic!("nonexistent imap in superblock");
            };
            if clear_bit(buf.data_mut(), num as usize % BITS_PER_BLOCK) {
                tracing::warn!(?dev, num, "free_inode: bit already cleared");
            }
            buf.mark_dirty();
        })
        .unwrap_or_else(|| panic!("trying to free inode on nonexistent device"));
        self.itable().lock.lock().slots[idx as usize].clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_zero_scans_bytes_then_bits() {
        let mut data = [0u8; BLOCK_SIZE];
        data[0] = 0b0000_0111;
        assert_eq!(find_first_zero(&data), 3);
        data[0] = 0xff;
        assert_eq!(find_first_zero(&data), 8);
        data.fill(0xff);
        assert_eq!(find_first_zero(&data), BITS_PER_BLOCK);
        data[1023] = 0x7f;
        assert_eq!(find_first_zero(&data), 8191);
    }

    #[test]
    fn set_and_clear_report_previous_state() {
        let mut data = [0u8; BLOCK_SIZE];
        assert!(!set_bit(&mut data, 100));
        assert!(set_bit(&mut data, 100));
        assert!(!clear_bit(&mut data, 100));
        assert!(clear_bit(&mut data, 100));
    }
}
