//! The in-memory inode table.
//!
//! A fixed pool of slots mirroring on-disk inodes, with reference counts,
//! a lock flag serializing disk transfers, and two wait channels apiece
//! (the second is the pipe writers' channel). `iget` hands out counted
//! handles; `iput` drops the last reference, truncating and freeing the
//! on-disk inode when its link count has reached zero.
//!
//! The table lock guards every slot field. Paths that must read or write
//! the disk drop it first and re-validate afterwards; identity cannot shift
//! under a held reference, since reuse requires `count == 0`.

use core::mem;

use zerocopy::{AsBytes, FromBytes};

use crate::dev::DevId;
use crate::fs::{inode_block, DInode, Mode, MAX_FILE_BLOCKS, NR_DIRECT, ZONES_PER_BLOCK};
use crate::kernel::{now, Kernel};
use crate::param::{NR_INODE, PAGE_SIZE, ROOT_INO};
use super::INODES_PER_BLOCK;
use crate::sync::{SleepableLock, SleepableLockGuard, WaitChannel};

/// Pipe ring state, held instead of overloading the size and zone fields.
pub(crate) struct PipeRing {
    pub(crate) page: Box<[u8; PAGE_SIZE]>,
    pub(crate) head: u16,
    pub(crate) tail: u16,
}

impl PipeRing {
    fn new() -> Self {
        Self {
            page: Box::new([0; PAGE_SIZE]),
            head: 0,
            tail: 0,
        }
    }
}

pub(crate) struct InodeSlot {
    // On-disk mirror.
    pub(crate) mode: Mode,
    pub(crate) uid: u16,
    pub(crate) size: u32,
    pub(crate) mtime: u32,
    pub(crate) gid: u8,
    pub(crate) nlinks: u8,
    pub(crate) zone: [u16; 9],
    // Memory only.
    pub(crate) atime: u32,
    pub(crate) ctime: u32,
    pub(crate) dev: DevId,
    pub(crate) num: u16,
    pub(crate) count: u16,
    pub(crate) locked: bool,
    pub(crate) dirty: bool,
    pub(crate) mounted: bool,
    pub(crate) seek: bool,
    pub(crate) update: bool,
    pub(crate) pipe: Option<Box<PipeRing>>,
}

impl InodeSlot {
    pub(crate) fn new() -> Self {
        Self {
            mode: Mode::empty(),
            uid: 0,
            size: 0,
            mtime: 0,
            gid: 0,
            nlinks: 0,
            zone: [0; 9],
            atime: 0,
            ctime: 0,
            dev: DevId::NONE,
            num: 0,
            count: 0,
            locked: false,
            dirty: false,
            mounted: false,
            seek: false,
            update: false,
            pipe: None,
        }
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::new();
    }

    fn is(&self, dev: DevId, num: u16) -> bool {
        self.dev == dev && self.num == num
    }
}

struct InodeChans {
    wait: WaitChannel,
    /// Pipe writers sleep here; readers share `wait` with lock waiters.
    wait2: WaitChannel,
}

pub(crate) struct ITableState {
    pub(crate) slots: Vec<InodeSlot>,
    cursor: usize,
}

pub(crate) struct ITable {
    pub(crate) lock: SleepableLock<ITableState>,
    chans: Vec<InodeChans>,
}

impl ITable {
    pub(crate) fn new() -> Self {
        Self {
            lock: SleepableLock::new(ITableState {
                slots: (0..NR_INODE).map(|_| InodeSlot::new()).collect(),
                cursor: 0,
            }),
            chans: (0..NR_INODE)
                .map(|_| InodeChans {
                    wait: WaitChannel::new(),
                    wait2: WaitChannel::new(),
                })
                .collect(),
        }
    }
}

/// A counted reference to an in-memory inode. Must be released with
/// [`Kernel::iput`]; dropping a live handle is a leak and panics.
#[must_use]
pub struct Inode {
    idx: u16,
    dev: DevId,
    num: u16,
}

impl Inode {
    fn new(idx: u16, dev: DevId, num: u16) -> Self {
        Self { idx, dev, num }
    }

    pub fn dev(&self) -> DevId {
        self.dev
    }

    pub fn num(&self) -> u16 {
        self.num
    }

    pub(crate) fn index(&self) -> u16 {
        self.idx
    }

    pub(crate) fn retag(&mut self, dev: DevId, num: u16) {
        self.dev = dev;
        self.num = num;
    }
}

impl core::fmt::Debug for Inode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Inode({:?}:{})", self.dev, self.num)
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            panic!("inode {:?} dropped without iput", self);
        }
    }
}

type TableGuard<'a> = SleepableLockGuard<'a, ITableState>;

impl Kernel {
    fn wait_on_inode(&self, table: &mut TableGuard<'_>, idx: usize) {
        while table.slots[idx].locked {
            table.sleep_on(&self.itable().chans[idx].wait);
        }
    }

    fn lock_inode(&self, idx: usize) {
        let mut table = self.itable().lock.lock();
        self.wait_on_inode(&mut table, idx);
        table.slots[idx].locked = true;
    }

    fn unlock_inode(&self, idx: usize) {
        let mut table = self.itable().lock.lock();
        table.slots[idx].locked = false;
        drop(table);
        self.itable().chans[idx].wait.wakeup();
    }

    /// Runs `f` on the slot behind a handle, with the table locked and the
    /// inode unlocked. `f` must not sleep.
    pub(crate) fn with_inode<R>(&self, inode: &Inode, f: impl FnOnce(&mut InodeSlot) -> R) -> R {
        let idx = inode.index() as usize;
        let mut table = self.itable().lock.lock();
        self.wait_on_inode(&mut table, idx);
        f(&mut table.slots[idx])
    }

    /// Duplicates a handle, taking another reference on the slot.
    pub fn idup(&self, inode: &Inode) -> Inode {
        let idx = inode.index() as usize;
        let mut table = self.itable().lock.lock();
        table.slots[idx].count += 1;
        Inode::new(inode.index(), inode.dev(), inode.num())
    }

    /// Finds or loads the in-memory inode `(dev, nr)`, crossing mount
    /// points. Panics when the table is full of referenced inodes.
    pub fn iget(&self, dev: DevId, nr: u16) -> Inode {
        assert!(!dev.is_none(), "iget with dev==0");
        let mut spare = Some(self.get_empty_inode());
        let (mut dev, mut nr) = (dev, nr);
        'scan: loop {
            let mut table = self.itable().lock.lock();
            let mut i = 0;
            while i < NR_INODE {
                if !table.slots[i].is(dev, nr) {
                    i += 1;
                    continue;
                }
                self.wait_on_inode(&mut table, i);
                if !table.slots[i].is(dev, nr) {
                    // Re-keyed while we slept; scan from scratch.
                    i = 0;
                    continue;
                }
                table.slots[i].count += 1;
                if table.slots[i].mounted {
                    drop(table);
                    let handle = Inode::new(i as u16, dev, nr);
                    match self.find_imount(i as u16) {
                        None => {
                            tracing::warn!(?dev, nr, "mounted inode hasn't got sb");
                            if let Some(spare) = spare.take() {
                                self.iput(spare);
                            }
                            return handle;
                        }
                        Some(mounted_dev) => {
                            self.iput(handle);
                            dev = mounted_dev;
                            nr = ROOT_INO;
                            continue 'scan;
                        }
                    }
                }
                drop(table);
                if let Some(spare) = spare.take() {
                    self.iput(spare);
                }
                return Inode::new(i as u16, dev, nr);
            }
            // Not in the table: give the spare its identity and read it in.
            // The slot is locked before the table lock drops, so a parallel
            // iget of the same inode waits for the disk copy.
            let mut handle = spare.take().expect("iget spare already consumed");
            let idx = handle.index();
            {
                let slot = &mut table.slots[idx as usize];
                slot.dev = dev;
                slot.num = nr;
                slot.locked = true;
            }
            drop(table);
            handle.retag(dev, nr);
            self.read_inode(idx);
            return handle;
        }
    }

    /// Drops one reference. The last reference writes back a dirty inode,
    /// or truncates and frees it when its link count is zero.
    pub fn iput(&self, inode: Inode) {
        let idx = inode.index() as usize;
        let mut table = self.itable().lock.lock();
        self.wait_on_inode(&mut table, idx);
        if table.slots[idx].count == 0 {
            panic!("iput: trying to free free inode");
        }

        if table.slots[idx].pipe.is_some() {
            drop(table);
            self.itable().chans[idx].wait.wakeup();
            self.itable().chans[idx].wait2.wakeup();
            let mut table = self.itable().lock.lock();
            table.slots[idx].count -= 1;
            if table.slots[idx].count == 0 {
                table.slots[idx].clear();
            }
            return mem::forget(inode);
        }

        if table.slots[idx].dev.is_none() {
            table.slots[idx].count -= 1;
            return mem::forget(inode);
        }

        if table.slots[idx].mode.is_block_dev() {
            let bdev = DevId(table.slots[idx].zone[0]);
            drop(table);
            self.sync_dev(bdev);
            table = self.itable().lock.lock();
            self.wait_on_inode(&mut table, idx);
        }

        loop {
            if table.slots[idx].count > 1 {
                table.slots[idx].count -= 1;
                return mem::forget(inode);
            }
            if table.slots[idx].nlinks == 0 {
                drop(table);
                self.truncate_slot(idx as u16);
                self.free_inode_slot(idx as u16);
                return mem::forget(inode);
            }
            if table.slots[idx].dirty {
                drop(table);
                self.write_inode(idx as u16);
                table = self.itable().lock.lock();
                // The write slept; take it from the top.
                self.wait_on_inode(&mut table, idx);
                continue;
            }
            table.slots[idx].count -= 1;
            return mem::forget(inode);
        }
    }

    /// Claims an unreferenced table slot, flushing it first if dirty.
    /// Panics when every slot is referenced.
    pub fn get_empty_inode(&self) -> Inode {
        'outer: loop {
            let mut table = self.itable().lock.lock();
            let mut found = None;
            for _ in 0..NR_INODE {
                table.cursor = (table.cursor + 1) % NR_INODE;
                let c = table.cursor;
                if table.slots[c].count == 0 {
                    found = Some(c);
                    if !table.slots[c].dirty && !table.slots[c].locked {
                        break;
                    }
                }
            }
            let Some(idx) = found else {
                for (i, slot) in table.slots.iter().enumerate() {
                    tracing::error!(i, dev = ?slot.dev, num = slot.num, "inode slot busy");
                }
                panic!("no free inodes in mem");
            };
            loop {
                self.wait_on_inode(&mut table, idx);
                if !table.slots[idx].dirty {
                    break;
                }
                drop(table);
                self.write_inode(idx as u16);
                table = self.itable().lock.lock();
                if table.slots[idx].count != 0 {
                    continue 'outer;
                }
            }
            if table.slots[idx].count != 0 {
                // Claimed by someone during the write-back.
                continue 'outer;
            }
            table.slots[idx].clear();
            table.slots[idx].count = 1;
            return Inode::new(idx as u16, DevId::NONE, 0);
        }
    }

    /// Creates an unnamed pipe inode. Both returned handles share the slot,
    /// one for the reading end and one for the writing end.
    pub fn get_pipe_inode(&self) -> (Inode, Inode) {
        let reader = self.get_empty_inode();
        let idx = reader.index() as usize;
        let mut table = self.itable().lock.lock();
        table.slots[idx].pipe = Some(Box::new(PipeRing::new()));
        table.slots[idx].count = 2; /* sum of readers/writers */
        drop(table);
        let writer = Inode::new(reader.index(), reader.dev(), reader.num());
        (reader, writer)
    }

    /// Reads the on-disk inode into its table slot. The caller (`iget`) has
    /// already locked the inode.
    pub(crate) fn read_inode(&self, idx: u16) {
        let (dev, num) = {
            let table = self.itable().lock.lock();
            (table.slots[idx as usize].dev, table.slots[idx as usize].num)
        };
        let (imap_blocks, zmap_blocks, _) = self
            .super_layout(dev)
            .unwrap_or_else(|| panic!("trying to read inode without dev"));
        let block = inode_block(imap_blocks, zmap_blocks, num);
        let buf = self
            .bread(dev, block)
            .unwrap_or_else(|_| panic!("unable to read i-node block"));
        let off = ((num as usize - 1) % INODES_PER_BLOCK) * mem::size_of::<DInode>();
        let dinode = DInode::read_from_prefix(&buf.data()[off..]).unwrap();
        self.brelse(buf);

        let blkdev_size = {
            let mode = Mode::from_bits_retain(dinode.mode.get());
            mode.is_block_dev().then(|| {
                let bdev = DevId(dinode.zone[0].get());
                match self.device_blocks(bdev) {
                    Some(blocks) => 1024 * blocks,
                    None => 0x7fff_ffff,
                }
            })
        };

        let mut table = self.itable().lock.lock();
        let slot = &mut table.slots[idx as usize];
        slot.mode = Mode::from_bits_retain(dinode.mode.get());
        slot.uid = dinode.uid.get();
        slot.size = dinode.size.get();
        slot.mtime = dinode.time.get();
        slot.gid = dinode.gid;
        slot.nlinks = dinode.nlinks;
        for (z, d) in slot.zone.iter_mut().zip(dinode.zone.iter()) {
            *z = d.get();
        }
        if let Some(size) = blkdev_size {
            slot.size = size;
        }
        drop(table);
        self.unlock_inode(idx as usize);
    }

    /// Writes a dirty inode back into its metadata block.
    pub(crate) fn write_inode(&self, idx: u16) {
        self.lock_inode(idx as usize);
        let (dev, num, dinode) = {
            let table = self.itable().lock.lock();
            let slot = &table.slots[idx as usize];
            if !slot.dirty || slot.dev.is_none() {
                drop(table);
                self.unlock_inode(idx as usize);
                return;
            }
            let mut dinode = DInode::new_zeroed();
            dinode.mode.set(slot.mode.bits());
            dinode.uid.set(slot.uid);
            dinode.size.set(slot.size);
            dinode.time.set(slot.mtime);
            dinode.gid = slot.gid;
            dinode.nlinks = slot.nlinks;
            for (d, z) in dinode.zone.iter_mut().zip(slot.zone.iter()) {
                d.set(*z);
            }
            (slot.dev, slot.num, dinode)
        };
        let (imap_blocks, zmap_blocks, _) = self
            .super_layout(dev)
            .unwrap_or_else(|| panic!("trying to write inode without device"));
        let block = inode_block(imap_blocks, zmap_blocks, num);
        let mut buf = self
            .bread(dev, block)
            .unwrap_or_else(|_| panic!("unable to read i-node block"));
        let off = ((num as usize - 1) % INODES_PER_BLOCK) * mem::size_of::<DInode>();
        buf.data_mut()[off..off + mem::size_of::<DInode>()].copy_from_slice(dinode.as_bytes());
        buf.mark_dirty();
        self.brelse(buf);
        self.itable().lock.lock().slots[idx as usize].dirty = false;
        self.unlock_inode(idx as usize);
    }

    /// Writes every dirty non-pipe inode into the buffer cache.
    pub fn sync_inodes(&self) {
        for idx in 0..NR_INODE {
            let flush = {
                let mut table = self.itable().lock.lock();
                self.wait_on_inode(&mut table, idx);
                table.slots[idx].dirty && table.slots[idx].pipe.is_none()
            };
            if flush {
                self.write_inode(idx as u16);
            }
        }
    }

    /// Forgets in-memory inodes of a removed device.
    pub fn invalidate_inodes(&self, dev: DevId) {
        for idx in 0..NR_INODE {
            let mut table = self.itable().lock.lock();
            self.wait_on_inode(&mut table, idx);
            let slot = &mut table.slots[idx];
            if slot.dev == dev {
                if slot.count != 0 {
                    tracing::warn!(?dev, num = slot.num, "inode in use on removed disk");
                }
                slot.dev = DevId::NONE;
                slot.dirty = false;
            }
        }
    }

    /// True when any inode of `dev` is referenced, excepting the pinned
    /// root holding its single mount reference.
    pub(crate) fn device_inodes_busy(&self, dev: DevId, isup_idx: Option<u16>) -> bool {
        let table = self.itable().lock.lock();
        table.slots.iter().enumerate().any(|(i, slot)| {
            slot.dev == dev
                && slot.count != 0
                && !(Some(i as u16) == isup_idx && slot.count == 1)
        })
    }

    fn zone_slot(&self, idx: u16, slot: usize) -> u16 {
        self.itable().lock.lock().slots[idx as usize].zone[slot]
    }

    /// Fills `zone[slot]` if empty and `create` asks for it, re-validating
    /// after the allocation sleep. Returns the (possibly new) zone, 0 if
    /// absent and not created.
    fn ensure_zone_slot(&self, idx: u16, dev: DevId, slot: usize, create: bool) -> u16 {
        let cur = self.zone_slot(idx, slot);
        if cur != 0 || !create {
            return cur;
        }
        let Some(fresh) = self.new_block(dev) else {
            return 0;
        };
        let winner = {
            let mut table = self.itable().lock.lock();
            let s = &mut table.slots[idx as usize];
            if s.zone[slot] == 0 {
                s.zone[slot] = fresh as u16;
                s.ctime = now();
                s.dirty = true;
                None
            } else {
                Some(s.zone[slot])
            }
        };
        match winner {
            None => fresh as u16,
            Some(theirs) => {
                // Lost the race while allocating; give the zone back.
                self.free_block(dev, fresh);
                theirs
            }
        }
    }

    /// Looks up the entry `index` of the indirect block `ind`, allocating
    /// into a zero entry when `create` asks for it.
    fn indirect_entry(&self, dev: DevId, ind: u16, index: usize, create: bool) -> u16 {
        let Ok(mut buf) = self.bread(dev, ind as u32) else {
            return 0;
        };
        let mut entry = buf.data().zone_at(index);
        if create && entry == 0 {
            if let Some(fresh) = self.new_block(dev) {
                let cur = buf.data().zone_at(index);
                if cur == 0 {
                    buf.data_mut().set_zone_at(index, fresh as u16);
                    buf.mark_dirty();
                    entry = fresh as u16;
                } else {
                    self.free_block(dev, fresh);
                    entry = cur;
                }
            }
        }
        self.brelse(buf);
        entry
    }

    fn _bmap(&self, inode: &Inode, block: usize, create: bool) -> u32 {
        assert!(block < MAX_FILE_BLOCKS, "_bmap: block>big");
        let idx = inode.index();
        let dev = inode.dev();

        if block < NR_DIRECT {
            let cur = self.zone_slot(idx, block);
            if cur != 0 || !create {
                return cur as u32;
            }
            return self.ensure_zone_slot(idx, dev, block, true) as u32;
        }

        let block = block - NR_DIRECT;
        if block < ZONES_PER_BLOCK {
            let ind = self.ensure_zone_slot(idx, dev, 7, create);
            if ind == 0 {
                return 0;
            }
            return self.indirect_entry(dev, ind, block, create) as u32;
        }

        let block = block - ZONES_PER_BLOCK;
        let dind = self.ensure_zone_slot(idx, dev, 8, create);
        if dind == 0 {
            return 0;
        }
        let ind = self.indirect_entry(dev, dind, block >> 9, create);
        if ind == 0 {
            return 0;
        }
        self.indirect_entry(dev, ind, block & 511, create) as u32
    }

    /// Device zone holding the file-relative `block`, or 0 if unmapped.
    pub fn bmap(&self, inode: &Inode, block: usize) -> u32 {
        self._bmap(inode, block, false)
    }

    /// Like `bmap`, allocating the block (and any intermediate indirect
    /// blocks) on demand. 0 means the device is full.
    pub fn create_block(&self, inode: &Inode, block: usize) -> u32 {
        self._bmap(inode, block, true)
    }

    fn free_indirect(&self, dev: DevId, block: u16) {
        if block == 0 {
            return;
        }
        if let Ok(buf) = self.bread(dev, block as u32) {
            for i in 0..ZONES_PER_BLOCK {
                let zone = buf.data().zone_at(i);
                if zone != 0 {
                    self.free_block(dev, zone as u32);
                }
            }
            self.brelse(buf);
        }
        self.free_block(dev, block as u32);
    }

    fn free_double_indirect(&self, dev: DevId, block: u16) {
        if block == 0 {
            return;
        }
        if let Ok(buf) = self.bread(dev, block as u32) {
            for i in 0..ZONES_PER_BLOCK {
                let ind = buf.data().zone_at(i);
                self.free_indirect(dev, ind);
            }
            self.brelse(buf);
        }
        self.free_block(dev, block as u32);
    }

    pub(crate) fn truncate_slot(&self, idx: u16) {
        let (dev, zones) = {
            let mut table = self.itable().lock.lock();
            let slot = &mut table.slots[idx as usize];
            if !slot.mode.is_regular() && !slot.mode.is_dir() {
                return;
            }
            let zones = slot.zone;
            slot.zone = [0; 9];
            slot.size = 0;
            slot.dirty = true;
            let t = now();
            slot.mtime = t;
            slot.ctime = t;
            (slot.dev, zones)
        };
        for &zone in &zones[..NR_DIRECT] {
            if zone != 0 {
                self.free_block(dev, zone as u32);
            }
        }
        self.free_indirect(dev, zones[7]);
        self.free_double_indirect(dev, zones[8]);
    }

    /// Frees all data zones of the file, leaving an empty inode.
    pub fn truncate(&self, inode: &Inode) {
        self.truncate_slot(inode.index());
    }

    /// Copies the inode's metadata out.
    pub fn stat(&self, inode: &Inode) -> Stat {
        self.with_inode(inode, |slot| Stat {
            dev: slot.dev,
            num: slot.num,
            mode: slot.mode,
            uid: slot.uid,
            gid: slot.gid,
            size: slot.size,
            nlinks: slot.nlinks,
            mtime: slot.mtime,
            atime: slot.atime,
            ctime: slot.ctime,
            zone: slot.zone,
        })
    }

    pub fn set_mode(&self, inode: &Inode, mode: Mode) {
        self.with_inode(inode, |slot| {
            slot.mode = mode;
            slot.dirty = true;
        });
    }

    pub fn set_size(&self, inode: &Inode, size: u32) {
        self.with_inode(inode, |slot| {
            slot.size = size;
            slot.dirty = true;
        });
    }

    pub fn set_nlinks(&self, inode: &Inode, nlinks: u8) {
        self.with_inode(inode, |slot| {
            slot.nlinks = nlinks;
            slot.dirty = true;
        });
    }
}

/// Inode metadata as [`Kernel::stat`] copies it out.
#[derive(Clone, Copy, Debug)]
pub struct Stat {
    pub dev: DevId,
    pub num: u16,
    pub mode: Mode,
    pub uid: u16,
    pub gid: u8,
    pub size: u32,
    pub nlinks: u8,
    pub mtime: u32,
    pub atime: u32,
    pub ctime: u32,
    pub zone: [u16; 9],
}
