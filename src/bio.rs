//! Buffer cache.
//!
//! A fixed pool of buffer headers, each owning one block-sized data page for
//! its whole life. Headers are indexed by a chained hash on `(dev, block)`
//! and threaded through a circular free list ordered roughly by reuse age.
//!
//! Interface:
//! * `getblk` finds or claims a header for `(dev, block)` and takes a
//!   reference on it; `bread` additionally fills it from the device.
//! * `brelse` drops the reference. Handles must be released explicitly.
//! * `sync_dev` / `sys_sync` push dirty blocks back; `invalidate_buffers`
//!   drops cached state for a device.
//!
//! Identity, reference counts, and the hash/free links are guarded by the
//! cache lock. The `uptodate`/`dirty`/`locked` flag bits are atomics beside
//! it: the request layer flips them at completion time while holding the
//! queue lock, never the cache lock. Every path that sleeps re-validates
//! what it checked before sleeping.

use core::cell::UnsafeCell;
use core::mem;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::blk::Rw;
use crate::dev::DevId;
use crate::error::Error;
use crate::kernel::Kernel;
use crate::param::{BLOCK_SIZE, NR_HASH, PAGE_SIZE};
use crate::sync::{SleepableLock, WaitChannel};

/// One cached block's data page.
#[repr(align(8))]
pub struct BufData([u8; BLOCK_SIZE]);

impl BufData {
    const fn zeroed() -> Self {
        Self([0; BLOCK_SIZE])
    }

    /// The page as little-endian u16 zone numbers (indirect blocks).
    pub fn as_zones(&self) -> [u16; BLOCK_SIZE / 2] {
        let mut zones = [0u16; BLOCK_SIZE / 2];
        for (i, z) in zones.iter_mut().enumerate() {
            *z = u16::from_le_bytes([self.0[2 * i], self.0[2 * i + 1]]);
        }
        zones
    }

    pub fn zone_at(&self, i: usize) -> u16 {
        u16::from_le_bytes([self.0[2 * i], self.0[2 * i + 1]])
    }

    pub fn set_zone_at(&mut self, i: usize, zone: u16) {
        self.0[2 * i..2 * i + 2].copy_from_slice(&zone.to_le_bytes());
    }
}

impl Deref for BufData {
    type Target = [u8; BLOCK_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Per-buffer state reachable without the cache lock: the I/O lock bit, the
/// content flags, the waiters' channel, and the data page itself.
pub(crate) struct BufShared {
    pub(crate) wait: WaitChannel,
    locked: AtomicBool,
    uptodate: AtomicBool,
    dirty: AtomicBool,
    data: UnsafeCell<BufData>,
}

// SAFETY: `data` is written only by the task holding the buffer locked (the
// driver, during I/O) or by a reference holder following the cache protocol;
// all flag fields are atomic.
unsafe impl Sync for BufShared {}

impl BufShared {
    fn new() -> Self {
        Self {
            wait: WaitChannel::new(),
            locked: AtomicBool::new(false),
            uptodate: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            data: UnsafeCell::new(BufData::zeroed()),
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub(crate) fn is_uptodate(&self) -> bool {
        self.uptodate.load(Ordering::Acquire)
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn set_uptodate(&self, v: bool) {
        self.uptodate.store(v, Ordering::Release);
    }

    pub(crate) fn set_dirty(&self, v: bool) {
        self.dirty.store(v, Ordering::Release);
    }

    pub(crate) fn data_ptr(&self) -> *mut u8 {
        self.data.get() as *mut u8
    }
}

/// Header fields guarded by the cache lock.
struct BufHead {
    dev: DevId,
    blocknr: u32,
    count: u32,
    hash_next: Option<u32>,
    hash_prev: Option<u32>,
    free_next: u32,
    free_prev: u32,
}

struct BufPool {
    heads: Vec<BufHead>,
    hash: [Option<u32>; NR_HASH],
    /// Preferred-reuse end of the circular free list.
    free_list: u32,
}

fn hashfn(dev: DevId, block: u32) -> usize {
    (dev.0 as u32 ^ block) as usize % NR_HASH
}

impl BufPool {
    fn find(&self, dev: DevId, block: u32) -> Option<u32> {
        let mut cur = self.hash[hashfn(dev, block)];
        while let Some(i) = cur {
            let h = &self.heads[i as usize];
            if h.dev == dev && h.blocknr == block {
                return Some(i);
            }
            cur = h.hash_next;
        }
        None
    }

    fn remove_from_queues(&mut self, idx: u32) {
        // Hash chain.
        let (dev, blocknr, next, prev) = {
            let h = &self.heads[idx as usize];
            (h.dev, h.blocknr, h.hash_next, h.hash_prev)
        };
        if let Some(n) = next {
            self.heads[n as usize].hash_prev = prev;
        }
        if let Some(p) = prev {
            self.heads[p as usize].hash_next = next;
        } else if self.hash[hashfn(dev, blocknr)] == Some(idx) {
            self.hash[hashfn(dev, blocknr)] = next;
        }
        self.heads[idx as usize].hash_next = None;
        self.heads[idx as usize].hash_prev = None;

        // Free list.
        let (fnext, fprev) = {
            let h = &self.heads[idx as usize];
            (h.free_next, h.free_prev)
        };
        self.heads[fprev as usize].free_next = fnext;
        self.heads[fnext as usize].free_prev = fprev;
        if self.free_list == idx {
            self.free_list = fnext;
        }
    }

    /// Re-links `idx` at the tail of the free list and, if it has a device,
    /// at the head of its hash chain.
    fn insert_into_queues(&mut self, idx: u32) {
        let tail = self.heads[self.free_list as usize].free_prev;
        self.heads[idx as usize].free_next = self.free_list;
        self.heads[idx as usize].free_prev = tail;
        self.heads[tail as usize].free_next = idx;
        self.heads[self.free_list as usize].free_prev = idx;

        let (dev, blocknr) = {
            let h = &self.heads[idx as usize];
            (h.dev, h.blocknr)
        };
        self.heads[idx as usize].hash_prev = None;
        self.heads[idx as usize].hash_next = None;
        if dev.is_none() {
            return;
        }
        let slot = hashfn(dev, blocknr);
        let old = self.hash[slot];
        self.heads[idx as usize].hash_next = old;
        if let Some(o) = old {
            self.heads[o as usize].hash_prev = Some(idx);
        }
        self.hash[slot] = Some(idx);
    }
}

pub(crate) struct Bcache {
    /// The cache lock; its own channel is `buffer_wait`, woken by `brelse`.
    pool: SleepableLock<BufPool>,
    shared: Box<[BufShared]>,
}

/// A counted reference to a cached block. Must be released with
/// [`Kernel::brelse`]; dropping a live handle is a leak and panics.
#[must_use]
#[derive(Debug)]
pub struct Buf {
    idx: u32,
    dev: DevId,
    blocknr: u32,
    shared: NonNull<BufShared>,
}

// SAFETY: the pointee lives in the kernel's buffer pool, which outlives
// every handle honoring the release discipline.
unsafe impl Send for Buf {}

impl Buf {
    pub fn dev(&self) -> DevId {
        self.dev
    }

    pub fn blocknr(&self) -> u32 {
        self.blocknr
    }

    pub(crate) fn index(&self) -> u32 {
        self.idx
    }

    fn shared(&self) -> &BufShared {
        // SAFETY: see `unsafe impl Send`.
        unsafe { self.shared.as_ref() }
    }

    pub fn uptodate(&self) -> bool {
        self.shared().is_uptodate()
    }

    pub fn dirty(&self) -> bool {
        self.shared().is_dirty()
    }

    /// Marks the in-memory copy as superseding the device. The data must be
    /// valid first.
    pub fn mark_dirty(&mut self) {
        assert!(self.uptodate(), "dirtying a buffer that is not uptodate");
        self.shared().set_dirty(true);
    }

    /// Marks the data page as valid without a device read (freshly
    /// initialized blocks).
    pub fn mark_uptodate(&mut self) {
        self.shared().set_uptodate(true);
    }

    /// The cached block contents.
    pub fn data(&self) -> &BufData {
        // SAFETY: the page is owned by this header; writers hold either the
        // buffer lock (no concurrent holder-side access by protocol) or a
        // unique handle reference.
        unsafe { &*self.shared().data.get() }
    }

    /// Mutable access to the block contents. The caller owns the cached
    /// copy by the reference-holder protocol; mark the buffer dirty after
    /// changing it.
    pub fn data_mut(&mut self) -> &mut BufData {
        // SAFETY: as in `data`, with this handle as the writer.
        unsafe { &mut *self.shared().data.get() }
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            panic!(
                "buffer ({:?}:{}) dropped without brelse",
                self.dev, self.blocknr
            );
        }
    }
}

impl Bcache {
    pub(crate) fn new(nr_buffers: usize) -> Self {
        assert!(nr_buffers >= 4, "buffer pool too small");
        let n = nr_buffers as u32;
        let heads = (0..n)
            .map(|i| BufHead {
                dev: DevId::NONE,
                blocknr: 0,
                count: 0,
                hash_next: None,
                hash_prev: None,
                free_next: (i + 1) % n,
                free_prev: (i + n - 1) % n,
            })
            .collect();
        let shared = (0..n).map(|_| BufShared::new()).collect();
        Self {
            pool: SleepableLock::new(BufPool {
                heads,
                hash: [None; NR_HASH],
                free_list: 0,
            }),
            shared,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.shared.len()
    }

    pub(crate) fn shared(&self, idx: u32) -> &BufShared {
        &self.shared[idx as usize]
    }

    fn handle(&self, idx: u32, dev: DevId, blocknr: u32) -> Buf {
        Buf {
            idx,
            dev,
            blocknr,
            shared: NonNull::from(&self.shared[idx as usize]),
        }
    }

    fn badness(&self, idx: u32) -> u32 {
        let sh = self.shared(idx);
        2 * sh.is_dirty() as u32 + sh.is_locked() as u32
    }

    /// Blocks until no I/O is in flight on the buffer.
    pub(crate) fn wait_unlocked(&self, idx: u32) {
        let sh = self.shared(idx);
        sh.wait.sleep_until(|| !sh.is_locked());
    }

    /// Takes the buffer's I/O lock, sleeping while it is held elsewhere.
    pub(crate) fn lock_buffer(&self, idx: u32) {
        let sh = self.shared(idx);
        loop {
            let epoch = sh.wait.epoch();
            if sh
                .locked
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            sh.wait.wait_from(epoch);
        }
    }

    /// Releases the I/O lock and wakes the buffer's waiters.
    pub(crate) fn unlock_buffer(&self, idx: u32) {
        let sh = self.shared(idx);
        if !sh.locked.swap(false, Ordering::AcqRel) {
            tracing::warn!(idx, "unlocking a buffer that is not locked");
        }
        sh.wait.wakeup();
    }

    /// Hash lookup taking a reference. The count is bumped before waiting
    /// out any I/O, and the identity re-verified afterwards: the world can
    /// change during a sleep.
    pub(crate) fn get_hash_table(&self, dev: DevId, block: u32) -> Option<Buf> {
        let mut pool = self.pool.lock();
        loop {
            let idx = pool.find(dev, block)?;
            pool.heads[idx as usize].count += 1;
            loop {
                let sh = self.shared(idx);
                let epoch = sh.wait.epoch();
                if !sh.is_locked() {
                    break;
                }
                pool.sleep_from(&sh.wait, epoch);
            }
            let h = &pool.heads[idx as usize];
            if h.dev == dev && h.blocknr == block {
                return Some(self.handle(idx, dev, block));
            }
            pool.heads[idx as usize].count -= 1;
        }
    }

    /// Finds or claims a header for `(dev, block)`. Never fails; may block
    /// arbitrarily long for a free header or for write-back.
    pub(crate) fn getblk(&self, kernel: &Kernel, dev: DevId, block: u32) -> Buf {
        assert!(!dev.is_none(), "getblk with dev==0");
        'repeat: loop {
            if let Some(buf) = self.get_hash_table(dev, block) {
                return buf;
            }
            let mut pool = self.pool.lock();
            // The lookup above released the lock; re-check before scanning.
            if pool.find(dev, block).is_some() {
                continue 'repeat;
            }

            // Pick the least-bad unreferenced header, preferring clean and
            // unlocked ones outright.
            let mut best: Option<u32> = None;
            let mut tmp = pool.free_list;
            loop {
                if pool.heads[tmp as usize].count == 0 {
                    let bad = self.badness(tmp);
                    if best.map_or(true, |b| bad < self.badness(b)) {
                        best = Some(tmp);
                        if bad == 0 {
                            break;
                        }
                    }
                }
                tmp = pool.heads[tmp as usize].free_next;
                if tmp == pool.free_list {
                    break;
                }
            }
            let Some(idx) = best else {
                pool.sleep();
                continue 'repeat;
            };

            loop {
                let sh = self.shared(idx);
                let epoch = sh.wait.epoch();
                if !sh.is_locked() {
                    break;
                }
                pool.sleep_from(&sh.wait, epoch);
            }
            if pool.heads[idx as usize].count != 0 {
                continue 'repeat;
            }
            while self.shared(idx).is_dirty() {
                let ddev = pool.heads[idx as usize].dev;
                drop(pool);
                kernel.sync_dev(ddev);
                self.wait_unlocked(idx);
                pool = self.pool.lock();
                if pool.heads[idx as usize].count != 0 {
                    continue 'repeat;
                }
                loop {
                    let sh = self.shared(idx);
                    let epoch = sh.wait.epoch();
                    if !sh.is_locked() {
                        break;
                    }
                    pool.sleep_from(&sh.wait, epoch);
                }
                if pool.heads[idx as usize].count != 0 {
                    continue 'repeat;
                }
            }
            // While we slept, somebody else might have added "this" block
            // to the cache.
            if pool.find(dev, block).is_some() {
                continue 'repeat;
            }

            let sh = self.shared(idx);
            debug_assert!(!sh.is_locked());
            pool.heads[idx as usize].count = 1;
            sh.set_dirty(false);
            sh.set_uptodate(false);
            pool.remove_from_queues(idx);
            {
                let h = &mut pool.heads[idx as usize];
                h.dev = dev;
                h.blocknr = block;
            }
            pool.insert_into_queues(idx);
            return self.handle(idx, dev, block);
        }
    }

    pub(crate) fn brelse(&self, buf: Buf) {
        self.wait_unlocked(buf.idx);
        let mut pool = self.pool.lock();
        let h = &mut pool.heads[buf.idx as usize];
        if h.count == 0 {
            panic!("trying to free free buffer");
        }
        h.count -= 1;
        drop(pool);
        self.pool.wakeup();
        mem::forget(buf);
    }

    /// Reference count of the slot behind a handle.
    pub(crate) fn ref_count(&self, idx: u32) -> u32 {
        self.pool.lock().heads[idx as usize].count
    }

    /// Identity of a slot as the cache lock sees it.
    pub(crate) fn identity(&self, idx: u32) -> (DevId, u32) {
        let pool = self.pool.lock();
        let h = &pool.heads[idx as usize];
        (h.dev, h.blocknr)
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        let pool = self.pool.lock();
        let n = pool.heads.len();
        // Every header is hashed under its identity iff it has a device,
        // with at most one live header per (dev, block).
        let mut seen = std::collections::HashSet::new();
        for (i, h) in pool.heads.iter().enumerate() {
            if h.dev.is_none() {
                continue;
            }
            assert_eq!(pool.find(h.dev, h.blocknr), Some(i as u32));
            assert!(seen.insert((h.dev, h.blocknr)));
        }
        for sh in self.shared.iter() {
            if sh.is_dirty() {
                assert!(sh.is_uptodate());
            }
        }
        // The free list is one complete circle.
        let mut cur = pool.free_list;
        for _ in 0..n {
            cur = pool.heads[cur as usize].free_next;
        }
        assert_eq!(cur, pool.free_list);
        let mut visited = 0;
        let mut cur = pool.free_list;
        loop {
            visited += 1;
            cur = pool.heads[cur as usize].free_next;
            if cur == pool.free_list {
                break;
            }
        }
        assert_eq!(visited, n);
    }
}

impl Kernel {
    /// Takes a reference to the cached block, claiming a header if needed.
    pub fn getblk(&self, dev: DevId, block: u32) -> Buf {
        self.bcache().getblk(self, dev, block)
    }

    /// Hash-only lookup; takes a reference when the block is cached.
    pub fn get_hash_table(&self, dev: DevId, block: u32) -> Option<Buf> {
        self.bcache().get_hash_table(dev, block)
    }

    /// Releases a buffer reference and wakes tasks waiting for a free
    /// header.
    pub fn brelse(&self, buf: Buf) {
        self.bcache().brelse(buf);
    }

    /// Reads the block through the cache. `Err` means the device reported
    /// failure; the buffer has been released.
    pub fn bread(&self, dev: DevId, block: u32) -> Result<Buf, Error> {
        let buf = self.getblk(dev, block);
        if buf.uptodate() {
            return Ok(buf);
        }
        self.ll_rw_block(Rw::Read, &buf);
        self.bcache().wait_unlocked(buf.index());
        if buf.uptodate() {
            return Ok(buf);
        }
        self.brelse(buf);
        Err(Error::Io { dev, block })
    }

    /// `bread` for `first`, plus speculative read-ahead of `rest`.
    pub fn breada(&self, dev: DevId, first: u32, rest: &[u32]) -> Result<Buf, Error> {
        let buf = self.getblk(dev, first);
        if !buf.uptodate() {
            self.ll_rw_block(Rw::Read, &buf);
        }
        for &block in rest {
            let tmp = self.getblk(dev, block);
            if !tmp.uptodate() {
                self.ll_rw_block(Rw::ReadAhead, &tmp);
            }
            self.brelse(tmp);
        }
        self.bcache().wait_unlocked(buf.index());
        if buf.uptodate() {
            return Ok(buf);
        }
        self.brelse(buf);
        Err(Error::Io { dev, block: first })
    }

    /// Reads up to four blocks concurrently into a page, skipping zero
    /// slots. Blocks that fail to read leave their quarter untouched.
    pub fn bread_page(&self, page: &mut [u8; PAGE_SIZE], dev: DevId, blocks: [u32; 4]) {
        let mut bufs: [Option<Buf>; 4] = [None, None, None, None];
        for (slot, &block) in bufs.iter_mut().zip(blocks.iter()) {
            if block != 0 {
                let buf = self.getblk(dev, block);
                if !buf.uptodate() {
                    self.ll_rw_block(Rw::Read, &buf);
                }
                *slot = Some(buf);
            }
        }
        for (i, slot) in bufs.iter_mut().enumerate() {
            if let Some(buf) = slot.take() {
                self.bcache().wait_unlocked(buf.index());
                if buf.uptodate() {
                    page[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE].copy_from_slice(&buf.data()[..]);
                }
                self.brelse(buf);
            }
        }
    }

    /// Writes every dirty buffer (of `dev`, or of all devices) back through
    /// the request layer.
    fn write_back_buffers(&self, dev: Option<DevId>) {
        for idx in 0..self.bcache().len() as u32 {
            let (d, _) = self.bcache().identity(idx);
            if d.is_none() || dev.is_some_and(|want| d != want) {
                continue;
            }
            self.bcache().wait_unlocked(idx);
            let (d, _) = self.bcache().identity(idx);
            if d.is_none() || dev.is_some_and(|want| d != want) {
                continue;
            }
            if self.bcache().shared(idx).is_dirty() {
                self.submit_buffer(Rw::Write, idx);
            }
        }
    }

    /// Writes all dirty inodes into buffers, then all dirty buffers to
    /// their devices.
    pub fn sys_sync(&self) {
        self.sync_inodes();
        self.write_back_buffers(None);
    }

    /// Synchronizes one device. Two passes around the inode flush: writing
    /// inodes back dirties metadata buffers, which the second pass catches.
    pub fn sync_dev(&self, dev: DevId) {
        self.write_back_buffers(Some(dev));
        self.sync_inodes();
        self.write_back_buffers(Some(dev));
    }

    /// Forgets cached contents for `dev`. Used after media change.
    pub fn invalidate_buffers(&self, dev: DevId) {
        for idx in 0..self.bcache().len() as u32 {
            let (d, _) = self.bcache().identity(idx);
            if d != dev {
                continue;
            }
            self.bcache().wait_unlocked(idx);
            let (d, _) = self.bcache().identity(idx);
            if d == dev {
                let sh = self.bcache().shared(idx);
                sh.set_dirty(false);
                sh.set_uptodate(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::major;
    use crate::kernel::KernelBuilder;
    use crate::tdisk::TestDisk;
    use std::sync::Arc;

    fn kernel() -> (Arc<Kernel>, Arc<TestDisk>) {
        let disk = Arc::new(TestDisk::filled(1, 256, 0xab));
        let kernel = KernelBuilder::new()
            .nr_buffers(8)
            .driver(major::MEM, disk.clone())
            .build();
        (Arc::new(kernel), disk)
    }

    #[test]
    fn getblk_twice_shares_a_header() {
        let (kernel, _) = kernel();
        let dev = DevId::new(major::MEM, 0);
        let a = kernel.getblk(dev, 42);
        let b = kernel.getblk(dev, 42);
        assert_eq!(a.index(), b.index());
        assert_eq!(kernel.bcache().ref_count(a.index()), 2);
        kernel.bcache().assert_invariants();
        kernel.brelse(a);
        kernel.brelse(b);
    }

    #[test]
    fn released_headers_are_rekeyed_in_lru_order() {
        let (kernel, _) = kernel();
        let dev = DevId::new(major::MEM, 0);
        // Touch more blocks than the pool holds; all are clean, so each
        // claim evicts the least recently reused header.
        for block in 0..32 {
            let buf = kernel.getblk(dev, block);
            kernel.brelse(buf);
        }
        kernel.bcache().assert_invariants();
        // The pool holds 8 headers; the last 8 touched blocks are cached.
        for block in 24..32 {
            assert!(kernel.get_hash_table(dev, block).map(|b| kernel.brelse(b)).is_some());
        }
        assert!(kernel.get_hash_table(dev, 0).is_none());
    }

    #[test]
    fn bread_fills_from_device() {
        let (kernel, _) = kernel();
        let dev = DevId::new(major::MEM, 0);
        let buf = kernel.bread(dev, 3).unwrap();
        assert!(buf.uptodate());
        assert_eq!(buf.data()[0], 0xab);
        kernel.brelse(buf);
    }

    #[test]
    fn claiming_a_dirty_header_syncs_it_first() {
        let (kernel, disk) = kernel();
        let dev = DevId::new(major::MEM, 0);
        // Dirty the whole pool so the next claim has no clean candidate.
        for block in 0..8u32 {
            let mut buf = kernel.bread(dev, block).unwrap();
            buf.data_mut()[0] = 0x70 | block as u8;
            buf.mark_dirty();
            kernel.brelse(buf);
        }
        let buf = kernel.getblk(dev, 100);
        kernel.brelse(buf);
        for block in 0..8u64 {
            assert_eq!(
                disk.read_byte(0, block * BLOCK_SIZE as u64),
                0x70 | block as u8
            );
        }
        kernel.bcache().assert_invariants();
    }

    #[test]
    #[should_panic(expected = "dropped without brelse")]
    fn leaking_a_handle_panics() {
        let (kernel, _) = kernel();
        let dev = DevId::new(major::MEM, 0);
        let buf = kernel.getblk(dev, 1);
        drop(buf);
    }

    #[test]
    fn invalidate_discards_cached_data() {
        let (kernel, disk) = kernel();
        let dev = DevId::new(major::MEM, 0);
        let buf = kernel.bread(dev, 9).unwrap();
        kernel.brelse(buf);
        disk.fill(0, 0xcd);
        let stale = kernel.bread(dev, 9).unwrap();
        assert_eq!(stale.data()[0], 0xab);
        kernel.brelse(stale);
        kernel.invalidate_buffers(dev);
        let fresh = kernel.bread(dev, 9).unwrap();
        assert_eq!(fresh.data()[0], 0xcd);
        kernel.brelse(fresh);
    }
}
