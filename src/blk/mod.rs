//! Block request layer.
//!
//! A bounded pool of request descriptors feeds one FIFO-ish queue per major
//! device, ordered by the elevator rule: reads before writes, then by
//! `(dev, sector)`, with a single wrap-around tolerated per queue. Writes
//! may occupy only the low two thirds of the pool; the last third is kept
//! for reads.
//!
//! Drivers consume the queue through [`DiskDriver::request`], which runs
//! with the queue locked, and complete work with
//! [`RequestQueue::end_request`]. A completion unlocks the backing buffer,
//! wakes any task waiting on the request, frees the slot, and advances the
//! queue head.

pub mod partition;

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use array_macro::array;

use crate::dev::DevId;
use crate::error::Error;
use crate::kernel::Kernel;
use crate::param::{NR_BLK_DEV, NR_REQUEST, PAGE_SIZE, SECTORS_PER_BLOCK, SECTOR_SIZE};
use crate::sync::{SleepableLock, SleepableLockGuard, WaitChannel};
use crate::Buf;

/// Commands as drivers see them. Reads order before writes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Cmd {
    Read = 0,
    Write = 1,
}

/// Commands as submitters issue them. The ahead variants are speculative:
/// they are demoted to `Read`/`Write`, dropped silently when the buffer is
/// busy, and dropped again sooner than sleeping for a request slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Rw {
    Read,
    Write,
    ReadAhead,
    WriteAhead,
}

impl Rw {
    fn demote(self) -> (Cmd, bool) {
        match self {
            Rw::Read => (Cmd::Read, false),
            Rw::Write => (Cmd::Write, false),
            Rw::ReadAhead => (Cmd::Read, true),
            Rw::WriteAhead => (Cmd::Write, true),
        }
    }
}

/// Completion rendezvous for bufferless (page) requests.
struct IoWait {
    chan: WaitChannel,
    done: AtomicBool,
    ok: AtomicBool,
}

impl IoWait {
    fn new() -> Self {
        Self {
            chan: WaitChannel::new(),
            done: AtomicBool::new(false),
            ok: AtomicBool::new(false),
        }
    }

    fn finish(&self, ok: bool) {
        self.ok.store(ok, Ordering::Release);
        self.done.store(true, Ordering::Release);
        self.chan.wakeup();
    }
}

struct DataPtr(*mut u8);

// SAFETY: the pointer targets either a cache page (kept alive and locked by
// the request) or a page whose owner blocks until the request completes.
unsafe impl Send for DataPtr {}

struct Request {
    /// `None` marks a free slot.
    dev: Option<DevId>,
    cmd: Cmd,
    errors: u32,
    sector: u64,
    nr_sectors: u32,
    buffer: DataPtr,
    /// Task blocked on this request (page I/O only).
    waiting: Option<Arc<IoWait>>,
    /// Backing buffer header (block I/O only).
    bh: Option<u32>,
    next: Option<usize>,
}

impl Request {
    fn free() -> Self {
        Self {
            dev: None,
            cmd: Cmd::Read,
            errors: 0,
            sector: 0,
            nr_sectors: 0,
            buffer: DataPtr(core::ptr::null_mut()),
            waiting: None,
            bh: None,
            next: None,
        }
    }
}

fn in_order(a: &Request, b: &Request) -> bool {
    let (ad, bd) = (a.dev.unwrap(), b.dev.unwrap());
    a.cmd < b.cmd || (a.cmd == b.cmd && (ad < bd || (ad == bd && a.sector < b.sector)))
}

struct DevQueue {
    current: Option<usize>,
    /// Watchdog ticks remaining; 0 means unarmed.
    timeout: u32,
}

pub(crate) struct BlkState {
    requests: [Request; NR_REQUEST],
    devs: [DevQueue; NR_BLK_DEV],
}

pub(crate) struct BlockIo {
    /// The queue lock; its own channel is `wait_for_request`.
    pub(crate) state: SleepableLock<BlkState>,
    pub(crate) drivers: [Option<Arc<dyn DiskDriver>>; NR_BLK_DEV],
}

impl BlockIo {
    pub(crate) fn new(drivers: [Option<Arc<dyn DiskDriver>>; NR_BLK_DEV]) -> Self {
        Self {
            state: SleepableLock::new(BlkState {
                requests: array![_ => Request::free(); NR_REQUEST],
                devs: array![_ => DevQueue { current: None, timeout: 0 }; NR_BLK_DEV],
            }),
            drivers,
        }
    }
}

/// A block device driver, attached to one major number.
pub trait DiskDriver: Send + Sync {
    /// Process the queue. Called with the queue locked whenever its head
    /// goes from empty to busy (and from [`Kernel::kick`]). A synchronous
    /// driver loops over [`RequestQueue::current_dev`] and completes each
    /// request in place; an interrupt-style driver starts the transfer and
    /// returns, completing later through [`Kernel::with_queue`].
    fn request(&self, queue: &mut RequestQueue<'_>);

    /// Whether removable media in `minor` was changed since the last check.
    fn media_changed(&self, _minor: u8) -> bool {
        false
    }

    /// Device capacity in 1 KiB blocks, if known.
    fn nr_blocks(&self, _minor: u8) -> Option<u32> {
        None
    }

    /// The watchdog armed via [`RequestQueue::set_timeout`] expired with a
    /// request still in service.
    fn timed_out(&self, _queue: &mut RequestQueue<'_>) {}
}

/// A queued request as reported by [`RequestQueue::queued`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueuedRequest {
    pub cmd: Cmd,
    pub dev: DevId,
    pub sector: u64,
    pub nr_sectors: u32,
}

/// Driver-side view of one major's queue. Exists only while the queue lock
/// is held.
pub struct RequestQueue<'a> {
    major: u8,
    state: &'a mut BlkState,
    kernel: &'a Kernel,
}

impl RequestQueue<'_> {
    pub fn major(&self) -> u8 {
        self.major
    }

    fn current_slot(&self) -> Option<usize> {
        self.state.devs[self.major as usize].current
    }

    fn current(&self) -> &Request {
        &self.state.requests[self.current_slot().expect("no current request")]
    }

    /// The device of the request in service, validating the queue the way
    /// drivers always have: a foreign major or an unlocked backing buffer
    /// means the list is corrupt.
    pub fn current_dev(&self) -> Option<DevId> {
        let slot = self.current_slot()?;
        let req = &self.state.requests[slot];
        let dev = req.dev.expect("free request at queue head");
        if dev.major() != self.major {
            panic!("request list destroyed");
        }
        if let Some(idx) = req.bh {
            if !self.kernel.bcache().shared(idx).is_locked() {
                panic!("block not locked");
            }
        }
        Some(dev)
    }

    pub fn current_cmd(&self) -> Cmd {
        self.current().cmd
    }

    pub fn current_sector(&self) -> u64 {
        self.current().sector
    }

    pub fn current_nr_sectors(&self) -> u32 {
        self.current().nr_sectors
    }

    /// The request's transfer area.
    pub fn current_data(&mut self) -> &mut [u8] {
        let req = self.current();
        let len = req.nr_sectors as usize * SECTOR_SIZE;
        let ptr = req.buffer.0;
        // SAFETY: the area belongs to the in-flight request; see `DataPtr`.
        unsafe { core::slice::from_raw_parts_mut(ptr, len) }
    }

    /// Counts one device error against the current request; returns the
    /// total so the driver can give up past its retry budget.
    pub fn record_error(&mut self) -> u32 {
        let slot = self.current_slot().expect("no current request");
        let req = &mut self.state.requests[slot];
        req.errors += 1;
        req.errors
    }

    /// Arms the per-major watchdog, counted down by [`Kernel::blk_tick`].
    pub fn set_timeout(&mut self, ticks: u32) {
        self.state.devs[self.major as usize].timeout = ticks;
    }

    /// Completes the request in service: publishes `uptodate` on the
    /// backing buffer and unlocks it, wakes the waiting task and the tasks
    /// out of request slots, frees the slot, and advances the head.
    pub fn end_request(&mut self, uptodate: bool) {
        let slot = self.current_slot().expect("end_request without a request");
        self.state.devs[self.major as usize].timeout = 0;
        let req = &mut self.state.requests[slot];
        if let Some(idx) = req.bh {
            let bcache = self.kernel.bcache();
            assert!(bcache.shared(idx).is_locked(), "block not locked");
            bcache.shared(idx).set_uptodate(uptodate);
            bcache.unlock_buffer(idx);
        }
        if !uptodate {
            tracing::warn!(dev = ?req.dev, sector = req.sector, "I/O error");
        }
        if let Some(wait) = req.waiting.take() {
            wait.finish(uptodate);
        }
        req.dev = None;
        let next = req.next.take();
        self.state.devs[self.major as usize].current = next;
        self.kernel.blk().state.wakeup();
    }

    /// Snapshot of this major's queue, head first.
    pub fn queued(&self) -> Vec<QueuedRequest> {
        let mut out = Vec::new();
        let mut cur = self.current_slot();
        while let Some(slot) = cur {
            let req = &self.state.requests[slot];
            out.push(QueuedRequest {
                cmd: req.cmd,
                dev: req.dev.expect("free request on queue"),
                sector: req.sector,
                nr_sectors: req.nr_sectors,
            });
            cur = req.next;
        }
        out
    }
}

impl Kernel {
    fn has_driver(&self, major: u8) -> bool {
        (major as usize) < NR_BLK_DEV && self.blk().drivers[major as usize].is_some()
    }

    fn run_driver(&self, state: &mut SleepableLockGuard<'_, BlkState>, major: u8) {
        let driver = self.blk().drivers[major as usize]
            .as_ref()
            .expect("driver vanished")
            .clone();
        let mut queue = RequestQueue {
            major,
            state: &mut **state,
            kernel: self,
        };
        driver.request(&mut queue);
    }

    fn add_request(&self, state: &mut SleepableLockGuard<'_, BlkState>, major: u8, slot: usize) {
        // Write-back is committed from here on.
        if let Some(idx) = state.requests[slot].bh {
            self.bcache().shared(idx).set_dirty(false);
        }
        match state.devs[major as usize].current {
            None => {
                state.devs[major as usize].current = Some(slot);
                self.run_driver(state, major);
            }
            Some(head) => {
                // One-pass elevator insertion. The second disjunct admits
                // the wrap point of an already-turned-around queue; a null
                // bh ends a run of paging requests, which stay FIFO ahead
                // of buffer-backed ones.
                let mut tmp = head;
                loop {
                    let Some(next) = state.requests[tmp].next else {
                        break;
                    };
                    if state.requests[slot].bh.is_none() {
                        if state.requests[next].bh.is_some() {
                            break;
                        }
                        tmp = next;
                        continue;
                    }
                    if (in_order(&state.requests[tmp], &state.requests[slot])
                        || !in_order(&state.requests[tmp], &state.requests[next]))
                        && in_order(&state.requests[slot], &state.requests[next])
                    {
                        break;
                    }
                    tmp = next;
                }
                state.requests[slot].next = state.requests[tmp].next;
                state.requests[tmp].next = Some(slot);
            }
        }
    }

    fn make_request(&self, major: u8, rw: Rw, idx: u32) {
        let (cmd, ahead) = rw.demote();
        let sh = self.bcache().shared(idx);
        if ahead && sh.is_locked() {
            return;
        }
        self.bcache().lock_buffer(idx);
        // Re-read the identity: the buffer may have been re-keyed while we
        // waited for its lock, and the transfer may have become a no-op.
        let (dev, blocknr) = self.bcache().identity(idx);
        if dev.is_none()
            || dev.major() != major
            || (cmd == Cmd::Write && !sh.is_dirty())
            || (cmd == Cmd::Read && sh.is_uptodate())
        {
            self.bcache().unlock_buffer(idx);
            return;
        }
        let mut state = self.blk().state.lock();
        let slot = loop {
            // Reads may take any slot; writes leave the top third free.
            let top = if cmd == Cmd::Read {
                NR_REQUEST
            } else {
                NR_REQUEST * 2 / 3
            };
            if let Some(slot) = (0..top).rev().find(|&i| state.requests[i].dev.is_none()) {
                break slot;
            }
            if ahead {
                drop(state);
                self.bcache().unlock_buffer(idx);
                return;
            }
            state.sleep();
        };
        state.requests[slot] = Request {
            dev: Some(dev),
            cmd,
            errors: 0,
            sector: blocknr as u64 * SECTORS_PER_BLOCK,
            nr_sectors: SECTORS_PER_BLOCK as u32,
            buffer: DataPtr(sh.data_ptr()),
            waiting: None,
            bh: Some(idx),
            next: None,
        };
        self.add_request(&mut state, major, slot);
    }

    /// Queues block I/O for a held buffer. Unknown devices are diagnosed
    /// and dropped, as ever.
    pub fn ll_rw_block(&self, rw: Rw, buf: &Buf) {
        let major = buf.dev().major();
        if !self.has_driver(major) {
            tracing::warn!(dev = ?buf.dev(), "trying to read nonexistent block-device");
            return;
        }
        self.make_request(major, rw, buf.index());
    }

    /// Write-back entry used by the sync paths, which walk headers rather
    /// than handles.
    pub(crate) fn submit_buffer(&self, rw: Rw, idx: u32) {
        let (dev, _) = self.bcache().identity(idx);
        if !self.has_driver(dev.major()) {
            tracing::warn!(?dev, "trying to read nonexistent block-device");
            return;
        }
        self.make_request(dev.major(), rw, idx);
    }

    /// Page-sized I/O with no backing buffer. Blocks the caller until the
    /// device completes the transfer.
    pub fn ll_rw_page(
        &self,
        rw: Rw,
        dev: DevId,
        page: u32,
        data: &mut [u8; PAGE_SIZE],
    ) -> Result<(), Error> {
        let major = dev.major();
        if !self.has_driver(major) {
            tracing::warn!(?dev, "trying to read nonexistent block-device");
            return Err(Error::NoDevice(dev));
        }
        let cmd = match rw {
            Rw::Read => Cmd::Read,
            Rw::Write => Cmd::Write,
            _ => panic!("bad block dev command, must be R/W"),
        };
        let wait = Arc::new(IoWait::new());
        let mut state = self.blk().state.lock();
        let slot = loop {
            if let Some(slot) = (0..NR_REQUEST).rev().find(|&i| state.requests[i].dev.is_none()) {
                break slot;
            }
            state.sleep();
        };
        state.requests[slot] = Request {
            dev: Some(dev),
            cmd,
            errors: 0,
            sector: (page as u64) * (PAGE_SIZE / SECTOR_SIZE) as u64,
            nr_sectors: (PAGE_SIZE / SECTOR_SIZE) as u32,
            buffer: DataPtr(data.as_mut_ptr()),
            waiting: Some(wait.clone()),
            bh: None,
            next: None,
        };
        self.add_request(&mut state, major, slot);
        drop(state);
        wait.chan.sleep_until(|| wait.done.load(Ordering::Acquire));
        if wait.ok.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::Io {
                dev,
                block: page * (PAGE_SIZE / crate::param::BLOCK_SIZE) as u32,
            })
        }
    }

    /// Runs `f` with the major's queue locked. Completion contexts (the
    /// interrupt half of a driver, tests) use this to reach
    /// [`RequestQueue::end_request`].
    pub fn with_queue<R>(&self, major: u8, f: impl FnOnce(&mut RequestQueue<'_>) -> R) -> R {
        let mut state = self.blk().state.lock();
        let mut queue = RequestQueue {
            major,
            state: &mut *state,
            kernel: self,
        };
        f(&mut queue)
    }

    /// Restarts a major's request function if work is pending.
    pub fn kick(&self, major: u8) {
        if !self.has_driver(major) {
            return;
        }
        let mut state = self.blk().state.lock();
        if state.devs[major as usize].current.is_some() {
            self.run_driver(&mut state, major);
        }
    }

    /// One watchdog tick. Majors whose countdown reaches zero with a
    /// request still in service get their driver's `timed_out` callback.
    pub fn blk_tick(&self) {
        for major in 0..NR_BLK_DEV as u8 {
            let mut state = self.blk().state.lock();
            let dq = &mut state.devs[major as usize];
            if dq.timeout == 0 {
                continue;
            }
            dq.timeout -= 1;
            if dq.timeout == 0 && dq.current.is_some() {
                if let Some(driver) = self.blk().drivers[major as usize].clone() {
                    let mut queue = RequestQueue {
                        major,
                        state: &mut *state,
                        kernel: self,
                    };
                    driver.timed_out(&mut queue);
                }
            }
        }
    }

    /// `blk_size` for `read_inode`: the device's capacity in blocks.
    pub(crate) fn device_blocks(&self, dev: DevId) -> Option<u32> {
        if (dev.major() as usize) >= NR_BLK_DEV {
            return None;
        }
        self.blk().drivers[dev.major() as usize]
            .as_ref()?
            .nr_blocks(dev.minor())
    }
}
