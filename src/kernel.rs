//! The kernel context: one value owning the buffer pool, the request
//! layer, the inode table, and the superblock table, threaded through every
//! API. Built once, at boot.

use core::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;

use crate::bio::Bcache;
use crate::blk::{BlockIo, DiskDriver};
use crate::fs::inode::ITable;
use crate::fs::superblock::SuperTable;
use crate::param::{NR_BLK_DEV, NR_BUFFERS};

/// Seconds since the epoch, for inode and superblock timestamps.
pub(crate) fn now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

pub struct Kernel {
    bcache: Bcache,
    blk: BlockIo,
    itable: ITable,
    supers: SuperTable,
    /// Device of the root filesystem, 0 until `mount_root`.
    pub(crate) root_dev: AtomicU16,
    fsuid: AtomicU16,
    fsgid: AtomicU8,
}

impl Kernel {
    pub(crate) fn bcache(&self) -> &Bcache {
        &self.bcache
    }

    pub(crate) fn blk(&self) -> &BlockIo {
        &self.blk
    }

    pub(crate) fn itable(&self) -> &ITable {
        &self.itable
    }

    pub(crate) fn supers(&self) -> &SuperTable {
        &self.supers
    }

    pub(crate) fn supers_mut(&mut self) -> &mut SuperTable {
        &mut self.supers
    }

    /// Owner credentials stamped onto freshly allocated inodes.
    pub fn set_fsids(&self, uid: u16, gid: u8) {
        self.fsuid.store(uid, Ordering::Relaxed);
        self.fsgid.store(gid, Ordering::Relaxed);
    }

    pub(crate) fn fsids(&self) -> (u16, u8) {
        (
            self.fsuid.load(Ordering::Relaxed),
            self.fsgid.load(Ordering::Relaxed),
        )
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.teardown_supers();
    }
}

/// Builds a [`Kernel`]: pool sizes and one driver per block major.
pub struct KernelBuilder {
    nr_buffers: usize,
    drivers: [Option<Arc<dyn DiskDriver>>; NR_BLK_DEV],
}

impl KernelBuilder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            nr_buffers: NR_BUFFERS,
            drivers: [(); NR_BLK_DEV].map(|_| None),
        }
    }

    /// Buffer pool size; at least four headers (page reads take four at
    /// once).
    pub fn nr_buffers(mut self, n: usize) -> Self {
        self.nr_buffers = n;
        self
    }

    /// Attaches a driver to a block major.
    pub fn driver(mut self, major: u8, driver: Arc<dyn DiskDriver>) -> Self {
        self.drivers[major as usize] = Some(driver);
        self
    }

    pub fn build(self) -> Kernel {
        Kernel {
            bcache: Bcache::new(self.nr_buffers),
            blk: BlockIo::new(self.drivers),
            itable: ITable::new(),
            supers: SuperTable::new(),
            root_dev: AtomicU16::new(0),
            fsuid: AtomicU16::new(0),
            fsgid: AtomicU8::new(0),
        }
    }
}
