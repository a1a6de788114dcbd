//! The in-memory superblock table and mount glue.
//!
//! One slot per mounted device. A superblock pins its bitmap buffers for
//! the whole mount lifetime; `put_super` is the documented release point.

use core::sync::atomic::Ordering;

use array_macro::array;
use arrayvec::ArrayVec;
use zerocopy::FromBytes;

use crate::bio::Buf;
use crate::dev::{major, DevId};
use crate::error::Error;
use crate::fs::inode::Inode;
use crate::fs::{DSuperBlock, SUPER_MAGIC};
use crate::kernel::Kernel;
use crate::param::{NR_SUPER, ROOT_INO};
use crate::sync::{SleepableLock, WaitChannel};

/// Bitmap buffers a superblock may pin, each kind.
pub const I_MAP_SLOTS: usize = 8;
pub const Z_MAP_SLOTS: usize = 8;

pub(crate) struct SuperSlot {
    pub(crate) ninodes: u16,
    pub(crate) nzones: u16,
    pub(crate) imap_blocks: u16,
    pub(crate) zmap_blocks: u16,
    pub(crate) first_data_zone: u16,
    pub(crate) log_zone_size: u16,
    pub(crate) max_size: u32,
    pub(crate) magic: u16,

    pub(crate) imap: ArrayVec<Buf, I_MAP_SLOTS>,
    pub(crate) zmap: ArrayVec<Buf, Z_MAP_SLOTS>,
    pub(crate) dev: DevId,
    /// Root inode of this filesystem, pinned while mounted.
    pub(crate) isup: Option<Inode>,
    /// Inode this filesystem is mounted on, pinned while mounted.
    pub(crate) imount: Option<Inode>,
    pub(crate) time: u32,
    locked: bool,
    pub(crate) rd_only: bool,
    pub(crate) dirty: bool,
}

impl SuperSlot {
    fn loading(dev: DevId) -> Self {
        Self {
            ninodes: 0,
            nzones: 0,
            imap_blocks: 0,
            zmap_blocks: 0,
            first_data_zone: 0,
            log_zone_size: 0,
            max_size: 0,
            magic: 0,
            imap: ArrayVec::new(),
            zmap: ArrayVec::new(),
            dev,
            isup: None,
            imount: None,
            time: 0,
            locked: true,
            rd_only: false,
            dirty: false,
        }
    }
}

pub(crate) struct SuperTable {
    pub(crate) lock: SleepableLock<[Option<SuperSlot>; NR_SUPER]>,
    waits: [WaitChannel; NR_SUPER],
}

impl SuperTable {
    pub(crate) fn new() -> Self {
        Self {
            lock: SleepableLock::new(array![_ => None; NR_SUPER]),
            waits: array![_ => WaitChannel::new(); NR_SUPER],
        }
    }
}

impl Kernel {
    /// Runs `f` on the device's superblock, waiting out any slot lock.
    /// `f` must not sleep: the table stays locked around it.
    pub(crate) fn with_super<R>(
        &self,
        dev: DevId,
        f: impl FnOnce(&mut SuperSlot) -> R,
    ) -> Option<R> {
        let mut table = self.supers().lock.lock();
        loop {
            let Some(i) =
                (0..NR_SUPER).find(|&i| table[i].as_ref().is_some_and(|s| s.dev == dev))
            else {
                return None;
            };
            if table[i].as_ref().unwrap().locked {
                table.sleep_on(&self.supers().waits[i]);
                continue;
            }
            return Some(f(table[i].as_mut().unwrap()));
        }
    }

    /// Bitmap extents and inode count, for the inode read/write paths.
    pub(crate) fn super_layout(&self, dev: DevId) -> Option<(u16, u16, u16)> {
        self.with_super(dev, |sb| (sb.imap_blocks, sb.zmap_blocks, sb.ninodes))
    }

    /// The device mounted on the inode table slot `idx`, if any.
    pub(crate) fn find_imount(&self, idx: u16) -> Option<DevId> {
        let table = self.supers().lock.lock();
        for slot in table.iter().flatten() {
            if slot.imount.as_ref().is_some_and(|i| i.index() == idx) {
                return Some(slot.dev);
            }
        }
        None
    }

    /// Reads a device's superblock into the table, pinning its bitmap
    /// buffers. A device already in the table is left as is.
    pub fn read_super(&self, dev: DevId) -> Result<(), Error> {
        if dev.is_none() {
            return Err(Error::NoDevice(dev));
        }
        self.check_disk_change(dev);
        let slot = {
            let mut table = self.supers().lock.lock();
            if table
                .iter()
                .any(|s| s.as_ref().is_some_and(|s| s.dev == dev))
            {
                return Ok(());
            }
            let Some(i) = (0..NR_SUPER).find(|&i| table[i].is_none()) else {
                return Err(Error::SuperTableFull(dev));
            };
            table[i] = Some(SuperSlot::loading(dev));
            i
        };

        let fail = |err: Error, bufs: Vec<Buf>| -> Error {
            for buf in bufs {
                self.brelse(buf);
            }
            let mut table = self.supers().lock.lock();
            table[slot] = None;
            drop(table);
            self.supers().waits[slot].wakeup();
            err
        };

        let raw = match self.bread(dev, 1) {
            Ok(buf) => {
                let raw = DSuperBlock::read_from_prefix(&buf.data()[..]).unwrap();
                self.brelse(buf);
                raw
            }
            Err(err) => return Err(fail(err, Vec::new())),
        };
        if raw.magic.get() != SUPER_MAGIC
            || raw.imap_blocks.get() as usize > I_MAP_SLOTS
            || raw.zmap_blocks.get() as usize > Z_MAP_SLOTS
        {
            return Err(fail(Error::BadSuperBlock(dev), Vec::new()));
        }

        let mut maps = Vec::new();
        let nmaps = raw.imap_blocks.get() + raw.zmap_blocks.get();
        for i in 0..nmaps as u32 {
            match self.bread(dev, 2 + i) {
                Ok(buf) => maps.push(buf),
                Err(err) => return Err(fail(err, maps)),
            }
        }

        let mut imap: ArrayVec<Buf, I_MAP_SLOTS> = ArrayVec::new();
        let mut zmap: ArrayVec<Buf, Z_MAP_SLOTS> = ArrayVec::new();
        for (i, mut buf) in maps.into_iter().enumerate() {
            if i == 0 || i == raw.imap_blocks.get() as usize {
                // Reserved bit 0 of each bitmap is always set.
                buf.data_mut()[0] |= 1;
            }
            if i < raw.imap_blocks.get() as usize {
                imap.push(buf);
            } else {
                zmap.push(buf);
            }
        }

        let mut table = self.supers().lock.lock();
        let sb = table[slot].as_mut().unwrap();
        sb.ninodes = raw.ninodes.get();
        sb.nzones = raw.nzones.get();
        sb.imap_blocks = raw.imap_blocks.get();
        sb.zmap_blocks = raw.zmap_blocks.get();
        sb.first_data_zone = raw.first_data_zone.get();
        sb.log_zone_size = raw.log_zone_size.get();
        sb.max_size = raw.max_size.get();
        sb.magic = raw.magic.get();
        sb.imap = imap;
        sb.zmap = zmap;
        sb.time = crate::kernel::now();
        sb.locked = false;
        drop(table);
        self.supers().waits[slot].wakeup();
        tracing::debug!(?dev, "superblock read");
        Ok(())
    }

    /// Releases a device's superblock and its pinned bitmap buffers.
    /// Refused while a filesystem is mounted through it.
    pub fn put_super(&self, dev: DevId) {
        let taken = {
            let mut table = self.supers().lock.lock();
            let Some(i) =
                (0..NR_SUPER).find(|&i| table[i].as_ref().is_some_and(|s| s.dev == dev))
            else {
                return;
            };
            if table[i].as_ref().unwrap().imount.is_some() {
                tracing::warn!(?dev, "mounted disk changed - tssk, tssk");
                return;
            }
            (i, table[i].take().unwrap())
        };
        let (i, mut sb) = taken;
        for buf in sb.imap.drain(..).chain(sb.zmap.drain(..)) {
            self.brelse(buf);
        }
        if let Some(isup) = sb.isup.take() {
            self.iput(isup);
        }
        self.supers().waits[i].wakeup();
        tracing::debug!(?dev, "superblock released");
    }

    /// Mounts the root filesystem and returns a handle to its root inode.
    pub fn mount_root(&self, dev: DevId) -> Result<Inode, Error> {
        self.read_super(dev)?;
        let root = self.iget(dev, ROOT_INO);
        let isup = self.idup(&root);
        let imount = self.idup(&root);
        self.with_super(dev, |sb| {
            sb.isup = Some(isup);
            sb.imount = Some(imount);
        })
        .expect("superblock vanished under mount_root");
        self.root_dev.store(dev.0, Ordering::Release);
        tracing::debug!(?dev, "root filesystem mounted");
        Ok(root)
    }

    /// Mounts `dev` on the directory inode `on`. On failure the inode
    /// reference is dropped.
    pub fn mount_on(&self, dev: DevId, on: Inode) -> Result<(), Error> {
        let on = scopeguard::guard(on, |on| self.iput(on));
        let ok = self.with_inode(&on, |slot| {
            slot.mode.is_dir() && !slot.mounted && slot.count == 1 && slot.num != ROOT_INO
        });
        if !ok {
            return Err(Error::Busy(dev));
        }
        self.read_super(dev)?;
        let busy = self
            .with_super(dev, |sb| sb.imount.is_some())
            .expect("superblock vanished under mount_on");
        if busy {
            return Err(Error::Busy(dev));
        }
        self.with_inode(&on, |slot| {
            slot.mounted = true;
            slot.dirty = true;
        });
        let on = scopeguard::ScopeGuard::into_inner(on);
        self.with_super(dev, |sb| {
            sb.imount = Some(on);
            sb.dirty = true;
        });
        Ok(())
    }

    /// Unmounts `dev`: drops the mount pins, releases the superblock, and
    /// syncs the device.
    pub fn umount_dev(&self, dev: DevId) -> Result<(), Error> {
        if dev.0 == self.root_dev.load(Ordering::Acquire) {
            return Err(Error::Busy(dev));
        }
        let (has_imount, isup_idx) = self
            .with_super(dev, |sb| {
                (sb.imount.is_some(), sb.isup.as_ref().map(|i| i.index()))
            })
            .ok_or(Error::NotMounted(dev))?;
        if !has_imount {
            return Err(Error::NotMounted(dev));
        }
        if self.device_inodes_busy(dev, isup_idx) {
            return Err(Error::Busy(dev));
        }
        let (imount, isup) = self
            .with_super(dev, |sb| (sb.imount.take(), sb.isup.take()))
            .ok_or(Error::NotMounted(dev))?;
        if let Some(imount) = imount {
            let was_mounted = self.with_inode(&imount, |slot| {
                let was = slot.mounted;
                slot.mounted = false;
                was
            });
            if !was_mounted {
                tracing::warn!(?dev, "mounted inode has mount flag clear");
            }
            self.iput(imount);
        }
        if let Some(isup) = isup {
            self.iput(isup);
        }
        self.put_super(dev);
        self.sync_dev(dev);
        Ok(())
    }

    /// Polls a removable device for media change and, if changed, discards
    /// every cached structure that described the old medium.
    pub fn check_disk_change(&self, dev: DevId) {
        if dev.major() != major::FLOPPY {
            return;
        }
        let Some(driver) = self
            .blk()
            .drivers
            .get(dev.major() as usize)
            .and_then(|d| d.as_ref())
        else {
            return;
        };
        if !driver.media_changed(dev.minor()) {
            return;
        }
        tracing::warn!(?dev, "media changed, invalidating cached state");
        self.put_super(dev);
        self.invalidate_inodes(dev);
        self.invalidate_buffers(dev);
    }

    /// Drops pinned references without the release discipline. Only for
    /// kernel teardown, where the pools die with the pins.
    pub(crate) fn teardown_supers(&mut self) {
        for slot in self.supers_mut().lock.get_mut().iter_mut() {
            if let Some(mut sb) = slot.take() {
                for buf in sb.imap.drain(..).chain(sb.zmap.drain(..)) {
                    core::mem::forget(buf);
                }
                if let Some(i) = sb.isup.take() {
                    core::mem::forget(i);
                }
                if let Some(i) = sb.imount.take() {
                    core::mem::forget(i);
                }
            }
        }
    }
}
