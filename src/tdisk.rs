//! In-memory disk drivers for the unit tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::blk::{Cmd, DiskDriver, RequestQueue};
use crate::param::SECTOR_SIZE;

/// A synchronous RAM-disk style driver: every request is completed in
/// place, in queue order.
pub(crate) struct TestDisk {
    minors: Vec<Mutex<Vec<u8>>>,
}

impl TestDisk {
    /// `nminors` disks of `blocks` KiB each, filled with `byte`.
    pub(crate) fn filled(nminors: usize, blocks: usize, byte: u8) -> Self {
        Self {
            minors: (0..nminors)
                .map(|_| Mutex::new(vec![byte; blocks * 1024]))
                .collect(),
        }
    }

    pub(crate) fn read_byte(&self, minor: u8, offset: u64) -> u8 {
        self.minors[minor as usize].lock().unwrap()[offset as usize]
    }

    pub(crate) fn fill(&self, minor: u8, byte: u8) {
        self.minors[minor as usize]
            .lock()
            .unwrap()
            .iter_mut()
            .for_each(|b| *b = byte);
    }
}

impl DiskDriver for TestDisk {
    fn request(&self, queue: &mut RequestQueue<'_>) {
        while let Some(dev) = queue.current_dev() {
            let offset = queue.current_sector() as usize * SECTOR_SIZE;
            let len = queue.current_nr_sectors() as usize * SECTOR_SIZE;
            let mut image = self.minors[dev.minor() as usize].lock().unwrap();
            if offset + len > image.len() {
                drop(image);
                queue.end_request(false);
                continue;
            }
            match queue.current_cmd() {
                Cmd::Read => queue.current_data().copy_from_slice(&image[offset..offset + len]),
                Cmd::Write => image[offset..offset + len].copy_from_slice(queue.current_data()),
            }
            drop(image);
            queue.end_request(true);
        }
    }

    fn nr_blocks(&self, minor: u8) -> Option<u32> {
        self.minors
            .get(minor as usize)
            .map(|m| (m.lock().unwrap().len() / 1024) as u32)
    }
}

/// A driver that never completes anything on its own: requests pile up for
/// inspection and are finished by the test through `Kernel::with_queue`.
pub(crate) struct StallDisk {
    timeouts: AtomicU32,
}

impl StallDisk {
    pub(crate) fn new() -> Self {
        Self {
            timeouts: AtomicU32::new(0),
        }
    }

    pub(crate) fn timeouts(&self) -> u32 {
        self.timeouts.load(Ordering::Acquire)
    }
}

impl DiskDriver for StallDisk {
    fn request(&self, _queue: &mut RequestQueue<'_>) {}

    fn timed_out(&self, queue: &mut RequestQueue<'_>) {
        self.timeouts.fetch_add(1, Ordering::AcqRel);
        queue.end_request(false);
    }
}
