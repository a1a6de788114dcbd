//! Shared test harness: in-memory disk drivers and a minimal mkfs.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use lv6::{Cmd, DiskDriver, RequestQueue};

pub const BLOCK: usize = 1024;
pub const SECTOR: usize = 512;
const MAX_ERRORS: u32 = 7;

/// A synchronous in-memory disk. Reads of poisoned sectors fail and are
/// retried up to the usual error budget, like the hard-disk driver does.
pub struct MemDisk {
    minors: Vec<Mutex<Vec<u8>>>,
    fail_sectors: Mutex<HashSet<(u8, u64)>>,
    read_attempts: AtomicU32,
    media_changed: AtomicBool,
}

impl MemDisk {
    pub fn from_images(images: Vec<Vec<u8>>) -> Self {
        Self {
            minors: images.into_iter().map(Mutex::new).collect(),
            fail_sectors: Mutex::new(HashSet::new()),
            read_attempts: AtomicU32::new(0),
            media_changed: AtomicBool::new(false),
        }
    }

    pub fn blank(nminors: usize, blocks: usize) -> Self {
        Self::from_images(vec![vec![0u8; blocks * BLOCK]; nminors])
    }

    /// Makes reads touching the sector fail until the budget runs out.
    pub fn poison_sector(&self, minor: u8, sector: u64) {
        self.fail_sectors.lock().unwrap().insert((minor, sector));
    }

    pub fn read_attempts(&self) -> u32 {
        self.read_attempts.load(Ordering::Acquire)
    }

    pub fn set_media_changed(&self) {
        self.media_changed.store(true, Ordering::Release);
    }

    pub fn read_byte(&self, minor: u8, offset: usize) -> u8 {
        self.minors[minor as usize].lock().unwrap()[offset]
    }

    pub fn write_byte(&self, minor: u8, offset: usize, byte: u8) {
        self.minors[minor as usize].lock().unwrap()[offset] = byte;
    }

    pub fn block_of(&self, minor: u8, block: u32) -> Vec<u8> {
        let image = self.minors[minor as usize].lock().unwrap();
        image[block as usize * BLOCK..(block as usize + 1) * BLOCK].to_vec()
    }
}

impl DiskDriver for MemDisk {
    fn request(&self, queue: &mut RequestQueue<'_>) {
        while let Some(dev) = queue.current_dev() {
            let minor = dev.minor();
            let sector = queue.current_sector();
            let nsect = queue.current_nr_sectors() as u64;
            let cmd = queue.current_cmd();
            if cmd == Cmd::Read {
                self.read_attempts.fetch_add(1, Ordering::AcqRel);
                let poisoned = {
                    let fail = self.fail_sectors.lock().unwrap();
                    (sector..sector + nsect).any(|s| fail.contains(&(minor, s)))
                };
                if poisoned {
                    if queue.record_error() >= MAX_ERRORS {
                        queue.end_request(false);
                    }
                    continue;
                }
            }
            let offset = sector as usize * SECTOR;
            let len = nsect as usize * SECTOR;
            let mut image = self.minors[minor as usize].lock().unwrap();
            if offset + len > image.len() {
                drop(image);
                queue.end_request(false);
                continue;
            }
            match cmd {
                Cmd::Read => queue
                    .current_data()
                    .copy_from_slice(&image[offset..offset + len]),
                Cmd::Write => image[offset..offset + len].copy_from_slice(queue.current_data()),
            }
            drop(image);
            queue.end_request(true);
        }
    }

    fn nr_blocks(&self, minor: u8) -> Option<u32> {
        self.minors
            .get(minor as usize)
            .map(|m| (m.lock().unwrap().len() / BLOCK) as u32)
    }

    fn media_changed(&self, _minor: u8) -> bool {
        self.media_changed.swap(false, Ordering::AcqRel)
    }
}

/// A driver that leaves every request pending; tests drain the queue by
/// hand through `Kernel::with_queue`.
pub struct StallDisk;

impl DiskDriver for StallDisk {
    fn request(&self, _queue: &mut RequestQueue<'_>) {}
}

/// Geometry of a freshly built image.
#[derive(Clone, Copy, Debug)]
pub struct FsGeometry {
    pub ninodes: u16,
    pub nzones: u16,
    pub imap_blocks: u16,
    pub zmap_blocks: u16,
    pub first_data_zone: u16,
}

impl FsGeometry {
    pub fn inode_block(&self, num: u16) -> u32 {
        2 + self.imap_blocks as u32 + self.zmap_blocks as u32 + (num as u32 - 1) / 32
    }
}

/// Lays out an empty MINIX filesystem: boot block, superblock, one imap
/// block, one zmap block, the inode table, data zones. Bit 0 of each bitmap
/// is reserved set.
pub fn mkfs(ninodes: u16, nzones: u16) -> (Vec<u8>, FsGeometry) {
    assert!(ninodes <= 8192 && (ninodes as usize).div_ceil(32) < nzones as usize);
    let inode_blocks = (ninodes as u32).div_ceil(32) as u16;
    let geo = FsGeometry {
        ninodes,
        nzones,
        imap_blocks: 1,
        zmap_blocks: 1,
        first_data_zone: 2 + 1 + 1 + inode_blocks,
    };
    let mut image = vec![0u8; nzones as usize * BLOCK];

    // Superblock, block 1.
    let sb = BLOCK;
    image[sb..sb + 2].copy_from_slice(&ninodes.to_le_bytes());
    image[sb + 2..sb + 4].copy_from_slice(&nzones.to_le_bytes());
    image[sb + 4..sb + 6].copy_from_slice(&geo.imap_blocks.to_le_bytes());
    image[sb + 6..sb + 8].copy_from_slice(&geo.zmap_blocks.to_le_bytes());
    image[sb + 8..sb + 10].copy_from_slice(&geo.first_data_zone.to_le_bytes());
    image[sb + 10..sb + 12].copy_from_slice(&0u16.to_le_bytes());
    let max_size: u32 = ((7 + 512 + 512 * 512) * BLOCK) as u32;
    image[sb + 12..sb + 16].copy_from_slice(&max_size.to_le_bytes());
    image[sb + 16..sb + 18].copy_from_slice(&0x137Fu16.to_le_bytes());

    // Reserved bit 0 of each bitmap.
    image[2 * BLOCK] = 0x01;
    image[3 * BLOCK] = 0x01;
    (image, geo)
}

/// On-disk inode fields for `write_dinode`.
#[derive(Clone, Copy, Default)]
pub struct RawInode {
    pub mode: u16,
    pub uid: u16,
    pub size: u32,
    pub time: u32,
    pub gid: u8,
    pub nlinks: u8,
    pub zone: [u16; 9],
}

/// Writes inode `num` into the image and sets its imap bit.
pub fn write_dinode(image: &mut [u8], geo: &FsGeometry, num: u16, inode: RawInode) {
    let block = geo.inode_block(num) as usize;
    let off = block * BLOCK + ((num as usize - 1) % 32) * 32;
    image[off..off + 2].copy_from_slice(&inode.mode.to_le_bytes());
    image[off + 2..off + 4].copy_from_slice(&inode.uid.to_le_bytes());
    image[off + 4..off + 8].copy_from_slice(&inode.size.to_le_bytes());
    image[off + 8..off + 12].copy_from_slice(&inode.time.to_le_bytes());
    image[off + 12] = inode.gid;
    image[off + 13] = inode.nlinks;
    for (i, z) in inode.zone.iter().enumerate() {
        image[off + 14 + 2 * i..off + 16 + 2 * i].copy_from_slice(&z.to_le_bytes());
    }
    image[2 * BLOCK + num as usize / 8] |= 1 << (num % 8);
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
