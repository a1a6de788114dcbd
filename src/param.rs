//! Pool sizes and disk geometry.

/// Unit of I/O and cache granularity; two sectors.
pub const BLOCK_SIZE: usize = 1024;

/// Device sector size.
pub const SECTOR_SIZE: usize = 512;

/// Sectors per cache block.
pub const SECTORS_PER_BLOCK: u64 = (BLOCK_SIZE / SECTOR_SIZE) as u64;

/// Page size used by pipe rings and page-sized I/O.
pub const PAGE_SIZE: usize = 4096;

/// Number of hash chains in the buffer cache. Prime.
pub const NR_HASH: usize = 307;

/// Buffer pool size when the builder is not told otherwise.
pub const NR_BUFFERS: usize = 64;

/// Entries in the request pool. Writes may use only the low 2/3 of these:
/// reads take precedence.
pub const NR_REQUEST: usize = 32;

/// Majors 0..NR_BLK_DEV may carry a block driver.
pub const NR_BLK_DEV: usize = 7;

/// In-memory superblock table size.
pub const NR_SUPER: usize = 8;

/// In-memory inode table size.
pub const NR_INODE: usize = 64;

/// Device errors tolerated per request before it completes failed.
pub const MAX_ERRORS: u32 = 7;

/// Root inode number of every filesystem.
pub const ROOT_INO: u16 = 1;
