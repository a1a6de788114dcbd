use crate::dev::DevId;

/// Expected exceptional conditions. Programming-invariant violations
/// (double-set bitmap bits, reference underflows, queue corruption) are not
/// errors: they panic with the offending state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The device failed the transfer; the buffer was released not uptodate.
    #[error("I/O error on dev {dev:?}, block {block}")]
    Io { dev: DevId, block: u32 },

    /// No driver is registered for the major, or the major is out of range.
    #[error("nonexistent block device {0:?}")]
    NoDevice(DevId),

    /// Block 1 of the device does not carry a MINIX superblock.
    #[error("bad superblock magic on dev {0:?}")]
    BadSuperBlock(DevId),

    /// All in-memory superblock slots are taken.
    #[error("superblock table full mounting dev {0:?}")]
    SuperTableFull(DevId),

    /// The device has no in-memory superblock.
    #[error("dev {0:?} is not mounted")]
    NotMounted(DevId),

    /// Mount/unmount refused: target inode already a mount point, device
    /// already mounted, or live references remain.
    #[error("dev {0:?} is busy")]
    Busy(DevId),

    /// Missing 0x55 0xAA signature or truncated entry table.
    #[error("bad partition table")]
    BadPartitionTable,
}
