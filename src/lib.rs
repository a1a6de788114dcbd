//! lv6 — the core of an early-Unix style kernel: the block I/O layer, the
//! buffered disk cache, and the MINIX-compatible on-disk filesystem
//! metadata engine.
//!
//! The pieces, leaves first:
//!
//! * [`sync`] — wait channels and sleepable locks, the suspension
//!   primitives everything above blocks on.
//! * [`bio`](Buf) — a pinned, concurrent, write-back cache of 1 KiB blocks
//!   over the block devices.
//! * [`blk`] — per-device request queues fed from a bounded descriptor
//!   pool in elevator order, consumed by [`DiskDriver`]s.
//! * [`fs`] — superblocks, inode and zone bitmaps, the inode table, and the
//!   direct/indirect block map.
//!
//! Everything hangs off one [`Kernel`] value, assembled by
//! [`KernelBuilder`] with a driver per block major:
//!
//! ```
//! use lv6::KernelBuilder;
//!
//! let kernel = KernelBuilder::new().build();
//! let (reader, writer) = kernel.get_pipe_inode();
//! kernel.iput(reader);
//! kernel.iput(writer);
//! ```
//!
//! Buffer and inode handles are counted references into fixed pools and
//! must be released explicitly (`brelse`, `iput`).

mod bio;
pub mod blk;
mod dev;
mod error;
pub mod fs;
mod kernel;
pub mod param;
pub mod sync;

#[cfg(test)]
mod tdisk;

pub use bio::{Buf, BufData};
pub use blk::partition::{parse_partition_table, Partition};
pub use blk::{Cmd, DiskDriver, QueuedRequest, RequestQueue, Rw};
pub use dev::{major, DevId};
pub use error::Error;
pub use fs::inode::{Inode, Stat};
pub use fs::Mode;
pub use kernel::{Kernel, KernelBuilder};
