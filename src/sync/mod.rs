//! Locks and wait channels.

mod sleepablelock;
mod wait_channel;

pub use sleepablelock::{SleepableLock, SleepableLockGuard};
pub use wait_channel::WaitChannel;
