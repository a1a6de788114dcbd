//! Wait channels.
//!
//! The historical kernel kept a single task pointer per wait slot and
//! threaded the remaining waiters through their stacks. Here a channel is an
//! epoch counter plus a condition variable: `wakeup` advances the epoch and
//! wakes every waiter, and every waiter re-checks the condition it slept on.

use parking_lot::{Condvar, Mutex};

pub struct WaitChannel {
    epoch: Mutex<u64>,
    cond: Condvar,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self {
            epoch: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Samples the epoch. A subsequent `wait_from(epoch)` returns as soon as
    /// any `wakeup` lands after this call.
    pub(crate) fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    /// Blocks until the epoch advances past `epoch`. Returns immediately if
    /// it already has.
    pub(crate) fn wait_from(&self, epoch: u64) {
        let mut cur = self.epoch.lock();
        while *cur == epoch {
            self.cond.wait(&mut cur);
        }
    }

    /// Wakes every task sleeping on the channel.
    pub fn wakeup(&self) {
        let mut cur = self.epoch.lock();
        *cur = cur.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Blocks the calling task until `cond` holds. `cond` must become true
    /// under a `wakeup` of this channel; it is re-checked after every wake.
    pub fn sleep_until(&self, mut cond: impl FnMut() -> bool) {
        loop {
            let epoch = self.epoch();
            if cond() {
                return;
            }
            self.wait_from(epoch);
        }
    }
}

impl Default for WaitChannel {
    fn default() -> Self {
        Self::new()
    }
}
