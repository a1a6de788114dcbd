//! Sleepable locks.
//!
//! A `SleepableLock` guards one of the kernel's singleton structures the way
//! the historical kernel used cli/sti: the critical sections are short, and
//! any path that must block releases the lock across the suspend and
//! re-validates its preconditions afterwards.

use core::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};

use super::WaitChannel;

pub struct SleepableLock<T> {
    /// Channel for tasks waiting on a condition of the protected data
    /// itself (`buffer_wait`, `wait_for_request`).
    chan: WaitChannel,
    inner: Mutex<T>,
}

pub struct SleepableLockGuard<'s, T> {
    lock: &'s SleepableLock<T>,
    // `None` only inside the sleep methods, while the task is suspended.
    inner: Option<MutexGuard<'s, T>>,
}

impl<T> SleepableLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            chan: WaitChannel::new(),
            inner: Mutex::new(data),
        }
    }

    pub fn lock(&self) -> SleepableLockGuard<'_, T> {
        SleepableLockGuard {
            lock: self,
            inner: Some(self.inner.lock()),
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Wakes tasks sleeping via `SleepableLockGuard::sleep`.
    pub fn wakeup(&self) {
        self.chan.wakeup();
    }
}

impl<T> SleepableLockGuard<'_, T> {
    /// Releases the lock, sleeps until the lock's own channel is woken, and
    /// re-acquires. The caller re-checks its condition on return.
    pub fn sleep(&mut self) {
        let lock = self.lock;
        let epoch = lock.chan.epoch();
        self.suspend(&lock.chan, epoch);
    }

    /// Like `sleep`, but on an external channel. Sound only when every
    /// waker of `chan` mutates the awaited state under this same lock.
    pub fn sleep_on(&mut self, chan: &WaitChannel) {
        let epoch = chan.epoch();
        self.suspend(chan, epoch);
    }

    /// Like `sleep_on` for wakers that do not hold this lock: the caller
    /// samples `chan.epoch()` before testing its condition, so a wakeup
    /// landing in between is not lost.
    pub fn sleep_from(&mut self, chan: &WaitChannel, epoch: u64) {
        self.suspend(chan, epoch);
    }

    fn suspend(&mut self, chan: &WaitChannel, epoch: u64) {
        self.inner = None;
        chan.wait_from(epoch);
        self.inner = Some(self.lock.inner.lock());
    }

    pub fn wakeup(&self) {
        self.lock.chan.wakeup();
    }
}

impl<T> Deref for SleepableLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner.as_ref().unwrap()
    }
}

impl<T> DerefMut for SleepableLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_mut().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn sleep_releases_and_reacquires() {
        let lock = Arc::new(SleepableLock::new(0u32));
        let l = lock.clone();
        let sleeper = std::thread::spawn(move || {
            let mut g = l.lock();
            while *g == 0 {
                g.sleep();
            }
            *g
        });
        std::thread::sleep(std::time::Duration::from_millis(10));
        *lock.lock() = 7;
        lock.wakeup();
        assert_eq!(sleeper.join().unwrap(), 7);
    }
}
