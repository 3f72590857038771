// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt-masking spinlock.
//!
//! Each kernel subsystem (mutex/condvar, message queues, console hooks)
//! guards its shared state with one of these. On the single supported hart
//! the interrupt mask is what actually provides exclusion; the atomic flag
//! exists so that misuse (taking the same lock twice from one context, or
//! from a future second hart) spins visibly instead of corrupting state.
//!
//! The guard restores the interrupt-enable state captured at lock time, so
//! these nest correctly: a lock taken inside another's critical section
//! restores "still disabled" on drop.
//!
//! Scopes held under these locks must stay short -- list pushes, pops and
//! state-bit flips. Never yield while holding a guard; the blocking
//! primitives drop their guard first (see `task::yield_while_blocked`).

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;

pub struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// Safety: the lock hands out at most one guard at a time, with interrupts
// masked while it exists.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Masks interrupts and acquires the lock, returning a guard that
    /// releases both on drop.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        let irq_token = arch::irq_save();
        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }
        SpinGuard {
            lock: self,
            irq_token,
        }
    }
}

pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
    irq_token: bool,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: holding the guard means exclusive access.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: as above.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        arch::irq_restore(self.irq_token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_round_trip_leaves_lock_free() {
        let lock = SpinLock::new(7u32);
        {
            let mut g = lock.lock();
            *g += 1;
        }
        assert_eq!(*lock.lock(), 8);
    }

    #[test]
    fn guard_gives_exclusive_mutation() {
        let lock = SpinLock::new(Vec::<u32>::new());
        lock.lock().push(1);
        lock.lock().push(2);
        assert_eq!(&*lock.lock(), &[1, 2]);
    }
}
