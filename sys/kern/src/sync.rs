// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronization primitives.
//!
//! Mutexes and condition variables share one subsystem spinlock; the
//! message queue carries its own. Everything a primitive does under its
//! lock is short -- queue surgery and task-state flips -- and blocking
//! always goes through `task::yield_while_blocked` so that a task is
//! registered as a waiter *before* the lock is released. See the module
//! docs of [`mutex`] for the ownership-transfer discipline.
//!
//! Each primitive carries a magic tag. The tag is stamped at construction,
//! poisoned on destroy, and checked on every operation: using a destroyed
//! or corrupted primitive from a blocking path is a programming error and
//! panics, while the inspection-style entry points report `Error::Fail`
//! and let the caller decide.

pub mod cond;
pub mod mqueue;
pub mod mutex;

pub use cond::Condvar;
pub use mqueue::MessageQueue;
pub use mutex::Mutex;

use crate::spinlock::SpinLock;

/// The mutex/condvar subsystem lock. Interrupts are masked while held.
pub(crate) static SYNC_LOCK: SpinLock<()> = SpinLock::new(());

/// Tag stamped into a live mutex.
pub(crate) const MUTEX_MAGIC: u32 = 0x4D55_5458;
/// Tag stamped into a live condition variable.
pub(crate) const COND_MAGIC: u32 = 0x434F_4E44;
/// Tag stamped over either on destroy, so use-after-destroy is caught as
/// such rather than misbehaving quietly.
pub(crate) const POISON_MAGIC: u32 = 0xDEAD_BEEF;
