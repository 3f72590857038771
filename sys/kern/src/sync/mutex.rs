// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Non-recursive mutex with FIFO ownership transfer.
//!
//! Waiters are served strictly first-come-first-served, and `unlock` hands
//! the mutex *directly* to the head waiter: by the time that task runs
//! again it already owns the mutex and does not re-contend. This is what
//! gives the fairness property -- a task that blocked first cannot be
//! overtaken by a later arrival hitting the fast path, because the fast
//! path only triggers while the owner field is clear, and ownership
//! transfer never clears it while waiters exist.
//!
//! The state machine ([`MutexState`]) is separated from the blocking shell
//! ([`Mutex`]) so the transitions can be driven directly against a plain
//! task table in tests; the shell adds the subsystem lock, the real
//! current-task id and the yield.

use core::cell::UnsafeCell;

use abi::{Error, TaskId, TaskState, TASK_ID_NONE, TASK_ID_POISON};
use waitq::Queue;

use super::{MUTEX_MAGIC, POISON_MAGIC, SYNC_LOCK};
use crate::startup::with_task_table;
use crate::task::{self, Task, MAX_TASKS};

/// The mutex proper: shared state behind the subsystem lock.
pub struct Mutex {
    state: UnsafeCell<MutexState>,
}

// Safety: all access to the inner state happens under SYNC_LOCK with
// interrupts masked.
unsafe impl Sync for Mutex {}

pub(crate) struct MutexState {
    magic: u32,
    /// Owning task id; 0 when free, `TASK_ID_POISON` once destroyed.
    owner: TaskId,
    waiters: Queue<TaskId, MAX_TASKS>,
}

fn waiter_index(tasks: &[Task], id: TaskId) -> usize {
    let idx = usize::from(id.checked_sub(1).unwrap_or_else(|| {
        panic!("invalid waiter id")
    }));
    if idx >= tasks.len() {
        panic!("invalid waiter id");
    }
    idx
}

impl MutexState {
    pub(crate) const fn new() -> Self {
        Self {
            magic: MUTEX_MAGIC,
            owner: TASK_ID_NONE,
            waiters: Queue::new(),
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.magic == MUTEX_MAGIC && self.owner != TASK_ID_POISON
    }

    pub(crate) fn owner(&self) -> TaskId {
        self.owner
    }

    pub(crate) fn waiting_count(&self) -> usize {
        self.waiters.len()
    }

    /// Non-blocking acquisition attempt. `Ok(true)` means the caller now
    /// owns the mutex; `Ok(false)` means somebody else does. Taking a
    /// mutex you already hold is refused, never self-deadlocked.
    pub(crate) fn try_acquire(
        &mut self,
        caller: TaskId,
    ) -> Result<bool, Error> {
        if self.owner == caller {
            return Err(Error::TaskBusy);
        }
        if self.owner == TASK_ID_NONE {
            self.owner = caller;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// The whole of a lock attempt up to (but excluding) the yield: fast
    /// path, or registration as a blocked waiter with `delay` ticks of
    /// timeout (0 for indefinite).
    pub(crate) fn lock_prepare(
        &mut self,
        tasks: &mut [Task],
        caller: TaskId,
        delay: u32,
    ) -> Result<bool, Error> {
        if self.try_acquire(caller)? {
            return Ok(true);
        }
        if self.waiters.push_back(caller).is_err() {
            // More waiters than tasks exist; the queue is corrupt.
            panic!("mutex waiter overflow");
        }
        let t = &mut tasks[waiter_index(tasks, caller)];
        t.set_state(TaskState::Blocked);
        t.set_delay(delay);
        Ok(false)
    }

    /// Releases the mutex, transferring ownership to the head waiter if
    /// one exists. The awakened task owns the mutex before it runs again.
    pub(crate) fn release(
        &mut self,
        tasks: &mut [Task],
        caller: TaskId,
    ) -> Result<(), Error> {
        if self.owner != caller {
            return Err(Error::NotOwner);
        }
        match self.waiters.pop_front() {
            None => {
                self.owner = TASK_ID_NONE;
            }
            Some(next) => {
                let t = &mut tasks[waiter_index(tasks, next)];
                if t.state() != TaskState::Blocked {
                    // A waiter that isn't blocked means the waiter list
                    // and the task table disagree.
                    panic!("mutex waiter not blocked");
                }
                self.owner = next;
                t.set_delay(0);
                t.set_state(TaskState::Ready);
            }
        }
        Ok(())
    }

    /// Post-wake resolution of a timed lock: either ownership arrived
    /// while we slept, or the delay expired and we are still enqueued.
    /// A task found in neither place lost both races at once; that is
    /// resolved conservatively as a timeout.
    pub(crate) fn resolve_timed(&mut self, caller: TaskId) -> Result<(), Error> {
        if self.owner == caller {
            return Ok(());
        }
        let _ = self.waiters.remove_first(|&w| w == caller);
        Err(Error::Timeout)
    }

    pub(crate) fn destroy(&mut self) -> Result<(), Error> {
        if self.owner != TASK_ID_NONE || !self.waiters.is_empty() {
            return Err(Error::TaskBusy);
        }
        self.magic = POISON_MAGIC;
        self.owner = TASK_ID_POISON;
        Ok(())
    }
}

impl Mutex {
    /// Creates a free mutex. Reinitializing a destroyed mutex is not
    /// supported; make a new one.
    pub const fn new() -> Self {
        Self {
            state: UnsafeCell::new(MutexState::new()),
        }
    }

    /// Acquires the mutex, blocking until it is ours. Using a destroyed
    /// mutex here is a programming error and panics.
    pub fn lock(&self) -> Result<(), Error> {
        let caller = task::current_id();
        let guard = SYNC_LOCK.lock();
        // Safety: SYNC_LOCK serializes all access to the inner state.
        let st = unsafe { &mut *self.state.get() };
        if !st.is_valid() {
            panic!("lock of invalid mutex");
        }
        let acquired =
            with_task_table(|tasks| st.lock_prepare(tasks, caller, 0))?;
        if acquired {
            return Ok(());
        }
        task::yield_while_blocked(guard);
        // The unlocker made us owner before waking us.
        Ok(())
    }

    /// Acquires the mutex only if that can happen immediately.
    pub fn try_lock(&self) -> Result<(), Error> {
        let caller = task::current_id();
        let _guard = SYNC_LOCK.lock();
        // Safety: as in `lock`.
        let st = unsafe { &mut *self.state.get() };
        if !st.is_valid() {
            return Err(Error::Fail);
        }
        match st.try_acquire(caller)? {
            true => Ok(()),
            false => Err(Error::TaskBusy),
        }
    }

    /// Acquires the mutex, giving up after `ticks` kernel ticks. Zero
    /// ticks degenerates to [`Self::try_lock`].
    pub fn lock_timeout(&self, ticks: u32) -> Result<(), Error> {
        if ticks == 0 {
            return self.try_lock();
        }
        let caller = task::current_id();
        let guard = SYNC_LOCK.lock();
        // Safety: as in `lock`.
        let st = unsafe { &mut *self.state.get() };
        if !st.is_valid() {
            return Err(Error::Fail);
        }
        let acquired =
            with_task_table(|tasks| st.lock_prepare(tasks, caller, ticks))?;
        if acquired {
            return Ok(());
        }
        task::yield_while_blocked(guard);

        // Awake from either an ownership transfer or the tick timeout;
        // the state machine tells which.
        let _guard = SYNC_LOCK.lock();
        // Safety: as in `lock`.
        let st = unsafe { &mut *self.state.get() };
        st.resolve_timed(caller)
    }

    /// Releases the mutex. Only the owner may do this.
    pub fn unlock(&self) -> Result<(), Error> {
        let caller = task::current_id();
        let _guard = SYNC_LOCK.lock();
        // Safety: as in `lock`.
        let st = unsafe { &mut *self.state.get() };
        if !st.is_valid() {
            return Err(Error::Fail);
        }
        with_task_table(|tasks| st.release(tasks, caller))
    }

    /// Destroys the mutex, refusing while it is owned or waited on. A
    /// destroyed mutex stays poisoned.
    pub fn destroy(&self) -> Result<(), Error> {
        let _guard = SYNC_LOCK.lock();
        // Safety: as in `lock`.
        let st = unsafe { &mut *self.state.get() };
        if !st.is_valid() {
            return Err(Error::Fail);
        }
        st.destroy()
    }

    /// Does the calling task hold this mutex?
    pub fn owned_by_current(&self) -> bool {
        let _guard = SYNC_LOCK.lock();
        // Safety: as in `lock`.
        let st = unsafe { &mut *self.state.get() };
        st.is_valid() && st.owner() == task::current_id()
    }

    /// Number of tasks currently blocked on this mutex, or `None` if the
    /// mutex is invalid.
    pub fn waiting_count(&self) -> Option<usize> {
        let _guard = SYNC_LOCK.lock();
        // Safety: as in `lock`.
        let st = unsafe { &mut *self.state.get() };
        st.is_valid().then(|| st.waiting_count())
    }

    /// Magic check, for the condvar's wait precondition.
    pub(crate) fn is_valid(&self) -> bool {
        let _guard = SYNC_LOCK.lock();
        // Safety: as in `lock`.
        unsafe { &*self.state.get() }.is_valid()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::test_support::fixture;
    use crate::task::process_ticks;

    #[test]
    fn uncontended_lock_unlock_restores_initial_state() {
        let mut tasks = fixture(2);
        let mut m = MutexState::new();

        assert_eq!(m.lock_prepare(&mut tasks, 1, 0), Ok(true));
        assert_eq!(m.owner(), 1);
        m.release(&mut tasks, 1).unwrap();

        assert_eq!(m.owner(), TASK_ID_NONE);
        assert_eq!(m.waiting_count(), 0);
        assert!(m.is_valid());
    }

    #[test]
    fn recursive_lock_is_refused_not_deadlocked() {
        let mut tasks = fixture(1);
        let mut m = MutexState::new();
        assert_eq!(m.lock_prepare(&mut tasks, 1, 0), Ok(true));
        assert_eq!(m.lock_prepare(&mut tasks, 1, 0), Err(Error::TaskBusy));
        assert_eq!(m.try_acquire(1), Err(Error::TaskBusy));
    }

    #[test]
    fn fifo_ownership_transfer_is_fair() {
        let mut tasks = fixture(4);
        let mut m = MutexState::new();

        // Task 4 holds the mutex; tasks 1, 2, 3 queue up in order.
        assert_eq!(m.lock_prepare(&mut tasks, 4, 0), Ok(true));
        for id in [1u16, 2, 3] {
            assert_eq!(m.lock_prepare(&mut tasks, id, 0), Ok(false));
            assert_eq!(
                tasks[usize::from(id) - 1].state(),
                TaskState::Blocked
            );
        }
        assert_eq!(m.waiting_count(), 3);

        // Each unlock hands ownership to the earliest blocked waiter,
        // which wakes already owning the mutex; nobody is skipped and
        // nobody owns twice.
        let mut observed = Vec::new();
        for unlocker in [4u16, 1, 2] {
            m.release(&mut tasks, unlocker).unwrap();
            let new_owner = m.owner();
            observed.push(new_owner);
            assert_eq!(
                tasks[usize::from(new_owner) - 1].state(),
                TaskState::Ready
            );
        }
        assert_eq!(observed, vec![1, 2, 3]);

        m.release(&mut tasks, 3).unwrap();
        assert_eq!(m.owner(), TASK_ID_NONE);
        assert_eq!(m.waiting_count(), 0);
    }

    #[test]
    fn unlock_by_non_owner_is_rejected() {
        let mut tasks = fixture(2);
        let mut m = MutexState::new();
        assert_eq!(m.lock_prepare(&mut tasks, 1, 0), Ok(true));
        assert_eq!(m.release(&mut tasks, 2), Err(Error::NotOwner));
        // The mutex is untouched by the failed attempt.
        assert_eq!(m.owner(), 1);
    }

    #[test]
    fn destroy_refuses_while_busy() {
        let mut tasks = fixture(3);
        let mut m = MutexState::new();
        assert_eq!(m.lock_prepare(&mut tasks, 1, 0), Ok(true));

        // Owned: refuse, and stay usable.
        assert_eq!(m.destroy(), Err(Error::TaskBusy));
        assert!(m.is_valid());

        // Owned and waited on: still refuse.
        assert_eq!(m.lock_prepare(&mut tasks, 2, 0), Ok(false));
        assert_eq!(m.destroy(), Err(Error::TaskBusy));

        // Drained: destroy succeeds and poisons.
        m.release(&mut tasks, 1).unwrap();
        m.release(&mut tasks, 2).unwrap();
        assert_eq!(m.destroy(), Ok(()));
        assert!(!m.is_valid());
    }

    #[test]
    fn timed_lock_expires_through_the_tick_path() {
        let mut tasks = fixture(2);
        let mut m = MutexState::new();
        assert_eq!(m.lock_prepare(&mut tasks, 1, 0), Ok(true));
        assert_eq!(m.lock_prepare(&mut tasks, 2, 3), Ok(false));
        assert_eq!(tasks[1].delay(), 3);

        // Three ticks later the sleeper is runnable again...
        for _ in 0..2 {
            let _ = process_ticks(&mut tasks);
            assert_eq!(tasks[1].state(), TaskState::Blocked);
        }
        let _ = process_ticks(&mut tasks);
        assert_eq!(tasks[1].state(), TaskState::Ready);

        // ...and resolves its wake as a timeout, leaving the waiter list.
        assert_eq!(m.resolve_timed(2), Err(Error::Timeout));
        assert_eq!(m.waiting_count(), 0);
        assert_eq!(m.owner(), 1);
    }

    #[test]
    fn timed_lock_wins_when_transfer_beats_the_clock() {
        let mut tasks = fixture(2);
        let mut m = MutexState::new();
        assert_eq!(m.lock_prepare(&mut tasks, 1, 0), Ok(true));
        assert_eq!(m.lock_prepare(&mut tasks, 2, 5), Ok(false));

        m.release(&mut tasks, 1).unwrap();
        // The transfer cleared the pending delay along with the block.
        assert_eq!(tasks[1].delay(), 0);
        assert_eq!(m.resolve_timed(2), Ok(()));
        assert_eq!(m.owner(), 2);
    }

    #[test]
    #[should_panic(expected = "waiter not blocked")]
    fn waiter_table_disagreement_is_fatal() {
        let mut tasks = fixture(2);
        let mut m = MutexState::new();
        assert_eq!(m.lock_prepare(&mut tasks, 1, 0), Ok(true));
        assert_eq!(m.lock_prepare(&mut tasks, 2, 0), Ok(false));
        // Corrupt the relationship behind the mutex's back.
        tasks[1].set_state(TaskState::Ready);
        let _ = m.release(&mut tasks, 1);
    }
}
