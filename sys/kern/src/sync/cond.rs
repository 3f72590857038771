// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Condition variables.
//!
//! A waiter is always associated with a mutex it holds on entry. `wait`
//! enqueues the caller and marks it blocked *before* releasing that mutex,
//! which closes the classic lost-wakeup window: a signal issued between
//! the unlock and the sleep still finds the waiter on the list. On wake --
//! whether by signal or by tick timeout -- the mutex is re-acquired before
//! returning, so the caller always comes back holding it.

use core::cell::UnsafeCell;

use abi::{Error, TaskId, TaskState};
use waitq::Queue;

use super::{Mutex, COND_MAGIC, POISON_MAGIC, SYNC_LOCK};
use crate::startup::with_task_table;
use crate::task::{self, Task, MAX_TASKS};

pub struct Condvar {
    state: UnsafeCell<CondState>,
}

// Safety: all access to the inner state happens under SYNC_LOCK with
// interrupts masked.
unsafe impl Sync for Condvar {}

pub(crate) struct CondState {
    magic: u32,
    waiters: Queue<TaskId, MAX_TASKS>,
}

fn waiter_index(tasks: &[Task], id: TaskId) -> usize {
    let idx = usize::from(
        id.checked_sub(1).unwrap_or_else(|| panic!("invalid waiter id")),
    );
    if idx >= tasks.len() {
        panic!("invalid waiter id");
    }
    idx
}

impl CondState {
    pub(crate) const fn new() -> Self {
        Self {
            magic: COND_MAGIC,
            waiters: Queue::new(),
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.magic == COND_MAGIC
    }

    pub(crate) fn waiting_count(&self) -> usize {
        self.waiters.len()
    }

    /// Registers `caller` as a blocked waiter, with `delay` ticks of
    /// timeout (0 for indefinite).
    pub(crate) fn enqueue(
        &mut self,
        tasks: &mut [Task],
        caller: TaskId,
        delay: u32,
    ) {
        if self.waiters.push_back(caller).is_err() {
            panic!("cond waiter overflow");
        }
        let t = &mut tasks[waiter_index(tasks, caller)];
        t.set_state(TaskState::Blocked);
        t.set_delay(delay);
    }

    /// Removes `caller` from the waiter list if it is still there,
    /// reporting whether it was -- i.e. whether a wake was a timeout
    /// rather than a signal.
    pub(crate) fn take_self(&mut self, caller: TaskId) -> bool {
        self.waiters.remove_first(|&w| w == caller).is_some()
    }

    /// Wakes the head waiter, if any.
    pub(crate) fn signal(&mut self, tasks: &mut [Task]) {
        if let Some(waiter) = self.waiters.pop_front() {
            let t = &mut tasks[waiter_index(tasks, waiter)];
            if t.state() != TaskState::Blocked {
                panic!("cond waiter not blocked");
            }
            t.set_delay(0);
            t.set_state(TaskState::Ready);
        }
    }

    /// Wakes every waiter, in FIFO order.
    pub(crate) fn broadcast(&mut self, tasks: &mut [Task]) {
        while !self.waiters.is_empty() {
            self.signal(tasks);
        }
    }

    pub(crate) fn destroy(&mut self) -> Result<(), Error> {
        if !self.waiters.is_empty() {
            return Err(Error::TaskBusy);
        }
        self.magic = POISON_MAGIC;
        Ok(())
    }
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            state: UnsafeCell::new(CondState::new()),
        }
    }

    /// Atomically releases `mutex` and sleeps until signaled; re-acquires
    /// `mutex` before returning. The caller must hold `mutex`.
    pub fn wait(&self, mutex: &Mutex) -> Result<(), Error> {
        self.wait_inner(mutex, 0).map(|_| ())
    }

    /// Like [`Self::wait`], but gives up after `ticks` kernel ticks. On
    /// timeout the return is `Err(Timeout)` -- with the mutex held, like
    /// every other return from a wait.
    pub fn wait_timeout(
        &self,
        mutex: &Mutex,
        ticks: u32,
    ) -> Result<(), Error> {
        if ticks == 0 {
            return Err(Error::Timeout);
        }
        match self.wait_inner(mutex, ticks)? {
            true => Err(Error::Timeout),
            false => Ok(()),
        }
    }

    /// Common wait path. Returns whether the wake was a timeout.
    fn wait_inner(&self, mutex: &Mutex, delay: u32) -> Result<bool, Error> {
        let caller = task::current_id();
        {
            let _guard = SYNC_LOCK.lock();
            // Safety: SYNC_LOCK serializes all access to the inner state.
            let st = unsafe { &mut *self.state.get() };
            if !st.is_valid() {
                panic!("wait on invalid condvar");
            }
        }
        if !mutex.is_valid() {
            panic!("wait with invalid mutex");
        }
        if !mutex.owned_by_current() {
            return Err(Error::NotOwner);
        }

        // Register as a waiter and block before the mutex is released, so
        // no signal can slip by unseen.
        {
            let guard = SYNC_LOCK.lock();
            // Safety: as above.
            let st = unsafe { &mut *self.state.get() };
            with_task_table(|tasks| st.enqueue(tasks, caller, delay));
            drop(guard);
        }

        if let Err(e) = mutex.unlock() {
            // Back out: we never slept, so un-register and run on.
            let _guard = SYNC_LOCK.lock();
            // Safety: as above.
            let st = unsafe { &mut *self.state.get() };
            st.take_self(caller);
            with_task_table(|tasks| {
                let idx = waiter_index(tasks, caller);
                tasks[idx].set_delay(0);
                tasks[idx].set_state(TaskState::Running);
            });
            return Err(e);
        }

        task::yield_now();

        // Awake. Still being enqueued means the delay expired; a signal
        // would have removed us.
        let timed_out = {
            let _guard = SYNC_LOCK.lock();
            // Safety: as above.
            let st = unsafe { &mut *self.state.get() };
            st.take_self(caller)
        };

        // Re-acquire the mutex whatever the wake reason was.
        mutex.lock()?;
        Ok(timed_out)
    }

    /// Wakes the longest-waiting task, if any.
    pub fn signal(&self) -> Result<(), Error> {
        let _guard = SYNC_LOCK.lock();
        // Safety: as above.
        let st = unsafe { &mut *self.state.get() };
        if !st.is_valid() {
            return Err(Error::Fail);
        }
        with_task_table(|tasks| st.signal(tasks));
        Ok(())
    }

    /// Wakes every waiter.
    pub fn broadcast(&self) -> Result<(), Error> {
        let _guard = SYNC_LOCK.lock();
        // Safety: as above.
        let st = unsafe { &mut *self.state.get() };
        if !st.is_valid() {
            return Err(Error::Fail);
        }
        with_task_table(|tasks| st.broadcast(tasks));
        Ok(())
    }

    /// Destroys the condvar, refusing while anything waits on it.
    pub fn destroy(&self) -> Result<(), Error> {
        let _guard = SYNC_LOCK.lock();
        // Safety: as above.
        let st = unsafe { &mut *self.state.get() };
        if !st.is_valid() {
            return Err(Error::Fail);
        }
        st.destroy()
    }

    /// Number of tasks currently waiting, or `None` if the condvar is
    /// invalid.
    pub fn waiting_count(&self) -> Option<usize> {
        let _guard = SYNC_LOCK.lock();
        // Safety: as above.
        let st = unsafe { &mut *self.state.get() };
        st.is_valid().then(|| st.waiting_count())
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::super::mutex::MutexState;
    use super::*;
    use crate::task::process_ticks;
    use crate::task::test_support::fixture;

    #[test]
    fn signal_wakes_in_fifo_order() {
        let mut tasks = fixture(3);
        let mut c = CondState::new();
        for id in [1u16, 2, 3] {
            c.enqueue(&mut tasks, id, 0);
        }
        assert_eq!(c.waiting_count(), 3);

        c.signal(&mut tasks);
        assert_eq!(tasks[0].state(), TaskState::Ready);
        assert_eq!(tasks[1].state(), TaskState::Blocked);

        c.signal(&mut tasks);
        assert_eq!(tasks[1].state(), TaskState::Ready);
        assert_eq!(tasks[2].state(), TaskState::Blocked);
        assert_eq!(c.waiting_count(), 1);
    }

    #[test]
    fn broadcast_drains_everyone() {
        let mut tasks = fixture(3);
        let mut c = CondState::new();
        for id in [1u16, 2, 3] {
            c.enqueue(&mut tasks, id, 5);
        }
        c.broadcast(&mut tasks);
        assert_eq!(c.waiting_count(), 0);
        for t in &tasks {
            assert_eq!(t.state(), TaskState::Ready);
            // Wakes cancel any armed timeout.
            assert_eq!(t.delay(), 0);
        }
    }

    #[test]
    fn signal_on_empty_list_is_quiet() {
        let mut tasks = fixture(1);
        let mut c = CondState::new();
        c.signal(&mut tasks);
        assert_eq!(c.waiting_count(), 0);
    }

    #[test]
    fn timed_wait_expires_and_still_reacquires() {
        let mut tasks = fixture(2);
        let mut m = MutexState::new();
        let mut c = CondState::new();

        // Task 1 holds the mutex and waits with a three-tick timeout,
        // releasing the mutex as it goes to sleep. No signaller exists.
        assert_eq!(m.lock_prepare(&mut tasks, 1, 0), Ok(true));
        c.enqueue(&mut tasks, 1, 3);
        m.release(&mut tasks, 1).unwrap();

        for _ in 0..3 {
            let _ = process_ticks(&mut tasks);
        }
        assert_eq!(tasks[0].state(), TaskState::Ready);

        // The waiter observes the wake as a timeout...
        assert!(c.take_self(1));
        assert_eq!(c.waiting_count(), 0);
        // ...and the re-lock succeeds, so the caller ends up owning the
        // mutex even on the timeout path.
        assert_eq!(m.lock_prepare(&mut tasks, 1, 0), Ok(true));
        assert_eq!(m.owner(), 1);
    }

    #[test]
    fn signal_beats_timeout() {
        let mut tasks = fixture(2);
        let mut c = CondState::new();
        c.enqueue(&mut tasks, 2, 10);
        c.signal(&mut tasks);
        // A signalled waiter is off the list; its wake is not a timeout.
        assert!(!c.take_self(2));
        assert_eq!(tasks[1].delay(), 0);
    }

    #[test]
    fn destroy_refuses_with_waiters() {
        let mut tasks = fixture(1);
        let mut c = CondState::new();
        c.enqueue(&mut tasks, 1, 0);
        assert_eq!(c.destroy(), Err(Error::TaskBusy));
        assert!(c.is_valid());

        c.broadcast(&mut tasks);
        assert_eq!(c.destroy(), Ok(()));
        assert!(!c.is_valid());
    }
}
