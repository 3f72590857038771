// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks and the scheduler surface the rest of the kernel
//! consumes.
//!
//! Scheduling is priority-ordered round-robin: `select` scans the table
//! starting after the previously running slot and takes the most important
//! runnable task, so equal-priority tasks take turns. A task leaves the
//! runnable set by blocking on a primitive (state `Blocked`, optionally
//! with a tick delay for timeouts), by stopping, or by being preempted back
//! to `Ready` at a trap boundary.
//!
//! The table itself lives in `startup`; everything here operates on the
//! `&mut [Task]` it lends out.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use abi::{Priority, TaskId, TaskState};

use crate::arch::{self, TrapFrame};
use crate::descs::{TaskDesc, TaskFlags};
use crate::memprot;
use crate::spinlock::SpinGuard;
use crate::startup::with_task_table;

/// Capacity of the task table, including the kernel's idle task.
pub const MAX_TASKS: usize = 16;

/// Internal representation of a task.
#[repr(C)]
#[derive(Debug)]
pub struct Task {
    /// Saved machine state of the task. Debug tooling assumes a fixed
    /// offset for this, which is why the struct is `repr(C)` and this
    /// field stays at the front.
    save: arch::SavedState,
    /// Current priority of the task.
    priority: Priority,
    /// State used to make scheduling decisions.
    state: TaskState,
    /// Remaining tick delay of a timed block; 0 means no timeout armed.
    delay: u32,
    /// 1-based id handed to synchronization primitives and syscalls.
    id: TaskId,
    /// Memory space applied on switch-in, if the task has one.
    memspace: Option<memprot::AsId>,
    /// Descriptor used to create this task, kept for restart.
    descriptor: TaskDesc,
}

impl Task {
    /// Builds a fresh task out of `descriptor`, runnable immediately only
    /// if its flags say to start at boot. `index` is the task's slot in
    /// the table; ids are the slot plus one so that 0 stays the "no task"
    /// sentinel.
    pub fn from_descriptor(descriptor: &TaskDesc, index: usize) -> Self {
        Task {
            save: arch::SavedState::default(),
            priority: Priority(descriptor.priority),
            state: if descriptor.flags.contains(TaskFlags::START_AT_BOOT) {
                TaskState::Ready
            } else {
                TaskState::Stopped
            },
            delay: 0,
            id: (index + 1) as TaskId,
            memspace: None,
            descriptor: *descriptor,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    pub fn delay(&self) -> u32 {
        self.delay
    }

    pub(crate) fn set_delay(&mut self, ticks: u32) {
        self.delay = ticks;
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn descriptor(&self) -> &TaskDesc {
        &self.descriptor
    }

    pub fn memspace(&self) -> Option<memprot::AsId> {
        self.memspace
    }

    /// Binds a memory space to this task; it is loaded into the PMP every
    /// time the task is switched in.
    pub fn bind_memspace(&mut self, as_id: memprot::AsId) {
        self.memspace = Some(as_id);
    }

    /// Whether the scheduler may hand this task the CPU.
    pub fn is_runnable(&self) -> bool {
        matches!(self.state, TaskState::Ready)
    }

    /// Puts the task back the way boot left it: timers cancelled, state
    /// `Stopped`, a fresh initial frame at its stack top. Whoever asked
    /// for the reset decides if and when it runs again.
    pub fn reinitialize(&mut self) {
        self.delay = 0;
        self.state = TaskState::Stopped;
        arch::reinitialize(self);
    }

    /// The task's saved machine state.
    pub fn save(&self) -> &arch::SavedState {
        &self.save
    }

    /// The task's saved machine state, mutably.
    pub fn save_mut(&mut self) -> &mut arch::SavedState {
        &mut self.save
    }
}

/// Scheduling consequence of an operation that may have woken or parked
/// tasks. `must_use`: an ignored hint is a wakeup that silently never takes
/// effect.
#[derive(Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextTask {
    /// The interrupted task can keep the CPU.
    Same,
    /// Somebody else should run, but picking whom is the scheduler's job.
    Other,
    /// A particular slot became runnable and is the obvious candidate,
    /// subject to the usual priority rules.
    Specific(usize),
}

impl NextTask {
    /// Merges two scheduling suggestions into one. Agreement passes
    /// through; two different `Specific` targets cancel down to `Other`
    /// (someone has to arbitrate, and that someone is the scheduler); a
    /// lone `Specific` beats the vaguer answers; and any request to switch
    /// outweighs `Same`.
    pub fn combine(self, other: Self) -> Self {
        use NextTask::*;

        match (self, other) {
            (x, y) if x == y => x,
            (Specific(_), Specific(_)) => Other,
            (Specific(x), _) | (_, Specific(x)) => Specific(x),
            (Other, _) | (_, Other) => Other,
            (Same, Same) => Same,
        }
    }
}

/// Walks the whole table looking for the best task matching `pred`.
///
/// "Best" means the most important priority among the matches; between
/// equally important matches, the one reached first when stepping forward
/// from the slot after `previous` (wrapping at the end of the table). That
/// tie-break is what turns a plain priority pick into round-robin: calling
/// this with the slot that just ran hands equal-priority peers the CPU in
/// turn. Returns `None` when nothing matches.
pub fn priority_scan(
    previous: usize,
    tasks: &[Task],
    pred: impl Fn(&Task) -> bool,
) -> Option<usize> {
    let mut slot = previous;
    let mut best: Option<(usize, Priority)> = None;
    for _ in 0..tasks.len() {
        slot += 1;
        if slot >= tasks.len() {
            slot = 0;
        }
        let t = &tasks[slot];
        if !pred(t) {
            continue;
        }

        if let Some((_, best_prio)) = best {
            if !t.priority.is_more_important_than(best_prio) {
                continue;
            }
        }

        best = Some((slot, t.priority));
    }

    best.map(|(slot, _)| slot)
}

/// Picks the task to run after the one in slot `previous`: the most
/// important runnable task, equal priorities served round-robin.
///
/// A table with nothing runnable is unrecoverable -- the idle task exists
/// precisely so this can't happen in a healthy system -- so that case
/// panics.
pub fn select(previous: usize, tasks: &[Task]) -> usize {
    match priority_scan(previous, tasks, |t| t.is_runnable()) {
        Some(index) => index,
        None => panic!("no runnable tasks"),
    }
}

/// Processes tick delays: every blocked task with a pending delay counts
/// down one tick, and tasks reaching zero wake to `Ready`. Ties between
/// tasks waking on the same tick fall to the scheduler's priority order.
pub fn process_ticks(tasks: &mut [Task]) -> NextTask {
    let mut sched_hint = NextTask::Same;
    for (index, task) in tasks.iter_mut().enumerate() {
        if task.state == TaskState::Blocked && task.delay > 0 {
            task.delay -= 1;
            if task.delay == 0 {
                task.state = TaskState::Ready;
                sched_hint = sched_hint.combine(NextTask::Specific(index));
            }
        }
    }
    sched_hint
}

/// Index of the task currently holding the CPU. Seeded to the idle task's
/// slot before the first dispatch.
static CURRENT_TASK: AtomicUsize = AtomicUsize::new(0);

/// True between `process_ticks` passes while preemption is enabled; set by
/// startup from the application's scheduling options.
static PREEMPTIVE: AtomicBool = AtomicBool::new(false);

pub(crate) fn set_preemptive(on: bool) {
    PREEMPTIVE.store(on, Ordering::Relaxed);
}

pub(crate) fn preemptive() -> bool {
    PREEMPTIVE.load(Ordering::Relaxed)
}

pub fn current_index() -> usize {
    CURRENT_TASK.load(Ordering::Relaxed)
}

/// Returns the current task's 1-based id.
pub fn current_id() -> TaskId {
    (current_index() + 1) as TaskId
}

/// Records `index` as the current task and arms the architecture's
/// kernel-stack pointer for it.
pub(crate) fn set_current(index: usize, task: &Task) {
    CURRENT_TASK.store(index, Ordering::Relaxed);
    arch::set_current_kstack(task.descriptor().kernel_stack);
}

/// The context-switch engine's Rust half: saves the interrupted frame into
/// the current task, picks a successor, makes its memory space resident and
/// returns its frame for the restore path.
///
/// `hint` carries a scheduling suggestion from whatever woke tasks up; a
/// `Specific` hint still defers to priority if a more important task is
/// runnable (the scan handles that naturally, so the hint only short-cuts
/// the common case).
pub(crate) fn schedule(
    frame: *mut TrapFrame,
    hint: NextTask,
) -> *mut TrapFrame {
    with_task_table(|tasks| {
        let cur = current_index();
        tasks[cur].save.frame = frame as usize;
        if tasks[cur].state == TaskState::Running {
            tasks[cur].state = TaskState::Ready;
        }

        let hinted = match hint {
            NextTask::Specific(i) if tasks[i].is_runnable() => Some(i),
            _ => None,
        };
        let next = match hinted {
            Some(i) => {
                let p = tasks[i].priority;
                let outranked = tasks.iter().any(|t| {
                    t.is_runnable() && t.priority.is_more_important_than(p)
                });
                if outranked {
                    select(cur, tasks)
                } else {
                    i
                }
            }
            None => select(cur, tasks),
        };

        tasks[next].state = TaskState::Running;
        if let Some(as_id) = tasks[next].memspace {
            // A space that fails to activate would leave the task running
            // without its protection view; that is not recoverable.
            memprot::activate_space(as_id)
                .unwrap_or_else(|_| panic!("cannot activate memory space"));
        }
        set_current(next, &tasks[next]);
        tasks[next].save.frame as *mut TrapFrame
    })
}

/// Marks the current task blocked, with `delay` ticks of timeout (0 for
/// none). The caller still holds whatever subsystem lock protects the
/// waiter list; yield afterwards via [`yield_while_blocked`].
pub(crate) fn block_current(delay: u32) {
    with_task_table(|tasks| {
        let cur = current_index();
        tasks[cur].state = TaskState::Blocked;
        tasks[cur].delay = delay;
    });
}

/// Stops the current task permanently.
pub fn exit_current() {
    with_task_table(|tasks| {
        let cur = current_index();
        tasks[cur].state = TaskState::Stopped;
        tasks[cur].delay = 0;
    });
}

/// The scheduler primitive behind every blocking operation: the caller has
/// already flipped itself to `Blocked` (and enqueued itself on a waiter
/// list) *under* `guard`; this releases the guard and gives up the CPU.
/// Registration-before-release is what closes the lost-wakeup window -- a
/// wakeup arriving between the release and the yield finds the task already
/// on the list and simply makes it runnable again.
pub fn yield_while_blocked<T>(guard: SpinGuard<'_, T>) {
    drop(guard);
    arch::yield_now();
}

/// Voluntarily gives up the CPU.
pub fn yield_now() {
    arch::yield_now();
}

/// Blocks the calling task for `ticks` kernel ticks. Zero just yields.
pub fn sleep(ticks: u32) {
    if ticks > 0 {
        block_current(ticks);
    }
    arch::yield_now();
}

/// Landing point for an M-mode task entry function that returns: the task
/// is retired and the CPU handed on.
pub(crate) extern "C" fn task_exited() -> ! {
    exit_current();
    loop {
        arch::yield_now();
        arch::wait_for_interrupt();
    }
}
