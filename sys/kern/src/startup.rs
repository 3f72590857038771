// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup and the task-table singleton.

use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use abi::TaskState;

use crate::arch;
use crate::descs::{TaskDesc, TaskFlags};
use crate::pmp;
use crate::task::{self, Task, MAX_TASKS};

/// Set while somebody holds the `&mut [Task]` lent out by
/// `with_task_table`. The table is a singleton and the borrow checker
/// can't see across the trap boundary, so this flag is what guarantees at
/// most one live reference exists: a second entry while it is set is a
/// kernel bug and panics rather than aliasing.
///
/// It starts out `true` -- before the entries have been written there is
/// nothing safe to lend -- and table initialization clears it as its last
/// step.
static TASK_TABLE_IN_USE: AtomicBool = AtomicBool::new(true);

/// Number of live entries in the table, idle task included.
static TASK_COUNT: AtomicUsize = AtomicUsize::new(0);

static mut TASK_TABLE_SPACE: [MaybeUninit<Task>; MAX_TASKS] =
    [const { MaybeUninit::uninit() }; MAX_TASKS];

/// Scheduling options chosen by the application.
#[derive(Copy, Clone, Debug)]
pub struct Options {
    /// Whether the timer interrupt may preempt at trap boundaries. Off,
    /// the kernel only switches at explicit yields and blocking calls.
    pub preemptive: bool,
    /// Machine timer ticks per kernel tick.
    pub tick_divisor: u32,
}

/// Priority of the built-in idle task: less important than anything an
/// application can express.
const IDLE_PRIORITY: u8 = u8::MAX;

#[repr(C, align(16))]
struct IdleStack([u8; 512]);

static mut IDLE_STACK: IdleStack = IdleStack([0; 512]);

/// The idle task: hand the CPU away, then sleep until something happens.
/// This is the first task dispatched at boot, so the highest-priority ready
/// task runs as soon as the kernel is live.
extern "C" fn idle_main() -> ! {
    loop {
        task::yield_now();
        arch::wait_for_interrupt();
    }
}

fn idle_desc() -> TaskDesc {
    // Safety: only the address is taken; the stack contents belong to the
    // idle task once it runs.
    let stack_base = unsafe { core::ptr::addr_of!(IDLE_STACK) as usize };
    TaskDesc {
        entry_point: idle_main as usize as u32,
        initial_stack: (stack_base + core::mem::size_of::<IdleStack>()) as u32,
        kernel_stack: 0,
        priority: IDLE_PRIORITY,
        flags: TaskFlags::START_AT_BOOT,
    }
}

/// Populates the task table: the idle task in slot 0, the application's
/// descriptors after it, every entry with a freshly built initial frame.
fn initialize_task_table(app_tasks: &[TaskDesc]) {
    assert!(
        app_tasks.len() + 1 <= MAX_TASKS,
        "too many tasks for the table"
    );

    TASK_TABLE_IN_USE.store(true, Ordering::Release);

    // Safety: the in-use flag is held, so nothing else is looking at the
    // storage while we (re)write it. Task has no Drop, so overwriting
    // stale entries is fine.
    let space = unsafe { &mut *core::ptr::addr_of_mut!(TASK_TABLE_SPACE) };

    let idle = idle_desc();
    space[0].write(Task::from_descriptor(&idle, 0));
    for (i, desc) in app_tasks.iter().enumerate() {
        space[i + 1].write(Task::from_descriptor(desc, i + 1));
    }
    TASK_COUNT.store(app_tasks.len() + 1, Ordering::Release);

    // Safety: every entry up to TASK_COUNT was just initialized.
    let tasks = unsafe { table_slice() };
    for t in tasks.iter_mut() {
        arch::reinitialize(t);
    }

    TASK_TABLE_IN_USE.store(false, Ordering::Release);
}

/// Produces the live window of the task table.
///
/// # Safety
///
/// Caller must hold the in-use flag (or otherwise be certain no other
/// reference exists) and the entries must have been initialized.
unsafe fn table_slice() -> &'static mut [Task] {
    let space = &mut *core::ptr::addr_of_mut!(TASK_TABLE_SPACE);
    core::slice::from_raw_parts_mut(
        space.as_mut_ptr().cast::<Task>(),
        TASK_COUNT.load(Ordering::Acquire),
    )
}

/// Lends the task table to `body` as the one live `&mut [Task]`.
///
/// Interrupts are masked for the duration, and a nested call trips the
/// in-use flag and panics, so the exclusive borrow really is exclusive.
pub(crate) fn with_task_table<R>(body: impl FnOnce(&mut [Task]) -> R) -> R {
    let irq_token = arch::irq_save();
    if TASK_TABLE_IN_USE.swap(true, Ordering::Acquire) {
        panic!("recursive task table access");
    }
    // Safety: we have observed the flag being false, so the table is
    // initialized and nothing else holds a reference.
    let tasks = unsafe { table_slice() };

    let r = body(tasks);

    TASK_TABLE_IN_USE.store(false, Ordering::Release);
    arch::irq_restore(irq_token);
    r
}

/// The main kernel entry point.
///
/// An application provides its own `main`, does whatever board setup it
/// needs (console hooks included), and calls this with its task
/// descriptors. This initializes memory protection from the standard
/// kernel pools, builds the task table, and dispatches the idle task --
/// which immediately yields to the most important ready application task.
///
/// # Safety
///
/// Must be called exactly once, from the boot path, on the boot stack,
/// with interrupts masked.
pub unsafe fn start_kernel(app_tasks: &[TaskDesc], options: Options) -> ! {
    pmp::with_config(|cfg| cfg.init_kernel())
        .unwrap_or_else(|_| panic!("cannot configure kernel memory pools"));

    task::set_preemptive(options.preemptive);
    initialize_task_table(app_tasks);

    with_task_table(|tasks| {
        tasks[0].set_state(TaskState::Running);
        task::set_current(0, &tasks[0]);
    });

    // Safety: the in-use flag is clear and nothing will touch the table
    // until the first trap; the reference is consumed by the launch, which
    // only reads the frame pointer and never returns.
    let first = &mut table_slice()[0];
    arch::start_first_task(options.tick_divisor, options.preemptive, first)
}

/// Test-only boot: builds the global table from `app_tasks` and seeds the
/// idle task as current, without dispatching anything. Callers serialize
/// via `arch::test_guard`.
#[cfg(test)]
pub(crate) fn test_boot(app_tasks: &[TaskDesc]) {
    initialize_task_table(app_tasks);
    with_task_table(|tasks| {
        tasks[0].set_state(TaskState::Running);
        task::set_current(0, &tasks[0]);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::test_support::TEST_DESC;

    #[test]
    fn boot_builds_idle_plus_apps() {
        let _guard = crate::arch::test_guard();
        test_boot(&[TEST_DESC, TEST_DESC]);

        with_task_table(|tasks| {
            assert_eq!(tasks.len(), 3);
            // Slot 0 is the kernel's idle task, seeded as current.
            assert_eq!(tasks[0].state(), TaskState::Running);
            assert_eq!(tasks[0].priority().0, IDLE_PRIORITY);
            assert_eq!(tasks[0].id(), 1);
            // Application tasks follow, ready to run, with frames built.
            for t in &tasks[1..] {
                assert_eq!(t.state(), TaskState::Ready);
                assert_ne!(t.save().frame, 0);
            }
        });
        assert_eq!(task::current_index(), 0);
    }

    #[test]
    #[should_panic(expected = "recursive task table access")]
    fn recursive_table_access_is_fatal() {
        let _guard = crate::arch::test_guard();
        test_boot(&[TEST_DESC]);
        with_task_table(|_| {
            with_task_table(|_| ());
        });
    }
}
