// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The trap dispatcher: the Rust half of the exception vector.
//!
//! The entry assembly hands every trap here with a fully materialized
//! frame. The return value is the frame to restore -- the same pointer to
//! resume the interrupted context, a different task's to context-switch.
//!
//! Routing is deliberately small:
//!
//! - timer interrupt: advance the kernel tick, wake expired delays, and
//!   (when preemption is on) reschedule;
//! - environment call from U-mode: the system-call gate;
//! - environment call from M-mode: an explicit yield;
//! - anything else: terminal, recording cause and PC.

use crate::arch::{self, TrapFrame};
use crate::startup::with_task_table;
use crate::syscalls;
use crate::task::{self, NextTask};
use crate::time;

/// Interrupt bit of `mcause`.
pub const MCAUSE_INT: u32 = 1 << 31;
/// Mask extracting the cause code from `mcause`.
pub const MCAUSE_CODE_MASK: u32 = 0x7FFF_FFFF;

/// Machine software interrupt.
pub const IRQ_M_SOFT: u32 = 3;
/// Machine timer interrupt.
pub const IRQ_M_TIMER: u32 = 7;
/// Machine external interrupt.
pub const IRQ_M_EXT: u32 = 11;

/// Environment call from U-mode.
pub const EXC_ECALL_UMODE: u32 = 8;
/// Environment call from M-mode.
pub const EXC_ECALL_MMODE: u32 = 11;

/// Length in bytes of the `ecall` instruction, added to the saved PC so a
/// trapping task resumes past it.
const ECALL_LEN: u32 = 4;

/// Dispatches one trap. Called from the entry assembly with interrupts
/// masked; `frame` is the just-saved context of whatever was interrupted.
///
/// # Safety
///
/// `frame` must point at a fully written trap frame that stays valid for
/// the duration of the call. Only the entry assembly can really promise
/// that; nothing else should call this.
#[no_mangle]
pub unsafe extern "C" fn trap_entry(
    cause: u32,
    epc: u32,
    frame: *mut TrapFrame,
) -> *mut TrapFrame {
    // Safety: per our contract, the frame is valid and unaliased.
    let f = unsafe { &mut *frame };

    if cause & MCAUSE_INT != 0 {
        match cause & MCAUSE_CODE_MASK {
            IRQ_M_TIMER => {
                arch::timer_rearm();
                time::advance_tick();
                let hint = with_task_table(task::process_ticks);
                if task::preemptive() {
                    task::schedule(frame, hint)
                } else {
                    // Cooperative mode: wakes take effect at the next
                    // explicit yield.
                    frame
                }
            }
            code => panic!("unhandled interrupt {code}, epc={epc:#010x}"),
        }
    } else {
        match cause & MCAUSE_CODE_MASK {
            EXC_ECALL_UMODE => {
                // The gate advances the saved PC past the ecall itself.
                match syscalls::dispatch(f) {
                    NextTask::Same => frame,
                    hint => task::schedule(frame, hint),
                }
            }
            EXC_ECALL_MMODE => {
                // ecall from kernel-mode task context is the yield
                // primitive.
                f.mepc = f.mepc.wrapping_add(ECALL_LEN);
                task::schedule(frame, NextTask::Other)
            }
            code => panic!(
                "unhandled exception {code}, epc={epc:#010x}, cause={cause:#010x}"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{MSTATUS_MPIE, MSTATUS_MPP_MACH, MSTATUS_MPP_USER};
    use crate::startup::test_boot;
    use crate::task::test_support::TEST_DESC;
    use abi::{Sysnum, TaskState};

    fn mmode_frame(mepc: u32) -> TrapFrame {
        let mut f = TrapFrame::default();
        f.mepc = mepc;
        f.mstatus = MSTATUS_MPIE | MSTATUS_MPP_MACH;
        f
    }

    #[test]
    fn mmode_ecall_switches_away_and_skips_the_instruction() {
        let _guard = crate::arch::test_guard();
        test_boot(&[TEST_DESC, TEST_DESC]);

        let mut f = mmode_frame(0x8000_0200);
        let cause = EXC_ECALL_MMODE;
        let next =
            unsafe { trap_entry(cause, f.mepc, core::ptr::addr_of_mut!(f)) };

        // The yielder resumes after its ecall when it next runs.
        assert_eq!(f.mepc, 0x8000_0204);

        crate::startup::with_task_table(|tasks| {
            // The idle task (previous current) went back to ready with its
            // frame captured; an application task is now running and its
            // frame is what gets restored.
            assert_eq!(tasks[0].state(), TaskState::Ready);
            assert_eq!(
                tasks[0].save().frame,
                core::ptr::addr_of_mut!(f) as usize
            );
            let running = tasks
                .iter()
                .position(|t| t.state() == TaskState::Running)
                .unwrap();
            assert_ne!(running, 0);
            assert_eq!(tasks[running].save().frame, next as usize);
        });
    }

    #[test]
    fn timer_tick_without_preemption_resumes_interrupted_context() {
        let _guard = crate::arch::test_guard();
        test_boot(&[TEST_DESC]);
        crate::task::set_preemptive(false);

        let before = u64::from(crate::time::now());
        let mut f = mmode_frame(0x8000_0300);
        let cause = MCAUSE_INT | IRQ_M_TIMER;
        let back =
            unsafe { trap_entry(cause, f.mepc, core::ptr::addr_of_mut!(f)) };

        assert_eq!(back, core::ptr::addr_of_mut!(f));
        assert_eq!(u64::from(crate::time::now()), before + 1);
        // No syscall here: the PC is untouched.
        assert_eq!(f.mepc, 0x8000_0300);
    }

    #[test]
    fn timer_tick_wakes_delayed_task_and_preempts() {
        let _guard = crate::arch::test_guard();
        test_boot(&[TEST_DESC, TEST_DESC]);
        crate::task::set_preemptive(true);

        // Park task 2 on a one-tick delay and make it the only ready
        // candidate.
        crate::startup::with_task_table(|tasks| {
            tasks[1].set_state(TaskState::Blocked);
            tasks[1].set_delay(1);
            tasks[2].set_state(TaskState::Stopped);
        });

        let mut f = mmode_frame(0x8000_0400);
        let cause = MCAUSE_INT | IRQ_M_TIMER;
        let next =
            unsafe { trap_entry(cause, f.mepc, core::ptr::addr_of_mut!(f)) };

        crate::startup::with_task_table(|tasks| {
            assert_eq!(tasks[1].state(), TaskState::Running);
            assert_eq!(tasks[1].delay(), 0);
            assert_eq!(tasks[1].save().frame, next as usize);
        });
        crate::task::set_preemptive(false);
    }

    #[test]
    fn umode_syscall_returns_to_same_task() {
        let _guard = crate::arch::test_guard();
        test_boot(&[TEST_DESC]);

        let mut f = TrapFrame::default();
        f.mepc = 0x2000_0100;
        f.mstatus = MSTATUS_MPIE | MSTATUS_MPP_USER;
        f.a7 = Sysnum::Tid as u32;
        let back = unsafe {
            trap_entry(EXC_ECALL_UMODE, f.mepc, core::ptr::addr_of_mut!(f))
        };

        assert_eq!(back, core::ptr::addr_of_mut!(f));
        // Result lands in a0 and the saved PC steps past the ecall.
        assert_eq!(f.a0, u32::from(crate::task::current_id()));
        assert_eq!(f.mepc, 0x2000_0104);
    }
}
