// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The system-call gate.
//!
//! U-mode tasks reach the kernel through `ecall`: the number travels in
//! `a7`, up to three arguments in `a0..a2`, and the result comes back in
//! `a0` -- non-negative for success, a negative [`abi::Error`] code
//! otherwise. The saved PC is advanced past the `ecall` before return so
//! the task resumes at the next instruction.
//!
//! An unrecognized number is an error result, not a fault: the gate's
//! contract is a total function over `a7`, and escalation stays reserved
//! for genuinely illegal behavior (which arrives as its own trap cause).

use abi::{Error, Sysnum};

use crate::arch::TrapFrame;
use crate::task::{self, NextTask};
use crate::time;

/// Length in bytes of the `ecall` instruction.
const ECALL_LEN: u32 = 4;

/// Decodes and performs one system call against `frame`, returning the
/// scheduling consequence.
pub(crate) fn dispatch(frame: &mut TrapFrame) -> NextTask {
    frame.mepc = frame.mepc.wrapping_add(ECALL_LEN);

    let (result, hint) = match Sysnum::try_from(frame.a7) {
        Ok(Sysnum::Yield) => (0, NextTask::Other),
        Ok(Sysnum::Tid) => (i32::from(task::current_id()), NextTask::Same),
        Ok(Sysnum::Uptime) => {
            // Truncated to the positive half of i32 so the ABI keeps
            // negative values for errors.
            let ticks = u64::from(time::now()) & 0x7FFF_FFFF;
            (ticks as i32, NextTask::Same)
        }
        Ok(Sysnum::Delay) => {
            let ticks = frame.a0;
            if ticks > 0 {
                task::block_current(ticks);
            }
            (0, NextTask::Other)
        }
        Ok(Sysnum::Exit) => {
            task::exit_current();
            (0, NextTask::Other)
        }
        Err(()) => (Error::Fail.code(), NextTask::Same),
    };

    frame.a0 = result as u32;
    hint
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::startup::{test_boot, with_task_table};
    use crate::task::test_support::TEST_DESC;
    use abi::TaskState;

    fn syscall_frame(num: u32, a0: u32) -> TrapFrame {
        let mut f = TrapFrame::default();
        f.mepc = 0x2000_0000;
        f.a7 = num;
        f.a0 = a0;
        f
    }

    #[test]
    fn tid_reports_current_task() {
        let _guard = crate::arch::test_guard();
        test_boot(&[TEST_DESC]);

        let mut f = syscall_frame(Sysnum::Tid as u32, 0);
        assert_eq!(dispatch(&mut f), NextTask::Same);
        assert_eq!(f.a0, u32::from(crate::task::current_id()));
        assert!(f.a0 > 0, "task ids are positive");
        assert_eq!(f.mepc, 0x2000_0004);
    }

    #[test]
    fn uptime_tracks_the_tick_counter() {
        let _guard = crate::arch::test_guard();
        test_boot(&[TEST_DESC]);

        let mut f = syscall_frame(Sysnum::Uptime as u32, 0);
        let _ = dispatch(&mut f);
        let reported = f.a0;
        crate::time::advance_tick();
        let mut f = syscall_frame(Sysnum::Uptime as u32, 0);
        let _ = dispatch(&mut f);
        assert_eq!(f.a0, reported + 1);
    }

    #[test]
    fn delay_blocks_the_caller_with_its_timeout() {
        let _guard = crate::arch::test_guard();
        test_boot(&[TEST_DESC]);

        let mut f = syscall_frame(Sysnum::Delay as u32, 5);
        assert_eq!(dispatch(&mut f), NextTask::Other);
        with_task_table(|tasks| {
            let cur = crate::task::current_index();
            assert_eq!(tasks[cur].state(), TaskState::Blocked);
            assert_eq!(tasks[cur].delay(), 5);
            // Put it back so later tests find a runnable current task.
            tasks[cur].set_state(TaskState::Running);
            tasks[cur].set_delay(0);
        });
    }

    #[test]
    fn zero_delay_is_just_a_yield() {
        let _guard = crate::arch::test_guard();
        test_boot(&[TEST_DESC]);

        let mut f = syscall_frame(Sysnum::Delay as u32, 0);
        assert_eq!(dispatch(&mut f), NextTask::Other);
        with_task_table(|tasks| {
            let cur = crate::task::current_index();
            assert_ne!(tasks[cur].state(), TaskState::Blocked);
        });
    }

    #[test]
    fn unknown_numbers_error_without_faulting() {
        let _guard = crate::arch::test_guard();
        test_boot(&[TEST_DESC]);

        let mut f = syscall_frame(0xDEAD, 0);
        assert_eq!(dispatch(&mut f), NextTask::Same);
        assert_eq!(f.a0 as i32, Error::Fail.code());
        // The task still resumes past its ecall.
        assert_eq!(f.mepc, 0x2000_0004);
    }

    #[test]
    fn exit_stops_the_caller() {
        let _guard = crate::arch::test_guard();
        test_boot(&[TEST_DESC]);

        let mut f = syscall_frame(Sysnum::Exit as u32, 0);
        assert_eq!(dispatch(&mut f), NextTask::Other);
        with_task_table(|tasks| {
            let cur = crate::task::current_index();
            assert_eq!(tasks[cur].state(), TaskState::Stopped);
            tasks[cur].set_state(TaskState::Running);
        });
    }
}
