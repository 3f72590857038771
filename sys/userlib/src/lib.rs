// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Userlib: the task-side view of the kernel.
//!
//! U-mode tasks reach the kernel exclusively through the `ecall`
//! instruction. The calling convention matches the kernel's gate: the
//! system call number in `a7`, up to three arguments in `a0..a2`, and the
//! result back in `a0`, negative values being [`abi::Error`] codes.
//!
//! The raw [`syscall`] wrapper is public for calls the typed wrappers
//! don't cover; prefer the `sys_*` functions.

#![no_std]

pub use abi::{result_from_code, Error, Sysnum, TaskId};

/// Performs one system call.
#[cfg(target_arch = "riscv32")]
#[inline]
pub fn syscall(num: u32, arg0: u32, arg1: u32, arg2: u32) -> i32 {
    let ret: u32;
    unsafe {
        core::arch::asm!(
            "ecall",
            inlateout("a0") arg0 => ret,
            in("a1") arg1,
            in("a2") arg2,
            in("a7") num,
            options(nostack),
        );
    }
    ret as i32
}

/// Stub for non-RV32 builds so dependents type-check on the host. There is
/// no kernel to call into there.
#[cfg(not(target_arch = "riscv32"))]
pub fn syscall(_num: u32, _arg0: u32, _arg1: u32, _arg2: u32) -> i32 {
    unimplemented!("system calls require the RV32 target")
}

/// Gives up the CPU; the scheduler picks the next runnable task.
pub fn sys_yield() {
    let _ = syscall(Sysnum::Yield as u32, 0, 0, 0);
}

/// Returns the calling task's id. Always positive on a live kernel.
pub fn sys_tid() -> i32 {
    syscall(Sysnum::Tid as u32, 0, 0, 0)
}

/// Returns the kernel tick count, truncated to the positive `i32` range.
pub fn sys_uptime() -> i32 {
    syscall(Sysnum::Uptime as u32, 0, 0, 0)
}

/// Blocks the calling task for `ticks` kernel ticks.
pub fn sys_delay(ticks: u32) -> i32 {
    syscall(Sysnum::Delay as u32, ticks, 0, 0)
}

/// Stops the calling task. Does not return; if the kernel somehow hands
/// the CPU back, the task just re-requests its exit.
pub fn sys_exit() -> ! {
    loop {
        let _ = syscall(Sysnum::Exit as u32, 0, 0, 0);
    }
}
