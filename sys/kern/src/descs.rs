// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Descriptor types, used to statically define application resources.

/// Record describing a single task.
///
/// Applications hand the kernel a slice of these at startup; the kernel adds
/// its own idle task. Descriptors are plain data so the same set can
/// describe a boot image or a test fixture.
#[derive(Copy, Clone, Debug)]
pub struct TaskDesc {
    /// Address of the task's entry point. This is the first instruction
    /// executed when the task starts.
    pub entry_point: u32,
    /// Address of the task's initial stack pointer. The initial trap frame
    /// is built immediately below it, so the stack must have room for at
    /// least one frame even at peak use.
    pub initial_stack: u32,
    /// Top of the kernel stack this task traps onto. Meaningful only for
    /// `USER_MODE` tasks, where it is loaded into the scratch register
    /// whenever the task runs; M-mode tasks trap onto their own stack and
    /// leave this zero.
    pub kernel_stack: u32,
    /// Initial priority of this task. Lower numbers are more important.
    pub priority: u8,
    /// Collection of boolean flags controlling task behavior.
    pub flags: TaskFlags,
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct TaskFlags: u8 {
        /// Task is marked runnable at kernel startup; otherwise it stays
        /// stopped until something starts it.
        const START_AT_BOOT = 1 << 0;
        /// Task runs in U-mode, reaches the kernel only through `ecall`,
        /// and needs a `kernel_stack` of its own.
        const USER_MODE = 1 << 1;
    }
}
