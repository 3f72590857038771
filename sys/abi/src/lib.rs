// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and task code.
//!
//! Everything in this crate is part of the binding surface between the kernel
//! and programs that run on it: error codes returned from system calls, the
//! system call numbering, task states as observed through the kernel's
//! introspection surface, and the priority type. Changing any of it changes
//! the ABI.

#![cfg_attr(not(test), no_std)]

/// Task identifier as seen by the synchronization primitives and the syscall
/// interface.
///
/// Real tasks are numbered starting from 1. The value 0 is reserved to mean
/// "no task" (for example, a mutex with owner 0 is free), and `u16::MAX` is
/// the poison value stamped into destroyed objects so that use-after-destroy
/// is caught rather than misattributed.
pub type TaskId = u16;

/// The "no task" sentinel. See [`TaskId`].
pub const TASK_ID_NONE: TaskId = 0;

/// The poison sentinel stamped into destroyed objects. See [`TaskId`].
pub const TASK_ID_POISON: TaskId = u16::MAX;

/// Kernel error codes.
///
/// The numeric values are part of the syscall ABI: errors cross the U-mode
/// boundary as negative `i32` values in `a0`, so they are pinned here with
/// explicit discriminants. The block starting at -16383 deliberately sits
/// outside the POSIX errno range.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum Error {
    /// Generic failure, used where no more specific code applies.
    Fail = -1,

    /// No tasks available for scheduling. Terminal when raised by the
    /// scheduler.
    NoTasks = -16383,
    /// Task is busy or in the wrong state for the operation.
    TaskBusy = -16373,
    /// Operation requires ownership the caller doesn't have.
    NotOwner = -16372,
    /// Invalid parameters for a protection region.
    PmpInvalidRegion = -16369,
    /// No free hardware protection regions available.
    PmpNoRegions = -16368,
    /// Region is locked and cannot be modified.
    PmpLocked = -16367,
    /// Inverted or otherwise invalid address range.
    PmpAddrRange = -16365,
    /// Protection hardware has not been initialized.
    PmpNotInit = -16364,
    /// A synchronization primitive was used while in an impossible state.
    SemOperation = -16359,
    /// Message queue is not empty.
    MqNotEmpty = -16358,
    /// Operation timed out.
    Timeout = -16357,
    /// Unknown or unclassified error.
    Unknown = -16356,
}

impl Error {
    /// Returns the wire representation of this error, as delivered to tasks
    /// in `a0`.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Reconstructs an `Error` from a wire value. Unrecognized negative
    /// values collapse to `Unknown`; non-negative values are not errors and
    /// yield `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        let e = match code {
            -1 => Error::Fail,
            -16383 => Error::NoTasks,
            -16373 => Error::TaskBusy,
            -16372 => Error::NotOwner,
            -16369 => Error::PmpInvalidRegion,
            -16368 => Error::PmpNoRegions,
            -16367 => Error::PmpLocked,
            -16365 => Error::PmpAddrRange,
            -16364 => Error::PmpNotInit,
            -16359 => Error::SemOperation,
            -16358 => Error::MqNotEmpty,
            -16357 => Error::Timeout,
            c if c < 0 => Error::Unknown,
            _ => return None,
        };
        Some(e)
    }
}

/// Turns a syscall return value into a `Result`.
pub fn result_from_code(code: i32) -> Result<i32, Error> {
    match Error::from_code(code) {
        Some(e) => Err(e),
        None => Ok(code),
    }
}

/// System call numbers, as passed in `a7`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Sysnum {
    /// Give up the CPU; the scheduler picks the next runnable task.
    Yield = 0,
    /// Returns the calling task's id (positive).
    Tid = 1,
    /// Returns the kernel tick count (low 31 bits).
    Uptime = 2,
    /// Blocks the calling task for `a0` ticks.
    Delay = 3,
    /// Stops the calling task permanently.
    Exit = 4,
}

impl TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        match v {
            0 => Ok(Sysnum::Yield),
            1 => Ok(Sysnum::Tid),
            2 => Ok(Sysnum::Uptime),
            3 => Ok(Sysnum::Delay),
            4 => Ok(Sysnum::Exit),
            _ => Err(()),
        }
    }
}

/// Scheduling state of a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum TaskState {
    /// Not started, or exited. Never scheduled.
    #[default]
    Stopped,
    /// Runnable, waiting for the CPU.
    Ready,
    /// Currently executing. At most one task is in this state.
    Running,
    /// Waiting on a primitive or a tick delay. Not schedulable until some
    /// event flips it back to `Ready`.
    Blocked,
}

/// A task's scheduling priority.
///
/// Zero is the most important priority and larger numbers matter less, so
/// adding levels never renumbers the existing ones.
///
/// There is intentionally no `PartialOrd`/`Ord` here: with the importance
/// order inverted from the numeric order, a bare `<` in scheduler code is
/// a bug waiting to be misread. Comparisons go through the named method
/// instead.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// True when `self` strictly outranks `other` -- that is, when its
    /// numeric value is smaller.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}
