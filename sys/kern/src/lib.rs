// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A small preemptive kernel for 32-bit RISC-V.
//!
//! This is the application-independent portion of the operating system, the
//! part that runs in M-mode. It multiplexes a single hart across tasks,
//! isolates them from the kernel (and each other) with the PMP unit, and
//! provides mutexes, condition variables and message queues on top of a
//! blocking scheduler.
//!
//! # Design principles
//!
//! A few commitments shaped every module here, and knowing them makes the
//! rest easier to read.
//!
//! 1. Static configuration. The system takes a single shape specified at
//!    build time: fixed task table, fixed flexpage arena, no allocator.
//! 2. A strong preference for safe code where reasonable. The unavoidable
//!    unsafety (trap entry, CSR access, the task-table singleton) is fenced
//!    into `arch` and `startup`.
//! 3. Everything outside `arch` builds and unit-tests on the host, against
//!    the shadow hardware in `arch::fake`.
//! 4. Errors are values. Expected failures come back as `Result`; impossible
//!    states are panics, which are terminal (see `fail`).

#![cfg_attr(target_os = "none", no_std)]

pub mod arch;

pub mod console;
pub mod descs;
pub mod fail;
pub mod memprot;
pub mod pmp;
pub mod spinlock;
pub mod startup;
pub mod sync;
pub mod syscalls;
pub mod task;
pub mod time;
pub mod trap;
