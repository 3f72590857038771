// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel's last words.
//!
//! Panics are terminal: nothing is recovered, the reason is written where
//! a debugger can find it, and the hart parks. Two symbols make up that
//! postmortem interface:
//!
//! - `kern::fail::KERNEL_HAS_FAILED`, a `bool` that is zero from kernel
//!   entry until (if ever) `die` runs -- whether called directly or via
//!   `panic!`. Reading any value other than zero or one means the kernel
//!   never booted or scribbled over itself going down.
//!
//! - `kern::fail::KERNEL_EPITAPH`, a NUL-padded byte array carrying the
//!   failure message as UTF-8, truncated to fit. Strip the trailing NULs
//!   when printing.

use core::fmt::{Display, Write};
use core::sync::atomic::Ordering;

/// One flag for tools to triage against: has this kernel died?
#[used]
static mut KERNEL_HAS_FAILED: bool = false;

const EPITAPH_LEN: usize = 128;

/// Holds up to `EPITAPH_LEN` bytes describing the failure.
#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    // Safety: this function is reached at most once per boot in practice,
    // from a context where interrupts are or are about to be irrelevant;
    // the replace detects the recursive-panic case.
    let previous_fail = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if previous_fail {
        // A second failure while reporting the first: don't make it
        // worse, just stop here.
        loop {
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }

    // Safety: only the one execution that flipped the flag gets here.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

/// Records the reason and parks the hart. Terminal.
#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    let buf = begin_epitaph();
    let mut writer = EpitaphWriter { dest: buf };
    write!(writer, "{msg}").ok();

    loop {
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

struct EpitaphWriter {
    dest: &'static mut [u8],
}

impl Write for EpitaphWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
