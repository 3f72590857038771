// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same
//! set of names. On actual hardware that's `rv32`; everywhere else it's
//! `fake`, which mirrors the hardware surface over plain memory so the rest
//! of the kernel can be exercised by host tests.
//!
//! The trap frame layout lives here rather than in the per-arch modules
//! because it is part of the kernel's portable contract: the dispatcher, the
//! syscall gate and the scheduler all manipulate saved state through it.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

cfg_if::cfg_if! {
    if #[cfg(not(target_pointer_width = "32"))] {
        // Simulation/test hosts are typically 64-bit; addresses in the frame
        // and the PMP shadow stay u32 regardless.
        pub mod fake;
        pub use fake::*;
    } else if #[cfg(all(target_arch = "riscv32", target_os = "none"))] {
        pub mod rv32;
        pub use rv32::*;
    } else {
        pub mod fake;
        pub use fake::*;
    }
}

/// Size in bytes of the trap frame, including padding that keeps the stack
/// pointer 16-byte aligned as the RISC-V psABI requires.
pub const FRAME_SIZE: usize = 144;

/// Saved execution state of one trap, laid out exactly as the entry assembly
/// stores it.
///
/// Word indices 0..=29 are the general registers in the order below (all of
/// them except `zero` and `sp`); 30..=32 are the trapped `mcause`, `mepc`
/// and `mstatus`; 33 is the stack pointer of the interrupted context (the
/// user SP when the trap came from U-mode, the pre-trap SP otherwise).
///
/// Every trap path writes all 34 words before the dispatcher runs; nothing
/// in the frame survives from a previous trap.
#[derive(Debug, Default, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct TrapFrame {
    pub ra: u32,
    pub gp: u32,
    pub tp: u32,
    pub t0: u32,
    pub t1: u32,
    pub t2: u32,
    pub s0: u32,
    pub s1: u32,
    pub a0: u32,
    pub a1: u32,
    pub a2: u32,
    pub a3: u32,
    pub a4: u32,
    pub a5: u32,
    pub a6: u32,
    pub a7: u32,
    pub s2: u32,
    pub s3: u32,
    pub s4: u32,
    pub s5: u32,
    pub s6: u32,
    pub s7: u32,
    pub s8: u32,
    pub s9: u32,
    pub s10: u32,
    pub s11: u32,
    pub t3: u32,
    pub t4: u32,
    pub t5: u32,
    pub t6: u32,
    pub mcause: u32,
    pub mepc: u32,
    pub mstatus: u32,
    pub sp: u32,
    _pad: [u32; 2],
}

// mstatus bits the kernel cares about.

/// Machine Interrupt Enable.
pub const MSTATUS_MIE: u32 = 1 << 3;
/// Value of MIE before the trap; `mret` copies it back into MIE.
pub const MSTATUS_MPIE: u32 = 1 << 7;
/// Previous privilege mode field, bits 12:11.
pub const MSTATUS_MPP_SHIFT: u32 = 11;
pub const MSTATUS_MPP_MASK: u32 = 0b11 << MSTATUS_MPP_SHIFT;
/// MPP encoding for U-mode.
pub const MSTATUS_MPP_USER: u32 = 0b00 << MSTATUS_MPP_SHIFT;
/// MPP encoding for M-mode.
pub const MSTATUS_MPP_MACH: u32 = 0b11 << MSTATUS_MPP_SHIFT;

/// Extracts the previous privilege mode from a saved `mstatus` value.
pub fn mstatus_mpp(mstatus: u32) -> u32 {
    (mstatus & MSTATUS_MPP_MASK) >> MSTATUS_MPP_SHIFT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_matches_entry_assembly() {
        // The entry/restore assembly addresses the frame by fixed byte
        // offsets; this pins the Rust layout to the same numbers.
        assert_eq!(core::mem::size_of::<TrapFrame>(), FRAME_SIZE);
        assert_eq!(core::mem::offset_of!(TrapFrame, ra), 0);
        assert_eq!(core::mem::offset_of!(TrapFrame, a0), 8 * 4);
        assert_eq!(core::mem::offset_of!(TrapFrame, a7), 15 * 4);
        assert_eq!(core::mem::offset_of!(TrapFrame, t6), 29 * 4);
        assert_eq!(core::mem::offset_of!(TrapFrame, mcause), 30 * 4);
        assert_eq!(core::mem::offset_of!(TrapFrame, mepc), 31 * 4);
        assert_eq!(core::mem::offset_of!(TrapFrame, mstatus), 32 * 4);
        assert_eq!(core::mem::offset_of!(TrapFrame, sp), 33 * 4);
    }

    #[test]
    fn mpp_field_decoding() {
        assert_eq!(mstatus_mpp(MSTATUS_MPP_MACH), 0b11);
        assert_eq!(mstatus_mpp(MSTATUS_MPP_USER | MSTATUS_MPIE), 0b00);
    }
}
