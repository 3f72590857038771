// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for RV32 machine mode.
//!
//! # Trap entry and the scratch register
//!
//! All traps funnel through a single vector, `_trap_entry`, which must work
//! whether the interrupted context was the kernel (M-mode) or a task running
//! in U-mode -- and in the latter case it must never trust the task's stack
//! pointer. The discriminator is `mscratch`, maintained under this
//! convention:
//!
//! - while M-mode code runs outside a trap, `mscratch` holds zero and `sp`
//!   holds a kernel stack;
//! - while U-mode code runs, `mscratch` holds the task's kernel stack top
//!   and `sp` holds whatever the task put there.
//!
//! The vector starts with a blind `csrrw` swap of `sp` and `mscratch`.
//! Seeing zero in the new `sp` means the trap came from M-mode: undo the
//! swap and keep using the stack we already had. Seeing non-zero means the
//! trap came from U-mode: `sp` is now a trustworthy kernel stack and
//! `mscratch` holds the user stack pointer, which is saved into the frame.
//!
//! Either way the vector materializes a full [`TrapFrame`](super::TrapFrame)
//! and calls the Rust dispatcher with `(mcause, mepc, frame)`. The
//! dispatcher returns the frame to restore -- returning a *different* frame
//! is how a context switch happens. The restore path reads `MPP` out of the
//! saved `mstatus` to decide how to re-arm `mscratch` before `mret`.
//!
//! # Timer
//!
//! The CLINT's `mtime`/`mtimecmp` pair provides the kernel tick. Both are
//! 64-bit registers on a 32-bit bus, so reads retry on high-word rollover
//! and compare-value writes go low-word-first through an impassable value
//! so the comparator never sees a torn intermediate.

use core::arch::{asm, global_asm};
use core::sync::atomic::{AtomicU32, Ordering};

use riscv::register::{mie, mstatus};

use super::{
    TrapFrame, FRAME_SIZE, MSTATUS_MPIE, MSTATUS_MPP_MACH, MSTATUS_MPP_USER,
};
use crate::descs::TaskFlags;
use crate::pmp::{MemPool, PmpPerms, PmpPriority};
use crate::task::Task;

/// Kernel stack top for the current task, consulted by the restore path when
/// returning to U-mode. Context switches store the next task's kernel stack
/// here so that each U-mode task traps onto its own kernel stack.
#[no_mangle]
static CURRENT_KSTACK_TOP: AtomicU32 = AtomicU32::new(0);

/// Saved machine state of a task between runs: just the address of its trap
/// frame. Everything else lives in the frame itself.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct SavedState {
    pub frame: usize,
}

// Reset vector. The linker script places .text.init at the image base,
// which is where the hart begins executing.
global_asm!(
    r#"
    .section .text.init
    .globl _start
    .type _start,@function
_start:
    .option push
    .option norelax
    la      gp, __global_pointer$
    .option pop
    la      sp, _stack_top

    /* tp must point at 64-byte-aligned thread-local storage; park it just
       past the image. */
    la      tp, _end
    addi    tp, tp, 63
    andi    tp, tp, -64

    /* Zero .bss. */
    la      a0, _sbss
    la      a1, _ebss
    bgeu    a0, a1, 1f
0:  sw      zero, 0(a0)
    addi    a0, a0, 4
    bltu    a0, a1, 0b
1:

    /* MPP = M-mode so an early mret stays privileged; MIE off until the
       first task is launched. */
    li      t0, 0x1800
    csrw    mstatus, t0
    csrw    mie, zero
    csrw    mip, zero

    /* M-mode outside a trap: mscratch holds zero. */
    csrw    mscratch, zero

    /* Park secondary harts; only hart 0 boots the kernel. */
    csrr    t0, mhartid
    bnez    t0, 3f

    la      t0, _trap_entry
    csrw    mtvec, t0

    /* External interrupts may be enabled early; the global MIE gate stays
       shut until dispatch. */
    li      t0, 0x800
    csrw    mie, t0

    call    main
    call    kernel_boot_failed

3:  wfi
    j       3b
    "#
);

// Common trap vector and frame restore. Frame offsets here must match the
// field offsets of `TrapFrame`; `arch::tests::frame_layout_matches_entry_assembly`
// pins them.
global_asm!(
    r#"
    .section .text.trap
    .balign 4
    .globl _trap_entry
    .type _trap_entry,@function
_trap_entry:
    csrrw   sp, mscratch, sp
    bnez    sp, 2f

    /* M-mode entry: undo the swap (mscratch returns to zero) and build the
       frame on the stack we interrupted. */
    csrrw   sp, mscratch, sp
    addi    sp, sp, -144
    sw      ra, 0(sp)
    sw      gp, 4(sp)
    sw      tp, 8(sp)
    sw      t0, 12(sp)
    sw      t1, 16(sp)
    sw      t2, 20(sp)
    sw      s0, 24(sp)
    sw      s1, 28(sp)
    sw      a0, 32(sp)
    sw      a1, 36(sp)
    sw      a2, 40(sp)
    sw      a3, 44(sp)
    sw      a4, 48(sp)
    sw      a5, 52(sp)
    sw      a6, 56(sp)
    sw      a7, 60(sp)
    sw      s2, 64(sp)
    sw      s3, 68(sp)
    sw      s4, 72(sp)
    sw      s5, 76(sp)
    sw      s6, 80(sp)
    sw      s7, 84(sp)
    sw      s8, 88(sp)
    sw      s9, 92(sp)
    sw      s10, 96(sp)
    sw      s11, 100(sp)
    sw      t3, 104(sp)
    sw      t4, 108(sp)
    sw      t5, 112(sp)
    sw      t6, 116(sp)
    addi    t0, sp, 144
    sw      t0, 132(sp)
    j       3f

2:  /* U-mode entry: sp now holds this task's kernel stack top and mscratch
       holds the user stack pointer. t6 is saved first so it can carry the
       user sp into the frame. */
    addi    sp, sp, -144
    sw      t6, 116(sp)
    csrr    t6, mscratch
    sw      t6, 132(sp)
    sw      ra, 0(sp)
    sw      gp, 4(sp)
    sw      tp, 8(sp)
    sw      t0, 12(sp)
    sw      t1, 16(sp)
    sw      t2, 20(sp)
    sw      s0, 24(sp)
    sw      s1, 28(sp)
    sw      a0, 32(sp)
    sw      a1, 36(sp)
    sw      a2, 40(sp)
    sw      a3, 44(sp)
    sw      a4, 48(sp)
    sw      a5, 52(sp)
    sw      a6, 56(sp)
    sw      a7, 60(sp)
    sw      s2, 64(sp)
    sw      s3, 68(sp)
    sw      s4, 72(sp)
    sw      s5, 76(sp)
    sw      s6, 80(sp)
    sw      s7, 84(sp)
    sw      s8, 88(sp)
    sw      s9, 92(sp)
    sw      s10, 96(sp)
    sw      s11, 100(sp)
    sw      t3, 104(sp)
    sw      t4, 108(sp)
    sw      t5, 112(sp)

3:  csrr    a0, mcause
    csrr    a1, mepc
    csrr    a2, mstatus
    sw      a0, 120(sp)
    sw      a1, 124(sp)
    sw      a2, 128(sp)

    mv      a2, sp
    call    trap_entry

    /* a0 is the frame to resume -- possibly a different task's. */
_frame_restore:
    mv      sp, a0
    lw      t0, 128(sp)
    csrw    mstatus, t0

    srli    t1, t0, 11
    andi    t1, t1, 3
    bnez    t1, 4f

    /* Returning to U-mode: arm mscratch with this task's kernel stack so
       the next trap can repeat the swap. */
    la      t1, CURRENT_KSTACK_TOP
    lw      t1, 0(t1)
    csrw    mscratch, t1
    j       5f

4:  /* Returning to M-mode: mscratch holds zero outside traps. */
    csrw    mscratch, zero

5:  lw      t1, 124(sp)
    csrw    mepc, t1

    lw      ra, 0(sp)
    lw      gp, 4(sp)
    lw      tp, 8(sp)
    lw      t0, 12(sp)
    lw      t1, 16(sp)
    lw      t2, 20(sp)
    lw      s0, 24(sp)
    lw      s1, 28(sp)
    lw      a0, 32(sp)
    lw      a1, 36(sp)
    lw      a2, 40(sp)
    lw      a3, 44(sp)
    lw      a4, 48(sp)
    lw      a5, 52(sp)
    lw      a6, 56(sp)
    lw      a7, 60(sp)
    lw      s2, 64(sp)
    lw      s3, 68(sp)
    lw      s4, 72(sp)
    lw      s5, 76(sp)
    lw      s6, 80(sp)
    lw      s7, 84(sp)
    lw      s8, 88(sp)
    lw      s9, 92(sp)
    lw      s10, 96(sp)
    lw      s11, 100(sp)
    lw      t3, 104(sp)
    lw      t4, 108(sp)
    lw      t5, 112(sp)
    lw      t6, 116(sp)
    lw      sp, 132(sp)
    mret

    .globl _task_launch
    .type _task_launch,@function
_task_launch:
    j       _frame_restore
    "#
);

extern "C" {
    /// Enters the restore path with `frame` as if a trap dispatcher had just
    /// selected it. Used exactly once, to start the first task.
    fn _task_launch(frame: u32) -> !;

    // Linker-script symbols delimiting the standard kernel memory pools.
    static _stext: u8;
    static _etext: u8;
    static _sdata: u8;
    static _edata: u8;
    static _sbss: u8;
    static _ebss: u8;
    static _heap_start: u8;
    static _heap_end: u8;
    static _stack_bottom: u8;
    static _stack_top: u8;
}

/// Target of the reset vector if `main` ever returns.
#[no_mangle]
extern "C" fn kernel_boot_failed() -> ! {
    panic!("main returned");
}

/// Disables machine interrupts, returning whether they were enabled. Pair
/// with [`irq_restore`].
pub fn irq_save() -> bool {
    let was = mstatus::read().mie();
    // Safety: masking interrupts has no memory-safety implications.
    unsafe {
        mstatus::clear_mie();
    }
    was
}

/// Restores the interrupt-enable state captured by [`irq_save`].
pub fn irq_restore(was_enabled: bool) {
    if was_enabled {
        // Safety: the caller owned this enable state before irq_save.
        unsafe {
            mstatus::set_mie();
        }
    }
}

/// Hints the core to idle until the next interrupt.
pub fn wait_for_interrupt() {
    unsafe {
        asm!("wfi", options(nomem, nostack, preserves_flags));
    }
}

/// Explicit yield from M-mode task context: `ecall` raises an
/// environment-call exception, which the dispatcher treats as a scheduling
/// request. The syscall number travels in `a7` for symmetry with the U-mode
/// convention even though the M-mode path doesn't consult it.
pub fn yield_now() {
    unsafe {
        asm!(
            "ecall",
            in("a7") abi::Sysnum::Yield as u32,
            options(nostack),
        );
    }
}

/// Records `top` as the kernel stack for the task about to run. See
/// [`CURRENT_KSTACK_TOP`].
pub fn set_current_kstack(top: u32) {
    CURRENT_KSTACK_TOP.store(top, Ordering::Relaxed);
}

// PMP CSR access.
//
// CSR instructions encode the register number in the instruction itself, so
// runtime-indexed access has to go through one instruction per register.
// Each accessor below is monomorphized over the CSR number and the public
// entry points fan out with a small match.

fn read_csr<const CSR: u16>() -> u32 {
    let v;
    unsafe {
        asm!("csrr {0}, {csr}", out(reg) v, csr = const CSR, options(nomem, nostack));
    }
    v
}

fn write_csr<const CSR: u16>(v: u32) {
    unsafe {
        asm!("csrw {csr}, {0}", in(reg) v, csr = const CSR, options(nomem, nostack));
    }
}

const CSR_PMPCFG0: u16 = 0x3A0;
const CSR_PMPADDR0: u16 = 0x3B0;

/// Reads `pmpcfg{idx}`. Out-of-range indices read as zero, matching the
/// hardware's treatment of unimplemented regions.
pub fn read_pmpcfg(idx: u8) -> u32 {
    match idx {
        0 => read_csr::<{ CSR_PMPCFG0 }>(),
        1 => read_csr::<{ CSR_PMPCFG0 + 1 }>(),
        2 => read_csr::<{ CSR_PMPCFG0 + 2 }>(),
        3 => read_csr::<{ CSR_PMPCFG0 + 3 }>(),
        _ => 0,
    }
}

/// Writes `pmpcfg{idx}`. Out-of-range indices are ignored.
pub fn write_pmpcfg(idx: u8, v: u32) {
    match idx {
        0 => write_csr::<{ CSR_PMPCFG0 }>(v),
        1 => write_csr::<{ CSR_PMPCFG0 + 1 }>(v),
        2 => write_csr::<{ CSR_PMPCFG0 + 2 }>(v),
        3 => write_csr::<{ CSR_PMPCFG0 + 3 }>(v),
        _ => (),
    }
}

/// Reads `pmpaddr{idx}`. Out-of-range indices read as zero.
pub fn read_pmpaddr(idx: u8) -> u32 {
    match idx {
        0 => read_csr::<{ CSR_PMPADDR0 }>(),
        1 => read_csr::<{ CSR_PMPADDR0 + 1 }>(),
        2 => read_csr::<{ CSR_PMPADDR0 + 2 }>(),
        3 => read_csr::<{ CSR_PMPADDR0 + 3 }>(),
        4 => read_csr::<{ CSR_PMPADDR0 + 4 }>(),
        5 => read_csr::<{ CSR_PMPADDR0 + 5 }>(),
        6 => read_csr::<{ CSR_PMPADDR0 + 6 }>(),
        7 => read_csr::<{ CSR_PMPADDR0 + 7 }>(),
        8 => read_csr::<{ CSR_PMPADDR0 + 8 }>(),
        9 => read_csr::<{ CSR_PMPADDR0 + 9 }>(),
        10 => read_csr::<{ CSR_PMPADDR0 + 10 }>(),
        11 => read_csr::<{ CSR_PMPADDR0 + 11 }>(),
        12 => read_csr::<{ CSR_PMPADDR0 + 12 }>(),
        13 => read_csr::<{ CSR_PMPADDR0 + 13 }>(),
        14 => read_csr::<{ CSR_PMPADDR0 + 14 }>(),
        15 => read_csr::<{ CSR_PMPADDR0 + 15 }>(),
        _ => 0,
    }
}

/// Writes `pmpaddr{idx}`. Out-of-range indices are ignored.
pub fn write_pmpaddr(idx: u8, v: u32) {
    match idx {
        0 => write_csr::<{ CSR_PMPADDR0 }>(v),
        1 => write_csr::<{ CSR_PMPADDR0 + 1 }>(v),
        2 => write_csr::<{ CSR_PMPADDR0 + 2 }>(v),
        3 => write_csr::<{ CSR_PMPADDR0 + 3 }>(v),
        4 => write_csr::<{ CSR_PMPADDR0 + 4 }>(v),
        5 => write_csr::<{ CSR_PMPADDR0 + 5 }>(v),
        6 => write_csr::<{ CSR_PMPADDR0 + 6 }>(v),
        7 => write_csr::<{ CSR_PMPADDR0 + 7 }>(v),
        8 => write_csr::<{ CSR_PMPADDR0 + 8 }>(v),
        9 => write_csr::<{ CSR_PMPADDR0 + 9 }>(v),
        10 => write_csr::<{ CSR_PMPADDR0 + 10 }>(v),
        11 => write_csr::<{ CSR_PMPADDR0 + 11 }>(v),
        12 => write_csr::<{ CSR_PMPADDR0 + 12 }>(v),
        13 => write_csr::<{ CSR_PMPADDR0 + 13 }>(v),
        14 => write_csr::<{ CSR_PMPADDR0 + 14 }>(v),
        15 => write_csr::<{ CSR_PMPADDR0 + 15 }>(v),
        _ => (),
    }
}

/// Returns the five standard kernel memory pools, delimited by linker-script
/// symbols. These prime the PMP at boot so the kernel's own text, data and
/// stacks are covered by the lowest (never-evicted) regions.
pub fn kernel_pools() -> [MemPool; 5] {
    fn addr(sym: &'static u8) -> u32 {
        sym as *const u8 as u32
    }
    // Safety: these symbols are zero-sized markers; we only take addresses.
    unsafe {
        [
            MemPool {
                name: "kernel_text",
                start: addr(&_stext),
                end: addr(&_etext),
                flags: PmpPerms::R.union(PmpPerms::X),
                tag: PmpPriority::Kernel,
            },
            MemPool {
                name: "kernel_data",
                start: addr(&_sdata),
                end: addr(&_edata),
                flags: PmpPerms::R.union(PmpPerms::W),
                tag: PmpPriority::Kernel,
            },
            MemPool {
                name: "kernel_bss",
                start: addr(&_sbss),
                end: addr(&_ebss),
                flags: PmpPerms::R.union(PmpPerms::W),
                tag: PmpPriority::Kernel,
            },
            MemPool {
                name: "kernel_heap",
                start: addr(&_heap_start),
                end: addr(&_heap_end),
                flags: PmpPerms::R.union(PmpPerms::W),
                tag: PmpPriority::Kernel,
            },
            MemPool {
                name: "kernel_stack",
                start: addr(&_stack_bottom),
                end: addr(&_stack_top),
                flags: PmpPerms::R.union(PmpPerms::W),
                tag: PmpPriority::Kernel,
            },
        ]
    }
}

// CLINT, at the QEMU virt machine's base address.

const CLINT_BASE: u32 = 0x0200_0000;
const MTIMECMP_LO: *mut u32 = (CLINT_BASE + 0x4000) as *mut u32;
const MTIMECMP_HI: *mut u32 = (CLINT_BASE + 0x4004) as *mut u32;
const MTIME_LO: *const u32 = (CLINT_BASE + 0xBFF8) as *const u32;
const MTIME_HI: *const u32 = (CLINT_BASE + 0xBFFC) as *const u32;

/// Machine ticks per kernel tick, recorded at start so the rearm path can
/// schedule each interrupt relative to the previous target (no drift).
static TICK_DIVISOR: AtomicU32 = AtomicU32::new(0);

/// Reads the 64-bit `mtime` consistently on a 32-bit bus: if the high word
/// changes mid-read, the low word rolled over and the read retries.
fn mtime() -> u64 {
    loop {
        // Safety: MMIO reads of the CLINT time registers are side-effect
        // free.
        let (hi, lo, hi2) = unsafe {
            (
                MTIME_HI.read_volatile(),
                MTIME_LO.read_volatile(),
                MTIME_HI.read_volatile(),
            )
        };
        if hi == hi2 {
            return u64::from(hi) << 32 | u64::from(lo);
        }
    }
}

fn mtimecmp() -> u64 {
    // The comparator only changes when we write it, so no retry loop.
    unsafe { u64::from(MTIMECMP_HI.read_volatile()) << 32 | u64::from(MTIMECMP_LO.read_volatile()) }
}

/// Writes `mtimecmp` without ever exposing a torn value to the comparator:
/// the low word first goes impassably high, then the high word lands, then
/// the real low word.
fn set_mtimecmp(v: u64) {
    let timer_was_on = mie::read().mtimer();
    unsafe {
        mie::clear_mtimer();
        MTIMECMP_LO.write_volatile(u32::MAX);
        MTIMECMP_HI.write_volatile((v >> 32) as u32);
        MTIMECMP_LO.write_volatile(v as u32);
        if timer_was_on {
            mie::set_mtimer();
        }
    }
}

/// Schedules the next tick relative to the previous target time, keeping the
/// tick frequency stable regardless of interrupt latency.
pub fn timer_rearm() {
    let divisor = TICK_DIVISOR.load(Ordering::Relaxed);
    set_mtimecmp(mtimecmp() + u64::from(divisor));
}

/// Builds a task's initial trap frame at the top of its stack, so that the
/// common restore path can "return" into the task's entry point.
pub fn reinitialize(task: &mut Task) {
    let desc = *task.descriptor();
    // The psABI requires 16-byte stack alignment.
    let stack_top = desc.initial_stack & !0xF;
    assert!(stack_top as usize > FRAME_SIZE);

    let frame_addr = stack_top - FRAME_SIZE as u32;

    let mut frame = TrapFrame::default();
    frame.mepc = desc.entry_point;
    frame.sp = stack_top;

    // Tasks inherit the kernel's global and thread pointers.
    let (gp, tp): (u32, u32);
    unsafe {
        asm!("mv {0}, gp", "mv {1}, tp", out(reg) gp, out(reg) tp,
             options(nomem, nostack, preserves_flags));
    }
    frame.gp = gp;
    frame.tp = tp;

    if desc.flags.contains(TaskFlags::USER_MODE) {
        // mret copies MPIE into MIE, so the task starts with interrupts on.
        frame.mstatus = MSTATUS_MPIE | MSTATUS_MPP_USER;
        // Returning from a U-mode entry point jumps to zero and faults,
        // which the dispatcher escalates. Tasks that want a clean exit call
        // the exit syscall.
        frame.ra = 0;
    } else {
        frame.mstatus = MSTATUS_MPIE | MSTATUS_MPP_MACH;
        frame.ra = crate::task::task_exited as usize as u32;
    }

    // Safety: the descriptor promises this stack region belongs to the task
    // and is writable; the frame sits wholly below stack_top.
    unsafe {
        (frame_addr as *mut TrapFrame).write(frame);
    }
    task.save_mut().frame = frame_addr as usize;
}

/// Flips the hart into its first task. `tick_divisor` is machine timer
/// ticks per kernel tick; pass `preemptive = false` to leave the timer
/// interrupt masked (cooperative scheduling).
pub fn start_first_task(
    tick_divisor: u32,
    preemptive: bool,
    task: &mut Task,
) -> ! {
    TICK_DIVISOR.store(tick_divisor, Ordering::Relaxed);
    set_mtimecmp(mtime() + u64::from(tick_divisor));
    if preemptive {
        // Safety: unmasking the timer is what we're here for; the handler
        // is installed.
        unsafe {
            mie::set_mtimer();
        }
    }

    // Safety: the task's frame was built by `reinitialize` and nothing has
    // run that could have disturbed it.
    unsafe { _task_launch(task.save().frame as u32) }
}
