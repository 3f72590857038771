// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stand-in architecture for builds that aren't bare-metal RV32 -- which in
//! practice means host unit tests.
//!
//! The PMP configuration and address registers are mirrored by plain atomic
//! arrays, so the region engine's hardware writes land somewhere tests can
//! read back. Interrupt masking and the timer are no-ops: host tests are the
//! only "hart" and they drive ticks by hand.

use core::sync::atomic::{AtomicU32, Ordering};

use super::FRAME_SIZE;
use crate::pmp::{MemPool, PmpPerms, PmpPriority};
use crate::task::Task;

/// Saved machine state of a task between runs: just the address of its trap
/// frame. Everything else lives in the frame itself.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct SavedState {
    pub frame: usize,
}

static CURRENT_KSTACK_TOP: AtomicU32 = AtomicU32::new(0);

pub fn set_current_kstack(top: u32) {
    CURRENT_KSTACK_TOP.store(top, Ordering::Relaxed);
}

pub fn irq_save() -> bool {
    false
}

pub fn irq_restore(_was_enabled: bool) {}

pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

pub fn yield_now() {}

pub fn timer_rearm() {}

// Shadow "hardware" PMP registers.

const PMPCFG_ZERO: AtomicU32 = AtomicU32::new(0);
const PMPADDR_ZERO: AtomicU32 = AtomicU32::new(0);
static PMPCFG: [AtomicU32; 4] = [PMPCFG_ZERO; 4];
static PMPADDR: [AtomicU32; 16] = [PMPADDR_ZERO; 16];

pub fn read_pmpcfg(idx: u8) -> u32 {
    PMPCFG
        .get(usize::from(idx))
        .map(|r| r.load(Ordering::Relaxed))
        .unwrap_or(0)
}

pub fn write_pmpcfg(idx: u8, v: u32) {
    if let Some(r) = PMPCFG.get(usize::from(idx)) {
        r.store(v, Ordering::Relaxed);
    }
}

pub fn read_pmpaddr(idx: u8) -> u32 {
    PMPADDR
        .get(usize::from(idx))
        .map(|r| r.load(Ordering::Relaxed))
        .unwrap_or(0)
}

pub fn write_pmpaddr(idx: u8, v: u32) {
    if let Some(r) = PMPADDR.get(usize::from(idx)) {
        r.store(v, Ordering::Relaxed);
    }
}

// Synthetic layout for the standard kernel pools, standing in for the
// linker-script symbols of a real image.

pub const FAKE_STEXT: u32 = 0x8000_0000;
pub const FAKE_ETEXT: u32 = 0x8004_0000;
pub const FAKE_SDATA: u32 = 0x8004_0000;
pub const FAKE_EDATA: u32 = 0x8005_0000;
pub const FAKE_SBSS: u32 = 0x8005_0000;
pub const FAKE_EBSS: u32 = 0x8006_0000;
pub const FAKE_HEAP_START: u32 = 0x8006_0000;
pub const FAKE_HEAP_END: u32 = 0x8008_0000;
pub const FAKE_STACK_BOTTOM: u32 = 0x8008_0000;
pub const FAKE_STACK_TOP: u32 = 0x8008_8000;

pub fn kernel_pools() -> [MemPool; 5] {
    [
        MemPool {
            name: "kernel_text",
            start: FAKE_STEXT,
            end: FAKE_ETEXT,
            flags: PmpPerms::R.union(PmpPerms::X),
            tag: PmpPriority::Kernel,
        },
        MemPool {
            name: "kernel_data",
            start: FAKE_SDATA,
            end: FAKE_EDATA,
            flags: PmpPerms::R.union(PmpPerms::W),
            tag: PmpPriority::Kernel,
        },
        MemPool {
            name: "kernel_bss",
            start: FAKE_SBSS,
            end: FAKE_EBSS,
            flags: PmpPerms::R.union(PmpPerms::W),
            tag: PmpPriority::Kernel,
        },
        MemPool {
            name: "kernel_heap",
            start: FAKE_HEAP_START,
            end: FAKE_HEAP_END,
            flags: PmpPerms::R.union(PmpPerms::W),
            tag: PmpPriority::Kernel,
        },
        MemPool {
            name: "kernel_stack",
            start: FAKE_STACK_BOTTOM,
            end: FAKE_STACK_TOP,
            flags: PmpPerms::R.union(PmpPerms::W),
            tag: PmpPriority::Kernel,
        },
    ]
}

/// Records where the initial frame would go without touching memory -- fake
/// task stacks are addresses, not storage.
pub fn reinitialize(task: &mut Task) {
    let stack_top = task.descriptor().initial_stack & !0xF;
    task.save_mut().frame = stack_top.wrapping_sub(FRAME_SIZE as u32) as usize;
}

pub fn start_first_task(
    _tick_divisor: u32,
    _preemptive: bool,
    _task: &mut Task,
) -> ! {
    panic!("cannot enter tasks on a simulated target");
}

/// Serializes tests that touch process-wide state (the shadow PMP registers
/// and the kernel singletons). The standard test harness runs tests on
/// multiple threads; anything poking those statics must hold this.
#[cfg(test)]
pub fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Test helper: returns all shadowed "hardware" PMP registers to reset
/// state.
#[cfg(test)]
pub fn reset_hardware() {
    for r in &PMPCFG {
        r.store(0, Ordering::Relaxed);
    }
    for r in &PMPADDR {
        r.store(0, Ordering::Relaxed);
    }
}
