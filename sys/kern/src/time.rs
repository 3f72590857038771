// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel time.

use core::sync::atomic::{AtomicU32, Ordering};

/// A point in kernel time: the number of timer ticks since boot. How long
/// a tick lasts is the application's choice (the timer divisor).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<[u32; 2]> for Timestamp {
    fn from(v: [u32; 2]) -> Self {
        Self::from(u64::from(v[0]) | u64::from(v[1]) << 32)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

/// The tick counter behind [`now`].
///
/// RV32 has no 64-bit atomics, so the count is split into two `AtomicU32`
/// halves -- low word first. The split is harmless because the only writer
/// is the timer path, which runs with interrupts masked; readers can never
/// observe the two halves mid-update.
static TICKS: [AtomicU32; 2] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const ZERO: AtomicU32 = AtomicU32::new(0);
    [ZERO; 2]
};

/// Reads the tick counter.
///
/// The timer interrupt cannot preempt kernel code, so the two nonatomic
/// halves are consistent.
pub fn now() -> Timestamp {
    Timestamp::from([
        TICKS[0].load(Ordering::Relaxed),
        TICKS[1].load(Ordering::Relaxed),
    ])
}

/// Advances the kernel's notion of time by one tick. Called from the timer
/// interrupt path (and from tests standing in for it).
pub(crate) fn advance_tick() -> Timestamp {
    let t0 = TICKS[0].load(Ordering::Relaxed);
    let t1 = TICKS[1].load(Ordering::Relaxed);

    let (t0, t1) = if let Some(t0p) = t0.checked_add(1) {
        TICKS[0].store(t0p, Ordering::Relaxed);
        (t0p, t1)
    } else {
        // The low word rolled over. Checked addition on the high word: an
        // overflow there after 2^64 ticks would indicate state corruption
        // worth discovering.
        TICKS[0].store(0, Ordering::Relaxed);
        TICKS[1].store(t1 + 1, Ordering::Relaxed);
        (0, t1 + 1)
    };
    Timestamp::from([t0, t1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_word_order() {
        let t = Timestamp::from([0x5678, 0x1234]);
        assert_eq!(u64::from(t), 0x1234_0000_5678);
    }

    #[test]
    fn ticks_advance_monotonically() {
        let _guard = crate::arch::test_guard();
        let a = advance_tick();
        let b = advance_tick();
        assert!(b > a);
        assert!(now() >= b);
    }
}
