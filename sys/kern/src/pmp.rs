// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Physical Memory Protection region engine.
//!
//! The PMP gives us up to 16 hardware-checked regions per hart. We run every
//! region in Top-Of-Range mode, so regions have byte-granular, arbitrarily
//! sized extents: the hardware address register for slot `i` holds the
//! *exclusive upper bound* of region `i`, and the implicit lower bound is
//! slot `i-1`'s upper bound. The `addr_start` we track is a software
//! convenience; only `addr_end` ever reaches the hardware.
//!
//! The kernel keeps a shadow of the hardware configuration in
//! [`PmpConfig`]. The shadow is the source of truth for software decisions
//! (`check_access`, region allocation, eviction) and is updated only after
//! the corresponding hardware write succeeds, so the two can't disagree.
//!
//! A disabled region is represented in the shadow as
//! `addr_start == addr_end == 0` with empty permissions. `check_access`
//! skips entries in that shape rather than consulting the hardware A-field;
//! the shadow doesn't always mirror `A=OFF` exactly (a region can be
//! disabled in hardware while the shadow still carries stale bounds during
//! `init`), and this convention is what the rest of the kernel relies on.

use crate::arch;
use crate::spinlock::SpinLock;
use abi::Error;

/// Number of PMP regions the hardware provides.
pub const PMP_MAX_REGIONS: usize = 16;

// Per-region configuration byte layout within a pmpcfg register:
// bit 7 = L (lock), bits 4:3 = A (address mode), bits 2:0 = X/W/R.
const PMPCFG_A_TOR: u8 = 0x1 << 3;
const PMPCFG_L: u8 = 1 << 7;

bitflags::bitflags! {
    /// Region permission bits, in the hardware's R/W/X encoding.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    #[repr(transparent)]
    pub struct PmpPerms: u8 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
    }
}

/// Eviction priority of a region or flexpage. Lower numeric value means
/// higher priority, i.e. *less* eligible for eviction: kernel regions are
/// never evicted while the kernel is live, temporary mappings go first.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u8)]
pub enum PmpPriority {
    Kernel = 0,
    Stack = 1,
    Shared = 2,
    Temporary = 3,
}

/// One region's worth of shadow state.
#[derive(Copy, Clone, Debug)]
pub struct PmpRegion {
    /// Start address, inclusive. Software bookkeeping only; the hardware
    /// derives the lower bound from the previous slot in TOR mode.
    pub addr_start: u32,
    /// End address, exclusive. This is what the address register holds.
    pub addr_end: u32,
    pub perms: PmpPerms,
    pub priority: PmpPriority,
    /// Hardware region index, 0..16.
    pub region_id: u8,
    /// Once set, the region cannot be modified until the next `init`.
    pub locked: bool,
}

impl PmpRegion {
    const fn disabled_slot(region_id: u8) -> Self {
        Self {
            addr_start: 0,
            addr_end: 0,
            perms: PmpPerms::empty(),
            priority: PmpPriority::Temporary,
            region_id,
            locked: false,
        }
    }

    /// A region whose shadow is all-zero is disabled and skipped by access
    /// checks.
    pub fn is_disabled(&self) -> bool {
        self.addr_start == 0 && self.addr_end == 0 && self.perms.is_empty()
    }
}

/// Static memory pool descriptor, used to prime the PMP at boot from the
/// linker-script layout.
#[derive(Copy, Clone, Debug)]
pub struct MemPool {
    pub name: &'static str,
    /// Start address, inclusive.
    pub start: u32,
    /// End address, exclusive.
    pub end: u32,
    pub flags: PmpPerms,
    pub tag: PmpPriority,
}

/// Shadow of the whole PMP unit, plus allocation bookkeeping.
pub struct PmpConfig {
    regions: [PmpRegion; PMP_MAX_REGIONS],
    /// One past the highest region index ever configured.
    region_count: u8,
    /// Rotating hint for [`Self::alloc_region`].
    next_region_idx: u8,
    initialized: bool,
}

/// Computes which pmpcfg register and which bit offset within it hold the
/// configuration byte for `region_id`.
fn cfg_indices(region_id: u8) -> (u8, u32) {
    (region_id / 4, u32::from(region_id % 4) * 8)
}

impl PmpConfig {
    pub const fn new() -> Self {
        let mut regions = [PmpRegion::disabled_slot(0); PMP_MAX_REGIONS];
        let mut i = 0;
        while i < PMP_MAX_REGIONS {
            regions[i].region_id = i as u8;
            i += 1;
        }
        Self {
            regions,
            region_count: 0,
            next_region_idx: 0,
            initialized: false,
        }
    }

    /// Resets every hardware region (address registers and configuration
    /// bytes) and the shadow table.
    pub fn init(&mut self) {
        for i in 0..PMP_MAX_REGIONS as u8 {
            arch::write_pmpaddr(i, 0);
            if i % 4 == 0 {
                arch::write_pmpcfg(i / 4, 0);
            }
            self.regions[usize::from(i)] = PmpRegion::disabled_slot(i);
        }
        self.region_count = 0;
        self.next_region_idx = 0;
        self.initialized = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Writes one region to the hardware and mirrors it in the shadow.
    ///
    /// `region.region_id` selects the slot. Fails with `PmpInvalidRegion`
    /// for an out-of-range slot, `PmpAddrRange` for an inverted or empty
    /// range, and `PmpLocked` if the slot was locked.
    pub fn set_region(&mut self, region: &PmpRegion) -> Result<(), Error> {
        if usize::from(region.region_id) >= PMP_MAX_REGIONS {
            return Err(Error::PmpInvalidRegion);
        }
        if region.addr_start >= region.addr_end {
            return Err(Error::PmpAddrRange);
        }
        let idx = region.region_id;
        if self.regions[usize::from(idx)].locked {
            return Err(Error::PmpLocked);
        }

        let (cfg_idx, cfg_offset) = cfg_indices(idx);

        let mut cfg_byte = PMPCFG_A_TOR | region.perms.bits();
        if region.locked {
            cfg_byte |= PMPCFG_L;
        }

        // Read-modify-write the packed configuration register so the other
        // three regions in it are preserved. The address register is written
        // first; the region only becomes live once its A-field lands.
        let mut cfg_val = arch::read_pmpcfg(cfg_idx);
        cfg_val &= !(0xFFu32 << cfg_offset);
        cfg_val |= u32::from(cfg_byte) << cfg_offset;

        arch::write_pmpaddr(idx, region.addr_end);
        arch::write_pmpcfg(cfg_idx, cfg_val);

        self.regions[usize::from(idx)] = PmpRegion {
            region_id: idx,
            ..*region
        };
        if idx >= self.region_count {
            self.region_count = idx + 1;
        }
        Ok(())
    }

    /// Clears a region's configuration byte (its address mode becomes OFF)
    /// and zeroes the shadow bounds. Locked regions refuse.
    pub fn disable_region(&mut self, region_idx: u8) -> Result<(), Error> {
        if usize::from(region_idx) >= PMP_MAX_REGIONS {
            return Err(Error::PmpInvalidRegion);
        }
        if self.regions[usize::from(region_idx)].locked {
            return Err(Error::PmpLocked);
        }

        let (cfg_idx, cfg_offset) = cfg_indices(region_idx);
        let mut cfg_val = arch::read_pmpcfg(cfg_idx);
        cfg_val &= !(0xFFu32 << cfg_offset);
        arch::write_pmpcfg(cfg_idx, cfg_val);

        let slot = &mut self.regions[usize::from(region_idx)];
        slot.addr_start = 0;
        slot.addr_end = 0;
        slot.perms = PmpPerms::empty();
        Ok(())
    }

    /// ORs the lock bit into a region's configuration byte. Irreversible
    /// until the next `init`.
    pub fn lock_region(&mut self, region_idx: u8) -> Result<(), Error> {
        if usize::from(region_idx) >= PMP_MAX_REGIONS {
            return Err(Error::PmpInvalidRegion);
        }

        let (cfg_idx, cfg_offset) = cfg_indices(region_idx);
        let mut cfg_val = arch::read_pmpcfg(cfg_idx);
        let cfg_byte = ((cfg_val >> cfg_offset) & 0xFF) as u8 | PMPCFG_L;
        cfg_val &= !(0xFFu32 << cfg_offset);
        cfg_val |= u32::from(cfg_byte) << cfg_offset;
        arch::write_pmpcfg(cfg_idx, cfg_val);

        self.regions[usize::from(region_idx)].locked = true;
        Ok(())
    }

    /// Reads a region's shadow state.
    pub fn get_region(&self, region_idx: u8) -> Result<PmpRegion, Error> {
        if usize::from(region_idx) >= PMP_MAX_REGIONS {
            return Err(Error::PmpInvalidRegion);
        }
        Ok(self.regions[usize::from(region_idx)])
    }

    /// Checks whether `[addr, addr + size)` is permitted by the configured
    /// regions.
    ///
    /// Regions are scanned in index order (the hardware's priority order);
    /// the first region that fully contains the access decides the answer
    /// from its permission bits. Disabled shadow entries are skipped. An
    /// access no region contains is denied.
    pub fn check_access(
        &self,
        addr: u32,
        size: u32,
        is_write: bool,
        is_execute: bool,
    ) -> bool {
        let access_end = addr.wrapping_add(size);

        for region in &self.regions[..usize::from(self.region_count)] {
            if region.addr_start == 0 && region.addr_end == 0 {
                continue;
            }
            if addr >= region.addr_start && access_end <= region.addr_end {
                let mut required = PmpPerms::empty();
                if is_write {
                    required |= PmpPerms::W;
                }
                if is_execute {
                    required |= PmpPerms::X;
                }
                if !is_write && !is_execute {
                    required = PmpPerms::R;
                }
                return region.perms.contains(required);
            }
        }
        false
    }

    /// Finds a free (disabled, unlocked) hardware slot, starting the scan at
    /// the rotating hint. Used by the flexpage layer when making a page
    /// resident.
    pub fn alloc_region(&mut self) -> Result<u8, Error> {
        for step in 0..PMP_MAX_REGIONS as u8 {
            let idx = (self.next_region_idx + step) % PMP_MAX_REGIONS as u8;
            let slot = &self.regions[usize::from(idx)];
            if slot.is_disabled() && !slot.locked {
                self.next_region_idx = (idx + 1) % PMP_MAX_REGIONS as u8;
                return Ok(idx);
            }
        }
        Err(Error::PmpNoRegions)
    }

    /// Resets the unit and configures one region per pool descriptor,
    /// assigned to slots in order.
    pub fn init_pools(&mut self, pools: &[MemPool]) -> Result<(), Error> {
        if pools.is_empty() || pools.len() > PMP_MAX_REGIONS {
            return Err(Error::PmpInvalidRegion);
        }
        self.init();

        for (i, pool) in pools.iter().enumerate() {
            if pool.start >= pool.end {
                return Err(Error::PmpAddrRange);
            }
            self.set_region(&PmpRegion {
                addr_start: pool.start,
                addr_end: pool.end,
                perms: pool.flags,
                priority: pool.tag,
                region_id: i as u8,
                locked: false,
            })?;
        }
        Ok(())
    }

    /// Primes the PMP with the five standard kernel pools (text, data, bss,
    /// heap, stack) from the linker layout.
    pub fn init_kernel(&mut self) -> Result<(), Error> {
        self.init_pools(&arch::kernel_pools())
    }
}

impl Default for PmpConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide PMP shadow. All mutation happens from kernel context
/// under the interrupt-masking lock.
static PMP: SpinLock<PmpConfig> = SpinLock::new(PmpConfig::new());

/// Runs `body` with exclusive access to the global PMP configuration.
pub fn with_config<R>(body: impl FnOnce(&mut PmpConfig) -> R) -> R {
    body(&mut PMP.lock())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (impl Drop, PmpConfig) {
        let guard = crate::arch::test_guard();
        crate::arch::reset_hardware();
        let mut cfg = PmpConfig::new();
        cfg.init();
        (guard, cfg)
    }

    fn region(id: u8, start: u32, end: u32, perms: PmpPerms) -> PmpRegion {
        PmpRegion {
            addr_start: start,
            addr_end: end,
            perms,
            priority: PmpPriority::Shared,
            region_id: id,
            locked: false,
        }
    }

    #[test]
    fn set_then_get_round_trips() {
        let (_g, mut cfg) = setup();
        let r = region(3, 0x1000, 0x2000, PmpPerms::R | PmpPerms::W);
        cfg.set_region(&r).unwrap();

        let back = cfg.get_region(3).unwrap();
        assert_eq!(back.addr_start, r.addr_start);
        assert_eq!(back.addr_end, r.addr_end);
        assert_eq!(back.perms, r.perms);
        assert_eq!(back.region_id, 3);
        assert!(!back.locked);
    }

    #[test]
    fn shadow_matches_hardware_bytes() {
        let (_g, mut cfg) = setup();
        cfg.set_region(&region(5, 0x4000, 0x5000, PmpPerms::R)).unwrap();

        // Region 5 lives in pmpcfg1 at bit offset 8.
        let cfg_val = crate::arch::read_pmpcfg(1);
        let byte = ((cfg_val >> 8) & 0xFF) as u8;
        assert_eq!(byte, PMPCFG_A_TOR | PmpPerms::R.bits());
        assert_eq!(crate::arch::read_pmpaddr(5), 0x5000);
    }

    #[test]
    fn neighbours_in_same_cfg_register_survive() {
        let (_g, mut cfg) = setup();
        cfg.set_region(&region(4, 0x1000, 0x2000, PmpPerms::R)).unwrap();
        cfg.set_region(&region(5, 0x2000, 0x3000, PmpPerms::W)).unwrap();
        cfg.disable_region(5).unwrap();

        let cfg_val = crate::arch::read_pmpcfg(1);
        assert_eq!((cfg_val & 0xFF) as u8, PMPCFG_A_TOR | PmpPerms::R.bits());
        assert_eq!((cfg_val >> 8) & 0xFF, 0);
    }

    #[test]
    fn rejects_bad_region_parameters() {
        let (_g, mut cfg) = setup();
        assert_eq!(
            cfg.set_region(&region(16, 0x1000, 0x2000, PmpPerms::R)),
            Err(Error::PmpInvalidRegion)
        );
        assert_eq!(
            cfg.set_region(&region(0, 0x2000, 0x1000, PmpPerms::R)),
            Err(Error::PmpAddrRange)
        );
        assert_eq!(
            cfg.set_region(&region(0, 0x2000, 0x2000, PmpPerms::R)),
            Err(Error::PmpAddrRange)
        );
    }

    #[test]
    fn locked_region_refuses_mutation() {
        let (_g, mut cfg) = setup();
        cfg.set_region(&region(2, 0x1000, 0x2000, PmpPerms::R)).unwrap();
        cfg.lock_region(2).unwrap();

        assert_eq!(
            cfg.set_region(&region(2, 0x3000, 0x4000, PmpPerms::W)),
            Err(Error::PmpLocked)
        );
        assert_eq!(cfg.disable_region(2), Err(Error::PmpLocked));
        // The shadow still shows the original extent, with the lock bit.
        let r = cfg.get_region(2).unwrap();
        assert!(r.locked);
        assert_eq!(r.addr_end, 0x2000);

        // init clears the lock; the region becomes usable again.
        cfg.init();
        assert!(cfg.set_region(&region(2, 0x3000, 0x4000, PmpPerms::W)).is_ok());
    }

    #[test]
    fn check_access_honors_permissions_and_bounds() {
        let (_g, mut cfg) = setup();
        cfg.set_region(&region(0, 0x1000, 0x2000, PmpPerms::R | PmpPerms::X))
            .unwrap();
        cfg.set_region(&region(1, 0x2000, 0x3000, PmpPerms::R | PmpPerms::W))
            .unwrap();

        // Reads and execution in the text-like region.
        assert!(cfg.check_access(0x1000, 4, false, false));
        assert!(cfg.check_access(0x1ffc, 4, false, true));
        assert!(!cfg.check_access(0x1000, 4, true, false));

        // Writes only in the data-like region.
        assert!(cfg.check_access(0x2800, 8, true, false));
        assert!(!cfg.check_access(0x2800, 8, false, true));

        // Out of all regions, or spanning past a region's end: denied. The
        // scan takes the first containing region, so an access straddling
        // the 0x2000 boundary belongs to no single region.
        assert!(!cfg.check_access(0x4000, 4, false, false));
        assert!(!cfg.check_access(0x1ffc, 8, false, false));
    }

    #[test]
    fn check_access_skips_disabled_slots() {
        let (_g, mut cfg) = setup();
        cfg.set_region(&region(0, 0x1000, 0x2000, PmpPerms::R)).unwrap();
        cfg.set_region(&region(1, 0x1000, 0x2000, PmpPerms::R | PmpPerms::W))
            .unwrap();
        cfg.disable_region(0).unwrap();

        // With slot 0 disabled, slot 1 decides -- and it allows writes.
        assert!(cfg.check_access(0x1800, 4, true, false));
    }

    #[test]
    fn alloc_region_rotates_and_exhausts() {
        let (_g, mut cfg) = setup();
        cfg.set_region(&region(0, 0x1000, 0x2000, PmpPerms::R)).unwrap();

        let a = cfg.alloc_region().unwrap();
        assert_eq!(a, 1);
        cfg.set_region(&region(a, 0x2000, 0x3000, PmpPerms::R)).unwrap();
        let b = cfg.alloc_region().unwrap();
        assert_eq!(b, 2);

        // Fill everything; the next allocation must fail.
        for i in 2..16u8 {
            cfg.set_region(&region(i, 0x1000 * (i as u32 + 1), 0x1000 * (i as u32 + 2), PmpPerms::R))
                .unwrap();
        }
        assert_eq!(cfg.alloc_region(), Err(Error::PmpNoRegions));
    }

    #[test]
    fn kernel_pools_prime_the_low_regions() {
        let (_g, mut cfg) = setup();
        cfg.init_kernel().unwrap();

        // The boot-time contract: pmpcfg0 is live and pmpaddr0 carries the
        // end of kernel text.
        assert_ne!(crate::arch::read_pmpcfg(0), 0);
        assert_eq!(crate::arch::read_pmpaddr(0), crate::arch::FAKE_ETEXT);

        // Kernel text is executable but not writable; data is the reverse.
        assert!(cfg.check_access(crate::arch::FAKE_STEXT, 4, false, true));
        assert!(!cfg.check_access(crate::arch::FAKE_STEXT, 4, true, false));
        assert!(cfg.check_access(crate::arch::FAKE_SDATA, 4, true, false));

        // All five pools occupy slots 0..5.
        assert_eq!(cfg.get_region(4).unwrap().priority, PmpPriority::Kernel);
        assert!(cfg.get_region(5).unwrap().is_disabled());
    }

    #[test]
    fn init_pools_rejects_inverted_pool() {
        let (_g, mut cfg) = setup();
        let bad = [MemPool {
            name: "backwards",
            start: 0x2000,
            end: 0x1000,
            flags: PmpPerms::R,
            tag: PmpPriority::Kernel,
        }];
        assert_eq!(cfg.init_pools(&bad), Err(Error::PmpAddrRange));
    }
}
