// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flexpages and memory spaces.
//!
//! A *flexpage* describes one contiguous physical range with R/W/X
//! permissions and an eviction priority; it can be made resident by loading
//! it into a PMP slot. A *memory space* is the set of flexpages forming a
//! task's view of memory. Spaces own their flexpages: destroying a space
//! destroys every page it holds.
//!
//! There is no allocator in this kernel, so pages and spaces live in fixed
//! arenas and are named by `u16` slot indices. The original intrusive
//! chains survive as index links: each flexpage carries one link for its
//! owning space's page list, one for a mapping chain (delegation), and one
//! for the space's resident (PMP-loaded) list.
//!
//! Residency is demand-driven. `activate` walks a space's pages and loads
//! whatever isn't resident, evicting by policy when hardware slots run out:
//! victims are picked by highest priority value first (temporary mappings
//! before shared, shared before stacks), kernel pages are never victims,
//! and ties fall to the least-recently-used page by its `used` counter.

use crate::pmp::{self, PmpConfig, PmpPerms, PmpPriority, PmpRegion};
use crate::spinlock::SpinLock;
use abi::Error;

/// Memory-space identifier, chosen by the creator.
pub type AsId = u16;
/// Arena index naming a flexpage.
pub type FpageId = u16;

/// Capacity of the flexpage arena.
pub const MAX_FPAGES: usize = 32;
/// Capacity of the memory-space arena.
pub const MAX_SPACES: usize = 8;

/// List terminator for the intrusive index links.
const NO_LINK: u16 = u16::MAX;

bitflags::bitflags! {
    /// Flexpage status flags.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    #[repr(transparent)]
    pub struct FpageFlags: u32 {
        /// Currently resident in a hardware region.
        const LOADED = 1 << 0;
        /// Part of a mapping chain rooted in another page.
        const MAPPED = 1 << 1;
    }
}

/// Descriptor of a contiguous physical range with protection attributes.
#[derive(Copy, Clone, Debug)]
pub struct Fpage {
    /// Next page in the owning space's list.
    as_next: u16,
    /// Next page in the mapping (delegation) chain.
    map_next: u16,
    /// Next page in the owning space's resident list.
    pmp_next: u16,
    /// Arena slot of the owning space, if attached.
    owner: Option<u16>,

    pub base: u32,
    pub size: u32,
    pub perms: PmpPerms,
    pub priority: PmpPriority,
    /// Hardware region this page occupies while resident.
    pub pmp_id: Option<u8>,
    pub flags: FpageFlags,
    /// Bumped every time the page is loaded or touched by activation;
    /// the eviction tie-breaker.
    pub used: u32,
}

/// A task's view of memory: the collection of its flexpages.
#[derive(Copy, Clone, Debug)]
pub struct MemSpace {
    pub as_id: AsId,
    /// Head of the flexpage list.
    first: u16,
    /// Head of the resident (PMP-loaded) list.
    pmp_first: u16,
    /// Head of the stack-region list; stack pages are kept separate so
    /// they can be found quickly on switch.
    stack_first: u16,
    pub shared: bool,
}

/// Both arenas, guarded as one unit.
pub struct MemProt {
    fpages: [Option<Fpage>; MAX_FPAGES],
    spaces: [Option<MemSpace>; MAX_SPACES],
}

impl MemProt {
    pub const fn new() -> Self {
        Self {
            fpages: [None; MAX_FPAGES],
            spaces: [None; MAX_SPACES],
        }
    }

    /// Creates a flexpage in the arena. The page starts unattached and
    /// non-resident.
    pub fn fpage_create(
        &mut self,
        base: u32,
        size: u32,
        perms: PmpPerms,
        priority: PmpPriority,
    ) -> Result<FpageId, Error> {
        if size == 0 {
            return Err(Error::PmpAddrRange);
        }
        let slot = self
            .fpages
            .iter()
            .position(|s| s.is_none())
            .ok_or(Error::Fail)?;
        self.fpages[slot] = Some(Fpage {
            as_next: NO_LINK,
            map_next: NO_LINK,
            pmp_next: NO_LINK,
            owner: None,
            base,
            size,
            perms,
            priority,
            pmp_id: None,
            flags: FpageFlags::empty(),
            used: 0,
        });
        Ok(slot as FpageId)
    }

    /// Destroys a flexpage, evicting it first if resident and unlinking it
    /// from its owner. Destroying an already-vacant slot is a no-op, per
    /// the defensive destroy contract.
    pub fn fpage_destroy(
        &mut self,
        pmp: &mut PmpConfig,
        id: FpageId,
    ) -> Result<(), Error> {
        let Some(page) = self.fpage(id) else {
            return Ok(());
        };
        if page.pmp_id.is_some() {
            self.evict_fpage(pmp, id)?;
        }
        if let Some(owner) = self.fpages[usize::from(id)].unwrap().owner {
            self.detach(owner, id);
        }
        self.fpages[usize::from(id)] = None;
        Ok(())
    }

    pub fn fpage(&self, id: FpageId) -> Option<&Fpage> {
        self.fpages.get(usize::from(id))?.as_ref()
    }

    /// Creates a memory space with the given identifier.
    pub fn memspace_create(
        &mut self,
        as_id: AsId,
        shared: bool,
    ) -> Result<(), Error> {
        if self.space_slot(as_id).is_some() {
            return Err(Error::Fail);
        }
        let slot = self
            .spaces
            .iter()
            .position(|s| s.is_none())
            .ok_or(Error::Fail)?;
        self.spaces[slot] = Some(MemSpace {
            as_id,
            first: NO_LINK,
            pmp_first: NO_LINK,
            stack_first: NO_LINK,
            shared,
        });
        Ok(())
    }

    /// Destroys a memory space and every flexpage it owns. Destroying an
    /// absent space is a no-op.
    pub fn memspace_destroy(
        &mut self,
        pmp: &mut PmpConfig,
        as_id: AsId,
    ) -> Result<(), Error> {
        let Some(slot) = self.space_slot(as_id) else {
            return Ok(());
        };
        let space = self.spaces[slot].unwrap();

        for head in [space.first, space.stack_first] {
            let mut cursor = head;
            while cursor != NO_LINK {
                let next = self.fpages[usize::from(cursor)].unwrap().as_next;
                // Pages being destroyed wholesale don't need list surgery;
                // clear the owner so destroy skips the detach walk.
                self.fpages[usize::from(cursor)].as_mut().unwrap().owner = None;
                self.fpage_destroy(pmp, cursor)?;
                cursor = next;
            }
        }
        self.spaces[slot] = None;
        Ok(())
    }

    /// Links an unattached flexpage into a space. Stack-priority pages go
    /// on the space's stack list, everything else on the general list.
    pub fn memspace_attach(
        &mut self,
        as_id: AsId,
        id: FpageId,
    ) -> Result<(), Error> {
        let slot = self.space_slot(as_id).ok_or(Error::Fail)?;
        let page = self.fpage(id).ok_or(Error::Fail)?;
        if page.owner.is_some() {
            return Err(Error::TaskBusy);
        }
        let is_stack = page.priority == PmpPriority::Stack;

        let space = self.spaces[slot].as_mut().unwrap();
        let head = if is_stack {
            &mut space.stack_first
        } else {
            &mut space.first
        };
        let old_head = core::mem::replace(head, id);
        let page = self.fpages[usize::from(id)].as_mut().unwrap();
        page.as_next = old_head;
        page.owner = Some(slot as u16);
        Ok(())
    }

    /// Makes a flexpage resident in hardware region `region_idx`.
    pub fn load_fpage(
        &mut self,
        pmp: &mut PmpConfig,
        id: FpageId,
        region_idx: u8,
    ) -> Result<(), Error> {
        let page = *self.fpage(id).ok_or(Error::Fail)?;
        if page.pmp_id.is_some() {
            return Err(Error::TaskBusy);
        }
        pmp.set_region(&PmpRegion {
            addr_start: page.base,
            addr_end: page.base.wrapping_add(page.size),
            perms: page.perms,
            priority: page.priority,
            region_id: region_idx,
            locked: false,
        })?;

        // Hardware write succeeded; record residency and link into the
        // owner's resident list.
        let owner = page.owner;
        {
            let page = self.fpages[usize::from(id)].as_mut().unwrap();
            page.pmp_id = Some(region_idx);
            page.flags |= FpageFlags::LOADED;
            page.used = page.used.wrapping_add(1);
        }
        if let Some(owner) = owner {
            let space = self.spaces[usize::from(owner)].as_mut().unwrap();
            let old_head = core::mem::replace(&mut space.pmp_first, id);
            self.fpages[usize::from(id)].as_mut().unwrap().pmp_next = old_head;
        }
        Ok(())
    }

    /// Removes a flexpage from its hardware region. Evicting a
    /// non-resident page is a no-op.
    pub fn evict_fpage(
        &mut self,
        pmp: &mut PmpConfig,
        id: FpageId,
    ) -> Result<(), Error> {
        let page = *self.fpage(id).ok_or(Error::Fail)?;
        let Some(region_idx) = page.pmp_id else {
            return Ok(());
        };
        pmp.disable_region(region_idx)?;

        if let Some(owner) = page.owner {
            let space = self.spaces[usize::from(owner)].as_mut().unwrap();
            let head = space.pmp_first;
            let new_head = self.unlink_pmp(head, id);
            self.spaces[usize::from(owner)].as_mut().unwrap().pmp_first =
                new_head;
        }
        let page = self.fpages[usize::from(id)].as_mut().unwrap();
        page.pmp_id = None;
        page.pmp_next = NO_LINK;
        page.flags &= !FpageFlags::LOADED;
        Ok(())
    }

    /// Ensures every flexpage of `as_id` is resident, loading into free
    /// hardware slots and evicting by policy when none remain.
    pub fn activate(
        &mut self,
        pmp: &mut PmpConfig,
        as_id: AsId,
    ) -> Result<(), Error> {
        let slot = self.space_slot(as_id).ok_or(Error::Fail)?;
        let space = self.spaces[slot].unwrap();

        // Snapshot the page ids first; loading rewires the links.
        let mut wanted = [NO_LINK; MAX_FPAGES];
        let mut n = 0;
        for head in [space.first, space.stack_first] {
            let mut cursor = head;
            while cursor != NO_LINK {
                wanted[n] = cursor;
                n += 1;
                cursor = self.fpages[usize::from(cursor)].unwrap().as_next;
            }
        }

        for &id in &wanted[..n] {
            let page = self.fpages[usize::from(id)].unwrap();
            if page.pmp_id.is_some() {
                // Already resident; refresh its recency.
                let page = self.fpages[usize::from(id)].as_mut().unwrap();
                page.used = page.used.wrapping_add(1);
                continue;
            }
            let region_idx = match pmp.alloc_region() {
                Ok(idx) => idx,
                Err(Error::PmpNoRegions) => {
                    let victim =
                        self.pick_victim().ok_or(Error::PmpNoRegions)?;
                    let freed =
                        self.fpages[usize::from(victim)].unwrap().pmp_id;
                    self.evict_fpage(pmp, victim)?;
                    freed.ok_or(Error::PmpNoRegions)?
                }
                Err(e) => return Err(e),
            };
            self.load_fpage(pmp, id, region_idx)?;
        }
        Ok(())
    }

    /// Chooses the resident flexpage to evict: highest priority value
    /// first, kernel pages never, ties to the smallest `used` count.
    fn pick_victim(&self) -> Option<FpageId> {
        let mut best: Option<(FpageId, PmpPriority, u32)> = None;
        for (i, page) in self.fpages.iter().enumerate() {
            let Some(page) = page else { continue };
            if page.pmp_id.is_none() || page.priority == PmpPriority::Kernel {
                continue;
            }
            let candidate = (i as FpageId, page.priority, page.used);
            best = match best {
                None => Some(candidate),
                Some((_, p, u))
                    if page.priority > p
                        || (page.priority == p && page.used < u) =>
                {
                    Some(candidate)
                }
                keep => keep,
            };
        }
        best.map(|(id, _, _)| id)
    }

    fn space_slot(&self, as_id: AsId) -> Option<usize> {
        self.spaces
            .iter()
            .position(|s| matches!(s, Some(space) if space.as_id == as_id))
    }

    /// Returns a space's resident-list length, for diagnostics and tests.
    pub fn resident_count(&self, as_id: AsId) -> usize {
        let Some(slot) = self.space_slot(as_id) else {
            return 0;
        };
        let mut n = 0;
        let mut cursor = self.spaces[slot].unwrap().pmp_first;
        while cursor != NO_LINK {
            n += 1;
            cursor = self.fpages[usize::from(cursor)].unwrap().pmp_next;
        }
        n
    }

    /// Unlinks `target` from the owning-space list rooted at the space
    /// slot's heads.
    fn detach(&mut self, owner_slot: u16, target: FpageId) {
        let space = self.spaces[usize::from(owner_slot)].unwrap();
        let is_stack = self.fpages[usize::from(target)].unwrap().priority
            == PmpPriority::Stack;
        let head = if is_stack { space.stack_first } else { space.first };
        let new_head = self.unlink_as(head, target);
        let space = self.spaces[usize::from(owner_slot)].as_mut().unwrap();
        if is_stack {
            space.stack_first = new_head;
        } else {
            space.first = new_head;
        }
    }

    /// Removes `target` from the chain threaded through `as_next`,
    /// returning the (possibly unchanged) head.
    fn unlink_as(&mut self, head: u16, target: FpageId) -> u16 {
        if head == target {
            let page = self.fpages[usize::from(target)].as_mut().unwrap();
            return core::mem::replace(&mut page.as_next, NO_LINK);
        }
        let mut cursor = head;
        while cursor != NO_LINK {
            let next = self.fpages[usize::from(cursor)].unwrap().as_next;
            if next == target {
                let after =
                    self.fpages[usize::from(target)].as_mut().unwrap().as_next;
                self.fpages[usize::from(target)].as_mut().unwrap().as_next =
                    NO_LINK;
                self.fpages[usize::from(cursor)].as_mut().unwrap().as_next =
                    after;
                break;
            }
            cursor = next;
        }
        head
    }

    /// Removes `target` from the chain threaded through `pmp_next`,
    /// returning the (possibly unchanged) head.
    fn unlink_pmp(&mut self, head: u16, target: FpageId) -> u16 {
        if head == target {
            let page = self.fpages[usize::from(target)].as_mut().unwrap();
            return core::mem::replace(&mut page.pmp_next, NO_LINK);
        }
        let mut cursor = head;
        while cursor != NO_LINK {
            let next = self.fpages[usize::from(cursor)].unwrap().pmp_next;
            if next == target {
                let after =
                    self.fpages[usize::from(target)].as_mut().unwrap().pmp_next;
                self.fpages[usize::from(target)].as_mut().unwrap().pmp_next =
                    NO_LINK;
                self.fpages[usize::from(cursor)].as_mut().unwrap().pmp_next =
                    after;
                break;
            }
            cursor = next;
        }
        head
    }
}

impl Default for MemProt {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide arenas.
static MEMPROT: SpinLock<MemProt> = SpinLock::new(MemProt::new());

/// Runs `body` with the flexpage arenas and the PMP configuration, in the
/// kernel's canonical lock order.
pub fn with_arena<R>(
    body: impl FnOnce(&mut MemProt, &mut PmpConfig) -> R,
) -> R {
    let mut arena = MEMPROT.lock();
    pmp::with_config(|cfg| body(&mut arena, cfg))
}

/// Context-switch hook: makes the named space resident. Called with
/// interrupts already masked, on the way into the next task.
pub(crate) fn activate_space(as_id: AsId) -> Result<(), Error> {
    with_arena(|arena, pmp| arena.activate(pmp, as_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmp::PmpConfig;

    fn setup() -> (impl Drop, MemProt, PmpConfig) {
        let guard = crate::arch::test_guard();
        crate::arch::reset_hardware();
        let mut pmp = PmpConfig::new();
        pmp.init();
        (guard, MemProt::new(), pmp)
    }

    fn page(
        m: &mut MemProt,
        base: u32,
        priority: PmpPriority,
    ) -> FpageId {
        m.fpage_create(base, 0x1000, PmpPerms::R | PmpPerms::W, priority)
            .unwrap()
    }

    #[test]
    fn create_attach_load_evict_lifecycle() {
        let (_g, mut m, mut pmp) = setup();
        m.memspace_create(7, false).unwrap();
        let fp = page(&mut m, 0x9000_0000, PmpPriority::Shared);
        m.memspace_attach(7, fp).unwrap();

        let region = pmp.alloc_region().unwrap();
        m.load_fpage(&mut pmp, fp, region).unwrap();
        let loaded = m.fpage(fp).unwrap();
        assert_eq!(loaded.pmp_id, Some(region));
        assert!(loaded.flags.contains(FpageFlags::LOADED));
        assert_eq!(m.resident_count(7), 1);
        // The hardware slot now carries the page's upper bound.
        assert_eq!(crate::arch::read_pmpaddr(region), 0x9000_1000);

        m.evict_fpage(&mut pmp, fp).unwrap();
        let evicted = m.fpage(fp).unwrap();
        assert_eq!(evicted.pmp_id, None);
        assert!(!evicted.flags.contains(FpageFlags::LOADED));
        assert_eq!(m.resident_count(7), 0);
        assert!(pmp.get_region(region).unwrap().is_disabled());
    }

    #[test]
    fn double_load_refuses() {
        let (_g, mut m, mut pmp) = setup();
        let fp = page(&mut m, 0x9000_0000, PmpPriority::Shared);
        m.load_fpage(&mut pmp, fp, 0).unwrap();
        assert_eq!(m.load_fpage(&mut pmp, fp, 1), Err(Error::TaskBusy));
    }

    #[test]
    fn memspace_destroy_destroys_owned_pages() {
        let (_g, mut m, mut pmp) = setup();
        m.memspace_create(3, false).unwrap();
        let a = page(&mut m, 0x9000_0000, PmpPriority::Shared);
        let b = page(&mut m, 0x9001_0000, PmpPriority::Stack);
        let c = page(&mut m, 0x9002_0000, PmpPriority::Temporary);
        for fp in [a, b, c] {
            m.memspace_attach(3, fp).unwrap();
        }
        // Make one of them resident so destroy also has to evict.
        let region = pmp.alloc_region().unwrap();
        m.load_fpage(&mut pmp, a, region).unwrap();

        m.memspace_destroy(&mut pmp, 3).unwrap();
        for fp in [a, b, c] {
            assert!(m.fpage(fp).is_none());
        }
        assert!(pmp.get_region(region).unwrap().is_disabled());
        // Slot ids are reusable afterwards.
        m.memspace_create(3, true).unwrap();
    }

    #[test]
    fn activate_loads_all_pages_of_a_space() {
        let (_g, mut m, mut pmp) = setup();
        pmp.init_kernel().unwrap();
        m.memspace_create(1, false).unwrap();
        let a = page(&mut m, 0x9000_0000, PmpPriority::Shared);
        let b = page(&mut m, 0x9001_0000, PmpPriority::Stack);
        m.memspace_attach(1, a).unwrap();
        m.memspace_attach(1, b).unwrap();

        m.activate(&mut pmp, 1).unwrap();
        assert!(m.fpage(a).unwrap().pmp_id.is_some());
        assert!(m.fpage(b).unwrap().pmp_id.is_some());
        assert_eq!(m.resident_count(1), 2);

        // Activating again touches rather than reloads.
        let used_before = m.fpage(a).unwrap().used;
        m.activate(&mut pmp, 1).unwrap();
        assert_eq!(m.fpage(a).unwrap().used, used_before + 1);
        assert_eq!(m.resident_count(1), 2);
    }

    #[test]
    fn eviction_prefers_high_priority_value_then_lru() {
        let (_g, mut m, mut pmp) = setup();
        m.memspace_create(1, false).unwrap();

        // Fill every hardware slot: one kernel page, one stack, the rest
        // split between shared and temporary.
        let kernel = page(&mut m, 0xA000_0000, PmpPriority::Kernel);
        let stack = page(&mut m, 0xA001_0000, PmpPriority::Stack);
        let shared = page(&mut m, 0xA002_0000, PmpPriority::Shared);
        let temp_old = page(&mut m, 0xA003_0000, PmpPriority::Temporary);
        let temp_hot = page(&mut m, 0xA004_0000, PmpPriority::Temporary);
        let mut extra = Vec::new();
        for i in 0..11u32 {
            extra.push(page(
                &mut m,
                0xB000_0000 + i * 0x1_0000,
                PmpPriority::Shared,
            ));
        }
        for fp in [kernel, stack, shared, temp_old, temp_hot]
            .into_iter()
            .chain(extra.iter().copied())
        {
            let region = pmp.alloc_region().unwrap();
            m.load_fpage(&mut pmp, fp, region).unwrap();
        }
        assert_eq!(pmp.alloc_region(), Err(Error::PmpNoRegions));

        // Heat up one temporary page so the cold one is the LRU victim.
        for _ in 0..3 {
            let p = m.fpages[usize::from(temp_hot)].as_mut().unwrap();
            p.used = p.used.wrapping_add(1);
        }

        // A new page in an exhausted PMP forces an eviction.
        let newcomer = page(&mut m, 0xC000_0000, PmpPriority::Shared);
        m.memspace_attach(1, newcomer).unwrap();
        m.activate(&mut pmp, 1).unwrap();

        assert!(m.fpage(newcomer).unwrap().pmp_id.is_some());
        // The cold temporary was chosen over the hot one, over every
        // shared/stack page, and certainly over the kernel page.
        assert_eq!(m.fpage(temp_old).unwrap().pmp_id, None);
        assert!(m.fpage(temp_hot).unwrap().pmp_id.is_some());
        assert!(m.fpage(kernel).unwrap().pmp_id.is_some());
        assert!(m.fpage(stack).unwrap().pmp_id.is_some());
        assert!(m.fpage(shared).unwrap().pmp_id.is_some());
    }

    #[test]
    fn attach_rejects_double_ownership() {
        let (_g, mut m, mut _pmp) = setup();
        m.memspace_create(1, false).unwrap();
        m.memspace_create(2, false).unwrap();
        let fp = page(&mut m, 0x9000_0000, PmpPriority::Shared);
        m.memspace_attach(1, fp).unwrap();
        assert_eq!(m.memspace_attach(2, fp), Err(Error::TaskBusy));
    }

    #[test]
    fn destroy_is_defensive() {
        let (_g, mut m, mut pmp) = setup();
        // Vacant flexpage slot and absent space both succeed quietly.
        assert_eq!(m.fpage_destroy(&mut pmp, 9), Ok(()));
        assert_eq!(m.memspace_destroy(&mut pmp, 42), Ok(()));
    }
}
