//! Anonymous memory maps.
//!
//! An [`Amap`] overlays a mapping with private pages ([`Anon`]s), one per touched page offset.
//! Mappings refer to an amap through an [`Aref`], which adds the mapping's page bias. Both
//! amaps and anons are shared by reference count: an amap is shared between address spaces
//! after fork, an anon between amaps after one of them was copied on write.

use alloc::sync::Arc;

use spin::Mutex;

use super::{
    is_page_aligned, Enomem, Frame, PageOwner, PhysMem, RemovePolicy, SlotError, SlotMap,
    PAGE_SHIFT,
};

/// One page of anonymous memory. The page is freed when the last handle goes away.
#[derive(Debug)]
pub struct Anon {
    page: Frame,
    phys: Arc<PhysMem>,
}

impl Anon {
    /// A fresh, zero-filled anon.
    pub fn alloc(phys: &Arc<PhysMem>) -> Result<Arc<Anon>, Enomem> {
        let page = phys.allocate_zeroed(1)?;
        phys.page_info(page).set_owner(PageOwner::Anon);
        Ok(Arc::new(Anon {
            page,
            phys: Arc::clone(phys),
        }))
    }

    /// A new anon holding a physical copy of this one's page.
    pub fn copy(&self) -> Result<Arc<Anon>, Enomem> {
        let page = self.phys.allocate(1)?;
        self.phys.copy_page(self.page, page);
        self.phys.page_info(page).set_owner(PageOwner::Anon);
        Ok(Arc::new(Anon {
            page,
            phys: Arc::clone(&self.phys),
        }))
    }

    pub fn page(&self) -> Frame {
        self.page
    }
}

impl Drop for Anon {
    fn drop(&mut self) {
        log::trace!("freeing anon page {:?}", self.page);
        self.phys.page_info(self.page).set_owner(PageOwner::None);
        self.phys.free(self.page);
    }
}

#[derive(Debug)]
pub struct Amap {
    slots: Mutex<SlotMap<Arc<Anon>>>,
}

impl Amap {
    pub fn new(policy: RemovePolicy) -> Arc<Amap> {
        Arc::new(Amap {
            slots: Mutex::new(SlotMap::new(policy)),
        })
    }

    pub fn hold(self: &Arc<Self>) -> Arc<Amap> {
        Arc::clone(self)
    }
    pub fn refcount(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().capacity()
    }
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
    pub fn check(&self) -> Result<(), SlotError> {
        self.slots.lock().check()
    }
}

/// A mapping's view of an amap: `slot = pageoff + (offset >> PAGE_SHIFT)`.
#[derive(Debug, Clone)]
pub struct Aref {
    amap: Arc<Amap>,
    pageoff: usize,
}

impl Aref {
    pub fn new(amap: Arc<Amap>, pageoff: usize) -> Self {
        Self { amap, pageoff }
    }

    pub fn amap(&self) -> &Arc<Amap> {
        &self.amap
    }
    pub fn pageoff(&self) -> usize {
        self.pageoff
    }

    pub fn slot(&self, offset: usize) -> usize {
        assert!(is_page_aligned(offset), "unaligned amap offset {:#x}", offset);
        self.pageoff + (offset >> PAGE_SHIFT)
    }

    pub fn lookup(&self, offset: usize) -> Option<Arc<Anon>> {
        let slot = self.slot(offset);
        self.amap.slots.lock().get(slot).cloned()
    }

    /// Number of amap slots, across all amaps, holding the anon at `offset`.
    pub fn anon_holders(&self, offset: usize) -> usize {
        let slot = self.slot(offset);
        self.amap
            .slots
            .lock()
            .get(slot)
            .map_or(0, Arc::strong_count)
    }

    pub fn add(&self, anon: Arc<Anon>, offset: usize) -> Result<(), Enomem> {
        let slot = self.slot(offset);
        self.amap.slots.lock().insert(slot, anon)
    }

    /// Releases the anon at `offset`. Its page is freed unless another amap still holds it.
    pub fn remove(&self, offset: usize) {
        let slot = self.slot(offset);
        let anon = self.amap.slots.lock().remove(slot);
        drop(anon);
    }

    /// Swaps `old` for `new` at `offset`, provided `old` is still there. Used to install a page
    /// that was prepared without holding the amap lock.
    pub fn replace(&self, offset: usize, old: &Arc<Anon>, new: Arc<Anon>) -> bool {
        let slot = self.slot(offset);
        let mut slots = self.amap.slots.lock();
        match slots.get(slot) {
            Some(current) if Arc::ptr_eq(current, old) => {
                let previous = slots.replace(slot, new);
                drop(slots);
                drop(previous);
                true
            }
            _ => false,
        }
    }

    /// Releases every anon in `[offset, offset + len)`.
    pub fn remove_pages(&self, offset: usize, len: usize) {
        assert!(is_page_aligned(len), "unaligned amap length {:#x}", len);
        let first = self.slot(offset);
        let end = first + (len >> PAGE_SHIFT);
        let mut slots = self.amap.slots.lock();
        for slot in slots.occupied_in(first..end) {
            drop(slots.remove(slot));
        }
    }

    /// Makes sure the amap is not shared with another mapping before it is written through.
    ///
    /// A shared amap is replaced by a private one referencing the same anons for the `npages`
    /// pages covered by this mapping. The anons themselves stay shared until written.
    pub fn copy_if_needed(&mut self, npages: usize) -> Result<(), Enomem> {
        if self.amap.refcount() == 1 {
            return Ok(());
        }

        let old = self.amap.slots.lock();
        let mut slots = SlotMap::new(old.policy());
        for slot in old.occupied_in(self.pageoff..self.pageoff + npages) {
            if let Some(anon) = old.get(slot) {
                slots.insert(slot - self.pageoff, Arc::clone(anon))?;
            }
        }
        drop(old);

        log::debug!(
            "amap copied: {} of {} anons in private copy",
            slots.len(),
            self.amap.len()
        );
        self.amap = Arc::new(Amap {
            slots: Mutex::new(slots),
        });
        self.pageoff = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{PhysicalAddress, PAGE_SIZE};
    use proptest::prelude::*;

    fn phys() -> Arc<PhysMem> {
        Arc::new(PhysMem::new(PhysicalAddress::new(0x8000_0000), 64))
    }

    #[test]
    fn add_grow_remove_keeps_later_slot() {
        for policy in [RemovePolicy::Compact, RemovePolicy::Literal] {
            let phys = phys();
            let aref = Aref::new(Amap::new(policy), 0);
            let a = Anon::alloc(&phys).unwrap();
            let b = Anon::alloc(&phys).unwrap();

            aref.add(Arc::clone(&a), 0).unwrap();
            aref.add(Arc::clone(&b), PAGE_SIZE * 5).unwrap();
            assert_eq!(aref.amap().capacity(), 8);

            aref.remove(0);
            let found = aref.lookup(PAGE_SIZE * 5).unwrap();
            assert!(Arc::ptr_eq(&found, &b));
            assert!(aref.lookup(0).is_none());

            match policy {
                RemovePolicy::Compact => assert_eq!(aref.amap().check(), Ok(())),
                RemovePolicy::Literal => assert!(aref.amap().check().is_err()),
            }
        }
    }

    #[test]
    fn lookup_is_idempotent() {
        let phys = phys();
        let aref = Aref::new(Amap::new(RemovePolicy::Compact), 3);
        aref.add(Anon::alloc(&phys).unwrap(), PAGE_SIZE).unwrap();
        let first = aref.lookup(PAGE_SIZE).unwrap();
        let second = aref.lookup(PAGE_SIZE).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(aref.slot(PAGE_SIZE), 4);
        assert!(aref.lookup(PAGE_SIZE * 100).is_none());
    }

    #[test]
    fn dropping_last_reference_frees_every_page() {
        let phys = phys();
        let free = phys.free_count();
        let aref = Aref::new(Amap::new(RemovePolicy::Compact), 0);
        for i in [0, 2, 9] {
            aref.add(Anon::alloc(&phys).unwrap(), i * PAGE_SIZE).unwrap();
        }
        let held = aref.clone();
        drop(aref);
        assert_eq!(phys.free_count(), free - 3);
        drop(held);
        assert_eq!(phys.free_count(), free);
    }

    #[test]
    fn shared_anon_survives_removal_from_one_amap() {
        let phys = phys();
        let mut child = Aref::new(Amap::new(RemovePolicy::Compact), 0);
        let parent = child.clone();
        let anon = Anon::alloc(&phys).unwrap();
        let page = anon.page();
        parent.add(anon, 0).unwrap();

        child.copy_if_needed(4).unwrap();
        assert!(!Arc::ptr_eq(child.amap(), parent.amap()));
        assert_eq!(parent.amap().refcount(), 1);
        assert_eq!(child.anon_holders(0), 2);

        parent.remove(0);
        assert!(phys.is_allocated(page));
        assert_eq!(child.lookup(0).unwrap().page(), page);
        child.remove(0);
        assert!(!phys.is_allocated(page));
    }

    #[test]
    fn copy_if_needed_keeps_exclusive_amap() {
        let mut aref = Aref::new(Amap::new(RemovePolicy::Compact), 2);
        let amap = Arc::clone(aref.amap());
        drop(amap);
        let before = Arc::as_ptr(aref.amap());
        aref.copy_if_needed(1).unwrap();
        assert_eq!(Arc::as_ptr(aref.amap()), before);
        assert_eq!(aref.pageoff(), 2);
    }

    #[test]
    fn copy_if_needed_rebases_to_the_mapping() {
        let phys = phys();
        let shared = Aref::new(Amap::new(RemovePolicy::Compact), 0);
        for i in 0..6 {
            shared.add(Anon::alloc(&phys).unwrap(), i * PAGE_SIZE).unwrap();
        }
        // A mapping covering pages 2..4 of the amap.
        let mut view = Aref::new(shared.amap().hold(), 2);
        view.copy_if_needed(2).unwrap();
        assert_eq!(view.pageoff(), 0);
        assert_eq!(view.amap().len(), 2);
        assert_eq!(
            view.lookup(PAGE_SIZE).unwrap().page(),
            shared.lookup(3 * PAGE_SIZE).unwrap().page()
        );
        assert!(view.lookup(2 * PAGE_SIZE).is_none());
    }

    #[test]
    fn replace_is_revalidated() {
        let phys = phys();
        let aref = Aref::new(Amap::new(RemovePolicy::Compact), 0);
        let original = Anon::alloc(&phys).unwrap();
        phys.fill_page(original.page(), 7);
        aref.add(Arc::clone(&original), 0).unwrap();

        let copy = original.copy().unwrap();
        assert_eq!(phys.page_bytes(copy.page()), phys.page_bytes(original.page()));
        let stranger = Anon::alloc(&phys).unwrap();
        assert!(!aref.replace(0, &stranger, Arc::clone(&copy)));
        assert!(aref.replace(0, &original, Arc::clone(&copy)));
        assert!(Arc::ptr_eq(&aref.lookup(0).unwrap(), &copy));
        assert_eq!(aref.amap().check(), Ok(()));
    }

    #[test]
    fn remove_pages_clears_range_only() {
        let phys = phys();
        let aref = Aref::new(Amap::new(RemovePolicy::Compact), 0);
        for i in 0..8 {
            aref.add(Anon::alloc(&phys).unwrap(), i * PAGE_SIZE).unwrap();
        }
        aref.remove_pages(2 * PAGE_SIZE, 3 * PAGE_SIZE);
        let present: Vec<usize> = (0..8).filter(|&i| aref.lookup(i * PAGE_SIZE).is_some()).collect();
        assert_eq!(present, [0, 1, 5, 6, 7]);
        assert_eq!(aref.amap().check(), Ok(()));
    }

    #[test]
    #[should_panic(expected = "unaligned amap length")]
    fn remove_pages_rejects_partial_page() {
        let phys = phys();
        let aref = Aref::new(Amap::new(RemovePolicy::Compact), 0);
        aref.add(Anon::alloc(&phys).unwrap(), 0).unwrap();
        aref.remove_pages(0, PAGE_SIZE + 1);
    }

    #[test]
    #[should_panic(expected = "unaligned amap offset")]
    fn unaligned_offset_is_fatal() {
        let aref = Aref::new(Amap::new(RemovePolicy::Compact), 0);
        aref.lookup(100);
    }

    proptest! {
        #[test]
        fn amap_invariant_holds_under_random_use(ops in prop::collection::vec((any::<bool>(), 0usize..32), 0..64)) {
            let phys = phys();
            let aref = Aref::new(Amap::new(RemovePolicy::Compact), 0);
            for (add, page) in ops {
                let offset = page * PAGE_SIZE;
                match (add, aref.lookup(offset).is_some()) {
                    (true, false) => aref.add(Anon::alloc(&phys).unwrap(), offset).unwrap(),
                    (false, true) => aref.remove(offset),
                    _ => (),
                }
                prop_assert_eq!(aref.amap().check(), Ok(()));
            }
            prop_assert_eq!(phys.free_count(), 64 - aref.amap().len());
        }
    }
}
