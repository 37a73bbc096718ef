//! Page-backed objects: reference-counted, offset-indexed page collections.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};

use spin::Mutex;

use super::{is_page_aligned, Enomem, Frame, PageOwner, PhysMem};
use crate::common::{AtomicObjectId, ObjectId};

static NEXT_OBJECT_ID: AtomicObjectId = AtomicObjectId::new(ObjectId::new(1));

/// Where an object gets pages it does not have yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pager {
    /// Supplies zero-filled pages on demand.
    Anonymous,
    /// Never supplies pages; faults on missing offsets are unresolvable.
    Dummy,
}

pub struct VmObject {
    id: ObjectId,
    pager: Pager,
    phys: Arc<PhysMem>,
    pages: Mutex<BTreeMap<usize, Frame>>,
}

impl core::fmt::Debug for VmObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmObject")
            .field("id", &self.id)
            .field("pager", &self.pager)
            .field("npages", &self.npages())
            .finish()
    }
}

impl VmObject {
    pub fn new(phys: &Arc<PhysMem>, pager: Pager) -> Arc<VmObject> {
        Arc::new(VmObject {
            id: NEXT_OBJECT_ID.next(),
            pager,
            phys: Arc::clone(phys),
            pages: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }
    pub fn pager(&self) -> Pager {
        self.pager
    }

    pub fn hold(self: &Arc<Self>) -> Arc<VmObject> {
        Arc::clone(self)
    }
    pub fn refcount(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }

    pub fn npages(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn find_page(&self, offset: usize) -> Option<Frame> {
        self.pages.lock().get(&offset).copied()
    }

    /// Takes ownership of `page` at `offset`. The offset must be page aligned and free.
    pub fn add_page(&self, offset: usize, page: Frame) {
        assert!(is_page_aligned(offset), "unaligned object offset {:#x}", offset);
        let mut pages = self.pages.lock();
        assert!(
            !pages.contains_key(&offset),
            "object {} already has a page at {:#x}",
            self.id,
            offset
        );
        self.phys.page_info(page).set_owner(PageOwner::Object {
            id: self.id,
            offset,
        });
        pages.insert(offset, page);
    }

    /// Removes and frees every page in `[offset, offset + length)`.
    pub fn remove_pages(&self, offset: usize, length: usize) {
        let removed: Vec<Frame> = {
            let mut pages = self.pages.lock();
            let tail = pages.split_off(&offset);
            let (doomed, keep): (BTreeMap<_, _>, BTreeMap<_, _>) = tail
                .into_iter()
                .partition(|&(off, _)| off < offset.saturating_add(length));
            pages.extend(keep);
            doomed.into_values().collect()
        };
        for page in removed {
            self.release(page);
        }
    }

    fn release(&self, page: Frame) {
        self.phys.page_info(page).set_owner(PageOwner::None);
        self.phys.free(page);
    }

    /// Page offsets and frames in ascending offset order.
    pub fn pages(&self) -> Vec<(usize, Frame)> {
        self.pages.lock().iter().map(|(&off, &page)| (off, page)).collect()
    }

    /// Finds the page at `offset`, asking the pager for one if it is missing. `None` means the
    /// pager has nothing for this offset.
    pub fn pager_fault(&self, offset: usize) -> Result<Option<Frame>, Enomem> {
        if let Some(page) = self.find_page(offset) {
            return Ok(Some(page));
        }
        match self.pager {
            Pager::Dummy => Ok(None),
            Pager::Anonymous => {
                let fresh = self.phys.allocate_zeroed(1)?;

                // The lock was not held while allocating; another fault may have won the race.
                let mut pages = self.pages.lock();
                if let Some(&page) = pages.get(&offset) {
                    drop(pages);
                    self.phys.free(fresh);
                    return Ok(Some(page));
                }
                self.phys.page_info(fresh).set_owner(PageOwner::Object {
                    id: self.id,
                    offset,
                });
                pages.insert(offset, fresh);
                Ok(Some(fresh))
            }
        }
    }

    /// A new object with the same pager and a physical copy of every page.
    pub fn duplicate(&self) -> Result<Arc<VmObject>, Enomem> {
        let copy = VmObject::new(&self.phys, self.pager);
        for (offset, page) in self.pages() {
            let new_page = self.phys.allocate(1)?;
            self.phys.copy_page(page, new_page);
            copy.add_page(offset, new_page);
        }
        Ok(copy)
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let pages = core::mem::take(self.pages.get_mut());
        log::trace!("object {} destroyed with {} pages", self.id, pages.len());
        for page in pages.into_values() {
            self.release(page);
        }
    }
}
