use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::{self, Ordering};
use core::fmt::{self, Debug};
use core::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use spin::Mutex;
use syscall::error::{Error, Result, EINVAL};

use crate::common::ObjectId;
use crate::memory::{
    is_page_aligned, Amap, Anon, Aref, Enomem, Frame, Pager, PfError, RemovePolicy,
    VirtualAddress, VmObject, PAGE_SIZE,
};
use crate::paging::{Arch, CurrentArch, MapFlags, Paging, Pmap, VmProt};

#[derive(Clone, Copy)]
pub struct Region {
    start: VirtualAddress,
    size: usize,
}

impl Region {
    /// Create a new region with the given size
    pub fn new(start: VirtualAddress, size: usize) -> Self {
        Self { start, size }
    }

    /// Create a new region spanning between the start and end address
    /// (exclusive end)
    pub fn between(start: VirtualAddress, end: VirtualAddress) -> Self {
        Self::new(start, end.data().saturating_sub(start.data()))
    }

    /// Return the part of the specified region that intersects with self.
    pub fn intersect(&self, other: Self) -> Self {
        Self::between(
            cmp::max(self.start_address(), other.start_address()),
            cmp::min(self.end_address(), other.end_address()),
        )
    }

    pub fn start_address(&self) -> VirtualAddress {
        self.start
    }
    /// Get the start address of the next region (exclusive end)
    pub fn end_address(&self) -> VirtualAddress {
        self.start.add(self.size)
    }
    pub fn size(&self) -> usize {
        self.size
    }
    pub fn page_count(&self) -> usize {
        self.size / PAGE_SIZE
    }
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn contains(&self, address: VirtualAddress) -> bool {
        self.start <= address && address < self.end_address()
    }
    /// Returns true if the two regions share at least one byte
    pub fn collides(&self, other: Self) -> bool {
        !self.intersect(other).is_empty()
    }

    /// The part of self before `region`, if any.
    pub fn before(self, region: Self) -> Option<Self> {
        Some(Self::between(self.start_address(), region.start_address())).filter(|r| !r.is_empty())
    }
    /// The part of self after `region`, if any.
    pub fn after(self, region: Self) -> Option<Self> {
        Some(Self::between(region.end_address(), self.end_address())).filter(|r| !r.is_empty())
    }
}

impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        self.start.eq(&other.start) && self.size == other.size
    }
}
impl Eq for Region {}

impl PartialOrd for Region {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Region {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start.cmp(&other.start).then(self.size.cmp(&other.size))
    }
}

impl Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:#x}..{:#x} ({:#x} long)",
            self.start_address().data(),
            self.end_address().data(),
            self.size()
        )
    }
}

/// A mapped region and what backs it.
///
/// Shared regions are backed by their object alone. Private regions own an amap reference,
/// which overlays the object (if any) with private copies of written pages.
#[derive(Debug)]
struct Grant {
    region: Region,
    prot: VmProt,
    shared: bool,
    object: Option<Arc<VmObject>>,
    /// Byte offset into `object` of the region start.
    object_offset: usize,
    aref: Option<Aref>,
}

impl Grant {
    fn info(&self) -> RegionInfo {
        RegionInfo {
            region: self.region,
            prot: self.prot,
            shared: self.shared,
            object: self.object.as_ref().map(|object| (object.id(), self.object_offset)),
            amap_bias: self.aref.as_ref().map(Aref::pageoff),
        }
    }

    /// The grant for the part of self covering `region`.
    fn slice(&self, region: Region) -> Grant {
        let offset = region.start_address().data() - self.region.start_address().data();
        Grant {
            region,
            prot: self.prot,
            shared: self.shared,
            object: self.object.clone(),
            object_offset: self.object_offset + offset,
            aref: self
                .aref
                .as_ref()
                .map(|aref| Aref::new(aref.amap().hold(), aref.pageoff() + offset / PAGE_SIZE)),
        }
    }
}

/// Snapshot of a region, as returned by [`AddressSpace::find_region`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionInfo {
    pub region: Region,
    pub prot: VmProt,
    pub shared: bool,
    /// Backing object and the offset of the region start within it.
    pub object: Option<(ObjectId, usize)>,
    /// Page bias into the region's amap.
    pub amap_bias: Option<usize>,
}

/// The regions of one address space and the pmap translating them.
///
/// A user address space tears its pmap down when destroyed or dropped, before any page its
/// regions own is released.
pub struct AddressSpace {
    paging: Arc<Paging>,
    pmap: Arc<Pmap>,
    policy: RemovePolicy,
    live: AtomicBool,
    grants: Mutex<BTreeMap<VirtualAddress, Grant>>,
}

impl Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("pmap", &self.pmap.id())
            .field("regions", &self.grants.lock().len())
            .finish()
    }
}

impl AddressSpace {
    /// A new, empty user address space with its own pmap.
    pub fn new(
        paging: &Arc<Paging>,
        policy: RemovePolicy,
    ) -> core::result::Result<Arc<Self>, Enomem> {
        Ok(Self::with_pmap(paging, paging.new_pmap()?, policy))
    }

    /// The kernel half, translated by the kernel pmap.
    pub fn kernel(paging: &Arc<Paging>) -> Arc<Self> {
        Self::with_pmap(paging, Arc::clone(paging.kernel_pmap()), RemovePolicy::default())
    }

    fn with_pmap(paging: &Arc<Paging>, pmap: Arc<Pmap>, policy: RemovePolicy) -> Arc<Self> {
        Arc::new(AddressSpace {
            paging: Arc::clone(paging),
            pmap,
            policy,
            live: AtomicBool::new(true),
            grants: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn pmap(&self) -> &Arc<Pmap> {
        &self.pmap
    }

    fn check_region(&self, region: Region) -> Result<()> {
        if region.is_empty()
            || !is_page_aligned(region.start_address().data())
            || !is_page_aligned(region.size())
        {
            return Err(Error::new(EINVAL));
        }
        let last = VirtualAddress::new(region.end_address().data() - 1);
        let in_range = if self.pmap.is_kernel() {
            CurrentArch::is_kernel(region.start_address()) && CurrentArch::is_kernel(last)
        } else {
            CurrentArch::is_user(region.start_address()) && CurrentArch::is_user(last)
        };
        if in_range {
            Ok(())
        } else {
            Err(Error::new(EINVAL))
        }
    }

    fn insert(&self, grant: Grant) -> Result<()> {
        self.check_region(grant.region)?;

        let mut grants = self.grants.lock();
        if grants.values().any(|other| other.region.collides(grant.region)) {
            log::debug!("{:?} overlaps an existing region", grant.region);
            return Err(Error::new(EINVAL));
        }
        log::trace!(
            "map {:?} {:?}{}",
            grant.region,
            grant.prot,
            if grant.shared { " shared" } else { "" }
        );
        grants.insert(grant.region.start_address(), grant);
        Ok(())
    }

    /// Maps zero-filled memory. Shared mappings are backed by an anonymous object so that
    /// every address space they are inherited by sees the same pages.
    pub fn map_anonymous(&self, region: Region, prot: VmProt, shared: bool) -> Result<()> {
        let (object, aref) = if shared {
            (Some(VmObject::new(self.paging.phys(), Pager::Anonymous)), None)
        } else {
            (None, Some(Aref::new(Amap::new(self.policy), 0)))
        };
        self.insert(Grant {
            region,
            prot,
            shared,
            object,
            object_offset: 0,
            aref,
        })
    }

    /// Maps `object` starting at byte `offset`. Writes to a private mapping go to private copies.
    pub fn map_object(
        &self,
        region: Region,
        prot: VmProt,
        object: Arc<VmObject>,
        offset: usize,
        shared: bool,
    ) -> Result<()> {
        if !is_page_aligned(offset) {
            return Err(Error::new(EINVAL));
        }
        self.insert(Grant {
            region,
            prot,
            shared,
            object: Some(object),
            object_offset: offset,
            aref: (!shared).then(|| Aref::new(Amap::new(self.policy), 0)),
        })
    }

    pub fn find_region(&self, address: VirtualAddress) -> Option<RegionInfo> {
        let grants = self.grants.lock();
        Self::covering(&grants, address).map(Grant::info)
    }

    pub fn regions(&self) -> Vec<RegionInfo> {
        self.grants.lock().values().map(Grant::info).collect()
    }

    fn covering(grants: &BTreeMap<VirtualAddress, Grant>, address: VirtualAddress) -> Option<&Grant> {
        grants
            .range(..=address)
            .next_back()
            .map(|(_, grant)| grant)
            .filter(|grant| grant.region.contains(address))
    }

    fn covering_mut(
        grants: &mut BTreeMap<VirtualAddress, Grant>,
        address: VirtualAddress,
    ) -> Option<&mut Grant> {
        grants
            .range_mut(..=address)
            .next_back()
            .map(|(_, grant)| grant)
            .filter(|grant| grant.region.contains(address))
    }

    /// Slow path of fault resolution: finds or creates the page backing `address` and maps it.
    pub fn resolve_fault(
        &self,
        address: VirtualAddress,
        access: VmProt,
    ) -> core::result::Result<(), PfError> {
        let paging = &*self.paging;
        let va = address.page_base();
        let mut grants = self.grants.lock();
        let grant = Self::covering_mut(&mut grants, va).ok_or(PfError::Unmapped)?;

        if !grant.prot.contains(access) {
            log::debug!("{:?} access to {:?} denied by {:?}", access, va, grant.prot);
            return Err(PfError::Access);
        }

        let offset = va.data() - grant.region.start_address().data();
        let prot = grant.prot;
        let npages = grant.region.page_count();

        if grant.shared {
            let object = grant.object.as_ref().ok_or(PfError::Unmapped)?;
            let page = object
                .pager_fault(grant.object_offset + offset)?
                .ok_or(PfError::Unmapped)?;
            paging.enter(&self.pmap, va, page, prot, MapFlags::empty())?;
            return Ok(());
        }

        let write = access.contains(VmProt::WRITE);
        let aref = grant.aref.as_mut().ok_or(PfError::Unmapped)?;
        if write {
            aref.copy_if_needed(npages)?;
        }

        // Until the first write copies it, a forked amap is shared as a whole and so is every
        // anon in it.
        let holders = aref.anon_holders(offset);
        let amap_shared = aref.amap().refcount() > 1;
        if let Some(anon) = aref.lookup(offset) {
            let shared = holders > 1 || amap_shared;
            if write && shared {
                let copy = anon.copy()?;
                log::trace!("copy on write at {:?}: {:?} -> {:?}", va, anon.page(), copy.page());
                // Unmap first: once the amap lets go of the old anon its page may be freed.
                paging.remove(&self.pmap, va, va.add(PAGE_SIZE));
                let page = copy.page();
                if !aref.replace(offset, &anon, copy) {
                    return Ok(());
                }
                paging.enter(&self.pmap, va, page, prot, MapFlags::empty())?;
            } else {
                self.enter_shareable(va, anon.page(), prot, shared)?;
            }
            return Ok(());
        }

        let source = match &grant.object {
            Some(object) => Some(
                object
                    .pager_fault(grant.object_offset + offset)?
                    .ok_or(PfError::Unmapped)?,
            ),
            None => None,
        };

        match source {
            Some(page) if !write => {
                self.enter_shareable(va, page, prot, true)?;
            }
            source => {
                let anon = Anon::alloc(paging.phys())?;
                if let Some(page) = source {
                    paging.copy_page(page, anon.page());
                }
                let page = anon.page();
                aref.add(anon, offset)?;
                paging.enter(&self.pmap, va, page, prot, MapFlags::empty())?;
            }
        }
        Ok(())
    }

    /// Maps a page that may be visible to someone else: read-only and copy-on-write if the
    /// region is writable.
    fn enter_shareable(
        &self,
        va: VirtualAddress,
        page: Frame,
        prot: VmProt,
        shared: bool,
    ) -> core::result::Result<(), Enomem> {
        if shared && prot.contains(VmProt::WRITE) {
            self.paging
                .enter(&self.pmap, va, page, prot - VmProt::WRITE, MapFlags::COPY_ON_WRITE)
        } else {
            self.paging.enter(&self.pmap, va, page, prot, MapFlags::empty())
        }
    }

    /// A copy of this address space: private regions are shared copy-on-write, shared regions
    /// keep sharing their object.
    pub fn fork(&self) -> core::result::Result<Arc<AddressSpace>, Enomem> {
        assert!(!self.pmap.is_kernel(), "the kernel address space is not forked");

        let paging = &self.paging;
        let child = AddressSpace::new(paging, self.policy)?;
        let grants = self.grants.lock();
        let mut child_grants = child.grants.lock();
        for grant in grants.values() {
            let copy = grant.slice(grant.region);
            if !grant.shared {
                paging.copy_on_write(
                    &self.pmap,
                    grant.region.start_address(),
                    grant.region.end_address(),
                );
            }
            child_grants.insert(copy.region.start_address(), copy);
        }
        drop(child_grants);

        log::debug!(
            "forked pmap {} into pmap {} ({} regions)",
            self.pmap.id(),
            child.pmap.id(),
            grants.len()
        );
        Ok(child)
    }

    /// Unmaps `region`, splitting regions that only partially overlap it.
    pub fn unmap(&self, region: Region) -> Result<()> {
        self.check_region(region)?;
        let paging = &self.paging;

        let mut grants = self.grants.lock();
        let affected: Vec<VirtualAddress> = grants
            .values()
            .filter(|grant| grant.region.collides(region))
            .map(|grant| grant.region.start_address())
            .collect();

        for start in affected {
            let Some(grant) = grants.remove(&start) else {
                continue;
            };
            let hole = grant.region.intersect(region);

            paging.remove(&self.pmap, hole.start_address(), hole.end_address());

            if let Some(before) = grant.region.before(hole) {
                grants.insert(before.start_address(), grant.slice(before));
            }
            if let Some(after) = grant.region.after(hole) {
                grants.insert(after.start_address(), grant.slice(after));
            }
            if let Some(aref) = &grant.aref {
                // After fork another process may still see these slots; they go with the amap.
                if Arc::strong_count(aref.amap()) == 1 + grants_holding(&grants, aref.amap()) {
                    let offset = hole.start_address().data() - grant.region.start_address().data();
                    aref.remove_pages(offset, hole.size());
                }
            }
        }
        Ok(())
    }

    /// Tears down every mapping and releases the pmap.
    pub fn destroy(&self) {
        assert!(!self.pmap.is_kernel(), "the kernel address space is never destroyed");
        if !self.live.swap(false, AtomicOrdering::AcqRel) {
            return;
        }
        self.paging.delete(&self.pmap);
        let grants = core::mem::take(&mut *self.grants.lock());
        log::debug!("destroyed pmap {} with {} regions", self.pmap.id(), grants.len());
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if !self.pmap.is_kernel() {
            self.destroy();
            return;
        }
        // The kernel pmap outlives its address space; only the regions' translations go.
        let grants = core::mem::take(self.grants.get_mut());
        for grant in grants.values() {
            self.paging.remove(
                &self.pmap,
                grant.region.start_address(),
                grant.region.end_address(),
            );
        }
        log::debug!("released {} kernel regions", grants.len());
    }
}

fn grants_holding(grants: &BTreeMap<VirtualAddress, Grant>, amap: &Arc<Amap>) -> usize {
    grants
        .values()
        .filter(|grant| grant.aref.as_ref().is_some_and(|aref| Arc::ptr_eq(aref.amap(), amap)))
        .count()
}

/// The translation state of one processor: the paging service, the kernel half and the user
/// half currently installed.
#[derive(Debug)]
pub struct Vm {
    paging: Arc<Paging>,
    kernel: Arc<AddressSpace>,
    user: Mutex<Option<Arc<AddressSpace>>>,
}

impl Vm {
    pub fn new(paging: Arc<Paging>) -> Self {
        let kernel = AddressSpace::kernel(&paging);
        Self {
            paging,
            kernel,
            user: Mutex::new(None),
        }
    }

    pub fn paging(&self) -> &Arc<Paging> {
        &self.paging
    }
    pub fn kernel_space(&self) -> &Arc<AddressSpace> {
        &self.kernel
    }
    pub fn user_space(&self) -> Option<Arc<AddressSpace>> {
        self.user.lock().clone()
    }

    /// Installs `space` as the user half, or leaves only the kernel half mapped.
    pub fn activate(&self, space: Option<&Arc<AddressSpace>>) {
        let mut user = self.user.lock();
        self.paging.activate(space.map(|space| space.pmap()));
        *user = space.cloned();
    }

    /// The address space `address` belongs to, if any is installed for it.
    pub fn space_for(&self, address: VirtualAddress) -> Option<Arc<AddressSpace>> {
        if CurrentArch::is_kernel(address) {
            Some(Arc::clone(&self.kernel))
        } else if CurrentArch::is_user(address) {
            self.user_space()
        } else {
            None
        }
    }
}
