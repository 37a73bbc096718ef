//! # Paging
//!
//! The pmap layer: per address space page tables, the reverse mappings from physical pages back
//! to every translation of them, and the fast path of the page fault protocol which emulates
//! referenced and modified bits in software.
//!
//! Everything goes through [`Paging`], created once by [`Paging::bootstrap`]. Locks are taken
//! in the order pv table, then pmap.

use alloc::{sync::Arc, vec::Vec};
use core::fmt;

use arrayvec::ArrayVec;
use spin::Mutex;
use syscall::error::{Error, Result, EACCES, EFAULT};

use crate::common::{AtomicPmapId, Asid, PmapId};
use crate::memory::{
    Enomem, Frame, PageFlags, PageOwner, PhysMem, PhysicalAddress, VirtualAddress, PAGE_SIZE,
};

pub use self::entry::{Arch, CacheMode, MapFlags, Pde, Pte, VmProt};
pub use self::pv::{PvEntry, PvKey, PvTable};
pub use crate::arch::CurrentArch;

use crate::arch::CurrentArch as A;

pub mod entry;
pub mod pv;

/// Largest address space identifier; 0 belongs to the kernel.
pub const MAX_ASID: usize = 0xff;
/// Deepest page table supported by any architecture.
pub const MAX_PAGE_TABLE_DEPTH: usize = 4;

const _: () = assert!(<A as Arch>::PAGE_TABLE_DEPTH <= MAX_PAGE_TABLE_DEPTH);

static NEXT_PMAP_ID: AtomicPmapId = AtomicPmapId::new(PmapId::new(1));

/// The translation hardware of the current processor.
pub trait Mmu: Send + Sync {
    /// Installs a user top-level table tagged with `asid`, or disables user translation.
    fn set_user_table(&self, table: Option<(PhysicalAddress, Asid)>);
    /// Drops any cached translation of `va`, for one address space or, with `None`, for all of
    /// them (global kernel entries).
    fn invalidate_page(&self, asid: Option<Asid>, va: VirtualAddress);
    fn invalidate_asid(&self, asid: Asid);
}

struct AsidMap {
    bits: [u64; (MAX_ASID + 1) / 64],
}

impl AsidMap {
    const fn new() -> Self {
        let mut bits = [0; (MAX_ASID + 1) / 64];
        bits[0] = 1;
        Self { bits }
    }
    fn alloc(&mut self) -> Option<Asid> {
        for (i, word) in self.bits.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                *word |= 1 << bit;
                return Some(Asid::new((i * 64 + bit) as u16));
            }
        }
        None
    }
    fn free(&mut self, asid: Asid) {
        let n = asid.get() as usize;
        assert_ne!(n, 0, "the kernel ASID is never freed");
        let (word, bit) = (n / 64, n % 64);
        assert_ne!(self.bits[word] & (1 << bit), 0, "double free of ASID {}", n);
        self.bits[word] &= !(1 << bit);
    }
}

/// Boot-time paging parameters.
#[derive(Clone, Copy, Debug)]
pub struct PagingConfig {
    pub dmap_base: VirtualAddress,
    /// Top-level directory the boot code already built for the kernel, if any.
    pub kernel_pde: Option<PhysicalAddress>,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            dmap_base: VirtualAddress::new(A::DMAP_BASE),
            kernel_pde: None,
        }
    }
}

/// The window through which the kernel addresses all of physical memory.
#[derive(Clone, Copy, Debug)]
pub struct DirectMap {
    base: VirtualAddress,
    paddr_base: PhysicalAddress,
    paddr_end: PhysicalAddress,
}

impl DirectMap {
    pub fn phys_to_dmap(&self, pa: PhysicalAddress) -> VirtualAddress {
        assert!(
            self.paddr_base <= pa && pa < self.paddr_end,
            "{:?} is not direct mapped",
            pa
        );
        self.base.add(pa.data() - self.paddr_base.data())
    }
    pub fn dmap_to_phys(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let offset = va.data().checked_sub(self.base.data())?;
        let pa = self.paddr_base.add(offset);
        (pa < self.paddr_end).then_some(pa)
    }
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.dmap_to_phys(va).is_some()
    }
}

#[derive(Debug)]
struct PmapInner {
    /// Intermediate tables, excluding the top-level one.
    pte_pages: Vec<Frame>,
    resident: usize,
    deleted: bool,
}

pub struct Pmap {
    id: PmapId,
    asid: Asid,
    pde: PhysicalAddress,
    kernel: bool,
    inner: Mutex<PmapInner>,
}

impl fmt::Debug for Pmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pmap")
            .field("id", &self.id)
            .field("asid", &self.asid)
            .field("pde", &self.pde)
            .field("kernel", &self.kernel)
            .finish()
    }
}

impl Pmap {
    fn new(asid: Asid, pde: PhysicalAddress, kernel: bool) -> Arc<Pmap> {
        Arc::new(Pmap {
            id: NEXT_PMAP_ID.next(),
            asid,
            pde,
            kernel,
            inner: Mutex::new(PmapInner {
                pte_pages: Vec::new(),
                resident: 0,
                deleted: false,
            }),
        })
    }

    pub fn id(&self) -> PmapId {
        self.id
    }
    pub fn asid(&self) -> Asid {
        self.asid
    }
    /// Physical address of the top-level directory.
    pub fn root(&self) -> PhysicalAddress {
        self.pde
    }
    pub fn is_kernel(&self) -> bool {
        self.kernel
    }
    /// Number of valid page table entries.
    pub fn resident_count(&self) -> usize {
        self.inner.lock().resident
    }
    pub fn table_page_count(&self) -> usize {
        self.inner.lock().pte_pages.len()
    }
}

fn entry_addr(table: PhysicalAddress, index: usize) -> PhysicalAddress {
    table.add(index * core::mem::size_of::<u64>())
}

fn alloc_table(phys: &PhysMem) -> core::result::Result<Frame, Enomem> {
    let frame = phys.allocate_zeroed(1)?;
    phys.page_info(frame).set_owner(PageOwner::PageTable);
    Ok(frame)
}

fn free_table(phys: &PhysMem, frame: Frame) {
    phys.page_info(frame).set_owner(PageOwner::None);
    phys.free(frame);
}

pub struct Paging {
    dmap: DirectMap,
    phys: Arc<PhysMem>,
    mmu: Arc<dyn Mmu>,
    kernel: Arc<Pmap>,
    asids: Mutex<AsidMap>,
    pv: Mutex<PvTable>,
    active: Mutex<Option<Arc<Pmap>>>,
}

impl fmt::Debug for Paging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Paging")
            .field("dmap", &self.dmap)
            .field("kernel", &self.kernel)
            .field("active", &self.active.lock().as_ref().map(|pmap| pmap.id))
            .field("pv_entries", &self.pv.lock().len())
            .finish()
    }
}

impl Paging {
    /// Sets up the direct map and the kernel pmap. Every other pmap operation needs the
    /// returned value.
    pub fn bootstrap(
        config: PagingConfig,
        phys: Arc<PhysMem>,
        mmu: Arc<dyn Mmu>,
    ) -> core::result::Result<Paging, Enomem> {
        let root = match config.kernel_pde {
            Some(root) => root,
            None => alloc_table(&phys)?.start_address(),
        };
        let dmap = DirectMap {
            base: config.dmap_base,
            paddr_base: phys.base(),
            paddr_end: phys.end(),
        };
        mmu.set_user_table(None);

        log::info!(
            "{} paging: dmap {:?} -> {:?}..{:?}, kernel root {:?}",
            A::NAME,
            dmap.base,
            dmap.paddr_base,
            dmap.paddr_end,
            root
        );

        Ok(Paging {
            dmap,
            phys,
            mmu,
            kernel: Pmap::new(Asid::new(0), root, true),
            asids: Mutex::new(AsidMap::new()),
            pv: Mutex::new(PvTable::new()),
            active: Mutex::new(None),
        })
    }

    pub fn dmap(&self) -> &DirectMap {
        &self.dmap
    }
    pub fn phys(&self) -> &Arc<PhysMem> {
        &self.phys
    }
    pub fn kernel_pmap(&self) -> &Arc<Pmap> {
        &self.kernel
    }

    pub fn new_pmap(&self) -> core::result::Result<Arc<Pmap>, Enomem> {
        let asid = self.asids.lock().alloc().ok_or_else(|| {
            log::warn!("out of address space identifiers");
            Enomem
        })?;
        let root = match alloc_table(&self.phys) {
            Ok(root) => root,
            Err(err) => {
                self.asids.lock().free(asid);
                return Err(err);
            }
        };
        let pmap = Pmap::new(asid, root.start_address(), false);
        log::debug!("new pmap {} with asid {}", pmap.id, asid);
        Ok(pmap)
    }

    /// Tears down every mapping of a user pmap and frees its tables and ASID.
    pub fn delete(&self, pmap: &Arc<Pmap>) {
        assert!(!pmap.kernel, "the kernel pmap is never deleted");

        {
            let mut pv = self.pv.lock();
            let mut inner = pmap.inner.lock();
            assert!(!inner.deleted, "pmap {} deleted twice", pmap.id);

            for key in pv.of_pmap(pmap.id) {
                let entry = pv.remove(key);
                self.phys.page_info(entry.page).remove_mapping();
            }
            for frame in inner.pte_pages.drain(..) {
                free_table(&self.phys, frame);
            }
            free_table(&self.phys, Frame::containing(pmap.pde));
            inner.resident = 0;
            inner.deleted = true;
        }

        {
            let mut active = self.active.lock();
            if active.as_ref().is_some_and(|a| Arc::ptr_eq(a, pmap)) {
                self.mmu.set_user_table(None);
                *active = None;
            }
        }

        self.asids.lock().free(pmap.asid);
        self.mmu.invalidate_asid(pmap.asid);
        log::debug!("deleted pmap {}", pmap.id);
    }

    /// Switches the user half of the address space, or turns it off.
    pub fn activate(&self, pmap: Option<&Arc<Pmap>>) {
        let mut active = self.active.lock();
        match pmap {
            Some(pmap) => {
                assert!(!pmap.kernel, "the kernel pmap is always active");
                self.mmu.set_user_table(Some((pmap.pde, pmap.asid)));
            }
            None => self.mmu.set_user_table(None),
        }
        *active = pmap.cloned();
    }

    pub fn active(&self) -> Option<Arc<Pmap>> {
        self.active.lock().clone()
    }

    /// The pmap translating `va`: the kernel's for kernel addresses, the active one for user
    /// addresses.
    pub fn lookup(&self, va: VirtualAddress) -> Option<Arc<Pmap>> {
        if A::is_kernel(va) {
            Some(Arc::clone(&self.kernel))
        } else if A::is_user(va) {
            self.active()
        } else {
            None
        }
    }

    fn check_address(pmap: &Pmap, va: VirtualAddress) {
        assert!(va.is_page_aligned(), "unaligned mapping address {:?}", va);
        let in_range = if pmap.kernel {
            A::is_kernel(va)
        } else {
            A::is_user(va)
        };
        assert!(in_range, "{:?} is outside of pmap {}", va, pmap.id);
    }

    fn read_entry(&self, addr: PhysicalAddress) -> u64 {
        self.phys.read_u64(addr)
    }

    #[cfg_attr(not(feature = "pte_trace"), allow(unused_variables))]
    fn write_pte(&self, addr: PhysicalAddress, va: VirtualAddress, pte: Pte) {
        #[cfg(feature = "pte_trace")]
        log::trace!("pte {:?} for {:?} at {:?}", pte, va, addr);
        self.phys.write_u64(addr, pte.0);
    }

    /// Address of the entry translating `va`, if all directories above it exist.
    fn lookup_pte(&self, pmap: &Pmap, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut table = pmap.pde;
        for level in 0..A::PAGE_TABLE_DEPTH - 1 {
            let pde = Pde(self.read_entry(entry_addr(table, A::pt_index(level, va))));
            if !A::pde_valid(pde) {
                return None;
            }
            table = A::pde_table(pde);
        }
        Some(entry_addr(table, A::pt_index(A::PAGE_TABLE_DEPTH - 1, va)))
    }

    /// Like `lookup_pte`, allocating missing directories on the way.
    fn ensure_pte(
        &self,
        pmap: &Pmap,
        inner: &mut PmapInner,
        va: VirtualAddress,
    ) -> core::result::Result<PhysicalAddress, Enomem> {
        let mut table = pmap.pde;
        for level in 0..A::PAGE_TABLE_DEPTH - 1 {
            let addr = entry_addr(table, A::pt_index(level, va));
            let pde = Pde(self.read_entry(addr));
            table = if A::pde_valid(pde) {
                A::pde_table(pde)
            } else {
                let frame = alloc_table(&self.phys)?;
                inner.pte_pages.push(frame);
                self.phys
                    .write_u64(addr, A::pde_make(level, frame.start_address()).0);
                frame.start_address()
            };
        }
        Ok(entry_addr(table, A::pt_index(A::PAGE_TABLE_DEPTH - 1, va)))
    }

    /// The directory entries leading to `va`, top level first. Stops at the first invalid one.
    pub fn table_path(&self, pmap: &Pmap, va: VirtualAddress) -> ArrayVec<Pde, MAX_PAGE_TABLE_DEPTH> {
        let _guard = pmap.inner.lock();
        let mut path = ArrayVec::new();
        let mut table = pmap.pde;
        for level in 0..A::PAGE_TABLE_DEPTH - 1 {
            let pde = Pde(self.read_entry(entry_addr(table, A::pt_index(level, va))));
            path.push(pde);
            if !A::pde_valid(pde) {
                break;
            }
            table = A::pde_table(pde);
        }
        path
    }

    fn invalidate(&self, pmap: &Pmap, va: VirtualAddress) {
        let asid = (!pmap.kernel).then_some(pmap.asid);
        self.mmu.invalidate_page(asid, va);
    }

    fn unlink_pv(&self, pv: &mut PvTable, page: Frame, pmap: &Pmap, va: VirtualAddress) {
        if let Some(key) = pv.find(page, pmap.id, va) {
            pv.remove(key);
            self.phys.page_info(page).remove_mapping();
        }
    }

    /// Maps `page` at `va`, replacing whatever `va` translated to before.
    pub fn enter(
        &self,
        pmap: &Arc<Pmap>,
        va: VirtualAddress,
        page: Frame,
        prot: VmProt,
        flags: MapFlags,
    ) -> core::result::Result<(), Enomem> {
        Self::check_address(pmap, va);

        let mut pv = self.pv.lock();
        let mut inner = pmap.inner.lock();
        assert!(!inner.deleted, "pmap {} used after delete", pmap.id);

        let addr = self.ensure_pte(pmap, &mut inner, va)?;
        let old = Pte(self.read_entry(addr));
        if A::pte_valid(old) {
            let old_page = Frame::containing(A::pte_frame(old));
            if old_page != page {
                self.unlink_pv(&mut pv, old_page, pmap, va);
            }
        } else {
            inner.resident += 1;
        }

        if pv.find(page, pmap.id, va).is_none() {
            let info = self.phys.page_info(page);
            if info.mappings() == 0 {
                info.clear_flags(PageFlags::REFERENCED | PageFlags::MODIFIED);
            }
            pv.add(page, pmap, va);
            info.add_mapping();
        }

        let pte = A::pte_make(page.start_address(), prot, flags, pmap.kernel);
        self.write_pte(addr, va, pte);
        self.invalidate(pmap, va);
        Ok(())
    }

    /// Unmaps `[start, end)`.
    pub fn remove(&self, pmap: &Pmap, start: VirtualAddress, end: VirtualAddress) {
        assert!(start.is_page_aligned() && end.is_page_aligned());

        let mut pv = self.pv.lock();
        let mut inner = pmap.inner.lock();
        let mut va = start;
        while va < end {
            if let Some(addr) = self.lookup_pte(pmap, va) {
                let pte = Pte(self.read_entry(addr));
                if A::pte_valid(pte) {
                    self.unlink_pv(&mut pv, Frame::containing(A::pte_frame(pte)), pmap, va);
                    self.write_pte(addr, va, A::pte_empty());
                    self.invalidate(pmap, va);
                    inner.resident -= 1;
                }
            }
            va = va.add(PAGE_SIZE);
        }
    }

    fn update_range(
        &self,
        pmap: &Pmap,
        start: VirtualAddress,
        end: VirtualAddress,
        f: impl Fn(Pte) -> Pte,
    ) {
        assert!(start.is_page_aligned() && end.is_page_aligned());

        let _guard = pmap.inner.lock();
        let mut va = start;
        while va < end {
            if let Some(addr) = self.lookup_pte(pmap, va) {
                let pte = Pte(self.read_entry(addr));
                let new = f(pte);
                if A::pte_valid(pte) && new != pte {
                    self.write_pte(addr, va, new);
                    self.invalidate(pmap, va);
                }
            }
            va = va.add(PAGE_SIZE);
        }
    }

    /// Changes the protection of every valid mapping in `[start, end)`.
    pub fn protect(&self, pmap: &Pmap, start: VirtualAddress, end: VirtualAddress, prot: VmProt) {
        self.update_range(pmap, start, end, |pte| A::pte_protect(pte, prot));
    }

    /// Turns every writable mapping in `[start, end)` into a read-only copy-on-write one.
    pub fn copy_on_write(&self, pmap: &Pmap, start: VirtualAddress, end: VirtualAddress) {
        self.update_range(pmap, start, end, |pte| {
            if A::pte_writable(pte) {
                A::pte_set_cow(A::pte_protect(pte, A::pte_prot(pte) - VmProt::WRITE))
            } else {
                pte
            }
        });
    }

    pub fn extract(&self, pmap: &Pmap, va: VirtualAddress) -> Option<PhysicalAddress> {
        let _guard = pmap.inner.lock();
        let pte = Pte(self.read_entry(self.lookup_pte(pmap, va)?));
        A::pte_valid(pte).then(|| A::pte_frame(pte).add(va.data() % PAGE_SIZE))
    }

    /// The raw entry translating `va`, if any.
    pub fn pte(&self, pmap: &Pmap, va: VirtualAddress) -> Option<Pte> {
        let _guard = pmap.inner.lock();
        let pte = Pte(self.read_entry(self.lookup_pte(pmap, va.page_base())?));
        A::pte_valid(pte).then_some(pte)
    }

    /// Maps kernel memory without reverse mapping bookkeeping. Mapping over an existing
    /// translation is a bug.
    pub fn kenter(&self, va: VirtualAddress, pa: PhysicalAddress, prot: VmProt, flags: MapFlags) -> core::result::Result<(), Enomem> {
        Self::check_address(&self.kernel, va);

        let mut inner = self.kernel.inner.lock();
        let addr = self.ensure_pte(&self.kernel, &mut inner, va)?;
        let old = Pte(self.read_entry(addr));
        assert!(!A::pte_valid(old), "kenter over existing mapping at {:?}", va);
        self.write_pte(addr, va, A::pte_make(pa, prot, flags, true));
        inner.resident += 1;
        self.invalidate(&self.kernel, va);
        Ok(())
    }

    pub fn kremove(&self, va: VirtualAddress, size: usize) {
        let end = va.add(size);
        let mut inner = self.kernel.inner.lock();
        let mut page = va;
        while page < end {
            if let Some(addr) = self.lookup_pte(&self.kernel, page) {
                if A::pte_valid(Pte(self.read_entry(addr))) {
                    self.write_pte(addr, page, A::pte_empty());
                    self.invalidate(&self.kernel, page);
                    inner.resident -= 1;
                }
            }
            page = page.add(PAGE_SIZE);
        }
    }

    pub fn kextract(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        match self.dmap.dmap_to_phys(va) {
            Some(pa) => Some(pa),
            None => self.extract(&self.kernel, va),
        }
    }

    /// Removes every translation of `page`, in every pmap.
    pub fn page_remove(&self, page: Frame) {
        let mut pv = self.pv.lock();
        for key in pv.of_page(page) {
            let entry = pv.remove(key);
            let mut inner = entry.pmap.inner.lock();
            if let Some(addr) = self.lookup_pte(&entry.pmap, entry.va) {
                self.write_pte(addr, entry.va, A::pte_empty());
                inner.resident -= 1;
            }
            drop(inner);
            self.invalidate(&entry.pmap, entry.va);
            self.phys.page_info(page).remove_mapping();
        }
    }

    pub fn mappings_of(&self, page: Frame) -> Vec<(Arc<Pmap>, VirtualAddress)> {
        let pv = self.pv.lock();
        pv.of_page(page)
            .into_iter()
            .map(|key| {
                let entry = pv.get(key);
                (Arc::clone(&entry.pmap), entry.va)
            })
            .collect()
    }

    fn update_mappings(&self, pv: &PvTable, page: Frame, f: impl Fn(Pte) -> Pte) {
        for key in pv.of_page(page) {
            let entry = pv.get(key);
            let _guard = entry.pmap.inner.lock();
            let Some(addr) = self.lookup_pte(&entry.pmap, entry.va) else {
                continue;
            };
            let pte = Pte(self.read_entry(addr));
            let new = f(pte);
            if A::pte_valid(pte) && new != pte {
                self.write_pte(addr, entry.va, new);
                self.invalidate(&entry.pmap, entry.va);
            }
        }
    }

    pub fn is_referenced(&self, page: Frame) -> bool {
        self.phys.page_info(page).flags().contains(PageFlags::REFERENCED)
    }
    pub fn is_modified(&self, page: Frame) -> bool {
        self.phys.page_info(page).flags().contains(PageFlags::MODIFIED)
    }

    pub fn set_referenced(&self, page: Frame) {
        let pv = self.pv.lock();
        self.phys.page_info(page).set_flags(PageFlags::REFERENCED);
        self.update_mappings(&pv, page, A::pte_set_referenced);
    }
    pub fn clear_referenced(&self, page: Frame) {
        let pv = self.pv.lock();
        self.phys.page_info(page).clear_flags(PageFlags::REFERENCED);
        self.update_mappings(&pv, page, A::pte_clear_referenced);
    }
    pub fn set_modified(&self, page: Frame) {
        let pv = self.pv.lock();
        self.phys.page_info(page).set_flags(PageFlags::MODIFIED);
        self.update_mappings(&pv, page, A::pte_set_modified);
    }
    pub fn clear_modified(&self, page: Frame) {
        let pv = self.pv.lock();
        self.phys.page_info(page).clear_flags(PageFlags::MODIFIED);
        self.update_mappings(&pv, page, A::pte_clear_modified);
    }

    /// Fast path of fault resolution.
    ///
    /// Returns `EFAULT` when only the VM layer can help: there is no translation, or a write
    /// hit a copy-on-write page. Returns `EACCES` when the translation exists but does not
    /// grant `access`. Otherwise marks the page referenced (and modified, for writes), so the
    /// faulting access succeeds when retried.
    pub fn emulate_bits(&self, pmap: &Pmap, va: VirtualAddress, access: VmProt) -> Result<()> {
        let va = va.page_base();
        let pte = self.pte(pmap, va).ok_or(Error::new(EFAULT))?;

        if access.contains(VmProt::READ) && !A::pte_readable(pte) {
            return Err(Error::new(EACCES));
        }
        if access.contains(VmProt::EXEC) && !A::pte_executable(pte) {
            return Err(Error::new(EACCES));
        }
        if access.contains(VmProt::WRITE) && !A::pte_writable(pte) {
            return Err(Error::new(if A::pte_is_cow(pte) { EFAULT } else { EACCES }));
        }

        let page = Frame::containing(A::pte_frame(pte));
        if !self.phys.contains(page.start_address()) {
            // Device memory mapped by kenter; nothing is emulated there.
            return Ok(());
        }
        self.set_referenced(page);
        if access.contains(VmProt::WRITE) {
            self.set_modified(page);
        }
        Ok(())
    }

    pub fn zero_page(&self, page: Frame) {
        self.phys.zero_page(page);
    }
    pub fn copy_page(&self, src: Frame, dst: Frame) {
        self.phys.copy_page(src, dst);
    }
}
