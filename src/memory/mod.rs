//! # Memory management
//! Physical pages, the objects and anonymous maps that own them, and the page fault protocol
//! that ties them to the page tables.

use core::{fmt, num::NonZeroUsize};

use syscall::error::{Error, EACCES, EFAULT, ENOMEM};

use crate::context::{memory::Vm, Thread};
use crate::paging::VmProt;

pub use self::amap::{Amap, Anon, Aref};
pub use self::object::{Pager, VmObject};
pub use self::phys::{PageFlags, PageInfo, PageOwner, PhysMem};
pub use self::slots::{RemovePolicy, SlotError, SlotMap};

pub mod amap;
pub mod object;
pub mod phys;
pub mod slots;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Round down to the nearest multiple of page size
pub fn round_down_pages(number: usize) -> usize {
    number - number % PAGE_SIZE
}
/// Round up to the nearest multiple of page size
pub fn round_up_pages(number: usize) -> usize {
    number.next_multiple_of(PAGE_SIZE)
}
pub fn is_page_aligned(number: usize) -> bool {
    number % PAGE_SIZE == 0
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PhysicalAddress(usize);

impl PhysicalAddress {
    #[inline(always)]
    pub const fn new(address: usize) -> Self {
        Self(address)
    }
    #[inline(always)]
    pub const fn data(self) -> usize {
        self.0
    }
    #[inline(always)]
    pub const fn add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[phys {:#0x}]", self.0)
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirtualAddress(usize);

impl VirtualAddress {
    #[inline(always)]
    pub const fn new(address: usize) -> Self {
        Self(address)
    }
    #[inline(always)]
    pub const fn data(self) -> usize {
        self.0
    }
    #[inline(always)]
    pub const fn add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }
    pub fn page_base(self) -> Self {
        Self(round_down_pages(self.0))
    }
    pub fn is_page_aligned(self) -> bool {
        is_page_aligned(self.0)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[virt {:#0x}]", self.0)
    }
}

/// A physical page. The frame doubles as the stable handle of the page: every table relating
/// pages to objects or mappings is keyed by it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Frame {
    // Frame 0x0 is never handed out, which keeps "frame field is zero" free to mean "invalid".
    physaddr: NonZeroUsize,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[frame at {:#0x}]", self.physaddr.get())
    }
}

impl Frame {
    /// Create a frame containing `address`
    pub fn containing(address: PhysicalAddress) -> Frame {
        Frame {
            physaddr: NonZeroUsize::new(address.data() & !PAGE_MASK)
                .unwrap_or_else(|| panic!("frame 0x0 is reserved")),
        }
    }
    pub fn start_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.physaddr.get())
    }
    pub fn next_by(self, n: usize) -> Self {
        self.physaddr
            .get()
            .checked_add(n * PAGE_SIZE)
            .and_then(NonZeroUsize::new)
            .map(|physaddr| Self { physaddr })
            .unwrap_or_else(|| panic!("overflow in Frame::next_by"))
    }
    pub fn offset_from(self, from: Self) -> usize {
        self.physaddr
            .get()
            .checked_sub(from.physaddr.get())
            .unwrap_or_else(|| panic!("overflow in Frame::offset_from"))
            / PAGE_SIZE
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Enomem;

impl From<Enomem> for Error {
    fn from(_: Enomem) -> Self {
        Self::new(ENOMEM)
    }
}

/// Why the slow path could not resolve a fault.
#[derive(Debug, PartialEq, Eq)]
pub enum PfError {
    /// A page or a page table could not be allocated.
    Oom,
    /// No region covers the address, or its pager has no page for it.
    Unmapped,
    /// The region exists but does not grant the requested access.
    Access,
}

impl From<Enomem> for PfError {
    fn from(_: Enomem) -> Self {
        PfError::Oom
    }
}

impl From<PfError> for Error {
    fn from(err: PfError) -> Self {
        match err {
            PfError::Oom => Error::new(ENOMEM),
            PfError::Unmapped => Error::new(EFAULT),
            PfError::Access => Error::new(EACCES),
        }
    }
}

/// An unresolvable fault, as reported to the exception entry code.
#[derive(Debug, PartialEq, Eq)]
pub struct Segv {
    pub address: VirtualAddress,
    /// Nothing is mapped at `address` (as opposed to a mapping refusing the access).
    pub unmapped: bool,
}

bitflags! {
    /// Arch-generic page fault flags, modeled after x86's error code.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct GenericPfFlags: u32 {
        const PRESENT = 1 << 0;
        const INVOLVED_WRITE = 1 << 1;
        const USER_NOT_SUPERVISOR = 1 << 2;
        const INSTR_NOT_DATA = 1 << 3;
    }
}

impl GenericPfFlags {
    /// The rights the faulting access needs: always read, plus write for stores and execute for
    /// instruction fetches.
    pub fn access(self) -> VmProt {
        let mut access = VmProt::READ;
        if self.contains(Self::INVOLVED_WRITE) {
            access |= VmProt::WRITE;
        }
        if self.contains(Self::INSTR_NOT_DATA) {
            access |= VmProt::EXEC;
        }
        access
    }
}

pub trait ArchIntCtx {
    fn ip(&self) -> usize;
    fn set_ip(&mut self, ip: usize);
    fn is_user(&self) -> bool;
}

/// Resolves a page fault, or reports it as a segmentation violation.
///
/// The pmap fast path runs first and only fixes up referenced and modified state. Anything it
/// cannot settle is handed to the address space covering the fault. A fault neither can resolve
/// resumes at the thread's recovery address if it has one; otherwise the caller decides between
/// a signal and a kernel oops.
pub fn page_fault_handler(
    vm: &Vm,
    thread: &mut Thread,
    stack: &mut impl ArchIntCtx,
    code: GenericPfFlags,
    faulting_address: VirtualAddress,
) -> Result<(), Segv> {
    let access = code.access();

    let error = match try_resolve(vm, faulting_address, access) {
        Ok(()) => return Ok(()),
        Err(error) => error,
    };

    log::debug!(
        "unresolved fault at {:?} (access {:?}, ip {:#x}): {}",
        faulting_address,
        access,
        stack.ip(),
        error
    );

    if let Some(onfault) = thread.take_onfault() {
        stack.set_ip(onfault);
        return Ok(());
    }

    Err(Segv {
        address: faulting_address,
        unmapped: error.errno == EFAULT,
    })
}

fn try_resolve(vm: &Vm, address: VirtualAddress, access: VmProt) -> Result<(), Error> {
    let paging = vm.paging();
    let Some(pmap) = paging.lookup(address) else {
        return Err(Error::new(EFAULT));
    };

    match paging.emulate_bits(&pmap, address, access) {
        Ok(()) => return Ok(()),
        Err(err) if err.errno == EFAULT => (),
        Err(err) => return Err(err),
    }

    let Some(space) = vm.space_for(address) else {
        return Err(Error::new(EFAULT));
    };
    space.resolve_fault(address, access).map_err(Error::from)
}
