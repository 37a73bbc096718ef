//! # Page table entries
//!
//! The pmap layer manipulates entries only through [`Arch`], a set of pure functions from a
//! protection and a few mapping flags to the architecture's bit pattern and back.

use core::fmt;

use crate::memory::{PhysicalAddress, VirtualAddress};

bitflags! {
    /// Access rights of a mapping.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct VmProt: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl VmProt {
    pub const NONE: Self = Self::empty();
    pub const RW: Self = Self::READ.union(Self::WRITE);
    pub const RX: Self = Self::READ.union(Self::EXEC);

    /// Index into an eight entry protection table.
    pub const fn index(self) -> usize {
        self.bits() as usize
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MapFlags: u8 {
        const NOCACHE = 1 << 0;
        const WRITE_THROUGH = 1 << 1;
        /// Read-only view of a page that becomes private when written.
        const COPY_ON_WRITE = 1 << 2;
    }
}

/// Cache policy requested by [`MapFlags`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheMode {
    WriteBack,
    WriteThrough,
    NoCache,
}

impl MapFlags {
    pub fn cache_mode(self) -> CacheMode {
        if self.contains(MapFlags::NOCACHE) {
            CacheMode::NoCache
        } else if self.contains(MapFlags::WRITE_THROUGH) {
            CacheMode::WriteThrough
        } else {
            CacheMode::WriteBack
        }
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(pub u64);

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pte({:#018x})", self.0)
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pde(pub u64);

impl fmt::Debug for Pde {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pde({:#018x})", self.0)
    }
}

/// Page table format of one architecture.
///
/// Level 0 is the top-level directory; level `PAGE_TABLE_DEPTH - 1` holds the [`Pte`]s.
pub trait Arch {
    const NAME: &'static str;
    const PAGE_TABLE_DEPTH: usize;
    /// Entries per table at every level.
    const ENTRY_COUNT: usize = 512;

    const USER_SPACE_BEGIN: usize;
    const USER_SPACE_END: usize;
    const KERNEL_SPACE_BEGIN: usize;
    const KERNEL_SPACE_END: usize;
    /// Virtual base of the direct map of physical memory.
    const DMAP_BASE: usize;

    fn pt_index(level: usize, va: VirtualAddress) -> usize;

    fn pte_make(frame: PhysicalAddress, prot: VmProt, flags: MapFlags, kernel: bool) -> Pte;
    /// Replaces the permission bits of `pte`. Frame and cache attributes are kept.
    fn pte_protect(pte: Pte, prot: VmProt) -> Pte;
    fn pte_set_cow(pte: Pte) -> Pte;

    fn pte_frame(pte: Pte) -> PhysicalAddress;
    fn pte_readable(pte: Pte) -> bool;
    fn pte_writable(pte: Pte) -> bool;
    fn pte_executable(pte: Pte) -> bool;
    fn pte_is_cow(pte: Pte) -> bool;
    fn pte_is_kernel(pte: Pte) -> bool;
    fn pte_cache_mode(pte: Pte) -> CacheMode;

    fn pte_referenced(pte: Pte) -> bool;
    fn pte_set_referenced(pte: Pte) -> Pte;
    fn pte_clear_referenced(pte: Pte) -> Pte;
    fn pte_modified(pte: Pte) -> bool;
    fn pte_set_modified(pte: Pte) -> Pte;
    fn pte_clear_modified(pte: Pte) -> Pte;

    fn pde_make(level: usize, table: PhysicalAddress) -> Pde;
    fn pde_valid(pde: Pde) -> bool;
    fn pde_table(pde: Pde) -> PhysicalAddress;

    fn pte_empty() -> Pte {
        Pte(0)
    }
    fn pte_valid(pte: Pte) -> bool {
        Self::pte_frame(pte).data() != 0
    }
    fn pte_prot(pte: Pte) -> VmProt {
        let mut prot = VmProt::NONE;
        prot.set(VmProt::READ, Self::pte_readable(pte));
        prot.set(VmProt::WRITE, Self::pte_writable(pte));
        prot.set(VmProt::EXEC, Self::pte_executable(pte));
        prot
    }
    /// Whether `pte` grants every right in `access`.
    fn pte_access(pte: Pte, access: VmProt) -> bool {
        Self::pte_prot(pte).contains(access)
    }

    fn is_user(va: VirtualAddress) -> bool {
        (Self::USER_SPACE_BEGIN..Self::USER_SPACE_END).contains(&va.data())
    }
    fn is_kernel(va: VirtualAddress) -> bool {
        (Self::KERNEL_SPACE_BEGIN..=Self::KERNEL_SPACE_END).contains(&va.data())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    pub fn prot() -> impl Strategy<Value = VmProt> {
        (0u8..8).prop_map(VmProt::from_bits_truncate)
    }

    pub fn flags() -> impl Strategy<Value = MapFlags> {
        (0u8..8).prop_map(MapFlags::from_bits_truncate)
    }

    /// Frames below 2^39 fit every supported format.
    pub fn frame() -> impl Strategy<Value = PhysicalAddress> {
        (1usize..1 << 27).prop_map(|n| PhysicalAddress::new(n << 12))
    }

    /// Checks the encoding laws shared by every architecture.
    pub fn check_round_trip<A: Arch>(
        frame: PhysicalAddress,
        prot: VmProt,
        flags: MapFlags,
        kernel: bool,
    ) -> Result<(), TestCaseError> {
        let pte = A::pte_make(frame, prot, flags, kernel);
        prop_assert!(A::pte_valid(pte));
        prop_assert_eq!(A::pte_frame(pte), frame);
        prop_assert_eq!(A::pte_prot(pte), prot);
        prop_assert_eq!(A::pte_is_kernel(pte), kernel);
        prop_assert_eq!(A::pte_is_cow(pte), flags.contains(MapFlags::COPY_ON_WRITE));
        prop_assert_eq!(
            A::pte_cache_mode(pte) == CacheMode::WriteBack,
            flags.cache_mode() == CacheMode::WriteBack
        );
        if flags.cache_mode() == CacheMode::NoCache {
            prop_assert_eq!(A::pte_cache_mode(pte), CacheMode::NoCache);
        }
        if !kernel {
            prop_assert!(!A::pte_referenced(pte), "user entries start unreferenced");
        }

        for new in [VmProt::NONE, VmProt::READ, VmProt::RW, VmProt::RX, VmProt::all()] {
            let protected = A::pte_protect(pte, new);
            prop_assert_eq!(A::pte_frame(protected), frame);
            prop_assert_eq!(A::pte_prot(protected), new);
            prop_assert_eq!(A::pte_cache_mode(protected), A::pte_cache_mode(pte));
            prop_assert_eq!(A::pte_is_kernel(protected), kernel);
        }

        let touched = A::pte_set_modified(A::pte_set_referenced(pte));
        prop_assert!(A::pte_referenced(touched));
        prop_assert_eq!(A::pte_modified(touched), prot.contains(VmProt::WRITE));
        prop_assert_eq!(A::pte_prot(touched), prot);
        prop_assert_eq!(A::pte_frame(touched), frame);

        if !kernel {
            let reset = A::pte_clear_modified(A::pte_clear_referenced(touched));
            prop_assert!(!A::pte_referenced(reset));
            prop_assert!(!A::pte_modified(reset));
            prop_assert_eq!(A::pte_prot(reset), prot);
        }

        prop_assert!(!A::pte_valid(A::pte_empty()));
        Ok(())
    }

    #[test]
    fn prot_index_covers_table() {
        assert_eq!(VmProt::NONE.index(), 0);
        assert_eq!(VmProt::all().index(), 7);
        assert_eq!(VmProt::RW, VmProt::READ | VmProt::WRITE);
    }

    #[test]
    fn cache_mode_precedence() {
        assert_eq!(MapFlags::empty().cache_mode(), CacheMode::WriteBack);
        assert_eq!(MapFlags::WRITE_THROUGH.cache_mode(), CacheMode::WriteThrough);
        assert_eq!(
            (MapFlags::NOCACHE | MapFlags::WRITE_THROUGH).cache_mode(),
            CacheMode::NoCache
        );
    }
}
