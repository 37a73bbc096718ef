//! # AArch64 page table entries
//!
//! Stage 1 descriptors for a 4 KiB granule with 48-bit addresses. Software-defined bits 55..58
//! carry the rights a mapping was granted, independent of what the hardware currently allows:
//! user entries start without the access flag and, when writable, read-only, so the first read
//! and the first write each fault once and update referenced and modified state.

use crate::memory::{PhysicalAddress, VirtualAddress};
use crate::paging::entry::{Arch, CacheMode, MapFlags, Pde, Pte, VmProt};

pub const ATTR_SW_COW: u64 = 1 << 58;
pub const ATTR_SW_WRITE: u64 = 1 << 57;
pub const ATTR_SW_MANAGED: u64 = 1 << 56;
pub const ATTR_SW_READ: u64 = 1 << 55;
pub const ATTR_UXN: u64 = 1 << 54;
pub const ATTR_PXN: u64 = 1 << 53;
pub const ATTR_XN: u64 = ATTR_UXN | ATTR_PXN;
pub const ATTR_NG: u64 = 1 << 11;
pub const ATTR_AF: u64 = 1 << 10;
pub const ATTR_SH_IS: u64 = 3 << 8;
pub const ATTR_AP_RO: u64 = 2 << 6;
pub const ATTR_AP_USER: u64 = 1 << 6;
pub const ATTR_IDX_MASK: u64 = 7 << 2;
pub const L3_PAGE: u64 = 0b11;
pub const L012_TABLE: u64 = 0b11;
pub const ADDR_MASK: u64 = 0x0000_ffff_ffff_f000;

/// Memory attribute indices, matching the MAIR_EL1 layout installed at boot.
pub const ATTR_IDX_DEVICE: u64 = 0 << 2;
pub const ATTR_IDX_NC: u64 = 1 << 2;
pub const ATTR_IDX_WB: u64 = 2 << 2;
pub const ATTR_IDX_WT: u64 = 3 << 2;

const PROT_BITS: u64 = ATTR_SW_READ | ATTR_SW_WRITE | ATTR_SW_COW | ATTR_AP_RO | ATTR_XN;

/// Permission bits per protection, indexed by [`VmProt::index`]. Execute permission is
/// narrowed further to one privilege level in [`exec_bits`].
static PROT_MAP: [u64; 8] = [
    /* NONE */ ATTR_XN | ATTR_AP_RO,
    /* R    */ ATTR_SW_READ | ATTR_AP_RO | ATTR_XN,
    /* W    */ ATTR_SW_WRITE | ATTR_XN,
    /* RW   */ ATTR_SW_READ | ATTR_SW_WRITE | ATTR_XN,
    /* X    */ ATTR_AP_RO,
    /* RX   */ ATTR_SW_READ | ATTR_AP_RO,
    /* WX   */ ATTR_SW_WRITE,
    /* RWX  */ ATTR_SW_READ | ATTR_SW_WRITE,
];

fn is_user_entry(pte: u64) -> bool {
    pte & ATTR_AP_USER != 0
}

/// Executable user pages are never executable at EL1, and the other way around.
fn exec_bits(base: u64, user: bool) -> u64 {
    if base & ATTR_XN == ATTR_XN {
        base
    } else if user {
        base | ATTR_PXN
    } else {
        base | ATTR_UXN
    }
}

fn perm_bits(prot: VmProt, user: bool, modified: bool) -> u64 {
    let mut bits = exec_bits(PROT_MAP[prot.index()], user);
    if user && bits & ATTR_SW_WRITE != 0 && !modified {
        // Writable but clean: the first store faults and marks the page modified.
        bits |= ATTR_AP_RO;
    }
    bits
}

fn cache_bits(mode: CacheMode) -> u64 {
    match mode {
        CacheMode::WriteBack => ATTR_IDX_WB,
        CacheMode::WriteThrough => ATTR_IDX_WT,
        CacheMode::NoCache => ATTR_IDX_NC,
    }
}

pub struct AArch64;

impl Arch for AArch64 {
    const NAME: &'static str = "aarch64";
    const PAGE_TABLE_DEPTH: usize = 4;

    const USER_SPACE_BEGIN: usize = 0x0000_0000_0040_0000;
    const USER_SPACE_END: usize = 0x0000_8000_0000_0000;
    const KERNEL_SPACE_BEGIN: usize = 0xffff_0000_0000_0000;
    const KERNEL_SPACE_END: usize = 0xffff_ffff_ffff_ffff;
    const DMAP_BASE: usize = 0xffff_ff80_0000_0000;

    fn pt_index(level: usize, va: VirtualAddress) -> usize {
        debug_assert!(level < Self::PAGE_TABLE_DEPTH);
        (va.data() >> (39 - 9 * level)) & (Self::ENTRY_COUNT - 1)
    }

    fn pte_make(frame: PhysicalAddress, prot: VmProt, flags: MapFlags, kernel: bool) -> Pte {
        assert_eq!(frame.data() as u64 & !ADDR_MASK, 0, "malformed frame {:?}", frame);

        let mut pte = frame.data() as u64
            | L3_PAGE
            | ATTR_SH_IS
            | cache_bits(flags.cache_mode())
            | perm_bits(prot, !kernel, kernel);
        if kernel {
            pte |= ATTR_AF;
        } else {
            pte |= ATTR_AP_USER | ATTR_NG | ATTR_SW_MANAGED;
        }
        if flags.contains(MapFlags::COPY_ON_WRITE) {
            pte |= ATTR_SW_COW;
        }
        Pte(pte)
    }

    fn pte_protect(pte: Pte, prot: VmProt) -> Pte {
        let user = is_user_entry(pte.0);
        let modified = !user || Self::pte_modified(pte);
        Pte((pte.0 & !PROT_BITS) | perm_bits(prot, user, modified))
    }

    fn pte_set_cow(pte: Pte) -> Pte {
        Pte(pte.0 | ATTR_SW_COW)
    }

    fn pte_frame(pte: Pte) -> PhysicalAddress {
        PhysicalAddress::new((pte.0 & ADDR_MASK) as usize)
    }
    fn pte_readable(pte: Pte) -> bool {
        pte.0 & ATTR_SW_READ != 0
    }
    fn pte_writable(pte: Pte) -> bool {
        pte.0 & ATTR_SW_WRITE != 0
    }
    fn pte_executable(pte: Pte) -> bool {
        let xn = if is_user_entry(pte.0) { ATTR_UXN } else { ATTR_PXN };
        pte.0 & xn == 0
    }
    fn pte_is_cow(pte: Pte) -> bool {
        pte.0 & ATTR_SW_COW != 0
    }
    fn pte_is_kernel(pte: Pte) -> bool {
        !is_user_entry(pte.0)
    }
    fn pte_cache_mode(pte: Pte) -> CacheMode {
        match pte.0 & ATTR_IDX_MASK {
            ATTR_IDX_WT => CacheMode::WriteThrough,
            ATTR_IDX_NC | ATTR_IDX_DEVICE => CacheMode::NoCache,
            _ => CacheMode::WriteBack,
        }
    }

    fn pte_referenced(pte: Pte) -> bool {
        pte.0 & ATTR_AF != 0
    }
    fn pte_set_referenced(pte: Pte) -> Pte {
        Pte(pte.0 | ATTR_AF)
    }
    fn pte_clear_referenced(pte: Pte) -> Pte {
        if is_user_entry(pte.0) {
            Pte(pte.0 & !ATTR_AF)
        } else {
            pte
        }
    }
    fn pte_modified(pte: Pte) -> bool {
        Self::pte_writable(pte) && pte.0 & ATTR_AP_RO == 0
    }
    fn pte_set_modified(pte: Pte) -> Pte {
        if Self::pte_writable(pte) {
            Pte(pte.0 & !ATTR_AP_RO)
        } else {
            pte
        }
    }
    fn pte_clear_modified(pte: Pte) -> Pte {
        if Self::pte_writable(pte) && is_user_entry(pte.0) {
            Pte(pte.0 | ATTR_AP_RO)
        } else {
            pte
        }
    }

    fn pde_make(level: usize, table: PhysicalAddress) -> Pde {
        assert!(level < Self::PAGE_TABLE_DEPTH - 1, "no directory at level {}", level);
        assert_eq!(table.data() as u64 & !ADDR_MASK, 0, "malformed table {:?}", table);
        Pde(table.data() as u64 | L012_TABLE)
    }
    fn pde_valid(pde: Pde) -> bool {
        pde.0 & L012_TABLE == L012_TABLE
    }
    fn pde_table(pde: Pde) -> PhysicalAddress {
        PhysicalAddress::new((pde.0 & ADDR_MASK) as usize)
    }
}
