//! # Sv39 page table entries
//!
//! Cacheability uses the Svpbmt memory types. Accessed and dirty bits are managed in software
//! (Svade): an access with A clear, or a store with D clear, raises a page fault.

use crate::memory::{PhysicalAddress, VirtualAddress};
use crate::paging::entry::{Arch, CacheMode, MapFlags, Pde, Pte, VmProt};

pub const PTE_V: u64 = 1 << 0;
pub const PTE_R: u64 = 1 << 1;
pub const PTE_W: u64 = 1 << 2;
pub const PTE_X: u64 = 1 << 3;
pub const PTE_U: u64 = 1 << 4;
pub const PTE_G: u64 = 1 << 5;
pub const PTE_A: u64 = 1 << 6;
pub const PTE_D: u64 = 1 << 7;
/// Software bits (RSW).
pub const PTE_SW_COW: u64 = 1 << 8;
/// Write-only mappings must be hardware readable; this bit withholds read permission.
pub const PTE_SW_NOREAD: u64 = 1 << 9;
pub const PTE_PBMT_NC: u64 = 1 << 61;
pub const PTE_PBMT_IO: u64 = 2 << 61;
pub const PTE_PBMT_MASK: u64 = 3 << 61;

const PPN_SHIFT: u64 = 10;
const PPN_MASK: u64 = (1 << 44) - 1;

const PROT_BITS: u64 = PTE_V | PTE_R | PTE_W | PTE_X | PTE_SW_NOREAD | PTE_SW_COW;

static PROT_MAP: [u64; 8] = [
    /* NONE */ 0,
    /* R    */ PTE_V | PTE_R,
    /* W    */ PTE_V | PTE_R | PTE_W | PTE_SW_NOREAD,
    /* RW   */ PTE_V | PTE_R | PTE_W,
    /* X    */ PTE_V | PTE_X,
    /* RX   */ PTE_V | PTE_R | PTE_X,
    /* WX   */ PTE_V | PTE_R | PTE_W | PTE_X | PTE_SW_NOREAD,
    /* RWX  */ PTE_V | PTE_R | PTE_W | PTE_X,
];

fn ppn_bits(frame: PhysicalAddress) -> u64 {
    ((frame.data() as u64) >> 12) << PPN_SHIFT
}

fn is_user_entry(pte: u64) -> bool {
    pte & PTE_U != 0
}

pub struct Riscv64;

impl Arch for Riscv64 {
    const NAME: &'static str = "riscv64";
    const PAGE_TABLE_DEPTH: usize = 3;

    const USER_SPACE_BEGIN: usize = 0x0000_0000_0040_0000;
    const USER_SPACE_END: usize = 0x0000_0040_0000_0000;
    const KERNEL_SPACE_BEGIN: usize = 0xffff_ffc0_0000_0000;
    const KERNEL_SPACE_END: usize = 0xffff_ffff_ffff_ffff;
    const DMAP_BASE: usize = 0xffff_ffc0_0000_0000;

    fn pt_index(level: usize, va: VirtualAddress) -> usize {
        debug_assert!(level < Self::PAGE_TABLE_DEPTH);
        (va.data() >> (30 - 9 * level)) & (Self::ENTRY_COUNT - 1)
    }

    fn pte_make(frame: PhysicalAddress, prot: VmProt, flags: MapFlags, kernel: bool) -> Pte {
        assert_eq!(frame.data() & 0xfff, 0, "malformed frame {:?}", frame);

        let mut pte = ppn_bits(frame) | PROT_MAP[prot.index()];
        pte |= match flags.cache_mode() {
            CacheMode::WriteBack => 0,
            CacheMode::WriteThrough | CacheMode::NoCache => PTE_PBMT_NC,
        };
        if kernel {
            pte |= PTE_G | PTE_A | PTE_D;
        } else {
            pte |= PTE_U;
        }
        if flags.contains(MapFlags::COPY_ON_WRITE) {
            pte |= PTE_SW_COW;
        }
        Pte(pte)
    }

    fn pte_protect(pte: Pte, prot: VmProt) -> Pte {
        Pte((pte.0 & !PROT_BITS) | PROT_MAP[prot.index()])
    }

    fn pte_set_cow(pte: Pte) -> Pte {
        Pte(pte.0 | PTE_SW_COW)
    }

    fn pte_frame(pte: Pte) -> PhysicalAddress {
        PhysicalAddress::new((((pte.0 >> PPN_SHIFT) & PPN_MASK) << 12) as usize)
    }
    fn pte_readable(pte: Pte) -> bool {
        pte.0 & PTE_R != 0 && pte.0 & PTE_SW_NOREAD == 0
    }
    fn pte_writable(pte: Pte) -> bool {
        pte.0 & PTE_W != 0
    }
    fn pte_executable(pte: Pte) -> bool {
        pte.0 & PTE_X != 0
    }
    fn pte_is_cow(pte: Pte) -> bool {
        pte.0 & PTE_SW_COW != 0
    }
    fn pte_is_kernel(pte: Pte) -> bool {
        !is_user_entry(pte.0)
    }
    fn pte_cache_mode(pte: Pte) -> CacheMode {
        match pte.0 & PTE_PBMT_MASK {
            0 => CacheMode::WriteBack,
            _ => CacheMode::NoCache,
        }
    }

    fn pte_referenced(pte: Pte) -> bool {
        pte.0 & PTE_A != 0
    }
    fn pte_set_referenced(pte: Pte) -> Pte {
        Pte(pte.0 | PTE_A)
    }
    fn pte_clear_referenced(pte: Pte) -> Pte {
        if is_user_entry(pte.0) {
            Pte(pte.0 & !PTE_A)
        } else {
            pte
        }
    }
    fn pte_modified(pte: Pte) -> bool {
        Self::pte_writable(pte) && pte.0 & PTE_D != 0
    }
    fn pte_set_modified(pte: Pte) -> Pte {
        if Self::pte_writable(pte) {
            Pte(pte.0 | PTE_D)
        } else {
            pte
        }
    }
    fn pte_clear_modified(pte: Pte) -> Pte {
        if is_user_entry(pte.0) {
            Pte(pte.0 & !PTE_D)
        } else {
            pte
        }
    }

    fn pde_make(level: usize, table: PhysicalAddress) -> Pde {
        assert!(level < Self::PAGE_TABLE_DEPTH - 1, "no directory at level {}", level);
        Pde(ppn_bits(table) | PTE_V)
    }
    fn pde_valid(pde: Pde) -> bool {
        pde.0 & PTE_V != 0 && pde.0 & (PTE_R | PTE_W | PTE_X) == 0
    }
    fn pde_table(pde: Pde) -> PhysicalAddress {
        PhysicalAddress::new((((pde.0 >> PPN_SHIFT) & PPN_MASK) << 12) as usize)
    }
}
