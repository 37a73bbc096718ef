//! Functions to flush the translation lookaside buffer (TLB).

use crate::common::Asid;
use crate::memory::VirtualAddress;

/// Operand of `tlbi vae1is`/`vale1is`: page number in bits 0..44, ASID in bits 48..64.
pub fn va_operand(asid: Option<Asid>, va: VirtualAddress) -> u64 {
    let page = ((va.data() >> 12) as u64) & ((1 << 44) - 1);
    page | asid.map_or(0, |asid| u64::from(asid.get()) << 48)
}

/// Operand of `tlbi aside1is`.
pub fn asid_operand(asid: Asid) -> u64 {
    u64::from(asid.get()) << 48
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod hw {
    use core::arch::asm;

    /// Drops the entries of one page in one address space.
    pub unsafe fn flush(operand: u64) {
        asm!("dsb ishst", "tlbi vae1is, {}", "dsb ish", "isb", in(reg) operand);
    }

    /// Drops the entries of one page in every address space; used for global kernel entries.
    pub unsafe fn flush_global(operand: u64) {
        asm!("dsb ishst", "tlbi vaae1is, {}", "dsb ish", "isb", in(reg) operand);
    }

    pub unsafe fn flush_asid(operand: u64) {
        asm!("dsb ishst", "tlbi aside1is, {}", "dsb ish", "isb", in(reg) operand);
    }

    pub unsafe fn flush_all() {
        asm!("dsb ishst", "tlbi vmalle1is", "dsb ish", "isb");
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub use self::hw::*;
