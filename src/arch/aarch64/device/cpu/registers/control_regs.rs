//! Functions to read and write the translation control registers.

use crate::common::Asid;
use crate::memory::PhysicalAddress;

bitflags! {
    /// MAIR_EL1 layout: attribute index n lives in byte n.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MairEl1: u64 {
        const DEVICE_MEMORY = 0x00;
        const NORMAL_UNCACHED_MEMORY = 0x44 << 8;
        const NORMAL_WRITEBACK_MEMORY = 0xff << 16;
        const NORMAL_WRITETHROUGH_MEMORY = 0xbb << 24;
    }
}

/// The memory attributes the page table encoding refers to by index.
pub fn mair() -> MairEl1 {
    MairEl1::DEVICE_MEMORY
        | MairEl1::NORMAL_UNCACHED_MEMORY
        | MairEl1::NORMAL_WRITEBACK_MEMORY
        | MairEl1::NORMAL_WRITETHROUGH_MEMORY
}

/// TTBR value selecting `root` tagged with `asid`.
pub fn ttbr(root: PhysicalAddress, asid: Asid) -> u64 {
    (u64::from(asid.get()) << 48) | root.data() as u64
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod hw {
    use core::arch::asm;

    use super::MairEl1;

    pub unsafe fn ttbr0_el1() -> u64 {
        let ret: u64;
        asm!("mrs {}, ttbr0_el1", out(reg) ret);
        ret
    }

    pub unsafe fn ttbr0_el1_write(val: u64) {
        asm!("msr ttbr0_el1, {}", "isb", in(reg) val);
    }

    pub unsafe fn mair_el1_write(val: MairEl1) {
        asm!("msr mair_el1, {}", in(reg) val.bits());
    }

    /// Sets or clears TCR_EL1.EPD0, which disables walks through TTBR0.
    pub unsafe fn tcr_el1_epd0(disable: bool) {
        const EPD0: u64 = 1 << 7;
        let mut tcr: u64;
        asm!("mrs {}, tcr_el1", out(reg) tcr);
        if disable {
            tcr |= EPD0;
        } else {
            tcr &= !EPD0;
        }
        asm!("msr tcr_el1, {}", "isb", in(reg) tcr);
    }

    pub unsafe fn far_el1() -> usize {
        let ret: usize;
        asm!("mrs {}, far_el1", out(reg) ret);
        ret
    }

    pub unsafe fn esr_el1() -> u32 {
        let ret: u32;
        asm!("mrs {0:x}, esr_el1", out(reg) ret);
        ret
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub use self::hw::*;
