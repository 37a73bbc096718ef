use core::sync::atomic::{AtomicU64, Ordering};

use crate::common::Asid;
use crate::memory::{PhysicalAddress, VirtualAddress};
use crate::paging::Mmu;

use self::registers::{control_regs, tlb};

pub mod registers {
    pub mod control_regs;
    pub mod tlb;
}

/// The EL1 translation registers.
///
/// The value last written to TTBR0_EL1 is shadowed so it can be inspected without a register
/// read; off target the shadow is all there is.
#[derive(Debug, Default)]
pub struct HwMmu {
    ttbr0: AtomicU64,
}

impl HwMmu {
    /// Programs MAIR_EL1 with the attributes the page table entries refer to.
    pub fn init(&self) {
        let mair = control_regs::mair();
        log::debug!("MAIR_EL1 {:#018x}", mair.bits());
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        unsafe {
            control_regs::mair_el1_write(mair);
        }
    }

    /// Shadow of TTBR0_EL1; zero when user translation is off.
    pub fn ttbr0(&self) -> u64 {
        self.ttbr0.load(Ordering::Relaxed)
    }
}

impl Mmu for HwMmu {
    fn set_user_table(&self, table: Option<(PhysicalAddress, Asid)>) {
        let value = table.map_or(0, |(root, asid)| control_regs::ttbr(root, asid));
        self.ttbr0.store(value, Ordering::Relaxed);

        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        unsafe {
            control_regs::tcr_el1_epd0(table.is_none());
            control_regs::ttbr0_el1_write(value);
        }
    }

    fn invalidate_page(&self, asid: Option<Asid>, va: VirtualAddress) {
        let operand = tlb::va_operand(asid, va);
        log::trace!("tlbi va {:#x}", operand);
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        unsafe {
            match asid {
                Some(_) => tlb::flush(operand),
                None => tlb::flush_global(operand),
            }
        }
    }

    fn invalidate_asid(&self, asid: Asid) {
        let operand = tlb::asid_operand(asid);
        log::trace!("tlbi asid {:#x}", operand);
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        unsafe {
            tlb::flush_asid(operand);
        }
    }
}
