use crate::memory::ArchIntCtx;

/// SPSR_EL1.M[3:0] of a trap taken from EL0.
const SPSR_MODE_EL0T: usize = 0b0000;
const SPSR_MODE_MASK: usize = 0b1111;

#[derive(Clone, Debug, Default)]
#[repr(C)]
pub struct IretRegisters {
    pub elr_el1: usize,
    pub spsr_el1: usize,
    pub esr_el1: usize,
    pub far_el1: usize,
    // Only meaningful for traps taken from EL0.
    pub sp_el0: usize,
}

impl IretRegisters {
    pub fn dump(&self) {
        log::error!("ELR_EL1:  {:>016X}", self.elr_el1);
        log::error!("SPSR_EL1: {:>016X}", self.spsr_el1);
        log::error!("ESR_EL1:  {:>016X}", self.esr_el1);
        log::error!("FAR_EL1:  {:>016X}", self.far_el1);
        log::error!("SP_EL0:   {:>016X}", self.sp_el0);
    }
}

/// Register state saved by the exception vectors.
#[derive(Clone, Debug, Default)]
#[repr(C)]
pub struct InterruptStack {
    /// X0 to X30.
    pub regs: [usize; 31],
    pub iret: IretRegisters,
}

impl InterruptStack {
    /// A frame for a trap taken from user mode at `elr`.
    pub fn user(elr: usize) -> Self {
        let mut stack = Self::default();
        stack.iret.elr_el1 = elr;
        stack.iret.spsr_el1 = SPSR_MODE_EL0T;
        stack
    }

    /// A frame for a trap taken from EL1 (EL1h) at `elr`.
    pub fn kernel(elr: usize) -> Self {
        let mut stack = Self::default();
        stack.iret.elr_el1 = elr;
        stack.iret.spsr_el1 = 0b0101;
        stack
    }

    pub fn dump(&self) {
        self.iret.dump();
        for (i, reg) in self.regs.iter().enumerate() {
            log::error!("X{:<2}:     {:>016X}", i, reg);
        }
    }
}

impl ArchIntCtx for InterruptStack {
    fn ip(&self) -> usize {
        self.iret.elr_el1
    }
    fn set_ip(&mut self, ip: usize) {
        self.iret.elr_el1 = ip;
    }
    fn is_user(&self) -> bool {
        self.iret.spsr_el1 & SPSR_MODE_MASK == SPSR_MODE_EL0T
    }
}
