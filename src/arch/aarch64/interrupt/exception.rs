//! Synchronous exception dispatch.

use crate::context::signal::{
    ksignal, SigInfo, BUS_ADRALN, ILL_ILLOPC, SEGV_ACCERR, SEGV_MAPERR, SIGBUS, SIGILL, SIGSEGV,
    SIGTRAP, SI_KERNEL, TRAP_BRKPT,
};
use crate::context::{Thread, Vm};
use crate::memory::{page_fault_handler, ArchIntCtx, GenericPfFlags, Segv, VirtualAddress};

use super::InterruptStack;

bitfield! {
    /// Exception syndrome (ESR_EL1).
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Esr(u64);
    impl Debug;
    pub u8, ec, _: 31, 26;
    pub il, _: 25;
    pub u32, iss, _: 24, 0;
    // Write not Read, for data aborts.
    pub wnr, _: 6;
    // Data or instruction fault status code.
    pub u8, dfsc, _: 5, 0;
}

impl Esr {
    pub fn class(&self) -> ExceptionClass {
        ExceptionClass(self.ec())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExceptionClass(pub u8);

impl ExceptionClass {
    pub const UNKNOWN: Self = Self(0b000000);
    pub const FP: Self = Self(0b000111);
    pub const SVC: Self = Self(0b010101);
    pub const MSR: Self = Self(0b011000);
    pub const IABT_LOW: Self = Self(0b100000);
    pub const IABT_CUR: Self = Self(0b100001);
    pub const PC_ALIGN: Self = Self(0b100010);
    pub const DABT_LOW: Self = Self(0b100100);
    pub const DABT_CUR: Self = Self(0b100101);
    pub const SP_ALIGN: Self = Self(0b100110);
    pub const BRK: Self = Self(0b111100);

    pub fn is_abort(self) -> bool {
        matches!(
            self,
            Self::IABT_LOW | Self::IABT_CUR | Self::DABT_LOW | Self::DABT_CUR
        )
    }
    pub fn is_instruction_abort(self) -> bool {
        matches!(self, Self::IABT_LOW | Self::IABT_CUR)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortKind {
    Translation,
    AccessFlag,
    Permission,
    Alignment,
}

impl AbortKind {
    pub fn from_dfsc(dfsc: u8) -> Option<Self> {
        match dfsc {
            0b000100..=0b000111 => Some(Self::Translation),
            0b001001..=0b001011 => Some(Self::AccessFlag),
            0b001101..=0b001111 => Some(Self::Permission),
            0b100001 => Some(Self::Alignment),
            _ => None,
        }
    }
}

/// What the exception return path has to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapOutcome {
    /// Return to the interrupted code, possibly with a signal pending.
    Resume,
    /// A system call; the caller dispatches it.
    Syscall,
}

#[cold]
fn kernel_oops(stack: &InterruptStack, what: &str, far: VirtualAddress) -> ! {
    log::error!("kernel oops: {} at {:#x}, address {:?}", what, stack.ip(), far);
    stack.dump();
    panic!("kernel oops: {} at {:#x}", what, stack.ip());
}

fn fault_flags(class: ExceptionClass, is_write: bool, user: bool) -> GenericPfFlags {
    let mut code = GenericPfFlags::PRESENT;
    code.set(GenericPfFlags::INVOLVED_WRITE, is_write);
    code.set(GenericPfFlags::USER_NOT_SUPERVISOR, user);
    code.set(GenericPfFlags::INSTR_NOT_DATA, class.is_instruction_abort());
    code
}

/// Resolves a translation, access flag or permission fault taken from user mode. An
/// unresolvable fault queues exactly one `SIGSEGV` on the process.
pub fn handle_user_abort(
    vm: &Vm,
    thread: &mut Thread,
    stack: &mut InterruptStack,
    class: ExceptionClass,
    far: VirtualAddress,
    is_write: bool,
) {
    let code = fault_flags(class, is_write, true);
    if let Err(Segv { address, unmapped }) = page_fault_handler(vm, thread, stack, code, far) {
        let code = if unmapped { SEGV_MAPERR } else { SEGV_ACCERR };
        ksignal(
            thread,
            SigInfo {
                signo: SIGSEGV,
                code,
                addr: address,
            },
        );
    }
}

/// Like [`handle_user_abort`] for faults taken from the kernel, where an unresolvable fault
/// outside a recovery section is fatal.
pub fn handle_kernel_abort(
    vm: &Vm,
    thread: &mut Thread,
    stack: &mut InterruptStack,
    class: ExceptionClass,
    far: VirtualAddress,
) {
    let is_write = Esr(stack.iret.esr_el1 as u64).wnr() && !class.is_instruction_abort();
    let code = fault_flags(class, is_write, false);
    if page_fault_handler(vm, thread, stack, code, far).is_err() {
        kernel_oops(stack, "unresolvable page fault", far);
    }
}

fn signal(thread: &Thread, signo: usize, code: i32, addr: usize) -> TrapOutcome {
    ksignal(
        thread,
        SigInfo {
            signo,
            code,
            addr: VirtualAddress::new(addr),
        },
    );
    TrapOutcome::Resume
}

/// Non-abort exceptions from user mode.
pub fn handle_user_exception(
    thread: &mut Thread,
    stack: &mut InterruptStack,
    class: ExceptionClass,
) -> TrapOutcome {
    match class {
        ExceptionClass::SVC => TrapOutcome::Syscall,
        ExceptionClass::FP => {
            // Lazily enabled; the context switch code saves the registers from now on.
            thread.fpu_used = true;
            TrapOutcome::Resume
        }
        ExceptionClass::PC_ALIGN => signal(thread, SIGBUS, BUS_ADRALN, stack.iret.far_el1),
        ExceptionClass::SP_ALIGN => signal(thread, SIGBUS, BUS_ADRALN, stack.iret.sp_el0),
        ExceptionClass::UNKNOWN | ExceptionClass::MSR => {
            signal(thread, SIGILL, ILL_ILLOPC, stack.ip())
        }
        ExceptionClass::BRK => signal(thread, SIGTRAP, TRAP_BRKPT, stack.ip()),
        other => kernel_oops(
            stack,
            "unexpected exception class from user mode",
            VirtualAddress::new(other.0 as usize),
        ),
    }
}

/// Entry point for every synchronous exception.
pub fn synchronous_exception(
    vm: &Vm,
    thread: &mut Thread,
    stack: &mut InterruptStack,
) -> TrapOutcome {
    let esr = Esr(stack.iret.esr_el1 as u64);
    let class = esr.class();
    let user = stack.is_user();
    let far = VirtualAddress::new(stack.iret.far_el1);

    if !class.is_abort() {
        if user {
            return handle_user_exception(thread, stack, class);
        }
        kernel_oops(stack, "synchronous exception", far);
    }

    match AbortKind::from_dfsc(esr.dfsc()) {
        Some(AbortKind::Translation | AbortKind::AccessFlag | AbortKind::Permission) => {
            if user {
                let is_write = esr.wnr() && !class.is_instruction_abort();
                handle_user_abort(vm, thread, stack, class, far, is_write);
            } else {
                handle_kernel_abort(vm, thread, stack, class, far);
            }
        }
        Some(AbortKind::Alignment) if user => {
            signal(thread, SIGBUS, BUS_ADRALN, far.data());
        }
        _ if user => {
            log::warn!("unhandled abort {:?} at {:?}", esr, far);
            signal(thread, SIGSEGV, SI_KERNEL, far.data());
        }
        _ => kernel_oops(stack, "unhandled abort", far),
    }
    TrapOutcome::Resume
}
