//! Scenarios spanning objects, amaps, pmaps and trap dispatch, with a software model of the
//! translation hardware.

use alloc::sync::Arc;
use alloc::vec::Vec;

use proptest::prelude::*;
use spin::Mutex;

use crate::arch::aarch64::interrupt::{
    handle_kernel_abort, handle_user_abort, synchronous_exception, AbortKind, ExceptionClass,
    InterruptStack, TrapOutcome,
};
use crate::common::Asid;
use crate::context::signal::{
    ksignal, SigInfo, MAX_PENDING, SEGV_ACCERR, SEGV_MAPERR, SIGBUS, SIGILL, SIGSEGV, SIGTRAP,
    TRAP_BRKPT,
};
use crate::context::{AddressSpace, Process, Region, Thread, Vm};
use crate::memory::{
    ArchIntCtx, PhysMem, PhysicalAddress, RemovePolicy, VirtualAddress, VmObject, Pager,
    PAGE_SIZE,
};
use crate::paging::{Arch, CurrentArch as A, Mmu, Paging, PagingConfig, VmProt};

pub const PHYS_BASE: usize = 0x4000_0000;
const USER_PC: usize = 0x40_0100;
const KERNEL_PC: usize = 0xffff_ffc0_1000_0100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmuEvent {
    SetUserTable(Option<(PhysicalAddress, Asid)>),
    Invalidate(Option<Asid>, VirtualAddress),
    InvalidateAsid(Asid),
}

/// Records every request made to the translation hardware.
#[derive(Debug, Default)]
pub struct TraceMmu {
    events: Mutex<Vec<MmuEvent>>,
}

impl TraceMmu {
    pub fn events(&self) -> Vec<MmuEvent> {
        self.events.lock().clone()
    }
}

impl Mmu for TraceMmu {
    fn set_user_table(&self, table: Option<(PhysicalAddress, Asid)>) {
        self.events.lock().push(MmuEvent::SetUserTable(table));
    }
    fn invalidate_page(&self, asid: Option<Asid>, va: VirtualAddress) {
        self.events.lock().push(MmuEvent::Invalidate(asid, va));
    }
    fn invalidate_asid(&self, asid: Asid) {
        self.events.lock().push(MmuEvent::InvalidateAsid(asid));
    }
}

/// A paging service over `pages` pages of simulated memory.
pub fn paging(pages: usize) -> (Arc<Paging>, Arc<TraceMmu>) {
    let phys = Arc::new(PhysMem::new(PhysicalAddress::new(PHYS_BASE), pages));
    let mmu = Arc::new(TraceMmu::default());
    let paging = Paging::bootstrap(PagingConfig::default(), phys, mmu.clone()).unwrap();
    (Arc::new(paging), mmu)
}

fn user_va(page: usize) -> VirtualAddress {
    VirtualAddress::new(A::USER_SPACE_BEGIN + page * PAGE_SIZE)
}

fn kernel_va(page: usize) -> VirtualAddress {
    VirtualAddress::new(A::KERNEL_SPACE_BEGIN + 0x1000_0000 + page * PAGE_SIZE)
}

struct Env {
    vm: Vm,
    thread: Thread,
}

impl Env {
    fn new(pages: usize) -> Env {
        let (paging, _) = paging(pages);
        let vm = Vm::new(paging);
        let space = AddressSpace::new(vm.paging(), RemovePolicy::default()).unwrap();
        vm.activate(Some(&space));
        Env {
            vm,
            thread: Thread::user(Process::new(space)),
        }
    }

    fn space(&self) -> &Arc<AddressSpace> {
        self.thread.process().unwrap().space()
    }

    fn switch_to(&mut self, process: Arc<Process>) {
        self.vm.activate(Some(process.space()));
        self.thread = Thread::user(process);
    }

    fn signals(&self) -> Vec<SigInfo> {
        self.thread.process().unwrap().take_pending()
    }
}

/// What the hardware would report for `access` to `va`, or `None` if the access goes through.
fn hardware_fault(vm: &Vm, va: VirtualAddress, access: VmProt) -> Option<AbortKind> {
    let Some(pmap) = vm.paging().lookup(va) else {
        return Some(AbortKind::Translation);
    };
    let Some(pte) = vm.paging().pte(&pmap, va) else {
        return Some(AbortKind::Translation);
    };
    if !A::pte_referenced(pte) {
        Some(AbortKind::AccessFlag)
    } else if !A::pte_access(pte, access)
        || (access.contains(VmProt::WRITE) && !A::pte_modified(pte))
    {
        Some(AbortKind::Permission)
    } else {
        None
    }
}

fn abort_frame(va: VirtualAddress, access: VmProt, user: bool, kind: AbortKind) -> InterruptStack {
    let class = match (access.contains(VmProt::EXEC), user) {
        (true, true) => ExceptionClass::IABT_LOW,
        (true, false) => ExceptionClass::IABT_CUR,
        (false, true) => ExceptionClass::DABT_LOW,
        (false, false) => ExceptionClass::DABT_CUR,
    };
    let dfsc = match kind {
        AbortKind::Translation => 0b000111,
        AbortKind::AccessFlag => 0b001011,
        AbortKind::Permission => 0b001111,
        AbortKind::Alignment => 0b100001,
    };
    let write = access.contains(VmProt::WRITE) && !access.contains(VmProt::EXEC);

    let mut stack = if user {
        InterruptStack::user(USER_PC)
    } else {
        InterruptStack::kernel(KERNEL_PC)
    };
    stack.iret.esr_el1 = ((class.0 as usize) << 26) | (1 << 25) | ((write as usize) << 6) | dfsc;
    stack.iret.far_el1 = va.data();
    stack
}

/// Performs a user access the way the processor would: fault, let the kernel handle it, retry.
/// Returns the number of faults taken, or the signal that stopped the access.
fn touch(env: &mut Env, va: VirtualAddress, access: VmProt) -> Result<usize, SigInfo> {
    for faults in 0..8 {
        let Some(kind) = hardware_fault(&env.vm, va, access) else {
            return Ok(faults);
        };
        let mut stack = abort_frame(va, access, true, kind);
        assert_eq!(
            synchronous_exception(&env.vm, &mut env.thread, &mut stack),
            TrapOutcome::Resume
        );
        assert_eq!(stack.ip(), USER_PC);
        let mut signals = env.signals();
        if let Some(signal) = signals.pop() {
            assert!(signals.is_empty(), "more than one signal for one fault");
            return Err(signal);
        }
    }
    panic!("access to {:?} keeps faulting", va);
}

fn frame_of(env: &Env, va: VirtualAddress) -> PhysicalAddress {
    let pmap = env.vm.paging().lookup(va).unwrap();
    env.vm.paging().extract(&pmap, va).unwrap()
}

fn write_user(env: &mut Env, va: VirtualAddress, value: u64) {
    touch(env, va, VmProt::RW).unwrap();
    let pa = frame_of(env, va);
    env.vm.paging().phys().write_u64(pa, value);
}

fn read_user(env: &mut Env, va: VirtualAddress) -> u64 {
    touch(env, va, VmProt::READ).unwrap();
    let pa = frame_of(env, va);
    env.vm.paging().phys().read_u64(pa)
}

#[test]
fn first_touch_of_anonymous_memory() {
    let mut env = Env::new(64);
    let region = Region::new(user_va(0), 4 * PAGE_SIZE);
    env.space().map_anonymous(region, VmProt::RW, false).unwrap();

    // Translation fault, then the access flag.
    assert_eq!(touch(&mut env, user_va(1), VmProt::READ), Ok(2));
    assert_eq!(read_user(&mut env, user_va(1)), 0);
    // Clean page: one more fault to mark it modified.
    assert_eq!(touch(&mut env, user_va(1), VmProt::RW), Ok(1));
    assert_eq!(touch(&mut env, user_va(1), VmProt::RW), Ok(0));

    let page = crate::memory::Frame::containing(frame_of(&env, user_va(1)));
    assert!(env.vm.paging().is_referenced(page));
    assert!(env.vm.paging().is_modified(page));
    assert_eq!(env.space().find_region(user_va(3)).unwrap().region, region);
}

#[test]
fn copy_on_write_after_fork() {
    let mut env = Env::new(128);
    env.space()
        .map_anonymous(Region::new(user_va(0), 2 * PAGE_SIZE), VmProt::RW, false)
        .unwrap();
    write_user(&mut env, user_va(0), 0xaa);

    let parent = Arc::clone(env.thread.process().unwrap());
    let child = Process::new(parent.space().fork().unwrap());
    let parent_frame = frame_of(&env, user_va(0));

    // The parent lost write access until it faults again.
    let pte = env.vm.paging().pte(parent.space().pmap(), user_va(0)).unwrap();
    assert!(A::pte_is_cow(pte));
    assert!(!A::pte_writable(pte));

    env.switch_to(Arc::clone(&child));
    assert_eq!(read_user(&mut env, user_va(0)), 0xaa);
    assert_eq!(frame_of(&env, user_va(0)), parent_frame);

    write_user(&mut env, user_va(0), 0xbb);
    let child_frame = frame_of(&env, user_va(0));
    assert_ne!(child_frame, parent_frame);

    env.switch_to(parent);
    assert_eq!(read_user(&mut env, user_va(0)), 0xaa);
    // Nobody else holds the page any more; it is reused in place.
    write_user(&mut env, user_va(0), 0xcc);
    assert_eq!(frame_of(&env, user_va(0)), parent_frame);

    env.switch_to(child);
    assert_eq!(read_user(&mut env, user_va(0)), 0xbb);
}

#[test]
fn child_read_after_fork_stays_copy_on_write() {
    let mut env = Env::new(64);
    env.space()
        .map_anonymous(Region::new(user_va(0), PAGE_SIZE), VmProt::RW, false)
        .unwrap();
    write_user(&mut env, user_va(0), 0xaa);
    let parent = Arc::clone(env.thread.process().unwrap());
    let parent_frame = frame_of(&env, user_va(0));

    env.switch_to(Process::new(parent.space().fork().unwrap()));
    assert_eq!(read_user(&mut env, user_va(0)), 0xaa);
    let pte = env.vm.paging().pte(env.space().pmap(), user_va(0)).unwrap();
    assert!(A::pte_is_cow(pte));
    assert!(!A::pte_writable(pte));
    assert_eq!(
        hardware_fault(&env.vm, user_va(0), VmProt::RW),
        Some(AbortKind::Permission)
    );

    write_user(&mut env, user_va(0), 0xbb);
    assert_ne!(frame_of(&env, user_va(0)), parent_frame);
    assert_eq!(env.vm.paging().phys().read_u64(parent_frame), 0xaa);
}

#[test]
fn shared_mappings_survive_fork() {
    let mut env = Env::new(128);
    env.space()
        .map_anonymous(Region::new(user_va(8), PAGE_SIZE), VmProt::RW, true)
        .unwrap();
    write_user(&mut env, user_va(8), 1);

    let parent = Arc::clone(env.thread.process().unwrap());
    let child = Process::new(parent.space().fork().unwrap());
    env.switch_to(child);
    write_user(&mut env, user_va(8), 2);

    env.switch_to(parent);
    assert_eq!(read_user(&mut env, user_va(8)), 2);
}

#[test]
fn private_object_mapping_copies_on_write() {
    let mut env = Env::new(64);
    let object = VmObject::new(env.vm.paging().phys(), Pager::Anonymous);
    let page = object.pager_fault(PAGE_SIZE).unwrap().unwrap();
    env.vm.paging().phys().write_u64(page.start_address(), 7);

    env.space()
        .map_object(Region::new(user_va(0), PAGE_SIZE), VmProt::RW, object.hold(), PAGE_SIZE, false)
        .unwrap();
    assert_eq!(read_user(&mut env, user_va(0)), 7);
    assert_eq!(frame_of(&env, user_va(0)), page.start_address());

    write_user(&mut env, user_va(0), 8);
    assert_ne!(frame_of(&env, user_va(0)), page.start_address());
    assert_eq!(env.vm.paging().phys().read_u64(page.start_address()), 7);
}

#[test]
fn fault_outside_any_region_signals_once() {
    let mut env = Env::new(64);
    let va = user_va(100).add(0x10);

    let mut stack = abort_frame(va, VmProt::READ, true, AbortKind::Translation);
    handle_user_abort(
        &env.vm,
        &mut env.thread,
        &mut stack,
        ExceptionClass::DABT_LOW,
        va,
        false,
    );
    assert_eq!(stack.ip(), USER_PC);
    assert_eq!(
        env.signals(),
        [SigInfo {
            signo: SIGSEGV,
            code: SEGV_MAPERR,
            addr: va
        }]
    );
}

#[test]
fn protection_violation_is_an_access_error() {
    let mut env = Env::new(64);
    env.space()
        .map_anonymous(Region::new(user_va(0), PAGE_SIZE), VmProt::READ, false)
        .unwrap();
    assert_eq!(read_user(&mut env, user_va(0)), 0);

    let signal = touch(&mut env, user_va(0), VmProt::RW).unwrap_err();
    assert_eq!((signal.signo, signal.code), (SIGSEGV, SEGV_ACCERR));
    let signal = touch(&mut env, user_va(0), VmProt::RX).unwrap_err();
    assert_eq!((signal.signo, signal.code), (SIGSEGV, SEGV_ACCERR));
}

#[test]
fn no_user_space_installed_is_a_map_error() {
    let mut env = Env::new(64);
    env.space()
        .map_anonymous(Region::new(user_va(0), PAGE_SIZE), VmProt::RW, false)
        .unwrap();
    env.vm.activate(None);
    let signal = touch(&mut env, user_va(0), VmProt::READ).unwrap_err();
    assert_eq!((signal.signo, signal.code), (SIGSEGV, SEGV_MAPERR));
}

#[test]
fn onfault_address_recovers_kernel_access() {
    let mut env = Env::new(64);
    let va = user_va(5);
    env.thread.set_onfault(Some(0xffff_ffc0_1000_0200));

    let mut stack = abort_frame(va, VmProt::RW, false, AbortKind::Translation);
    handle_kernel_abort(&env.vm, &mut env.thread, &mut stack, ExceptionClass::DABT_CUR, va);
    assert_eq!(stack.ip(), 0xffff_ffc0_1000_0200);
    assert_eq!(env.thread.onfault(), None);
    assert!(env.signals().is_empty());
}

#[test]
fn kernel_faults_resolve_through_kernel_space() {
    let mut env = Env::new(64);
    let region = Region::new(kernel_va(0), 2 * PAGE_SIZE);
    env.vm.kernel_space().map_anonymous(region, VmProt::RW, false).unwrap();

    let va = kernel_va(1);
    let mut stack = abort_frame(va, VmProt::RW, false, AbortKind::Translation);
    handle_kernel_abort(&env.vm, &mut env.thread, &mut stack, ExceptionClass::DABT_CUR, va);
    assert_eq!(stack.ip(), KERNEL_PC);
    let pte = env.vm.paging().pte(env.vm.paging().kernel_pmap(), va).unwrap();
    assert!(A::pte_is_kernel(pte));
    assert!(A::pte_writable(pte));
}

#[test]
fn kernel_space_teardown_unmaps_before_freeing() {
    let mut env = Env::new(64);
    let phys = Arc::clone(env.vm.paging().phys());
    let va = kernel_va(0);
    env.vm
        .kernel_space()
        .map_anonymous(Region::new(va, PAGE_SIZE), VmProt::RW, false)
        .unwrap();
    let mut stack = abort_frame(va, VmProt::RW, false, AbortKind::Translation);
    handle_kernel_abort(&env.vm, &mut env.thread, &mut stack, ExceptionClass::DABT_CUR, va);
    let page = crate::memory::Frame::containing(frame_of(&env, va));
    assert!(phys.is_allocated(page));

    drop(env);
    assert!(!phys.is_allocated(page));
}

#[test]
#[should_panic(expected = "kernel oops")]
fn unresolvable_kernel_fault_is_an_oops() {
    let mut env = Env::new(64);
    let va = kernel_va(9);
    let mut stack = abort_frame(va, VmProt::READ, false, AbortKind::Translation);
    handle_kernel_abort(&env.vm, &mut env.thread, &mut stack, ExceptionClass::DABT_CUR, va);
}

#[test]
fn other_user_exceptions() {
    fn exception(class: ExceptionClass, env: &mut Env) -> TrapOutcome {
        let mut stack = InterruptStack::user(USER_PC);
        stack.iret.esr_el1 = (class.0 as usize) << 26;
        stack.iret.far_el1 = USER_PC + 1;
        synchronous_exception(&env.vm, &mut env.thread, &mut stack)
    }

    let mut env = Env::new(16);

    assert_eq!(exception(ExceptionClass::SVC, &mut env), TrapOutcome::Syscall);
    assert!(env.signals().is_empty());

    assert_eq!(exception(ExceptionClass::FP, &mut env), TrapOutcome::Resume);
    assert!(env.thread.fpu_used);

    exception(ExceptionClass::PC_ALIGN, &mut env);
    assert_eq!(env.signals()[0].signo, SIGBUS);
    exception(ExceptionClass::UNKNOWN, &mut env);
    assert_eq!(env.signals()[0].signo, SIGILL);
    exception(ExceptionClass::BRK, &mut env);
    let signals = env.signals();
    assert_eq!(signals.len(), 1);
    assert_eq!((signals[0].signo, signals[0].addr), (SIGTRAP, VirtualAddress::new(USER_PC)));
}

#[test]
fn full_signal_queue_still_reports_faults() {
    let mut env = Env::new(16);
    for i in 0..MAX_PENDING {
        ksignal(
            &env.thread,
            SigInfo {
                signo: SIGTRAP,
                code: TRAP_BRKPT,
                addr: VirtualAddress::new(USER_PC + 4 * i),
            },
        );
    }

    let va = user_va(100);
    for _ in 0..2 {
        let mut stack = abort_frame(va, VmProt::READ, true, AbortKind::Translation);
        handle_user_abort(
            &env.vm,
            &mut env.thread,
            &mut stack,
            ExceptionClass::DABT_LOW,
            va,
            false,
        );
    }

    // The oldest breakpoint made room; the second fault found its signal already queued.
    let signals = env.signals();
    assert_eq!(signals.len(), MAX_PENDING);
    assert_eq!(signals[0].addr, VirtualAddress::new(USER_PC + 4));
    let segv: Vec<&SigInfo> = signals.iter().filter(|info| info.signo == SIGSEGV).collect();
    assert_eq!(
        segv,
        [&SigInfo {
            signo: SIGSEGV,
            code: SEGV_MAPERR,
            addr: va
        }]
    );
}

#[test]
fn alignment_abort_raises_bus_error() {
    let mut env = Env::new(16);
    let va = user_va(0).add(3);
    let mut stack = abort_frame(va, VmProt::READ, true, AbortKind::Alignment);
    synchronous_exception(&env.vm, &mut env.thread, &mut stack);
    let signals = env.signals();
    assert_eq!(signals.len(), 1);
    assert_eq!((signals[0].signo, signals[0].addr), (SIGBUS, va));
}

#[test]
fn unmap_splits_regions_and_frees_pages() {
    let mut env = Env::new(64);
    let free = env.vm.paging().phys().free_count();
    env.space()
        .map_anonymous(Region::new(user_va(0), 4 * PAGE_SIZE), VmProt::RW, false)
        .unwrap();
    for page in 0..4 {
        write_user(&mut env, user_va(page), page as u64 + 1);
    }

    env.space().unmap(Region::new(user_va(1), 2 * PAGE_SIZE)).unwrap();
    let regions = env.space().regions();
    assert_eq!(regions.len(), 2);
    assert_eq!(regions[1].region, Region::new(user_va(3), PAGE_SIZE));
    assert_eq!(regions[1].amap_bias, Some(3));

    assert_eq!(read_user(&mut env, user_va(3)), 4);
    assert_eq!(touch(&mut env, user_va(2), VmProt::READ).unwrap_err().code, SEGV_MAPERR);

    env.space().destroy();
    // The pmap root was allocated before `free` was sampled.
    assert_eq!(env.vm.paging().phys().free_count(), free + 1);
}

#[test]
fn overlapping_and_misplaced_regions_are_rejected() {
    let env = Env::new(16);
    let space = env.space();
    space
        .map_anonymous(Region::new(user_va(0), 2 * PAGE_SIZE), VmProt::RW, false)
        .unwrap();
    assert!(space
        .map_anonymous(Region::new(user_va(1), PAGE_SIZE), VmProt::RW, false)
        .is_err());
    assert!(space
        .map_anonymous(Region::new(user_va(4).add(1), PAGE_SIZE), VmProt::RW, false)
        .is_err());
    assert!(space
        .map_anonymous(Region::new(kernel_va(0), PAGE_SIZE), VmProt::RW, false)
        .is_err());
}

#[test]
fn dropping_everything_returns_all_memory() {
    let mut env = Env::new(128);
    let (phys, baseline) = {
        let phys = env.vm.paging().phys();
        (Arc::clone(phys), phys.free_count())
    };
    env.space()
        .map_anonymous(Region::new(user_va(0), 8 * PAGE_SIZE), VmProt::RW, false)
        .unwrap();
    for page in 0..8 {
        write_user(&mut env, user_va(page), 1);
    }
    let child = Process::new(env.space().fork().unwrap());
    env.switch_to(child);
    write_user(&mut env, user_va(2), 2);

    env.vm.activate(None);
    drop(env);
    // Only the first user pmap root predates the baseline.
    assert_eq!(phys.free_count(), baseline + 1);
}

proptest! {
    #[test]
    fn faults_terminate(page in 0usize..12, access in prop_oneof![
        Just(VmProt::READ), Just(VmProt::RW), Just(VmProt::RX)
    ], prot in prop_oneof![Just(VmProt::READ), Just(VmProt::RW), Just(VmProt::RX)]) {
        let mut env = Env::new(64);
        env.space()
            .map_anonymous(Region::new(user_va(0), 8 * PAGE_SIZE), prot, false)
            .unwrap();

        match touch(&mut env, user_va(page), access) {
            Ok(faults) => {
                prop_assert!(page < 8 && prot.contains(access));
                prop_assert!(faults <= 3);
            }
            Err(signal) => {
                prop_assert_eq!(signal.signo, SIGSEGV);
                let expected = if page >= 8 { SEGV_MAPERR } else { SEGV_ACCERR };
                prop_assert_eq!(signal.code, expected);
                prop_assert!(page >= 8 || !prot.contains(access));
            }
        }
        prop_assert!(env.signals().is_empty());
    }
}
