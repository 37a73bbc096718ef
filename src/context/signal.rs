//! Synchronous signals raised by traps.
//!
//! Delivery itself happens elsewhere; traps only queue a [`SigInfo`] on the faulting process.

use crate::memory::VirtualAddress;

use super::Thread;

pub const SIGILL: usize = 4;
pub const SIGTRAP: usize = 5;
pub const SIGBUS: usize = 7;
pub const SIGSEGV: usize = 11;

/// No further detail.
pub const SI_KERNEL: i32 = 0x80;

pub const SEGV_MAPERR: i32 = 1;
pub const SEGV_ACCERR: i32 = 2;
pub const BUS_ADRALN: i32 = 1;
pub const ILL_ILLOPC: i32 = 1;
pub const TRAP_BRKPT: i32 = 1;

/// Maximum number of signals queued on a process. See [`ksignal`] for what happens beyond it.
pub const MAX_PENDING: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SigInfo {
    pub signo: usize,
    pub code: i32,
    /// Faulting address, for signals raised by memory accesses.
    pub addr: VirtualAddress,
}

/// Queues `info` on the process `thread` belongs to.
///
/// A trap signal is never lost: the faulting instruction would be retried forever. With the
/// queue full, `info` merges into a pending signal of the same number, or else takes the place
/// of the oldest pending signal.
pub fn ksignal(thread: &Thread, info: SigInfo) {
    let Some(process) = thread.process() else {
        panic!("signal {} raised on a kernel thread", info.signo);
    };

    log::info!(
        "pid {}: signal {} code {} addr {:?}",
        process.pid(),
        info.signo,
        info.code,
        info.addr
    );

    let mut pending = process.pending.lock();
    if !pending.is_full() {
        pending.push(info);
    } else if pending.iter().any(|queued| queued.signo == info.signo) {
        log::warn!("pid {}: signal queue full, {} already pending", process.pid(), info.signo);
    } else {
        let evicted = pending.remove(0);
        log::warn!(
            "pid {}: signal queue full, dropped {} for {}",
            process.pid(),
            evicted.signo,
            info.signo
        );
        pending.push(info);
    }
}
