//! # Context management
//!
//! The parts of a thread of execution the fault path needs: the owning process (address space
//! and pending signals) and the fault recovery address.

use alloc::{sync::Arc, vec::Vec};

use arrayvec::ArrayVec;
use spin::Mutex;

use crate::common::{AtomicPid, Pid};

pub use self::memory::{AddressSpace, Region, RegionInfo, Vm};
pub use self::signal::{ksignal, SigInfo};

/// Address spaces and the regions they map
pub mod memory;

/// Signal raising
pub mod signal;

static NEXT_PID: AtomicPid = AtomicPid::new(Pid::new(1));

#[derive(Debug)]
pub struct Process {
    pid: Pid,
    space: Arc<AddressSpace>,
    pending: Mutex<ArrayVec<SigInfo, { signal::MAX_PENDING }>>,
}

impl Process {
    pub fn new(space: Arc<AddressSpace>) -> Arc<Process> {
        Arc::new(Process {
            pid: NEXT_PID.next(),
            space,
            pending: Mutex::new(ArrayVec::new()),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }
    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    /// Signals raised but not yet delivered, oldest first.
    pub fn pending(&self) -> Vec<SigInfo> {
        self.pending.lock().iter().copied().collect()
    }
    pub fn take_pending(&self) -> Vec<SigInfo> {
        self.pending.lock().drain(..).collect()
    }
}

#[derive(Debug, Default)]
pub struct Thread {
    process: Option<Arc<Process>>,
    /// Where to resume if an access in the current code faults.
    onfault: Option<usize>,
    pub fpu_used: bool,
}

impl Thread {
    /// A kernel-only thread.
    pub fn kernel() -> Self {
        Self::default()
    }
    pub fn user(process: Arc<Process>) -> Self {
        Self {
            process: Some(process),
            ..Self::default()
        }
    }

    pub fn process(&self) -> Option<&Arc<Process>> {
        self.process.as_ref()
    }

    pub fn set_onfault(&mut self, onfault: Option<usize>) {
        self.onfault = onfault;
    }
    pub fn onfault(&self) -> Option<usize> {
        self.onfault
    }
    /// Consumes the recovery address; a second fault in the same section is not recovered.
    pub fn take_onfault(&mut self) -> Option<usize> {
        self.onfault.take()
    }
}
