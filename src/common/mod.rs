#[macro_use]
pub mod int_like;

int_like!(ObjectId, AtomicObjectId, usize, AtomicUsize);
int_like!(PmapId, AtomicPmapId, usize, AtomicUsize);
int_like!(Asid, u16);
int_like!(Pid, AtomicPid, usize, AtomicUsize);
