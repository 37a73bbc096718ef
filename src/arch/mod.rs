//! Per-architecture page table formats and trap entry.
//!
//! Both formats are always compiled so either can be tested on the host; [`CurrentArch`] is the
//! one the pmap layer uses.

pub mod aarch64;
pub mod riscv64;

#[cfg(not(target_arch = "riscv64"))]
pub use self::aarch64::AArch64 as CurrentArch;
#[cfg(target_arch = "riscv64")]
pub use self::riscv64::Riscv64 as CurrentArch;
