//! # vmcore
//!
//! The virtual memory core of a small Unix-like kernel: page-backed objects, anonymous memory
//! maps, the per-architecture page table layer and the page fault protocol joining them.
//!
//! The crate is `no_std`; hardware access is confined to `arch` and compiled only for bare
//! metal targets, everything else runs (and is tested) on the host.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate bitfield;

#[macro_use]
/// Shared data structures
pub mod common;

/// Architecture-dependent stuff
pub mod arch;

/// Processes, threads and address spaces
pub mod context;

/// Kernel log
pub mod log;

/// Memory management
pub mod memory;

/// Page tables and reverse mappings
pub mod paging;

/// Cross-module scenarios
#[cfg(test)]
mod tests;
