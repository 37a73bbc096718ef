//! # Paging
//! 48-bit, 4 KiB granule translation with TTBR0 for user space and TTBR1 for the kernel.

pub mod entry;

pub use self::entry::AArch64;
