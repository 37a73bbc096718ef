/// MMU registers
pub mod device;

/// Exception dispatch
pub mod interrupt;

/// Paging
pub mod paging;

pub use self::paging::AArch64;
