/// Sv39 paging
pub mod paging;

pub use self::paging::Riscv64;
