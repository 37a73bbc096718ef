pub mod entry;

pub use self::entry::Riscv64;
