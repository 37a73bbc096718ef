//! Exception entry, from the saved register frame onwards.

pub mod exception;
pub mod handler;

pub use self::exception::{
    handle_kernel_abort, handle_user_abort, handle_user_exception, synchronous_exception,
    AbortKind, Esr, ExceptionClass, TrapOutcome,
};
pub use self::handler::InterruptStack;
