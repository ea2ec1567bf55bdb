//! Blocking synchronization primitives
//!
//! Both primitives are plain handle-table entries; blocking goes through the
//! scheduler's wait/wake contract.

pub mod condvar;
pub mod mutex;

pub use condvar::Condvars;
pub use mutex::{LockOutcome, MutexState, Mutexes};
