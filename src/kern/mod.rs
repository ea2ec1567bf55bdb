//! Kernel core services
//!
//! Allocation accounting, handle tables and the wait/wake coordinator used
//! by the IPC and synchronization subsystems.

pub mod kalloc;
pub mod sched_prim;
pub mod table;
