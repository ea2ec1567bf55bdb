//! kipc - Kernel IPC and synchronization core
//!
//! The kernel-resident substrate processes use to talk to each other and to
//! synchronize:
//!
//! - sparse, paged handle tables naming every kernel object
//! - bounded message queues with two-phase size negotiation
//! - mutexes and condition variables on top of a wait/wake contract
//! - a UUID keyed service registry fanning messages out to service queues
//!
//! The kernel never blocks: a waiting process is suspended and control goes
//! back to the scheduler loop, see [`kern::sched_prim`]. All state of one
//! kernel instance is owned by [`IpcKernel`] and reached through
//! [`IpcKernel::dispatch`].

#![cfg_attr(not(test), no_std)]
// Kernel types are built through their subsystem, not Default
#![allow(clippy::new_without_default)]
#![allow(clippy::len_without_is_empty)]

extern crate alloc;

// Ambient services
pub mod config;
pub mod errno;
pub mod log;
pub mod types;

// Core
pub mod ipc;
pub mod kern;
pub mod kernel;
pub mod sync;
pub mod syscall;

pub use config::IpcConfig;
pub use errno::{Errno, KResult};
pub use ipc::message::{Message, MessageKind, Payload};
pub use kernel::IpcKernel;
pub use syscall::{Syscall, SyscallReturn};
pub use types::{CondvarId, MqId, MutexId, ProcessId, Uuid};
