//! IPC Subsystem
//!
//! - `message`: typed messages and their wire layout
//! - `mqueue`: bounded message queues with size negotiation
//! - `sd`: service discovery registry

pub mod message;
pub mod mqueue;
pub mod sd;

pub use message::{DecodeError, Message, MessageKind, Payload};
pub use mqueue::{MessageQueues, TeardownNotifier};
pub use sd::ServiceRegistry;
