//! Common types used across kipc
//!
//! This module defines the identifiers shared by every subsystem so that
//! tables, queues and the scheduler never exchange raw integers.

use core::fmt;

pub use uuid::Uuid;

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProcessId(pub u64);

impl ProcessId {
    /// Wire value meaning "no process" (the kernel itself, or "current" in calls)
    pub const INVALID: Self = Self(u64::MAX);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("kernel")
        }
    }
}

/// Declare an opaque kernel object handle.
///
/// Handles are plain table indices; 0 is reserved as the null handle.
macro_rules! kernel_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(u64);

        impl $name {
            pub const NULL: Self = Self(0);

            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn raw(&self) -> u64 {
                self.0
            }

            pub const fn is_null(&self) -> bool {
                self.0 == 0
            }

            /// Map the wire convention "0 means default" onto `None`
            pub const fn non_null(raw: u64) -> Option<Self> {
                if raw == 0 {
                    None
                } else {
                    Some(Self(raw))
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

kernel_handle!(
    /// Message queue handle
    MqId
);
kernel_handle!(
    /// Kernel mutex handle
    MutexId
);
kernel_handle!(
    /// Condition variable handle
    CondvarId
);

/// One-byte bucket key of a service identifier. Not unique.
pub type UuidKey = u8;

/// Fold a UUID into its shortcut key (XOR of all bytes)
pub fn uuid_key(uuid: &Uuid) -> UuidKey {
    uuid.as_bytes().iter().fold(0, |key, b| key ^ b)
}
