//! POSIX-style error codes returned across the system-call boundary
//!
//! Every fallible kernel operation returns [`KResult`]. The numeric values are
//! part of the user ABI: runtime libraries translate them back into their own
//! conventions.

use thiserror::Error;

/// Kernel error number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u64)]
pub enum Errno {
    /// Caller is not allowed to perform the operation
    #[error("operation not permitted")]
    Perm = 1,
    /// No such object (unknown queue or service)
    #[error("no such entry")]
    NoEnt = 2,
    /// No such process
    #[error("no such process")]
    Srch = 3,
    /// Try again later
    #[error("resource temporarily unavailable")]
    Again = 11,
    /// Allocator, namespace or quota exhausted
    #[error("out of memory")]
    NoMem = 12,
    /// Object is in use
    #[error("resource busy")]
    Busy = 16,
    /// Object already exists
    #[error("already exists")]
    Exist = 17,
    /// Invalid argument or unknown handle
    #[error("invalid argument")]
    Inval = 22,
    /// System call not implemented
    #[error("function not implemented")]
    NoSys = 38,
    /// No message available
    #[error("no message of the desired type")]
    NoMsg = 42,
    /// Receive buffer too small
    #[error("message too long")]
    MsgSize = 90,
    /// Operation not supported
    #[error("operation not supported")]
    NotSup = 95,
}

/// Result type for kernel operations
pub type KResult<T> = Result<T, Errno>;

impl Errno {
    /// Numeric errno value as seen by user space
    pub const fn code(self) -> u64 {
        self as u64
    }

    /// Parse a numeric errno value; 0 and unknown values yield `None`
    pub const fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            1 => Errno::Perm,
            2 => Errno::NoEnt,
            3 => Errno::Srch,
            11 => Errno::Again,
            12 => Errno::NoMem,
            16 => Errno::Busy,
            17 => Errno::Exist,
            22 => Errno::Inval,
            38 => Errno::NoSys,
            42 => Errno::NoMsg,
            90 => Errno::MsgSize,
            95 => Errno::NotSup,
            _ => return None,
        })
    }
}

/// Flatten a kernel result into the (value, error) register pair
pub fn result_code(result: &KResult<u64>) -> (u64, u64) {
    match result {
        Ok(value) => (*value, 0),
        Err(e) => (0, e.code()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posix_numbers() {
        assert_eq!(Errno::Inval.code(), 22);
        assert_eq!(Errno::Busy.code(), 16);
        assert_eq!(Errno::NoMem.code(), 12);
        assert_eq!(Errno::NoEnt.code(), 2);
        assert_eq!(Errno::NoMsg.code(), 42);
        assert_eq!(Errno::MsgSize.code(), 90);
    }

    #[test]
    fn test_from_code() {
        for e in [Errno::Perm, Errno::Again, Errno::Exist, Errno::NotSup] {
            assert_eq!(Errno::from_code(e.code()), Some(e));
        }
        assert_eq!(Errno::from_code(0), None);
        assert_eq!(Errno::from_code(4), None);
    }

    #[test]
    fn test_result_code() {
        assert_eq!(result_code(&Ok(5)), (5, 0));
        assert_eq!(result_code(&Err(Errno::NoMsg)), (0, 42));
    }
}
