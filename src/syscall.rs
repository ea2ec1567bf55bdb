//! System Call Switch
//!
//! Decoded system calls and their dispatch onto [`IpcKernel`]. Every call
//! returns a value register plus an errno register (0 on success). Queue
//! arguments of 0 mean "the calling process's default queue".
//!
//! ## Numbering
//!
//! - 0x00-0x0F: process
//! - 0x10-0x1F: locking (mutexes, condition variables)
//! - 0x20-0x2F: IPC (message queues, service discovery)

use crate::errno::{result_code, Errno, KResult};
use crate::ipc::message::Message;
use crate::kernel::IpcKernel;
use crate::logd;
use crate::types::{CondvarId, MqId, MutexId, ProcessId, Uuid};

// ============================================================================
// Call Numbers
// ============================================================================

pub const SYS_EXIT: u64 = 0x00;
pub const SYS_GET_PID: u64 = 0x01;

pub const SYS_MUTEX_CREATE: u64 = 0x10;
pub const SYS_MUTEX_DESTROY: u64 = 0x11;
pub const SYS_MUTEX_LOCK: u64 = 0x12;
pub const SYS_MUTEX_UNLOCK: u64 = 0x13;
pub const SYS_CONDVAR_CREATE: u64 = 0x18;
pub const SYS_CONDVAR_DESTROY: u64 = 0x19;
pub const SYS_CONDVAR_SIGNAL: u64 = 0x1A;
pub const SYS_CONDVAR_WAIT: u64 = 0x1B;

pub const SYS_MQ_CREATE: u64 = 0x20;
pub const SYS_MQ_DESTROY: u64 = 0x21;
pub const SYS_MQ_SEND: u64 = 0x22;
pub const SYS_MQ_PEEK: u64 = 0x23;
pub const SYS_MQ_POLL: u64 = 0x24;
pub const SYS_SERVICE_REGISTER: u64 = 0x28;
pub const SYS_SERVICE_DISCOVER: u64 = 0x29;

// ============================================================================
// Calls
// ============================================================================

/// A system call with its arguments. Buffers are user memory already
/// mapped into the kernel.
#[derive(Debug)]
pub enum Syscall<'a> {
    Exit { code: u64 },
    /// Own pid, or the parent's if `parent`
    GetPid { parent: bool },

    MutexCreate,
    MutexDestroy { mutex: u64 },
    MutexLock { mutex: u64, trylock: bool },
    MutexUnlock { mutex: u64 },

    CondvarCreate,
    CondvarDestroy { condvar: u64 },
    /// `amount` 0 wakes every waiter
    CondvarSignal { condvar: u64, amount: u64 },
    /// `timeout` in scheduler ticks, 0 waits forever
    CondvarWait { condvar: u64, timeout: u64 },

    MqCreate { item_quota: u64, byte_quota: u64 },
    MqDestroy { mq: u64 },
    /// With `mq` 0 the message goes to the default queue of `pid`, or of the
    /// caller if `pid` is invalid
    MqSend { mq: u64, pid: u64, msg: &'a [u8] },
    MqPeek { mq: u64, buf: &'a mut [u8] },
    MqPoll { mq: u64, wait: bool, buf: &'a mut [u8] },

    ServiceRegister { uuid: Uuid, mq: u64 },
    ServiceDiscover { uuid: Uuid, mq: u64, msg: &'a [u8] },
}

impl Syscall<'_> {
    pub const fn number(&self) -> u64 {
        match self {
            Syscall::Exit { .. } => SYS_EXIT,
            Syscall::GetPid { .. } => SYS_GET_PID,
            Syscall::MutexCreate => SYS_MUTEX_CREATE,
            Syscall::MutexDestroy { .. } => SYS_MUTEX_DESTROY,
            Syscall::MutexLock { .. } => SYS_MUTEX_LOCK,
            Syscall::MutexUnlock { .. } => SYS_MUTEX_UNLOCK,
            Syscall::CondvarCreate => SYS_CONDVAR_CREATE,
            Syscall::CondvarDestroy { .. } => SYS_CONDVAR_DESTROY,
            Syscall::CondvarSignal { .. } => SYS_CONDVAR_SIGNAL,
            Syscall::CondvarWait { .. } => SYS_CONDVAR_WAIT,
            Syscall::MqCreate { .. } => SYS_MQ_CREATE,
            Syscall::MqDestroy { .. } => SYS_MQ_DESTROY,
            Syscall::MqSend { .. } => SYS_MQ_SEND,
            Syscall::MqPeek { .. } => SYS_MQ_PEEK,
            Syscall::MqPoll { .. } => SYS_MQ_POLL,
            Syscall::ServiceRegister { .. } => SYS_SERVICE_REGISTER,
            Syscall::ServiceDiscover { .. } => SYS_SERVICE_DISCOVER,
        }
    }

    /// Name for diagnostics
    pub const fn name(&self) -> &'static str {
        match self {
            Syscall::Exit { .. } => "exit",
            Syscall::GetPid { .. } => "get_pid",
            Syscall::MutexCreate => "mutex_create",
            Syscall::MutexDestroy { .. } => "mutex_destroy",
            Syscall::MutexLock { .. } => "mutex_lock",
            Syscall::MutexUnlock { .. } => "mutex_unlock",
            Syscall::CondvarCreate => "condvar_create",
            Syscall::CondvarDestroy { .. } => "condvar_destroy",
            Syscall::CondvarSignal { .. } => "condvar_signal",
            Syscall::CondvarWait { .. } => "condvar_wait",
            Syscall::MqCreate { .. } => "mq_create",
            Syscall::MqDestroy { .. } => "mq_destroy",
            Syscall::MqSend { .. } => "mq_send",
            Syscall::MqPeek { .. } => "mq_peek",
            Syscall::MqPoll { .. } => "mq_poll",
            Syscall::ServiceRegister { .. } => "service_register",
            Syscall::ServiceDiscover { .. } => "service_discover",
        }
    }
}

// ============================================================================
// Return Registers
// ============================================================================

/// Value and errno registers handed back to user space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallReturn {
    pub value: u64,
    pub error: u64,
}

impl SyscallReturn {
    pub const fn ok(value: u64) -> Self {
        Self { value, error: 0 }
    }

    pub const fn err(errno: Errno) -> Self {
        Self {
            value: 0,
            error: errno.code(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error == 0
    }

    pub fn errno(&self) -> Option<Errno> {
        Errno::from_code(self.error)
    }
}

impl From<KResult<u64>> for SyscallReturn {
    fn from(result: KResult<u64>) -> Self {
        let (value, error) = result_code(&result);
        Self { value, error }
    }
}

fn clamp(v: u64) -> usize {
    usize::try_from(v).unwrap_or(usize::MAX)
}

fn pid_arg(pid: u64) -> Option<ProcessId> {
    Some(ProcessId(pid)).filter(ProcessId::is_valid)
}

// ============================================================================
// Dispatch
// ============================================================================

impl IpcKernel {
    /// Execute `call` on behalf of the running process. A suspended caller
    /// is off the CPU and gets `ESRCH`.
    pub fn dispatch(&mut self, call: Syscall<'_>) -> SyscallReturn {
        let result = match self.scheduler().current_pid() {
            Ok(caller) => {
                logd!("syscall", "{} ({:#x}) from {}", call.name(), call.number(), caller);
                self.handle(caller, call)
            }
            Err(e) => Err(e),
        };
        SyscallReturn::from(result)
    }

    fn handle(&mut self, caller: ProcessId, call: Syscall<'_>) -> KResult<u64> {
        match call {
            Syscall::Exit { code } => self.exit(caller, code).map(|_| 0),
            Syscall::GetPid { parent: false } => Ok(caller.0),
            Syscall::GetPid { parent: true } => Ok(self
                .scheduler()
                .process(caller)
                .and_then(|p| p.parent)
                .unwrap_or(ProcessId::INVALID)
                .0),

            Syscall::MutexCreate => self.mutex_create().map(|m| m.raw()),
            Syscall::MutexDestroy { mutex } => {
                self.mutex_destroy(MutexId::from_raw(mutex)).map(|_| 0)
            }
            Syscall::MutexLock { mutex, trylock } => self
                .mutex_lock(caller, MutexId::from_raw(mutex), trylock)
                .map(|_| 0),
            Syscall::MutexUnlock { mutex } => {
                self.mutex_unlock(caller, MutexId::from_raw(mutex)).map(|_| 0)
            }

            Syscall::CondvarCreate => self.condvar_create().map(|c| c.raw()),
            Syscall::CondvarDestroy { condvar } => {
                self.condvar_destroy(CondvarId::from_raw(condvar)).map(|_| 0)
            }
            Syscall::CondvarSignal { condvar, amount } => self
                .condvar_signal(CondvarId::from_raw(condvar), clamp(amount))
                .map(|n| n as u64),
            Syscall::CondvarWait { condvar, timeout } => self
                .condvar_wait(caller, CondvarId::from_raw(condvar), timeout)
                .map(|_| 0),

            Syscall::MqCreate {
                item_quota,
                byte_quota,
            } => self
                .mq_create(Some(caller), clamp(item_quota), clamp(byte_quota))
                .map(|mq| mq.raw()),
            Syscall::MqDestroy { mq } => {
                let mq = MqId::non_null(mq).map_or_else(|| self.default_queue(caller), Ok)?;
                self.mq_destroy(caller, mq).map(|_| 0)
            }
            Syscall::MqSend { mq, pid, msg } => {
                let msg = Message::decode(msg)?;
                self.mq_send(caller, MqId::non_null(mq), pid_arg(pid), msg)
                    .map(|_| 0)
            }
            Syscall::MqPeek { mq, buf } => self
                .mq_peek(caller, MqId::non_null(mq), buf)
                .map(|n| n as u64),
            Syscall::MqPoll { mq, wait, buf } => self
                .mq_poll(caller, MqId::non_null(mq), wait, buf)
                .map(|n| n as u64),

            Syscall::ServiceRegister { uuid, mq } => self
                .service_register(caller, uuid, MqId::non_null(mq))
                .map(|_| 0),
            Syscall::ServiceDiscover { uuid, mq, msg } => {
                let msg = Message::decode(msg)?;
                self.service_discover(caller, uuid, MqId::non_null(mq), msg)
                    .map(|n| n as u64)
            }
        }
    }
}
