//! IPC Kernel - Subsystem context
//!
//! Owns every table of one kernel instance and is passed by reference into
//! each system-call handler. Handlers take the calling process explicitly;
//! [`IpcKernel::dispatch`](crate::syscall) resolves it from the scheduler.

use alloc::sync::Arc;

use crate::config::IpcConfig;
use crate::errno::{Errno, KResult};
use crate::ipc::message::{Message, Payload, SIGCHLD};
use crate::ipc::mqueue::MessageQueues;
use crate::ipc::sd::ServiceRegistry;
use crate::kern::kalloc::KernelAllocator;
use crate::kern::sched_prim::{SchedulePass, Scheduler, WaitReason};
use crate::sync::condvar::Condvars;
use crate::sync::mutex::{LockOutcome, Mutexes};
use crate::types::{CondvarId, MqId, MutexId, ProcessId, Uuid};
use crate::{log, logd, logi, logw};

/// Kernel IPC and synchronization state
#[derive(Debug)]
pub struct IpcKernel {
    config: IpcConfig,
    allocator: Arc<KernelAllocator>,
    scheduler: Scheduler,
    queues: MessageQueues,
    mutexes: Mutexes,
    condvars: Condvars,
    services: ServiceRegistry,
}

impl IpcKernel {
    /// Initialize all subsystems
    pub fn new(config: IpcConfig) -> KResult<Self> {
        log::set_level(config.log_level);

        let allocator = Arc::new(match config.allocator_limit {
            Some(limit) => KernelAllocator::with_limit(limit),
            None => KernelAllocator::unlimited(),
        });
        let page = config.table_page_size;

        let kernel = Self {
            queues: MessageQueues::new(page, Arc::clone(&allocator))?,
            mutexes: Mutexes::new(page, Arc::clone(&allocator))?,
            condvars: Condvars::new(page, Arc::clone(&allocator))?,
            scheduler: Scheduler::new(),
            services: ServiceRegistry::new(),
            allocator,
            config,
        };

        logi!("kernel", "IPC initialized, page size {}", page);
        Ok(kernel)
    }

    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<KernelAllocator> {
        &self.allocator
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn queues(&self) -> &MessageQueues {
        &self.queues
    }

    pub fn mutexes(&self) -> &Mutexes {
        &self.mutexes
    }

    pub fn condvars(&self) -> &Condvars {
        &self.condvars
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    // ========================================================================
    // Process lifecycle
    // ========================================================================

    /// Create a process together with its default message queue
    pub fn spawn(&mut self, parent: Option<ProcessId>) -> KResult<ProcessId> {
        let pid = self.scheduler.next_pid();
        let mq = self.queues.create(
            self.config.default_item_quota,
            self.config.default_byte_quota,
            Some(pid),
        )?;

        match self.scheduler.spawn(parent, mq) {
            Ok(pid) => Ok(pid),
            Err(e) => {
                self.queues.destroy(mq)?;
                Err(e)
            }
        }
    }

    /// Tear down a process: release its mutexes, drop its waits, notify
    /// the parent and destroy every queue it owns
    pub fn exit(&mut self, pid: ProcessId, code: u64) -> KResult<()> {
        let removed = self.scheduler.remove(pid)?;

        for reason in &removed.abandoned {
            if let WaitReason::Condvar(cv) = reason {
                self.condvars.on_resume(*cv);
            }
        }

        self.mutexes.unlock_holder(pid, &mut self.scheduler);

        if let Some(parent) = removed.process.parent {
            if let Some(parent_mq) = self.scheduler.process(parent).map(|p| p.mq) {
                let msg = Message::signal(SIGCHLD).with_sender(pid);
                match self.queues.push(parent_mq, msg) {
                    Ok(()) => {
                        self.scheduler.waitable_done(WaitReason::Message(parent_mq), 1);
                    }
                    Err(e) => {
                        logw!("kernel", "Could not notify parent {} of {}: {}", parent, pid, e)
                    }
                }
            }
        }

        for mq in self.queues.owned_by(pid) {
            self.destroy_queue(mq)?;
        }

        logi!("kernel", "Process {} exited with code {}", pid, code);
        Ok(())
    }

    /// Run one scheduling pass and the resume hooks of the woken waiters
    pub fn schedule(&mut self) -> SchedulePass {
        let pass = self.scheduler.schedule();
        for wakeup in &pass.resumed {
            if let WaitReason::Condvar(cv) = wakeup.reason {
                self.condvars.on_resume(cv);
            }
        }
        pass
    }

    /// Advance the scheduler clock, expiring timed waits
    pub fn advance_clock(&mut self, ticks: u64) -> usize {
        self.scheduler.advance_clock(ticks)
    }

    /// Default queue of `pid`
    pub fn default_queue(&self, pid: ProcessId) -> KResult<MqId> {
        Ok(self.scheduler.process(pid).ok_or(Errno::Srch)?.mq)
    }

    fn resolve_queue(&self, caller: ProcessId, mq: Option<MqId>) -> KResult<MqId> {
        match mq {
            Some(mq) => Ok(mq),
            None => self.default_queue(caller),
        }
    }

    // ========================================================================
    // Mutexes
    // ========================================================================

    pub fn mutex_create(&mut self) -> KResult<MutexId> {
        self.mutexes.create()
    }

    pub fn mutex_destroy(&mut self, mutex: MutexId) -> KResult<()> {
        self.mutexes.destroy(mutex)
    }

    pub fn mutex_lock(
        &mut self,
        caller: ProcessId,
        mutex: MutexId,
        trylock: bool,
    ) -> KResult<LockOutcome> {
        self.mutexes.lock(mutex, caller, trylock, &mut self.scheduler)
    }

    pub fn mutex_unlock(&mut self, caller: ProcessId, mutex: MutexId) -> KResult<()> {
        self.mutexes.unlock(mutex, caller, &mut self.scheduler)
    }

    // ========================================================================
    // Condition variables
    // ========================================================================

    pub fn condvar_create(&mut self) -> KResult<CondvarId> {
        self.condvars.create()
    }

    pub fn condvar_destroy(&mut self, cv: CondvarId) -> KResult<()> {
        self.condvars.destroy(cv)
    }

    pub fn condvar_signal(&mut self, cv: CondvarId, amount: usize) -> KResult<usize> {
        self.condvars.signal(cv, amount, &mut self.scheduler)
    }

    pub fn condvar_wait(&mut self, caller: ProcessId, cv: CondvarId, timeout: u64) -> KResult<()> {
        self.condvars.wait(cv, caller, timeout, &mut self.scheduler)
    }

    // ========================================================================
    // Message queues
    // ========================================================================

    /// Create a queue owned by `owner` (`None` for kernel queues)
    pub fn mq_create(
        &mut self,
        owner: Option<ProcessId>,
        item_quota: usize,
        byte_quota: usize,
    ) -> KResult<MqId> {
        self.queues.create(item_quota, byte_quota, owner)
    }

    /// Destroy a queue on behalf of `caller`; only the owner may do so
    pub fn mq_destroy(&mut self, caller: ProcessId, mq: MqId) -> KResult<()> {
        if self.queues.owner(mq)? != Some(caller) {
            return Err(Errno::Perm);
        }
        self.destroy_queue(mq)
    }

    fn destroy_queue(&mut self, mq: MqId) -> KResult<()> {
        self.queues.destroy(mq)?;
        self.services.unregister_queue(mq);
        let woken = self.scheduler.waitable_done(WaitReason::Message(mq), 0);
        if !woken.is_empty() {
            logd!("kernel", "Queue {} destroyed under {} waiters", mq, woken.len());
        }
        Ok(())
    }

    /// Push `msg` from `sender`. Without a queue the message goes to the
    /// default queue of `pid`, or of the sender itself.
    pub fn mq_send(
        &mut self,
        sender: ProcessId,
        mq: Option<MqId>,
        pid: Option<ProcessId>,
        msg: Message,
    ) -> KResult<()> {
        let target = match (mq, pid) {
            (Some(mq), _) => mq,
            (None, Some(pid)) => self.default_queue(pid)?,
            (None, None) => self.default_queue(sender)?,
        };

        self.queues.push(target, msg.with_sender(sender))?;
        self.scheduler.waitable_done(WaitReason::Message(target), 1);
        Ok(())
    }

    /// Copy the head message into `buf` without removing it
    pub fn mq_peek(
        &self,
        caller: ProcessId,
        mq: Option<MqId>,
        buf: &mut [u8],
    ) -> KResult<usize> {
        let mq = self.resolve_queue(caller, mq)?;
        self.queues.peek_into(mq, buf)
    }

    /// Receive the head message into `buf`. On an empty queue with `wait`
    /// the caller is suspended until a message arrives and `EAGAIN` is
    /// returned; it polls again once resumed.
    pub fn mq_poll(
        &mut self,
        caller: ProcessId,
        mq: Option<MqId>,
        wait: bool,
        buf: &mut [u8],
    ) -> KResult<usize> {
        let mq = self.resolve_queue(caller, mq)?;
        match self.queues.pop_into(mq, buf) {
            Err(Errno::NoMsg) if wait => {
                self.scheduler
                    .wait_for(Some(caller), WaitReason::Message(mq), None)?;
                Err(Errno::Again)
            }
            result => result,
        }
    }

    // ========================================================================
    // Service discovery
    // ========================================================================

    pub fn service_register(
        &mut self,
        caller: ProcessId,
        uuid: Uuid,
        mq: Option<MqId>,
    ) -> KResult<()> {
        let mq = self.resolve_queue(caller, mq)?;
        if !self.queues.contains(mq) {
            return Err(Errno::NoEnt);
        }
        self.services.register(uuid, mq)
    }

    /// Send a service discovery request to every queue registered for
    /// `uuid`. The kernel fills in sender, reply queue and service id.
    /// Returns the number of queues reached.
    pub fn service_discover(
        &mut self,
        caller: ProcessId,
        uuid: Uuid,
        mq: Option<MqId>,
        mut msg: Message,
    ) -> KResult<usize> {
        let reply = self.resolve_queue(caller, mq)?;

        let Payload::ServiceDiscovery { response, .. } = msg.payload else {
            return Err(Errno::Inval);
        };
        msg.payload = Payload::ServiceDiscovery {
            service: uuid,
            response,
            mq: reply,
        };
        msg.sender = caller;

        let Self {
            services,
            queues,
            scheduler,
            ..
        } = self;
        services.send_with(&uuid, |target| {
            queues.push(target, msg.clone())?;
            scheduler.waitable_done(WaitReason::Message(target), 1);
            Ok(())
        })
    }
}
