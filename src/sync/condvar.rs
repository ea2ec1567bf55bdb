//! Condition Variables
//!
//! Only the number of waiting processes is stored per condition variable.
//! Waiters are suspended on `WaitReason::Condvar`; the count drops once per
//! waiter when it resumes (signal, timeout or teardown), see [`Condvars::on_resume`].

use alloc::sync::Arc;

use crate::errno::{Errno, KResult};
use crate::kern::kalloc::KernelAllocator;
use crate::kern::sched_prim::{Scheduler, WaitReason};
use crate::kern::table::{HandleCounter, HandleTable};
use crate::types::{CondvarId, ProcessId};
use crate::{logd, logw};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CondvarState {
    wait_count: u64,
}

/// Condition variable subsystem
#[derive(Debug)]
pub struct Condvars {
    table: HandleTable<CondvarState>,
    handles: HandleCounter,
}

impl Condvars {
    pub fn new(page_size: usize, allocator: Arc<KernelAllocator>) -> KResult<Self> {
        Ok(Self {
            table: HandleTable::create(page_size, 0, allocator)?,
            handles: HandleCounter::new(),
        })
    }

    pub fn with_counter(
        page_size: usize,
        allocator: Arc<KernelAllocator>,
        handles: HandleCounter,
    ) -> KResult<Self> {
        let mut condvars = Self::new(page_size, allocator)?;
        condvars.handles = handles;
        Ok(condvars)
    }

    pub fn create(&mut self) -> KResult<CondvarId> {
        let raw = self.handles.allocate().ok_or_else(|| {
            logw!("condvar", "CondVar namespace overflow");
            Errno::NoMem
        })?;
        self.table.set(raw, Some(CondvarState::default()))?;

        logd!("condvar", "Created condvar {}", raw);
        Ok(CondvarId::from_raw(raw))
    }

    /// Destroy a condition variable nobody waits on
    pub fn destroy(&mut self, cv: CondvarId) -> KResult<()> {
        let state = self.table.get(cv.raw()).ok_or(Errno::Inval)?;
        if state.wait_count > 0 {
            return Err(Errno::Busy);
        }
        self.table.take(cv.raw());
        logd!("condvar", "Destroyed condvar {}", cv);
        Ok(())
    }

    /// Wake up to `amount` waiters (0 = all). Returns the number woken.
    pub fn signal(
        &mut self,
        cv: CondvarId,
        amount: usize,
        sched: &mut Scheduler,
    ) -> KResult<usize> {
        let state = self.table.get(cv.raw()).ok_or(Errno::Inval)?;
        if state.wait_count == 0 {
            return Ok(0);
        }
        Ok(sched.waitable_done(WaitReason::Condvar(cv), amount).len())
    }

    /// Suspend `waiter` on `cv`. A non-zero `timeout` is a deadline in
    /// scheduler ticks.
    pub fn wait(
        &mut self,
        cv: CondvarId,
        waiter: ProcessId,
        timeout: u64,
        sched: &mut Scheduler,
    ) -> KResult<()> {
        let state = self.table.get_mut(cv.raw()).ok_or(Errno::Inval)?;
        let deadline = (timeout > 0).then_some(timeout);
        sched.wait_for(Some(waiter), WaitReason::Condvar(cv), deadline)?;
        state.wait_count += 1;
        Ok(())
    }

    /// A waiter of `cv` resumed or went away
    pub fn on_resume(&mut self, cv: CondvarId) {
        if let Some(state) = self.table.get_mut(cv.raw()) {
            state.wait_count = state.wait_count.saturating_sub(1);
        }
    }

    pub fn wait_count(&self, cv: CondvarId) -> KResult<u64> {
        Ok(self.table.get(cv.raw()).ok_or(Errno::Inval)?.wait_count)
    }

    /// Number of live condition variables
    pub fn count(&self) -> usize {
        self.table.entry_count()
    }
}
