//! Scheduling Primitives - Wait/Wake coordination
//!
//! The kernel never blocks. A process that has to wait is marked waiting
//! with a reason and control returns to the scheduler loop; a later
//! `waitable_done` posts wake events which the next `schedule` pass consumes.
//!
//! Only the contract is modelled here: a minimal process table, the FIFO of
//! suspended waiters and the FIFO of posted wake events. Scheduling policy is
//! plain round robin.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::ops::Bound;

use crate::errno::{Errno, KResult};
use crate::types::{CondvarId, MqId, MutexId, ProcessId};
use crate::{logd, logw};

// ============================================================================
// Wait Reasons and Results
// ============================================================================

/// What a suspended process is waiting for. Compared for equality only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitReason {
    /// Signal on a condition variable
    Condvar(CondvarId),
    /// Hand-off of a kernel mutex
    Mutex(MutexId),
    /// A message arriving on a queue
    Message(MqId),
    /// Nothing but the deadline
    Sleep,
}

/// How a wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Woken by a matching `waitable_done`
    Normal,
    /// Deadline passed first
    TimedOut,
}

/// A posted wake event, consumed by the next scheduling pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wakeup {
    pub pid: ProcessId,
    pub reason: WaitReason,
    pub result: WaitResult,
}

// ============================================================================
// Processes
// ============================================================================

/// Process state as far as the wait/wake contract is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Runnable,
    Running,
    Waiting,
}

/// Process descriptor
#[derive(Debug, Clone)]
pub struct Process {
    pub pid: ProcessId,
    pub parent: Option<ProcessId>,
    pub state: ProcessState,
    /// Default message queue of this process
    pub mq: MqId,
    /// Reason of the current wait, if any
    pub waiting_for: Option<WaitReason>,
}

/// A suspended process
#[derive(Debug, Clone)]
struct Waiter {
    pid: ProcessId,
    reason: WaitReason,
    /// Absolute tick at which the wait times out
    deadline: Option<u64>,
}

/// Result of one scheduling pass
#[derive(Debug, Default)]
pub struct SchedulePass {
    /// Wake events consumed in this pass, in posting order
    pub resumed: Vec<Wakeup>,
    /// Process chosen to run next
    pub next: Option<ProcessId>,
}

/// What is left over when a process is removed
#[derive(Debug)]
pub struct Removed {
    pub process: Process,
    /// Waits that will never resume: the pending wait and unconsumed wake events
    pub abandoned: Vec<WaitReason>,
}

// ============================================================================
// Scheduler
// ============================================================================

/// Process table plus wait/wake queues
#[derive(Debug)]
pub struct Scheduler {
    processes: BTreeMap<ProcessId, Process>,
    /// Suspended processes in suspension order
    waiters: VecDeque<Waiter>,
    /// Posted but not yet consumed wake events
    wakeups: VecDeque<Wakeup>,
    current: Option<ProcessId>,
    last_scheduled: Option<ProcessId>,
    next_pid: u64,
    /// Tick count
    now: u64,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            processes: BTreeMap::new(),
            waiters: VecDeque::new(),
            wakeups: VecDeque::new(),
            current: None,
            last_scheduled: None,
            next_pid: 1,
            now: 0,
        }
    }

    /// Add a runnable process owning default queue `mq`
    pub fn spawn(&mut self, parent: Option<ProcessId>, mq: MqId) -> KResult<ProcessId> {
        if let Some(parent) = parent {
            if !self.processes.contains_key(&parent) {
                return Err(Errno::Srch);
            }
        }

        let pid = ProcessId(self.next_pid);
        self.next_pid = self.next_pid.checked_add(1).ok_or(Errno::NoMem)?;

        self.processes.insert(
            pid,
            Process {
                pid,
                parent,
                state: ProcessState::Runnable,
                mq,
                waiting_for: None,
            },
        );
        logd!("sched", "Spawned process {} (parent {:?})", pid, parent);
        Ok(pid)
    }

    /// PID the next `spawn` will hand out
    pub fn next_pid(&self) -> ProcessId {
        ProcessId(self.next_pid)
    }

    pub fn process(&self, pid: ProcessId) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn processes(&self) -> impl Iterator<Item = &Process> + '_ {
        self.processes.values()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Currently running process
    pub fn current(&self) -> Option<ProcessId> {
        self.current
    }

    /// Currently running process, `ESRCH` if there is none
    pub fn current_pid(&self) -> KResult<ProcessId> {
        self.current
            .filter(|pid| {
                self.processes
                    .get(pid)
                    .is_some_and(|p| p.state == ProcessState::Running)
            })
            .ok_or(Errno::Srch)
    }

    /// Make `pid` the running process (system-call entry on its behalf).
    /// A suspended process only runs again after its wake event was consumed.
    pub fn set_current(&mut self, pid: ProcessId) -> KResult<()> {
        let process = self.processes.get_mut(&pid).ok_or(Errno::Srch)?;
        if process.state == ProcessState::Waiting {
            return Err(Errno::Again);
        }
        process.state = ProcessState::Running;
        if let Some(prev) = self.current.filter(|p| *p != pid) {
            if let Some(prev) = self.processes.get_mut(&prev) {
                if prev.state == ProcessState::Running {
                    prev.state = ProcessState::Runnable;
                }
            }
        }
        self.current = Some(pid);
        Ok(())
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    // ========================================================================
    // Wait / Wake
    // ========================================================================

    /// Suspend `target` (the current process if `None`) until a matching
    /// `waitable_done`, or until `timeout` ticks passed if given.
    pub fn wait_for(
        &mut self,
        target: Option<ProcessId>,
        reason: WaitReason,
        timeout: Option<u64>,
    ) -> KResult<ProcessId> {
        let pid = match target {
            Some(pid) => pid,
            None => self.current_pid()?,
        };
        let process = self.processes.get_mut(&pid).ok_or(Errno::Srch)?;

        if process.state == ProcessState::Waiting {
            logw!("sched", "Process {} is already waiting for {:?}", pid, process.waiting_for);
            return Err(Errno::Busy);
        }

        process.state = ProcessState::Waiting;
        process.waiting_for = Some(reason);
        if self.current == Some(pid) {
            self.current = None;
        }

        let deadline = timeout.map(|t| self.now.saturating_add(t));
        self.waiters.push_back(Waiter {
            pid,
            reason,
            deadline,
        });

        logd!("sched", "Process {} waits for {:?}", pid, reason);
        Ok(pid)
    }

    /// Wake up to `max` processes waiting for `reason` in suspension order
    /// (`max == 0` wakes all). Returns the woken PIDs.
    pub fn waitable_done(&mut self, reason: WaitReason, max: usize) -> Vec<ProcessId> {
        let mut woken = Vec::new();
        let mut i = 0;

        while i < self.waiters.len() {
            if max != 0 && woken.len() >= max {
                break;
            }
            if self.waiters[i].reason == reason {
                if let Some(waiter) = self.waiters.remove(i) {
                    woken.push(waiter.pid);
                    self.wakeups.push_back(Wakeup {
                        pid: waiter.pid,
                        reason,
                        result: WaitResult::Normal,
                    });
                }
                continue;
            }
            i += 1;
        }

        woken
    }

    /// Advance the clock; waits whose deadline passed are woken with
    /// `TimedOut`. Returns the number of expired waits.
    pub fn advance_clock(&mut self, ticks: u64) -> usize {
        self.now = self.now.saturating_add(ticks);
        let now = self.now;

        let mut expired = 0;
        let mut i = 0;
        while i < self.waiters.len() {
            if self.waiters[i].deadline.is_some_and(|d| d <= now) {
                if let Some(waiter) = self.waiters.remove(i) {
                    self.wakeups.push_back(Wakeup {
                        pid: waiter.pid,
                        reason: waiter.reason,
                        result: WaitResult::TimedOut,
                    });
                    expired += 1;
                }
                continue;
            }
            i += 1;
        }

        expired
    }

    /// Number of processes suspended on `reason`
    pub fn waiter_count(&self, reason: WaitReason) -> usize {
        self.waiters.iter().filter(|w| w.reason == reason).count()
    }

    /// Wake events posted but not yet consumed
    pub fn pending_wakeups(&self) -> usize {
        self.wakeups.len()
    }

    pub fn is_waiting(&self, pid: ProcessId) -> bool {
        self.processes
            .get(&pid)
            .is_some_and(|p| p.state == ProcessState::Waiting)
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// One scheduling pass: consume posted wake events, then pick the next
    /// runnable process round robin.
    pub fn schedule(&mut self) -> SchedulePass {
        let mut pass = SchedulePass::default();

        while let Some(wakeup) = self.wakeups.pop_front() {
            if let Some(process) = self.processes.get_mut(&wakeup.pid) {
                process.state = ProcessState::Runnable;
                process.waiting_for = None;
                pass.resumed.push(wakeup);
            }
        }

        if let Some(cur) = self.current {
            if let Some(process) = self.processes.get_mut(&cur) {
                if process.state == ProcessState::Running {
                    process.state = ProcessState::Runnable;
                }
            }
        }

        let next = match self.last_scheduled {
            Some(last) => self
                .processes
                .range((Bound::Excluded(last), Bound::Unbounded))
                .chain(self.processes.range(..=last))
                .find(|(_, p)| p.state == ProcessState::Runnable)
                .map(|(pid, _)| *pid),
            None => self
                .processes
                .values()
                .find(|p| p.state == ProcessState::Runnable)
                .map(|p| p.pid),
        };

        if let Some(pid) = next {
            if let Some(process) = self.processes.get_mut(&pid) {
                process.state = ProcessState::Running;
            }
            self.last_scheduled = Some(pid);
        }
        self.current = next;
        pass.next = next;
        pass
    }

    /// Remove a process and everything it was waiting for
    pub fn remove(&mut self, pid: ProcessId) -> KResult<Removed> {
        let process = self.processes.remove(&pid).ok_or(Errno::Srch)?;
        let mut abandoned = Vec::new();

        self.waiters.retain(|w| {
            if w.pid == pid {
                abandoned.push(w.reason);
                false
            } else {
                true
            }
        });
        self.wakeups.retain(|w| {
            if w.pid == pid {
                abandoned.push(w.reason);
                false
            } else {
                true
            }
        });

        if self.current == Some(pid) {
            self.current = None;
        }

        logd!("sched", "Removed process {}", pid);
        Ok(Removed { process, abandoned })
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sched_with(n: usize) -> (Scheduler, Vec<ProcessId>) {
        let mut s = Scheduler::new();
        let pids = (0..n)
            .map(|i| s.spawn(None, MqId::from_raw(i as u64 + 1)).unwrap())
            .collect();
        (s, pids)
    }

    #[test]
    fn test_wait_and_wake_fifo() {
        let (mut s, pids) = sched_with(3);
        let cv = WaitReason::Condvar(CondvarId::from_raw(1));

        for pid in &pids {
            s.wait_for(Some(*pid), cv, None).unwrap();
        }
        assert_eq!(s.waiter_count(cv), 3);

        let woken = s.waitable_done(cv, 2);
        assert_eq!(woken, [pids[0], pids[1]]);
        assert_eq!(s.waiter_count(cv), 1);
        assert_eq!(s.pending_wakeups(), 2);

        // Still waiting until the next pass consumes the wake events
        assert!(s.is_waiting(pids[0]));
        let pass = s.schedule();
        assert_eq!(pass.resumed.len(), 2);
        assert_eq!(pass.resumed[0].pid, pids[0]);
        assert!(!s.is_waiting(pids[0]));
        assert!(s.is_waiting(pids[2]));
    }

    #[test]
    fn test_wake_all() {
        let (mut s, pids) = sched_with(4);
        let mq = WaitReason::Message(MqId::from_raw(9));
        for pid in &pids {
            s.wait_for(Some(*pid), mq, None).unwrap();
        }
        assert_eq!(s.waitable_done(mq, 0).len(), 4);
        assert_eq!(s.waiter_count(mq), 0);
    }

    #[test]
    fn test_reason_must_match() {
        let (mut s, pids) = sched_with(2);
        s.wait_for(Some(pids[0]), WaitReason::Mutex(MutexId::from_raw(1)), None)
            .unwrap();
        s.wait_for(Some(pids[1]), WaitReason::Mutex(MutexId::from_raw(2)), None)
            .unwrap();

        let woken = s.waitable_done(WaitReason::Mutex(MutexId::from_raw(2)), 0);
        assert_eq!(woken, [pids[1]]);
    }

    #[test]
    fn test_wait_current() {
        let (mut s, pids) = sched_with(2);
        assert_eq!(
            s.wait_for(None, WaitReason::Sleep, Some(1)),
            Err(Errno::Srch)
        );

        s.set_current(pids[1]).unwrap();
        assert_eq!(s.wait_for(None, WaitReason::Sleep, Some(5)), Ok(pids[1]));
        assert_eq!(
            s.wait_for(Some(pids[1]), WaitReason::Sleep, None),
            Err(Errno::Busy)
        );
    }

    #[test]
    fn test_wait_gives_up_cpu() {
        let (mut s, pids) = sched_with(2);
        let cv = WaitReason::Condvar(CondvarId::from_raw(3));
        s.set_current(pids[0]).unwrap();
        assert_eq!(s.current_pid(), Ok(pids[0]));

        s.wait_for(None, cv, None).unwrap();
        assert_eq!(s.current(), None);
        assert_eq!(s.current_pid(), Err(Errno::Srch));
        assert_eq!(s.set_current(pids[0]), Err(Errno::Again));

        // Woken but not yet resumed: still off the CPU
        s.waitable_done(cv, 1);
        assert_eq!(s.set_current(pids[0]), Err(Errno::Again));

        s.schedule();
        assert_eq!(s.set_current(pids[0]), Ok(()));
        assert_eq!(s.current_pid(), Ok(pids[0]));
    }

    #[test]
    fn test_waiting_other_process_clears_current() {
        let (mut s, pids) = sched_with(2);
        s.set_current(pids[1]).unwrap();
        s.wait_for(Some(pids[0]), WaitReason::Sleep, None).unwrap();
        assert_eq!(s.current(), Some(pids[1]));
        s.wait_for(Some(pids[1]), WaitReason::Sleep, None).unwrap();
        assert_eq!(s.current(), None);
    }

    #[test]
    fn test_timeout() {
        let (mut s, pids) = sched_with(2);
        let cv = WaitReason::Condvar(CondvarId::from_raw(4));
        s.wait_for(Some(pids[0]), cv, Some(10)).unwrap();
        s.wait_for(Some(pids[1]), cv, None).unwrap();

        assert_eq!(s.advance_clock(9), 0);
        assert_eq!(s.advance_clock(1), 1);

        let pass = s.schedule();
        assert_eq!(pass.resumed.len(), 1);
        assert_eq!(pass.resumed[0].pid, pids[0]);
        assert_eq!(pass.resumed[0].result, WaitResult::TimedOut);
        assert_eq!(s.waiter_count(cv), 1);
    }

    #[test]
    fn test_round_robin_skips_waiting() {
        let (mut s, pids) = sched_with(3);
        assert_eq!(s.schedule().next, Some(pids[0]));
        assert_eq!(s.schedule().next, Some(pids[1]));

        s.wait_for(Some(pids[2]), WaitReason::Sleep, None).unwrap();
        assert_eq!(s.schedule().next, Some(pids[0]));
        assert_eq!(s.current(), Some(pids[0]));
    }

    #[test]
    fn test_idle_when_all_wait() {
        let (mut s, pids) = sched_with(1);
        s.wait_for(Some(pids[0]), WaitReason::Sleep, None).unwrap();
        assert_eq!(s.schedule().next, None);
        assert_eq!(s.current(), None);
    }

    #[test]
    fn test_remove_reports_abandoned() {
        let (mut s, pids) = sched_with(2);
        let cv = WaitReason::Condvar(CondvarId::from_raw(1));
        s.wait_for(Some(pids[0]), cv, None).unwrap();
        s.wait_for(Some(pids[1]), cv, None).unwrap();
        s.waitable_done(cv, 1);

        let removed = s.remove(pids[0]).unwrap();
        assert_eq!(removed.abandoned, [cv]);
        let removed = s.remove(pids[1]).unwrap();
        assert_eq!(removed.abandoned, [cv]);
        assert_eq!(s.pending_wakeups(), 0);
        assert!(s.is_empty());
        assert_eq!(s.remove(pids[1]).err(), Some(Errno::Srch));
    }

    #[test]
    fn test_spawn_requires_live_parent() {
        let mut s = Scheduler::new();
        assert_eq!(
            s.spawn(Some(ProcessId(77)), MqId::from_raw(1)),
            Err(Errno::Srch)
        );
        let parent = s.spawn(None, MqId::from_raw(1)).unwrap();
        let child = s.spawn(Some(parent), MqId::from_raw(2)).unwrap();
        assert_eq!(s.process(child).unwrap().parent, Some(parent));
    }
}
