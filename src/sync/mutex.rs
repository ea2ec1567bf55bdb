//! Kernel Mutexes
//!
//! A mutex is a handle table entry holding its holder and recursion depth.
//! Contended locks suspend the caller on `WaitReason::Mutex`; unlocking hands
//! the mutex directly to the first waiter.

use alloc::sync::Arc;

use crate::errno::{Errno, KResult};
use crate::kern::kalloc::KernelAllocator;
use crate::kern::sched_prim::{Scheduler, WaitReason};
use crate::kern::table::{HandleCounter, HandleTable};
use crate::types::{MutexId, ProcessId};
use crate::{logd, logw};

/// Per-mutex state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutexState {
    /// Current holder, `None` if unheld
    pub holder: Option<ProcessId>,
    /// Recursion depth of the holder
    pub depth: u32,
}

/// Outcome of a lock request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// Caller holds the mutex now
    Acquired,
    /// Caller was suspended; it holds the mutex once resumed
    Waiting,
}

/// Mutex subsystem
#[derive(Debug)]
pub struct Mutexes {
    table: HandleTable<MutexState>,
    handles: HandleCounter,
}

impl Mutexes {
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
        let mut mutexes = Self::new(page_size, allocator)?;
        mutexes.handles = handles;
        Ok(mutexes)
    }

    pub fn create(&mut self) -> KResult<MutexId> {
        let raw = self.handles.allocate().ok_or_else(|| {
            logw!("mutex", "Mutex namespace overflow");
            Errno::NoMem
        })?;
        self.table.set(raw, Some(MutexState::default()))?;

        logd!("mutex", "Created mutex {}", raw);
        Ok(MutexId::from_raw(raw))
    }

    /// Destroy an unheld mutex
    pub fn destroy(&mut self, mutex: MutexId) -> KResult<()> {
        let state = self.table.get(mutex.raw()).ok_or(Errno::Inval)?;
        if state.holder.is_some() {
            return Err(Errno::Busy);
        }
        self.table.take(mutex.raw());
        logd!("mutex", "Destroyed mutex {}", mutex);
        Ok(())
    }

    pub fn state(&self, mutex: MutexId) -> Option<MutexState> {
        self.table.get(mutex.raw()).copied()
    }

    pub fn holder(&self, mutex: MutexId) -> KResult<Option<ProcessId>> {
        Ok(self.table.get(mutex.raw()).ok_or(Errno::Inval)?.holder)
    }

    /// Lock for `holder`. Re-locking by the holder nests; a mutex held by
    /// someone else fails with `EBUSY` for `trylock` and suspends otherwise.
    pub fn lock(
        &mut self,
        mutex: MutexId,
        holder: ProcessId,
        trylock: bool,
        sched: &mut Scheduler,
    ) -> KResult<LockOutcome> {
        let state = self.table.get_mut(mutex.raw()).ok_or(Errno::Inval)?;

        match state.holder {
            None => {
                state.holder = Some(holder);
                state.depth = 1;
                logd!("mutex", "Mutex {} is now held by {}", mutex, holder);
                Ok(LockOutcome::Acquired)
            }
            Some(current) if current == holder => {
                state.depth = state.depth.checked_add(1).ok_or(Errno::Again)?;
                Ok(LockOutcome::Acquired)
            }
            Some(_) if trylock => Err(Errno::Busy),
            Some(_) => {
                sched.wait_for(Some(holder), WaitReason::Mutex(mutex), None)?;
                logd!("mutex", "Process {} waits on mutex {}", holder, mutex);
                Ok(LockOutcome::Waiting)
            }
        }
    }

    /// Unlock by `holder`. `EPERM` for anyone else; unlocking an unheld
    /// mutex is a logged no-op.
    pub fn unlock(
        &mut self,
        mutex: MutexId,
        holder: ProcessId,
        sched: &mut Scheduler,
    ) -> KResult<()> {
        let state = self.table.get_mut(mutex.raw()).ok_or(Errno::Inval)?;

        match state.holder {
            None => {
                logw!("mutex", "Tried to unlock unlocked mutex {}", mutex);
                Ok(())
            }
            Some(current) if current != holder => Err(Errno::Perm),
            Some(_) => {
                state.depth = state.depth.saturating_sub(1);
                if state.depth == 0 {
                    Self::hand_off(state, mutex, sched);
                }
                Ok(())
            }
        }
    }

    /// Pass the mutex to the first waiter, or leave it unheld
    fn hand_off(state: &mut MutexState, mutex: MutexId, sched: &mut Scheduler) {
        match sched.waitable_done(WaitReason::Mutex(mutex), 1).first() {
            Some(next) => {
                state.holder = Some(*next);
                state.depth = 1;
                logd!("mutex", "Mutex {} handed to {}", mutex, next);
            }
            None => {
                state.holder = None;
                state.depth = 0;
                logd!("mutex", "Mutex {} is now free", mutex);
            }
        }
    }

    /// Release every mutex held by `pid` (process teardown). Returns the
    /// number of mutexes released.
    pub fn unlock_holder(&mut self, pid: ProcessId, sched: &mut Scheduler) -> usize {
        let mut released = 0;
        let mut cur = self.table.next(0);

        while let Some(raw) = cur {
            if let Some(state) = self.table.get_mut(raw) {
                if state.holder == Some(pid) {
                    let mutex = MutexId::from_raw(raw);
                    logw!(
                        "mutex",
                        "Mutex {} was held by {} at teardown, releasing",
                        mutex,
                        pid
                    );
                    Self::hand_off(state, mutex, sched);
                    released += 1;
                }
            }
            cur = self.table.next(raw);
        }

        released
    }

    /// Number of live mutexes
    pub fn count(&self) -> usize {
        self.table.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MqId;

    fn setup() -> (Mutexes, Scheduler, ProcessId, ProcessId) {
        let mutexes = Mutexes::new(4096, Arc::new(KernelAllocator::unlimited())).unwrap();
        let mut sched = Scheduler::new();
        let a = sched.spawn(None, MqId::from_raw(1)).unwrap();
        let b = sched.spawn(None, MqId::from_raw(2)).unwrap();
        (mutexes, sched, a, b)
    }

    #[test]
    fn test_lock_unlock() {
        let (mut m, mut s, a, _) = setup();
        let mx = m.create().unwrap();

        assert_eq!(m.lock(mx, a, false, &mut s), Ok(LockOutcome::Acquired));
        assert_eq!(m.holder(mx), Ok(Some(a)));
        assert_eq!(m.destroy(mx), Err(Errno::Busy));

        m.unlock(mx, a, &mut s).unwrap();
        assert_eq!(m.holder(mx), Ok(None));
        assert!(m.destroy(mx).is_ok());
        assert_eq!(m.destroy(mx), Err(Errno::Inval));
    }

    #[test]
    fn test_reentrant() {
        let (mut m, mut s, a, _) = setup();
        let mx = m.create().unwrap();

        m.lock(mx, a, false, &mut s).unwrap();
        m.lock(mx, a, true, &mut s).unwrap();
        m.unlock(mx, a, &mut s).unwrap();
        assert_eq!(m.holder(mx), Ok(Some(a)));
        m.unlock(mx, a, &mut s).unwrap();
        assert_eq!(m.holder(mx), Ok(None));
    }

    #[test]
    fn test_trylock_busy() {
        let (mut m, mut s, a, b) = setup();
        let mx = m.create().unwrap();
        m.lock(mx, a, false, &mut s).unwrap();
        assert_eq!(m.lock(mx, b, true, &mut s), Err(Errno::Busy));
        assert!(!s.is_waiting(b));
    }

    #[test]
    fn test_contended_hand_off() {
        let (mut m, mut s, a, b) = setup();
        let mx = m.create().unwrap();
        m.lock(mx, a, false, &mut s).unwrap();

        assert_eq!(m.lock(mx, b, false, &mut s), Ok(LockOutcome::Waiting));
        assert!(s.is_waiting(b));

        m.unlock(mx, a, &mut s).unwrap();
        assert_eq!(m.holder(mx), Ok(Some(b)));
        assert_eq!(s.pending_wakeups(), 1);
    }

    #[test]
    fn test_unlock_errors() {
        let (mut m, mut s, a, b) = setup();
        let mx = m.create().unwrap();

        // Unheld: no-op success
        assert_eq!(m.unlock(mx, a, &mut s), Ok(()));

        m.lock(mx, a, false, &mut s).unwrap();
        assert_eq!(m.unlock(mx, b, &mut s), Err(Errno::Perm));
        assert_eq!(m.holder(mx), Ok(Some(a)));

        assert_eq!(
            m.unlock(MutexId::from_raw(77), a, &mut s),
            Err(Errno::Inval)
        );
        assert_eq!(
            m.lock(MutexId::from_raw(77), a, false, &mut s),
            Err(Errno::Inval)
        );
    }

    #[test]
    fn test_unlock_holder() {
        let (mut m, mut s, a, b) = setup();
        let m1 = m.create().unwrap();
        let m2 = m.create().unwrap();
        let m3 = m.create().unwrap();
        m.lock(m1, a, false, &mut s).unwrap();
        m.lock(m1, a, false, &mut s).unwrap();
        m.lock(m2, b, false, &mut s).unwrap();
        m.lock(m3, a, false, &mut s).unwrap();
        m.lock(m3, b, false, &mut s).unwrap();

        assert_eq!(m.unlock_holder(a, &mut s), 2);
        assert_eq!(m.holder(m1), Ok(None));
        assert_eq!(m.holder(m2), Ok(Some(b)));
        assert_eq!(m.holder(m3), Ok(Some(b)));
    }

    #[test]
    fn test_namespace_overflow() {
        let mut m = Mutexes::with_counter(
            4096,
            Arc::new(KernelAllocator::unlimited()),
            HandleCounter::starting_at(u64::MAX),
        )
        .unwrap();
        assert!(m.create().is_ok());
        assert_eq!(m.create(), Err(Errno::NoMem));
    }

    #[test]
    fn test_unlock_holder_at_last_handle() {
        let (_, mut s, a, _) = setup();
        let mut m = Mutexes::with_counter(
            4096,
            Arc::new(KernelAllocator::unlimited()),
            HandleCounter::starting_at(u64::MAX),
        )
        .unwrap();
        let mx = m.create().unwrap();
        assert_eq!(mx.raw(), u64::MAX);

        m.lock(mx, a, false, &mut s).unwrap();
        assert_eq!(m.unlock_holder(a, &mut s), 1);
        assert_eq!(m.holder(mx), Ok(None));
    }
}
