//! Priority-inheritance mutexes.
//!
//! Unlike `r3_kernel`'s `mutex.rs`, which implements the *priority ceiling*
//! protocol (a mutex carries a fixed ceiling priority, applied the moment it
//! locks), this implements *dynamic priority inheritance*: a mutex carries no
//! priority of its own, and a blocking locker raises the current owner's
//! priority to its own only at the moment it actually blocks, exactly as
//! `kernel/sync/mutex.c` does it. On the final (recursion-unwound) unlock,
//! the former owner's priority is recomputed from its base priority and
//! whatever it still inherits from mutexes it continues to hold, rather than
//! being dropped straight back to base: the reference source restores
//! straight to base unconditionally, which is only correct because it never
//! lets one task hold more than one contended mutex at a time; this design
//! does not assume that.
use core::num::NonZeroU8;

use bitflags::bitflags;

use crate::{
    config::{MAX_MUTEXES, PRIORITY_INHERITANCE},
    list::TaskIndex,
    sched::Scheduler,
    task::{BlockReason, TaskPool},
    Error, Result,
};

bitflags! {
    /// §3 "Primitive-specific data" mutex "feature flags". Set once at
    /// [`MutexPool::create`] and fixed for the mutex's lifetime.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct MutexFlags: u32 {
        /// Owner may lock the same mutex again without first unlocking it
        /// (§4.6 "if already owned by caller and the recursive flag is set,
        /// increment recursion. Else fail"). Without this flag a
        /// self-relock is treated the same as contention by any other
        /// task: [`Error::Timeout`] on `try_lock`, a block (and, with
        /// priority inheritance on, a no-op priority raise since owner and
        /// blocker are the same task) on `lock`.
        const RECURSIVE = 1 << 0;
    }
}

/// A 1-based index into the static mutex pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexIndex(NonZeroU8);

impl MutexIndex {
    fn new(i: usize) -> Self {
        debug_assert!(i < MAX_MUTEXES);
        Self(NonZeroU8::new(i as u8 + 1).expect("pool index in range"))
    }

    pub fn get(self) -> usize {
        self.0.get() as usize - 1
    }
}

/// One mutex's bookkeeping.
#[derive(Clone, Copy)]
pub struct MutexCb {
    in_use: bool,
    locked: bool,
    owner: Option<TaskIndex>,
    /// Recursive-lock depth; `0` while unlocked, `1` on first lock.
    recursion: u32,
    /// Next mutex in the owning task's held-mutex list (the reference
    /// source's `prev_mutex_held`, threaded the other direction since we
    /// push new locks onto the head).
    held_next: Option<MutexIndex>,
    flags: MutexFlags,
}

impl Default for MutexCb {
    fn default() -> Self {
        Self {
            in_use: false,
            locked: false,
            owner: None,
            recursion: 0,
            held_next: None,
            flags: MutexFlags::empty(),
        }
    }
}

impl MutexCb {
    fn is_free(&self) -> bool {
        !self.in_use
    }
}

/// The static mutex pool, indexed by [`MutexIndex`].
pub struct MutexPool {
    cbs: [MutexCb; MAX_MUTEXES],
}

impl MutexPool {
    pub const fn new() -> Self {
        Self {
            cbs: [MutexCb {
                in_use: false,
                locked: false,
                owner: None,
                recursion: 0,
                held_next: None,
                flags: MutexFlags::empty(),
            }; MAX_MUTEXES],
        }
    }

    pub fn alloc_slot(&mut self) -> Option<MutexIndex> {
        self.cbs.iter().position(MutexCb::is_free).map(MutexIndex::new)
    }

    /// §4.6 `mutex_create`.
    pub fn create(&mut self, flags: MutexFlags) -> Result<MutexIndex> {
        let idx = self.alloc_slot().ok_or(Error::NoMem)?;
        self.cbs[idx.get()] = MutexCb {
            in_use: true,
            flags,
            ..MutexCb::default()
        };
        Ok(idx)
    }

    /// §4.6 `mutex_delete`. Any blocked waiters are woken with
    /// [`Error::Deleted`]; the mutex is abandoned without running inheritance
    /// bookkeeping, since nothing further will ever lock it.
    pub fn delete(&mut self, sched: &mut Scheduler, pool: &mut TaskPool, idx: MutexIndex) {
        sched.unblock_all(pool, BlockReason::Mutex, idx.get(), Err(Error::Deleted));
        if let Some(owner) = self.cbs[idx.get()].owner {
            self.unlink_held(owner, idx, pool);
        }
        self.cbs[idx.get()] = MutexCb::default();
    }

    /// Non-blocking attempt. §4.6 `mutex_try_lock`.
    pub fn try_lock(&mut self, pool: &mut TaskPool, idx: MutexIndex, caller: TaskIndex) -> Result<()> {
        let cb = &mut self.cbs[idx.get()];
        match cb.owner {
            None => {
                cb.locked = true;
                cb.owner = Some(caller);
                cb.recursion = 1;
                cb.held_next = pool.tasks[caller.get()].mutexes_held;
                pool.tasks[caller.get()].mutexes_held = Some(idx);
                Ok(())
            }
            Some(owner) if owner == caller && cb.flags.contains(MutexFlags::RECURSIVE) => {
                cb.recursion += 1;
                Ok(())
            }
            Some(_) => Err(Error::Timeout),
        }
    }

    /// §4.6 `mutex_lock`. Blocks up to `timeout` ticks if already held by
    /// another task, raising that task's priority to the caller's for as
    /// long as the caller remains blocked on it.
    ///
    /// Resolves the open question of whether unlock hands the mutex directly
    /// to the woken waiter: it does not. `unlock` only frees the mutex and
    /// wakes the single highest-priority waiter; that waiter, once
    /// rescheduled, loops back through `try_lock` here exactly as the
    /// reference source's blocking path does, so a higher-priority task that
    /// becomes ready in between can still win the race.
    pub fn lock(
        &mut self,
        sched: &mut Scheduler,
        pool: &mut TaskPool,
        idx: MutexIndex,
        caller: TaskIndex,
        timeout: u32,
    ) -> Result<()> {
        loop {
            match self.try_lock(pool, idx, caller) {
                Ok(()) => return Ok(()),
                Err(Error::Timeout) if timeout != crate::config::TIMEOUT_NONE => {}
                Err(e) => return Err(e),
            }

            if PRIORITY_INHERITANCE {
                if let Some(owner) = self.cbs[idx.get()].owner {
                    let caller_prio = pool.tasks[caller.get()].priority;
                    if caller_prio < pool.tasks[owner.get()].priority {
                        sched.set_priority(pool, owner, caller_prio);
                    }
                }
            }

            sched.block_task(pool, BlockReason::Mutex, idx.get(), timeout);
            let result = pool.tasks[caller.get()].block_result;
            result?;
            // Woken: either the mutex is now free for us to claim, or our
            // wait timed out (handled by the `Err` arm above) or the mutex
            // was deleted out from under us (`Error::Deleted`, returned
            // directly by the `result?` above).
        }
    }

    /// §4.6 `mutex_unlock`.
    pub fn unlock(&mut self, sched: &mut Scheduler, pool: &mut TaskPool, idx: MutexIndex, caller: TaskIndex) -> Result<()> {
        let cb = &mut self.cbs[idx.get()];
        if cb.owner != Some(caller) {
            return Err(Error::State);
        }
        cb.recursion -= 1;
        if cb.recursion > 0 {
            return Ok(());
        }
        cb.locked = false;
        cb.owner = None;

        self.unlink_held(caller, idx, pool);

        if PRIORITY_INHERITANCE {
            let restored = self.effective_priority(sched, pool, caller);
            sched.set_priority(pool, caller, restored);
        }

        sched.unblock_one(pool, BlockReason::Mutex, idx.get(), Ok(()));
        Ok(())
    }

    /// Remove `idx` from `owner`'s held-mutex list.
    fn unlink_held(&mut self, owner: TaskIndex, idx: MutexIndex, pool: &mut TaskPool) {
        let mut cur = pool.tasks[owner.get()].mutexes_held;
        let mut prev: Option<MutexIndex> = None;
        while let Some(m) = cur {
            let next = self.cbs[m.get()].held_next;
            if m == idx {
                match prev {
                    Some(p) => self.cbs[p.get()].held_next = next,
                    None => pool.tasks[owner.get()].mutexes_held = next,
                }
                self.cbs[m.get()].held_next = None;
                return;
            }
            prev = Some(m);
            cur = next;
        }
    }

    /// The priority `task` should run at given its base priority and the
    /// highest-priority task still blocked on any mutex it continues to
    /// hold.
    fn effective_priority(&self, sched: &Scheduler, pool: &TaskPool, task: TaskIndex) -> u8 {
        let mut best = pool.tasks[task.get()].base_priority;
        let mut cur = pool.tasks[task.get()].mutexes_held;
        while let Some(m) = cur {
            if let Some(p) = sched.highest_blocked_priority(pool, BlockReason::Mutex, m.get()) {
                if p < best {
                    best = p;
                }
            }
            cur = self.cbs[m.get()].held_next;
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskAttr, TaskState};

    fn make_task(pool: &mut TaskPool, priority: u8) -> TaskIndex {
        let idx = pool.alloc_slot().unwrap();
        let attr = TaskAttr {
            entry: dummy_entry,
            arg: 0,
            priority,
            stack_size: crate::config::MIN_STACK_SIZE,
        };
        pool.tasks[idx.get()].allocate(&attr, "t", 0);
        idx
    }

    extern "C" fn dummy_entry(_: usize) {}

    #[test]
    fn uncontended_lock_unlock_roundtrips() {
        let mut pool = TaskPool::new();
        let mut sched = Scheduler::new();
        let mut mtx = MutexPool::new();
        let t = make_task(&mut pool, 5);
        sched.set_running(Some(t));

        let m = mtx.create(MutexFlags::RECURSIVE).unwrap();
        assert!(mtx.try_lock(&mut pool, m, t).is_ok());
        assert_eq!(mtx.try_lock(&mut pool, m, t), Ok(()));
        assert_eq!(mtx.cbs[m.get()].recursion, 2);
        assert!(mtx.unlock(&mut sched, &mut pool, m, t).is_ok());
        assert!(mtx.cbs[m.get()].locked);
        assert!(mtx.unlock(&mut sched, &mut pool, m, t).is_ok());
        assert!(!mtx.cbs[m.get()].locked);
    }

    /// `lock()`'s retry loop suspends via a real context switch on hardware;
    /// a unit test cannot drive that, so this exercises the same two steps
    /// (contended attempt raises the owner's priority and blocks; unlock
    /// restores it and wakes the waiter) the way `lock()`/`unlock()` perform
    /// them internally, one call at a time instead of through the loop.
    #[test]
    fn blocking_locker_raises_owner_priority() {
        let mut pool = TaskPool::new();
        let mut sched = Scheduler::new();
        let mut mtx = MutexPool::new();

        let low = make_task(&mut pool, 10);
        let high = make_task(&mut pool, 1);
        sched.add_task(&mut pool, low);
        sched.set_running(Some(low));

        let m = mtx.create(MutexFlags::empty()).unwrap();
        mtx.try_lock(&mut pool, m, low).unwrap();

        sched.set_running(Some(high));
        assert_eq!(mtx.try_lock(&mut pool, m, high), Err(Error::Timeout));
        sched.set_priority(&mut pool, low, pool.tasks[high.get()].priority);
        sched.block_task(&mut pool, BlockReason::Mutex, m.get(), crate::config::TIMEOUT_FOREVER);
        assert_eq!(pool.tasks[low.get()].priority, 1);
        assert_eq!(pool.tasks[high.get()].state, TaskState::Blocked);

        sched.set_running(Some(low));
        mtx.unlock(&mut sched, &mut pool, m, low).unwrap();
        assert_eq!(pool.tasks[low.get()].priority, 10);
        assert_eq!(pool.tasks[high.get()].block_result, Ok(()));
        assert_eq!(pool.tasks[high.get()].state, TaskState::Ready);

        sched.set_running(Some(high));
        assert!(mtx.try_lock(&mut pool, m, high).is_ok());
    }

    #[test]
    fn non_recursive_mutex_rejects_owner_relock() {
        let mut pool = TaskPool::new();
        let mut mtx = MutexPool::new();
        let t = make_task(&mut pool, 5);

        let m = mtx.create(MutexFlags::empty()).unwrap();
        assert!(mtx.try_lock(&mut pool, m, t).is_ok());
        assert_eq!(mtx.try_lock(&mut pool, m, t), Err(Error::Timeout));
        assert_eq!(mtx.cbs[m.get()].recursion, 1);
    }
}
