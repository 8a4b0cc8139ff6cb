//! Counting semaphores.
//!
//! §4.5. Unlike the mutex, a semaphore carries no notion of ownership: `give`
//! is valid from any task (and, via [`SemaphorePool::give_isr`], from an
//! ISR), and a waiter that is woken by `give` is handed the logical increment
//! directly rather than retrying a `try_take` loop the way mutex waiters
//! retry `try_lock`. There is therefore no equivalent of the mutex's
//! "contended retry" open question here: `give` either finds a waiter and
//! transfers the unit to it, or there was none and the count itself absorbs
//! the increment.
use core::num::NonZeroU8;

use crate::{
    config::MAX_SEMAPHORES,
    list::TaskIndex,
    sched::Scheduler,
    task::{BlockReason, TaskPool},
    Error, Result,
};

/// A 1-based index into the static semaphore pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreIndex(NonZeroU8);

impl SemaphoreIndex {
    fn new(i: usize) -> Self {
        debug_assert!(i < MAX_SEMAPHORES);
        Self(NonZeroU8::new(i as u8 + 1).expect("pool index in range"))
    }

    pub fn get(self) -> usize {
        self.0.get() as usize - 1
    }
}

/// One semaphore's bookkeeping.
#[derive(Clone, Copy)]
struct SemaphoreCb {
    in_use: bool,
    count: i32,
    /// `None` means unbounded above; `Some(max)` rejects `give()` once
    /// `count == max` and nobody is waiting to receive it.
    max: Option<u32>,
}

impl SemaphoreCb {
    const fn empty() -> Self {
        Self {
            in_use: false,
            count: 0,
            max: None,
        }
    }
}

/// The static semaphore pool, indexed by [`SemaphoreIndex`].
pub struct SemaphorePool {
    cbs: [SemaphoreCb; MAX_SEMAPHORES],
}

impl SemaphorePool {
    pub const fn new() -> Self {
        Self {
            cbs: [SemaphoreCb::empty(); MAX_SEMAPHORES],
        }
    }

    fn alloc_slot(&mut self) -> Option<SemaphoreIndex> {
        self.cbs
            .iter()
            .position(|cb| !cb.in_use)
            .map(SemaphoreIndex::new)
    }

    /// §4.5 creation. `initial` must not exceed `max` when `max` is given.
    pub fn create(&mut self, initial: i32, max: Option<u32>) -> Result<SemaphoreIndex> {
        if let Some(max) = max {
            if initial < 0 || initial as u32 > max {
                return Err(Error::Param);
            }
        }
        let idx = self.alloc_slot().ok_or(Error::NoMem)?;
        self.cbs[idx.get()] = SemaphoreCb {
            in_use: true,
            count: initial,
            max,
        };
        Ok(idx)
    }

    /// Waiters are woken with [`Error::Deleted`]; the slot returns to the
    /// free pool.
    pub fn delete(&mut self, sched: &mut Scheduler, pool: &mut TaskPool, idx: SemaphoreIndex) {
        sched.unblock_all(pool, BlockReason::Semaphore, idx.get(), Err(Error::Deleted));
        self.cbs[idx.get()] = SemaphoreCb::empty();
    }

    /// §4.5 `take`. A zero-count, zero-timeout take returns [`Error::Timeout`]
    /// without descheduling, per §5 "`timeout=0` ... relinquish CPU briefly if
    /// already descheduled" — there is nothing to relinquish here since the
    /// caller never blocks on a non-positive timeout with count already zero.
    pub fn take(
        &mut self,
        sched: &mut Scheduler,
        pool: &mut TaskPool,
        idx: SemaphoreIndex,
        caller: TaskIndex,
        timeout: u32,
    ) -> Result<()> {
        let cb = &mut self.cbs[idx.get()];
        if cb.count > 0 {
            cb.count -= 1;
            return Ok(());
        }
        if timeout == crate::config::TIMEOUT_NONE {
            return Err(Error::Timeout);
        }
        sched.block_task(pool, BlockReason::Semaphore, idx.get(), timeout);
        pool.tasks[caller.get()].block_result
    }

    /// §4.5 `give`. Prefers handing the unit directly to the
    /// highest-priority waiter; only touches `count` when nobody is waiting.
    pub fn give(&mut self, sched: &mut Scheduler, pool: &mut TaskPool, idx: SemaphoreIndex) -> Result<()> {
        if sched.unblock_one(pool, BlockReason::Semaphore, idx.get(), Ok(())) {
            return Ok(());
        }
        let cb = &mut self.cbs[idx.get()];
        if let Some(max) = cb.max {
            if cb.count as u32 >= max {
                return Err(Error::Overflow);
            }
        }
        cb.count += 1;
        Ok(())
    }

    /// ISR form of [`Self::give`]: identical, since `give` never blocks; kept
    /// as a distinct entry point so callers document intent and so a future
    /// port that wants to special-case ISR-originated gives (e.g. batching
    /// the switch trigger) has a seam to do it at.
    pub fn give_isr(&mut self, sched: &mut Scheduler, pool: &mut TaskPool, idx: SemaphoreIndex) -> Result<()> {
        self.give(sched, pool, idx)
    }

    /// §4.5 `reset`: wakes every waiter with [`Error::State`] and assigns a
    /// fresh count.
    pub fn reset(&mut self, sched: &mut Scheduler, pool: &mut TaskPool, idx: SemaphoreIndex, new_count: i32) {
        sched.unblock_all(pool, BlockReason::Semaphore, idx.get(), Err(Error::State));
        self.cbs[idx.get()].count = new_count;
    }

    pub fn count(&self, idx: SemaphoreIndex) -> i32 {
        self.cbs[idx.get()].count
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
    fn take_decrements_and_give_increments_when_unwaited() {
        let mut pool = TaskPool::new();
        let mut sched = Scheduler::new();
        let mut sem = SemaphorePool::new();
        let t = make_task(&mut pool, 5);
        sched.set_running(Some(t));

        let s = sem.create(1, Some(1)).unwrap();
        assert_eq!(sem.take(&mut sched, &mut pool, s, t, 0), Ok(()));
        assert_eq!(sem.count(s), 0);
        assert_eq!(sem.take(&mut sched, &mut pool, s, t, 0), Err(Error::Timeout));

        assert!(sem.give(&mut sched, &mut pool, s).is_ok());
        assert_eq!(sem.count(s), 1);
        assert_eq!(sem.give(&mut sched, &mut pool, s), Err(Error::Overflow));
    }

    #[test]
    fn give_wakes_highest_priority_waiter_directly() {
        let mut pool = TaskPool::new();
        let mut sched = Scheduler::new();
        let mut sem = SemaphorePool::new();

        let low = make_task(&mut pool, 10);
        let high = make_task(&mut pool, 1);
        sched.add_task(&mut pool, low);
        sched.add_task(&mut pool, high);

        let s = sem.create(0, None).unwrap();

        sched.set_running(Some(low));
        sched.block_task(&mut pool, BlockReason::Semaphore, s.get(), crate::config::TIMEOUT_FOREVER);
        sched.set_running(Some(high));
        sched.block_task(&mut pool, BlockReason::Semaphore, s.get(), crate::config::TIMEOUT_FOREVER);

        assert!(sem.give(&mut sched, &mut pool, s).is_ok());
        assert_eq!(pool.tasks[high.get()].state, TaskState::Ready);
        assert_eq!(pool.tasks[high.get()].block_result, Ok(()));
        assert_eq!(pool.tasks[low.get()].state, TaskState::Blocked);
        assert_eq!(sem.count(s), 0);
    }

    #[test]
    fn reset_wakes_waiters_with_state_error() {
        let mut pool = TaskPool::new();
        let mut sched = Scheduler::new();
        let mut sem = SemaphorePool::new();
        let t = make_task(&mut pool, 5);
        sched.add_task(&mut pool, t);

        let s = sem.create(0, None).unwrap();
        sched.set_running(Some(t));
        sched.block_task(&mut pool, BlockReason::Semaphore, s.get(), crate::config::TIMEOUT_FOREVER);

        sem.reset(&mut sched, &mut pool, s, 3);
        assert_eq!(pool.tasks[t.get()].block_result, Err(Error::State));
        assert_eq!(sem.count(s), 3);
    }
}
