//! The scheduler: ready/blocked bookkeeping, priority selection, tick
//! processing, and preemption triggering.
//!
//! This module owns no locking of its own; every entry point assumes the
//! caller already holds a [`CriticalGuard`](crate::critical::CriticalGuard)
//! and passes it the task pool and a mutable borrow of `self`.
use crate::{
    config::{MAX_PRIORITY, ROUND_ROBIN, TIME_SLICE_TICKS},
    list::{List, TaskIndex},
    task::{BlockReason, TaskPool, TaskState},
    Error,
};

/// Scheduler-wide control state: the live half of the reference source's
/// `scheduler_t`.
pub struct Scheduler {
    bitmap: crate::utils::prio_bitmap::PrioBitmap,
    ready: [List; MAX_PRIORITY],
    blocked: List,
    running: Option<TaskIndex>,
    lock_count: u32,
    reschedule_pending: bool,
    pending_switch: bool,
    tick: u32,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            bitmap: crate::utils::prio_bitmap::PrioBitmap::new(),
            ready: [List::new(); MAX_PRIORITY],
            blocked: List::new(),
            running: None,
            lock_count: 0,
            reschedule_pending: false,
            pending_switch: false,
            tick: 0,
        }
    }

    pub fn running(&self) -> Option<TaskIndex> {
        self.running
    }

    pub fn tick_count(&self) -> u32 {
        self.tick
    }

    pub fn set_running(&mut self, idx: Option<TaskIndex>) {
        self.running = idx;
    }

    /// The highest-priority ready task, or `None` if none is ready (the
    /// idle task, which is always ready at `MAX_PRIORITY - 1`, makes this
    /// only possible before the idle task has been created).
    pub fn highest_ready(&self) -> Option<TaskIndex> {
        let p = self.bitmap.find_highest();
        if p == MAX_PRIORITY {
            None
        } else {
            self.ready[p].front()
        }
    }

    fn ready_insert(&mut self, pool: &mut TaskPool, idx: TaskIndex) {
        let p = pool.tasks[idx.get()].priority as usize;
        self.ready[p].push_back(&mut pool.tasks, idx);
        self.bitmap.set(p);
    }

    fn ready_remove(&mut self, pool: &mut TaskPool, idx: TaskIndex) {
        let p = pool.tasks[idx.get()].priority as usize;
        self.ready[p].remove(&mut pool.tasks, idx);
        if self.ready[p].is_empty() {
            self.bitmap.clear(p);
        }
    }

    /// §4.3 `add_task`.
    pub fn add_task(&mut self, pool: &mut TaskPool, idx: TaskIndex) {
        {
            let t = &mut pool.tasks[idx.get()];
            t.state = TaskState::Ready;
            t.time_slice = TIME_SLICE_TICKS;
        }
        self.ready_insert(pool, idx);

        if let Some(running) = self.running {
            if pool.tasks[idx.get()].priority < pool.tasks[running.get()].priority {
                self.trigger_or_defer();
            }
        }
    }

    /// §4.3 `remove_task`. Caller owns the state transition.
    pub fn remove_task(&mut self, pool: &mut TaskPool, idx: TaskIndex) {
        match pool.tasks[idx.get()].state {
            TaskState::Blocked => self.blocked.remove(&mut pool.tasks, idx),
            TaskState::Ready | TaskState::Running => self.ready_remove(pool, idx),
            _ => {}
        }
    }

    /// §4.3 `set_priority`.
    pub fn set_priority(&mut self, pool: &mut TaskPool, idx: TaskIndex, new_priority: u8) {
        let state = pool.tasks[idx.get()].state;
        match state {
            TaskState::Ready => {
                self.ready_remove(pool, idx);
                pool.tasks[idx.get()].priority = new_priority;
                self.ready_insert(pool, idx);
                self.preempt_if_higher_than_running(pool, idx);
            }
            TaskState::Running => {
                pool.tasks[idx.get()].priority = new_priority;
                // A running task lowering its own priority may make a
                // ready peer eligible to preempt it.
                self.check_preempt_running(pool);
            }
            _ => {
                pool.tasks[idx.get()].priority = new_priority;
            }
        }
    }

    fn preempt_if_higher_than_running(&mut self, pool: &TaskPool, idx: TaskIndex) {
        if let Some(running) = self.running {
            if pool.tasks[idx.get()].priority < pool.tasks[running.get()].priority {
                self.trigger_or_defer();
            }
        }
    }

    fn check_preempt_running(&mut self, pool: &TaskPool) {
        if let Some(running) = self.running {
            let p = self.bitmap.find_highest();
            if p < MAX_PRIORITY && p < pool.tasks[running.get()].priority as usize {
                self.trigger_or_defer();
            }
        }
    }

    /// §4.3 `yield`.
    pub fn yield_now(&mut self, pool: &mut TaskPool) {
        if self.lock_count > 0 {
            self.reschedule_pending = true;
            return;
        }
        if let Some(running) = self.running {
            let p = pool.tasks[running.get()].priority as usize;
            self.ready[p].rotate_front_to_back(&mut pool.tasks);
        }
        self.trigger_or_defer();
    }

    /// §4.3 `tick`. Returns the set of tasks that should be woken with
    /// `Err(Error::Timeout)` versus `Ok(())`, already applied to their TCBs;
    /// the caller (software-timer processing happens separately in
    /// `timer::tick`) need not do anything further for timeout delivery.
    pub fn tick(&mut self, pool: &mut TaskPool) {
        self.tick = self.tick.wrapping_add(1);

        let mut to_wake = arrayvec::ArrayVec::<TaskIndex, { crate::config::MAX_TASKS }>::new();
        for idx in self.blocked.iter(&pool.tasks) {
            let t = &pool.tasks[idx.get()];
            if t.wake_tick != u32::MAX && self.tick >= t.wake_tick {
                let _ = to_wake.try_push(idx);
            }
        }
        for idx in to_wake {
            let result = if pool.tasks[idx.get()].block_reason == BlockReason::Delay {
                Ok(())
            } else {
                Err(Error::Timeout)
            };
            self.unblock_task(pool, idx, result);
        }

        if let Some(running) = self.running {
            let t = &mut pool.tasks[running.get()];
            if TIME_SLICE_TICKS > 0 {
                t.time_slice = t.time_slice.saturating_sub(1);
                if ROUND_ROBIN && t.time_slice == 0 {
                    t.time_slice = TIME_SLICE_TICKS;
                    self.yield_now(pool);
                    return;
                }
            }
            self.check_preempt_running(pool);
        }
    }

    /// §4.3 `block_task`. Removes the running task from the ready
    /// structure, records why it is waiting, and triggers a switch. Unlike
    /// the reference source's `scheduler_block_task`, which triggers a
    /// switch and then falls through to a *second* `scheduler_yield` before
    /// reading back `block_result` (an open question this design resolves
    /// explicitly rather than replicating): here the single switch
    /// triggered below is the only suspension point, and by the time this
    /// task is scheduled back in, whoever unblocked it has already written
    /// `block_result`. The caller reads it only after the actual context
    /// switch has occurred, which on real hardware means after this
    /// function returns through the arch-level switch-and-resume path.
    pub fn block_task(
        &mut self,
        pool: &mut TaskPool,
        reason: BlockReason,
        object: usize,
        timeout: u32,
    ) {
        let running = self.running.expect("block_task called outside task context");
        self.ready_remove(pool, running);

        let wake_tick = if timeout == u32::MAX {
            u32::MAX
        } else {
            self.tick.wrapping_add(timeout.max(1))
        };

        {
            let t = &mut pool.tasks[running.get()];
            t.state = TaskState::Blocked;
            t.block_reason = reason;
            t.block_object = object;
            t.wake_tick = wake_tick;
        }
        self.blocked.push_back(&mut pool.tasks, running);
        self.trigger_or_defer();
    }

    /// §4.3 `unblock_task`.
    pub fn unblock_task(&mut self, pool: &mut TaskPool, idx: TaskIndex, result: Result<(), Error>) {
        debug_assert_eq!(pool.tasks[idx.get()].state, TaskState::Blocked);
        self.blocked.remove(&mut pool.tasks, idx);
        {
            let t = &mut pool.tasks[idx.get()];
            t.block_result = result;
            t.block_reason = BlockReason::None;
            t.block_object = 0;
        }
        self.add_task(pool, idx);
    }

    /// §4.3 `unblock_one`: highest-priority match, FIFO tie-break (which
    /// falls out of walking the list in order and keeping the first hit at
    /// the best priority seen).
    pub fn unblock_one(
        &mut self,
        pool: &mut TaskPool,
        reason: BlockReason,
        object: usize,
        result: Result<(), Error>,
    ) -> bool {
        let mut best: Option<TaskIndex> = None;
        for idx in self.blocked.iter(&pool.tasks) {
            let t = &pool.tasks[idx.get()];
            if t.block_reason == reason && t.block_object == object {
                match best {
                    Some(b) if pool.tasks[b.get()].priority <= t.priority => {}
                    _ => best = Some(idx),
                }
            }
        }
        if let Some(idx) = best {
            self.unblock_task(pool, idx, result);
            true
        } else {
            false
        }
    }

    /// §4.3 `unblock_all`.
    pub fn unblock_all(
        &mut self,
        pool: &mut TaskPool,
        reason: BlockReason,
        object: usize,
        result: Result<(), Error>,
    ) -> usize {
        let mut matches = arrayvec::ArrayVec::<TaskIndex, { crate::config::MAX_TASKS }>::new();
        for idx in self.blocked.iter(&pool.tasks) {
            let t = &pool.tasks[idx.get()];
            if t.block_reason == reason && t.block_object == object {
                let _ = matches.try_push(idx);
            }
        }
        let count = matches.len();
        for idx in matches {
            self.unblock_task(pool, idx, result);
        }
        count
    }

    /// The priority of the highest-priority task currently blocked with the
    /// given `(reason, object)`, or `None` if nothing matches. Used by
    /// [`crate::mutex`] to recompute a mutex owner's inherited priority
    /// without exposing the blocked list itself.
    pub fn highest_blocked_priority(
        &self,
        pool: &TaskPool,
        reason: BlockReason,
        object: usize,
    ) -> Option<u8> {
        let mut best: Option<u8> = None;
        for idx in self.blocked.iter(&pool.tasks) {
            let t = &pool.tasks[idx.get()];
            if t.block_reason == reason && t.block_object == object {
                best = Some(match best {
                    Some(b) if b <= t.priority => b,
                    _ => t.priority,
                });
            }
        }
        best
    }

    /// Ask for a switch unconditionally, deferring to the preemption lock
    /// the same way every other rescheduling point does. Used by `Kernel`
    /// when a task acts on itself (delete, suspend) in a way `remove_task`
    /// alone does not already imply a switch for.
    pub fn request_switch(&mut self) {
        self.trigger_or_defer();
    }

    /// Preemption lock: ISR-delivered unblocks during a locked window set
    /// `reschedule_pending` instead of switching immediately.
    pub fn lock(&mut self) {
        self.lock_count += 1;
    }

    pub fn unlock(&mut self) {
        debug_assert!(self.lock_count > 0);
        self.lock_count -= 1;
        if self.lock_count == 0 && self.reschedule_pending {
            self.reschedule_pending = false;
            self.trigger_switch_now();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count > 0
    }

    fn trigger_or_defer(&mut self) {
        if self.lock_count > 0 {
            self.reschedule_pending = true;
        } else {
            self.trigger_switch_now();
        }
    }

    fn trigger_switch_now(&mut self) {
        self.pending_switch = true;
    }

    /// Consumed by `Kernel` right after releasing the critical section, to
    /// call into the arch-specific `Port::trigger_switch` outside of the
    /// scheduler's own borrow of the task pool.
    pub fn take_pending_switch(&mut self) -> bool {
        core::mem::take(&mut self.pending_switch)
    }
}
