//! Event-flag groups: a 32-bit word of caller-defined bits with any/all
//! waiters and an optional auto-clear on successful wait.
//!
//! §4.8. Bit 31 is reserved as the caller's "clear matched bits on success"
//! request and is stripped from the match mask before comparison, leaving
//! 31 usable event bits — exactly as the reference source's
//! `EVENT_AUTO_CLEAR` flag is folded into the same argument word rather than
//! taking a separate parameter.
use core::num::NonZeroU8;

use crate::{
    config::MAX_EVENT_GROUPS,
    list::TaskIndex,
    sched::Scheduler,
    task::{BlockReason, TaskPool},
    Error, Result,
};

/// Request bit 31 of a `wait` call's `bits` argument: clear the matched bits
/// on a successful (non-blocking or woken) return.
pub const AUTO_CLEAR: u32 = 1 << 31;

const USABLE_BITS_MASK: u32 = !AUTO_CLEAR;

/// `Any` is satisfied once a single requested bit is set; `All` requires
/// every requested bit to be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    Any,
    All,
}

/// A 1-based index into the static event-group pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventGroupIndex(NonZeroU8);

impl EventGroupIndex {
    fn new(i: usize) -> Self {
        debug_assert!(i < MAX_EVENT_GROUPS);
        Self(NonZeroU8::new(i as u8 + 1).expect("pool index in range"))
    }

    pub fn get(self) -> usize {
        self.0.get() as usize - 1
    }
}

#[derive(Clone, Copy)]
struct EventGroupCb {
    in_use: bool,
    flags: u32,
}

impl EventGroupCb {
    const fn empty() -> Self {
        Self {
            in_use: false,
            flags: 0,
        }
    }
}

/// The static event-group pool, indexed by [`EventGroupIndex`].
pub struct EventGroupPool {
    cbs: [EventGroupCb; MAX_EVENT_GROUPS],
}

impl EventGroupPool {
    pub const fn new() -> Self {
        Self {
            cbs: [EventGroupCb::empty(); MAX_EVENT_GROUPS],
        }
    }

    fn alloc_slot(&mut self) -> Option<EventGroupIndex> {
        self.cbs
            .iter()
            .position(|cb| !cb.in_use)
            .map(EventGroupIndex::new)
    }

    /// §4.8 creation with an initial flag word (usually 0).
    pub fn create(&mut self, initial: u32) -> Result<EventGroupIndex> {
        let idx = self.alloc_slot().ok_or(Error::NoMem)?;
        self.cbs[idx.get()] = EventGroupCb {
            in_use: true,
            flags: initial & USABLE_BITS_MASK,
        };
        Ok(idx)
    }

    pub fn delete(&mut self, sched: &mut Scheduler, pool: &mut TaskPool, idx: EventGroupIndex) {
        sched.unblock_all(pool, BlockReason::Event, idx.get(), Err(Error::Deleted));
        self.cbs[idx.get()] = EventGroupCb::empty();
    }

    /// §4.8 `set`: OR `bits` into the flag word, then wake every task
    /// blocked on this group so each can re-evaluate its own condition.
    pub fn set(&mut self, sched: &mut Scheduler, pool: &mut TaskPool, idx: EventGroupIndex, bits: u32) {
        self.cbs[idx.get()].flags |= bits & USABLE_BITS_MASK;
        sched.unblock_all(pool, BlockReason::Event, idx.get(), Ok(()));
    }

    /// §4.8 `clear`: AND-NOT `bits` out of the flag word. Does not wake
    /// anyone; clearing can only make pending waits harder to satisfy.
    pub fn clear(&mut self, idx: EventGroupIndex, bits: u32) {
        self.cbs[idx.get()].flags &= !(bits & USABLE_BITS_MASK);
    }

    pub fn get(&self, idx: EventGroupIndex) -> u32 {
        self.cbs[idx.get()].flags
    }

    fn matches(flags: u32, want: u32, mode: WaitMode) -> bool {
        match mode {
            WaitMode::Any => (flags & want) != 0 || want == 0,
            WaitMode::All => (flags & want) == want,
        }
    }

    /// §4.8 `wait`. `bits`'s top bit (see [`AUTO_CLEAR`]) requests that the
    /// matched subset be cleared on a successful return; it is stripped
    /// before matching and is not itself a waitable flag.
    ///
    /// A woken task re-evaluates its own condition rather than trusting the
    /// `set`/`clear` that woke it to have been the one that satisfies it
    /// (another waiter, or an intervening `clear`, may have changed the
    /// picture first) — callers therefore call this in a loop exactly once:
    /// on the resumed path, it re-checks `flags` itself rather than assuming
    /// success.
    pub fn wait(
        &mut self,
        sched: &mut Scheduler,
        pool: &mut TaskPool,
        idx: EventGroupIndex,
        caller: TaskIndex,
        bits: u32,
        mode: WaitMode,
        timeout: u32,
    ) -> Result<u32> {
        let auto_clear = bits & AUTO_CLEAR != 0;
        let want = bits & USABLE_BITS_MASK;

        loop {
            let flags = self.cbs[idx.get()].flags;
            if Self::matches(flags, want, mode) {
                let matched = flags & want;
                if auto_clear {
                    self.cbs[idx.get()].flags &= !matched;
                }
                return Ok(matched);
            }
            if timeout == crate::config::TIMEOUT_NONE {
                return Err(Error::Timeout);
            }
            sched.block_task(pool, BlockReason::Event, idx.get(), timeout);
            pool.tasks[caller.get()].block_result?;
            // Loop back and re-check: `set` wakes every waiter regardless of
            // whether this particular task's condition is now met.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskAttr;

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
    fn set_then_wait_any_returns_without_blocking() {
        let mut pool = TaskPool::new();
        let mut sched = Scheduler::new();
        let mut eg = EventGroupPool::new();
        let t = make_task(&mut pool, 5);
        sched.set_running(Some(t));

        let e = eg.create(0).unwrap();
        eg.set(&mut sched, &mut pool, e, 0x6);
        let r = eg.wait(&mut sched, &mut pool, e, t, 0x6, WaitMode::Any, 0);
        assert_eq!(r, Ok(0x6));
    }

    #[test]
    fn auto_clear_bit_clears_matched_bits_on_success() {
        let mut pool = TaskPool::new();
        let mut sched = Scheduler::new();
        let mut eg = EventGroupPool::new();
        let t = make_task(&mut pool, 5);
        sched.set_running(Some(t));

        let e = eg.create(0).unwrap();
        eg.set(&mut sched, &mut pool, e, 0x6);
        let r = eg.wait(&mut sched, &mut pool, e, t, 0x6 | AUTO_CLEAR, WaitMode::All, 0);
        assert_eq!(r, Ok(0x6));
        assert_eq!(eg.get(e), 0);
    }

    #[test]
    fn all_mode_requires_every_requested_bit() {
        let mut pool = TaskPool::new();
        let mut sched = Scheduler::new();
        let mut eg = EventGroupPool::new();
        let t = make_task(&mut pool, 5);
        sched.set_running(Some(t));

        let e = eg.create(0).unwrap();
        eg.set(&mut sched, &mut pool, e, 0x2);
        assert_eq!(
            eg.wait(&mut sched, &mut pool, e, t, 0x6, WaitMode::All, 0),
            Err(Error::Timeout)
        );
    }
}
