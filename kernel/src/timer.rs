//! Software timers: single-shot or periodic callbacks fired from tick-ISR
//! context.
//!
//! §4.9. The reference source threads active timers through a single-linked
//! list headed at the scheduler control block; this core keeps the same
//! shape (a [`TimerIndex`]-linked list over a static pool) rather than a
//! sorted delta-queue, since [`crate::config::MAX_SW_TIMERS`] is small enough
//! that an O(n) per-tick walk is cheaper than the bookkeeping a sorted
//! structure would need under frequent `start`/`stop`.
use core::num::NonZeroU8;

use crate::{config::MAX_SW_TIMERS, Error, Result};

/// A 1-based index into the static timer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerIndex(NonZeroU8);

impl TimerIndex {
    fn new(i: usize) -> Self {
        debug_assert!(i < MAX_SW_TIMERS);
        Self(NonZeroU8::new(i as u8 + 1).expect("pool index in range"))
    }

    pub fn get(self) -> usize {
        self.0.get() as usize - 1
    }
}

/// A timer's callback. Runs in tick-ISR context and must not block.
pub type TimerCallback = extern "C" fn(usize);

#[derive(Clone, Copy)]
struct TimerCb {
    in_use: bool,
    active: bool,
    periodic: bool,
    period: u32,
    remaining: u32,
    callback: Option<TimerCallback>,
    arg: usize,
    next: Option<TimerIndex>,
}

impl TimerCb {
    const fn empty() -> Self {
        Self {
            in_use: false,
            active: false,
            periodic: false,
            period: 0,
            remaining: 0,
            callback: None,
            arg: 0,
            next: None,
        }
    }
}

/// The static timer pool plus the single-linked list of currently active
/// timers, indexed by [`TimerIndex`].
pub struct TimerList {
    cbs: [TimerCb; MAX_SW_TIMERS],
    active_head: Option<TimerIndex>,
}

impl TimerList {
    pub const fn new() -> Self {
        Self {
            cbs: [TimerCb::empty(); MAX_SW_TIMERS],
            active_head: None,
        }
    }

    fn alloc_slot(&mut self) -> Option<TimerIndex> {
        self.cbs
            .iter()
            .position(|cb| !cb.in_use)
            .map(TimerIndex::new)
    }

    /// §4.9 `create`: allocates a dormant (inactive) timer.
    pub fn create(&mut self, callback: TimerCallback, arg: usize) -> Result<TimerIndex> {
        let idx = self.alloc_slot().ok_or(Error::NoMem)?;
        self.cbs[idx.get()] = TimerCb {
            in_use: true,
            active: false,
            periodic: false,
            period: 0,
            remaining: 0,
            callback: Some(callback),
            arg,
            next: None,
        };
        Ok(idx)
    }

    pub fn delete(&mut self, idx: TimerIndex) {
        self.stop(idx);
        self.cbs[idx.get()] = TimerCb::empty();
    }

    fn link_active(&mut self, idx: TimerIndex) {
        self.cbs[idx.get()].next = self.active_head;
        self.active_head = Some(idx);
    }

    fn unlink_active(&mut self, idx: TimerIndex) {
        let mut cur = self.active_head;
        let mut prev: Option<TimerIndex> = None;
        while let Some(c) = cur {
            let next = self.cbs[c.get()].next;
            if c == idx {
                match prev {
                    Some(p) => self.cbs[p.get()].next = next,
                    None => self.active_head = next,
                }
                self.cbs[c.get()].next = None;
                return;
            }
            prev = Some(c);
            cur = next;
        }
    }

    /// §4.9 `start`: arms (re-arming first if already active) with the given
    /// period in ticks. `period` must be nonzero.
    pub fn start(&mut self, idx: TimerIndex, period: u32, periodic: bool) -> Result<()> {
        if period == 0 {
            return Err(Error::Param);
        }
        if self.cbs[idx.get()].active {
            self.unlink_active(idx);
        }
        {
            let cb = &mut self.cbs[idx.get()];
            cb.active = true;
            cb.periodic = periodic;
            cb.period = period;
            cb.remaining = period;
        }
        self.link_active(idx);
        Ok(())
    }

    /// §4.9 `stop`: unlinks from the active list, leaving the timer dormant.
    pub fn stop(&mut self, idx: TimerIndex) {
        if self.cbs[idx.get()].active {
            self.unlink_active(idx);
            self.cbs[idx.get()].active = false;
        }
    }

    pub fn is_active(&self, idx: TimerIndex) -> bool {
        self.cbs[idx.get()].active
    }

    /// §4.9 tick processing: walk the active list once, decrementing each
    /// timer's remaining count; for any that reaches zero, re-arm (periodic)
    /// or unlink (one-shot), then invoke its callback. No ordering across
    /// distinct timers firing on the same tick is guaranteed: firing order
    /// here follows the active list's current order (most-recently-started
    /// first), which callers must not depend on.
    pub fn tick(&mut self) {
        let mut cur = self.active_head;
        while let Some(idx) = cur {
            let next = self.cbs[idx.get()].next;
            let fires = {
                let cb = &mut self.cbs[idx.get()];
                cb.remaining = cb.remaining.saturating_sub(1);
                cb.remaining == 0
            };
            if fires {
                let (callback, arg, periodic, period) = {
                    let cb = &self.cbs[idx.get()];
                    (cb.callback, cb.arg, cb.periodic, cb.period)
                };
                if periodic {
                    self.cbs[idx.get()].remaining = period;
                } else {
                    self.unlink_active(idx);
                    self.cbs[idx.get()].active = false;
                }
                if let Some(cb) = callback {
                    cb(arg);
                }
            }
            cur = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static HITS: AtomicU32 = AtomicU32::new(0);
    extern "C" fn bump(_: usize) {
        HITS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn periodic_timer_fires_every_period_ticks() {
        HITS.store(0, Ordering::Relaxed);
        let mut timers = TimerList::new();
        let t = timers.create(bump, 0).unwrap();
        timers.start(t, 10, true).unwrap();

        for _ in 0..105 {
            timers.tick();
        }
        let hits = HITS.load(Ordering::Relaxed);
        assert!(hits == 10 || hits == 11, "hits={hits}");
    }

    #[test]
    fn one_shot_timer_fires_once_then_deactivates() {
        HITS.store(0, Ordering::Relaxed);
        let mut timers = TimerList::new();
        let t = timers.create(bump, 0).unwrap();
        timers.start(t, 5, false).unwrap();

        for _ in 0..20 {
            timers.tick();
        }
        assert_eq!(HITS.load(Ordering::Relaxed), 1);
        assert!(!timers.is_active(t));
    }

    #[test]
    fn stop_prevents_further_fires() {
        HITS.store(0, Ordering::Relaxed);
        let mut timers = TimerList::new();
        let t = timers.create(bump, 0).unwrap();
        timers.start(t, 5, true).unwrap();
        for _ in 0..4 {
            timers.tick();
        }
        timers.stop(t);
        for _ in 0..20 {
            timers.tick();
        }
        assert_eq!(HITS.load(Ordering::Relaxed), 0);
    }
}
