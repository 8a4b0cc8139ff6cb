//! Bounded message queues.
//!
//! §4.7. Messages are fixed-size and copied by value into a caller-supplied
//! byte buffer backing the ring; there is no per-queue wait list distinct
//! from the scheduler's blocked set; send- and receive-blocked tasks are
//! told apart purely by `BlockReason::QueueSend` vs. `QueueRecv` on the same
//! object key, exactly as the reference source's single `(reason, object)`
//! match subsumes both.
use core::num::NonZeroU8;

use crate::{
    config::MAX_QUEUES,
    list::TaskIndex,
    sched::Scheduler,
    task::{BlockReason, TaskPool},
    Error, Result,
};

/// A 1-based index into the static queue pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueIndex(NonZeroU8);

impl QueueIndex {
    fn new(i: usize) -> Self {
        debug_assert!(i < MAX_QUEUES);
        Self(NonZeroU8::new(i as u8 + 1).expect("pool index in range"))
    }

    pub fn get(self) -> usize {
        self.0.get() as usize - 1
    }
}

/// Maximum message size the static buffer backing constructor accepts. The
/// reference source takes an arbitrary caller buffer sized
/// `capacity * msg_size`; this core additionally caps `msg_size` so the
/// per-queue storage can live in a fixed-size array rather than a slice the
/// caller must keep alive for the queue's entire lifetime.
pub const MAX_MESSAGE_SIZE: usize = 32;

/// One queue's bookkeeping and storage.
#[derive(Clone, Copy)]
struct QueueCb {
    in_use: bool,
    msg_size: usize,
    capacity: usize,
    head: usize,
    tail: usize,
    count: usize,
    buf: [u8; MAX_MESSAGE_SIZE * 8],
}

impl QueueCb {
    const EMPTY: Self = Self {
        in_use: false,
        msg_size: 0,
        capacity: 0,
        head: 0,
        tail: 0,
        count: 0,
        buf: [0; MAX_MESSAGE_SIZE * 8],
    };

    fn empty() -> Self {
        Self::EMPTY
    }

    fn slot(&mut self, slot_idx: usize) -> &mut [u8] {
        let start = slot_idx * self.msg_size;
        &mut self.buf[start..start + self.msg_size]
    }
}

/// The static queue pool, indexed by [`QueueIndex`].
pub struct QueuePool {
    cbs: [QueueCb; MAX_QUEUES],
}

impl QueuePool {
    pub const fn new() -> Self {
        Self {
            cbs: [QueueCb::EMPTY; MAX_QUEUES],
        }
    }

    fn alloc_slot(&mut self) -> Option<QueueIndex> {
        self.cbs
            .iter()
            .position(|cb| !cb.in_use)
            .map(QueueIndex::new)
    }

    /// §4.7 creation. `capacity * msg_size` must fit the fixed per-slot
    /// storage (see [`MAX_MESSAGE_SIZE`]).
    pub fn create(&mut self, msg_size: usize, capacity: usize) -> Result<QueueIndex> {
        if msg_size == 0 || msg_size > MAX_MESSAGE_SIZE || capacity == 0 || capacity > 8 {
            return Err(Error::Param);
        }
        let idx = self.alloc_slot().ok_or(Error::NoMem)?;
        self.cbs[idx.get()] = QueueCb {
            in_use: true,
            msg_size,
            capacity,
            head: 0,
            tail: 0,
            count: 0,
            buf: [0; MAX_MESSAGE_SIZE * 8],
        };
        Ok(idx)
    }

    /// Wakes every blocked sender and receiver with [`Error::Deleted`].
    pub fn delete(&mut self, sched: &mut Scheduler, pool: &mut TaskPool, idx: QueueIndex) {
        sched.unblock_all(pool, BlockReason::QueueSend, idx.get(), Err(Error::Deleted));
        sched.unblock_all(pool, BlockReason::QueueRecv, idx.get(), Err(Error::Deleted));
        self.cbs[idx.get()] = QueueCb::empty();
    }

    fn push_back(&mut self, idx: QueueIndex, msg: &[u8]) {
        let cb = &mut self.cbs[idx.get()];
        let slot_idx = cb.tail;
        cb.tail = (cb.tail + 1) % cb.capacity;
        cb.count += 1;
        cb.slot(slot_idx).copy_from_slice(msg);
    }

    fn push_front(&mut self, idx: QueueIndex, msg: &[u8]) {
        let cb = &mut self.cbs[idx.get()];
        cb.head = (cb.head + cb.capacity - 1) % cb.capacity;
        cb.count += 1;
        let head = cb.head;
        cb.slot(head).copy_from_slice(msg);
    }

    /// §4.7 `send_back`: appended at the tail, dequeued in FIFO order.
    pub fn send_back(
        &mut self,
        sched: &mut Scheduler,
        pool: &mut TaskPool,
        idx: QueueIndex,
        caller: TaskIndex,
        msg: &[u8],
        timeout: u32,
    ) -> Result<()> {
        self.send(sched, pool, idx, caller, msg, timeout, false)
    }

    /// §4.7 `send_front`: jumps the queue, delivered before anything already
    /// enqueued.
    pub fn send_front(
        &mut self,
        sched: &mut Scheduler,
        pool: &mut TaskPool,
        idx: QueueIndex,
        caller: TaskIndex,
        msg: &[u8],
        timeout: u32,
    ) -> Result<()> {
        self.send(sched, pool, idx, caller, msg, timeout, true)
    }

    fn send(
        &mut self,
        sched: &mut Scheduler,
        pool: &mut TaskPool,
        idx: QueueIndex,
        caller: TaskIndex,
        msg: &[u8],
        timeout: u32,
        front: bool,
    ) -> Result<()> {
        if msg.len() != self.cbs[idx.get()].msg_size {
            return Err(Error::Param);
        }
        if self.cbs[idx.get()].count < self.cbs[idx.get()].capacity {
            if front {
                self.push_front(idx, msg);
            } else {
                self.push_back(idx, msg);
            }
            sched.unblock_one(pool, BlockReason::QueueRecv, idx.get(), Ok(()));
            return Ok(());
        }
        if timeout == crate::config::TIMEOUT_NONE {
            return Err(Error::Timeout);
        }
        sched.block_task(pool, BlockReason::QueueSend, idx.get(), timeout);
        let result = pool.tasks[caller.get()].block_result;
        result?;
        // Woken because a receiver made space; retry the copy now that we
        // hold the critical section again.
        if front {
            self.push_front(idx, msg);
        } else {
            self.push_back(idx, msg);
        }
        sched.unblock_one(pool, BlockReason::QueueRecv, idx.get(), Ok(()));
        Ok(())
    }

    /// Non-blocking, ISR-safe send to the back of the queue.
    pub fn send_isr(&mut self, sched: &mut Scheduler, pool: &mut TaskPool, idx: QueueIndex, msg: &[u8]) -> Result<()> {
        if msg.len() != self.cbs[idx.get()].msg_size {
            return Err(Error::Param);
        }
        if self.cbs[idx.get()].count >= self.cbs[idx.get()].capacity {
            return Err(Error::Overflow);
        }
        self.push_back(idx, msg);
        sched.unblock_one(pool, BlockReason::QueueRecv, idx.get(), Ok(()));
        Ok(())
    }

    fn pop_front(&mut self, idx: QueueIndex, out: &mut [u8], consume: bool) {
        let cb = &mut self.cbs[idx.get()];
        let slot_idx = cb.head;
        let start = slot_idx * cb.msg_size;
        out.copy_from_slice(&cb.buf[start..start + cb.msg_size]);
        if consume {
            cb.head = (cb.head + 1) % cb.capacity;
            cb.count -= 1;
        }
    }

    /// §4.7 `receive`: pops from the head and advances it.
    pub fn receive(
        &mut self,
        sched: &mut Scheduler,
        pool: &mut TaskPool,
        idx: QueueIndex,
        caller: TaskIndex,
        out: &mut [u8],
        timeout: u32,
    ) -> Result<()> {
        self.recv(sched, pool, idx, caller, out, timeout, true)
    }

    /// §4.7 `peek`: reads the head without advancing it.
    pub fn peek(
        &mut self,
        sched: &mut Scheduler,
        pool: &mut TaskPool,
        idx: QueueIndex,
        caller: TaskIndex,
        out: &mut [u8],
        timeout: u32,
    ) -> Result<()> {
        self.recv(sched, pool, idx, caller, out, timeout, false)
    }

    fn recv(
        &mut self,
        sched: &mut Scheduler,
        pool: &mut TaskPool,
        idx: QueueIndex,
        caller: TaskIndex,
        out: &mut [u8],
        timeout: u32,
        consume: bool,
    ) -> Result<()> {
        if out.len() != self.cbs[idx.get()].msg_size {
            return Err(Error::Param);
        }
        if self.cbs[idx.get()].count > 0 {
            self.pop_front(idx, out, consume);
            if consume {
                sched.unblock_one(pool, BlockReason::QueueSend, idx.get(), Ok(()));
            }
            return Ok(());
        }
        if timeout == crate::config::TIMEOUT_NONE {
            return Err(Error::Timeout);
        }
        sched.block_task(pool, BlockReason::QueueRecv, idx.get(), timeout);
        let result = pool.tasks[caller.get()].block_result;
        result?;
        self.pop_front(idx, out, consume);
        if consume {
            sched.unblock_one(pool, BlockReason::QueueSend, idx.get(), Ok(()));
        }
        Ok(())
    }

    /// §4.7 `reset`: drops all queued messages and wakes every waiter (both
    /// directions) with [`Error::State`].
    pub fn reset(&mut self, sched: &mut Scheduler, pool: &mut TaskPool, idx: QueueIndex) {
        sched.unblock_all(pool, BlockReason::QueueSend, idx.get(), Err(Error::State));
        sched.unblock_all(pool, BlockReason::QueueRecv, idx.get(), Err(Error::State));
        let cb = &mut self.cbs[idx.get()];
        cb.head = 0;
        cb.tail = 0;
        cb.count = 0;
    }

    pub fn get_count(&self, idx: QueueIndex) -> usize {
        self.cbs[idx.get()].count
    }

    pub fn get_space(&self, idx: QueueIndex) -> usize {
        let cb = &self.cbs[idx.get()];
        cb.capacity - cb.count
    }

    pub fn is_empty(&self, idx: QueueIndex) -> bool {
        self.cbs[idx.get()].count == 0
    }

    pub fn is_full(&self, idx: QueueIndex) -> bool {
        let cb = &self.cbs[idx.get()];
        cb.count == cb.capacity
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
    fn fifo_order_preserved_across_n_sends() {
        let mut pool = TaskPool::new();
        let mut sched = Scheduler::new();
        let mut q = QueuePool::new();
        let t = make_task(&mut pool, 5);
        sched.set_running(Some(t));

        let qi = q.create(4, 4).unwrap();
        let msgs: [u32; 4] = [0x01020304, 0x05060708, 0x090A0B0C, 0x0D0E0F10];
        for m in msgs {
            assert!(q
                .send_back(&mut sched, &mut pool, qi, t, &m.to_ne_bytes(), 0)
                .is_ok());
        }
        assert_eq!(
            q.send_back(&mut sched, &mut pool, qi, t, &0u32.to_ne_bytes(), 5),
            Err(Error::Timeout)
        );

        let mut out = [0u8; 4];
        for expected in msgs {
            assert!(q.receive(&mut sched, &mut pool, qi, t, &mut out, 0).is_ok());
            assert_eq!(u32::from_ne_bytes(out), expected);
        }
    }

    #[test]
    fn send_front_jumps_the_queue() {
        let mut pool = TaskPool::new();
        let mut sched = Scheduler::new();
        let mut q = QueuePool::new();
        let t = make_task(&mut pool, 5);
        sched.set_running(Some(t));

        let qi = q.create(1, 4).unwrap();
        q.send_back(&mut sched, &mut pool, qi, t, &[1], 0).unwrap();
        q.send_front(&mut sched, &mut pool, qi, t, &[2], 0).unwrap();

        let mut out = [0u8; 1];
        q.receive(&mut sched, &mut pool, qi, t, &mut out, 0).unwrap();
        assert_eq!(out, [2]);
        q.receive(&mut sched, &mut pool, qi, t, &mut out, 0).unwrap();
        assert_eq!(out, [1]);
    }

    #[test]
    fn peek_does_not_advance() {
        let mut pool = TaskPool::new();
        let mut sched = Scheduler::new();
        let mut q = QueuePool::new();
        let t = make_task(&mut pool, 5);
        sched.set_running(Some(t));

        let qi = q.create(1, 2).unwrap();
        q.send_back(&mut sched, &mut pool, qi, t, &[7], 0).unwrap();

        let mut out = [0u8; 1];
        q.peek(&mut sched, &mut pool, qi, t, &mut out, 0).unwrap();
        assert_eq!(out, [7]);
        assert_eq!(q.get_count(qi), 1);
        q.receive(&mut sched, &mut pool, qi, t, &mut out, 0).unwrap();
        assert_eq!(q.get_count(qi), 0);
    }

    #[test]
    fn reset_wakes_blocked_receiver_with_state_error() {
        let mut pool = TaskPool::new();
        let mut sched = Scheduler::new();
        let mut q = QueuePool::new();
        let t = make_task(&mut pool, 5);
        sched.add_task(&mut pool, t);
        sched.set_running(Some(t));

        let qi = q.create(1, 1).unwrap();
        sched.block_task(&mut pool, BlockReason::QueueRecv, qi.get(), crate::config::TIMEOUT_FOREVER);

        q.reset(&mut sched, &mut pool, qi);
        assert_eq!(pool.tasks[t.get()].block_result, Err(Error::State));
    }
}
