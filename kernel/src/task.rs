//! Task control blocks and the static task pool.
use core::sync::atomic::{AtomicU32, Ordering};

use arrayvec::ArrayString;

use crate::{
    config::{MAX_TASKS, TASK_NAME_MAX},
    list::{Link, Linked, TaskIndex},
};

/// A task's scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Pool slot is unused.
    Dormant,
    Ready,
    Running,
    Blocked,
    Suspended,
    /// Torn down; the slot is being returned to the free pool.
    Deleted,
}

/// Why a task is on the blocked list, and which object it is waiting for.
/// Matched by `(reason, object)` on unblock, exactly like the reference
/// source's `block_reason_t` plus `block_object` pointer pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    None,
    Delay,
    Semaphore,
    Mutex,
    QueueSend,
    QueueRecv,
    Event,
}

/// A stable handle to a task, returned by [`crate::kernel::Kernel::task_create`].
///
/// Internally this *is* the pool slot index: slots are not reused while the
/// task they identify is alive, so the handle remains valid for exactly the
/// task's lifetime, the same guarantee the reference source gets from
/// returning a raw `task_t*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(pub(crate) TaskIndex);

impl TaskId {
    pub(crate) fn index(self) -> TaskIndex {
        self.0
    }
}

/// Static, user-supplied properties of a task, handed to `task_create`.
#[derive(Clone, Copy)]
pub struct TaskAttr {
    pub entry: extern "C" fn(usize),
    pub arg: usize,
    pub priority: u8,
    pub stack_size: usize,
}

/// Monotonically increasing counter used only to fill
/// [`Tcb::serial`][Tcb::serial]; never used as a lookup key.
static NEXT_SERIAL: AtomicU32 = AtomicU32::new(1);

/// One task's full bookkeeping.
///
/// `sp` **must** remain the first field: the context-switch exception
/// accesses it by a fixed offset from a `&Tcb` (or, on the arch side, from a
/// raw pointer it was handed), with no intervening Rust field-offset
/// computation it can trust across optimization levels other than "this is
/// field zero of a `#[repr(C)]` struct".
#[repr(C)]
pub struct Tcb {
    /// Saved stack pointer. Valid only while the task is not `Running`.
    pub sp: u32,

    pub state: TaskState,
    pub serial: u32,
    pub name: ArrayString<TASK_NAME_MAX>,

    pub priority: u8,
    pub base_priority: u8,
    pub time_slice: u32,

    pub block_reason: BlockReason,
    /// Address-shaped identity of the object being waited on (a semaphore,
    /// mutex, queue, or event group's pool slot), used purely as a match
    /// key for `(reason, object)` lookups; never dereferenced as such.
    pub block_object: usize,
    /// Absolute tick at which the block should time out, or `u32::MAX` for
    /// "never" (§4.3 `block_task`).
    pub wake_tick: u32,
    pub block_result: Result<(), crate::Error>,
    pub event_wait_bits: u32,
    pub event_wait_all: bool,

    /// Mutexes currently held by this task, threaded through
    /// [`crate::mutex::MutexCb::held_link`] — the reference source's
    /// `prev_mutex_held` singly-linked list, used to recompute effective
    /// priority when one of several held mutexes is unlocked.
    pub mutexes_held: Option<crate::mutex::MutexIndex>,

    pub stack_base: usize,
    pub stack_size: usize,

    /// Number of times this task has been switched in. A coarser stand-in
    /// for the reference source's `CONFIG_TASK_STATS` runtime accounting,
    /// which also tracks cycles-spent-running; the portable core has no
    /// cycle counter to read, so only the switch count is kept here (see
    /// `task_stats` in `kernel.rs`).
    pub run_count: u32,

    link: Link,
}

impl Default for Tcb {
    fn default() -> Self {
        Self {
            sp: 0,
            state: TaskState::Dormant,
            serial: 0,
            name: ArrayString::new(),
            priority: 0,
            base_priority: 0,
            time_slice: 0,
            block_reason: BlockReason::None,
            block_object: 0,
            wake_tick: 0,
            block_result: Ok(()),
            event_wait_bits: 0,
            event_wait_all: false,
            mutexes_held: None,
            stack_base: 0,
            stack_size: 0,
            run_count: 0,
            link: Link::default(),
        }
    }
}

impl Linked for Tcb {
    fn link(&self) -> Link {
        self.link
    }
    fn set_link(&mut self, link: Link) {
        self.link = link;
    }
}

impl Tcb {
    pub fn is_free(&self) -> bool {
        matches!(self.state, TaskState::Dormant)
    }

    pub(crate) fn allocate(&mut self, attr: &TaskAttr, name: &str, stack_base: usize) {
        self.serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        self.name = ArrayString::from(name).unwrap_or_default();
        self.priority = attr.priority;
        self.base_priority = attr.priority;
        self.time_slice = crate::config::TIME_SLICE_TICKS;
        self.block_reason = BlockReason::None;
        self.block_object = 0;
        self.wake_tick = 0;
        self.block_result = Ok(());
        self.event_wait_bits = 0;
        self.event_wait_all = false;
        self.mutexes_held = None;
        self.stack_base = stack_base;
        self.stack_size = attr.stack_size;
        self.run_count = 0;
        self.state = TaskState::Ready;
    }

    /// Marks the task torn down (§4.10, §3 "state (one of Ready, Running,
    /// Blocked, Suspended, Deleted)"); the pool slot is not yet reusable
    /// until [`Self::free`] runs.
    pub(crate) fn mark_deleted(&mut self) {
        self.state = TaskState::Deleted;
    }

    pub(crate) fn free(&mut self) {
        *self = Tcb::default();
    }
}

/// The static task pool, indexed by [`TaskIndex`].
pub struct TaskPool {
    pub tasks: [Tcb; MAX_TASKS],
}

impl TaskPool {
    pub const fn new() -> Self {
        Self {
            tasks: [Tcb::CONST_DEFAULT; MAX_TASKS],
        }
    }

    pub fn alloc_slot(&mut self) -> Option<TaskIndex> {
        self.tasks
            .iter()
            .position(Tcb::is_free)
            .map(TaskIndex::new)
    }
}

impl Tcb {
    const CONST_DEFAULT: Tcb = Tcb {
        sp: 0,
        state: TaskState::Dormant,
        serial: 0,
        name: ArrayString::new(),
        priority: 0,
        base_priority: 0,
        time_slice: 0,
        block_reason: BlockReason::None,
        block_object: 0,
        wake_tick: 0,
        block_result: Ok(()),
        event_wait_bits: 0,
        event_wait_all: false,
        mutexes_held: None,
        stack_base: 0,
        stack_size: 0,
        run_count: 0,
        link: Link { prev: None, next: None },
    };
}
