//! Kernel lifecycle: static pools, the idle task, hooks, and the public
//! entry points that glue the scheduler and synchronization primitives to
//! an architecture [`Port`].
//!
//! §4.10. `UNINIT -> INIT -> RUNNING (-> STOPPED)`. `init` is idempotent
//! only from `UNINIT`; `start` never returns on success.
use core::marker::PhantomData;

use crate::{
    config::{
        DEFAULT_STACK_SIZE, MAX_PRIORITY, MAX_TASKS, MIN_STACK_SIZE, STACK_CHECK,
        STACK_FILL_WORD, STACK_GUARD_WORD, TICK_RATE_HZ,
    },
    critical::{Cell, CriticalGuard},
    event_group::{EventGroupIndex, EventGroupPool, WaitMode},
    list::TaskIndex,
    mutex::{MutexIndex, MutexPool},
    port::Port,
    queue::{QueueIndex, QueuePool},
    sched::Scheduler,
    semaphore::{SemaphoreIndex, SemaphorePool},
    task::{BlockReason, TaskAttr, TaskId, TaskPool, TaskState},
    timer::{TimerCallback, TimerIndex, TimerList},
    Error, Result,
};

/// `Kernel`'s lifecycle state (§4.10). Distinct from [`TaskState`], which is
/// per-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Uninit,
    Init,
    Running,
    Stopped,
}

/// Public mirror of [`RunState`], returned by [`Kernel::state`]. The
/// reference source's `kernel_get_state` is a collaborator-facing query, not
/// an internal scheduling detail, so it gets its own public type rather than
/// exposing `RunState` (which also needs to stay private so nothing outside
/// this module can forge a transition).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    Uninit,
    Init,
    Running,
    Stopped,
}

impl From<RunState> for KernelState {
    fn from(s: RunState) -> Self {
        match s {
            RunState::Uninit => KernelState::Uninit,
            RunState::Init => KernelState::Init,
            RunState::Running => KernelState::Running,
            RunState::Stopped => KernelState::Stopped,
        }
    }
}

/// A task's accumulated scheduling statistics (`CONFIG_TASK_STATS`). Only a
/// switch count is tracked; see the doc comment on [`crate::task::Tcb::run_count`]
/// for why cycle-level accounting is out of scope for the portable core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStats {
    pub run_count: u32,
}

/// Weak-default extension points, generic over the [`Port`] so the default
/// idle hook can call [`Port::wait_for_interrupt`]. A port-specific
/// application overrides the ones it cares about by implementing this trait
/// on its own marker type and naming it as `Kernel`'s second type parameter;
/// this is a compile-time seam rather than a vtable, so it costs nothing on
/// the scheduler hot path.
pub trait Hooks<P: Port>: 'static {
    /// Called in a loop by the idle task. Default: wait for an interrupt.
    fn idle() {
        P::wait_for_interrupt();
    }

    /// Called from the tick ISR after scheduler and software-timer
    /// processing. Default: nothing.
    fn tick() {}

    /// Called when a stack-overflow is detected for `task` (§7). Default:
    /// mask interrupts and halt; does not return.
    fn stack_overflow(task: TaskId) -> ! {
        let _ = task;
        loop {
            unsafe {
                P::enter_critical();
            }
        }
    }

    /// Called on an internal consistency-check failure. Default: mask
    /// interrupts and halt; does not return.
    fn assertion_failure(message: &str) -> ! {
        let _ = message;
        loop {
            unsafe {
                P::enter_critical();
            }
        }
    }
}

/// [`Hooks`] with every hook left at its documented default.
pub struct DefaultHooks;
impl<P: Port> Hooks<P> for DefaultHooks {}

/// A task's backing storage, forced 8-byte aligned at both ends the way
/// [`Port::initialize_task_stack`] requires: AAPCS wants the stack pointer
/// double-word aligned at every public interface, including the very first
/// exception return out of a freshly initialized frame.
#[repr(C)]
#[derive(Clone, Copy)]
struct StackStorage {
    _align: elain::Align<8>,
    bytes: [u8; DEFAULT_STACK_SIZE],
}

impl StackStorage {
    const fn new() -> Self {
        Self {
            _align: elain::Align::NEW,
            bytes: [0; DEFAULT_STACK_SIZE],
        }
    }
}

struct StackPool {
    used: [bool; MAX_TASKS],
    stacks: [StackStorage; MAX_TASKS],
}

impl StackPool {
    const fn new() -> Self {
        Self {
            used: [false; MAX_TASKS],
            stacks: [StackStorage::new(); MAX_TASKS],
        }
    }

    fn alloc(&mut self, idx: TaskIndex, size: usize) -> &mut [u8] {
        self.used[idx.get()] = true;
        &mut self.stacks[idx.get()].bytes[..size]
    }

    fn free(&mut self, idx: TaskIndex) {
        self.used[idx.get()] = false;
    }
}

/// Every piece of kernel-wide mutable state, gathered behind one
/// [`Cell`] so a single [`CriticalGuard`] grants access to all of it at
/// once — no module needs its own lock, matching §5's "all scheduler and
/// primitive state mutation occurs inside the interrupt-mask critical
/// section".
struct Tables {
    state: RunState,
    sched: Scheduler,
    tasks: TaskPool,
    stacks: StackPool,
    mutexes: MutexPool,
    semaphores: SemaphorePool,
    queues: QueuePool,
    events: EventGroupPool,
    timers: TimerList,
    idle_task: Option<TaskIndex>,
    cpu_clock_hz: u32,
}

impl Tables {
    const fn new() -> Self {
        Self {
            state: RunState::Uninit,
            sched: Scheduler::new(),
            tasks: TaskPool::new(),
            stacks: StackPool::new(),
            mutexes: MutexPool::new(),
            semaphores: SemaphorePool::new(),
            queues: QueuePool::new(),
            events: EventGroupPool::new(),
            timers: TimerList::new(),
            idle_task: None,
            cpu_clock_hz: 0,
        }
    }
}

/// The kernel instance. One per application; in practice a single `static`.
///
/// `P` supplies the architecture glue (§4.4); `H` overrides the weak
/// default hooks (§4.10) and defaults to [`DefaultHooks`].
pub struct Kernel<P: Port, H: Hooks<P> = DefaultHooks> {
    tables: Cell<P, Tables>,
    _hooks: PhantomData<fn() -> H>,
}

impl<P: Port, H: Hooks<P>> Kernel<P, H> {
    pub const fn new() -> Self {
        Self {
            tables: Cell::new(Tables::new()),
            _hooks: PhantomData,
        }
    }

    /// Run `f` with exclusive access to every kernel table, then — once the
    /// critical section has actually been released — pend the switch
    /// exception if scheduling work inside `f` asked for one. Centralizing
    /// this here is what lets every other method in this module read as a
    /// plain function call: the "trigger a switch no later than return"
    /// contract (§4.3, B4) is enforced once, not at each call site.
    #[inline]
    fn with_tables<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        let mut guard = CriticalGuard::<P>::enter();
        let (result, pending) = self.tables.with(&mut guard, |t| {
            let result = f(t);
            let pending = t.sched.take_pending_switch();
            (result, pending)
        });
        drop(guard);
        if pending {
            unsafe { P::trigger_switch() };
        }
        result
    }

    fn running_index(t: &Tables) -> TaskIndex {
        t.sched
            .running()
            .expect("kernel operation requires a running task")
    }

    fn check_stack(t: &mut Tables, idx: TaskIndex) {
        if !STACK_CHECK {
            return;
        }
        let guard_word =
            u32::from_ne_bytes(t.stacks.stacks[idx.get()].bytes[..4].try_into().unwrap());
        #[cfg(all(test, feature = "std_test_hooks"))]
        log_stack_high_water_mark(t, idx);
        if guard_word != STACK_GUARD_WORD {
            H::stack_overflow(TaskId(idx));
        }
    }

    // ---- Lifecycle (§4.10) -------------------------------------------

    /// Idempotent only from `UNINIT`. Constructs the idle task at
    /// `MAX_PRIORITY - 1` and leaves the scheduler ready to be started.
    pub fn init(&self) -> Result<()> {
        self.with_tables(|t| {
            if t.state != RunState::Uninit {
                return Ok(());
            }
            t.sched = Scheduler::new();

            let idx = t.tasks.alloc_slot().ok_or(Error::NoMem)?;
            let stack = t.stacks.alloc(idx, crate::config::IDLE_STACK_SIZE);
            if STACK_CHECK {
                stack.fill(0);
                for word in stack.chunks_exact_mut(4).skip(1) {
                    word.copy_from_slice(&STACK_FILL_WORD.to_ne_bytes());
                }
                stack[..4].copy_from_slice(&STACK_GUARD_WORD.to_ne_bytes());
            }
            let stack_base = stack.as_ptr() as usize;
            let sp = unsafe {
                P::initialize_task_stack(
                    stack,
                    idle_entry::<P, H>,
                    0,
                    task_exit_trampoline::<P, H>,
                )
            };
            let attr = TaskAttr {
                entry: idle_entry::<P, H>,
                arg: 0,
                priority: (MAX_PRIORITY - 1) as u8,
                stack_size: crate::config::IDLE_STACK_SIZE,
            };
            t.tasks.tasks[idx.get()].allocate(&attr, "idle", stack_base);
            t.tasks.tasks[idx.get()].sp = sp;
            t.sched.add_task(&mut t.tasks, idx);
            t.idle_task = Some(idx);

            t.state = RunState::Init;
            Ok(())
        })
    }

    /// Programs the tick timer for `cpu_clock_hz`, marks the kernel
    /// `RUNNING`, and performs first-task bring-up. Never returns.
    pub fn start(&self, cpu_clock_hz: u32) -> ! {
        let sp = self.with_tables(|t| {
            assert!(t.state == RunState::Init, "Kernel::start before Kernel::init");
            t.cpu_clock_hz = cpu_clock_hz;
            t.state = RunState::Running;
            let idx = t
                .sched
                .highest_ready()
                .expect("idle task makes the ready set non-empty");
            t.sched.set_running(Some(idx));
            t.tasks.tasks[idx.get()].state = TaskState::Running;
            t.tasks.tasks[idx.get()].sp
        });

        let reload = P::tick_reload(self.with_tables(|t| t.cpu_clock_hz), TICK_RATE_HZ);
        unsafe {
            P::start_tick_timer(reload);
            P::dispatch_first_task(sp);
        }
    }

    pub fn get_tick(&self) -> u32 {
        self.with_tables(|t| t.sched.tick_count())
    }

    pub fn get_tick_rate(&self) -> u32 {
        TICK_RATE_HZ
    }

    /// `kernel_get_state`: a collaborator-facing snapshot of where the
    /// kernel is in its §4.10 lifecycle.
    pub fn state(&self) -> KernelState {
        self.with_tables(|t| t.state.into())
    }

    /// `task_get_current`: the caller's own handle. `None` only if called
    /// before `start()`, since every other context (tasks, the idle task)
    /// always has a running task by construction.
    pub fn task_current(&self) -> Option<TaskId> {
        self.with_tables(|t| t.sched.running().map(TaskId))
    }

    pub fn task_stats(&self, id: TaskId) -> TaskStats {
        self.with_tables(|t| TaskStats {
            run_count: t.tasks.tasks[id.index().get()].run_count,
        })
    }

    /// Preemption lock (§4.3 "Preemption lock", `scheduler_lock`/`_unlock` in
    /// the reference source): nestable, interrupts stay enabled, a switch
    /// requested while locked is deferred to the matching `scheduler_unlock`
    /// that brings the nesting count back to zero.
    pub fn scheduler_lock(&self) {
        self.with_tables(|t| t.sched.lock());
    }

    pub fn scheduler_unlock(&self) {
        self.with_tables(|t| t.sched.unlock());
    }

    pub fn scheduler_is_locked(&self) -> bool {
        self.with_tables(|t| t.sched.is_locked())
    }

    // ---- Tick and switch exception entry points (§4.4, §6) ------------

    /// Must be called from the tick ISR, before [`crate::timer`] processing
    /// and the weak tick hook (§6 "Tick exception MUST call...").
    pub fn scheduler_tick(&self) {
        self.with_tables(|t| {
            t.sched.tick(&mut t.tasks);
            if crate::config::SOFTWARE_TIMERS_ENABLED {
                t.timers.tick();
            }
            if let Some(running) = t.sched.running() {
                Self::check_stack(t, running);
            }
        });
        H::tick();
    }

    /// The Rust-side half of the switch exception (§4.4 part 2). The
    /// architecture-specific naked handler saves callee-saved registers onto
    /// the outgoing task's stack, calls this with the resulting SP, and then
    /// reloads callee-saved registers from the returned SP before returning
    /// from exception.
    ///
    /// # Safety
    /// Must be called with interrupts masked, exactly once per switch
    /// exception entry, with `outgoing_sp` pointing at the software-saved
    /// frame just pushed for the previously running task (or `0` if there
    /// was none, i.e. the idle task was discarded rather than saved — see
    /// [`Port::dispatch_first_task`]).
    pub unsafe fn on_switch_exception(&self, outgoing_sp: u32) -> u32 {
        let mut guard = CriticalGuard::<P>::enter();
        let sp = self.tables.with(&mut guard, |t| {
            if let Some(running) = t.sched.running() {
                t.tasks.tasks[running.get()].sp = outgoing_sp;
            }
            let next = t
                .sched
                .highest_ready()
                .expect("idle task is always ready");
            t.tasks.tasks[next.get()].state = TaskState::Running;
            t.tasks.tasks[next.get()].time_slice = crate::config::TIME_SLICE_TICKS;
            t.tasks.tasks[next.get()].run_count += 1;
            t.sched.set_running(Some(next));
            t.tasks.tasks[next.get()].sp
        });
        drop(guard);
        sp
    }

    // ---- Task lifecycle (§4.10, §6 supervisor selectors) --------------

    pub fn task_create(&self, attr: TaskAttr, name: &str) -> Result<TaskId> {
        if attr.stack_size < MIN_STACK_SIZE || attr.stack_size > DEFAULT_STACK_SIZE {
            return Err(Error::Param);
        }
        if attr.priority as usize >= MAX_PRIORITY {
            return Err(Error::Param);
        }
        self.with_tables(|t| {
            let idx = t.tasks.alloc_slot().ok_or(Error::NoMem)?;
            let stack = t.stacks.alloc(idx, attr.stack_size);
            if STACK_CHECK {
                for word in stack.chunks_exact_mut(4) {
                    word.copy_from_slice(&STACK_FILL_WORD.to_ne_bytes());
                }
                stack[..4].copy_from_slice(&STACK_GUARD_WORD.to_ne_bytes());
            }
            let stack_base = stack.as_ptr() as usize;
            let sp = unsafe {
                P::initialize_task_stack(stack, attr.entry, attr.arg, task_exit_trampoline::<P, H>)
            };
            t.tasks.tasks[idx.get()].allocate(&attr, name, stack_base);
            t.tasks.tasks[idx.get()].sp = sp;
            t.sched.add_task(&mut t.tasks, idx);
            Ok(TaskId(idx))
        })
    }

    /// §4.10 / §5 "Cancellation": tears the task down unconditionally. If
    /// `id` is the calling task, triggers a switch; the caller never
    /// observes this call returning in that case (the exit trampoline,
    /// [`task_exit_trampoline`], is what actually runs next on that stack).
    pub fn task_delete(&self, id: TaskId) -> Result<()> {
        self.with_tables(|t| {
            let idx = id.index();
            if t.tasks.tasks[idx.get()].is_free() {
                return Err(Error::Param);
            }
            t.sched.remove_task(&mut t.tasks, idx);
            t.tasks.tasks[idx.get()].mark_deleted();
            t.stacks.free(idx);
            t.tasks.tasks[idx.get()].free();
            // Leave `sched.running()` pointing at the (now freed) slot: the
            // switch exception still needs it to know whose outgoing stack
            // pointer to record on the way out, even though nothing will
            // ever read it back for this slot.
            if t.sched.running() == Some(idx) {
                t.sched.request_switch();
            }
            Ok(())
        })
    }

    pub fn task_suspend(&self, id: TaskId) -> Result<()> {
        self.with_tables(|t| {
            let idx = id.index();
            let was_running = t.sched.running() == Some(idx);
            t.sched.remove_task(&mut t.tasks, idx);
            t.tasks.tasks[idx.get()].state = TaskState::Suspended;
            // `sched.running()` is deliberately left pointing at `idx` (see
            // `task_delete`): the switch exception needs it there to save
            // this task's context so `task_resume` can restore it correctly.
            if was_running {
                t.sched.request_switch();
            }
            Ok(())
        })
    }

    pub fn task_resume(&self, id: TaskId) -> Result<()> {
        self.with_tables(|t| {
            let idx = id.index();
            if t.tasks.tasks[idx.get()].state != TaskState::Suspended {
                return Err(Error::State);
            }
            t.sched.add_task(&mut t.tasks, idx);
            Ok(())
        })
    }

    pub fn task_set_priority(&self, id: TaskId, priority: u8) -> Result<()> {
        if priority as usize >= MAX_PRIORITY {
            return Err(Error::Param);
        }
        self.with_tables(|t| {
            let idx = id.index();
            t.tasks.tasks[idx.get()].base_priority = priority;
            t.sched.set_priority(&mut t.tasks, idx, priority);
            Ok(())
        })
    }

    /// §4.3 `yield`; §9 "delay 0 and reschedule now" resolved in favor of
    /// §4.3's literal reading: a plain yield, never a sleep.
    pub fn task_yield(&self) {
        self.with_tables(|t| t.sched.yield_now(&mut t.tasks));
    }

    /// §4.3 `block_task` with `reason=Delay`. `ticks=0` is a yield (B2);
    /// `ticks=TIMEOUT_FOREVER` blocks forever (no timer ever wakes a
    /// "Delay"-reasoned sleep other than by `unblock_task`, which nothing
    /// calls for a plain delay, so this is really only reachable via
    /// `task_delete`/`task_resume` racing the sleeper — documented for
    /// completeness, not expected in practice).
    pub fn task_delay(&self, ticks: u32) -> Result<()> {
        if ticks == 0 {
            self.task_yield();
            return Ok(());
        }
        self.with_tables(|t| {
            let running = Self::running_index(t);
            t.sched.block_task(&mut t.tasks, BlockReason::Delay, 0, ticks);
            t.tasks.tasks[running.get()].block_result
        })
    }

    /// `task_delay_ms`: convenience wrapper over [`Self::task_delay`] for
    /// callers that think in wall-clock time rather than ticks.
    pub fn task_delay_ms(&self, ms: u32) -> Result<()> {
        self.task_delay(crate::config::ms_to_ticks(ms))
    }

    // ---- Mutex (§4.6) --------------------------------------------------

    pub fn mutex_create(&self, flags: crate::mutex::MutexFlags) -> Result<MutexIndex> {
        self.with_tables(|t| t.mutexes.create(flags))
    }

    pub fn mutex_delete(&self, idx: MutexIndex) {
        self.with_tables(|t| t.mutexes.delete(&mut t.sched, &mut t.tasks, idx));
    }

    pub fn mutex_lock(&self, idx: MutexIndex, timeout: u32) -> Result<()> {
        self.with_tables(|t| {
            let caller = Self::running_index(t);
            t.mutexes.lock(&mut t.sched, &mut t.tasks, idx, caller, timeout)
        })
    }

    pub fn mutex_try_lock(&self, idx: MutexIndex) -> Result<()> {
        self.with_tables(|t| {
            let caller = Self::running_index(t);
            t.mutexes.try_lock(&mut t.tasks, idx, caller)
        })
    }

    pub fn mutex_unlock(&self, idx: MutexIndex) -> Result<()> {
        self.with_tables(|t| {
            let caller = Self::running_index(t);
            t.mutexes.unlock(&mut t.sched, &mut t.tasks, idx, caller)
        })
    }

    // ---- Semaphore (§4.5) ----------------------------------------------

    pub fn sem_create(&self, initial: i32, max: Option<u32>) -> Result<SemaphoreIndex> {
        self.with_tables(|t| t.semaphores.create(initial, max))
    }

    pub fn sem_delete(&self, idx: SemaphoreIndex) {
        self.with_tables(|t| t.semaphores.delete(&mut t.sched, &mut t.tasks, idx));
    }

    pub fn sem_take(&self, idx: SemaphoreIndex, timeout: u32) -> Result<()> {
        self.with_tables(|t| {
            let caller = Self::running_index(t);
            t.semaphores.take(&mut t.sched, &mut t.tasks, idx, caller, timeout)
        })
    }

    pub fn sem_give(&self, idx: SemaphoreIndex) -> Result<()> {
        self.with_tables(|t| t.semaphores.give(&mut t.sched, &mut t.tasks, idx))
    }

    /// §6 "only consumes the tick interrupt and the switch/supervisor
    /// exceptions" notwithstanding, application ISRs are expected to call
    /// this directly (not through a supervisor call, since they already run
    /// privileged) rather than `sem_give`; both end up at
    /// [`SemaphorePool::give_isr`].
    pub fn sem_give_isr(&self, idx: SemaphoreIndex) -> Result<()> {
        if !P::is_isr_context() {
            return Err(Error::Isr);
        }
        self.with_tables(|t| t.semaphores.give_isr(&mut t.sched, &mut t.tasks, idx))
    }

    pub fn sem_reset(&self, idx: SemaphoreIndex, new_count: i32) {
        self.with_tables(|t| t.semaphores.reset(&mut t.sched, &mut t.tasks, idx, new_count));
    }

    pub fn sem_count(&self, idx: SemaphoreIndex) -> i32 {
        self.with_tables(|t| t.semaphores.count(idx))
    }

    // ---- Message queue (§4.7) ------------------------------------------

    pub fn queue_create(&self, msg_size: usize, capacity: usize) -> Result<QueueIndex> {
        self.with_tables(|t| t.queues.create(msg_size, capacity))
    }

    pub fn queue_delete(&self, idx: QueueIndex) {
        self.with_tables(|t| t.queues.delete(&mut t.sched, &mut t.tasks, idx));
    }

    pub fn queue_send_back(&self, idx: QueueIndex, msg: &[u8], timeout: u32) -> Result<()> {
        self.with_tables(|t| {
            let caller = Self::running_index(t);
            t.queues.send_back(&mut t.sched, &mut t.tasks, idx, caller, msg, timeout)
        })
    }

    pub fn queue_send_front(&self, idx: QueueIndex, msg: &[u8], timeout: u32) -> Result<()> {
        self.with_tables(|t| {
            let caller = Self::running_index(t);
            t.queues.send_front(&mut t.sched, &mut t.tasks, idx, caller, msg, timeout)
        })
    }

    pub fn queue_send_isr(&self, idx: QueueIndex, msg: &[u8]) -> Result<()> {
        if !P::is_isr_context() {
            return Err(Error::Isr);
        }
        self.with_tables(|t| t.queues.send_isr(&mut t.sched, &mut t.tasks, idx, msg))
    }

    pub fn queue_receive(&self, idx: QueueIndex, out: &mut [u8], timeout: u32) -> Result<()> {
        self.with_tables(|t| {
            let caller = Self::running_index(t);
            t.queues.receive(&mut t.sched, &mut t.tasks, idx, caller, out, timeout)
        })
    }

    pub fn queue_peek(&self, idx: QueueIndex, out: &mut [u8], timeout: u32) -> Result<()> {
        self.with_tables(|t| {
            let caller = Self::running_index(t);
            t.queues.peek(&mut t.sched, &mut t.tasks, idx, caller, out, timeout)
        })
    }

    pub fn queue_reset(&self, idx: QueueIndex) {
        self.with_tables(|t| t.queues.reset(&mut t.sched, &mut t.tasks, idx));
    }

    pub fn queue_get_count(&self, idx: QueueIndex) -> usize {
        self.with_tables(|t| t.queues.get_count(idx))
    }

    pub fn queue_get_space(&self, idx: QueueIndex) -> usize {
        self.with_tables(|t| t.queues.get_space(idx))
    }

    pub fn queue_is_empty(&self, idx: QueueIndex) -> bool {
        self.with_tables(|t| t.queues.is_empty(idx))
    }

    pub fn queue_is_full(&self, idx: QueueIndex) -> bool {
        self.with_tables(|t| t.queues.is_full(idx))
    }

    // ---- Event group (§4.8) --------------------------------------------

    pub fn event_group_create(&self, initial: u32) -> Result<EventGroupIndex> {
        self.with_tables(|t| t.events.create(initial))
    }

    pub fn event_group_delete(&self, idx: EventGroupIndex) {
        self.with_tables(|t| t.events.delete(&mut t.sched, &mut t.tasks, idx));
    }

    pub fn event_group_set(&self, idx: EventGroupIndex, bits: u32) {
        self.with_tables(|t| t.events.set(&mut t.sched, &mut t.tasks, idx, bits));
    }

    pub fn event_group_clear(&self, idx: EventGroupIndex, bits: u32) {
        self.with_tables(|t| t.events.clear(idx, bits));
    }

    pub fn event_group_get(&self, idx: EventGroupIndex) -> u32 {
        self.with_tables(|t| t.events.get(idx))
    }

    pub fn event_group_wait(
        &self,
        idx: EventGroupIndex,
        bits: u32,
        mode: WaitMode,
        timeout: u32,
    ) -> Result<u32> {
        self.with_tables(|t| {
            let caller = Self::running_index(t);
            t.events.wait(&mut t.sched, &mut t.tasks, idx, caller, bits, mode, timeout)
        })
    }

    // ---- Software timers (§4.9) ----------------------------------------

    pub fn timer_create(&self, callback: TimerCallback, arg: usize) -> Result<TimerIndex> {
        self.with_tables(|t| t.timers.create(callback, arg))
    }

    pub fn timer_delete(&self, idx: TimerIndex) {
        self.with_tables(|t| t.timers.delete(idx));
    }

    pub fn timer_start(&self, idx: TimerIndex, period: u32, periodic: bool) -> Result<()> {
        self.with_tables(|t| t.timers.start(idx, period, periodic))
    }

    pub fn timer_stop(&self, idx: TimerIndex) {
        self.with_tables(|t| t.timers.stop(idx));
    }

    pub fn timer_is_active(&self, idx: TimerIndex) -> bool {
        self.with_tables(|t| t.timers.is_active(idx))
    }

    // ---- Supervisor call dispatch (§4.4 part 3, §6 selectors) ----------

    /// Dispatches one of the supervisor-call selectors listed in §6 from the
    /// stacked argument registers, and returns the value to be written back
    /// into the stacked first-argument slot. Selector 0 ("start first task")
    /// is reserved for the port's own boot sequence and is never expected to
    /// arrive here; it is treated as a parameter error if it does.
    pub fn svc_dispatch(&self, selector: u32, a0: u32, a1: u32, _a2: u32) -> i32 {
        match selector {
            1 => {
                // task-create: the full `TaskAttr` cannot fit in three
                // registers, so applications pass a pointer to one staged in
                // their own memory; `a0` is that pointer, reinterpreted here
                // because the selector ABI deals only in register-sized
                // words, same as the reference source's svc_create_task.
                let attr = unsafe { &*(a0 as *const TaskAttr) };
                match self.task_create(*attr, "") {
                    Ok(id) => id.index().get() as i32,
                    Err(e) => e.code(),
                }
            }
            2 => {
                let idx = TaskIndex::new(a0 as usize);
                match self.task_delete(TaskId(idx)) {
                    Ok(()) => 0,
                    Err(e) => e.code(),
                }
            }
            3 => {
                let idx = TaskIndex::new(a0 as usize);
                match self.task_suspend(TaskId(idx)) {
                    Ok(()) => 0,
                    Err(e) => e.code(),
                }
            }
            4 => {
                let idx = TaskIndex::new(a0 as usize);
                match self.task_resume(TaskId(idx)) {
                    Ok(()) => 0,
                    Err(e) => e.code(),
                }
            }
            5 => {
                self.task_yield();
                0
            }
            6 => match self.task_delay(a0) {
                Ok(()) => 0,
                Err(e) => e.code(),
            },
            7 => {
                let idx = TaskIndex::new(a0 as usize);
                match self.task_set_priority(TaskId(idx), a1 as u8) {
                    Ok(()) => 0,
                    Err(e) => e.code(),
                }
            }
            _ => Error::Param.code(),
        }
    }
}

/// Counts untouched `STACK_FILL_WORD` bytes from the low end of `idx`'s
/// stack and logs the result as its current high-water mark. Exists only
/// under `std_test_hooks`, for host-side test runs; a deployed port has no
/// `log` backend wired up and pays nothing for this.
#[cfg(all(test, feature = "std_test_hooks"))]
fn log_stack_high_water_mark(t: &Tables, idx: TaskIndex) {
    let stack = &t.stacks.stacks[idx.get()].bytes;
    // Word 0 holds the guard pattern, not the fill pattern; everything from
    // word 1 upward was fill until a task's stack grew down into it.
    let untouched = stack
        .chunks_exact(4)
        .skip(1)
        .take_while(|w| u32::from_ne_bytes([w[0], w[1], w[2], w[3]]) == STACK_FILL_WORD)
        .count()
        * 4;
    let used = stack.len() - untouched;
    log::debug!("task {}: stack high-water mark {used}/{} bytes", idx.get(), stack.len());
}

/// Branched to if a task's entry function ever returns (§4.4 part 1). A
/// returning entry function is treated the same as any other fatal
/// programming error: there is no `&Kernel` reachable from a bare function
/// pointer stored in a stack frame, so this cannot itself call
/// `task_delete`; it simply parks, leaving the task permanently
/// non-runnable (it was already removed from every ready list the moment
/// something else was dispatched in its place).
extern "C" fn task_exit_trampoline<P: Port, H: Hooks<P>>() -> ! {
    loop {
        H::idle();
    }
}

extern "C" fn idle_entry<P: Port, H: Hooks<P>>(_: usize) {
    loop {
        H::idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::CriticalState;
    use core::sync::atomic::{AtomicU32, Ordering};

    static NEXT_SP: AtomicU32 = AtomicU32::new(0x1000);

    struct TestPort;
    unsafe impl Port for TestPort {
        unsafe fn enter_critical() -> CriticalState {
            0
        }
        unsafe fn exit_critical(_state: CriticalState) {}
        fn is_isr_context() -> bool {
            false
        }
        unsafe fn trigger_switch() {}
        unsafe fn initialize_task_stack(
            _stack: &mut [u8],
            _entry: extern "C" fn(usize),
            _arg: usize,
            _exit_trampoline: extern "C" fn() -> !,
        ) -> u32 {
            NEXT_SP.fetch_add(0x100, Ordering::Relaxed)
        }
        unsafe fn dispatch_first_task(_sp: u32) -> ! {
            unreachable!("not exercised by unit tests")
        }
        unsafe fn start_tick_timer(_reload: u32) {}
    }

    extern "C" fn dummy_entry(_: usize) {}

    #[test]
    fn init_creates_idle_task_at_lowest_priority() {
        let kernel: Kernel<TestPort> = Kernel::new();
        kernel.init().unwrap();
        kernel.init().unwrap(); // idempotent

        let created = kernel
            .task_create(
                TaskAttr {
                    entry: dummy_entry,
                    arg: 0,
                    priority: 3,
                    stack_size: crate::config::MIN_STACK_SIZE,
                },
                "worker",
            )
            .unwrap();
        assert_ne!(created.index().get(), 0);
    }

    #[test]
    fn task_create_rejects_bad_priority_and_stack_size() {
        let kernel: Kernel<TestPort> = Kernel::new();
        kernel.init().unwrap();

        let bad_priority = kernel.task_create(
            TaskAttr {
                entry: dummy_entry,
                arg: 0,
                priority: MAX_PRIORITY as u8,
                stack_size: crate::config::MIN_STACK_SIZE,
            },
            "t",
        );
        assert_eq!(bad_priority, Err(Error::Param));

        let bad_stack = kernel.task_create(
            TaskAttr {
                entry: dummy_entry,
                arg: 0,
                priority: 1,
                stack_size: 4,
            },
            "t",
        );
        assert_eq!(bad_stack, Err(Error::Param));
    }

    #[test]
    fn creating_beyond_pool_capacity_returns_no_mem() {
        let kernel: Kernel<TestPort> = Kernel::new();
        kernel.init().unwrap();

        // One slot is already the idle task; fill the rest.
        let mut last = Ok(TaskId(TaskIndex::new(0)));
        for _ in 0..(MAX_TASKS - 1) {
            last = kernel.task_create(
                TaskAttr {
                    entry: dummy_entry,
                    arg: 0,
                    priority: 2,
                    stack_size: crate::config::MIN_STACK_SIZE,
                },
                "t",
            );
        }
        assert!(last.is_ok());

        let overflow = kernel.task_create(
            TaskAttr {
                entry: dummy_entry,
                arg: 0,
                priority: 2,
                stack_size: crate::config::MIN_STACK_SIZE,
            },
            "t",
        );
        assert_eq!(overflow, Err(Error::NoMem));
    }

    #[test]
    fn semaphore_round_trips_through_kernel_facade() {
        let kernel: Kernel<TestPort> = Kernel::new();
        kernel.init().unwrap();
        kernel.with_tables(|t| t.sched.set_running(t.idle_task));

        let s = kernel.sem_create(0, Some(1)).unwrap();
        assert_eq!(kernel.sem_take(s, 0), Err(Error::Timeout));
        assert!(kernel.sem_give(s).is_ok());
        assert_eq!(kernel.sem_count(s), 1);
        assert!(kernel.sem_take(s, 0).is_ok());
    }

    #[cfg(feature = "std_test_hooks")]
    #[test]
    fn stack_high_water_mark_is_logged_on_tick() {
        let _ = env_logger::builder().is_test(true).try_init();

        let kernel: Kernel<TestPort> = Kernel::new();
        kernel.init().unwrap();
        let worker = kernel
            .task_create(
                TaskAttr {
                    entry: dummy_entry,
                    arg: 0,
                    priority: 4,
                    stack_size: crate::config::MIN_STACK_SIZE,
                },
                "w",
            )
            .unwrap();
        kernel.with_tables(|t| t.sched.set_running(Some(worker.index())));
        kernel.scheduler_tick();
    }
}
