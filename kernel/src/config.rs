//! Compile-time configuration.
//!
//! The original reference kernel exposes these as `#define CONFIG_*` with
//! `#ifndef`-guarded defaults. Array lengths derived from them must be known
//! to the compiler, so they are plain `const`s here rather than associated
//! constants of a trait: Rust's stable const-generics do not let an array
//! length depend on a generic parameter's associated constant
//! (`generic_const_exprs` is nightly-only). A build wanting a different
//! profile vendors this crate and edits these values, the same tradeoff the
//! reference source makes by editing `config.h`.

/// Tick rate of the system timer, in Hz.
pub const TICK_RATE_HZ: u32 = 1000;

/// Maximum number of tasks (including the idle task) the static pool holds.
pub const MAX_TASKS: usize = 16;

/// Number of distinct priority levels. Priority 0 is highest.
///
/// Must not exceed 32: the ready bitmap is a single `u32` word.
pub const MAX_PRIORITY: usize = 32;

/// Default stack size handed to `task_create` when the caller does not
/// specify one.
pub const DEFAULT_STACK_SIZE: usize = 1024;

/// Smallest stack size `task_create` accepts.
pub const MIN_STACK_SIZE: usize = 256;

/// Stack size of the kernel-provided idle task.
pub const IDLE_STACK_SIZE: usize = 256;

/// Maximum length of a task name, not including the NUL terminator.
pub const TASK_NAME_MAX: usize = 16;

/// Ticks a task may run before round-robin rotates it behind its peers.
pub const TIME_SLICE_TICKS: u32 = 10;

/// Whether equal-priority ready tasks round-robin on time-slice expiry.
pub const ROUND_ROBIN: bool = true;

/// Whether the scheduler preempts a running task when a higher-priority one
/// becomes ready (as opposed to only switching at `yield`/`delay` points).
pub const PREEMPTIVE: bool = true;

/// Whether mutexes raise a blocked-on owner's priority to the blocker's.
pub const PRIORITY_INHERITANCE: bool = true;

/// Whether the software timer list is driven from the tick.
pub const SOFTWARE_TIMERS_ENABLED: bool = true;

/// Maximum number of software timers tracked by the active-timer list at
/// once; `timer_start` on an already-full list fails with
/// [`crate::Error::NoMem`].
pub const MAX_SW_TIMERS: usize = 8;

/// Maximum number of mutexes in the static mutex pool.
///
/// The reference source leaves primitives other than tasks to be declared
/// statically by the application (`MUTEX_STATIC_DEFINE` and friends), with no
/// central bound. This core instead pools every primitive kind the same way
/// it pools tasks, so each gets its own fixed-capacity pool and its own
/// `MAX_*` knob here.
pub const MAX_MUTEXES: usize = 8;

/// Maximum number of semaphores in the static semaphore pool.
pub const MAX_SEMAPHORES: usize = 8;

/// Maximum number of message queues in the static queue pool.
pub const MAX_QUEUES: usize = 4;

/// Maximum number of event-flag groups in the static event-group pool.
pub const MAX_EVENT_GROUPS: usize = 4;

/// Whether newly initialized stacks are filled with [`STACK_FILL_WORD`] and
/// scanned for overflow.
pub const STACK_CHECK: bool = true;

/// Pattern written across a fresh stack region, used to estimate high-water
/// mark and to detect gross overflow.
pub const STACK_FILL_WORD: u32 = 0xCDCD_CDCD;

/// Sentinel written at the lowest word of a task's stack; if it is ever
/// found corrupted the stack-overflow hook fires.
pub const STACK_GUARD_WORD: u32 = 0xDEAD_BEEF;

/// A timeout value requesting an immediate, non-blocking attempt.
pub const TIMEOUT_NONE: u32 = 0;

/// A timeout value requesting an unbounded wait.
pub const TIMEOUT_FOREVER: u32 = u32::MAX;

/// Converts a millisecond duration to a tick count at [`TICK_RATE_HZ`],
/// truncating (the reference source's `MS_TO_TICKS` macro does the same
/// integer division). `TIMEOUT_FOREVER` is not a millisecond value and must
/// not be passed through this conversion.
pub const fn ms_to_ticks(ms: u32) -> u32 {
    (ms as u64 * TICK_RATE_HZ as u64 / 1000) as u32
}

/// Converts a tick count back to milliseconds, the inverse of
/// [`ms_to_ticks`] (`TICKS_TO_MS`).
pub const fn ticks_to_ms(ticks: u32) -> u32 {
    (ticks as u64 * 1000 / TICK_RATE_HZ as u64) as u32
}

// `utils::prio_bitmap::PrioBitmap` is a single `u32` word; a priority past
// bit 31 would silently alias another level's bitmap bit.
const _: () = assert!(MAX_PRIORITY <= 32);
