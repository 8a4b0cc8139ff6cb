//! The boundary between the portable kernel and architecture-specific code.
//!
//! Per the reference design, everything except the context-switch exception,
//! first-task bring-up, and the supervisor-call dispatch is portable. Those
//! three pieces, plus the interrupt-masking primitive they all rely on, are
//! gathered behind this trait. An implementor (e.g. `rtk_port_cortex_m`)
//! provides no logic of its own beyond register plumbing.

/// Opaque token returned by [`Port::enter_critical`] and consumed by
/// [`Port::exit_critical`]. On Arm-M this is the prior `PRIMASK`/`BASEPRI`
/// value; it exists so nested enter/exit pairs restore exactly the state
/// they found, not merely "interrupts on".
pub type CriticalState = u32;

/// Architecture glue required by the portable kernel.
///
/// # Safety
///
/// Implementors must uphold the contract documented on each method; the
/// kernel relies on these for memory safety of the context switch.
pub unsafe trait Port: 'static {
    /// Disable interrupts (or raise the priority-mask threshold) and return
    /// a token describing the prior state. Must nest correctly: calling
    /// `enter_critical` twice and then `exit_critical`ing the returned
    /// tokens in reverse order must leave interrupts exactly as they were
    /// before the first call.
    ///
    /// # Safety
    /// May be called from any context. Must not be called with a
    /// `CriticalState` obtained from a different core (not applicable to
    /// this single-core kernel, but documented for completeness).
    unsafe fn enter_critical() -> CriticalState;

    /// Restore the interrupt-mask state described by `state`.
    ///
    /// # Safety
    /// `state` must be a value most recently returned by a matching,
    /// not-yet-restored [`Port::enter_critical`] call on this core.
    unsafe fn exit_critical(state: CriticalState);

    /// Returns `true` iff the CPU is currently executing an interrupt
    /// service routine (as opposed to task or idle-task context).
    fn is_isr_context() -> bool;

    /// Pend the low-priority switch exception. Idempotent: pending it while
    /// already pending is a no-op. Must be configured at the lowest
    /// exception priority in the vector table so it runs only after all
    /// other interrupt activity has drained.
    ///
    /// # Safety
    /// May be called with interrupts masked or unmasked, from any context.
    unsafe fn trigger_switch();

    /// Prepare a fresh stack region for a task about to run for the first
    /// time and return the saved stack pointer the switch exception will
    /// reload.
    ///
    /// `stack` is the full task stack region, lowest address first.
    /// `entry`/`arg` become the task's entry function and its sole
    /// argument. `exit_trampoline` is branched to if `entry` ever returns;
    /// it must not return itself.
    ///
    /// # Safety
    /// `stack` must be valid for the lifetime of the task and at least
    /// [`crate::config::MIN_STACK_SIZE`] bytes, 8-byte aligned at both ends.
    unsafe fn initialize_task_stack(
        stack: &mut [u8],
        entry: extern "C" fn(usize),
        arg: usize,
        exit_trampoline: extern "C" fn() -> !,
    ) -> u32;

    /// First-task bring-up: make the task whose saved stack pointer is `sp`
    /// the running task and branch to its entry function as though by a
    /// normal call, switching to unprivileged/process-stack execution.
    /// Never returns.
    ///
    /// # Safety
    /// Must be called exactly once, with interrupts masked, before the
    /// kernel has dispatched any other task.
    unsafe fn dispatch_first_task(sp: u32) -> !;

    /// Compute the systick-style reload value for the configured tick rate
    /// from the collaborator-supplied CPU clock frequency.
    fn tick_reload(cpu_clock_hz: u32, tick_rate_hz: u32) -> u32 {
        cpu_clock_hz / tick_rate_hz - 1
    }

    /// Program and enable the tick timer with the given reload value, and
    /// enable its interrupt. Called once from `Kernel::start`.
    ///
    /// # Safety
    /// Must be called exactly once, before the first task is dispatched.
    unsafe fn start_tick_timer(reload: u32);

    /// Put the CPU into a low-power wait state until the next interrupt.
    /// Used by the default idle hook; a port with no such instruction may
    /// leave this a no-op busy-spin.
    #[inline]
    fn wait_for_interrupt() {}
}
