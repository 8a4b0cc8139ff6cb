//! Armv7-M [`rtk_kernel::Port`] implementation: PendSV-driven context switch,
//! SVC dispatch, and a SysTick-driven tick.
//!
//! This crate supplies no logic of its own beyond register plumbing (§9
//! "Assembly" guidance): [`CortexM`] implements the portable [`Port`] trait,
//! and [`bind_kernel!`] wires a concrete `Kernel<CortexM, H>` static to the
//! three architectural entry points (§4.4) an application's vector table
//! must route to it. Targets Cortex-M3/M4/M7 (Thumb-2); an Armv6-M
//! (Cortex-M0/M0+) port would need its own handler bodies, since Thumb-1
//! lacks several instructions used below (`tst`/`ldrb` with a negative
//! immediate offset, `stm`/`ldm` over the full r4-r11 range in one
//! instruction).
#![cfg_attr(target_os = "none", no_std)]

use core::arch::asm;
use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m::peripheral::{scb::SystemHandler, SCB};
use rtk_kernel::port::{CriticalState, Port};

/// Marker type implementing [`rtk_kernel::Port`] for a single-core
/// Cortex-M0/M0+/M3/M4/M7 target. Carries no state; every method either reads
/// architectural registers directly or delegates to [`cortex_m`].
pub struct CortexM;

/// Size in words of the software-saved frame (§4.4 "Initial stack frame"):
/// one `EXC_RETURN` token plus eight callee-saved registers (r4-r11).
const SOFTWARE_FRAME_WORDS: usize = 9;

/// Size in words of the hardware-saved frame: r0-r3, r12, lr, pc, xpsr.
const HARDWARE_FRAME_WORDS: usize = 8;

/// `EXC_RETURN` value selecting "return to Thread mode; exception return
/// gets state from the Process stack; on return execution uses the Process
/// Stack" (§4.4 "a return-from-exception token selecting 'return to thread
/// mode using the process stack'"). Armv8-M adds a secure/non-secure
/// distinction this port does not target.
const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// `xPSR` reset value for a fresh task: the Thumb (`T`) bit set, nothing
/// else. Arm-M has no ARM instruction set, so this bit is always `1` in
/// practice, but §4.4 calls it out explicitly as architecture-dependent.
const INITIAL_XPSR: u32 = 0x0100_0000;

unsafe impl Port for CortexM {
    /// §4.1 critical section. Armv6-M has no `BASEPRI`, so this always masks
    /// via `PRIMASK`; Armv7-M+ ports that want the priority-threshold form
    /// (§4.1 "alternative form") can swap this body for a `basepri` read and
    /// write without touching any other file.
    unsafe fn enter_critical() -> CriticalState {
        let was_active = cortex_m::register::primask::read().is_active();
        cortex_m::interrupt::disable();
        was_active as CriticalState
    }

    unsafe fn exit_critical(state: CriticalState) {
        if state != 0 {
            // Safety: only re-enables interrupts that were on before the
            // matching `enter_critical`, upholding its nesting contract.
            unsafe { cortex_m::interrupt::enable() };
        }
    }

    fn is_isr_context() -> bool {
        let ipsr: u32;
        // Safety: reads a read-only special register; no side effects.
        unsafe {
            asm!("mrs {0}, ipsr", out(reg) ipsr, options(nomem, nostack, preserves_flags));
        }
        (ipsr & 0x1ff) != 0
    }

    unsafe fn trigger_switch() {
        SCB::set_pendsv();
    }

    /// Builds the two-part frame described in §4.4 "Initial stack frame",
    /// hardware frame on top (highest address) of the software frame so that
    /// the PendSV restore path and the boot path (§ below, via `svc #0`) can
    /// both finish with the same `bx lr` exception-return trick.
    unsafe fn initialize_task_stack(
        stack: &mut [u8],
        entry: extern "C" fn(usize),
        arg: usize,
        exit_trampoline: extern "C" fn() -> !,
    ) -> u32 {
        // AAPCS requires 8-byte stack alignment at every public interface,
        // including the very first exception return out of this frame.
        let top = ((stack.as_mut_ptr() as usize + stack.len()) & !0x7) as *mut u32;

        // Safety: `top` is within `stack` (rounded down, never past the
        // end), and `stack` is at least `MIN_STACK_SIZE` bytes per the
        // trait's safety contract, comfortably more than the 17 words
        // written below.
        let hw = unsafe { top.sub(HARDWARE_FRAME_WORDS) };
        // Hardware-saved frame, low to high address: r0, r1, r2, r3, r12,
        // lr, pc, xpsr.
        unsafe {
            hw.add(0).write(arg as u32);
            hw.add(1).write(0);
            hw.add(2).write(0);
            hw.add(3).write(0);
            hw.add(4).write(0);
            hw.add(5).write(exit_trampoline as usize as u32);
            // Bit 0 is the Thumb marker BLX/BX expect; in an exception
            // frame the PC is the exact fetch address, so it must be clear.
            hw.add(6).write(entry as usize as u32 & !1);
            hw.add(7).write(INITIAL_XPSR);
        }

        let sw = unsafe { hw.sub(SOFTWARE_FRAME_WORDS) };
        // Software-saved frame: EXC_RETURN token, then r4-r11 zeroed.
        unsafe {
            sw.add(0).write(EXC_RETURN_THREAD_PSP);
            for i in 1..SOFTWARE_FRAME_WORDS {
                sw.add(i).write(0);
            }
        }

        sw as u32
    }

    /// §4.4 part 1, first-task bring-up. Rather than hand-assembling the
    /// same "pop a fabricated frame and fake an exception return" sequence
    /// twice, this stashes `sp` and executes `svc #0` — the reserved
    /// start-first-task selector (§6) — so the one `bx lr` trick in
    /// [`svcall_trampoline!`]'s boot branch does the work, the same way the
    /// PendSV restore half does it for every later switch.
    unsafe fn dispatch_first_task(sp: u32) -> ! {
        FIRST_TASK_SP.store(sp, Ordering::Relaxed);
        // Safety: executed once, before any task has run, with interrupts
        // masked, per the trait's contract; `svc #0` traps into
        // `SVCall`, which recognizes the Thread+MSP calling context as the
        // boot case (see `bind_kernel!`) and never returns here.
        unsafe {
            asm!("svc #0", options(noreturn));
        }
    }

    /// §6 "tick rate ... CPU-clock constant supplied by the collaborator
    /// HAL": reload = clock / rate - 1, SysTick's down-counter convention.
    fn tick_reload(cpu_clock_hz: u32, tick_rate_hz: u32) -> u32 {
        cpu_clock_hz / tick_rate_hz - 1
    }

    unsafe fn start_tick_timer(reload: u32) {
        // Safety: called exactly once from `Kernel::start`, before the
        // first task is dispatched, per the trait's contract.
        let mut peripherals = unsafe { cortex_m::Peripherals::steal() };
        peripherals.SYST.set_reload(reload);
        peripherals.SYST.clear_current();
        peripherals.SYST.set_clock_source(cortex_m::peripheral::syst::SystClkSource::Core);
        peripherals.SYST.enable_interrupt();
        peripherals.SYST.enable_counter();
        // PendSV and SVCall must run at the lowest priority (§4.4 part 2);
        // SysTick one notch above them so the tick always preempts a switch
        // already in progress (§5 "above the tick exception by a small
        // margin").
        peripherals.SCB.set_priority(SystemHandler::PendSV, 0xff);
        peripherals.SCB.set_priority(SystemHandler::SVCall, 0xff);
        peripherals.SCB.set_priority(SystemHandler::SysTick, 0xf0);
    }

    #[inline]
    fn wait_for_interrupt() {
        cortex_m::asm::wfi();
    }
}

/// Stashed by [`CortexM::dispatch_first_task`] for `SVCall`'s boot branch to
/// pick up; written once, read once, both with interrupts masked, so this
/// needs no synchronization beyond `Ordering::Relaxed`.
#[doc(hidden)]
pub static FIRST_TASK_SP: AtomicU32 = AtomicU32::new(0);

/// The Rust half of the PendSV handler (§4.4 part 2): given the outgoing
/// task's just-saved stack pointer (or the sentinel the bound `bind_kernel!`
/// trampoline passes when there is none), ask the kernel for the next task
/// to run and return its saved stack pointer for the asm restore half.
///
/// # Safety
/// Must be called with interrupts masked, exactly once per `PendSV` entry,
/// by the naked trampoline [`bind_kernel!`] generates.
#[doc(hidden)]
pub unsafe fn pend_sv_rust<P, H>(kernel: &rtk_kernel::Kernel<P, H>, outgoing_sp: u32) -> u32
where
    P: Port,
    H: rtk_kernel::kernel::Hooks<P>,
{
    unsafe { kernel.on_switch_exception(outgoing_sp) }
}

/// The Rust half of SVC dispatch (§4.4 part 3): decode the selector and
/// stacked arguments, already split out by the naked trampoline, and hand
/// them to [`rtk_kernel::Kernel::svc_dispatch`].
#[doc(hidden)]
pub fn svc_dispatch_rust<P, H>(
    kernel: &rtk_kernel::Kernel<P, H>,
    selector: u32,
    a0: u32,
    a1: u32,
    a2: u32,
) -> i32
where
    P: Port,
    H: rtk_kernel::kernel::Hooks<P>,
{
    kernel.svc_dispatch(selector, a0, a1, a2)
}

/// Binds a concrete `static KERNEL: Kernel<CortexM, H>` to the three
/// naked/exception entry points the vector table must route to it (§6):
/// `PendSV` (switch exception), `SVCall` (supervisor dispatch, including the
/// reserved start-first-task selector), and `SysTick` (the tick).
///
/// Exactly one invocation of this macro must appear in the final binary, at
/// the crate root, so the generated `#[no_mangle]` symbols land in the
/// vector table `cortex-m-rt` builds from them.
///
/// # Safety
/// The named static must be the only `Kernel` instance in the program, and
/// nothing else may define `PendSV`, `SVCall`, or a `SysTick`
/// `#[cortex_m_rt::exception]` handler.
#[macro_export]
macro_rules! bind_kernel {
    (unsafe $kernel:path) => {
        #[no_mangle]
        #[naked]
        unsafe extern "C" fn PendSV() {
            unsafe {
                ::core::arch::asm!(
                    "
                    @ Reserve and fill the software-saved frame (EXC_RETURN,
                    @ r4-r11) below the hardware frame PSP already points at,
                    @ then hand the resulting pointer to Rust as `outgoing_sp`
                    @ in r0, the sole AAPCS argument/return register.
                    mrs  r0, psp
                    subs r0, r0, #36
                    str  lr, [r0]
                    adds r1, r0, #4
                    stm  r1!, {{r4-r11}}
                    bl   {trampoline}
                    @ `r0` now holds the next task's saved sp (software-saved
                    @ frame start, same trampoline call convention); restore
                    @ it symmetrically and fake an exception return into it.
                    ldr  lr, [r0]
                    adds r0, r0, #4
                    ldm  r0!, {{r4-r11}}
                    msr  psp, r0
                    bx   lr
                    ",
                    trampoline = sym pend_sv_trampoline,
                    options(noreturn),
                );
            }
        }

        extern "C" fn pend_sv_trampoline(outgoing_sp: u32) -> u32 {
            unsafe { $crate::pend_sv_rust(&$kernel, outgoing_sp) }
        }

        #[no_mangle]
        #[naked]
        unsafe extern "C" fn SVCall() {
            unsafe {
                ::core::arch::asm!(
                    "
                    @ Boot call (§4.4 part 1 / §6 selector 0) always arrives
                    @ from Thread mode on the Main stack, never the Process
                    @ stack a task's own `svc` would use; bit 2 of the live
                    @ EXC_RETURN still in `lr` tells the two apart.
                    tst  lr, #4
                    beq  2f

                    @ Ordinary supervisor call. Selector is the low byte of
                    @ the `svc` instruction, two bytes before the return
                    @ address the hardware stacked as PC; arguments are the
                    @ caller's stacked r0/r1 (§4.4 part 3).
                    mrs  r0, psp
                    ldr  r3, [r0, #24]
                    ldrb r1, [r3, #-2]
                    ldr  r2, [r0, #0]
                    ldr  r3, [r0, #4]
                    mov  r12, r0
                    movs r0, r1
                    movs r1, r2
                    mov  r2, r3
                    movs r3, #0
                    bl   {svc_trampoline}
                    str  r0, [r12, #0]
                    bx   lr

                2:  @ Boot: pop the fabricated frame `dispatch_first_task`
                    @ built and fake an exception return into the first task.
                    ldr  r0, ={first_task_sp}
                    ldr  r0, [r0]
                    ldr  lr, [r0]
                    adds r0, r0, #4
                    ldm  r0!, {{r4-r11}}
                    msr  psp, r0
                    movs r1, #2
                    msr  control, r1
                    isb
                    bx   lr
                    ",
                    svc_trampoline = sym svc_trampoline,
                    first_task_sp = sym $crate::FIRST_TASK_SP,
                    options(noreturn),
                );
            }
        }

        extern "C" fn svc_trampoline(selector: u32, a0: u32, a1: u32, a2: u32) -> i32 {
            $crate::svc_dispatch_rust(&$kernel, selector, a0, a1, a2)
        }

        #[$crate::cortex_m_rt::exception]
        fn SysTick() {
            $kernel.scheduler_tick();
        }
    };
}

#[doc(hidden)]
pub use cortex_m_rt;
