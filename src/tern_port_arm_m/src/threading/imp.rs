//! The Arm-M implementation of the kernel's CPU port contract.
use core::{arch::naked_asm, cell::UnsafeCell};

use tern_kernel::{thread::ThreadCb, Init, KernelOptions, KernelTraits, Port, PortToKernel};

use crate::ThreadingOptions;

/// Implemented on a system type by [`use_port!`](crate::use_port).
///
/// # Safety
///
/// Only meant to be implemented by `use_port!`.
pub unsafe trait PortInstance:
    KernelTraits + Port<PortThreadState = ThreadState> + PortToKernel + ThreadingOptions
{
    fn port_state() -> &'static State;
}

/// The port-defined thread context area: the saved process stack pointer.
/// Placed at the beginning of every `ThreadCb` so the context switcher can
/// reach it with a single load.
#[derive(Debug)]
#[repr(C)]
pub struct ThreadState {
    sp: UnsafeCell<u32>,
}

// Safety: Only the context switcher accesses `sp`, and only for the
// thread being switched away from or to.
unsafe impl Sync for ThreadState {}

impl Init for ThreadState {
    const INIT: Self = Self {
        sp: UnsafeCell::new(0),
    };
}

/// The layout of the software-extended part of a saved thread context,
/// built below the hardware-stacked exception frame.
///
/// ```text
/// sp -> [ EXC_RETURN, CONTROL, r4, r5, r6, r7, r8, r9, r10, r11 ]
///       [ r0, r1, r2, r3, r12, lr, pc, xPSR ]   <- hardware frame
/// ```
const EXTENDED_FRAME_WORDS: usize = 10;
const HW_FRAME_WORDS: usize = 8;

pub struct State {
    /// The thread whose context is live on the CPU (null during boot and
    /// after a thread exited). Distinct from the kernel's running-thread
    /// slot, which holds the *desired* thread; the context switcher brings
    /// the two in agreement.
    cur_thread: UnsafeCell<*mut ()>,
}

// Safety: `cur_thread` is only accessed by the context switcher and the
// boot/exit paths, all serialized by the exception model.
unsafe impl Sync for State {}

impl State {
    pub const fn new() -> Self {
        Self {
            cur_thread: UnsafeCell::new(core::ptr::null_mut()),
        }
    }

    /// Initialize the exception plumbing and start the kernel.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, from the reset path, in Thread mode on
    /// MSP, with interrupts disabled or not yet meaningful.
    pub unsafe fn port_boot<Traits: PortInstance>(
        &self,
        options: &KernelOptions,
        init: fn(),
    ) -> ! {
        unsafe { Self::enter_cpu_lock::<Traits>() };

        // PendSV must have the lowest priority so that a dispatch request
        // from an interrupt handler is honored at the handler's return,
        // and SVCall must be able to preempt nothing kernel-managed
        let mut peripherals = unsafe { cortex_m::Peripherals::steal() };
        unsafe {
            peripherals
                .SCB
                .set_priority(cortex_m::peripheral::scb::SystemHandler::PendSV, 0xff);
            peripherals
                .SCB
                .set_priority(cortex_m::peripheral::scb::SystemHandler::SVCall, 0xff);
        }

        // The tick source is configured by the application's startup path
        // (see `systick::imp::configure`); `options.tick_hz` only becomes
        // meaningful once it fires
        drop(peripherals);

        // Safety: We are a port; CPU Lock is active and the kernel is
        // inactive
        unsafe { <Traits as PortToKernel>::boot(options, init) }
    }

    pub unsafe fn dispatch_first_thread<Traits: PortInstance>(&'static self) -> ! {
        // No context is live yet; the switcher must not save anything
        unsafe { *self.cur_thread.get() = core::ptr::null_mut() };

        cortex_m::peripheral::SCB::set_pendsv();

        // Discard the boot context: reset MSP to the top of the interrupt
        // stack and release the CPU Lock. PendSV is pending, so the
        // dispatcher kicks in the moment interrupts come alive, and this
        // spot is never returned to.
        let msp_top = unsafe { Traits::interrupt_stack_top() };
        #[cfg(has_basepri)]
        unsafe {
            core::arch::asm!(
                "mov sp, {msp_top}",
                "movs r0, #0",
                "msr basepri, r0",
                "cpsie i",
                "0:",
                "wfi",
                "b 0b",
                msp_top = in(reg) msp_top,
                options(noreturn),
            )
        }
        #[cfg(not(has_basepri))]
        unsafe {
            core::arch::asm!(
                "mov sp, {msp_top}",
                "cpsie i",
                "0:",
                "wfi",
                "b 0b",
                msp_top = in(reg) msp_top,
                options(noreturn),
            )
        }
    }

    pub unsafe fn yield_cpu<Traits: PortInstance>(&'static self) {
        core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::Release);

        cortex_m::peripheral::SCB::set_pendsv();

        // Ensure PendSV is taken before the next operation
        cortex_m::asm::dsb();
        cortex_m::asm::isb();

        core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::Acquire);
    }

    pub unsafe fn exit_and_dispatch<Traits: PortInstance>(
        &'static self,
        _thread: &'static ThreadCb<Traits>,
    ) -> ! {
        // The exiting thread's context is dead; don't let the switcher
        // save into its control block
        unsafe { *self.cur_thread.get() = core::ptr::null_mut() };

        cortex_m::peripheral::SCB::set_pendsv();

        // Releasing the CPU Lock lets PendSV fire; execution never comes
        // back to this context
        unsafe { Self::leave_cpu_lock::<Traits>() };
        loop {
            cortex_m::asm::wfi();
        }
    }

    pub unsafe fn enter_cpu_lock<Traits: PortInstance>() {
        #[cfg(has_basepri)]
        unsafe {
            cortex_m::register::basepri::write(Traits::CPU_LOCK_PRIORITY_MASK)
        };
        #[cfg(not(has_basepri))]
        cortex_m::interrupt::disable();
    }

    pub unsafe fn leave_cpu_lock<Traits: PortInstance>() {
        #[cfg(has_basepri)]
        unsafe {
            cortex_m::register::basepri::write(0)
        };
        #[cfg(not(has_basepri))]
        unsafe {
            cortex_m::interrupt::enable()
        };
    }

    pub fn is_cpu_lock_active<Traits: PortInstance>() -> bool {
        #[cfg(has_basepri)]
        return cortex_m::register::basepri::read() != 0;
        #[cfg(not(has_basepri))]
        return cortex_m::register::primask::read().is_active();
    }

    pub fn is_task_context() -> bool {
        matches!(
            cortex_m::peripheral::SCB::vect_active(),
            cortex_m::peripheral::scb::VectActive::ThreadMode
        )
    }

    pub fn is_interrupt_context() -> bool {
        !Self::is_task_context()
    }

    /// Build the initial context of a thread: a hardware exception frame
    /// entering [`thread_entry_trampoline`] plus the software-extended
    /// frame, on the thread's own stack.
    pub unsafe fn initialize_thread_state<Traits: PortInstance>(
        &self,
        thread: &'static ThreadCb<Traits>,
    ) {
        // Safety: CPU Lock active per this method's contract
        let attr = unsafe { thread.attr() };
        let options = unsafe { tern_kernel::options_unchecked::<Traits>() };

        let stack_top = (attr.stack.as_ptr() as usize + attr.stack.len()) & !7;
        let frame =
            (stack_top - (EXTENDED_FRAME_WORDS + HW_FRAME_WORDS) * 4) as *mut u32;

        // CONTROL: SPSEL = 1 (threads run on PSP), nPRIV per configuration
        let control: u32 = 0b10 | u32::from(!options.privileged_threads);
        // EXC_RETURN: return to Thread mode, restore from PSP, basic frame
        let exc_return: u32 = 0xffff_fffd;

        // Safety: The frame lies within the thread's stack region
        unsafe {
            frame.write(exc_return);
            frame.add(1).write(control);
            for i in 2..EXTENDED_FRAME_WORDS {
                frame.add(i).write(0);
            }

            let hw = frame.add(EXTENDED_FRAME_WORDS);
            hw.write(thread as *const _ as u32); // r0: trampoline argument
            hw.add(1).write(0); // r1
            hw.add(2).write(0); // r2
            hw.add(3).write(0); // r3
            hw.add(4).write(0); // r12
            hw.add(5).write(0xffff_ffff); // lr: the trampoline never returns
            hw.add(6)
                .write(thread_entry_trampoline::<Traits> as usize as u32 & !1); // pc
            hw.add(7).write(0x0100_0000); // xPSR: Thumb state

            *thread.port_thread_state.sp.get() = frame as u32;
        }
    }

    /// The PendSV handler: the context switcher.
    ///
    /// # Safety
    ///
    /// Must be registered as the PendSV exception handler, configured with
    /// the lowest exception priority.
    #[unsafe(naked)]
    pub unsafe extern "C" fn handle_pend_sv<Traits: PortInstance>() {
        // Rust code reached from here must not touch r4-r11; the helper
        // functions below are `extern "C"`, which guarantees it.

        /// Choose the next thread and return the location of the
        /// currently live context's control-block pointer.
        extern "C" fn choose_and_retire<Traits: PortInstance>() -> *mut *mut () {
            unsafe { State::enter_cpu_lock::<Traits>() };
            // Safety: CPU Lock active
            unsafe { Traits::choose_running_thread() };
            unsafe { State::leave_cpu_lock::<Traits>() };

            let state = Traits::port_state();
            let next = Traits::state()
                .running_thread()
                .map_or(core::ptr::null_mut(), |cb| {
                    cb as *const ThreadCb<Traits> as *mut ()
                });
            unsafe { *state.cur_thread.get() = next };
            state.cur_thread.get()
        }

        /// Return the live context's control-block pointer (null if the
        /// previous context was discarded).
        extern "C" fn live_context<Traits: PortInstance>() -> *mut () {
            unsafe { *Traits::port_state().cur_thread.get() }
        }

        #[cfg(not(any(armv6m, armv8m_base)))]
        naked_asm!(
            // Save the context of the previous thread, unless it was
            // discarded (boot or exit)
            "push {{r4, lr}}",
            "bl {live_context}",
            "pop {{r4, lr}}",
            "cbz r0, 0f",
            "mrs r2, psp",
            "mrs r3, control",
            "subs r2, #40",
            "str r2, [r0]", // prev.port_thread_state.sp = frame
            "strd lr, r3, [r2]",
            "adds r2, #8",
            "stmia r2, {{r4-r11}}",
            "0:",
            // Choose the next thread to run
            "bl {choose_and_retire}",
            // Restore its context. The kernel guarantees there always is
            // one once the scheduler is live (the idle thread).
            "ldr r1, [r0]",
            "ldr r2, [r1]", // next.port_thread_state.sp
            "ldrd lr, r3, [r2]",
            "msr control, r3",
            "adds r2, #8",
            "ldmia r2, {{r4-r11}}",
            "adds r2, #32",
            "msr psp, r2",
            "isb",
            "bx lr",
            live_context = sym live_context::<Traits>,
            choose_and_retire = sym choose_and_retire::<Traits>,
        );

        #[cfg(any(armv6m, armv8m_base))]
        naked_asm!(
            // Save the context of the previous thread, unless it was
            // discarded (boot or exit)
            "push {{r4, r5}}",
            "mov r4, lr",
            "bl {live_context}",
            "mov lr, r4",
            "pop {{r4, r5}}",
            "cmp r0, #0",
            "beq 0f",
            "mrs r2, psp",
            "mrs r3, control",
            "subs r2, #40",
            "str r2, [r0]", // prev.port_thread_state.sp = frame
            "mov r1, lr",
            "stmia r2!, {{r1, r3}}",
            "stmia r2!, {{r4-r7}}",
            "mov r4, r8",
            "mov r5, r9",
            "mov r6, r10",
            "mov r7, r11",
            "stmia r2!, {{r4-r7}}",
            "0:",
            // Choose the next thread to run
            "bl {choose_and_retire}",
            // Restore its context
            "ldr r1, [r0]",
            "ldr r2, [r1]", // next.port_thread_state.sp
            "adds r2, #24",
            "ldmia r2!, {{r4-r7}}", // r8-r11's values
            "mov r8, r4",
            "mov r9, r5",
            "mov r10, r6",
            "mov r11, r7",
            "msr psp, r2",
            "subs r2, #40",
            "ldmia r2!, {{r0, r1}}", // EXC_RETURN, CONTROL
            "mov lr, r0",
            "msr control, r1",
            "ldmia r2!, {{r4-r7}}",
            "isb",
            "bx lr",
            live_context = sym live_context::<Traits>,
            choose_and_retire = sym choose_and_retire::<Traits>,
        );
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// The first code a thread executes: fetch the entry point from the
/// control block, run it, and perform the kernel's self-exit when it
/// returns.
unsafe extern "C" fn thread_entry_trampoline<Traits: PortInstance>(
    thread: &'static ThreadCb<Traits>,
) -> ! {
    let attr = {
        unsafe { State::enter_cpu_lock::<Traits>() };
        // Safety: CPU Lock active
        let attr = unsafe { thread.attr() };
        unsafe { State::leave_cpu_lock::<Traits>() };
        attr
    };

    (attr.entry)(attr.param);

    let _ = tern_kernel::thread::exit::<Traits>();
    unreachable!()
}
