//! The public interface of the Arm-M threading implementation.

/// Port configuration, implemented on a system type alongside
/// [`use_port!`](crate::use_port).
pub trait ThreadingOptions {
    /// The value to which `BASEPRI` is set inside the kernel's critical
    /// section. Interrupt handlers with a priority value numerically lower
    /// than this may not call kernel services.
    ///
    /// Ignored on Armv6-M, where the critical section masks all
    /// maskable interrupts via `PRIMASK`.
    const CPU_LOCK_PRIORITY_MASK: u8 = 0x20;

    /// The top of the interrupt (main) stack. The default reads the vector
    /// table's initial MSP entry.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port.
    #[cfg(target_os = "none")]
    unsafe fn interrupt_stack_top() -> usize {
        // Safety: The first vector-table entry holds the initial MSP
        unsafe {
            let ptr = cortex_m::peripheral::SCB::PTR as *const u32;
            let vtor = ptr.add(2).read_volatile() as usize; // SCB.VTOR
            (vtor as *const u32).read_volatile() as usize
        }
    }
}

/// Instantiate the port: implement [`tern_kernel::Port`] and the port's
/// own traits on a system type, define the kernel instance's statics, and
/// register the PendSV exception handler.
///
/// The application is responsible for calling
/// [`port_boot`](crate::threading::imp::State::port_boot) from its reset
/// path and for registering the SysTick and SVCall handlers with
/// [`use_systick!`](crate::use_systick) and [`use_svc!`](crate::use_svc).
///
/// ```ignore
/// tern_port_arm_m::use_port!(unsafe struct SystemTraits);
/// impl tern_port_arm_m::ThreadingOptions for SystemTraits {}
/// ```
#[macro_export]
macro_rules! use_port {
    (unsafe struct $SystemTraits:ident) => {
        struct $SystemTraits;

        const _: () = {
            use $crate::threading::imp::{PortInstance, State, ThreadState};

            static PORT_STATE: State = State::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline(always)]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            unsafe impl $crate::tern_kernel::Port for $SystemTraits {
                type PortThreadState = ThreadState;

                const STACK_ALIGN: usize = 8;

                unsafe fn dispatch_first_thread() -> ! {
                    unsafe { PORT_STATE.dispatch_first_thread::<Self>() }
                }

                unsafe fn yield_cpu() {
                    unsafe { PORT_STATE.yield_cpu::<Self>() }
                }

                unsafe fn exit_and_dispatch(
                    thread: &'static $crate::tern_kernel::thread::ThreadCb<Self>,
                ) -> ! {
                    unsafe { PORT_STATE.exit_and_dispatch::<Self>(thread) }
                }

                unsafe fn enter_cpu_lock() {
                    unsafe { State::enter_cpu_lock::<Self>() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { State::leave_cpu_lock::<Self>() }
                }

                unsafe fn initialize_thread_state(
                    thread: &'static $crate::tern_kernel::thread::ThreadCb<Self>,
                ) {
                    unsafe { PORT_STATE.initialize_thread_state::<Self>(thread) }
                }

                fn is_cpu_lock_active() -> bool {
                    State::is_cpu_lock_active::<Self>()
                }

                fn is_task_context() -> bool {
                    State::is_task_context()
                }

                fn is_interrupt_context() -> bool {
                    State::is_interrupt_context()
                }

                unsafe fn wait_for_interrupt() {
                    $crate::cortex_m::asm::wfi();
                }
            }

            // PendSV performs every context switch. `cortex-m-rt` binds
            // exception handlers by symbol name.
            #[no_mangle]
            unsafe extern "C" fn PendSV() {
                unsafe { State::handle_pend_sv::<$SystemTraits>() }
            }
        };

        $crate::tern_kernel::kernel_statics!(unsafe impl KernelStatic for $SystemTraits {
            idle_stack_size: 512,
            timer_stack_size: 2048,
        });
    };
}
