//! The public interface of the SysTick-based tick source.

/// Tick-source configuration, implemented on a system type alongside
/// [`use_systick!`](crate::use_systick).
pub trait SysTickOptions {
    /// The frequency of the clock feeding SysTick, in hertz.
    const SYSTICK_CLOCK_HZ: u64;

    /// Whether SysTick counts the processor clock (`true`) or the
    /// vendor-defined reference clock (`false`).
    const SYSTICK_USE_PROCESSOR_CLOCK: bool = true;
}

/// Register the SysTick exception handler announcing ticks to the kernel.
///
/// ```ignore
/// tern_port_arm_m::use_systick!(unsafe impl SysTickDriver for SystemTraits);
/// impl tern_port_arm_m::SysTickOptions for SystemTraits {
///     const SYSTICK_CLOCK_HZ: u64 = 48_000_000;
/// }
/// ```
#[macro_export]
macro_rules! use_systick {
    (unsafe impl SysTickDriver for $SystemTraits:ty) => {
        const _: () = {
            #[no_mangle]
            unsafe extern "C" fn SysTick() {
                // Safety: We are the port's tick source
                unsafe {
                    <$SystemTraits as $crate::tern_kernel::PortToKernel>::timer_tick()
                }
            }
        };
    };
}
