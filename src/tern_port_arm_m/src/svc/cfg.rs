//! The public interface of the SVCall service-call shim.
//!
//! When [`KernelOptions::privileged_threads`] is off, threads execute
//! unprivileged and can't write `BASEPRI`/`PRIMASK`, so they can't enter
//! the kernel's critical section directly. The shim routes such calls
//! through the SVCall exception: the caller passes a target function and
//! up to three arguments, and the handler — running privileged — invokes
//! the function on the caller's behalf.
//!
//! Kernel operations reached this way behave exactly as if called
//! directly; the handler executes in handler mode, which the kernel's
//! context checks treat like any other non-task context, so only the
//! non-blocking subset may be reached through a raw [`service_call`].
//! Blocking calls are instead wrapped by the application so that the SVC
//! merely toggles the privilege for the duration of the call.
//!
//! [`KernelOptions::privileged_threads`]: tern_kernel::KernelOptions
//! [`service_call`]: crate::svc::imp::service_call

/// Register the SVCall exception handler implementing the service-call
/// shim.
///
/// ```ignore
/// tern_port_arm_m::use_svc!(unsafe impl SvcDriver for SystemTraits);
/// ```
#[macro_export]
macro_rules! use_svc {
    (unsafe impl SvcDriver for $SystemTraits:ty) => {
        const _: () = {
            #[no_mangle]
            unsafe extern "C" fn SVCall() {
                unsafe { $crate::svc::imp::handle_svcall() }
            }
        };
    };
}
