//! The SVCall handler and the caller-side wrappers.
use core::arch::naked_asm;

/// The signature of a function reachable through [`service_call`].
pub type ServiceFn = extern "C" fn(usize, usize, usize) -> usize;

/// Invoke `func(a, b, c)` in the privileged handler mode.
///
/// # Safety
///
/// `func` must be safe to call from an SVCall handler running on the
/// caller's behalf.
#[inline]
pub unsafe fn service_call(func: ServiceFn, a: usize, b: usize, c: usize) -> usize {
    let result: usize;
    unsafe {
        core::arch::asm!(
            "svc #0",
            inout("r0") a => result,
            in("r1") b,
            in("r2") c,
            in("r3") func as usize,
            clobber_abi("C"),
        );
    }
    result
}

/// The SVCall handler.
///
/// The stacked exception frame carries the arguments in `r0`–`r2` and the
/// target function in `r3`. The handler calls the target and writes its
/// return value into the stacked `r0`, where the caller picks it up on
/// exception return.
///
/// # Safety
///
/// Must be registered as the SVCall exception handler
/// (see [`use_svc!`](crate::use_svc)).
#[unsafe(naked)]
pub unsafe extern "C" fn handle_svcall() {
    extern "C" fn dispatch(frame: *mut u32) {
        // Safety: `frame` points at the exception frame stacked by the
        // SVC instruction: [r0, r1, r2, r3, r12, lr, pc, xPSR]
        unsafe {
            let a = frame.read() as usize;
            let b = frame.add(1).read() as usize;
            let c = frame.add(2).read() as usize;
            let func: ServiceFn = core::mem::transmute(frame.add(3).read() as usize);
            frame.write(func(a, b, c) as u32);
        }
    }

    // Service calls always originate from thread mode on PSP; pass the
    // frame address to the dispatcher.
    #[cfg(not(any(armv6m, armv8m_base)))]
    naked_asm!(
        "mrs r0, psp",
        "b {dispatch}",
        dispatch = sym dispatch,
    );

    #[cfg(any(armv6m, armv8m_base))]
    naked_asm!(
        "mrs r0, psp",
        "ldr r1, ={dispatch}",
        "bx r1",
        dispatch = sym dispatch,
    );
}
