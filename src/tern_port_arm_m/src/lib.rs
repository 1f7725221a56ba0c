//! Cortex-M port for the tern kernel.
//!
//! Supports Armv6-M, Armv7-M, and Armv7E-M processors. The port maps the
//! kernel's CPU port contract onto the architecture like this:
//!
//! - **Critical section** — `BASEPRI` raised to
//!   [`ThreadingOptions::CPU_LOCK_PRIORITY_MASK`] where available
//!   (Armv7-M and later); `PRIMASK` on Armv6-M, where every interrupt
//!   priority is considered kernel-managed.
//! - **Deferred context switch** — PendSV, configured with the lowest
//!   exception priority so a switch requested from an interrupt handler
//!   runs at the handler's return.
//! - **Thread contexts** — an exception frame on the thread's process
//!   stack (PSP), extended with the callee-saved registers, `CONTROL`, and
//!   `EXC_RETURN`.
//! - **Tick source** — SysTick in tickful mode, derived from
//!   [`SysTickOptions::SYSTICK_CLOCK_HZ`].
//! - **Service calls** — an SVCall-based shim through which unprivileged
//!   threads reach the kernel when
//!   [`KernelOptions::privileged_threads`] is off.
//!
//! [`KernelOptions::privileged_threads`]: tern_kernel::KernelOptions
#![no_std]

/// The `Port` implementation.
#[doc(hidden)]
pub mod threading {
    pub mod cfg;
    #[cfg(target_os = "none")]
    pub mod imp;
}

/// The SysTick-based tick source.
#[doc(hidden)]
pub mod systick {
    pub mod cfg;
    #[cfg(target_os = "none")]
    pub mod imp;
}

/// The SVCall-based service-call shim.
#[doc(hidden)]
pub mod svc {
    pub mod cfg;
    #[cfg(target_os = "none")]
    pub mod imp;
}

pub use self::{svc::cfg::*, systick::cfg::*, threading::cfg::*};

/// Used by `use_port!`
#[doc(hidden)]
pub use tern_kernel;

/// Used by `use_port!`
#[doc(hidden)]
#[cfg(target_os = "none")]
pub use cortex_m;
