//! Kernel state locking.
//!
//! Every piece of kernel-shared state lives in a [`CpuLockCell`], which can
//! only be read or written while holding [`CpuLockToken`]. The token is
//! materialized by entering the CPU Lock state (interrupts masked up to the
//! kernel threshold, [`Port::enter_cpu_lock`]), so possession of the token
//! *is* the proof of being inside the kernel's one coarse critical section.
//!
//! [`Port::enter_cpu_lock`]: crate::Port::enter_cpu_lock
use core::{fmt, marker::PhantomData, ops};

use crate::{error::BadContextError, utils::Init, Port};

/// The key that "unlocks" every [`CpuLockCell`] belonging to the kernel
/// instance `Traits`.
#[non_exhaustive]
pub(crate) struct CpuLockToken<Traits> {
    _phantom: PhantomData<Traits>,
}

impl<Traits> CpuLockToken<Traits> {
    /// Materialize a token out of thin air.
    ///
    /// # Safety
    ///
    /// The CPU Lock state must be active, and no [`CpuLockGuard`] may be
    /// borrowed anywhere else at the point of the call.
    pub(crate) unsafe fn assume() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

/// The keyhole type for [`tokenlock::TokenLock`] matching [`CpuLockToken`].
pub(crate) struct CpuLockKeyhole<Traits> {
    _phantom: PhantomData<Traits>,
}

impl<Traits> Clone for CpuLockKeyhole<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits> Copy for CpuLockKeyhole<Traits> {}

impl<Traits> fmt::Debug for CpuLockKeyhole<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CpuLockKeyhole").finish()
    }
}

// Safety: `CpuLockToken` can only be obtained through `assume`, whose
// contract guarantees there is at most one live token per kernel instance at
// any point in time.
unsafe impl<Traits> tokenlock::Token<CpuLockKeyhole<Traits>> for CpuLockToken<Traits> {
    fn eq_id(&self, _: &CpuLockKeyhole<Traits>) -> bool {
        true
    }
}

impl<Traits> Init for CpuLockKeyhole<Traits> {
    const INIT: Self = Self {
        _phantom: PhantomData,
    };
}

/// Cell type whose contents are protected by the CPU Lock.
pub(crate) struct CpuLockCell<Traits, T: ?Sized>(
    tokenlock::TokenLock<T, CpuLockKeyhole<Traits>>,
);

impl<Traits, T> CpuLockCell<Traits, T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(tokenlock::TokenLock::new(CpuLockKeyhole::INIT, x))
    }
}

impl<Traits: Port, T: fmt::Debug> fmt::Debug for CpuLockCell<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Ok(lock) = lock_cpu::<Traits>() {
            f.debug_tuple("CpuLockCell").field(self.0.read(&*lock)).finish()
        } else {
            write!(f, "CpuLockCell(< locked >)")
        }
    }
}

impl<Traits, T: Init> Init for CpuLockCell<Traits, T> {
    const INIT: Self = Self(Init::INIT);
}

impl<Traits, T> ops::Deref for CpuLockCell<Traits, T> {
    type Target = tokenlock::TokenLock<T, CpuLockKeyhole<Traits>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<Traits, T> ops::DerefMut for CpuLockCell<Traits, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Return `Err(BadContext)` if the CPU Lock is already active.
pub(crate) fn expect_cpu_lock_inactive<Traits: Port>() -> Result<(), BadContextError> {
    if Traits::is_cpu_lock_active() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// Attempt to enter the CPU Lock state and get an RAII guard. Return
/// `BadContext` if the CPU Lock is already active, meaning the caller is an
/// interrupt handler that interrupted the kernel, or application code that
/// has masked interrupts on its own.
pub(crate) fn lock_cpu<Traits: Port>() -> Result<CpuLockGuard<Traits>, BadContextError> {
    expect_cpu_lock_inactive::<Traits>()?;

    // Safety: CPU Lock is currently inactive, and it's us (the kernel) who
    // are going to control the CPU Lock state
    unsafe {
        Traits::enter_cpu_lock();
    }

    // Safety: We just entered the CPU Lock state
    Ok(unsafe { assume_cpu_lock() })
}

/// Assume the CPU Lock state is active and get a `CpuLockGuard`.
///
/// # Safety
///
/// The CPU Lock state must really be active, and there must be no other
/// live `CpuLockGuard` for this kernel instance.
pub(crate) unsafe fn assume_cpu_lock<Traits: Port>() -> CpuLockGuard<Traits> {
    debug_assert!(Traits::is_cpu_lock_active());

    CpuLockGuard {
        token: unsafe { CpuLockToken::assume() },
    }
}

/// RAII guard for the CPU Lock state. [`CpuLockToken`] is borrowed from this
/// type by `Deref`.
pub(crate) struct CpuLockGuard<Traits: Port> {
    token: CpuLockToken<Traits>,
}

impl<Traits: Port> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: CPU Lock is currently active, and it's us (the kernel) who
        // are currently controlling the CPU Lock state
        unsafe {
            Traits::leave_cpu_lock();
        }
    }
}

impl<Traits: Port> CpuLockGuard<Traits> {
    /// Relinquish the CPU Lock without running the usual preemption check.
    /// Used on code paths where the port is about to take over (dispatch,
    /// boot) and `leave_cpu_lock` must not run.
    pub(crate) fn forget(self) {
        core::mem::forget(self);
    }
}

impl<Traits: Port> ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: Port> ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}
