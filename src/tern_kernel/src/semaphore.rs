//! Semaphores
use core::fmt;

use crate::{
    csec::{self, CpuLockCell, CpuLockGuard},
    ctx,
    error::{AcquireError, CreateError, DeleteError, NoExistError, QueryError, SignalError},
    thread, timeout,
    utils::{Init, ObjectMagic},
    wait::{WaitPayload, WaitQueue},
    KernelTraits, Port, Ticks, NO_WAIT, WAIT_FOREVER,
};

/// Unsigned integer type representing a semaphore value.
pub type SemaphoreValue = u32;

/// *Semaphore control block* — the state data of a semaphore.
/// Caller-provided `'static` storage; [`create`] initializes it in place.
pub struct SemaphoreCb<Traits: Port> {
    magic: CpuLockCell<Traits, ObjectMagic>,

    value: CpuLockCell<Traits, SemaphoreValue>,
    max_value: CpuLockCell<Traits, SemaphoreValue>,

    wait_queue: WaitQueue<Traits>,
}

impl<Traits: Port> Init for SemaphoreCb<Traits> {
    const INIT: Self = Self {
        magic: Init::INIT,
        value: Init::INIT,
        max_value: Init::INIT,
        wait_queue: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for SemaphoreCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SemaphoreCb")
            .field("self", &(self as *const _))
            .field("value", &self.value)
            .field("max_value", &self.max_value)
            .finish_non_exhaustive()
    }
}

fn semaphore_cb_check<Traits: Port>(
    lock: &mut CpuLockGuard<Traits>,
    sem: &SemaphoreCb<Traits>,
) -> Result<(), NoExistError> {
    if *sem.magic.read(&**lock) != ObjectMagic::SEMAPHORE {
        Err(NoExistError::NoExist)
    } else {
        Ok(())
    }
}

/// Initialize a semaphore with the given initial and maximum values.
pub fn create<Traits: KernelTraits>(
    sem: &'static SemaphoreCb<Traits>,
    initial: SemaphoreValue,
    max_value: SemaphoreValue,
) -> Result<(), CreateError> {
    if Traits::is_interrupt_context() {
        return Err(CreateError::BadContext);
    }
    let mut lock = csec::lock_cpu::<Traits>()?;

    if *sem.magic.read(&*lock) == ObjectMagic::SEMAPHORE {
        return Err(CreateError::BadState);
    }
    if max_value == 0 || initial > max_value {
        return Err(CreateError::BadParam);
    }

    sem.value.replace(&mut *lock, initial);
    sem.max_value.replace(&mut *lock, max_value);
    sem.magic.replace(&mut *lock, ObjectMagic::SEMAPHORE);
    Ok(())
}

/// Invalidate a semaphore, releasing all waiters with
/// [`ResultCode::Deleted`].
///
/// [`ResultCode::Deleted`]: crate::ResultCode::Deleted
pub fn delete<Traits: KernelTraits>(
    sem: &'static SemaphoreCb<Traits>,
) -> Result<(), DeleteError> {
    if Traits::is_interrupt_context() {
        return Err(DeleteError::BadContext);
    }
    let mut lock = csec::lock_cpu::<Traits>()?;
    semaphore_cb_check(&mut lock, sem)?;

    sem.wait_queue.wake_up_all_deleted(&mut lock);
    sem.magic.replace(&mut *lock, ObjectMagic::NONE);

    thread::unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Check if the current state of a semaphore, `value`, satisfies the
/// acquire condition. If so, update `value` and return `true`.
#[inline]
fn poll_core(value: &mut SemaphoreValue) -> bool {
    if *value > 0 {
        *value -= 1;
        true
    } else {
        false
    }
}

/// Acquire one permit.
///
/// `timeout` may be [`NO_WAIT`] (poll), a tick count, or [`WAIT_FOREVER`].
pub fn acquire<Traits: KernelTraits>(
    sem: &'static SemaphoreCb<Traits>,
    timeout: Ticks,
) -> Result<(), AcquireError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    semaphore_cb_check(&mut lock, sem)?;

    if poll_core(sem.value.write(&mut *lock)) {
        return Ok(());
    }

    if timeout == NO_WAIT {
        return Err(AcquireError::Timeout);
    }

    ctx::expect_waitable_context::<Traits>()?;

    // The wake-upper is responsible for completing the effect of the
    // acquire operation (it doesn't increment `value` when handing a permit
    // to a waiter)
    if timeout == WAIT_FOREVER {
        sem.wait_queue.wait(&mut lock, WaitPayload::Semaphore)?;
    } else {
        timeout::check_duration(timeout)?;
        sem.wait_queue
            .wait_timeout(&mut lock, WaitPayload::Semaphore, timeout)?;
    }

    Ok(())
}

/// Release one permit.
///
/// If a thread is waiting, the permit is handed to the head waiter and the
/// semaphore value is left untouched; otherwise the value is incremented,
/// failing with [`ResultCode::Overflow`] at the maximum.
///
/// [`ResultCode::Overflow`]: crate::ResultCode::Overflow
pub fn release<Traits: KernelTraits>(
    sem: &'static SemaphoreCb<Traits>,
) -> Result<(), SignalError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    semaphore_cb_check(&mut lock, sem)?;

    if sem.wait_queue.wake_up_one(&mut lock) {
        thread::unlock_cpu_and_check_preemption(lock);
        return Ok(());
    }

    let value = *sem.value.read(&*lock);
    if value >= *sem.max_value.read(&*lock) {
        return Err(SignalError::Overflow);
    }
    sem.value.replace(&mut *lock, value + 1);
    Ok(())
}

/// Read the current semaphore value.
pub fn value<Traits: KernelTraits>(
    sem: &'static SemaphoreCb<Traits>,
) -> Result<SemaphoreValue, QueryError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    semaphore_cb_check(&mut lock, sem)?;
    Ok(*sem.value.read(&*lock))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_core_decrements() {
        let mut v = 2;
        assert!(poll_core(&mut v));
        assert!(poll_core(&mut v));
        assert_eq!(v, 0);
        assert!(!poll_core(&mut v));
        assert_eq!(v, 0);
    }
}
