//! Mutexes
//!
//! A mutex can use one of two protocols to bound priority inversion:
//!
//! - **Priority inheritance** ([`MutexAttr::INHERIT`]): when a
//!   higher-priority thread blocks on the mutex, the owner's effective
//!   priority is raised to the waiter's, transitively along a chain of
//!   blocked owners.
//! - **Priority ceiling** ([`MutexAttr::CEILING`]): the owner's effective
//!   priority is raised to the mutex's ceiling on acquisition. A thread
//!   whose base priority precedes the ceiling may not acquire the mutex.
//!
//! The two protocols are mutually exclusive per mutex. A plain mutex (no
//! protocol bits) is a simple binary lock. Independently, a mutex can be
//! recursive (the owner may re-lock it, with matching unlocks) and robust
//! (termination of the owner releases it and marks it inconsistent, which
//! the next owner observes as [`ResultCode::Abandoned`] until
//! [`mark_consistent`]).
//!
//! [`ResultCode::Abandoned`]: crate::ResultCode::Abandoned
use core::fmt;

use crate::{
    csec::{self, CpuLockCell, CpuLockGuard},
    ctx,
    error::{
        CreateError, DeleteError, LockError, MarkConsistentError, NoExistError, QueryError,
        UnlockError,
    },
    thread,
    thread::{ThreadCb, ThreadSt},
    timeout,
    utils::{Init, ObjectMagic},
    wait::{WaitPayload, WaitQueue},
    KernelTraits, Port, Priority, Ticks, IDLE_THREAD_PRIORITY, NO_WAIT, WAIT_FOREVER,
};

bitflags::bitflags! {
    /// Mutex attributes.
    pub struct MutexAttr: u32 {
        /// Priority-inheritance protocol.
        const INHERIT = 1 << 0;
        /// Priority-ceiling protocol. Mutually exclusive with `INHERIT`.
        const CEILING = 1 << 1;
        /// The owner may re-lock the mutex; a per-mutex depth counter is
        /// maintained and matching unlocks are required.
        const RECURSIVE = 1 << 2;
        /// Termination of the owner releases the mutex to the next waiter
        /// and marks it inconsistent.
        const ROBUST = 1 << 3;
    }
}

impl Init for MutexAttr {
    const INIT: Self = Self::empty();
}

/// *Mutex control block* — the state data of a mutex. Caller-provided
/// `'static` storage; [`create`] initializes it in place.
pub struct MutexCb<Traits: Port> {
    magic: CpuLockCell<Traits, ObjectMagic>,

    attr: CpuLockCell<Traits, MutexAttr>,

    /// The ceiling priority (meaningful iff `CEILING` is set).
    ceiling: CpuLockCell<Traits, Priority>,

    /// The recursion depth. Zero iff the mutex is free.
    count: CpuLockCell<Traits, u32>,

    /// Set when a robust owner terminated while holding the mutex; cleared
    /// by [`mark_consistent`].
    inconsistent: CpuLockCell<Traits, bool>,

    /// The thread that currently owns the lock.
    owning_thread: CpuLockCell<Traits, Option<&'static ThreadCb<Traits>>>,

    /// The next element in the singly linked list headed by
    /// `ThreadCb::last_mutex_held`, containing all mutexes currently held
    /// by the owning thread.
    prev_mutex_held: CpuLockCell<Traits, Option<&'static Self>>,

    wait_queue: WaitQueue<Traits>,
}

impl<Traits: Port> Init for MutexCb<Traits> {
    const INIT: Self = Self {
        magic: Init::INIT,
        attr: Init::INIT,
        ceiling: Init::INIT,
        count: Init::INIT,
        inconsistent: Init::INIT,
        owning_thread: Init::INIT,
        prev_mutex_held: Init::INIT,
        wait_queue: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for MutexCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutexCb")
            .field("self", &(self as *const _))
            .field("attr", &self.attr)
            .field("ceiling", &self.ceiling)
            .field("count", &self.count)
            .field("inconsistent", &self.inconsistent)
            .finish_non_exhaustive()
    }
}

fn mutex_cb_check<Traits: Port>(
    lock: &mut CpuLockGuard<Traits>,
    mutex: &MutexCb<Traits>,
) -> Result<(), NoExistError> {
    if *mutex.magic.read(&**lock) != ObjectMagic::MUTEX {
        Err(NoExistError::NoExist)
    } else {
        Ok(())
    }
}

/// Initialize a mutex.
///
/// `ceiling` is only meaningful with [`MutexAttr::CEILING`] and must lie in
/// the application priority range.
pub fn create<Traits: KernelTraits>(
    mutex: &'static MutexCb<Traits>,
    attr: MutexAttr,
    ceiling: Priority,
) -> Result<(), CreateError> {
    if Traits::is_interrupt_context() {
        return Err(CreateError::BadContext);
    }
    let mut lock = csec::lock_cpu::<Traits>()?;

    if *mutex.magic.read(&*lock) == ObjectMagic::MUTEX {
        return Err(CreateError::BadState);
    }
    if attr.contains(MutexAttr::INHERIT | MutexAttr::CEILING) {
        return Err(CreateError::BadParam);
    }
    if attr.contains(MutexAttr::CEILING) && (ceiling < 1 || ceiling >= IDLE_THREAD_PRIORITY) {
        return Err(CreateError::BadParam);
    }

    mutex.attr.replace(&mut *lock, attr);
    mutex.ceiling.replace(&mut *lock, ceiling);
    mutex.count.replace(&mut *lock, 0);
    mutex.inconsistent.replace(&mut *lock, false);
    mutex.owning_thread.replace(&mut *lock, None);
    mutex.prev_mutex_held.replace(&mut *lock, None);
    mutex.magic.replace(&mut *lock, ObjectMagic::MUTEX);
    Ok(())
}

/// Invalidate a mutex, releasing all waiters with
/// [`ResultCode::Deleted`]. If the mutex is currently owned, the owner's
/// effective priority is recomputed as if it had unlocked it.
///
/// [`ResultCode::Deleted`]: crate::ResultCode::Deleted
pub fn delete<Traits: KernelTraits>(mutex: &'static MutexCb<Traits>) -> Result<(), DeleteError> {
    if Traits::is_interrupt_context() {
        return Err(DeleteError::BadContext);
    }
    let mut lock = csec::lock_cpu::<Traits>()?;
    mutex_cb_check(&mut lock, mutex)?;

    if let Some(owner) = *mutex.owning_thread.read(&*lock) {
        unlink_held_mutex(&mut lock, owner, mutex);
        mutex.owning_thread.replace(&mut *lock, None);
        mutex.count.replace(&mut *lock, 0);
        restore_thread_priority(&mut lock, owner);
    }

    mutex.wait_queue.wake_up_all_deleted(&mut lock);
    mutex.magic.replace(&mut *lock, ObjectMagic::NONE);

    thread::unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Give the ownership of the mutex to `thread` (which must be Running, or
/// Waiting in the case of a hand-off) and apply the ceiling protocol.
fn lock_core<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    mutex: &'static MutexCb<Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    debug_assert!(matches!(
        thread::state_of(lock, thread),
        ThreadSt::Running | ThreadSt::Waiting | ThreadSt::WaitingSuspended
    ));

    mutex.owning_thread.replace(&mut **lock, Some(thread));
    mutex.count.replace(&mut **lock, 1);

    // Push `mutex` onto the list of mutexes held by `thread`
    let prev_mutex_held = thread.last_mutex_held.replace(&mut **lock, Some(mutex));
    mutex.prev_mutex_held.replace(&mut **lock, prev_mutex_held);

    if mutex.attr.read(&**lock).contains(MutexAttr::CEILING) {
        let ceiling = *mutex.ceiling.read(&**lock);
        let effective = thread.effective_priority_internal(lock);
        if ceiling < effective {
            thread.set_effective_priority_internal(lock, ceiling);
            thread::position_for_new_priority(lock, thread, effective);
        }
    }
}

/// Acquire the mutex.
///
/// `timeout` may be [`NO_WAIT`] (poll), a tick count, or [`WAIT_FOREVER`].
pub fn lock<Traits: KernelTraits>(
    mutex: &'static MutexCb<Traits>,
    timeout: Ticks,
) -> Result<(), LockError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    ctx::expect_task_context::<Traits>()?;
    mutex_cb_check(&mut lock, mutex)?;

    let caller = thread::running_thread_unchecked(&mut lock);
    let attr = *mutex.attr.read(&*lock);
    let owner = *mutex.owning_thread.read(&*lock);

    if let Some(owner) = owner {
        if core::ptr::eq(owner, caller) {
            return if attr.contains(MutexAttr::RECURSIVE) {
                let count = *mutex.count.read(&*lock);
                mutex.count.replace(&mut *lock, count + 1);
                Ok(())
            } else {
                Err(LockError::IllegalUse)
            };
        }
    }

    if attr.contains(MutexAttr::CEILING)
        && caller.base_priority_internal(&mut lock) < *mutex.ceiling.read(&*lock)
    {
        // The caller's base priority precedes the ceiling; admitting it
        // would break the protocol's bound
        return Err(LockError::IllegalUse);
    }

    match owner {
        None => {
            lock_core(&mut lock, mutex, caller);
        }
        Some(owner) => {
            if timeout == NO_WAIT {
                return Err(LockError::Timeout);
            }
            ctx::expect_waitable_context::<Traits>()?;

            if attr.contains(MutexAttr::INHERIT) {
                let caller_pri = caller.effective_priority_internal(&mut lock);
                raise_priority_inherit(&mut lock, owner, caller_pri);
            }

            let payload = WaitPayload::Mutex {
                mutex,
                ceiling: attr.contains(MutexAttr::CEILING),
            };

            // On success the unlocking thread has already transferred the
            // ownership to this thread (see `unlock_core`)
            if timeout == WAIT_FOREVER {
                mutex.wait_queue.wait(&mut lock, payload)?;
            } else {
                timeout::check_duration(timeout)?;
                mutex.wait_queue.wait_timeout(&mut lock, payload, timeout)?;
            }

            debug_assert!(core::ptr::eq(
                (*mutex.owning_thread.read(&*lock)).unwrap(),
                caller
            ));
        }
    }

    if *mutex.inconsistent.read(&*lock) {
        Err(LockError::Abandoned)
    } else {
        Ok(())
    }
}

/// Release the mutex.
///
/// The caller must be the owner. For a recursive mutex the depth counter is
/// decremented and the mutex is only released when it reaches zero.
pub fn unlock<Traits: KernelTraits>(mutex: &'static MutexCb<Traits>) -> Result<(), UnlockError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    ctx::expect_task_context::<Traits>()?;
    mutex_cb_check(&mut lock, mutex)?;

    let caller = thread::running_thread_unchecked(&mut lock);

    match *mutex.owning_thread.read(&*lock) {
        Some(owner) if core::ptr::eq(owner, caller) => {}
        _ => return Err(UnlockError::BadState),
    }

    let count = *mutex.count.read(&*lock);
    debug_assert!(count >= 1);
    if count > 1 {
        mutex.count.replace(&mut *lock, count - 1);
        return Ok(());
    }

    unlink_held_mutex(&mut lock, caller, mutex);

    // Lower the caller's effective priority to what the remaining held
    // mutexes require. This may cause preemption.
    restore_thread_priority(&mut lock, caller);

    // Hand the ownership to the next waiter, if any
    unlock_core(&mut lock, mutex);

    thread::unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Clear the inconsistency mark left by a terminated robust owner.
pub fn mark_consistent<Traits: KernelTraits>(
    mutex: &'static MutexCb<Traits>,
) -> Result<(), MarkConsistentError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    mutex_cb_check(&mut lock, mutex)?;

    if mutex.inconsistent.replace(&mut *lock, false) {
        Ok(())
    } else {
        Err(MarkConsistentError::BadState)
    }
}

/// Return a flag indicating whether the mutex is currently owned.
pub fn is_locked<Traits: KernelTraits>(
    mutex: &'static MutexCb<Traits>,
) -> Result<bool, QueryError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    mutex_cb_check(&mut lock, mutex)?;
    Ok(mutex.owning_thread.read(&*lock).is_some())
}

// Internals shared with the thread module
// ---------------------------------------------------------------------------

/// Remove `mutex` from `thread`'s held-mutex list. The list is singly
/// linked, so the predecessor is found by walking from the head.
fn unlink_held_mutex<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    thread: &'static ThreadCb<Traits>,
    mutex: &'static MutexCb<Traits>,
) {
    let next = *mutex.prev_mutex_held.read(&**lock);

    let head = *thread.last_mutex_held.read(&**lock);
    match head {
        Some(m) if core::ptr::eq(m, mutex) => {
            thread.last_mutex_held.replace(&mut **lock, next);
        }
        mut cursor => {
            while let Some(m) = cursor {
                let prev = *m.prev_mutex_held.read(&**lock);
                if let Some(p) = prev {
                    if core::ptr::eq(p, mutex) {
                        m.prev_mutex_held.replace(&mut **lock, next);
                        break;
                    }
                }
                cursor = prev;
            }
        }
    }

    mutex.prev_mutex_held.replace(&mut **lock, None);
}

/// Hand the mutex to the head waiter, or mark it free. Doesn't touch the
/// previous owner's state.
fn unlock_core<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    mutex: &'static MutexCb<Traits>,
) {
    if let Some(next_owner) = mutex.wait_queue.first_waiting_thread(lock) {
        lock_core(lock, mutex, next_owner);
        let woke = mutex.wait_queue.wake_up_one(lock);
        debug_assert!(woke);
    } else {
        mutex.owning_thread.replace(&mut **lock, None);
        mutex.count.replace(&mut **lock, 0);
    }
}

/// Recompute and apply `thread`'s effective priority from its base priority
/// and the locking protocols of every mutex it still holds.
fn restore_thread_priority<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    let base = thread.base_priority_internal(lock);
    let new_effective = evaluate_effective_priority(lock, thread, base);
    let old_effective = thread.effective_priority_internal(lock);

    if new_effective != old_effective {
        thread.set_effective_priority_internal(lock, new_effective);
        thread::position_for_new_priority(lock, thread, old_effective);
    }
}

/// Compute the effective priority `thread` must have, given the base
/// priority `base` and every held mutex: the ceiling of each held
/// ceiling-protocol mutex, and the highest waiter priority of each held
/// inheritance-protocol mutex.
pub(crate) fn evaluate_effective_priority<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    thread: &'static ThreadCb<Traits>,
    base: Priority,
) -> Priority {
    let mut effective = base;

    let mut maybe_mutex = *thread.last_mutex_held.read(&**lock);
    while let Some(mutex) = maybe_mutex {
        let attr = *mutex.attr.read(&**lock);
        if attr.contains(MutexAttr::CEILING) {
            effective = effective.min(*mutex.ceiling.read(&**lock));
        } else if attr.contains(MutexAttr::INHERIT) {
            if let Some(pri) = mutex.wait_queue.highest_waiter_priority(lock) {
                effective = effective.min(pri);
            }
        }
        maybe_mutex = *mutex.prev_mutex_held.read(&**lock);
    }

    effective
}

/// Check whether raising `thread`'s base priority to `new_base` is
/// compatible with the ceiling protocol of every held or currently
/// contended mutex.
pub(crate) fn held_mutexes_allow_base_priority<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    thread: &'static ThreadCb<Traits>,
    new_base: Priority,
) -> bool {
    let mut maybe_mutex = *thread.last_mutex_held.read(&**lock);
    while let Some(mutex) = maybe_mutex {
        if mutex.attr.read(&**lock).contains(MutexAttr::CEILING)
            && new_base < *mutex.ceiling.read(&**lock)
        {
            return false;
        }
        maybe_mutex = *mutex.prev_mutex_held.read(&**lock);
    }

    // The mutex the thread is currently blocked on, if any
    let contended = crate::wait::with_current_wait_payload(lock, thread, |payload| {
        match payload {
            Some(WaitPayload::Mutex { mutex, .. }) => Some(*mutex),
            _ => None,
        }
    });
    if let Some(mutex) = contended {
        if mutex.attr.read(&**lock).contains(MutexAttr::CEILING)
            && new_base < *mutex.ceiling.read(&**lock)
        {
            return false;
        }
    }

    true
}

/// Transitive priority inheritance: raise `thread`'s effective priority to
/// `pri` and, if `thread` is itself blocked on an inheritance-protocol
/// mutex, propagate to that mutex's owner, and so on.
///
/// Expressed as a loop rather than recursion. The walk terminates because
/// each step either reaches a thread that is already at least as high, or
/// strictly raises the priority of the examined thread and moves one step
/// along an acyclic ownership chain.
pub(crate) fn raise_priority_inherit<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    thread: &'static ThreadCb<Traits>,
    pri: Priority,
) {
    let mut thread = thread;

    loop {
        let effective = thread.effective_priority_internal(lock);
        if effective <= pri {
            return;
        }

        match thread::state_of(lock, thread) {
            ThreadSt::Ready | ThreadSt::Running => {
                thread.set_effective_priority_internal(lock, pri);
                thread::position_for_new_priority(lock, thread, effective);
                return;
            }
            ThreadSt::Waiting | ThreadSt::WaitingSuspended => {
                // Wait queues are FIFO; only the priority value changes
                thread.set_effective_priority_internal(lock, pri);

                let next = crate::wait::with_current_wait_payload(lock, thread, |payload| {
                    match payload {
                        Some(WaitPayload::Mutex {
                            mutex,
                            ceiling: false,
                        }) => Some(*mutex),
                        _ => None,
                    }
                });

                let Some(mutex) = next else { return };
                let Some(owner) = *mutex.owning_thread.read(&**lock) else {
                    return;
                };
                thread = owner;
            }
            ThreadSt::Suspended => {
                thread.set_effective_priority_internal(lock, pri);
                return;
            }
            ThreadSt::Dormant => return,
        }
    }
}

/// Release every mutex held by `thread`, which is exiting or being
/// terminated. Robust mutexes are marked inconsistent so the next owner
/// learns of the abandonment; the others are handed over silently.
///
/// Doesn't restore `thread`'s effective priority (the control block is
/// about to be reset to dormant anyway). May make threads Ready but doesn't
/// yield the processor.
pub(crate) fn release_held_mutexes<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    let mut maybe_mutex = thread.last_mutex_held.replace(&mut **lock, None);
    while let Some(mutex) = maybe_mutex {
        maybe_mutex = mutex.prev_mutex_held.replace(&mut **lock, None);

        if mutex.attr.read(&**lock).contains(MutexAttr::ROBUST) {
            mutex.inconsistent.replace(&mut **lock, true);
        }

        unlock_core(lock, mutex);
    }
}
