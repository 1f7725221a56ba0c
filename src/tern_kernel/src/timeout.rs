//! Timed events and the kernel clock.
//!
//! All time-dependent behavior — sleeps, timed waits, alarms, cyclic timers
//! — is driven by one time-sorted list of [`Timeout`] objects, keyed by
//! absolute tick. Insertion is O(N) in the number of pending events, which
//! is acceptable for the bounded workloads this kernel targets; everything
//! else is O(1).
//!
//! The tick counter wraps around. Two ticks are comparable as long as they
//! are less than half the counter range apart, which the timeout admission
//! check guarantees.
//!
//! A `Timeout` registered with [`insert_timeout`] must stay at the same
//! memory location until unregistered; that's why the insertion functions
//! take `Pin<&Timeout>`. Sleeps and timed waits use the timer event
//! embedded in the thread control block; alarms and cyclic timers embed
//! theirs in the timer control block. Both are `'static`, and every path
//! that ends a wait cancels the event before the thread resumes.
use core::{marker::PhantomPinned, pin::Pin, ptr::NonNull};

use crate::{
    csec::{CpuLockCell, CpuLockGuard},
    error::BadParamError,
    utils::{list, list::Link, Init},
    KernelTraits, Port, Ticks, WAIT_FOREVER,
};

/// The maximum relative timeout accepted by the kernel. Chosen so that a
/// pending timeout can never be mistaken for an already-expired one under
/// wrapping comparison.
pub(crate) const MAX_TIMEOUT: Ticks = Ticks::MAX / 2;

/// Return `true` if tick `a` is before tick `b` (wrapping comparison).
#[inline]
pub(crate) fn time_before(a: Ticks, b: Ticks) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Return `true` if tick `a` is at or before tick `b` (wrapping comparison).
#[inline]
pub(crate) fn time_before_eq(a: Ticks, b: Ticks) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// Validate a relative timeout supplied by the application. `0` and
/// [`WAIT_FOREVER`] have dedicated meanings and must be screened out by the
/// caller beforehand.
#[inline]
pub(crate) fn check_duration(duration: Ticks) -> Result<(), BadParamError> {
    debug_assert!(duration != 0 && duration != WAIT_FOREVER);
    if duration > MAX_TIMEOUT {
        Err(BadParamError::BadParam)
    } else {
        Ok(())
    }
}

/// The signature of a timeout callback.
///
/// The callback is invoked by the timer thread with the CPU Lock held and
/// must return the lock (it may relinquish and re-acquire it in between,
/// e.g. to run an application-supplied function outside the critical
/// section).
pub(crate) type TimeoutFn<Traits> = fn(usize, CpuLockGuard<Traits>) -> CpuLockGuard<Traits>;

/// A timed event: an (absolute tick, callback, parameter) tuple that can be
/// linked into the kernel's timer list.
pub(crate) struct Timeout<Traits: Port> {
    /// The absolute tick at which this event fires.
    at: CpuLockCell<Traits, Ticks>,

    /// Callback function, invoked in the timer thread.
    callback: CpuLockCell<Traits, TimeoutFn<Traits>>,

    /// Parameter given to the callback function.
    param: CpuLockCell<Traits, usize>,

    /// Forms the kernel's timer list. `None` iff the event is not pending.
    link: CpuLockCell<Traits, Option<Link<TimeoutRef<Traits>>>>,

    _pin: PhantomPinned,
}

/// A reference to a [`Timeout`].
pub(crate) struct TimeoutRef<Traits: Port>(NonNull<Timeout<Traits>>);

// Safety: The pointees are `'static`, embedded in thread or timer control
// blocks. Access is serialized by the CPU Lock.
unsafe impl<Traits: Port> Send for TimeoutRef<Traits> {}
unsafe impl<Traits: Port> Sync for TimeoutRef<Traits> {}

impl<Traits: Port> Clone for TimeoutRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: Port> Copy for TimeoutRef<Traits> {}

impl<Traits: Port> PartialEq for TimeoutRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<Traits: Port> Eq for TimeoutRef<Traits> {}

impl<Traits: Port> list::ListNode<Traits> for TimeoutRef<Traits> {
    #[inline]
    fn link(&self) -> &CpuLockCell<Traits, Option<Link<Self>>> {
        // Safety: See the safety note on the `Send`/`Sync` impls
        &unsafe { self.0.as_ref() }.link
    }
}

impl<Traits: Port> Timeout<Traits> {
    pub(crate) const fn new(callback: TimeoutFn<Traits>, param: usize) -> Self {
        Self {
            at: CpuLockCell::new(0),
            callback: CpuLockCell::new(callback),
            param: CpuLockCell::new(param),
            link: CpuLockCell::new(None),
            _pin: PhantomPinned,
        }
    }

    /// Replace the callback and parameter. Illegal while linked.
    pub(crate) fn set_callback(
        &self,
        lock: &mut CpuLockGuard<Traits>,
        callback: TimeoutFn<Traits>,
        param: usize,
    ) {
        debug_assert!(!self.is_linked(lock));
        self.callback.replace(&mut **lock, callback);
        self.param.replace(&mut **lock, param);
    }

    #[inline]
    pub(crate) fn at(&self, lock: &mut CpuLockGuard<Traits>) -> Ticks {
        *self.at.read(&**lock)
    }

    /// Set the expiration to an absolute tick. Illegal while linked.
    pub(crate) fn set_expiration_at(&self, lock: &mut CpuLockGuard<Traits>, at: Ticks) {
        debug_assert!(!self.is_linked(lock));
        self.at.replace(&mut **lock, at);
    }

    #[inline]
    pub(crate) fn is_linked(&self, lock: &mut CpuLockGuard<Traits>) -> bool {
        self.link.read(&**lock).is_some()
    }
}

impl<Traits: Port> Init for Timeout<Traits> {
    const INIT: Self = Self::new(unreachable_timeout_handler, 0);
}

fn unreachable_timeout_handler<Traits: Port>(
    _: usize,
    _: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    unreachable!("fired a timeout that was never armed")
}

/// Pin a `'static` reference. A `static` never moves, so this is sound.
#[inline]
pub(crate) fn static_pin<T>(x: &'static T) -> Pin<&'static T> {
    // Safety: The pointee is `'static` and therefore never moves
    unsafe { Pin::new_unchecked(x) }
}

/// Register `timeout` to fire `duration` ticks from now.
///
/// `duration` must have been validated with [`check_duration`].
pub(crate) fn insert_timeout_after<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    timeout: Pin<&Timeout<Traits>>,
    duration: Ticks,
) {
    let now = *Traits::state().tick.read(&**lock);
    timeout.set_expiration_at(lock, now.wrapping_add(duration));
    insert_timeout(lock, timeout);
}

/// Link `timeout` into the timer list at the position dictated by its
/// expiration tick. Events with an identical tick preserve registration
/// order.
pub(crate) fn insert_timeout<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    timeout: Pin<&Timeout<Traits>>,
) {
    let timeout = timeout.get_ref();
    let at = *timeout.at.read(&**lock);
    let timeout_ref = TimeoutRef(NonNull::from(timeout));

    // O(N) walk for the first pending event scheduled strictly later
    let head = &Traits::state().timer_list;
    let mut cursor = head.read(&**lock).first;
    while let Some(cur) = cursor {
        // Safety: `cur` is on the timer list, so the pointee is valid
        let cur_at = *unsafe { cur.0.as_ref() }.at.read(&**lock);
        if time_before(at, cur_at) {
            break;
        }
        cursor = list::next(lock, cur);
    }

    list::insert_before(lock, head, timeout_ref, cursor);
}

/// Unlink `timeout` from the timer list. A no-op if it is not pending;
/// cancellation paths call this unconditionally.
pub(crate) fn remove_timeout<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    timeout: &Timeout<Traits>,
) {
    list::remove(
        lock,
        &Traits::state().timer_list,
        TimeoutRef(NonNull::from(timeout)),
    );
}

/// If the head of the timer list is due (`at <= now`), unlink it and return
/// its callback and parameter.
pub(crate) fn pop_due_timeout<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
) -> Option<(TimeoutFn<Traits>, usize)> {
    let now = *Traits::state().tick.read(&**lock);
    let head = &Traits::state().timer_list;
    let first = head.read(&**lock).first?;

    // Safety: `first` is on the timer list, so the pointee is valid
    let timeout = unsafe { first.0.as_ref() };
    if !time_before_eq(*timeout.at.read(&**lock), now) {
        return None;
    }

    list::remove(lock, head, first);
    Some((*timeout.callback.read(&**lock), *timeout.param.read(&**lock)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_order() {
        assert!(time_before(1, 2));
        assert!(!time_before(2, 1));
        assert!(time_before(Ticks::MAX, 0));
        assert!(time_before(Ticks::MAX - 10, 5));
        assert!(time_before_eq(7, 7));
        assert!(!time_before(7, 7));
    }

    // Comparability only holds for ticks less than half the counter range
    // apart, which `check_duration` enforces for every admitted timeout.
    #[quickcheck_macros::quickcheck]
    fn wrapping_order_within_range(a: u32, d: u32) -> bool {
        let d = d % MAX_TIMEOUT + 1;
        let b = a.wrapping_add(d);
        time_before(a, b) && !time_before(b, a) && !time_before_eq(b, a)
    }
}
