//! The wait/wake protocol shared by every blocking primitive.
//!
//! A blocking operation constructs a [`Wait`] object *on the waiting
//! thread's stack*, links it into the object's FIFO wait queue, and parks
//! the thread. Whoever ends the wait — a counterparty satisfying the
//! condition, the timer thread expiring the timeout, a forced release, or
//! the object being deleted — unlinks the wait object, writes the wait
//! result into the thread's result slot, and makes the thread runnable
//! again. Because the `Wait` only lives for the duration of the blocking
//! call, a payload embedded in it is a natural communication channel
//! between waker and waiter (handed-off pool blocks, received queue
//! entries, the event-flag pattern observed at wake time).
use core::{cell::Cell, fmt, ptr::NonNull};

use crate::{
    csec::{CpuLockCell, CpuLockGuard, CpuLockToken},
    error::{BadStateError, WaitError},
    event_flags::{FlagsPattern, FlagsWaitMode},
    mutex, thread,
    thread::{ThreadCb, ThreadSt},
    timeout,
    utils::{list, list::Link, Init},
    KernelTraits, Port, Ticks,
};

/// A reference to a [`Wait`].
pub(crate) struct WaitRef<Traits: Port>(pub(crate) NonNull<Wait<Traits>>);

// Safety: `Wait` objects live on the stack of a thread that stays blocked
// (and thus keeps the containing frame alive) for as long as the object is
// reachable through a queue or a thread's `current_wait`. Access is
// serialized by the CPU Lock.
unsafe impl<Traits: Port> Send for WaitRef<Traits> {}
unsafe impl<Traits: Port> Sync for WaitRef<Traits> {}

impl<Traits: Port> Clone for WaitRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: Port> Copy for WaitRef<Traits> {}

impl<Traits: Port> PartialEq for WaitRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<Traits: Port> Eq for WaitRef<Traits> {}

impl<Traits: Port> fmt::Debug for WaitRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("WaitRef").field(&self.0).finish()
    }
}

impl<Traits: Port> list::ListNode<Traits> for WaitRef<Traits> {
    #[inline]
    fn link(&self) -> &CpuLockCell<Traits, Option<Link<Self>>> {
        // Safety: See the safety note on the `Send`/`Sync` impls
        &unsafe { self.0.as_ref() }.link
    }
}

/// *A wait object*, describing *which thread* is waiting on *what
/// condition*.
///
/// Constructed by [`WaitQueue::wait`] (or [`wait_no_queue`]) on a waiting
/// thread's stack; only survives until the blocking call returns. A `Wait`
/// can therefore only expire when its thread is not waiting anymore.
pub(crate) struct Wait<Traits: Port> {
    /// The thread that is waiting for something.
    thread: &'static ThreadCb<Traits>,

    /// Forms the linked list headed by `WaitQueue::waits`.
    link: CpuLockCell<Traits, Option<Link<WaitRef<Traits>>>>,

    /// The containing wait queue, or `None` for a sleep-style wait.
    wait_queue: Option<&'static WaitQueue<Traits>>,

    payload: WaitPayload<Traits>,
}

/// Primitive-specific information carried by a [`Wait`].
pub(crate) enum WaitPayload<Traits: Port> {
    Sleep,
    Semaphore,
    EventFlags {
        pattern: FlagsPattern,
        mode: FlagsWaitMode,
        /// The whole pattern observed when the predicate matched, written
        /// by the waker.
        orig: CpuLockCell<Traits, Cell<FlagsPattern>>,
    },
    Mutex {
        mutex: &'static mutex::MutexCb<Traits>,
        ceiling: bool,
    },
    PoolBlock {
        /// A directly handed-off block, written by the waker.
        slot: CpuLockCell<Traits, Cell<*mut u8>>,
    },
    DataQueueSend {
        data: *mut (),
        to_head: bool,
    },
    DataQueueRecv {
        /// The received entry, written by the waker.
        slot: CpuLockCell<Traits, Cell<*mut ()>>,
    },
    MsgQueueSend {
        msg: *const u8,
        len: usize,
        disposition: crate::msg_queue::MsgDisposition,
    },
    MsgQueueRecv {
        buf: *mut u8,
        cap: usize,
    },
}

/// A tag identifying why a thread is blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    Sleep,
    Semaphore,
    EventFlags,
    MutexInherit,
    MutexCeiling,
    Pool,
    DataQueueSend,
    DataQueueRecv,
    MsgQueueSend,
    MsgQueueRecv,
}

impl<Traits: Port> WaitPayload<Traits> {
    fn reason(&self) -> WaitReason {
        match self {
            Self::Sleep => WaitReason::Sleep,
            Self::Semaphore => WaitReason::Semaphore,
            Self::EventFlags { .. } => WaitReason::EventFlags,
            Self::Mutex { ceiling: false, .. } => WaitReason::MutexInherit,
            Self::Mutex { ceiling: true, .. } => WaitReason::MutexCeiling,
            Self::PoolBlock { .. } => WaitReason::Pool,
            Self::DataQueueSend { .. } => WaitReason::DataQueueSend,
            Self::DataQueueRecv { .. } => WaitReason::DataQueueRecv,
            Self::MsgQueueSend { .. } => WaitReason::MsgQueueSend,
            Self::MsgQueueRecv { .. } => WaitReason::MsgQueueRecv,
        }
    }
}

/// A FIFO of wait objects blocked on a particular waitable object. Owned by
/// that object's control block.
pub(crate) struct WaitQueue<Traits: Port> {
    /// All elements of this linked list are valid: a `Wait` is never
    /// dropped while it's still linked here.
    waits: CpuLockCell<Traits, list::ListHead<WaitRef<Traits>>>,
}

impl<Traits: Port> Init for WaitQueue<Traits> {
    const INIT: Self = Self { waits: Init::INIT };
}

/// The wait state stored in a thread control block.
pub(crate) struct ThreadWait<Traits: Port> {
    /// The wait object describing the ongoing wait of the thread. `Some`
    /// iff the thread is in the Waiting or WaitingSuspended state.
    current_wait: CpuLockCell<Traits, Option<WaitRef<Traits>>>,

    /// Why the thread is blocked. Tracks `current_wait`.
    reason: CpuLockCell<Traits, Option<WaitReason>>,

    /// The result of the last wait operation, written by the waker and read
    /// by the unblocked thread after it resumes.
    wait_result: CpuLockCell<Traits, Result<(), WaitError>>,
}

impl<Traits: Port> Init for ThreadWait<Traits> {
    const INIT: Self = Self {
        current_wait: Init::INIT,
        reason: Init::INIT,
        wait_result: CpuLockCell::new(Ok(())),
    };
}

impl<Traits: Port> ThreadWait<Traits> {
    pub(crate) fn reset(&self, lock: &mut CpuLockGuard<Traits>) {
        self.current_wait.replace(&mut **lock, None);
        self.reason.replace(&mut **lock, None);
        self.wait_result.replace(&mut **lock, Ok(()));
    }

    pub(crate) fn reason(&self, lock: &mut CpuLockGuard<Traits>) -> Option<WaitReason> {
        *self.reason.read(&**lock)
    }
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    /// Insert a wait object pertaining to the currently running thread into
    /// `self`, transitioning the thread into the Waiting state for an
    /// unbounded wait.
    ///
    /// The current context must be waitable (this function doesn't check
    /// that); the caller should have used `expect_waitable_context`.
    pub(crate) fn wait(
        &'static self,
        lock: &mut CpuLockGuard<Traits>,
        payload: WaitPayload<Traits>,
    ) -> Result<WaitPayload<Traits>, WaitError> {
        let thread = thread::running_thread_unchecked(lock);
        let wait = Wait {
            thread,
            link: CpuLockCell::new(None),
            wait_queue: Some(self),
            payload,
        };

        wait_inner(lock, &wait)?;

        Ok(wait.payload)
    }

    /// Like [`Self::wait`], but the wait expires with
    /// [`WaitError::Timeout`] after `duration` ticks.
    ///
    /// `duration` must be neither `0` nor [`WAIT_FOREVER`]
    /// (`crate::WAIT_FOREVER`) and must have been validated with
    /// [`timeout::check_duration`].
    pub(crate) fn wait_timeout(
        &'static self,
        lock: &mut CpuLockGuard<Traits>,
        payload: WaitPayload<Traits>,
        duration: Ticks,
    ) -> Result<WaitPayload<Traits>, WaitError> {
        let thread = thread::running_thread_unchecked(lock);
        let wait = Wait {
            thread,
            link: CpuLockCell::new(None),
            wait_queue: Some(self),
            payload,
        };

        // Arm the thread's embedded timer event. Every path out of the wait
        // cancels it, so it can't fire once the wait is over.
        timeout::insert_timeout_after(lock, timeout::static_pin(&thread.timeout), duration);

        wait_inner(lock, &wait)?;

        Ok(wait.payload)
    }

    /// Get the thread at the head of the queue without waking it.
    pub(crate) fn first_waiting_thread(
        &self,
        lock: &mut CpuLockGuard<Traits>,
    ) -> Option<&'static ThreadCb<Traits>> {
        let wait_ref = self.waits.read(&**lock).first?;
        // Safety: `wait_ref` is linked, so the pointee is valid
        Some(unsafe { wait_ref.0.as_ref() }.thread)
    }

    /// Access the head wait object's payload, e.g. to write a handed-off
    /// value right before calling [`Self::wake_up_one`].
    pub(crate) fn with_first_wait_payload<R>(
        &self,
        lock: &mut CpuLockGuard<Traits>,
        f: impl FnOnce(Option<&WaitPayload<Traits>>, &CpuLockToken<Traits>) -> R,
    ) -> R {
        let wait_ref = self.waits.read(&**lock).first;
        // Safety: `wait_ref` is linked, so the pointee is valid
        let payload = wait_ref.map(|r| &unsafe { &*r.0.as_ptr() }.payload);
        f(payload, &**lock)
    }

    /// Wake up the thread at the head of the queue with a successful wait
    /// result. Returns `true` if a thread was woken.
    ///
    /// This may make a thread Ready but doesn't yield the processor; the
    /// caller ends with `unlock_cpu_and_check_preemption`.
    pub(crate) fn wake_up_one(&self, lock: &mut CpuLockGuard<Traits>) -> bool {
        let Some(wait_ref) = list::pop_front(lock, &self.waits) else {
            return false;
        };

        // Safety: `wait_ref` was linked until just now, so the pointee is
        // valid
        let wait = unsafe { wait_ref.0.as_ref() };
        debug_assert!(core::ptr::eq(wait.wait_queue.unwrap(), self));

        complete_wait(lock, wait, Ok(()));

        true
    }

    /// Walk the queue head-to-tail, waking every wait object whose payload
    /// satisfies `cond`. The callback receives a shared token so it can
    /// update payload cells but cannot reenter the kernel.
    pub(crate) fn wake_up_all_conditional(
        &self,
        lock: &mut CpuLockGuard<Traits>,
        mut cond: impl FnMut(&WaitPayload<Traits>, &CpuLockToken<Traits>) -> bool,
    ) {
        let mut cursor = self.waits.read(&**lock).first;

        while let Some(wait_ref) = cursor {
            // Find the next wait object before possibly unlinking this one
            cursor = list::next(lock, wait_ref);

            // Safety: `wait_ref` is linked, so the pointee is valid
            let wait = unsafe { wait_ref.0.as_ref() };
            debug_assert!(core::ptr::eq(wait.wait_queue.unwrap(), self));

            if !cond(&wait.payload, &**lock) {
                continue;
            }

            list::remove(lock, &self.waits, wait_ref);
            complete_wait(lock, wait, Ok(()));
        }
    }

    /// Drain the queue, waking every waiter with [`WaitError::Deleted`].
    /// Called by object deletion before the control block's tag is cleared.
    pub(crate) fn wake_up_all_deleted(&self, lock: &mut CpuLockGuard<Traits>) {
        while let Some(wait_ref) = list::pop_front(lock, &self.waits) {
            // Safety: `wait_ref` was linked until just now
            let wait = unsafe { wait_ref.0.as_ref() };
            complete_wait(lock, wait, Err(WaitError::Deleted));
        }
    }

    /// The highest (numerically smallest) effective priority among the
    /// waiting threads. Used by the priority-inheritance protocol to
    /// compute what an owner's priority must cover.
    pub(crate) fn highest_waiter_priority(
        &self,
        lock: &mut CpuLockGuard<Traits>,
    ) -> Option<crate::Priority> {
        let mut highest = None;
        let mut cursor = self.waits.read(&**lock).first;

        while let Some(wait_ref) = cursor {
            // Safety: `wait_ref` is linked, so the pointee is valid
            let wait = unsafe { wait_ref.0.as_ref() };
            let pri = wait.thread.effective_priority_internal(lock);
            highest = Some(match highest {
                None => pri,
                Some(h) if pri < h => pri,
                Some(h) => h,
            });
            cursor = list::next(lock, wait_ref);
        }

        highest
    }
}

/// Create a wait object pertaining to the currently running thread but not
/// pertaining to any wait queue (a sleep). The only ways to end such a wait
/// are [`interrupt_thread`] and the timeout.
pub(crate) fn wait_no_queue<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    payload: WaitPayload<Traits>,
) -> Result<WaitPayload<Traits>, WaitError> {
    let thread = thread::running_thread_unchecked(lock);
    let wait = Wait {
        thread,
        link: CpuLockCell::new(None),
        wait_queue: None,
        payload,
    };

    wait_inner(lock, &wait)?;

    Ok(wait.payload)
}

/// [`wait_no_queue`] with a timeout.
pub(crate) fn wait_no_queue_timeout<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    payload: WaitPayload<Traits>,
    duration: Ticks,
) -> Result<WaitPayload<Traits>, WaitError> {
    let thread = thread::running_thread_unchecked(lock);
    let wait = Wait {
        thread,
        link: CpuLockCell::new(None),
        wait_queue: None,
        payload,
    };

    // Arm the thread's embedded timer event
    timeout::insert_timeout_after(lock, timeout::static_pin(&thread.timeout), duration);

    wait_inner(lock, &wait)?;

    Ok(wait.payload)
}

/// The core portion of the wait operations: link the wait object, park the
/// thread, and return the wait result once woken.
fn wait_inner<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    wait: &Wait<Traits>,
) -> Result<(), WaitError> {
    let thread = wait.thread;
    let wait_ref = WaitRef(NonNull::from(wait));

    debug_assert!(core::ptr::eq(
        thread,
        thread::running_thread_unchecked(lock)
    ));

    if let Some(wait_queue) = wait.wait_queue {
        // Wait queues are strictly FIFO; priority is enforced at the
        // ready-queue level, not here
        list::push_back(lock, &wait_queue.waits, wait_ref);
    }

    thread.wait.current_wait.replace(&mut **lock, Some(wait_ref));
    thread
        .wait
        .reason
        .replace(&mut **lock, Some(wait.payload.reason()));

    // Transition the thread into Waiting. This statement completes when the
    // thread is woken up.
    thread::wait_until_woken_up(lock);

    // The wake-upper must have detached the wait object
    debug_assert!(wait.link.read(&**lock).is_none());
    debug_assert!(thread.wait.current_wait.read(&**lock).is_none());

    *thread.wait.wait_result.read(&**lock)
}

/// Detach `wait` from its thread and make the thread runnable, delivering
/// `wait_result`.
///
/// Doesn't remove `wait` from its wait queue — the caller has already done
/// that. May make a thread Ready but doesn't yield the processor.
fn complete_wait<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    wait: &Wait<Traits>,
    wait_result: Result<(), WaitError>,
) {
    let thread = wait.thread;

    debug_assert_eq!(
        *thread.wait.current_wait.read(&**lock),
        Some(WaitRef(NonNull::from(wait)))
    );
    thread.wait.current_wait.replace(&mut **lock, None);
    thread.wait.reason.replace(&mut **lock, None);
    thread.wait.wait_result.replace(&mut **lock, wait_result);

    // Cancel the thread's timer event unconditionally (a no-op if the wait
    // had no timeout or the event already fired)
    timeout::remove_timeout(lock, &thread.timeout);

    match thread::state_of(lock, thread) {
        ThreadSt::Waiting => {
            // Safety: The thread was Waiting, so its context is valid and
            // it's on no ready list
            unsafe { thread::make_ready(lock, thread) };
        }
        ThreadSt::WaitingSuspended => {
            // The wait is over, but the thread stays out of the ready queue
            // until `resume`
            thread::set_state(lock, thread, ThreadSt::Suspended);
        }
        _ => unreachable!("completed a wait of a thread that wasn't waiting"),
    }
}

/// Interrupt the ongoing wait operation of `thread`, delivering
/// `wait_result`. Returns `Err(BadState)` if the thread is not waiting.
///
/// This is the single path used by timeout expiry ([`WaitError::Timeout`]),
/// forced release ([`WaitError::Released`]), and the kernel-internal wakes
/// of the timer thread (`Ok(())`).
pub(crate) fn interrupt_thread<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    thread: &'static ThreadCb<Traits>,
    wait_result: Result<(), WaitError>,
) -> Result<(), BadStateError> {
    match thread::state_of(lock, thread) {
        ThreadSt::Waiting | ThreadSt::WaitingSuspended => {
            // The thread is waiting, so `current_wait` must be `Some`
            let wait_ref = (*thread.wait.current_wait.read(&**lock)).unwrap();

            // Safety: `current_wait` always points to a live `Wait`
            let wait = unsafe { wait_ref.0.as_ref() };

            if let Some(wait_queue) = wait.wait_queue {
                list::remove(lock, &wait_queue.waits, wait_ref);
            }

            complete_wait(lock, wait, wait_result);

            Ok(())
        }
        _ => Err(BadStateError::BadState),
    }
}

/// Access the payload of the wait operation `thread` is currently blocked
/// in, without letting the reference escape.
pub(crate) fn with_current_wait_payload<Traits: KernelTraits, R>(
    lock: &mut CpuLockGuard<Traits>,
    thread: &ThreadCb<Traits>,
    f: impl FnOnce(Option<&WaitPayload<Traits>>) -> R,
) -> R {
    let wait_ref = *thread.wait.current_wait.read(&**lock);

    // Safety: `current_wait` always points to a live `Wait`
    let payload = wait_ref.map(|r| &unsafe { &*r.0.as_ptr() }.payload);

    f(payload)
}

/// The callback of the timer event embedded in every thread control block:
/// interrupt the thread's ongoing wait with [`WaitError::Timeout`].
pub(crate) fn timeout_expire_handler<Traits: KernelTraits>(
    param: usize,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    // Safety: `param` was derived from a `&'static ThreadCb` when the
    // thread was created
    let thread = unsafe { &*(param as *const ThreadCb<Traits>) };

    // The thread may have been woken between the tick and this call;
    // `BadState` means there's nothing left to do
    match interrupt_thread(&mut lock, thread, Err(WaitError::Timeout)) {
        Ok(()) | Err(BadStateError::BadState) => {}
    }

    lock
}

/// Abort the ongoing wait operation of `thread` without waking it. Used by
/// thread termination, where the thread's control block is about to return
/// to the dormant state.
pub(crate) fn cancel_wait<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    if let Some(wait_ref) = *thread.wait.current_wait.read(&**lock) {
        // Safety: `current_wait` always points to a live `Wait`
        let wait = unsafe { wait_ref.0.as_ref() };

        if let Some(wait_queue) = wait.wait_queue {
            list::remove(lock, &wait_queue.waits, wait_ref);
        }
        thread.wait.reset(lock);
    }

    timeout::remove_timeout(lock, &thread.timeout);
}
