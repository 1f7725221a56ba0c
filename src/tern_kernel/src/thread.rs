//! Threads and the dispatcher.
//!
//! A thread in the Ready or Running state occupies the ready list of its
//! effective priority; the dispatcher always runs the head of the
//! highest-precedence non-empty list. Within a priority level threads run
//! in FIFO order, optionally rotated round-robin by the tick handler.
use core::{convert::Infallible, fmt, ptr::NonNull};

use crate::{
    csec::{self, CpuLockCell, CpuLockGuard, CpuLockToken},
    ctx,
    error::{
        ActivateThreadError, CreateThreadError, DeleteThreadError, ExitThreadError,
        QueryThreadError, ReleaseWaitError, ResumeThreadError, SetPriorityError, SleepError,
        SuspendThreadError, TerminateThreadError, WaitError, WakeupError,
    },
    mutex, timeout,
    utils::{list, list::Link, Init, ObjectMagic, StackRegion},
    wait, KernelPhase, KernelTraits, Port, Priority, Ticks, IDLE_THREAD_PRIORITY,
    PRIORITY_LEVELS, TIMER_THREAD_PRIORITY, WAIT_FOREVER,
};

pub(crate) mod readyqueue;

/// The byte pattern stacks are filled with when
/// [`stack_fill`](crate::KernelOptions::stack_fill) is enabled.
pub const STACK_FILL_BYTE: u8 = 0xa5;

bitflags::bitflags! {
    /// Thread creation options.
    pub struct ThreadOptions: u32 {
        /// Make the thread Ready immediately instead of leaving it Dormant.
        const START = 1 << 0;
    }
}

impl Init for ThreadOptions {
    const INIT: Self = Self::empty();
}

/// Thread state machine.
#[doc = svgbobdoc::transform!(
/// ```svgbob
///                activate                dispatch
///   Dormant ----------------> Ready <---------------> Running
///      ^                      ^   ^                    |  |
///      |          wake, timeout,   \          suspend /   | block,
///      | terminate,     release     \                v    | sleep
///      | exit              \         \ resume   Suspended |
///      |                    \         \              ^    v
///      +-- (any active)      +------ Waiting ---------+- Waiting
///                                       \    suspend /
///                                        v          v
///                                       WaitingSuspended
/// ```
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadSt {
    /// Created (or terminated) but not activated.
    Dormant,
    /// On a ready list, not running.
    Ready,
    /// The thread whose context is live on the CPU. Still occupies its
    /// ready list.
    Running,
    /// Blocked in a kernel primitive.
    Waiting,
    /// Suspended by [`suspend`]; off the ready lists.
    Suspended,
    /// Suspended while blocked; the wait continues, but completion leads to
    /// Suspended instead of Ready.
    WaitingSuspended,
}

impl Init for ThreadSt {
    const INIT: Self = Self::Dormant;
}

/// The static properties of a thread, fixed at creation.
#[derive(Debug, Clone, Copy)]
pub struct ThreadAttr {
    /// The entry point.
    pub entry: fn(usize),
    /// The parameter supplied to `entry`.
    pub param: usize,
    /// The stack region.
    pub stack: StackRegion,
    /// The base priority.
    pub priority: Priority,
    pub options: ThreadOptions,
}

fn unreachable_entry(_: usize) {
    unreachable!("entered a thread that was never created")
}

impl Init for ThreadAttr {
    const INIT: Self = Self {
        entry: unreachable_entry,
        param: 0,
        stack: StackRegion::null(),
        priority: IDLE_THREAD_PRIORITY,
        options: ThreadOptions::empty(),
    };
}

/// *Thread control block* — the state data of a thread. Caller-provided
/// `'static` storage; [`create`] initializes it in place.
#[repr(C)]
pub struct ThreadCb<Traits: Port> {
    /// The port-defined context area (saved stack pointer and friends).
    ///
    /// Guaranteed to be placed at the beginning of the struct so that
    /// assembly code can refer to it easily.
    pub port_thread_state: Traits::PortThreadState,

    pub(crate) magic: CpuLockCell<Traits, ObjectMagic>,

    attr: CpuLockCell<Traits, ThreadAttr>,

    /// The base priority. Immutable except through [`set_priority`].
    base_priority: CpuLockCell<Traits, Priority>,

    /// The effective priority: `base_priority`, possibly raised by the
    /// locking protocol of a held or contended mutex. Determines the
    /// thread's position in the ready queue.
    effective_priority: CpuLockCell<Traits, Priority>,

    st: CpuLockCell<Traits, ThreadSt>,

    /// Links the thread into the ready list of its effective priority.
    link: CpuLockCell<Traits, Option<Link<ThreadRef<Traits>>>>,

    /// The wait state.
    pub(crate) wait: wait::ThreadWait<Traits>,

    /// The timer event used by sleeps and timed waits.
    pub(crate) timeout: timeout::Timeout<Traits>,

    /// The most recently locked mutex still held by this thread. Heads the
    /// singly linked list of held mutexes.
    pub(crate) last_mutex_held: CpuLockCell<Traits, Option<&'static mutex::MutexCb<Traits>>>,

    /// Accumulated ticks spent in the Running state.
    run_time: CpuLockCell<Traits, u32>,

    /// Ticks consumed of the current round-robin slice.
    slice_count: CpuLockCell<Traits, Ticks>,
}

impl<Traits: Port> Init for ThreadCb<Traits> {
    const INIT: Self = Self {
        port_thread_state: Init::INIT,
        magic: CpuLockCell::new(ObjectMagic::NONE),
        attr: Init::INIT,
        base_priority: Init::INIT,
        effective_priority: Init::INIT,
        st: Init::INIT,
        link: Init::INIT,
        wait: Init::INIT,
        timeout: Init::INIT,
        last_mutex_held: Init::INIT,
        run_time: Init::INIT,
        slice_count: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for ThreadCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadCb")
            .field("self", &(self as *const _))
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("st", &self.st)
            .field("run_time", &self.run_time)
            .finish_non_exhaustive()
    }
}

impl<Traits: Port> ThreadCb<Traits> {
    /// Read the thread's creation attributes.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active, and the kernel must not be concurrently
    /// mutating this control block (true at every port call site).
    pub unsafe fn attr(&self) -> ThreadAttr {
        // Safety: Upheld by the caller
        let token = unsafe { CpuLockToken::<Traits>::assume() };
        *self.attr.read(&token)
    }

    #[inline]
    pub(crate) fn effective_priority_internal(&self, lock: &mut CpuLockGuard<Traits>) -> Priority {
        *self.effective_priority.read(&**lock)
    }

    #[inline]
    pub(crate) fn base_priority_internal(&self, lock: &mut CpuLockGuard<Traits>) -> Priority {
        *self.base_priority.read(&**lock)
    }

    pub(crate) fn set_effective_priority_internal(
        &self,
        lock: &mut CpuLockGuard<Traits>,
        pri: Priority,
    ) {
        self.effective_priority.replace(&mut **lock, pri);
    }
}

/// A reference to a [`ThreadCb`], comparable by address.
pub(crate) struct ThreadRef<Traits: Port>(NonNull<ThreadCb<Traits>>);

// Safety: The pointees are `'static` control blocks; access is serialized
// by the CPU Lock.
unsafe impl<Traits: Port> Send for ThreadRef<Traits> {}
unsafe impl<Traits: Port> Sync for ThreadRef<Traits> {}

impl<Traits: Port> Clone for ThreadRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: Port> Copy for ThreadRef<Traits> {}

impl<Traits: Port> PartialEq for ThreadRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<Traits: Port> Eq for ThreadRef<Traits> {}

impl<Traits: Port> From<&'static ThreadCb<Traits>> for ThreadRef<Traits> {
    fn from(x: &'static ThreadCb<Traits>) -> Self {
        Self(NonNull::from(x))
    }
}

impl<Traits: Port> ThreadRef<Traits> {
    #[inline]
    pub(crate) fn get(self) -> &'static ThreadCb<Traits> {
        // Safety: `ThreadRef` is only constructed from `'static` references
        unsafe { self.0.as_ref() }
    }
}

impl<Traits: Port> list::ListNode<Traits> for ThreadRef<Traits> {
    #[inline]
    fn link(&self) -> &CpuLockCell<Traits, Option<Link<Self>>> {
        &self.get().link
    }
}

// Kernel-internal state transitions
// ---------------------------------------------------------------------------

/// Get the currently running thread. Panics if there is none (only possible
/// before the scheduler is live, when no caller may reach this).
pub(crate) fn running_thread_unchecked<Traits: KernelTraits>(
    _lock: &mut CpuLockGuard<Traits>,
) -> &'static ThreadCb<Traits> {
    Traits::state().running_thread().unwrap()
}

#[inline]
pub(crate) fn state_of<Traits: Port>(
    lock: &mut CpuLockGuard<Traits>,
    thread: &ThreadCb<Traits>,
) -> ThreadSt {
    *thread.st.read(&**lock)
}

#[inline]
pub(crate) fn set_state<Traits: Port>(
    lock: &mut CpuLockGuard<Traits>,
    thread: &ThreadCb<Traits>,
    st: ThreadSt,
) {
    thread.st.replace(&mut **lock, st);
}

/// Transition `thread` into the Ready state and insert it into the ready
/// queue. Doesn't yield the processor.
///
/// # Safety
///
/// The thread must not be on any ready list, and its execution context must
/// be valid (initialized and not currently live on the CPU).
pub(crate) unsafe fn make_ready<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    set_state(lock, thread, ThreadSt::Ready);

    // Safety: `thread` is not in the ready queue
    unsafe {
        Traits::state().ready_queue.push_back_thread(lock, thread);
    }
}

/// Determine the next thread to run and store it in the running-thread
/// slot.
///
/// The next thread is the head of the highest-precedence non-empty ready
/// list; the idle thread guarantees there is one once the scheduler is
/// live.
pub(crate) fn choose_next_running_thread<Traits: KernelTraits>(lock: &mut CpuLockGuard<Traits>) {
    let prev = Traits::state().running_thread();
    let next = Traits::state().ready_queue.front(lock);

    let prev_ptr = prev.map_or(core::ptr::null(), |p| p as *const ThreadCb<Traits>);
    let next_ptr = next.map_or(core::ptr::null(), |p| p as *const ThreadCb<Traits>);

    if prev_ptr == next_ptr {
        return;
    }

    if let Some(next) = next {
        debug_assert_eq!(state_of(lock, next), ThreadSt::Ready);
        set_state(lock, next, ThreadSt::Running);
    }

    // `prev` loses the control of the processor. If it's still Running, it
    // was preempted and goes back to Ready (it never left its ready list).
    if let Some(prev) = prev {
        if state_of(lock, prev) == ThreadSt::Running {
            set_state(lock, prev, ThreadSt::Ready);
        }
    }

    Traits::state().set_running_thread(lock, next);
}

/// Park the current thread's underlying context until the dispatcher picks
/// this thread again. The thread must already have been transitioned out of
/// the Running state (and off the ready queue, unless Ready).
pub(crate) fn park_current_context<Traits: KernelTraits>(lock: &mut CpuLockGuard<Traits>) {
    let thread = running_thread_unchecked(lock);

    loop {
        // Temporarily release the CPU Lock before calling `yield_cpu`.
        // Safety: (1) We don't access resources protected by the CPU Lock
        //         in this window. (2) We currently have the CPU Lock.
        //         (3) We re-acquire it before touching kernel state again.
        unsafe { Traits::leave_cpu_lock() };

        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };

        unsafe { Traits::enter_cpu_lock() };

        if state_of(lock, thread) == ThreadSt::Running {
            break;
        }
    }
}

/// Transition the currently running thread into the Waiting state. Returns
/// when woken up.
///
/// The current context must be waitable (this function doesn't check that).
pub(crate) fn wait_until_woken_up<Traits: KernelTraits>(lock: &mut CpuLockGuard<Traits>) {
    let thread = running_thread_unchecked(lock);
    debug_assert_eq!(state_of(lock, thread), ThreadSt::Running);

    let pri = thread.effective_priority_internal(lock);
    Traits::state().ready_queue.remove_thread(lock, thread, pri);
    set_state(lock, thread, ThreadSt::Waiting);

    park_current_context(lock);
}

/// Relinquish the CPU Lock. After that, if there's a thread preceding the
/// currently running one in the ready queue, yield the processor.
///
/// System services that make a thread Ready call this before returning to
/// the caller.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) {
    if *Traits::state().phase.read(&*lock) != KernelPhase::Running {
        return;
    }

    let prev_priority = match Traits::state().running_thread() {
        Some(running) if state_of(&mut lock, running) == ThreadSt::Running => {
            running.effective_priority_internal(&mut lock)
        }
        _ => usize::MAX,
    };

    let has_preempting_thread = match prev_priority {
        usize::MAX => Traits::state().ready_queue.front_priority(&mut lock).is_some(),
        pri => Traits::state().ready_queue.has_thread_preceding(&mut lock, pri),
    };

    // Relinquish the CPU Lock
    drop(lock);

    if has_preempting_thread {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Per-tick scheduler bookkeeping: charge the running thread's time counter
/// and perform the round-robin rotation.
pub(crate) fn tick_accounting<Traits: KernelTraits>(lock: &mut CpuLockGuard<Traits>) {
    let Some(running) = Traits::state().running_thread() else {
        return;
    };

    let t = *running.run_time.read(&**lock);
    running.run_time.replace(&mut **lock, t.wrapping_add(1));

    let pri = running.effective_priority_internal(lock);
    let slice = Traits::state().options.read(&**lock).round_robin_slices[pri];
    if slice == 0 {
        return;
    }

    let used = *running.slice_count.read(&**lock) + 1;
    if used >= slice {
        running.slice_count.replace(&mut **lock, 0);
        // Move the running thread (the head of its list) to the tail. The
        // next dispatch switches to the new head.
        Traits::state().ready_queue.rotate(lock, pri);
    } else {
        running.slice_count.replace(&mut **lock, used);
    }
}

/// Re-evaluate the position of `thread` after its effective priority
/// changed from `old_pri`.
pub(crate) fn position_for_new_priority<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    thread: &'static ThreadCb<Traits>,
    old_pri: Priority,
) {
    match state_of(lock, thread) {
        ThreadSt::Ready | ThreadSt::Running => {
            Traits::state().ready_queue.requeue_thread(lock, thread, old_pri);
        }
        // Wait queues are FIFO; a blocked thread's position doesn't depend
        // on its priority
        _ => {}
    }
}

fn reset_to_dormant<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    let attr = *thread.attr.read(&**lock);
    set_state(lock, thread, ThreadSt::Dormant);
    thread.base_priority.replace(&mut **lock, attr.priority);
    thread.effective_priority.replace(&mut **lock, attr.priority);
    thread.wait.reset(lock);
    thread.slice_count.replace(&mut **lock, 0);
    debug_assert!(thread.last_mutex_held.read(&**lock).is_none());
}

// Object access helpers
// ---------------------------------------------------------------------------

fn thread_cb_check<Traits: Port>(
    lock: &mut CpuLockGuard<Traits>,
    thread: &ThreadCb<Traits>,
) -> Result<(), crate::error::NoExistError> {
    if *thread.magic.read(&**lock) != ObjectMagic::THREAD {
        Err(crate::error::NoExistError::NoExist)
    } else {
        Ok(())
    }
}

// Public operations
// ---------------------------------------------------------------------------

/// Initialize a thread control block.
///
/// The priority must lie in the application range
/// `1..PRIORITY_LEVELS - 1`; the stack must be non-empty and aligned to
/// [`Port::STACK_ALIGN`]. With [`ThreadOptions::START`] the thread becomes
/// Ready immediately; otherwise it stays Dormant until [`activate`].
///
/// Callable from the boot hook and from task context.
pub fn create<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
    attr: &ThreadAttr,
) -> Result<(), CreateThreadError> {
    if Traits::is_interrupt_context() {
        return Err(CreateThreadError::BadContext);
    }
    let mut lock = csec::lock_cpu::<Traits>()?;

    if *Traits::state().phase.read(&*lock) == KernelPhase::Inactive {
        return Err(CreateThreadError::BadContext);
    }

    if attr.priority < 1 || attr.priority >= IDLE_THREAD_PRIORITY {
        return Err(CreateThreadError::BadParam);
    }

    create_inner(&mut lock, thread, attr)?;

    if attr.options.contains(ThreadOptions::START) {
        // Safety: The thread was just initialized and is Dormant
        unsafe { Traits::initialize_thread_state(thread) };
        // Safety: Dormant, context just initialized
        unsafe { make_ready(&mut lock, thread) };
        unlock_cpu_and_check_preemption(lock);
    }

    Ok(())
}

/// The attribute checks and field initialization shared with the kernel's
/// own threads (which are exempt from the priority-range restriction).
pub(crate) fn create_inner<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    thread: &'static ThreadCb<Traits>,
    attr: &ThreadAttr,
) -> Result<(), CreateThreadError> {
    if *thread.magic.read(&**lock) == ObjectMagic::THREAD {
        return Err(CreateThreadError::BadState);
    }

    if attr.stack.is_empty()
        || attr.stack.as_ptr() as usize % Traits::STACK_ALIGN != 0
        || attr.stack.len() % Traits::STACK_ALIGN != 0
        || attr.priority >= PRIORITY_LEVELS
    {
        return Err(CreateThreadError::BadParam);
    }

    if Traits::state().options.read(&**lock).stack_fill {
        // Safety: The region is valid per the `StackRegion` contract, and
        // the thread isn't running yet
        unsafe {
            core::ptr::write_bytes(attr.stack.as_ptr(), STACK_FILL_BYTE, attr.stack.len());
        }
    }

    thread.attr.replace(&mut **lock, *attr);
    thread.base_priority.replace(&mut **lock, attr.priority);
    thread.effective_priority.replace(&mut **lock, attr.priority);
    set_state(lock, thread, ThreadSt::Dormant);
    thread.wait.reset(lock);
    thread.run_time.replace(&mut **lock, 0);
    thread.slice_count.replace(&mut **lock, 0);
    thread.last_mutex_held.replace(&mut **lock, None);
    thread
        .timeout
        .set_callback(lock, wait::timeout_expire_handler::<Traits>, thread as *const _ as usize);
    thread.magic.replace(&mut **lock, ObjectMagic::THREAD);

    Ok(())
}

/// Invalidate a dormant thread's control block.
pub fn delete<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<(), DeleteThreadError> {
    if Traits::is_interrupt_context() {
        return Err(DeleteThreadError::BadContext);
    }
    let mut lock = csec::lock_cpu::<Traits>()?;
    thread_cb_check(&mut lock, thread)?;

    if state_of(&mut lock, thread) != ThreadSt::Dormant {
        return Err(DeleteThreadError::BadState);
    }

    thread.magic.replace(&mut *lock, ObjectMagic::NONE);
    Ok(())
}

/// Transition a dormant thread into the Ready state.
pub fn activate<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<(), ActivateThreadError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    thread_cb_check(&mut lock, thread)?;

    if state_of(&mut lock, thread) != ThreadSt::Dormant {
        return Err(ActivateThreadError::Overflow);
    }

    let attr = *thread.attr.read(&*lock);
    thread.base_priority.replace(&mut *lock, attr.priority);
    thread.effective_priority.replace(&mut *lock, attr.priority);
    thread.run_time.replace(&mut *lock, 0);

    // Safety: CPU Lock active, the thread is Dormant
    unsafe { Traits::initialize_thread_state(thread) };

    // Safety: Dormant, context just initialized
    unsafe { make_ready(&mut lock, thread) };

    unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Terminate another thread, releasing the mutexes it holds and returning
/// its control block to the Dormant state.
///
/// Self-termination must use [`exit`].
pub fn terminate<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<(), TerminateThreadError> {
    ctx::expect_task_context::<Traits>()?;
    let mut lock = csec::lock_cpu::<Traits>()?;
    thread_cb_check(&mut lock, thread)?;

    if core::ptr::eq(thread, running_thread_unchecked(&mut lock)) {
        return Err(TerminateThreadError::IllegalUse);
    }

    match state_of(&mut lock, thread) {
        ThreadSt::Dormant => return Err(TerminateThreadError::BadState),
        ThreadSt::Waiting | ThreadSt::WaitingSuspended => {
            wait::cancel_wait(&mut lock, thread);
        }
        ThreadSt::Ready => {
            let pri = thread.effective_priority_internal(&mut lock);
            Traits::state().ready_queue.remove_thread(&mut lock, thread, pri);
        }
        ThreadSt::Suspended => {}
        // Only the caller can be Running, and it was screened out above
        ThreadSt::Running => unreachable!(),
    }

    mutex::release_held_mutexes(&mut lock, thread);
    reset_to_dormant(&mut lock, thread);

    // Releasing the mutexes may have readied a waiter
    unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Terminate the calling thread.
///
/// Returns only on error; on success the call never returns and the
/// processor proceeds to the next ready thread.
pub fn exit<Traits: KernelTraits>() -> Result<Infallible, ExitThreadError> {
    ctx::expect_task_context::<Traits>()?;

    // If the CPU Lock is active, the exit is performed anyway; the kernel
    // owns the lock state from here on
    let mut lock = match csec::lock_cpu::<Traits>() {
        Ok(lock) => lock,
        // Safety: CPU Lock is active; we take ownership of it
        Err(_) => unsafe { csec::assume_cpu_lock::<Traits>() },
    };

    let thread = running_thread_unchecked(&mut lock);

    mutex::release_held_mutexes(&mut lock, thread);

    let pri = thread.effective_priority_internal(&mut lock);
    Traits::state().ready_queue.remove_thread(&mut lock, thread, pri);
    reset_to_dormant(&mut lock, thread);

    Traits::state().set_running_thread(&mut lock, None);

    lock.forget();

    // Safety: CPU Lock active; the thread was removed from the
    // running-thread slot
    unsafe { Traits::exit_and_dispatch(thread) }
}

/// Put the calling thread to sleep for `duration` ticks, or until
/// [`wakeup`] or [`release_wait`], whichever comes first.
///
/// `duration` may be [`WAIT_FOREVER`] but not `0`.
pub fn sleep<Traits: KernelTraits>(duration: Ticks) -> Result<(), SleepError> {
    if duration == 0 {
        return Err(SleepError::BadParam);
    }
    let mut lock = csec::lock_cpu::<Traits>()?;
    ctx::expect_waitable_context::<Traits>()?;

    let result = if duration == WAIT_FOREVER {
        wait::wait_no_queue(&mut lock, wait::WaitPayload::Sleep)
    } else {
        timeout::check_duration(duration)?;
        wait::wait_no_queue_timeout(&mut lock, wait::WaitPayload::Sleep, duration)
    };

    match result {
        // Woken by `wakeup`, or the sleep ran its course
        Ok(_) => Ok(()),
        Err(WaitError::Timeout) => Ok(()),
        Err(WaitError::Released) => Err(SleepError::Released),
        Err(WaitError::Deleted) => unreachable!("sleep is not bound to an object"),
    }
}

/// End another thread's [`sleep`] early.
pub fn wakeup<Traits: KernelTraits>(thread: &'static ThreadCb<Traits>) -> Result<(), WakeupError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    thread_cb_check(&mut lock, thread)?;

    if thread.wait.reason(&mut lock) != Some(wait::WaitReason::Sleep) {
        return Err(WakeupError::BadState);
    }

    wait::interrupt_thread(&mut lock, thread, Ok(()))
        .unwrap_or_else(|_| unreachable!("a sleep reason implies a waiting state"));

    unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Forcibly release another thread from whatever wait it is blocked in.
/// The released wait fails with [`ResultCode::Released`].
///
/// [`ResultCode::Released`]: crate::ResultCode::Released
pub fn release_wait<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<(), ReleaseWaitError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    thread_cb_check(&mut lock, thread)?;

    wait::interrupt_thread(&mut lock, thread, Err(WaitError::Released))
        .map_err(|_| ReleaseWaitError::BadState)?;

    unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Suspend a thread. A waiting thread keeps waiting, but the completion of
/// its wait leaves it Suspended instead of Ready.
pub fn suspend<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<(), SuspendThreadError> {
    if Traits::is_interrupt_context() {
        return Err(SuspendThreadError::BadContext);
    }
    let mut lock = csec::lock_cpu::<Traits>()?;
    thread_cb_check(&mut lock, thread)?;

    match state_of(&mut lock, thread) {
        ThreadSt::Suspended | ThreadSt::WaitingSuspended => Err(SuspendThreadError::Overflow),
        ThreadSt::Dormant => Err(SuspendThreadError::BadState),
        ThreadSt::Waiting => {
            set_state(&mut lock, thread, ThreadSt::WaitingSuspended);
            Ok(())
        }
        ThreadSt::Ready => {
            let pri = thread.effective_priority_internal(&mut lock);
            Traits::state().ready_queue.remove_thread(&mut lock, thread, pri);
            set_state(&mut lock, thread, ThreadSt::Suspended);
            Ok(())
        }
        ThreadSt::Running => {
            // Self-suspension: park until `resume`
            ctx::expect_waitable_context::<Traits>()?;
            let pri = thread.effective_priority_internal(&mut lock);
            Traits::state().ready_queue.remove_thread(&mut lock, thread, pri);
            set_state(&mut lock, thread, ThreadSt::Suspended);
            park_current_context(&mut lock);
            Ok(())
        }
    }
}

/// Resume a suspended thread.
pub fn resume<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<(), ResumeThreadError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    thread_cb_check(&mut lock, thread)?;

    match state_of(&mut lock, thread) {
        ThreadSt::Suspended => {
            // Safety: A suspended thread is on no ready list and has a
            // valid context
            unsafe { make_ready(&mut lock, thread) };
            unlock_cpu_and_check_preemption(lock);
            Ok(())
        }
        ThreadSt::WaitingSuspended => {
            set_state(&mut lock, thread, ThreadSt::Waiting);
            Ok(())
        }
        _ => Err(ResumeThreadError::BadState),
    }
}

/// Change a thread's base priority. The effective priority is recalculated
/// according to the locking protocol of any held mutexes.
pub fn set_priority<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
    priority: Priority,
) -> Result<(), SetPriorityError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    thread_cb_check(&mut lock, thread)?;

    if priority < 1 || priority >= IDLE_THREAD_PRIORITY {
        return Err(SetPriorityError::BadParam);
    }

    if state_of(&mut lock, thread) == ThreadSt::Dormant {
        return Err(SetPriorityError::BadState);
    }

    let old_base = thread.base_priority_internal(&mut lock);
    if old_base == priority {
        return Ok(());
    }

    // Raising the priority must not break the ceiling protocol of any held
    // or contended mutex
    if priority < old_base
        && !mutex::held_mutexes_allow_base_priority(&mut lock, thread, priority)
    {
        return Err(SetPriorityError::BadParam);
    }

    thread.base_priority.replace(&mut *lock, priority);
    let old_effective = thread.effective_priority_internal(&mut lock);
    let new_effective = mutex::evaluate_effective_priority(&mut lock, thread, priority);

    if new_effective != old_effective {
        thread.effective_priority.replace(&mut *lock, new_effective);
        position_for_new_priority(&mut lock, thread, old_effective);
    }

    // Lowering the running thread's priority (or raising a ready one) may
    // warrant a context switch
    unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Read a thread's base priority.
pub fn priority<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<Priority, QueryThreadError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    thread_cb_check(&mut lock, thread)?;
    if state_of(&mut lock, thread) == ThreadSt::Dormant {
        return Err(QueryThreadError::BadState);
    }
    Ok(thread.base_priority_internal(&mut lock))
}

/// Read a thread's effective priority (base priority possibly raised by a
/// mutex locking protocol).
pub fn effective_priority<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<Priority, QueryThreadError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    thread_cb_check(&mut lock, thread)?;
    if state_of(&mut lock, thread) == ThreadSt::Dormant {
        return Err(QueryThreadError::BadState);
    }
    Ok(thread.effective_priority_internal(&mut lock))
}

/// Read the reason a thread is blocked, or `None` if it isn't.
pub fn wait_reason<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<Option<wait::WaitReason>, QueryThreadError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    thread_cb_check(&mut lock, thread)?;
    Ok(thread.wait.reason(&mut lock))
}

/// Read a thread's state.
pub fn state<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<ThreadSt, QueryThreadError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    thread_cb_check(&mut lock, thread)?;
    Ok(state_of(&mut lock, thread))
}

/// Read the number of ticks a thread has spent in the Running state.
pub fn run_time<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<u32, QueryThreadError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    thread_cb_check(&mut lock, thread)?;
    Ok(*thread.run_time.read(&*lock))
}

/// Get the calling thread's own control block.
pub fn current<Traits: KernelTraits>() -> Result<&'static ThreadCb<Traits>, QueryThreadError> {
    ctx::expect_task_context::<Traits>()?;
    let mut lock = csec::lock_cpu::<Traits>()?;
    Ok(running_thread_unchecked(&mut lock))
}

/// The number of stack bytes a thread has never touched, measured from the
/// far end of its stack region. Requires
/// [`stack_fill`](crate::KernelOptions::stack_fill).
pub fn stack_watermark<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
) -> Result<usize, QueryThreadError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    thread_cb_check(&mut lock, thread)?;

    if !Traits::state().options.read(&*lock).stack_fill {
        return Err(QueryThreadError::BadState);
    }

    let attr = *thread.attr.read(&*lock);
    let mut untouched = 0;
    // Stacks grow downward: the low end is the last to be written
    for i in 0..attr.stack.len() {
        // Safety: The region is valid per the `StackRegion` contract; a
        // byte-wise read is always defined
        if unsafe { attr.stack.as_ptr().add(i).read() } != STACK_FILL_BYTE {
            break;
        }
        untouched += 1;
    }
    Ok(untouched)
}

// Kernel-created threads
// ---------------------------------------------------------------------------

fn idle_thread_body<Traits: KernelTraits>(_: usize) {
    loop {
        let idle_wfi = match csec::lock_cpu::<Traits>() {
            Ok(lock) => Traits::state().options.read(&*lock).idle_wfi,
            Err(_) => false,
        };
        if idle_wfi {
            // Safety: Called from the idle thread with interrupts enabled
            unsafe { Traits::wait_for_interrupt() };
        } else {
            core::hint::spin_loop();
        }
    }
}

/// Create the idle thread during boot. It must never block on any
/// synchronization object; its sole purpose is to guarantee the dispatcher
/// always finds a ready thread.
pub(crate) fn create_idle_thread<Traits: KernelTraits>(lock: &mut CpuLockGuard<Traits>) {
    let cb = Traits::idle_thread_cb();
    let attr = ThreadAttr {
        entry: idle_thread_body::<Traits>,
        param: 0,
        stack: Traits::idle_thread_stack(),
        priority: IDLE_THREAD_PRIORITY,
        options: ThreadOptions::START,
    };
    create_inner(lock, cb, &attr).expect("failed to create the idle thread");

    // Safety: CPU Lock active, the thread is Dormant
    unsafe { Traits::initialize_thread_state(cb) };
    // Safety: Dormant, context just initialized
    unsafe { make_ready(lock, cb) };
}

/// Create a kernel-owned thread during boot (used for the timer thread).
pub(crate) fn create_kernel_thread<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    cb: &'static ThreadCb<Traits>,
    entry: fn(usize),
    stack: StackRegion,
    priority: Priority,
) {
    debug_assert!(priority == TIMER_THREAD_PRIORITY || priority == IDLE_THREAD_PRIORITY);
    let attr = ThreadAttr {
        entry,
        param: 0,
        stack,
        priority,
        options: ThreadOptions::START,
    };
    create_inner(lock, cb, &attr).expect("failed to create a kernel thread");

    // Safety: CPU Lock active, the thread is Dormant
    unsafe { Traits::initialize_thread_state(cb) };
    // Safety: Dormant, context just initialized
    unsafe { make_ready(lock, cb) };
}
