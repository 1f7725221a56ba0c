//! # tern_kernel
//!
//! A preemptive, priority-based real-time kernel for small 32-bit targets
//! (Armv6-M, Armv7-M, Armv7E-M, and classic Armv4T, plus a hosted simulator
//! for testing). The kernel schedules a fixed set of cooperating threads on
//! a single CPU, mediates their access to shared objects (semaphores, event
//! flags, mutexes, data queues, message queues, and fixed-block memory
//! pools), and drives time-dependent behavior (sleeps, timed waits, alarms,
//! and cyclic timers) from a periodic tick.
//!
//! # Threads and priorities
//!
//! There are 32 priority levels. A lower number means a higher scheduling
//! precedence. Priority 0 is reserved for the kernel's timer thread and
//! priority 31 for the idle thread; application threads use 1–30. Within a
//! priority level, threads run in FIFO order, optionally sliced round-robin.
//!
//! # The critical section
//!
//! All kernel state is protected by one coarse critical section, the *CPU
//! Lock*: interrupts are masked up to the configured kernel threshold while
//! the kernel manipulates shared state. Kernel operations that can block are
//! only callable from a task context; interrupt handlers may call the
//! polling (`timeout == 0`) and non-blocking subsets.
//!
//! # Storage
//!
//! The kernel owns no memory. Control blocks, stacks, rings, and pool
//! arenas are `static`s owned by the application and handed to the kernel
//! by reference; `create` initializes them in place and `delete` invalidates
//! them, releasing any waiters with [`ResultCode::Deleted`].
//!
//! # Ports
//!
//! The architecture-specific part of a kernel instance — register
//! save/restore, exception plumbing, the interrupt mask — is supplied by a
//! *port* implementing [`Port`]. The kernel reaches its per-instance global
//! state through [`KernelStatic`], normally implemented with
//! [`kernel_statics!`]. The port, in turn, drives the kernel through
//! [`PortToKernel`].
//!
//! [`ResultCode::Deleted`]: crate::ResultCode::Deleted
#![cfg_attr(not(test), no_std)]

use core::{fmt, mem::forget};

use atomic_ref::AtomicRef;
use core::sync::atomic::Ordering;

pub mod data_queue;
pub mod error;
pub mod event_flags;
pub mod mem_pool;
pub mod msg_queue;
pub mod mutex;
pub mod semaphore;
pub mod thread;
pub mod timer;
pub mod utils;

mod csec;
mod ctx;
mod timeout;
mod wait;

pub use crate::error::ResultCode;
pub use crate::utils::{BufRegion, BufStorage, Init, StackRegion, StackStorage};
pub use crate::wait::WaitReason;

use crate::csec::CpuLockCell;
use crate::thread::ThreadCb;
use crate::timeout::TimeoutRef;
use crate::utils::list::ListHead;

/// Thread priority. A lower number means a higher scheduling precedence.
pub type Priority = usize;

/// The number of thread priority levels.
pub const PRIORITY_LEVELS: usize = 32;

/// The priority reserved for the kernel's timer thread.
pub const TIMER_THREAD_PRIORITY: Priority = 0;

/// The priority reserved for the idle thread.
pub const IDLE_THREAD_PRIORITY: Priority = PRIORITY_LEVELS - 1;

/// One period of the system time source. The unit of all timeouts.
pub type Ticks = u32;

/// Timeout value requesting an unbounded wait. No timer event is scheduled.
pub const WAIT_FOREVER: Ticks = Ticks::MAX;

/// Timeout value requesting a poll: if the condition is not immediately
/// satisfiable, the operation fails with [`ResultCode::Timeout`] without
/// blocking.
pub const NO_WAIT: Ticks = 0;

/// Implemented by a port. Contains the low-level operations for controlling
/// CPU states and context switching — the whole of the kernel's dependency
/// on the target architecture.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing a dispatcher
/// implementation. These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait Port: Sized + Send + Sync + 'static {
    /// Port-defined per-thread context area. Placed at the beginning of
    /// every [`ThreadCb`] so that assembly code can refer to it easily.
    type PortThreadState: Send + Sync + Init + fmt::Debug + 'static;

    /// The alignment requirement for thread stack regions.
    const STACK_ALIGN: usize = core::mem::size_of::<usize>();

    /// The default stack size for threads, in bytes.
    const STACK_DEFAULT_SIZE: usize = 1024;

    /// Transfer the control to the thread selected by
    /// [`PortToKernel::choose_running_thread`], discarding the current
    /// (startup) context.
    ///
    /// Precondition: CPU Lock active, boot phase complete.
    unsafe fn dispatch_first_thread() -> !;

    /// Yield the processor: request a deferred context switch (e.g. by
    /// pending a low-priority exception). The dispatcher must call
    /// [`PortToKernel::choose_running_thread`] and transfer control to the
    /// chosen thread.
    ///
    /// Precondition: CPU Lock inactive.
    unsafe fn yield_cpu();

    /// Destroy the state of the previously running thread (which has
    /// already been removed from the running-thread slot) and proceed to the
    /// dispatcher.
    ///
    /// Precondition: CPU Lock active.
    unsafe fn exit_and_dispatch(thread: &'static ThreadCb<Self>) -> !;

    /// Mask interrupts up to the configured kernel threshold (enter the
    /// *CPU Lock* state).
    ///
    /// Precondition: CPU Lock inactive.
    unsafe fn enter_cpu_lock();

    /// Unmask the interrupts masked by [`enter_cpu_lock`].
    ///
    /// Precondition: CPU Lock active.
    ///
    /// [`enter_cpu_lock`]: Self::enter_cpu_lock
    unsafe fn leave_cpu_lock();

    /// Prepare the thread for activation: construct an initial context in
    /// the thread's stack region so that the first context switch into the
    /// thread enters its entry function with its parameter, and a return
    /// from the entry function enters the kernel's self-exit routine.
    ///
    /// Precondition: CPU Lock active; the thread is dormant.
    unsafe fn initialize_thread_state(thread: &'static ThreadCb<Self>);

    /// Return a flag indicating whether the CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is a task
    /// context (a thread's own context; not an interrupt handler and not
    /// the boot phase).
    fn is_task_context() -> bool;

    /// Return a flag indicating whether the current context is an interrupt
    /// context.
    fn is_interrupt_context() -> bool;

    /// Halt the processor until an interrupt arrives. Called by the idle
    /// thread when [`KernelOptions::idle_wfi`] is enabled; the default
    /// implementation does nothing.
    ///
    /// Precondition: CPU Lock inactive, idle thread context.
    unsafe fn wait_for_interrupt() {}
}

/// Associates a kernel instance with its global state. Implemented by
/// [`kernel_statics!`].
///
/// # Safety
///
/// The returned references must be unique to this kernel instance and must
/// not be handed to another kernel instance.
pub unsafe trait KernelStatic: Port {
    /// Access the kernel instance's global state.
    fn state() -> &'static KernelState<Self>;

    /// The control block of the idle thread.
    fn idle_thread_cb() -> &'static ThreadCb<Self>;

    /// The control block of the timer thread.
    fn timer_thread_cb() -> &'static ThreadCb<Self>;

    /// The stack region used by the idle thread.
    fn idle_thread_stack() -> StackRegion;

    /// The stack region used by the timer thread.
    fn timer_thread_stack() -> StackRegion;
}

/// The combined requirements of every kernel operation.
pub trait KernelTraits: Port + KernelStatic {}
impl<T: Port + KernelStatic> KernelTraits for T {}

/// The lifecycle phase of a kernel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelPhase {
    /// Before [`PortToKernel::boot`].
    Inactive,
    /// Inside `boot`: control blocks may be created, but the scheduler is
    /// not live yet.
    Boot,
    /// The scheduler is live.
    Running,
}

impl Init for KernelPhase {
    const INIT: Self = Self::Inactive;
}

/// Startup parameters, passed to [`PortToKernel::boot`].
#[derive(Debug, Clone, Copy)]
pub struct KernelOptions {
    /// The rate at which the port calls [`PortToKernel::timer_tick`], in
    /// hertz. Informational; used by the time-conversion helpers.
    pub tick_hz: u32,

    /// Round-robin time slice per priority level, in ticks. Zero disables
    /// round-robin scheduling at that level.
    pub round_robin_slices: [Ticks; PRIORITY_LEVELS],

    /// Whether threads execute in the privileged processor mode. Consumed
    /// by ports on architectures that distinguish thread privilege.
    pub privileged_threads: bool,

    /// Fill every stack with a known pattern when a thread is initialized,
    /// enabling [`thread::stack_watermark`].
    pub stack_fill: bool,

    /// Let the idle thread execute the architecture's wait-for-interrupt
    /// instruction instead of spinning.
    pub idle_wfi: bool,
}

impl Init for KernelOptions {
    const INIT: Self = Self {
        tick_hz: 1000,
        round_robin_slices: [0; PRIORITY_LEVELS],
        privileged_threads: true,
        stack_fill: false,
        idle_wfi: true,
    };
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self::INIT
    }
}

/// Global state of one kernel instance.
pub struct KernelState<Traits: Port> {
    /// The currently running thread (the thread whose context is live on
    /// the CPU, possibly just about to be). Readable by the port without
    /// the CPU Lock; written only by the dispatcher inside the CPU Lock.
    running_thread: AtomicRef<'static, ThreadCb<Traits>>,

    /// The task ready queue: one FIFO per priority level and the priority
    /// bitmap.
    pub(crate) ready_queue: thread::readyqueue::ReadyQueue<Traits>,

    pub(crate) phase: CpuLockCell<Traits, KernelPhase>,

    /// The kernel tick counter. Wraps around; all comparisons are
    /// performed with wrapping arithmetic.
    pub(crate) tick: CpuLockCell<Traits, Ticks>,

    /// The single time-ordered list of pending timer events.
    pub(crate) timer_list: CpuLockCell<Traits, ListHead<TimeoutRef<Traits>>>,

    pub(crate) options: CpuLockCell<Traits, KernelOptions>,
}

impl<Traits: Port> Init for KernelState<Traits> {
    const INIT: Self = Self {
        running_thread: Init::INIT,
        ready_queue: Init::INIT,
        phase: Init::INIT,
        tick: Init::INIT,
        timer_list: Init::INIT,
        options: Init::INIT,
    };
}

impl<Traits: Port> KernelState<Traits> {
    /// Get the currently running thread.
    pub fn running_thread(&self) -> Option<&'static ThreadCb<Traits>> {
        self.running_thread.load(Ordering::Relaxed)
    }

    pub(crate) fn set_running_thread(
        &self,
        _lock: &mut csec::CpuLockGuard<Traits>,
        thread: Option<&'static ThreadCb<Traits>>,
    ) {
        self.running_thread.store(thread, Ordering::Relaxed);
    }
}

impl<Traits: KernelTraits> fmt::Debug for KernelState<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KernelState")
            .field(
                "running_thread",
                &self.running_thread.load(Ordering::Relaxed).map(|x| x as *const _),
            )
            .field("phase", &self.phase)
            .field("tick", &self.tick)
            .finish_non_exhaustive()
    }
}

/// Methods intended to be called by a port.
///
/// # Safety
///
/// These are only meant to be called by the port.
#[allow(clippy::missing_safety_doc)]
pub trait PortToKernel {
    /// Initialize the kernel: create the timer and idle threads, run the
    /// application's `init` hook (where threads and synchronization objects
    /// are created), pick the first thread to run, and dispatch it.
    ///
    /// Precondition: CPU Lock active, kernel inactive.
    unsafe fn boot(options: &KernelOptions, init: fn()) -> !;

    /// Determine the next thread to run and store it in the running-thread
    /// slot. Called by the port's dispatcher.
    ///
    /// Precondition: CPU Lock active / Postcondition: CPU Lock active.
    unsafe fn choose_running_thread();

    /// Announce a new tick. Called by the port's periodic interrupt.
    ///
    /// Precondition: CPU Lock inactive, interrupt context.
    unsafe fn timer_tick();
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot(options: &KernelOptions, init: fn()) -> ! {
        // Safety: The port entered the CPU Lock state before calling `boot`
        let mut lock = unsafe { csec::assume_cpu_lock::<Traits>() };

        assert_eq!(
            *Traits::state().phase.read(&*lock),
            KernelPhase::Inactive,
            "the kernel was booted twice"
        );

        Traits::state().options.replace(&mut *lock, *options);
        Traits::state().phase.replace(&mut *lock, KernelPhase::Boot);

        // The timer thread (priority 0) and the idle thread (priority 31)
        // frame every application thread.
        timer::create_timer_thread::<Traits>(&mut lock);
        thread::create_idle_thread::<Traits>(&mut lock);

        // Run the application's initialization hook with the CPU Lock
        // relinquished. Threads and synchronization objects created here
        // don't start executing until the dispatch below.
        drop(lock);
        init();
        let mut lock = csec::lock_cpu::<Traits>().expect(
            "the init hook returned with the CPU Lock still active",
        );

        Traits::state().phase.replace(&mut *lock, KernelPhase::Running);

        // Choose the first thread. The idle thread is always ready, so the
        // selection can't come up empty.
        thread::choose_next_running_thread(&mut lock);
        debug_assert!(Traits::state().running_thread().is_some());

        lock.forget();

        // Safety: CPU Lock active, boot phase complete
        unsafe { Traits::dispatch_first_thread() }
    }

    unsafe fn choose_running_thread() {
        // Safety: The precondition of this method includes CPU Lock being
        // active
        let mut lock = unsafe { csec::assume_cpu_lock::<Traits>() };

        thread::choose_next_running_thread(&mut lock);

        // Post-condition: CPU Lock active
        forget(lock);
    }

    unsafe fn timer_tick() {
        timer::handle_tick::<Traits>();
    }
}

/// Convert a duration in milliseconds to ticks, rounding up, according to
/// the configured tick rate.
pub fn ticks_from_millis<Traits: KernelTraits>(ms: u32) -> Ticks {
    let hz = match csec::lock_cpu::<Traits>() {
        Ok(lock) => Traits::state().options.read(&*lock).tick_hz,
        Err(_) => 1000,
    };
    let numer = (ms as u64) * (hz as u64);
    numer.div_ceil(1000) as Ticks
}

/// Read the kernel tick counter.
pub fn tick_count<Traits: KernelTraits>() -> Result<Ticks, error::QueryError> {
    let lock = csec::lock_cpu::<Traits>()?;
    Ok(*Traits::state().tick.read(&*lock))
}

/// Read the kernel options while the CPU Lock is held. Intended for ports
/// (e.g. to honor [`KernelOptions::privileged_threads`] when constructing
/// an initial thread context).
///
/// # Safety
///
/// CPU Lock must be active.
pub unsafe fn options_unchecked<Traits: KernelTraits>() -> KernelOptions {
    // Safety: Upheld by the caller
    let token = unsafe { csec::CpuLockToken::<Traits>::assume() };
    *Traits::state().options.read(&token)
}

/// Read the kernel lifecycle phase.
pub fn phase<Traits: KernelTraits>() -> Result<KernelPhase, error::QueryError> {
    let lock = csec::lock_cpu::<Traits>()?;
    Ok(*Traits::state().phase.read(&*lock))
}

/// Define the `static`s backing a kernel instance and implement
/// [`KernelStatic`] for the given system type.
///
/// ```ignore
/// struct SystemTraits;
/// // ... implement `Port` for `SystemTraits` (usually via a port's
/// // `use_port!`) ...
/// tern_kernel::kernel_statics!(unsafe impl KernelStatic for SystemTraits {
///     idle_stack_size: 2048,
///     timer_stack_size: 4096,
/// });
/// ```
#[macro_export]
macro_rules! kernel_statics {
    (unsafe impl KernelStatic for $Traits:ty {
        idle_stack_size: $idle_stack_size:expr,
        timer_stack_size: $timer_stack_size:expr $(,)?
    }) => {
        const _: () = {
            static KERNEL_STATE: $crate::KernelState<$Traits> =
                <$crate::KernelState<$Traits> as $crate::Init>::INIT;
            static IDLE_THREAD_CB: $crate::thread::ThreadCb<$Traits> =
                <$crate::thread::ThreadCb<$Traits> as $crate::Init>::INIT;
            static TIMER_THREAD_CB: $crate::thread::ThreadCb<$Traits> =
                <$crate::thread::ThreadCb<$Traits> as $crate::Init>::INIT;
            static IDLE_THREAD_STACK: $crate::StackStorage<{ $idle_stack_size }> =
                $crate::StackStorage::new();
            static TIMER_THREAD_STACK: $crate::StackStorage<{ $timer_stack_size }> =
                $crate::StackStorage::new();

            // Safety: Each static is defined here, uniquely for `$Traits`
            unsafe impl $crate::KernelStatic for $Traits {
                #[inline(always)]
                fn state() -> &'static $crate::KernelState<Self> {
                    &KERNEL_STATE
                }
                #[inline(always)]
                fn idle_thread_cb() -> &'static $crate::thread::ThreadCb<Self> {
                    &IDLE_THREAD_CB
                }
                #[inline(always)]
                fn timer_thread_cb() -> &'static $crate::thread::ThreadCb<Self> {
                    &TIMER_THREAD_CB
                }
                fn idle_thread_stack() -> $crate::StackRegion {
                    IDLE_THREAD_STACK.region()
                }
                fn timer_thread_stack() -> $crate::StackRegion {
                    TIMER_THREAD_STACK.region()
                }
            }
        };
    };
}
