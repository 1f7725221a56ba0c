//! Simulation environment for running the tern kernel on a hosted target.
//!
//! Each kernel thread is backed by an OS thread, but at most one of them
//! executes at any moment: the port publishes the kernel's scheduling
//! decision in a scheduler record, and every backing thread parks on a
//! condition variable until the record names it. The CPU Lock is a flag in
//! the same record, owned by exactly one OS thread at a time, so the
//! kernel's single-coarse-critical-section discipline carries over
//! unchanged.
//!
//! Interrupts are simulated by borrowing the calling OS thread: [`tick`]
//! turns the caller into the timer interrupt for the duration of one call
//! into the kernel. Tests drive the clock explicitly and therefore stay
//! deterministic; nothing in this port reads wall-clock time.
//!
//! A terminated kernel thread's backing OS thread parks forever; a
//! reactivated kernel thread gets a fresh backing thread, told apart by a
//! generation number. [`shutdown`] quiesces a kernel instance by parking
//! every backing thread at its next scheduling point.
use std::{
    cell::Cell,
    sync::{
        atomic::{AtomicU64, Ordering},
        Condvar, Mutex,
    },
    thread::ThreadId,
};

pub use tern_kernel;

use tern_kernel::{
    thread::ThreadCb, Init, KernelOptions, KernelTraits, Port, PortToKernel,
};

/// The role of an OS thread within the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Not part of any kernel instance (e.g. the test harness).
    External,
    /// The thread running the kernel's boot phase.
    Boot,
    /// Temporarily acting as an interrupt handler.
    Interrupt,
    /// Backing a kernel thread.
    Task,
}

thread_local! {
    static ROLE: Cell<Role> = Cell::new(Role::External);

    /// The identity of the kernel thread this OS thread backs:
    /// `(control block address, generation)`.
    static TASK_SELF: Cell<(usize, u64)> = Cell::new((0, 0));
}

static GENERATION: AtomicU64 = AtomicU64::new(1);

/// Implemented on a system type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance:
    KernelTraits + Port<PortThreadState = ThreadState> + PortToKernel
{
    fn port_state() -> &'static State;
}

/// The per-thread state of the port: which backing OS thread, if any,
/// exists for the kernel thread.
#[derive(Debug)]
pub struct ThreadState {
    tsm: spin::mutex::SpinMutex<Tsm>,
}

/// The backing-thread state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tsm {
    /// No context has been built yet.
    Uninit,
    /// The context is initialized but no OS thread has been spawned.
    Dormant(u64),
    /// An OS thread with the given generation backs this kernel thread.
    Running(u64),
}

impl Init for ThreadState {
    const INIT: Self = Self {
        tsm: spin::mutex::SpinMutex::new(Tsm::Uninit),
    };
}

#[derive(Debug)]
struct Sched {
    /// The OS thread currently holding the CPU Lock.
    cpu_lock_owner: Option<ThreadId>,

    /// The kernel thread allowed to execute, as published by the last
    /// dispatch: `(control block address, generation)`.
    running: Option<(usize, u64)>,

    /// Set by `dispatch_first_thread`.
    started: bool,

    /// Set by [`shutdown`]; parks every backing thread at its next
    /// scheduling point.
    shutdown: bool,
}

/// The internal state of the port (one per kernel instance).
#[derive(Debug)]
pub struct State {
    sched: Mutex<Sched>,
    cond: Condvar,
}

fn park_forever() -> ! {
    loop {
        std::thread::park();
    }
}

#[allow(clippy::missing_safety_doc)]
impl State {
    pub const fn new() -> Self {
        Self {
            sched: Mutex::new(Sched {
                cpu_lock_owner: None,
                running: None,
                started: false,
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Acquire the CPU Lock flag, gated only on the flag itself. Used by
    /// the dispatcher and the boot path, which must be able to run even on
    /// a descheduled OS thread.
    fn acquire_cpu_lock_raw(&self) {
        let me = std::thread::current().id();
        let mut sched = self.sched.lock().unwrap();
        while sched.cpu_lock_owner.is_some() {
            sched = self.cond.wait(sched).unwrap();
        }
        sched.cpu_lock_owner = Some(me);
    }

    fn release_cpu_lock_raw(&self) {
        let mut sched = self.sched.lock().unwrap();
        debug_assert_eq!(sched.cpu_lock_owner, Some(std::thread::current().id()));
        sched.cpu_lock_owner = None;
        drop(sched);
        self.cond.notify_all();
    }

    pub unsafe fn enter_cpu_lock(&self) {
        let role = ROLE.with(|r| r.get());
        let me = TASK_SELF.with(|s| s.get());
        let mut sched = self.sched.lock().unwrap();

        loop {
            if sched.shutdown && role == Role::Task {
                drop(sched);
                park_forever();
            }

            // A backing thread may only enter the kernel while its kernel
            // thread is the published running thread; this is where
            // preemption takes effect for threads busy in application code
            let descheduled =
                role == Role::Task && sched.started && sched.running != Some(me);

            if sched.cpu_lock_owner.is_none() && !descheduled {
                break;
            }
            sched = self.cond.wait(sched).unwrap();
        }

        sched.cpu_lock_owner = Some(std::thread::current().id());
    }

    pub unsafe fn leave_cpu_lock(&self) {
        let role = ROLE.with(|r| r.get());
        let me = TASK_SELF.with(|s| s.get());
        let mut sched = self.sched.lock().unwrap();

        debug_assert_eq!(sched.cpu_lock_owner, Some(std::thread::current().id()));
        sched.cpu_lock_owner = None;
        self.cond.notify_all();

        // Returning from a kernel operation is a preemption point
        if role == Role::Task && sched.started {
            while sched.running != Some(me) {
                if sched.shutdown {
                    drop(sched);
                    park_forever();
                }
                sched = self.cond.wait(sched).unwrap();
            }
        }
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        let sched = self.sched.lock().unwrap();
        sched.cpu_lock_owner == Some(std::thread::current().id())
    }

    pub fn is_task_context(&self) -> bool {
        ROLE.with(|r| r.get()) == Role::Task
    }

    pub fn is_interrupt_context(&self) -> bool {
        ROLE.with(|r| r.get()) == Role::Interrupt
    }

    /// Run the kernel's scheduling decision and publish the outcome,
    /// spawning a backing thread if the chosen kernel thread doesn't have
    /// one yet.
    ///
    /// The caller must *not* hold the CPU Lock.
    fn dispatch<Traits: PortInstance>(&'static self) {
        self.acquire_cpu_lock_raw();
        self.dispatch_locked::<Traits>();
    }

    /// The latter half of [`Self::dispatch`]: the caller already holds the
    /// CPU Lock; it is released as the decision is published.
    fn dispatch_locked<Traits: PortInstance>(&'static self) {
        // Safety: We hold the CPU Lock
        unsafe { Traits::choose_running_thread() };

        let target = Traits::state().running_thread().map(|cb| {
            let addr = cb as *const ThreadCb<Traits> as usize;
            let mut tsm = cb.port_thread_state.tsm.lock();
            match *tsm {
                Tsm::Dormant(generation) => {
                    *tsm = Tsm::Running(generation);
                    drop(tsm);
                    spawn_backing_thread::<Traits>(addr, generation);
                    (addr, generation)
                }
                Tsm::Running(generation) => (addr, generation),
                Tsm::Uninit => unreachable!("dispatched a thread with no context"),
            }
        });

        log::trace!("dispatch -> {target:?}");

        // Publish the decision and release the CPU Lock in one step, so
        // concurrent dispatches can't publish out of order
        let mut sched = self.sched.lock().unwrap();
        debug_assert_eq!(sched.cpu_lock_owner, Some(std::thread::current().id()));
        sched.running = target;
        sched.cpu_lock_owner = None;
        drop(sched);
        self.cond.notify_all();
    }

    /// Park the calling backing thread until the published running thread
    /// is the kernel thread it backs.
    fn wait_until_scheduled(&self) {
        let me = TASK_SELF.with(|s| s.get());
        let mut sched = self.sched.lock().unwrap();
        while sched.running != Some(me) {
            if sched.shutdown {
                drop(sched);
                park_forever();
            }
            sched = self.cond.wait(sched).unwrap();
        }
    }

    pub unsafe fn yield_cpu<Traits: PortInstance>(&'static self) {
        self.dispatch::<Traits>();

        if ROLE.with(|r| r.get()) == Role::Task {
            self.wait_until_scheduled();
        }
    }

    pub unsafe fn dispatch_first_thread<Traits: PortInstance>(&'static self) -> ! {
        log::trace!("dispatch_first_thread");

        // The kernel chose the first thread during boot; hand the CPU over
        {
            let mut sched = self.sched.lock().unwrap();
            sched.started = true;
        }
        self.dispatch_locked::<Traits>();

        // The boot context is discarded
        park_forever()
    }

    pub unsafe fn exit_and_dispatch<Traits: PortInstance>(
        &'static self,
        _thread: &'static ThreadCb<Traits>,
    ) -> ! {
        log::trace!("exit_and_dispatch");

        // The kernel calls this with the CPU Lock held
        self.dispatch_locked::<Traits>();

        // This backing thread will never be scheduled again (a
        // reactivation spawns a fresh one with a new generation)
        park_forever()
    }

    pub unsafe fn initialize_thread_state<Traits: PortInstance>(
        &self,
        thread: &'static ThreadCb<Traits>,
    ) {
        let generation = GENERATION.fetch_add(1, Ordering::Relaxed);
        log::trace!("initialize_thread_state {thread:p} generation {generation}");

        // A backing thread left over from a previous activation keeps its
        // old generation and is never scheduled again
        *thread.port_thread_state.tsm.lock() = Tsm::Dormant(generation);
    }

    pub unsafe fn wait_for_interrupt(&self) {
        let me = TASK_SELF.with(|s| s.get());
        let mut sched = self.sched.lock().unwrap();
        if sched.shutdown {
            drop(sched);
            park_forever();
        }
        // Sleep until the next scheduling event concerning this thread.
        // Spurious wakeups are fine; the idle loop just comes back here.
        if sched.running == Some(me) {
            let _unused = self.cond.wait(sched).unwrap();
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the OS thread backing a kernel thread. It parks until the
/// dispatcher publishes it, runs the thread's entry function, and performs
/// the kernel's self-exit on return.
fn spawn_backing_thread<Traits: PortInstance>(addr: usize, generation: u64) {
    std::thread::Builder::new()
        .name(format!("kernel thread {addr:#x}.{generation}"))
        .spawn(move || {
            ROLE.with(|r| r.set(Role::Task));
            TASK_SELF.with(|s| s.set((addr, generation)));

            let state = Traits::port_state();
            state.wait_until_scheduled();

            // Safety: The address was derived from a `&'static ThreadCb`
            // in `dispatch_locked`
            let cb = unsafe { &*(addr as *const ThreadCb<Traits>) };

            let attr = {
                state.acquire_cpu_lock_raw();
                // Safety: CPU Lock active
                let attr = unsafe { cb.attr() };
                state.release_cpu_lock_raw();
                attr
            };

            log::debug!("kernel thread {addr:#x}.{generation} entering at {:p}", attr.entry as *const ());
            (attr.entry)(attr.param);

            // Returning from the entry function terminates the thread
            let _ = tern_kernel::thread::exit::<Traits>();
            unreachable!("exit returned on the success path");
        })
        .expect("failed to spawn a backing thread");
}

/// Boot a kernel instance: run `init` in the boot context (this is where
/// the application creates its threads and objects), start the scheduler,
/// and return once the first thread has been dispatched.
///
/// The kernel keeps running on its backing threads after this returns;
/// time only advances through [`tick`].
pub fn boot<Traits: PortInstance>(options: KernelOptions, init: fn()) {
    let _ = env_logger::try_init();

    std::thread::Builder::new()
        .name("kernel boot".to_owned())
        .spawn(move || {
            ROLE.with(|r| r.set(Role::Boot));
            let state = Traits::port_state();
            state.acquire_cpu_lock_raw();
            // Safety: We're the port; CPU Lock is active and the kernel is
            // inactive
            unsafe { Traits::boot(&options, init) };
        })
        .expect("failed to spawn the boot thread");

    // Wait until `dispatch_first_thread` has handed the CPU over
    let state = Traits::port_state();
    let mut sched = state.sched.lock().unwrap();
    while !sched.started {
        sched = state.cond.wait(sched).unwrap();
    }
}

/// Deliver one timer interrupt: the calling OS thread becomes the timer
/// ISR for the duration of the call. Returns once the interrupt (including
/// any context switch it requested) has been processed.
pub fn tick<Traits: PortInstance>() {
    let old_role = ROLE.with(|r| r.replace(Role::Interrupt));
    // Safety: We're the port's interrupt source; CPU Lock is not held by
    // this thread
    unsafe { Traits::timer_tick() };
    ROLE.with(|r| r.set(old_role));
}

/// Deliver `n` timer interrupts, letting the timer thread finish its pass
/// and go back to sleep after each one. This keeps per-tick bookkeeping
/// (run-time accounting, round-robin) deterministic for tests.
pub fn advance_ticks<Traits: PortInstance>(n: u32) {
    for _ in 0..n {
        tick::<Traits>();

        let timer_cb = Traits::timer_thread_cb();
        loop {
            let st = tern_kernel::thread::state::<Traits>(timer_cb)
                .expect("the timer thread's control block vanished");
            let running_is_timer = Traits::state()
                .running_thread()
                .map_or(false, |cb| core::ptr::eq(cb, timer_cb));
            if st == tern_kernel::thread::ThreadSt::Waiting && !running_is_timer {
                break;
            }
            std::thread::yield_now();
        }
    }
}

/// Quiesce a kernel instance: every backing thread parks at its next
/// scheduling point. The parked threads are reclaimed when the process
/// exits.
pub fn shutdown<Traits: PortInstance>() {
    let state = Traits::port_state();
    let mut sched = state.sched.lock().unwrap();
    sched.shutdown = true;
    drop(sched);
    state.cond.notify_all();
}

/// Instantiate the port: implement [`Port`] (and [`PortInstance`]) for a
/// system type and define the kernel instance's statics.
///
/// ```ignore
/// tern_port_std::use_port!(unsafe struct SystemTraits);
/// ```
#[macro_export]
macro_rules! use_port {
    (unsafe struct $SystemTraits:ident) => {
        struct $SystemTraits;

        const _: () = {
            use $crate::{PortInstance, State, ThreadState};

            static PORT_STATE: State = State::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline(always)]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            unsafe impl $crate::tern_kernel::Port for $SystemTraits {
                type PortThreadState = ThreadState;

                unsafe fn dispatch_first_thread() -> ! {
                    unsafe { PORT_STATE.dispatch_first_thread::<Self>() }
                }

                unsafe fn yield_cpu() {
                    unsafe { PORT_STATE.yield_cpu::<Self>() }
                }

                unsafe fn exit_and_dispatch(
                    thread: &'static $crate::tern_kernel::thread::ThreadCb<Self>,
                ) -> ! {
                    unsafe { PORT_STATE.exit_and_dispatch::<Self>(thread) }
                }

                unsafe fn enter_cpu_lock() {
                    unsafe { PORT_STATE.enter_cpu_lock() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock() }
                }

                unsafe fn initialize_thread_state(
                    thread: &'static $crate::tern_kernel::thread::ThreadCb<Self>,
                ) {
                    unsafe { PORT_STATE.initialize_thread_state::<Self>(thread) }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active()
                }

                fn is_task_context() -> bool {
                    PORT_STATE.is_task_context()
                }

                fn is_interrupt_context() -> bool {
                    PORT_STATE.is_interrupt_context()
                }

                unsafe fn wait_for_interrupt() {
                    unsafe { PORT_STATE.wait_for_interrupt() }
                }
            }
        };

        $crate::tern_kernel::kernel_statics!(unsafe impl KernelStatic for $SystemTraits {
            idle_stack_size: 4096,
            timer_stack_size: 16384,
        });
    };
}
