//! The timer service: tick handling, the timer thread, one-shot alarms,
//! and cyclic timers.
//!
//! Timed events don't fire in interrupt context. The tick interrupt only
//! advances the clock and wakes the *timer thread* — the
//! highest-priority thread in the system — which drains every due event
//! from the timer list and invokes its callback with the critical section
//! released. Because the timer thread outranks all application threads,
//! expirations preempt application work with a latency bounded by one tick
//! period plus the length of the timer-list scan.
//!
//! Alarm and cyclic callbacks therefore run in the timer thread. They may
//! call any kernel operation except those that would block the timer
//! thread on a timed wait; doing so would stall the entire timer service.
use core::fmt;

use crate::{
    csec::{self, CpuLockCell, CpuLockGuard},
    error::{CreateError, DeleteError, NoExistError, QueryError, TimerOpError},
    thread,
    timeout::{self, static_pin, Timeout},
    utils::{Init, ObjectMagic},
    wait, KernelPhase, KernelTraits, Port, Ticks, TIMER_THREAD_PRIORITY,
};

/// The signature of an alarm or cyclic-timer callback. Invoked in the
/// timer thread with the critical section released.
pub type TimerFn = fn(usize);

/// Announce a new tick: advance the clock, charge the running thread,
/// perform the round-robin rotation, and wake the timer thread.
///
/// Called by the port's periodic interrupt through
/// [`PortToKernel::timer_tick`](crate::PortToKernel::timer_tick).
pub(crate) fn handle_tick<Traits: KernelTraits>() {
    let mut lock =
        csec::lock_cpu::<Traits>().expect("timer_tick called with the CPU Lock active");

    let now = Traits::state().tick.read(&*lock).wrapping_add(1);
    Traits::state().tick.replace(&mut *lock, now);

    if *Traits::state().phase.read(&*lock) != KernelPhase::Running {
        return;
    }

    thread::tick_accounting(&mut lock);

    // Wake the timer thread as though its infinite sleep had completed. If
    // it's already awake (still draining the previous tick), there's
    // nothing to do.
    let timer_thread = Traits::timer_thread_cb();
    if thread::state_of(&mut lock, timer_thread) != thread::ThreadSt::Dormant {
        let _ = wait::interrupt_thread(&mut lock, timer_thread, Ok(()));
    }

    thread::unlock_cpu_and_check_preemption(lock);
}

/// The timer thread: drain every due event, then sleep until the next
/// tick.
fn timer_thread_body<Traits: KernelTraits>(_: usize) {
    loop {
        let mut lock = csec::lock_cpu::<Traits>()
            .expect("the timer thread resumed with the CPU Lock active");

        // Pop events whose tick has arrived, head first. A callback may
        // relinquish the lock to run application code, so the list can
        // change between iterations; re-reading the head each time keeps
        // this correct.
        while let Some((callback, param)) = timeout::pop_due_timeout(&mut lock) {
            lock = callback(param, lock);
        }

        // Re-sleep on an infinite wait; the next tick wakes us
        let _ = wait::wait_no_queue(&mut lock, wait::WaitPayload::Sleep);
    }
}

/// Create the timer thread during boot.
pub(crate) fn create_timer_thread<Traits: KernelTraits>(lock: &mut CpuLockGuard<Traits>) {
    thread::create_kernel_thread(
        lock,
        Traits::timer_thread_cb(),
        timer_thread_body::<Traits>,
        Traits::timer_thread_stack(),
        TIMER_THREAD_PRIORITY,
    );
}

// Alarms
// ---------------------------------------------------------------------------

/// *Alarm control block* — the state data of a one-shot alarm.
/// Caller-provided `'static` storage; [`alarm_create`] initializes it in
/// place.
pub struct AlarmCb<Traits: Port> {
    magic: CpuLockCell<Traits, ObjectMagic>,

    /// The embedded timer event.
    timeout: Timeout<Traits>,

    active: CpuLockCell<Traits, bool>,

    handler: CpuLockCell<Traits, TimerFn>,
    param: CpuLockCell<Traits, usize>,
}

impl<Traits: Port> Init for AlarmCb<Traits> {
    const INIT: Self = Self {
        magic: Init::INIT,
        timeout: Init::INIT,
        active: Init::INIT,
        handler: CpuLockCell::new(unreachable_timer_handler),
        param: Init::INIT,
    };
}

fn unreachable_timer_handler(_: usize) {
    unreachable!("fired a timer that was never created")
}

impl<Traits: KernelTraits> fmt::Debug for AlarmCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AlarmCb")
            .field("self", &(self as *const _))
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

fn alarm_cb_check<Traits: Port>(
    lock: &mut CpuLockGuard<Traits>,
    alarm: &AlarmCb<Traits>,
) -> Result<(), NoExistError> {
    if *alarm.magic.read(&**lock) != ObjectMagic::ALARM {
        Err(NoExistError::NoExist)
    } else {
        Ok(())
    }
}

/// The timeout callback of an alarm: mark it stopped and invoke the
/// application handler outside the critical section.
fn alarm_expire_handler<Traits: KernelTraits>(
    param: usize,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    // Safety: `param` was derived from a `&'static AlarmCb` at creation
    let alarm = unsafe { &*(param as *const AlarmCb<Traits>) };

    alarm.active.replace(&mut *lock, false);
    let handler = *alarm.handler.read(&*lock);
    let handler_param = *alarm.param.read(&*lock);

    // Release the critical section for the application callback
    drop(lock);
    handler(handler_param);

    csec::lock_cpu().unwrap_or_else(|_| {
        // The handler left the CPU Lock active; take it over
        // Safety: CPU Lock is active
        unsafe { csec::assume_cpu_lock() }
    })
}

/// Initialize a one-shot alarm.
pub fn alarm_create<Traits: KernelTraits>(
    alarm: &'static AlarmCb<Traits>,
    handler: TimerFn,
    param: usize,
) -> Result<(), CreateError> {
    if Traits::is_interrupt_context() {
        return Err(CreateError::BadContext);
    }
    let mut lock = csec::lock_cpu::<Traits>()?;

    if *alarm.magic.read(&*lock) == ObjectMagic::ALARM {
        return Err(CreateError::BadState);
    }

    alarm.handler.replace(&mut *lock, handler);
    alarm.param.replace(&mut *lock, param);
    alarm.active.replace(&mut *lock, false);
    alarm
        .timeout
        .set_callback(&mut lock, alarm_expire_handler::<Traits>, alarm as *const _ as usize);
    alarm.magic.replace(&mut *lock, ObjectMagic::ALARM);
    Ok(())
}

/// Invalidate an alarm, cancelling it if armed.
pub fn alarm_delete<Traits: KernelTraits>(
    alarm: &'static AlarmCb<Traits>,
) -> Result<(), DeleteError> {
    if Traits::is_interrupt_context() {
        return Err(DeleteError::BadContext);
    }
    let mut lock = csec::lock_cpu::<Traits>()?;
    alarm_cb_check(&mut lock, alarm)?;

    timeout::remove_timeout(&mut lock, &alarm.timeout);
    alarm.active.replace(&mut *lock, false);
    alarm.magic.replace(&mut *lock, ObjectMagic::NONE);
    Ok(())
}

/// Arm the alarm to fire once, `delay` ticks from now. Re-arming an armed
/// alarm reschedules it.
pub fn alarm_start<Traits: KernelTraits>(
    alarm: &'static AlarmCb<Traits>,
    delay: Ticks,
) -> Result<(), TimerOpError> {
    if delay == 0 || delay > timeout::MAX_TIMEOUT {
        return Err(TimerOpError::BadParam);
    }
    let mut lock = csec::lock_cpu::<Traits>()?;
    alarm_cb_check(&mut lock, alarm)?;

    timeout::remove_timeout(&mut lock, &alarm.timeout);
    timeout::insert_timeout_after(&mut lock, static_pin(&alarm.timeout), delay);
    alarm.active.replace(&mut *lock, true);
    Ok(())
}

/// Cancel an armed alarm. A no-op if it isn't armed.
pub fn alarm_stop<Traits: KernelTraits>(
    alarm: &'static AlarmCb<Traits>,
) -> Result<(), TimerOpError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    alarm_cb_check(&mut lock, alarm)?;

    timeout::remove_timeout(&mut lock, &alarm.timeout);
    alarm.active.replace(&mut *lock, false);
    Ok(())
}

/// Return a flag indicating whether the alarm is armed.
pub fn alarm_is_active<Traits: KernelTraits>(
    alarm: &'static AlarmCb<Traits>,
) -> Result<bool, QueryError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    alarm_cb_check(&mut lock, alarm)?;
    Ok(*alarm.active.read(&*lock))
}

// Cyclic timers
// ---------------------------------------------------------------------------

bitflags::bitflags! {
    /// Cyclic timer attributes.
    pub struct CyclicAttr: u32 {
        /// Start the timer upon creation.
        const START = 1 << 0;
        /// Phase preservation: restarting the timer keeps the fire times
        /// anchored to `creation time + phase + N × period` instead of
        /// rebasing them on the moment of the restart.
        const PHASE = 1 << 1;
    }
}

impl Init for CyclicAttr {
    const INIT: Self = Self::empty();
}

/// *Cyclic-timer control block* — the state data of a periodic timer.
/// Caller-provided `'static` storage; [`cyclic_create`] initializes it in
/// place.
pub struct CyclicCb<Traits: Port> {
    magic: CpuLockCell<Traits, ObjectMagic>,

    /// The embedded timer event. Its expiration tick doubles as the record
    /// of the last scheduled fire time while the timer is stopped.
    timeout: Timeout<Traits>,

    active: CpuLockCell<Traits, bool>,

    attr: CpuLockCell<Traits, CyclicAttr>,
    period: CpuLockCell<Traits, Ticks>,

    handler: CpuLockCell<Traits, TimerFn>,
    param: CpuLockCell<Traits, usize>,
}

impl<Traits: Port> Init for CyclicCb<Traits> {
    const INIT: Self = Self {
        magic: Init::INIT,
        timeout: Init::INIT,
        active: Init::INIT,
        attr: Init::INIT,
        period: Init::INIT,
        handler: CpuLockCell::new(unreachable_timer_handler),
        param: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for CyclicCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CyclicCb")
            .field("self", &(self as *const _))
            .field("active", &self.active)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

fn cyclic_cb_check<Traits: Port>(
    lock: &mut CpuLockGuard<Traits>,
    cyclic: &CyclicCb<Traits>,
) -> Result<(), NoExistError> {
    if *cyclic.magic.read(&**lock) != ObjectMagic::CYCLIC {
        Err(NoExistError::NoExist)
    } else {
        Ok(())
    }
}

/// The first fire time at or after the current tick on the grid
/// `base + N × period`, `N ≥ 1`. This is where the drift correction
/// happens: if the callback overran one or more whole periods, the missed
/// fires are skipped rather than delivered late.
fn cyclic_next_time<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    cyclic: &CyclicCb<Traits>,
) -> Ticks {
    let now = *Traits::state().tick.read(&**lock);
    let base = cyclic.timeout.at(lock);
    let period = *cyclic.period.read(&**lock);

    let next = base.wrapping_add(period);
    if timeout::time_before_eq(next, now) {
        let n = now.wrapping_sub(base) / period + 1;
        base.wrapping_add(n * period)
    } else {
        next
    }
}

/// The timeout callback of a cyclic timer: invoke the application handler
/// outside the critical section, then schedule the next cycle.
///
/// The next fire is computed from the *scheduled* time of this one, so a
/// well-behaved handler doesn't accumulate drift; an overrunning one skips
/// forward by whole periods.
fn cyclic_expire_handler<Traits: KernelTraits>(
    param: usize,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    // Safety: `param` was derived from a `&'static CyclicCb` at creation
    let cyclic = unsafe { &*(param as *const CyclicCb<Traits>) };

    let handler = *cyclic.handler.read(&*lock);
    let handler_param = *cyclic.param.read(&*lock);

    // Release the critical section for the application callback
    drop(lock);
    handler(handler_param);

    let mut lock = csec::lock_cpu::<Traits>().unwrap_or_else(|_| {
        // The handler left the CPU Lock active; take it over
        // Safety: CPU Lock is active
        unsafe { csec::assume_cpu_lock() }
    });

    // The handler may have stopped, restarted, or deleted the timer while
    // the lock was released; reschedule only if it's still our turn to
    if *cyclic.magic.read(&*lock) == ObjectMagic::CYCLIC
        && *cyclic.active.read(&*lock)
        && !cyclic.timeout.is_linked(&mut lock)
    {
        let next = cyclic_next_time(&mut lock, cyclic);
        cyclic.timeout.set_expiration_at(&mut lock, next);
        timeout::insert_timeout(&mut lock, static_pin(&cyclic.timeout));
    }

    lock
}

/// Initialize a cyclic timer firing every `period` ticks, the first time
/// `phase` ticks after creation. With [`CyclicAttr::START`] the timer
/// starts immediately.
pub fn cyclic_create<Traits: KernelTraits>(
    cyclic: &'static CyclicCb<Traits>,
    handler: TimerFn,
    param: usize,
    period: Ticks,
    phase: Ticks,
    attr: CyclicAttr,
) -> Result<(), CreateError> {
    if Traits::is_interrupt_context() {
        return Err(CreateError::BadContext);
    }
    if period == 0 || period > timeout::MAX_TIMEOUT || phase > timeout::MAX_TIMEOUT {
        return Err(CreateError::BadParam);
    }
    let mut lock = csec::lock_cpu::<Traits>()?;

    if *cyclic.magic.read(&*lock) == ObjectMagic::CYCLIC {
        return Err(CreateError::BadState);
    }

    cyclic.handler.replace(&mut *lock, handler);
    cyclic.param.replace(&mut *lock, param);
    cyclic.attr.replace(&mut *lock, attr);
    cyclic.period.replace(&mut *lock, period);
    cyclic
        .timeout
        .set_callback(&mut lock, cyclic_expire_handler::<Traits>, cyclic as *const _ as usize);

    // The first fire lies `phase` ticks from now, whether or not the timer
    // is started yet (phase preservation anchors to this point)
    let now = *Traits::state().tick.read(&*lock);
    let first = now.wrapping_add(phase);
    cyclic.timeout.set_expiration_at(&mut lock, first);

    if attr.contains(CyclicAttr::START) {
        timeout::insert_timeout(&mut lock, static_pin(&cyclic.timeout));
        cyclic.active.replace(&mut *lock, true);
    } else {
        cyclic.active.replace(&mut *lock, false);
    }

    cyclic.magic.replace(&mut *lock, ObjectMagic::CYCLIC);
    Ok(())
}

/// Invalidate a cyclic timer, cancelling any pending fire.
pub fn cyclic_delete<Traits: KernelTraits>(
    cyclic: &'static CyclicCb<Traits>,
) -> Result<(), DeleteError> {
    if Traits::is_interrupt_context() {
        return Err(DeleteError::BadContext);
    }
    let mut lock = csec::lock_cpu::<Traits>()?;
    cyclic_cb_check(&mut lock, cyclic)?;

    timeout::remove_timeout(&mut lock, &cyclic.timeout);
    cyclic.active.replace(&mut *lock, false);
    cyclic.magic.replace(&mut *lock, ObjectMagic::NONE);
    Ok(())
}

/// Start a cyclic timer.
///
/// Without [`CyclicAttr::PHASE`], the first fire is one period from now.
/// With it, the fire times stay anchored to the grid laid down at
/// creation, regardless of start/stop transitions.
pub fn cyclic_start<Traits: KernelTraits>(
    cyclic: &'static CyclicCb<Traits>,
) -> Result<(), TimerOpError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    cyclic_cb_check(&mut lock, cyclic)?;

    if cyclic.attr.read(&*lock).contains(CyclicAttr::PHASE) {
        if !*cyclic.active.read(&*lock) {
            // Resume on the original grid, skipping any fire times that
            // passed while the timer was stopped
            let now = *Traits::state().tick.read(&*lock);
            let anchored = cyclic.timeout.at(&mut lock);
            let at = if timeout::time_before_eq(anchored, now) {
                cyclic_next_time(&mut lock, cyclic)
            } else {
                anchored
            };
            cyclic.timeout.set_expiration_at(&mut lock, at);
            timeout::insert_timeout(&mut lock, static_pin(&cyclic.timeout));
        }
    } else {
        timeout::remove_timeout(&mut lock, &cyclic.timeout);
        let now = *Traits::state().tick.read(&*lock);
        let period = *cyclic.period.read(&*lock);
        cyclic
            .timeout
            .set_expiration_at(&mut lock, now.wrapping_add(period));
        timeout::insert_timeout(&mut lock, static_pin(&cyclic.timeout));
    }

    cyclic.active.replace(&mut *lock, true);
    Ok(())
}

/// Stop a cyclic timer. The pending fire, if any, is cancelled; with
/// [`CyclicAttr::PHASE`] the fire-time grid is preserved for a later
/// restart.
pub fn cyclic_stop<Traits: KernelTraits>(
    cyclic: &'static CyclicCb<Traits>,
) -> Result<(), TimerOpError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    cyclic_cb_check(&mut lock, cyclic)?;

    timeout::remove_timeout(&mut lock, &cyclic.timeout);
    cyclic.active.replace(&mut *lock, false);
    Ok(())
}

/// Return a flag indicating whether the cyclic timer is started.
pub fn cyclic_is_active<Traits: KernelTraits>(
    cyclic: &'static CyclicCb<Traits>,
) -> Result<bool, QueryError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    cyclic_cb_check(&mut lock, cyclic)?;
    Ok(*cyclic.active.read(&*lock))
}
