//! Event flags
//!
//! A 32-bit pattern each of whose bits can be set and cleared
//! independently. Threads wait for a combination of bits with an ANY or
//! ALL predicate and optional automatic clearing of the matched bits.
use core::fmt;

use crate::{
    csec::{self, CpuLockCell, CpuLockGuard},
    ctx,
    error::{CreateError, DeleteError, NoExistError, QueryError, UpdateFlagsError, WaitFlagsError},
    thread, timeout,
    utils::{Init, ObjectMagic},
    wait::{WaitPayload, WaitQueue},
    KernelTraits, Port, Ticks, NO_WAIT, WAIT_FOREVER,
};

/// Unsigned integer type representing an event-flag pattern.
pub type FlagsPattern = u32;

bitflags::bitflags! {
    /// Wait condition of [`wait`].
    pub struct FlagsWaitMode: u32 {
        /// Wait until *all* the bits in the pattern are set (the default is
        /// *any*).
        const ALL = 1 << 0;
        /// Clear the matched bits when the wait condition is satisfied.
        const CLEAR = 1 << 1;
    }
}

/// *Event-flags control block* — the state data of an event-flag group.
/// Caller-provided `'static` storage; [`create`] initializes it in place.
pub struct FlagsCb<Traits: Port> {
    magic: CpuLockCell<Traits, ObjectMagic>,

    pattern: CpuLockCell<Traits, FlagsPattern>,

    wait_queue: WaitQueue<Traits>,
}

impl<Traits: Port> Init for FlagsCb<Traits> {
    const INIT: Self = Self {
        magic: Init::INIT,
        pattern: Init::INIT,
        wait_queue: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for FlagsCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FlagsCb")
            .field("self", &(self as *const _))
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

fn flags_cb_check<Traits: Port>(
    lock: &mut CpuLockGuard<Traits>,
    flags: &FlagsCb<Traits>,
) -> Result<(), NoExistError> {
    if *flags.magic.read(&**lock) != ObjectMagic::EVENT_FLAGS {
        Err(NoExistError::NoExist)
    } else {
        Ok(())
    }
}

/// Initialize an event-flag group with the given initial pattern.
pub fn create<Traits: KernelTraits>(
    flags: &'static FlagsCb<Traits>,
    initial: FlagsPattern,
) -> Result<(), CreateError> {
    if Traits::is_interrupt_context() {
        return Err(CreateError::BadContext);
    }
    let mut lock = csec::lock_cpu::<Traits>()?;

    if *flags.magic.read(&*lock) == ObjectMagic::EVENT_FLAGS {
        return Err(CreateError::BadState);
    }

    flags.pattern.replace(&mut *lock, initial);
    flags.magic.replace(&mut *lock, ObjectMagic::EVENT_FLAGS);
    Ok(())
}

/// Invalidate an event-flag group, releasing all waiters with
/// [`ResultCode::Deleted`].
///
/// [`ResultCode::Deleted`]: crate::ResultCode::Deleted
pub fn delete<Traits: KernelTraits>(flags: &'static FlagsCb<Traits>) -> Result<(), DeleteError> {
    if Traits::is_interrupt_context() {
        return Err(DeleteError::BadContext);
    }
    let mut lock = csec::lock_cpu::<Traits>()?;
    flags_cb_check(&mut lock, flags)?;

    flags.wait_queue.wake_up_all_deleted(&mut lock);
    flags.magic.replace(&mut *lock, ObjectMagic::NONE);

    thread::unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Given a wait condition `(pattern, mode)`, check if the current flag
/// state satisfies it. If so, clear the matched bits when requested and
/// return the pattern observed at the moment of the match.
fn poll_core(
    state: &mut FlagsPattern,
    pattern: FlagsPattern,
    mode: FlagsWaitMode,
) -> Option<FlagsPattern> {
    let satisfied = if mode.contains(FlagsWaitMode::ALL) {
        (*state & pattern) == pattern
    } else {
        (*state & pattern) != 0
    };

    if satisfied {
        let observed = *state;
        if mode.contains(FlagsWaitMode::CLEAR) {
            *state &= !pattern;
        }
        Some(observed)
    } else {
        None
    }
}

/// Wait until the bits in `pattern` are set, per `mode`. Returns the flag
/// pattern observed when the condition was satisfied.
///
/// `timeout` may be [`NO_WAIT`] (poll), a tick count, or [`WAIT_FOREVER`].
pub fn wait<Traits: KernelTraits>(
    flags: &'static FlagsCb<Traits>,
    pattern: FlagsPattern,
    mode: FlagsWaitMode,
    timeout: Ticks,
) -> Result<FlagsPattern, WaitFlagsError> {
    if pattern == 0 {
        return Err(WaitFlagsError::BadParam);
    }
    let mut lock = csec::lock_cpu::<Traits>()?;
    flags_cb_check(&mut lock, flags)?;

    if let Some(observed) = poll_core(flags.pattern.write(&mut *lock), pattern, mode) {
        return Ok(observed);
    }

    if timeout == NO_WAIT {
        return Err(WaitFlagsError::Timeout);
    }

    ctx::expect_waitable_context::<Traits>()?;

    let payload = WaitPayload::EventFlags {
        pattern,
        mode,
        orig: Init::INIT,
    };

    // The wake-upper runs `poll_core` on behalf of this thread and stores
    // the observed pattern in `orig`
    let result = if timeout == WAIT_FOREVER {
        flags.wait_queue.wait(&mut lock, payload)?
    } else {
        timeout::check_duration(timeout)?;
        flags.wait_queue.wait_timeout(&mut lock, payload, timeout)?
    };

    if let WaitPayload::EventFlags { orig, .. } = result {
        Ok(orig.read(&*lock).get())
    } else {
        unreachable!()
    }
}

/// OR `pattern` into the flag state, then scan the wait queue head-to-tail
/// and wake every waiter whose condition is now satisfied.
///
/// Automatic clearing applies per waiter, so a later waiter in the same
/// scan may observe bits already consumed by an earlier one.
pub fn set<Traits: KernelTraits>(
    flags: &'static FlagsCb<Traits>,
    pattern: FlagsPattern,
) -> Result<(), UpdateFlagsError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    flags_cb_check(&mut lock, flags)?;

    let mut state = *flags.pattern.read(&*lock);

    // Return early if no bits will change
    if (state | pattern) == state {
        return Ok(());
    }

    state |= pattern;

    let mut woke_up_any = false;

    flags
        .wait_queue
        .wake_up_all_conditional(&mut lock, |wait_payload, token| match wait_payload {
            WaitPayload::EventFlags {
                pattern,
                mode,
                orig,
            } => {
                if let Some(observed) = poll_core(&mut state, *pattern, *mode) {
                    woke_up_any = true;
                    orig.read(token).set(observed);
                    true
                } else {
                    false
                }
            }
            _ => unreachable!(),
        });

    flags.pattern.replace(&mut *lock, state);

    if woke_up_any {
        thread::unlock_cpu_and_check_preemption(lock);
    }
    Ok(())
}

/// AND the complement of `pattern` into the flag state.
pub fn clear<Traits: KernelTraits>(
    flags: &'static FlagsCb<Traits>,
    pattern: FlagsPattern,
) -> Result<(), UpdateFlagsError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    flags_cb_check(&mut lock, flags)?;

    let state = *flags.pattern.read(&*lock);
    flags.pattern.replace(&mut *lock, state & !pattern);
    Ok(())
}

/// Read the current flag pattern.
pub fn pattern<Traits: KernelTraits>(
    flags: &'static FlagsCb<Traits>,
) -> Result<FlagsPattern, QueryError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    flags_cb_check(&mut lock, flags)?;
    Ok(*flags.pattern.read(&*lock))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_vs_all() {
        let mut state = 0b0110;
        assert_eq!(poll_core(&mut state, 0b0010, FlagsWaitMode::empty()), Some(0b0110));
        assert_eq!(poll_core(&mut state, 0b1010, FlagsWaitMode::ALL), None);
        assert_eq!(poll_core(&mut state, 0b0110, FlagsWaitMode::ALL), Some(0b0110));
    }

    #[test]
    fn auto_clear_consumes_matched_bits_only() {
        let mut state = 0b1111;
        let mode = FlagsWaitMode::CLEAR;
        assert_eq!(poll_core(&mut state, 0b0011, mode), Some(0b1111));
        assert_eq!(state, 0b1100);
    }

    // Setting then clearing the same bits restores the original pattern
    #[quickcheck_macros::quickcheck]
    fn set_then_clear_roundtrip(state: u32, bits: u32) -> bool {
        let bits = bits & !state;
        let set = state | bits;
        (set & !bits) == state
    }
}
