//! Data queues — FIFOs of pointer-sized entries
//!
//! A data queue moves `*mut ()` entries through a caller-provided ring
//! buffer. Senders block when the ring is full; receivers block when it's
//! empty. A queue of capacity zero degenerates into a synchronous
//! rendezvous: a send completes only by meeting a receive, and vice versa.
use core::fmt;

use crate::{
    csec::{self, CpuLockCell, CpuLockGuard},
    ctx,
    error::{CreateError, DeleteError, NoExistError, QueryError, ReceiveError, SendError},
    thread, timeout,
    utils::{BufRegion, Init, ObjectMagic},
    wait::{WaitPayload, WaitQueue},
    KernelTraits, Port, Ticks, NO_WAIT, WAIT_FOREVER,
};

/// *Data-queue control block* — the state data of a data queue.
/// Caller-provided `'static` storage; [`create`] initializes it in place.
pub struct DataQueueCb<Traits: Port> {
    magic: CpuLockCell<Traits, ObjectMagic>,

    /// The ring storage. May be empty (capacity zero).
    ring: CpuLockCell<Traits, BufRegion<*mut ()>>,

    /// The index of the oldest entry.
    first: CpuLockCell<Traits, usize>,

    /// The number of stored entries.
    len: CpuLockCell<Traits, usize>,

    send_queue: WaitQueue<Traits>,
    recv_queue: WaitQueue<Traits>,
}

// Safety: The entries are raw pointers whose pointees the kernel never
// touches; the ring itself is only accessed inside the critical section.
unsafe impl<Traits: Port> Send for DataQueueCb<Traits> {}
unsafe impl<Traits: Port> Sync for DataQueueCb<Traits> {}

impl<Traits: Port> Init for DataQueueCb<Traits> {
    const INIT: Self = Self {
        magic: Init::INIT,
        ring: Init::INIT,
        first: Init::INIT,
        len: Init::INIT,
        send_queue: Init::INIT,
        recv_queue: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for DataQueueCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DataQueueCb")
            .field("self", &(self as *const _))
            .field("first", &self.first)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

fn data_queue_cb_check<Traits: Port>(
    lock: &mut CpuLockGuard<Traits>,
    dq: &DataQueueCb<Traits>,
) -> Result<(), NoExistError> {
    if *dq.magic.read(&**lock) != ObjectMagic::DATA_QUEUE {
        Err(NoExistError::NoExist)
    } else {
        Ok(())
    }
}

/// Initialize a data queue over the given ring storage. The capacity is
/// the storage length; [`BufRegion::empty`] gives a rendezvous queue.
pub fn create<Traits: KernelTraits>(
    dq: &'static DataQueueCb<Traits>,
    ring: BufRegion<*mut ()>,
) -> Result<(), CreateError> {
    if Traits::is_interrupt_context() {
        return Err(CreateError::BadContext);
    }
    let mut lock = csec::lock_cpu::<Traits>()?;

    if *dq.magic.read(&*lock) == ObjectMagic::DATA_QUEUE {
        return Err(CreateError::BadState);
    }

    dq.ring.replace(&mut *lock, ring);
    dq.first.replace(&mut *lock, 0);
    dq.len.replace(&mut *lock, 0);
    dq.magic.replace(&mut *lock, ObjectMagic::DATA_QUEUE);
    Ok(())
}

/// Invalidate a data queue, releasing all waiters (senders and receivers)
/// with [`ResultCode::Deleted`].
///
/// [`ResultCode::Deleted`]: crate::ResultCode::Deleted
pub fn delete<Traits: KernelTraits>(dq: &'static DataQueueCb<Traits>) -> Result<(), DeleteError> {
    if Traits::is_interrupt_context() {
        return Err(DeleteError::BadContext);
    }
    let mut lock = csec::lock_cpu::<Traits>()?;
    data_queue_cb_check(&mut lock, dq)?;

    dq.send_queue.wake_up_all_deleted(&mut lock);
    dq.recv_queue.wake_up_all_deleted(&mut lock);
    dq.magic.replace(&mut *lock, ObjectMagic::NONE);

    thread::unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Store `data` in the ring: at the tail normally, at the head for a
/// "send first". Fails when the ring is full (or has no storage at all).
fn ring_write<Traits: Port>(
    lock: &mut CpuLockGuard<Traits>,
    dq: &DataQueueCb<Traits>,
    data: *mut (),
    to_head: bool,
) -> bool {
    let ring = *dq.ring.read(&**lock);
    let len = *dq.len.read(&**lock);
    if len >= ring.len() {
        return false;
    }

    let first = *dq.first.read(&**lock);
    if to_head {
        let slot = (first + ring.len() - 1) % ring.len();
        // Safety: `slot < ring.len()`, inside the critical section
        unsafe { ring.write(slot, data) };
        dq.first.replace(&mut **lock, slot);
    } else {
        let slot = (first + len) % ring.len();
        // Safety: `slot < ring.len()`, inside the critical section
        unsafe { ring.write(slot, data) };
    }
    dq.len.replace(&mut **lock, len + 1);
    true
}

/// Take the oldest entry out of the ring.
fn ring_read<Traits: Port>(
    lock: &mut CpuLockGuard<Traits>,
    dq: &DataQueueCb<Traits>,
) -> Option<*mut ()> {
    let len = *dq.len.read(&**lock);
    if len == 0 {
        return None;
    }

    let ring = *dq.ring.read(&**lock);
    let first = *dq.first.read(&**lock);
    // Safety: `first < ring.len()` and the slot was written, inside the
    // critical section
    let data = unsafe { ring.read(first) };
    dq.first.replace(&mut **lock, (first + 1) % ring.len());
    dq.len.replace(&mut **lock, len - 1);
    Some(data)
}

fn send_inner<Traits: KernelTraits>(
    dq: &'static DataQueueCb<Traits>,
    data: *mut (),
    timeout_ticks: Ticks,
    to_head: bool,
) -> Result<(), SendError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    data_queue_cb_check(&mut lock, dq)?;

    // A blocked receiver takes the entry directly, bypassing the ring
    let handed_off = dq.recv_queue.with_first_wait_payload(&mut lock, |payload, token| {
        match payload {
            Some(WaitPayload::DataQueueRecv { slot }) => {
                slot.read(token).set(data);
                true
            }
            Some(_) => unreachable!(),
            None => false,
        }
    });
    if handed_off {
        let woke = dq.recv_queue.wake_up_one(&mut lock);
        debug_assert!(woke);
        thread::unlock_cpu_and_check_preemption(lock);
        return Ok(());
    }

    if ring_write(&mut lock, dq, data, to_head) {
        return Ok(());
    }

    if timeout_ticks == NO_WAIT {
        return Err(SendError::Timeout);
    }

    ctx::expect_waitable_context::<Traits>()?;

    let payload = WaitPayload::DataQueueSend { data, to_head };

    // A receiver moves this entry into the ring (or takes it directly)
    // when room appears
    if timeout_ticks == WAIT_FOREVER {
        dq.send_queue.wait(&mut lock, payload)?;
    } else {
        timeout::check_duration(timeout_ticks)?;
        dq.send_queue.wait_timeout(&mut lock, payload, timeout_ticks)?;
    }

    Ok(())
}

/// Send an entry (FIFO order).
///
/// `timeout` may be [`NO_WAIT`] (poll), a tick count, or [`WAIT_FOREVER`].
pub fn send<Traits: KernelTraits>(
    dq: &'static DataQueueCb<Traits>,
    data: *mut (),
    timeout: Ticks,
) -> Result<(), SendError> {
    send_inner(dq, data, timeout, false)
}

/// Send an entry to the head of the queue, to be received before anything
/// already stored.
pub fn send_to_head<Traits: KernelTraits>(
    dq: &'static DataQueueCb<Traits>,
    data: *mut (),
    timeout: Ticks,
) -> Result<(), SendError> {
    send_inner(dq, data, timeout, true)
}

/// Receive the oldest entry.
///
/// `timeout` may be [`NO_WAIT`] (poll), a tick count, or [`WAIT_FOREVER`].
pub fn receive<Traits: KernelTraits>(
    dq: &'static DataQueueCb<Traits>,
    timeout_ticks: Ticks,
) -> Result<*mut (), ReceiveError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    data_queue_cb_check(&mut lock, dq)?;

    if let Some(data) = ring_read(&mut lock, dq) {
        // Room appeared: pull the head sender's entry into the ring
        let pulled = dq.send_queue.with_first_wait_payload(&mut lock, |payload, _| {
            match payload {
                Some(WaitPayload::DataQueueSend { data, to_head }) => Some((*data, *to_head)),
                Some(_) => unreachable!(),
                None => None,
            }
        });
        if let Some((pending, to_head)) = pulled {
            let stored = ring_write(&mut lock, dq, pending, to_head);
            debug_assert!(stored);
            let woke = dq.send_queue.wake_up_one(&mut lock);
            debug_assert!(woke);
            thread::unlock_cpu_and_check_preemption(lock);
        }
        return Ok(data);
    }

    // The ring is empty; a blocked sender (zero capacity, or just flushed)
    // hands its entry directly
    let direct = dq.send_queue.with_first_wait_payload(&mut lock, |payload, _| {
        match payload {
            Some(WaitPayload::DataQueueSend { data, .. }) => Some(*data),
            Some(_) => unreachable!(),
            None => None,
        }
    });
    if let Some(data) = direct {
        let woke = dq.send_queue.wake_up_one(&mut lock);
        debug_assert!(woke);
        thread::unlock_cpu_and_check_preemption(lock);
        return Ok(data);
    }

    if timeout_ticks == NO_WAIT {
        return Err(ReceiveError::Timeout);
    }

    ctx::expect_waitable_context::<Traits>()?;

    let payload = WaitPayload::DataQueueRecv { slot: Init::INIT };

    let result = if timeout_ticks == WAIT_FOREVER {
        dq.recv_queue.wait(&mut lock, payload)?
    } else {
        timeout::check_duration(timeout_ticks)?;
        dq.recv_queue.wait_timeout(&mut lock, payload, timeout_ticks)?
    };

    if let WaitPayload::DataQueueRecv { slot } = result {
        Ok(slot.read(&*lock).get())
    } else {
        unreachable!()
    }
}

/// Discard every stored entry. Blocked senders stay blocked; a subsequent
/// receive pulls their entries in order.
pub fn flush<Traits: KernelTraits>(dq: &'static DataQueueCb<Traits>) -> Result<(), QueryError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    data_queue_cb_check(&mut lock, dq)?;

    dq.first.replace(&mut *lock, 0);
    dq.len.replace(&mut *lock, 0);
    Ok(())
}

/// The number of stored entries.
pub fn len<Traits: KernelTraits>(dq: &'static DataQueueCb<Traits>) -> Result<usize, QueryError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    data_queue_cb_check(&mut lock, dq)?;
    Ok(*dq.len.read(&*lock))
}

/// The ring capacity.
pub fn capacity<Traits: KernelTraits>(
    dq: &'static DataQueueCb<Traits>,
) -> Result<usize, QueryError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    data_queue_cb_check(&mut lock, dq)?;
    Ok(dq.ring.read(&*lock).len())
}
