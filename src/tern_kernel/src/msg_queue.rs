//! Message queues — copying FIFOs of fixed-size messages
//!
//! Unlike a [data queue](crate::data_queue), which moves bare pointers, a
//! message queue copies each message into and out of a caller-provided
//! byte buffer. A message can be sent at normal priority (tail of the
//! queue), urgent (head of the queue, ahead even of earlier urgent
//! messages), or with an explicit per-message priority, in which case it's
//! inserted in priority order among the stored messages (FIFO among
//! equals).
//!
//! Each buffer slot carries one extra byte recording the stored message's
//! priority, so a queue over an `N`-byte buffer holds
//! `N / (msg_size + 1)` messages.
use core::{fmt, ptr};

use crate::{
    csec::{self, CpuLockCell, CpuLockGuard},
    ctx,
    error::{CreateError, DeleteError, NoExistError, QueryError, ReceiveError, SendError},
    thread, timeout,
    utils::{BufRegion, Init, ObjectMagic},
    wait::{WaitPayload, WaitQueue},
    KernelTraits, Port, Ticks, NO_WAIT, WAIT_FOREVER,
};

/// Per-message priority. Higher values are received first.
pub type MsgPriority = u8;

/// The priority recorded for a plain [`send`].
const PRIORITY_NORMAL: MsgPriority = 0;

/// The priority recorded for [`send_urgent`].
const PRIORITY_URGENT: MsgPriority = MsgPriority::MAX;

/// How a parked sender's message is to be stored once room appears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MsgDisposition {
    /// At the tail.
    Tail,
    /// At the head, ahead of everything stored.
    Head,
    /// In priority order among the stored messages.
    Priority(MsgPriority),
}

/// *Message-queue control block* — the state data of a message queue.
/// Caller-provided `'static` storage; [`create`] initializes it in place.
pub struct MsgQueueCb<Traits: Port> {
    magic: CpuLockCell<Traits, ObjectMagic>,

    /// The message storage: `capacity × msg_size` message bytes followed
    /// by `capacity` priority bytes.
    buf: CpuLockCell<Traits, BufRegion<u8>>,

    msg_size: CpuLockCell<Traits, usize>,
    capacity: CpuLockCell<Traits, usize>,

    /// The ring index of the oldest message.
    first: CpuLockCell<Traits, usize>,

    /// The number of stored messages.
    len: CpuLockCell<Traits, usize>,

    send_queue: WaitQueue<Traits>,
    recv_queue: WaitQueue<Traits>,
}

// Safety: The buffer is only accessed inside the critical section.
unsafe impl<Traits: Port> Send for MsgQueueCb<Traits> {}
unsafe impl<Traits: Port> Sync for MsgQueueCb<Traits> {}

impl<Traits: Port> Init for MsgQueueCb<Traits> {
    const INIT: Self = Self {
        magic: Init::INIT,
        buf: Init::INIT,
        msg_size: Init::INIT,
        capacity: Init::INIT,
        first: Init::INIT,
        len: Init::INIT,
        send_queue: Init::INIT,
        recv_queue: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for MsgQueueCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MsgQueueCb")
            .field("self", &(self as *const _))
            .field("msg_size", &self.msg_size)
            .field("capacity", &self.capacity)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

fn msg_queue_cb_check<Traits: Port>(
    lock: &mut CpuLockGuard<Traits>,
    mq: &MsgQueueCb<Traits>,
) -> Result<(), NoExistError> {
    if *mq.magic.read(&**lock) != ObjectMagic::MSG_QUEUE {
        Err(NoExistError::NoExist)
    } else {
        Ok(())
    }
}

/// Initialize a message queue over `buf` with messages of `msg_size`
/// bytes. The capacity is `buf.len() / (msg_size + 1)`; zero capacity
/// gives a rendezvous queue.
pub fn create<Traits: KernelTraits>(
    mq: &'static MsgQueueCb<Traits>,
    buf: BufRegion<u8>,
    msg_size: usize,
) -> Result<(), CreateError> {
    if Traits::is_interrupt_context() {
        return Err(CreateError::BadContext);
    }
    let mut lock = csec::lock_cpu::<Traits>()?;

    if *mq.magic.read(&*lock) == ObjectMagic::MSG_QUEUE {
        return Err(CreateError::BadState);
    }
    if msg_size == 0 {
        return Err(CreateError::BadParam);
    }

    mq.buf.replace(&mut *lock, buf);
    mq.msg_size.replace(&mut *lock, msg_size);
    mq.capacity.replace(&mut *lock, buf.len() / (msg_size + 1));
    mq.first.replace(&mut *lock, 0);
    mq.len.replace(&mut *lock, 0);
    mq.magic.replace(&mut *lock, ObjectMagic::MSG_QUEUE);
    Ok(())
}

/// Invalidate a message queue, releasing all waiters with
/// [`ResultCode::Deleted`].
///
/// [`ResultCode::Deleted`]: crate::ResultCode::Deleted
pub fn delete<Traits: KernelTraits>(mq: &'static MsgQueueCb<Traits>) -> Result<(), DeleteError> {
    if Traits::is_interrupt_context() {
        return Err(DeleteError::BadContext);
    }
    let mut lock = csec::lock_cpu::<Traits>()?;
    msg_queue_cb_check(&mut lock, mq)?;

    mq.send_queue.wake_up_all_deleted(&mut lock);
    mq.recv_queue.wake_up_all_deleted(&mut lock);
    mq.magic.replace(&mut *lock, ObjectMagic::NONE);

    thread::unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Ring geometry snapshot, read once per operation.
#[derive(Clone, Copy)]
struct Ring {
    buf: BufRegion<u8>,
    msg_size: usize,
    capacity: usize,
    first: usize,
    len: usize,
}

fn ring<Traits: Port>(lock: &mut CpuLockGuard<Traits>, mq: &MsgQueueCb<Traits>) -> Ring {
    Ring {
        buf: *mq.buf.read(&**lock),
        msg_size: *mq.msg_size.read(&**lock),
        capacity: *mq.capacity.read(&**lock),
        first: *mq.first.read(&**lock),
        len: *mq.len.read(&**lock),
    }
}

impl Ring {
    /// The address of the message slot at physical index `phys`.
    fn msg_ptr(&self, phys: usize) -> *mut u8 {
        debug_assert!(phys < self.capacity);
        (self.buf.as_ptr() as *mut u8).wrapping_add(phys * self.msg_size)
    }

    /// The address of the priority byte of the slot at physical index
    /// `phys`.
    fn prio_ptr(&self, phys: usize) -> *mut u8 {
        debug_assert!(phys < self.capacity);
        (self.buf.as_ptr() as *mut u8).wrapping_add(self.capacity * self.msg_size + phys)
    }

    fn phys(&self, logical: usize) -> usize {
        (self.first + logical) % self.capacity
    }
}

/// Store `msg` in the ring according to `disposition`. Fails when the ring
/// is full (or has no storage at all).
///
/// # Safety
///
/// `msg` must be valid for reads of `msg_size` bytes.
unsafe fn ring_write<Traits: Port>(
    lock: &mut CpuLockGuard<Traits>,
    mq: &MsgQueueCb<Traits>,
    msg: *const u8,
    disposition: MsgDisposition,
) -> bool {
    let r = ring(lock, mq);
    if r.len >= r.capacity {
        return false;
    }

    let (phys, new_first) = match disposition {
        MsgDisposition::Tail => (r.phys(r.len), r.first),
        MsgDisposition::Head => {
            let slot = (r.first + r.capacity - 1) % r.capacity;
            (slot, slot)
        }
        MsgDisposition::Priority(prio) => {
            // Find the first stored message that the new one precedes
            let mut k = 0;
            while k < r.len {
                // Safety: The slot is within the ring and holds a message
                let stored = unsafe { r.prio_ptr(r.phys(k)).read() };
                if stored < prio {
                    break;
                }
                k += 1;
            }

            // Shift the messages at `k..len` one slot toward the tail
            let mut j = r.len;
            while j > k {
                // Safety: Both slots are within the ring; distinct slots
                // never overlap
                unsafe {
                    ptr::copy_nonoverlapping(
                        r.msg_ptr(r.phys(j - 1)),
                        r.msg_ptr(r.phys(j)),
                        r.msg_size,
                    );
                    r.prio_ptr(r.phys(j)).write(r.prio_ptr(r.phys(j - 1)).read());
                }
                j -= 1;
            }

            (r.phys(k), r.first)
        }
    };

    let prio = match disposition {
        MsgDisposition::Tail => PRIORITY_NORMAL,
        MsgDisposition::Head => PRIORITY_URGENT,
        MsgDisposition::Priority(prio) => prio,
    };

    // Safety: `phys < capacity` so the destination lies within the ring;
    // `msg` is readable per the caller's contract
    unsafe {
        ptr::copy_nonoverlapping(msg, r.msg_ptr(phys), r.msg_size);
        r.prio_ptr(phys).write(prio);
    }

    mq.first.replace(&mut **lock, new_first);
    mq.len.replace(&mut **lock, r.len + 1);
    true
}

/// Copy the oldest message out of the ring into `out`.
///
/// # Safety
///
/// `out` must be valid for writes of `msg_size` bytes.
unsafe fn ring_read<Traits: Port>(
    lock: &mut CpuLockGuard<Traits>,
    mq: &MsgQueueCb<Traits>,
    out: *mut u8,
) -> bool {
    let r = ring(lock, mq);
    if r.len == 0 {
        return false;
    }

    // Safety: The head slot holds a message; `out` is writable per the
    // caller's contract
    unsafe {
        ptr::copy_nonoverlapping(r.msg_ptr(r.first), out, r.msg_size);
    }
    mq.first.replace(&mut **lock, (r.first + 1) % r.capacity);
    mq.len.replace(&mut **lock, r.len - 1);
    true
}

fn send_inner<Traits: KernelTraits>(
    mq: &'static MsgQueueCb<Traits>,
    msg: &[u8],
    timeout_ticks: Ticks,
    disposition: MsgDisposition,
) -> Result<(), SendError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    msg_queue_cb_check(&mut lock, mq)?;

    if msg.len() != *mq.msg_size.read(&*lock) {
        return Err(SendError::BadParam);
    }

    // A blocked receiver gets the message copied straight into its buffer
    let handed_off = mq.recv_queue.with_first_wait_payload(&mut lock, |payload, _| {
        match payload {
            Some(WaitPayload::MsgQueueRecv { buf, cap }) => {
                debug_assert!(*cap >= msg.len());
                // Safety: The receiver's buffer stays valid while it's
                // blocked; length checked at its call site
                unsafe {
                    ptr::copy_nonoverlapping(msg.as_ptr(), *buf, msg.len());
                }
                true
            }
            Some(_) => unreachable!(),
            None => false,
        }
    });
    if handed_off {
        let woke = mq.recv_queue.wake_up_one(&mut lock);
        debug_assert!(woke);
        thread::unlock_cpu_and_check_preemption(lock);
        return Ok(());
    }

    // Safety: `msg` is a live slice of `msg_size` bytes
    if unsafe { ring_write(&mut lock, mq, msg.as_ptr(), disposition) } {
        return Ok(());
    }

    if timeout_ticks == NO_WAIT {
        return Err(SendError::Timeout);
    }

    ctx::expect_waitable_context::<Traits>()?;

    let payload = WaitPayload::MsgQueueSend {
        msg: msg.as_ptr(),
        len: msg.len(),
        disposition,
    };

    // A receiver copies this message out of our buffer when room appears;
    // the buffer stays valid because this thread stays blocked
    if timeout_ticks == WAIT_FOREVER {
        mq.send_queue.wait(&mut lock, payload)?;
    } else {
        timeout::check_duration(timeout_ticks)?;
        mq.send_queue.wait_timeout(&mut lock, payload, timeout_ticks)?;
    }

    Ok(())
}

/// Send a message (FIFO order).
///
/// `msg` must be exactly `msg_size` bytes. `timeout` may be [`NO_WAIT`]
/// (poll), a tick count, or [`WAIT_FOREVER`].
pub fn send<Traits: KernelTraits>(
    mq: &'static MsgQueueCb<Traits>,
    msg: &[u8],
    timeout: Ticks,
) -> Result<(), SendError> {
    send_inner(mq, msg, timeout, MsgDisposition::Tail)
}

/// Send an urgent message: it's placed at the head of the queue, to be
/// received before anything already stored.
pub fn send_urgent<Traits: KernelTraits>(
    mq: &'static MsgQueueCb<Traits>,
    msg: &[u8],
    timeout: Ticks,
) -> Result<(), SendError> {
    send_inner(mq, msg, timeout, MsgDisposition::Head)
}

/// Send a message with an explicit priority. It's inserted among the
/// stored messages in descending priority order; messages of equal
/// priority keep their send order. Plain [`send`] stores at priority 0 and
/// [`send_urgent`] at the maximum.
pub fn send_with_priority<Traits: KernelTraits>(
    mq: &'static MsgQueueCb<Traits>,
    msg: &[u8],
    priority: MsgPriority,
    timeout: Ticks,
) -> Result<(), SendError> {
    send_inner(mq, msg, timeout, MsgDisposition::Priority(priority))
}

/// Receive the oldest (highest-priority) message into `buf`. Returns the
/// message length (always `msg_size`).
///
/// `buf` must hold at least `msg_size` bytes. `timeout` may be [`NO_WAIT`]
/// (poll), a tick count, or [`WAIT_FOREVER`].
pub fn receive<Traits: KernelTraits>(
    mq: &'static MsgQueueCb<Traits>,
    buf: &mut [u8],
    timeout_ticks: Ticks,
) -> Result<usize, ReceiveError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    msg_queue_cb_check(&mut lock, mq)?;

    let msg_size = *mq.msg_size.read(&*lock);
    if buf.len() < msg_size {
        return Err(ReceiveError::BadParam);
    }

    // Safety: `buf` holds at least `msg_size` bytes, checked above
    if unsafe { ring_read(&mut lock, mq, buf.as_mut_ptr()) } {
        // Room appeared: pull the head sender's message into the ring
        let pulled = mq.send_queue.with_first_wait_payload(&mut lock, |payload, _| {
            match payload {
                Some(WaitPayload::MsgQueueSend {
                    msg,
                    len,
                    disposition,
                }) => {
                    debug_assert_eq!(*len, msg_size);
                    Some((*msg, *disposition))
                }
                Some(_) => unreachable!(),
                None => None,
            }
        });
        if let Some((pending, disposition)) = pulled {
            // Safety: The sender's message stays valid while it's blocked
            let stored = unsafe { ring_write(&mut lock, mq, pending, disposition) };
            debug_assert!(stored);
            let woke = mq.send_queue.wake_up_one(&mut lock);
            debug_assert!(woke);
            thread::unlock_cpu_and_check_preemption(lock);
        }
        return Ok(msg_size);
    }

    // The ring is empty; copy straight out of a blocked sender's buffer
    let direct = mq.send_queue.with_first_wait_payload(&mut lock, |payload, _| {
        match payload {
            Some(WaitPayload::MsgQueueSend { msg, len, .. }) => {
                debug_assert_eq!(*len, msg_size);
                // Safety: The sender's message stays valid while it's
                // blocked; `buf` holds at least `msg_size` bytes
                unsafe {
                    ptr::copy_nonoverlapping(*msg, buf.as_mut_ptr(), *len);
                }
                true
            }
            Some(_) => unreachable!(),
            None => false,
        }
    });
    if direct {
        let woke = mq.send_queue.wake_up_one(&mut lock);
        debug_assert!(woke);
        thread::unlock_cpu_and_check_preemption(lock);
        return Ok(msg_size);
    }

    if timeout_ticks == NO_WAIT {
        return Err(ReceiveError::Timeout);
    }

    ctx::expect_waitable_context::<Traits>()?;

    let payload = WaitPayload::MsgQueueRecv {
        buf: buf.as_mut_ptr(),
        cap: buf.len(),
    };

    if timeout_ticks == WAIT_FOREVER {
        mq.recv_queue.wait(&mut lock, payload)?;
    } else {
        timeout::check_duration(timeout_ticks)?;
        mq.recv_queue.wait_timeout(&mut lock, payload, timeout_ticks)?;
    }

    Ok(msg_size)
}

/// Discard every stored message. Blocked senders stay blocked; a
/// subsequent receive pulls their messages in order.
pub fn flush<Traits: KernelTraits>(mq: &'static MsgQueueCb<Traits>) -> Result<(), QueryError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    msg_queue_cb_check(&mut lock, mq)?;

    mq.first.replace(&mut *lock, 0);
    mq.len.replace(&mut *lock, 0);
    Ok(())
}

/// The number of stored messages.
pub fn len<Traits: KernelTraits>(mq: &'static MsgQueueCb<Traits>) -> Result<usize, QueryError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    msg_queue_cb_check(&mut lock, mq)?;
    Ok(*mq.len.read(&*lock))
}

/// The queue capacity in messages.
pub fn capacity<Traits: KernelTraits>(
    mq: &'static MsgQueueCb<Traits>,
) -> Result<usize, QueryError> {
    let mut lock = csec::lock_cpu::<Traits>()?;
    msg_queue_cb_check(&mut lock, mq)?;
    Ok(*mq.capacity.read(&*lock))
}
