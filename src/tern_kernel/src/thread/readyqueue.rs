//! The thread ready queue: one FIFO per priority level, plus a one-word
//! bitmap recording which levels are non-empty.
//!
//! Invariant: bit `p` of the bitmap is set iff `queues[p]` is non-empty.
//! Threads in the Ready *or* Running state occupy the list of their
//! effective priority; the running thread is the head of the
//! highest-precedence non-empty list until it blocks or is rotated away.
use crate::{
    csec::{CpuLockCell, CpuLockGuard},
    thread::{ThreadCb, ThreadRef},
    utils::{list, Init, PrioBitmap},
    Port, Priority, PRIORITY_LEVELS,
};

pub(crate) struct ReadyQueue<Traits: Port> {
    /// The segregated thread ready queues, one per priority.
    queues: [CpuLockCell<Traits, list::ListHead<ThreadRef<Traits>>>; PRIORITY_LEVELS],

    /// The ready bitmap.
    bitmap: CpuLockCell<Traits, PrioBitmap>,
}

impl<Traits: Port> Init for ReadyQueue<Traits> {
    const INIT: Self = Self {
        queues: Init::INIT,
        bitmap: Init::INIT,
    };
}

impl<Traits: Port> ReadyQueue<Traits> {
    /// Insert `thread` at the tail of the ready list of its effective
    /// priority.
    ///
    /// # Safety
    ///
    /// `thread` must not currently be on any ready list.
    pub(crate) unsafe fn push_back_thread(
        &self,
        lock: &mut CpuLockGuard<Traits>,
        thread: &'static ThreadCb<Traits>,
    ) {
        let pri = thread.effective_priority_internal(lock);
        list::push_back(lock, &self.queues[pri], ThreadRef::from(thread));
        self.bitmap.write(&mut **lock).set(pri);
    }

    /// Unlink `thread` from the ready list of the given priority, clearing
    /// the bitmap bit if the list becomes empty. A no-op if the thread is
    /// not queued.
    pub(crate) fn remove_thread(
        &self,
        lock: &mut CpuLockGuard<Traits>,
        thread: &'static ThreadCb<Traits>,
        pri: Priority,
    ) {
        list::remove(lock, &self.queues[pri], ThreadRef::from(thread));
        if self.queues[pri].read(&**lock).is_empty() {
            self.bitmap.write(&mut **lock).clear(pri);
        }
    }

    /// The priority of the highest-precedence non-empty ready list.
    #[inline]
    pub(crate) fn front_priority(&self, lock: &mut CpuLockGuard<Traits>) -> Option<Priority> {
        self.bitmap.read(&**lock).find_first_set()
    }

    /// The next thread to run: the head of the highest-precedence
    /// non-empty ready list.
    pub(crate) fn front(
        &self,
        lock: &mut CpuLockGuard<Traits>,
    ) -> Option<&'static ThreadCb<Traits>> {
        let pri = self.front_priority(lock)?;
        let head = self.queues[pri].read(&**lock).first;
        // The bitmap said the list is non-empty
        Some(head.unwrap().get())
    }

    /// Return a flag indicating whether there's a queued thread whose
    /// priority precedes `pri` (i.e. is numerically smaller).
    #[inline]
    pub(crate) fn has_thread_preceding(
        &self,
        lock: &mut CpuLockGuard<Traits>,
        pri: Priority,
    ) -> bool {
        match self.front_priority(lock) {
            Some(head_pri) => head_pri < pri,
            None => false,
        }
    }

    /// Move `thread` from the list of `old_pri` to the tail of the list of
    /// its (already updated) effective priority.
    pub(crate) fn requeue_thread(
        &self,
        lock: &mut CpuLockGuard<Traits>,
        thread: &'static ThreadCb<Traits>,
        old_pri: Priority,
    ) {
        self.remove_thread(lock, thread, old_pri);
        // Safety: `thread` was just unlinked
        unsafe { self.push_back_thread(lock, thread) };
    }

    /// Round-robin rotation: move the head of the list at `pri` to the
    /// tail. A no-op unless the list holds more than one thread.
    pub(crate) fn rotate(&self, lock: &mut CpuLockGuard<Traits>, pri: Priority) {
        let head = *self.queues[pri].read(&**lock);
        let (Some(first), Some(last)) = (head.first, head.last) else {
            return;
        };
        if first == last {
            return;
        }
        list::remove(lock, &self.queues[pri], first);
        list::push_back(lock, &self.queues[pri], first);
    }
}
