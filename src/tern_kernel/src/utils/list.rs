//! Intrusive doubly linked lists.
//!
//! The kernel keeps threads on ready lists, wait objects on wait queues, and
//! timed events on the timer list without owning any of them. Each element
//! type embeds a link cell; a list head stores the first and last element.
//! All link cells are [`CpuLockCell`]s, so list manipulation is only possible
//! inside the kernel critical section.
//!
//! A node whose link cell holds `None` is on no list. [`remove`] of such a
//! node is a no-op; wake and cancellation paths rely on this to unlink
//! unconditionally.
use crate::{
    csec::{CpuLockCell, CpuLockGuard},
    Port,
};

/// The links of a node that is currently on a list.
pub(crate) struct Link<R> {
    pub prev: Option<R>,
    pub next: Option<R>,
}

impl<R: Copy> Clone for Link<R> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<R: Copy> Copy for Link<R> {}

/// A list head.
pub(crate) struct ListHead<R> {
    pub first: Option<R>,
    pub last: Option<R>,
}

impl<R: Copy> Clone for ListHead<R> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<R: Copy> Copy for ListHead<R> {}

impl<R> crate::utils::Init for ListHead<R> {
    const INIT: Self = Self {
        first: None,
        last: None,
    };
}

impl<R> ListHead<R> {
    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Implemented by the cheap, `Copy` reference types (`ThreadRef`, `WaitRef`,
/// `TimeoutRef`) whose pointees embed a link cell.
pub(crate) trait ListNode<Traits: Port>: Copy + PartialEq {
    fn link(&self) -> &CpuLockCell<Traits, Option<Link<Self>>>;
}

/// Return `true` if `node` is on a list.
#[inline]
pub(crate) fn is_linked<Traits: Port, R: ListNode<Traits>>(
    lock: &mut CpuLockGuard<Traits>,
    node: R,
) -> bool {
    node.link().read(&**lock).is_some()
}

/// Append `node` to the back of the list.
pub(crate) fn push_back<Traits: Port, R: ListNode<Traits>>(
    lock: &mut CpuLockGuard<Traits>,
    head: &CpuLockCell<Traits, ListHead<R>>,
    node: R,
) {
    debug_assert!(!is_linked(lock, node));

    let mut h = *head.read(&**lock);
    match h.last {
        None => {
            h.first = Some(node);
            h.last = Some(node);
            node.link().replace(
                &mut **lock,
                Some(Link {
                    prev: None,
                    next: None,
                }),
            );
        }
        Some(tail) => {
            let mut tail_link = (*tail.link().read(&**lock)).unwrap();
            tail_link.next = Some(node);
            tail.link().replace(&mut **lock, Some(tail_link));
            node.link().replace(
                &mut **lock,
                Some(Link {
                    prev: Some(tail),
                    next: None,
                }),
            );
            h.last = Some(node);
        }
    }
    head.replace(&mut **lock, h);
}

/// Insert `node` immediately before `before`. `before == None` appends at
/// the back. Used for sorted insertion (the caller finds the position).
pub(crate) fn insert_before<Traits: Port, R: ListNode<Traits>>(
    lock: &mut CpuLockGuard<Traits>,
    head: &CpuLockCell<Traits, ListHead<R>>,
    node: R,
    before: Option<R>,
) {
    let Some(before) = before else {
        push_back(lock, head, node);
        return;
    };

    debug_assert!(!is_linked(lock, node));
    debug_assert!(is_linked(lock, before));

    let mut before_link = (*before.link().read(&**lock)).unwrap();
    let prev = before_link.prev;
    before_link.prev = Some(node);
    before.link().replace(&mut **lock, Some(before_link));

    node.link().replace(
        &mut **lock,
        Some(Link {
            prev,
            next: Some(before),
        }),
    );

    match prev {
        None => {
            let mut h = *head.read(&**lock);
            h.first = Some(node);
            head.replace(&mut **lock, h);
        }
        Some(prev) => {
            let mut prev_link = (*prev.link().read(&**lock)).unwrap();
            prev_link.next = Some(node);
            prev.link().replace(&mut **lock, Some(prev_link));
        }
    }
}

/// Remove and return the first element, if any.
pub(crate) fn pop_front<Traits: Port, R: ListNode<Traits>>(
    lock: &mut CpuLockGuard<Traits>,
    head: &CpuLockCell<Traits, ListHead<R>>,
) -> Option<R> {
    let node = head.read(&**lock).first?;
    remove(lock, head, node);
    Some(node)
}

/// Unlink `node` from the list headed by `head`. A no-op if `node` is on no
/// list.
///
/// `head` must be the head of the list `node` is actually on (if any).
pub(crate) fn remove<Traits: Port, R: ListNode<Traits>>(
    lock: &mut CpuLockGuard<Traits>,
    head: &CpuLockCell<Traits, ListHead<R>>,
    node: R,
) {
    let Some(link) = *node.link().read(&**lock) else {
        return;
    };

    match link.prev {
        None => {
            let mut h = *head.read(&**lock);
            debug_assert!(h.first == Some(node));
            h.first = link.next;
            if link.next.is_none() {
                h.last = None;
            }
            head.replace(&mut **lock, h);
        }
        Some(prev) => {
            let mut prev_link = (*prev.link().read(&**lock)).unwrap();
            prev_link.next = link.next;
            prev.link().replace(&mut **lock, Some(prev_link));
        }
    }

    match link.next {
        None => {
            if link.prev.is_some() {
                let mut h = *head.read(&**lock);
                debug_assert!(h.last == Some(node));
                h.last = link.prev;
                head.replace(&mut **lock, h);
            }
        }
        Some(next) => {
            let mut next_link = (*next.link().read(&**lock)).unwrap();
            next_link.prev = link.prev;
            next.link().replace(&mut **lock, Some(next_link));
        }
    }

    node.link().replace(&mut **lock, None);
}

/// Get the element following `node`, or `None` at the back.
#[inline]
pub(crate) fn next<Traits: Port, R: ListNode<Traits>>(
    lock: &mut CpuLockGuard<Traits>,
    node: R,
) -> Option<R> {
    node.link().read(&**lock).as_ref().and_then(|l| l.next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{csec, thread::ThreadCb};
    use core::ptr::NonNull;
    use std::cell::Cell as HostCell;

    struct TestPort;

    thread_local! {
        static LOCKED: HostCell<bool> = HostCell::new(false);
    }

    unsafe impl crate::Port for TestPort {
        type PortThreadState = ();

        unsafe fn dispatch_first_thread() -> ! {
            unreachable!()
        }
        unsafe fn yield_cpu() {}
        unsafe fn exit_and_dispatch(_: &'static ThreadCb<Self>) -> ! {
            unreachable!()
        }
        unsafe fn enter_cpu_lock() {
            LOCKED.with(|l| l.set(true));
        }
        unsafe fn leave_cpu_lock() {
            LOCKED.with(|l| l.set(false));
        }
        unsafe fn initialize_thread_state(_: &'static ThreadCb<Self>) {}
        fn is_cpu_lock_active() -> bool {
            LOCKED.with(|l| l.get())
        }
        fn is_task_context() -> bool {
            false
        }
        fn is_interrupt_context() -> bool {
            false
        }
    }

    struct TestNode {
        value: u32,
        link: CpuLockCell<TestPort, Option<Link<TestRef>>>,
    }

    impl TestNode {
        fn new(value: u32) -> Self {
            Self {
                value,
                link: CpuLockCell::new(None),
            }
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    struct TestRef(NonNull<TestNode>);

    impl ListNode<TestPort> for TestRef {
        fn link(&self) -> &CpuLockCell<TestPort, Option<Link<Self>>> {
            unsafe { &self.0.as_ref().link }
        }
    }

    fn collect(
        lock: &mut CpuLockGuard<TestPort>,
        head: &CpuLockCell<TestPort, ListHead<TestRef>>,
    ) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cursor = head.read(&**lock).first;
        while let Some(r) = cursor {
            out.push(unsafe { r.0.as_ref() }.value);
            cursor = next(lock, r);
        }
        out
    }

    #[test]
    fn fifo_order() {
        let nodes: Vec<TestNode> = (0..4).map(TestNode::new).collect();
        let head = CpuLockCell::new(ListHead { first: None, last: None });
        let mut lock = csec::lock_cpu::<TestPort>().unwrap();

        for n in &nodes {
            push_back(&mut lock, &head, TestRef(NonNull::from(n)));
        }
        assert_eq!(collect(&mut lock, &head), [0, 1, 2, 3]);

        for want in 0..4 {
            let r = pop_front(&mut lock, &head).unwrap();
            assert_eq!(unsafe { r.0.as_ref() }.value, want);
        }
        assert!(pop_front(&mut lock, &head).is_none());
    }

    #[test]
    fn remove_of_unlinked_node_is_a_no_op() {
        let a = TestNode::new(0);
        let b = TestNode::new(1);
        let head = CpuLockCell::new(ListHead { first: None, last: None });
        let mut lock = csec::lock_cpu::<TestPort>().unwrap();

        push_back(&mut lock, &head, TestRef(NonNull::from(&a)));

        // `b` is on no list; unlinking it must change nothing
        remove(&mut lock, &head, TestRef(NonNull::from(&b)));
        assert_eq!(collect(&mut lock, &head), [0]);

        // Unlinking twice is equally harmless
        remove(&mut lock, &head, TestRef(NonNull::from(&a)));
        remove(&mut lock, &head, TestRef(NonNull::from(&a)));
        assert_eq!(collect(&mut lock, &head), [] as [u32; 0]);
    }

    #[test]
    fn remove_from_middle_and_ends() {
        let nodes: Vec<TestNode> = (0..5).map(TestNode::new).collect();
        let head = CpuLockCell::new(ListHead { first: None, last: None });
        let mut lock = csec::lock_cpu::<TestPort>().unwrap();

        for n in &nodes {
            push_back(&mut lock, &head, TestRef(NonNull::from(n)));
        }

        remove(&mut lock, &head, TestRef(NonNull::from(&nodes[2])));
        assert_eq!(collect(&mut lock, &head), [0, 1, 3, 4]);
        remove(&mut lock, &head, TestRef(NonNull::from(&nodes[0])));
        assert_eq!(collect(&mut lock, &head), [1, 3, 4]);
        remove(&mut lock, &head, TestRef(NonNull::from(&nodes[4])));
        assert_eq!(collect(&mut lock, &head), [1, 3]);
    }

    #[test]
    fn insert_before_keeps_order() {
        let nodes: Vec<TestNode> = (0..3).map(TestNode::new).collect();
        let extra = TestNode::new(9);
        let head = CpuLockCell::new(ListHead { first: None, last: None });
        let mut lock = csec::lock_cpu::<TestPort>().unwrap();

        for n in &nodes {
            push_back(&mut lock, &head, TestRef(NonNull::from(n)));
        }

        insert_before(
            &mut lock,
            &head,
            TestRef(NonNull::from(&extra)),
            Some(TestRef(NonNull::from(&nodes[1]))),
        );
        assert_eq!(collect(&mut lock, &head), [0, 9, 1, 2]);
    }
}
