//! Intrusive FIFO and sleep queue
//!
//! Queues never own fibers: each context embeds one link per queue kind
//! and containers splice those links, so entering or leaving a queue is
//! allocation-free. A singly linked head/tail pair gives O(1) push and
//! pop; removal from the middle (wait-queue and worker-set departures)
//! walks the chain.

use crate::context::FiberContext;
use core::cell::Cell;

/// Which intrusive link a container threads through
///
/// A fiber is in at most one of ready/remote-ready/sleep/wait/terminated
/// at a time; the worker link is orthogonal membership in its
/// scheduler's worker set.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum LinkId {
    Worker = 0,
    Ready = 1,
    RemoteReady = 2,
    Sleep = 3,
    Wait = 4,
    Terminated = 5,
}

/// Number of link slots on each context
pub(crate) const LINK_COUNT: usize = 6;

/// One intrusive link slot
///
/// `linked` tracks membership so a fiber can ask "am I still in the
/// sleep queue?" after being resumed.
pub(crate) struct Link {
    next: Cell<*mut FiberContext>,
    linked: Cell<bool>,
}

impl Link {
    pub(crate) const fn new() -> Self {
        Link {
            next: Cell::new(std::ptr::null_mut()),
            linked: Cell::new(false),
        }
    }

    #[inline]
    pub(crate) fn is_linked(&self) -> bool {
        self.linked.get()
    }
}

/// Singly linked intrusive FIFO threading through one link slot
pub(crate) struct Fifo {
    id: LinkId,
    head: *mut FiberContext,
    tail: *mut FiberContext,
}

impl Fifo {
    pub(crate) const fn new(id: LinkId) -> Self {
        Fifo {
            id,
            head: std::ptr::null_mut(),
            tail: std::ptr::null_mut(),
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Append `ctx` to the tail
    ///
    /// # Safety
    ///
    /// `ctx` must be valid and not linked through this slot.
    pub(crate) unsafe fn push(&mut self, ctx: *mut FiberContext) {
        let link = (*ctx).link(self.id);
        debug_assert!(!link.is_linked(), "fiber already linked in {:?}", self.id);
        debug_assert!(
            !(*ctx).is_dispatcher(),
            "dispatcher fiber must never be queued"
        );

        link.next.set(std::ptr::null_mut());
        link.linked.set(true);
        if self.tail.is_null() {
            self.head = ctx;
        } else {
            (*self.tail).link(self.id).next.set(ctx);
        }
        self.tail = ctx;
    }

    /// Unlink and return the head
    ///
    /// # Safety
    ///
    /// All linked contexts must be valid.
    pub(crate) unsafe fn pop(&mut self) -> Option<*mut FiberContext> {
        if self.head.is_null() {
            return None;
        }
        let ctx = self.head;
        let link = (*ctx).link(self.id);
        self.head = link.next.get();
        if self.head.is_null() {
            self.tail = std::ptr::null_mut();
        }
        link.next.set(std::ptr::null_mut());
        link.linked.set(false);
        Some(ctx)
    }

    /// Unlink `ctx` from anywhere in the chain
    ///
    /// Returns `false` when `ctx` was not found.
    ///
    /// # Safety
    ///
    /// All linked contexts must be valid.
    pub(crate) unsafe fn remove(&mut self, ctx: *mut FiberContext) -> bool {
        let mut prev: *mut FiberContext = std::ptr::null_mut();
        let mut cur = self.head;
        while !cur.is_null() {
            let cur_link = (*cur).link(self.id);
            if cur == ctx {
                let next = cur_link.next.get();
                if prev.is_null() {
                    self.head = next;
                } else {
                    (*prev).link(self.id).next.set(next);
                }
                if self.tail == cur {
                    self.tail = prev;
                }
                cur_link.next.set(std::ptr::null_mut());
                cur_link.linked.set(false);
                return true;
            }
            prev = cur;
            cur = cur_link.next.get();
        }
        false
    }

    /// Whether any linked context satisfies `pred`
    ///
    /// # Safety
    ///
    /// All linked contexts must be valid; `pred` must not mutate links.
    pub(crate) unsafe fn any(&self, mut pred: impl FnMut(*mut FiberContext) -> bool) -> bool {
        let mut cur = self.head;
        while !cur.is_null() {
            if pred(cur) {
                return true;
            }
            cur = (*cur).link(self.id).next.get();
        }
        false
    }
}

/// Sleep queue: the sleep links kept sorted by deadline
///
/// Ascending by `tp`, FIFO among equal deadlines. Insertion walks the
/// chain; expiry pops from the head.
pub(crate) struct SleepQueue {
    list: Fifo,
}

impl SleepQueue {
    pub(crate) const fn new() -> Self {
        SleepQueue {
            list: Fifo::new(LinkId::Sleep),
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Insert `ctx` in deadline order
    ///
    /// # Safety
    ///
    /// `ctx` must be valid, not sleep-linked, and carry a finite `tp`.
    pub(crate) unsafe fn insert(&mut self, ctx: *mut FiberContext) {
        let link = (*ctx).link(LinkId::Sleep);
        debug_assert!(!link.is_linked(), "fiber already sleeping");
        debug_assert!(
            (*ctx).tp() != crate::clock::TP_NONE,
            "sleeping fiber needs a finite deadline"
        );

        let tp = (*ctx).tp();
        if self.list.head.is_null() || (*self.list.head).tp() > tp {
            // New head
            link.next.set(self.list.head);
            link.linked.set(true);
            if self.list.head.is_null() {
                self.list.tail = ctx;
            }
            self.list.head = ctx;
            return;
        }

        // Walk to the last entry with a deadline at or before ours
        let mut cur = self.list.head;
        loop {
            let next = (*cur).link(LinkId::Sleep).next.get();
            if next.is_null() || (*next).tp() > tp {
                break;
            }
            cur = next;
        }
        let next = (*cur).link(LinkId::Sleep).next.get();
        link.next.set(next);
        link.linked.set(true);
        (*cur).link(LinkId::Sleep).next.set(ctx);
        if next.is_null() {
            self.list.tail = ctx;
        }
    }

    /// Pop the head if its deadline has passed
    ///
    /// # Safety
    ///
    /// All linked contexts must be valid.
    pub(crate) unsafe fn pop_expired(&mut self, now: u64) -> Option<*mut FiberContext> {
        if self.list.head.is_null() || (*self.list.head).tp() > now {
            return None;
        }
        self.list.pop()
    }

    /// Earliest pending deadline
    ///
    /// # Safety
    ///
    /// All linked contexts must be valid.
    pub(crate) unsafe fn next_deadline(&self) -> Option<u64> {
        if self.list.head.is_null() {
            None
        } else {
            Some((*self.list.head).tp())
        }
    }

    /// Unlink a fiber woken before its deadline
    ///
    /// # Safety
    ///
    /// All linked contexts must be valid.
    pub(crate) unsafe fn remove(&mut self, ctx: *mut FiberContext) -> bool {
        self.list.remove(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TP_NONE;
    use crate::context::FiberContext;

    fn node() -> *mut FiberContext {
        FiberContext::new_test()
    }

    fn free(nodes: &[*mut FiberContext]) {
        for &n in nodes {
            unsafe { drop(Box::from_raw(n)) };
        }
    }

    #[test]
    fn test_fifo_order() {
        let (a, b, c) = (node(), node(), node());
        let mut q = Fifo::new(LinkId::Ready);
        assert!(q.is_empty());

        unsafe {
            q.push(a);
            q.push(b);
            q.push(c);
            assert!((*a).link(LinkId::Ready).is_linked());

            assert_eq!(q.pop(), Some(a));
            assert_eq!(q.pop(), Some(b));
            assert_eq!(q.pop(), Some(c));
            assert_eq!(q.pop(), None);
            assert!(!(*a).link(LinkId::Ready).is_linked());
        }
        assert!(q.is_empty());
        free(&[a, b, c]);
    }

    #[test]
    fn test_fifo_reuse_after_drain() {
        let a = node();
        let mut q = Fifo::new(LinkId::Ready);
        unsafe {
            q.push(a);
            assert_eq!(q.pop(), Some(a));
            // Tail was reset; push works again
            q.push(a);
            assert_eq!(q.pop(), Some(a));
        }
        free(&[a]);
    }

    #[test]
    fn test_fifo_remove_middle_and_tail() {
        let (a, b, c) = (node(), node(), node());
        let mut q = Fifo::new(LinkId::Wait);
        unsafe {
            q.push(a);
            q.push(b);
            q.push(c);

            assert!(q.remove(b));
            assert!(!(*b).link(LinkId::Wait).is_linked());
            assert!(!q.remove(b));

            // Tail removal keeps pushes working
            assert!(q.remove(c));
            q.push(c);

            assert_eq!(q.pop(), Some(a));
            assert_eq!(q.pop(), Some(c));
            assert_eq!(q.pop(), None);
        }
        free(&[a, b, c]);
    }

    #[test]
    fn test_fifo_any() {
        let (a, b) = (node(), node());
        let mut q = Fifo::new(LinkId::Worker);
        unsafe {
            q.push(a);
            q.push(b);
            assert!(q.any(|ctx| ctx == b));
            assert!(!q.any(|ctx| ctx.is_null()));
            q.pop();
            q.pop();
        }
        free(&[a, b]);
    }

    #[test]
    fn test_sleep_queue_ordering() {
        let (a, b, c, d) = (node(), node(), node(), node());
        let mut q = SleepQueue::new();
        unsafe {
            (*a).set_tp(30);
            (*b).set_tp(10);
            (*c).set_tp(20);
            (*d).set_tp(20); // duplicate deadline, FIFO after c

            q.insert(a);
            q.insert(b);
            q.insert(c);
            q.insert(d);

            assert_eq!(q.next_deadline(), Some(10));
            assert_eq!(q.pop_expired(5), None);
            assert_eq!(q.pop_expired(10), Some(b));
            assert_eq!(q.pop_expired(25), Some(c));
            assert_eq!(q.pop_expired(25), Some(d));
            assert_eq!(q.pop_expired(25), None);
            assert_eq!(q.next_deadline(), Some(30));
            assert_eq!(q.pop_expired(30), Some(a));
        }
        assert!(q.is_empty());
        free(&[a, b, c, d]);
    }

    #[test]
    fn test_sleep_queue_remove() {
        let (a, b) = (node(), node());
        let mut q = SleepQueue::new();
        unsafe {
            (*a).set_tp(10);
            (*b).set_tp(20);
            q.insert(a);
            q.insert(b);

            assert!(q.remove(a));
            assert_eq!(q.next_deadline(), Some(20));
            (*a).set_tp(TP_NONE);

            assert_eq!(q.pop_expired(u64::MAX - 1), Some(b));
        }
        free(&[a, b]);
    }
}
