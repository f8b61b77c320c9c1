//! Fiber context
//!
//! The central entity of the runtime: an execution stack plus a saved
//! register frame, flag bits, intrusive queue links, a wait-queue of
//! joiners, fiber-specific storage and a reference count.
//!
//! Locking discipline: `remote_splk` (on the scheduler) < `hook_splk` <
//! `splk`; no two contexts' `splk` are ever held together, and no lock
//! is held across a context switch.

use crate::arch::RegisterFrame;
use crate::clock::TP_NONE;
use crate::fifo::{Fifo, Link, LinkId, LINK_COUNT};
use crate::scheduler::Scheduler;
use crate::stack::FiberStack;
use crate::tls;
use core::cell::{Cell, UnsafeCell};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use strand_core::error::{FiberError, FiberResult};
use strand_core::flags::ContextFlags;
use strand_core::fss::{FssCleanup, FssKey, FssMap};
use strand_core::id::FiberId;
use strand_core::spinlock::RawSpinLock;

/// Panic payload delivering a one-shot forced stack unwind
///
/// Raised at the fiber's next resume after `request_unwinding`; the
/// entry wrapper recognizes and swallows it, so cancellation is not
/// reported as a panic.
pub struct ForcedUnwind;

type EntryBox = Box<dyn FnOnce()>;
type PanicPayload = Box<dyn Any + Send>;

/// A fiber's execution context
///
/// Heap-allocated and reference counted. Queue links and `tp` are only
/// touched by the owning scheduler's thread (the remote-ready link is
/// guarded by that scheduler's remote lock instead); `scheduler` is read
/// and rewritten under `hook_splk`; flags, the wait-queue, FSS and the
/// panic slot are guarded by `splk`.
pub struct FiberContext {
    /// Saved machine context; live only while the fiber is suspended
    regs: UnsafeCell<RegisterFrame>,

    /// `ContextFlags` bits
    flags: AtomicU8,

    /// Handles plus the owning scheduler's reference
    use_count: AtomicUsize,

    /// Owning scheduler; rewritten on migration under `hook_splk`
    scheduler: Cell<*const Scheduler>,

    /// Wake-up deadline, `TP_NONE` when not sleeping
    tp: Cell<u64>,

    /// Intrusive links, one per queue kind
    links: [Link; LINK_COUNT],

    /// Fibers blocked in `join` on this fiber
    wait_queue: UnsafeCell<Fifo>,

    /// Fiber-specific storage
    fss: UnsafeCell<FssMap>,

    /// Entry function, taken once when the fiber first runs
    entry: UnsafeCell<Option<EntryBox>>,

    /// Panic payload awaiting the first joiner
    panic_slot: UnsafeCell<Option<PanicPayload>>,

    /// Owned stack; `None` for the main context
    stack: Option<FiberStack>,

    /// Guards flags transitions, wait_queue, fss and panic_slot
    splk: RawSpinLock,

    /// Guards the scheduler pointer; the only lock a foreign thread may
    /// take on this fiber
    hook_splk: RawSpinLock,
}

// Safety: fields are shared across threads only under the discipline
// documented on the struct; the reference count is atomic.
unsafe impl Send for FiberContext {}
unsafe impl Sync for FiberContext {}

impl FiberContext {
    fn new(
        flags: ContextFlags,
        stack: Option<FiberStack>,
        scheduler: *const Scheduler,
        use_count: usize,
        entry: Option<EntryBox>,
    ) -> FiberContext {
        FiberContext {
            regs: UnsafeCell::new(RegisterFrame::zeroed()),
            flags: AtomicU8::new(flags.bits()),
            use_count: AtomicUsize::new(use_count),
            scheduler: Cell::new(scheduler),
            tp: Cell::new(TP_NONE),
            links: [
                Link::new(),
                Link::new(),
                Link::new(),
                Link::new(),
                Link::new(),
                Link::new(),
            ],
            wait_queue: UnsafeCell::new(Fifo::new(LinkId::Wait)),
            fss: UnsafeCell::new(FssMap::new()),
            entry: UnsafeCell::new(entry),
            panic_slot: UnsafeCell::new(None),
            stack,
            splk: RawSpinLock::new(),
            hook_splk: RawSpinLock::new(),
        }
    }

    /// Main context: adopts the thread's native stack
    ///
    /// The register frame stays zeroed until the main fiber first
    /// suspends; the thread itself holds the single reference.
    pub(crate) fn new_main(scheduler: *const Scheduler) -> *mut FiberContext {
        Box::into_raw(Box::new(FiberContext::new(
            ContextFlags::MAIN,
            None,
            scheduler,
            1,
            None,
        )))
    }

    /// Dispatcher context on a fresh stack
    ///
    /// The thread runtime holds the single reference and releases it at
    /// teardown.
    pub(crate) fn new_dispatcher(stack: FiberStack, scheduler: *const Scheduler) -> *mut FiberContext {
        let stack_top = stack.stack_top();
        let ctx = Box::into_raw(Box::new(FiberContext::new(
            ContextFlags::DISPATCHER,
            Some(stack),
            scheduler,
            1,
            None,
        )));
        unsafe {
            crate::arch::current::init_frame(
                (*ctx).regs.get(),
                stack_top,
                crate::scheduler::dispatcher_main,
                scheduler as usize,
            );
        }
        ctx
    }

    /// Worker context with a user entry function
    ///
    /// Starts with two references: the spawner's handle and the owning
    /// scheduler (released when the dispatcher reaps the fiber).
    pub fn new_worker(
        stack: FiberStack,
        entry: EntryBox,
        scheduler: *const Scheduler,
    ) -> *mut FiberContext {
        let stack_top = stack.stack_top();
        let ctx = Box::into_raw(Box::new(FiberContext::new(
            ContextFlags::empty(),
            Some(stack),
            scheduler,
            2,
            Some(entry),
        )));
        unsafe {
            crate::arch::current::init_frame((*ctx).regs.get(), stack_top, fiber_main, ctx as usize);
        }
        ctx
    }

    /// Bare context for container unit tests
    #[cfg(test)]
    pub(crate) fn new_test() -> *mut FiberContext {
        Box::into_raw(Box::new(FiberContext::new(
            ContextFlags::empty(),
            None,
            std::ptr::null(),
            1,
            None,
        )))
    }

    // ------------------------------------------------------------------
    // Identity and flags
    // ------------------------------------------------------------------

    #[inline]
    pub fn id(&self) -> FiberId {
        FiberId::from_addr(self as *const _ as usize)
    }

    #[inline]
    fn load_flags(&self) -> ContextFlags {
        ContextFlags::from_bits(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_main(&self) -> bool {
        self.load_flags().contains(ContextFlags::MAIN)
    }

    #[inline]
    pub fn is_dispatcher(&self) -> bool {
        self.load_flags().contains(ContextFlags::DISPATCHER)
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.load_flags().contains(ContextFlags::TERMINATED)
    }

    // ------------------------------------------------------------------
    // Crate-internal accessors for queues and switching
    // ------------------------------------------------------------------

    #[inline]
    pub(crate) fn link(&self, id: LinkId) -> &Link {
        &self.links[id as usize]
    }

    /// Whether the fiber sits in any scheduled queue (worker aside)
    pub(crate) fn is_queued(&self) -> bool {
        self.link(LinkId::Ready).is_linked()
            || self.link(LinkId::RemoteReady).is_linked()
            || self.link(LinkId::Sleep).is_linked()
            || self.link(LinkId::Wait).is_linked()
            || self.link(LinkId::Terminated).is_linked()
    }

    #[inline]
    pub(crate) fn tp(&self) -> u64 {
        self.tp.get()
    }

    #[inline]
    pub(crate) fn set_tp(&self, tp: u64) {
        self.tp.set(tp);
    }

    #[inline]
    pub(crate) fn regs_ptr(&self) -> *mut RegisterFrame {
        self.regs.get()
    }

    /// Owning scheduler as seen under `hook_splk`
    pub(crate) fn scheduler_shared(&self) -> *const Scheduler {
        let _guard = self.hook_splk.lock();
        self.scheduler.get()
    }

    /// Rewrite the owning scheduler (migration)
    pub(crate) fn set_scheduler(&self, scheduler: *const Scheduler) {
        let _guard = self.hook_splk.lock();
        self.scheduler.set(scheduler);
    }

    // ------------------------------------------------------------------
    // Reference counting
    // ------------------------------------------------------------------

    #[inline]
    pub fn retain(&self) {
        self.use_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference, destroying the context at zero
    ///
    /// # Safety
    ///
    /// `ctx` must carry a live reference owned by the caller, and at the
    /// final release the fiber must no longer be executing on its stack.
    pub unsafe fn release_ref(ctx: *mut FiberContext) {
        if (*ctx).use_count.fetch_sub(1, Ordering::Release) == 1 {
            core::sync::atomic::fence(Ordering::Acquire);
            drop(Box::from_raw(ctx));
        }
    }

    // ------------------------------------------------------------------
    // Scheduling operations
    // ------------------------------------------------------------------

    /// Make this fiber runnable, locally or through the remote-ready path
    ///
    /// Idempotent: a fiber already scheduled (or terminated) is left
    /// alone. Safe to call from any thread.
    pub fn set_ready(&self) {
        if self.is_terminated() {
            return;
        }
        let target = self.scheduler_shared();
        if target.is_null() {
            return;
        }
        let ctx = self as *const FiberContext as *mut FiberContext;
        unsafe {
            if target == tls::scheduler() as *const Scheduler {
                (*target).set_ready_local(ctx);
            } else {
                (*target).set_remote_ready(ctx);
            }
        }
    }

    /// Block the active fiber until this fiber terminates
    ///
    /// Interruption point on entry and on every wake-up. Spurious
    /// wake-ups re-enter the wait queue.
    pub fn join(&self) -> FiberResult<()> {
        let active = tls::active();
        debug_assert!(!active.is_null(), "join outside a fiber runtime");
        debug_assert!(
            active as *const FiberContext != self as *const FiberContext,
            "fiber cannot join itself"
        );

        unsafe {
            (*active).check_interruption()?;

            loop {
                {
                    let _guard = self.splk.lock();
                    if self.is_terminated() {
                        break;
                    }
                    if !(*active).link(LinkId::Wait).is_linked() {
                        (*self.wait_queue.get()).push(active);
                    }
                }

                let sched = (*active).scheduler.get();
                (*sched).re_schedule(active);

                // Interrupt wake-ups leave us linked; take ourselves out
                // before deciding what the wake-up meant
                {
                    let _guard = self.splk.lock();
                    if (*active).link(LinkId::Wait).is_linked() {
                        (*self.wait_queue.get()).remove(active);
                    }
                }
                (*active).deliver_forced_unwind();
                (*active).check_interruption()?;
            }

            (*active).check_interruption()?;
        }
        Ok(())
    }

    /// Suspend the active fiber until `tp` (monotonic nanoseconds)
    ///
    /// Returns `true` when the deadline fired, `false` when an external
    /// `set_ready` arrived first.
    pub fn wait_until(&self, tp: u64) -> bool {
        let ctx = self as *const FiberContext as *mut FiberContext;
        debug_assert!(ctx == tls::active(), "wait_until on a non-active fiber");
        unsafe {
            let sched = self.scheduler.get();
            (*sched).wait_until(ctx, tp)
        }
    }

    // ------------------------------------------------------------------
    // Interruption and unwinding
    // ------------------------------------------------------------------

    /// Set or clear the pending interruption request
    pub fn request_interruption(&self, requested: bool) {
        let _guard = self.splk.lock();
        if requested {
            self.flags
                .fetch_or(ContextFlags::INTERRUPTION_REQUESTED.bits(), Ordering::AcqRel);
        } else {
            self.flags.fetch_and(
                !ContextFlags::INTERRUPTION_REQUESTED.bits(),
                Ordering::AcqRel,
            );
        }
    }

    /// Block or unblock interruption delivery; returns the previous state
    pub fn interruption_blocked(&self, blocked: bool) -> bool {
        let _guard = self.splk.lock();
        let prev = if blocked {
            self.flags
                .fetch_or(ContextFlags::INTERRUPTION_BLOCKED.bits(), Ordering::AcqRel)
        } else {
            self.flags
                .fetch_and(!ContextFlags::INTERRUPTION_BLOCKED.bits(), Ordering::AcqRel)
        };
        ContextFlags::from_bits(prev).contains(ContextFlags::INTERRUPTION_BLOCKED)
    }

    /// Observe a pending interruption; one-shot delivery
    pub fn check_interruption(&self) -> FiberResult<()> {
        let _guard = self.splk.lock();
        let flags = self.load_flags();
        if flags.contains(ContextFlags::INTERRUPTION_REQUESTED)
            && !flags.contains(ContextFlags::INTERRUPTION_BLOCKED)
        {
            self.flags.fetch_and(
                !ContextFlags::INTERRUPTION_REQUESTED.bits(),
                Ordering::AcqRel,
            );
            return Err(FiberError::Interrupted);
        }
        Ok(())
    }

    /// Arm a one-shot stack unwind, delivered at the next resume
    ///
    /// Must not target the main or dispatcher fiber.
    pub fn request_unwinding(&self) {
        debug_assert!(
            !self.is_main() && !self.is_dispatcher(),
            "cannot unwind the main or dispatcher fiber"
        );
        if self.is_terminated() {
            return;
        }
        let _guard = self.splk.lock();
        self.flags
            .fetch_or(ContextFlags::FORCED_UNWIND.bits(), Ordering::AcqRel);
    }

    /// Consume a pending forced-unwind request
    pub(crate) fn take_forced_unwind(&self) -> bool {
        let prev = self
            .flags
            .fetch_and(!ContextFlags::FORCED_UNWIND.bits(), Ordering::AcqRel);
        ContextFlags::from_bits(prev).contains(ContextFlags::FORCED_UNWIND)
    }

    /// Raise a pending forced unwind on this (active) fiber
    ///
    /// Called at the end of every suspension operation, after the
    /// operation has restored its queue state, so the unwind never
    /// leaves the fiber linked anywhere.
    pub(crate) fn deliver_forced_unwind(&self) {
        if self.take_forced_unwind() {
            std::panic::panic_any(ForcedUnwind);
        }
    }

    // ------------------------------------------------------------------
    // Termination
    // ------------------------------------------------------------------

    /// Mark terminated, queue for reaping, release joiners, run cleanups
    ///
    /// Runs on the fiber's own stack after its entry returned or
    /// unwound; the caller switches away for good immediately after.
    pub(crate) fn terminate(&self) {
        debug_assert!(!self.is_main() && !self.is_dispatcher());
        let ctx = self as *const FiberContext as *mut FiberContext;

        {
            let _guard = self.splk.lock();
            self.flags
                .fetch_or(ContextFlags::TERMINATED.bits(), Ordering::AcqRel);
        }
        unsafe {
            let sched = self.scheduler.get();
            (*sched).set_terminated(ctx);
        }

        // Release joiners one at a time: each waiter leaves the queue
        // fully unlinked under splk before it can run again
        loop {
            let waiter = {
                let _guard = self.splk.lock();
                unsafe { (*self.wait_queue.get()).pop() }
            };
            match waiter {
                Some(w) => unsafe { (*w).set_ready() },
                None => break,
            }
        }

        // FSS cleanups run unlocked; user callbacks may take their time
        let mut fss = {
            let _guard = self.splk.lock();
            std::mem::take(unsafe { &mut *self.fss.get() })
        };
        fss.run_cleanups();
    }

    /// Store the panic payload for the first joiner
    pub(crate) fn store_panic(&self, payload: PanicPayload) {
        let _guard = self.splk.lock();
        unsafe {
            *self.panic_slot.get() = Some(payload);
        }
    }

    /// Take the stored panic payload, if any
    pub fn take_panic(&self) -> Option<PanicPayload> {
        let _guard = self.splk.lock();
        unsafe { (*self.panic_slot.get()).take() }
    }

    // ------------------------------------------------------------------
    // Fiber-specific storage
    // ------------------------------------------------------------------

    /// Look up the FSS value bound to `key`, null if unbound
    pub fn get_fss(&self, key: FssKey) -> *mut u8 {
        let _guard = self.splk.lock();
        unsafe { (*self.fss.get()).get(key) }
    }

    /// Bind an FSS value; null erases, see `FssMap::set`
    ///
    /// A displaced cleanup runs outside the context lock.
    pub fn set_fss(
        &self,
        key: FssKey,
        cleanup: Option<FssCleanup>,
        value: *mut u8,
        cleanup_existing: bool,
    ) {
        let old = {
            let _guard = self.splk.lock();
            let fss = unsafe { &mut *self.fss.get() };
            let old = fss.take(key);
            if !value.is_null() {
                fss.set(key, cleanup, value, false);
            }
            old
        };
        if cleanup_existing {
            if let Some((old_value, Some(run))) = old {
                if !old_value.is_null() {
                    // Safety: contract established when the binding was set
                    unsafe { run(old_value) };
                }
            }
        }
    }
}

impl Drop for FiberContext {
    fn drop(&mut self) {
        debug_assert!(!self.is_queued(), "destroying a queued fiber context");
        debug_assert!(
            unsafe { (*self.wait_queue.get()).is_empty() },
            "destroying a fiber context with live waiters"
        );
        // Main and dispatcher contexts never run terminate(); their FSS
        // cleanups fire here at thread teardown
        self.fss.get_mut().run_cleanups();
    }
}

/// Entry point running on every worker fiber's stack
///
/// Runs the boxed entry, records a panic for the first joiner (forced
/// unwinds are cancellation, not failure), terminates and leaves the
/// stack forever.
pub(crate) extern "C" fn fiber_main(arg: usize) -> ! {
    let ctx = arg as *mut FiberContext;
    unsafe {
        let entry = (*(*ctx).entry.get())
            .take()
            .unwrap_or_else(|| unreachable!("fiber entry already taken"));

        // A fiber canceled before its first run never executes its entry
        if !(*ctx).take_forced_unwind() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(entry)) {
                if !payload.is::<ForcedUnwind>() {
                    (*ctx).store_panic(payload);
                }
            }
        }

        (*ctx).terminate();
        let sched = (*ctx).scheduler.get();
        (*sched).exit_to_dispatcher(ctx)
    }
}
