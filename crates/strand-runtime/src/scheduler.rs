//! Per-thread scheduler
//!
//! One scheduler per kernel thread, driving context switches through a
//! dedicated dispatcher fiber: whenever a fiber suspends, control
//! returns to the dispatcher, which picks the next runnable fiber.
//! Control never passes fiber-to-fiber directly.
//!
//! Everything here runs on the owning thread except `set_remote_ready`,
//! which other threads use to wake fibers owned here.

use crate::arch::current::switch_frames;
use crate::clock;
use crate::config::RuntimeConfig;
use crate::context::FiberContext;
use crate::fifo::{Fifo, LinkId, SleepQueue};
use crate::parking::{Parker, PlatformParker};
use crate::tls;
use core::cell::{Cell, UnsafeCell};
use strand_core::fwarn;
use strand_core::spinlock::SpinLock;

/// Per-thread fiber scheduler
pub struct Scheduler {
    config: RuntimeConfig,

    /// The thread's main fiber (non-owning; the thread runtime owns it)
    main_ctx: Cell<*mut FiberContext>,

    /// The dispatcher fiber (non-owning; the thread runtime owns it)
    dispatcher_ctx: Cell<*mut FiberContext>,

    /// Every fiber this scheduler owns
    worker_queue: UnsafeCell<Fifo>,

    /// Runnable fibers, FIFO round-robin
    ready_queue: UnsafeCell<Fifo>,

    /// Sleeping fibers ordered by deadline
    sleep_queue: UnsafeCell<SleepQueue>,

    /// Terminated fibers awaiting the dispatcher's reap
    terminated_queue: UnsafeCell<Fifo>,

    /// Wake-ups posted by other threads; drained each dispatcher turn
    remote_ready: SpinLock<Fifo>,

    /// Idle blocking and remote wake-up delivery
    parker: PlatformParker,
}

// Safety: only `remote_ready` and `parker` are touched from foreign
// threads; every other field is owned by the scheduler's thread.
unsafe impl Send for Scheduler {}
unsafe impl Sync for Scheduler {}

impl Scheduler {
    pub(crate) fn new(config: RuntimeConfig) -> Scheduler {
        Scheduler {
            config,
            main_ctx: Cell::new(std::ptr::null_mut()),
            dispatcher_ctx: Cell::new(std::ptr::null_mut()),
            worker_queue: UnsafeCell::new(Fifo::new(LinkId::Worker)),
            ready_queue: UnsafeCell::new(Fifo::new(LinkId::Ready)),
            sleep_queue: UnsafeCell::new(SleepQueue::new()),
            terminated_queue: UnsafeCell::new(Fifo::new(LinkId::Terminated)),
            remote_ready: SpinLock::new(Fifo::new(LinkId::RemoteReady)),
            parker: PlatformParker::new(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn set_main_context(&self, ctx: *mut FiberContext) {
        self.main_ctx.set(ctx);
    }

    pub(crate) fn set_dispatcher_context(&self, ctx: *mut FiberContext) {
        self.dispatcher_ctx.set(ctx);
    }

    /// Take ownership of a freshly spawned fiber and make it runnable
    pub fn adopt(&self, ctx: *mut FiberContext) {
        unsafe {
            (*self.worker_queue.get()).push(ctx);
            (*self.ready_queue.get()).push(ctx);
        }
    }

    // ------------------------------------------------------------------
    // Dispatcher
    // ------------------------------------------------------------------

    /// Dispatcher fiber body; never returns
    pub(crate) fn dispatch(&self) -> ! {
        loop {
            self.reap_terminated();
            self.drain_remote();
            self.wake_sleepers();

            let next = unsafe { (*self.ready_queue.get()).pop() };
            if let Some(next) = next {
                let dispatcher = self.dispatcher_ctx.get();
                tls::set_active(next);
                unsafe {
                    switch_frames((*dispatcher).regs_ptr(), (*next).regs_ptr());
                }
                // The picked fiber suspended again; take the next turn
                continue;
            }

            // Idle. Sleepers bound the wait; a remote wake cuts it short.
            let deadline = unsafe { (*self.sleep_queue.get()).next_deadline() };
            if let Some(tp) = deadline {
                if let Some(remaining) = clock::until(tp) {
                    self.parker.park(Some(remaining));
                }
                continue;
            }

            // Nothing runnable, nothing sleeping. If the main fiber is
            // suspended without a queue entry, the thread wants out of
            // the runtime: hand its stack back.
            let main = self.main_ctx.get();
            if !unsafe { (*main).is_queued() } {
                let dispatcher = self.dispatcher_ctx.get();
                tls::set_active(main);
                unsafe {
                    switch_frames((*dispatcher).regs_ptr(), (*main).regs_ptr());
                }
                continue;
            }

            // Fibers are blocked awaiting remote wake-ups
            self.parker.park(Some(self.config.park_max));
        }
    }

    /// Release the scheduler's reference on every reaped fiber
    pub(crate) fn reap_terminated(&self) {
        loop {
            let ctx = unsafe { (*self.terminated_queue.get()).pop() };
            let Some(ctx) = ctx else { break };
            unsafe {
                (*self.worker_queue.get()).remove(ctx);
                FiberContext::release_ref(ctx);
            }
        }
    }

    /// Splice remote wake-ups into the ready queue, FIFO order preserved
    ///
    /// Each entry carries a reference taken at `set_remote_ready`,
    /// released once the entry is processed.
    fn drain_remote(&self) {
        let mut remote = self.remote_ready.lock();
        loop {
            let ctx = unsafe { remote.pop() };
            let Some(ctx) = ctx else { break };
            unsafe {
                if !(*ctx).is_terminated() {
                    // A migrated fiber joins the worker set on arrival;
                    // a remotely woken main fiber belongs to no worker set
                    if !(*ctx).link(LinkId::Worker).is_linked() && !(*ctx).is_main() {
                        (*self.worker_queue.get()).push(ctx);
                    }
                    if !(*ctx).link(LinkId::Ready).is_linked() {
                        (*self.ready_queue.get()).push(ctx);
                    }
                }
                FiberContext::release_ref(ctx);
            }
        }
    }

    /// Move every expired sleeper to the ready queue
    fn wake_sleepers(&self) {
        let now = clock::now_ns();
        loop {
            let ctx = unsafe { (*self.sleep_queue.get()).pop_expired(now) };
            let Some(ctx) = ctx else { break };
            unsafe {
                (*ctx).set_tp(clock::TP_NONE);
                // An early wake may have readied it already
                if !(*ctx).link(LinkId::Ready).is_linked() {
                    (*self.ready_queue.get()).push(ctx);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Suspension entry points (called on the suspending fiber's stack)
    // ------------------------------------------------------------------

    /// Switch to the dispatcher; returns when `ctx` is selected again
    ///
    /// The caller is `ctx` and has already queued itself wherever it
    /// belongs (or nowhere, for the main fiber leaving the runtime).
    /// Callers deliver any pending forced unwind only after restoring
    /// their queue state, so an unwound fiber is never left linked.
    pub(crate) fn re_schedule(&self, ctx: *mut FiberContext) {
        let dispatcher = self.dispatcher_ctx.get();
        tls::set_active(dispatcher);
        unsafe {
            switch_frames((*ctx).regs_ptr(), (*dispatcher).regs_ptr());
        }
    }

    /// Re-enqueue the active fiber and give the rest a turn
    pub fn yield_now(&self, ctx: *mut FiberContext) {
        unsafe {
            if !(*ctx).link(LinkId::Ready).is_linked() {
                (*self.ready_queue.get()).push(ctx);
            }
        }
        self.re_schedule(ctx);
        unsafe {
            (*ctx).deliver_forced_unwind();
        }
    }

    /// Sleep the active fiber until `tp`
    ///
    /// Returns `true` when the deadline fired, `false` when an external
    /// `set_ready` arrived first. The sleep link doubles as the wake
    /// cause: a timer wake unlinks it, an early wake leaves it in place.
    pub(crate) fn wait_until(&self, ctx: *mut FiberContext, tp: u64) -> bool {
        unsafe {
            (*ctx).set_tp(tp);
            (*self.sleep_queue.get()).insert(ctx);
        }
        self.re_schedule(ctx);
        let fired = unsafe {
            if (*ctx).link(LinkId::Sleep).is_linked() {
                (*self.sleep_queue.get()).remove(ctx);
                (*ctx).set_tp(clock::TP_NONE);
                false
            } else {
                true
            }
        };
        unsafe {
            (*ctx).deliver_forced_unwind();
        }
        fired
    }

    /// Make a locally owned fiber runnable; idempotent
    pub(crate) fn set_ready_local(&self, ctx: *mut FiberContext) {
        unsafe {
            if (*ctx).is_terminated() || (*ctx).link(LinkId::Ready).is_linked() {
                return;
            }
            // Waking the running fiber means "keep going"
            if ctx == tls::active() {
                return;
            }
            (*self.ready_queue.get()).push(ctx);
        }
    }

    /// Post a wake-up from a foreign thread
    ///
    /// The queue entry holds its own reference so the context outlives
    /// the handoff even if every handle drops meanwhile.
    pub(crate) fn set_remote_ready(&self, ctx: *mut FiberContext) {
        {
            let mut remote = self.remote_ready.lock();
            unsafe {
                if !(*ctx).link(LinkId::RemoteReady).is_linked() {
                    (*ctx).retain();
                    remote.push(ctx);
                }
            }
        }
        self.parker.wake_one();
    }

    /// Queue a fiber for reaping; called from within its termination
    pub(crate) fn set_terminated(&self, ctx: *mut FiberContext) {
        unsafe {
            (*self.terminated_queue.get()).push(ctx);
        }
    }

    /// Final switch away from a terminated fiber's stack
    pub(crate) fn exit_to_dispatcher(&self, ctx: *mut FiberContext) -> ! {
        let dispatcher = self.dispatcher_ctx.get();
        tls::set_active(dispatcher);
        unsafe {
            switch_frames((*ctx).regs_ptr(), (*dispatcher).regs_ptr());
        }
        unreachable!("terminated fiber resumed");
    }

    // ------------------------------------------------------------------
    // Migration
    // ------------------------------------------------------------------

    /// Hand a ready fiber owned here to another scheduler
    ///
    /// Caller is this scheduler's thread; `ctx` must be READY (not
    /// active, sleeping, waiting or terminated). The fiber leaves the
    /// local queues, its scheduler pointer is rewritten, and it arrives
    /// at `target` through the remote-ready path.
    pub fn migrate_out(&self, ctx: *mut FiberContext, target: *const Scheduler) {
        debug_assert!(
            self as *const Scheduler == tls::scheduler() as *const Scheduler,
            "migrate from a foreign thread"
        );
        debug_assert!(ctx != tls::active(), "cannot migrate the active fiber");
        unsafe {
            debug_assert!(
                !(*ctx).link(LinkId::Sleep).is_linked()
                    && !(*ctx).link(LinkId::Wait).is_linked()
                    && !(*ctx).is_terminated(),
                "only a ready fiber can migrate"
            );
            debug_assert!(!(*ctx).is_main(), "the main fiber cannot migrate");
            (*self.ready_queue.get()).remove(ctx);
            (*self.worker_queue.get()).remove(ctx);
            (*ctx).set_scheduler(target);
            (*target).set_remote_ready(ctx);
        }
    }

    // ------------------------------------------------------------------
    // Teardown support
    // ------------------------------------------------------------------

    /// Whether any spawned fiber still belongs to this scheduler
    pub(crate) fn has_workers(&self) -> bool {
        unsafe { !(*self.worker_queue.get()).is_empty() }
    }

    /// Whether the dispatcher can still make progress on its own
    pub(crate) fn has_progress(&self) -> bool {
        let local = unsafe {
            !(*self.ready_queue.get()).is_empty() || !(*self.sleep_queue.get()).is_empty()
        };
        local || !self.remote_ready.lock().is_empty()
    }

    /// Count of fibers parked in someone's wait queue (diagnostics)
    pub(crate) fn blocked_workers(&self) -> usize {
        let mut blocked = 0;
        unsafe {
            (*self.worker_queue.get()).any(|ctx| {
                if (*ctx).link(LinkId::Wait).is_linked() {
                    blocked += 1;
                }
                false
            });
        }
        blocked
    }
}

/// Dispatcher fiber entry; runs `Scheduler::dispatch` forever
pub(crate) extern "C" fn dispatcher_main(arg: usize) -> ! {
    let sched = arg as *const Scheduler;
    unsafe { (*sched).dispatch() }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.has_workers() {
            fwarn!(
                "scheduler dropped with {} blocked fiber(s); their stacks leak",
                self.blocked_workers()
            );
        }
    }
}
