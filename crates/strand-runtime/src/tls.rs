//! Thread-local runtime bootstrap
//!
//! The first touch of the runtime on a thread promotes the thread's
//! native stack into a main fiber context, allocates a scheduler, and
//! spawns the dispatcher fiber on a fresh stack. Teardown runs from the
//! thread-local destructor, once per thread: remaining fibers are driven
//! to completion while they can make progress, then the dispatcher, the
//! main context and the scheduler are destroyed, in that order.

use crate::config::RuntimeConfig;
use crate::context::FiberContext;
use crate::scheduler::Scheduler;
use crate::stack::FiberStack;
use core::cell::{Cell, RefCell};
use strand_core::error::{FiberResult, ResourceError};
use strand_core::fwarn;

/// Owner of a thread's runtime pieces; dropped at thread exit
struct ThreadRuntime {
    scheduler: *mut Scheduler,
    main_ctx: *mut FiberContext,
    dispatcher_ctx: *mut FiberContext,
}

thread_local! {
    /// Currently executing fiber on this thread
    static ACTIVE: Cell<*mut FiberContext> = const { Cell::new(std::ptr::null_mut()) };

    /// This thread's scheduler
    static SCHEDULER: Cell<*mut Scheduler> = const { Cell::new(std::ptr::null_mut()) };

    /// Drives init-once and teardown-once per thread
    static RUNTIME: RefCell<Option<ThreadRuntime>> = const { RefCell::new(None) };
}

/// The active fiber, null when the thread has no runtime
#[inline]
pub fn active() -> *mut FiberContext {
    ACTIVE.try_with(|c| c.get()).unwrap_or(std::ptr::null_mut())
}

#[inline]
pub(crate) fn set_active(ctx: *mut FiberContext) {
    let _ = ACTIVE.try_with(|c| c.set(ctx));
}

/// This thread's scheduler, null before bootstrap
#[inline]
pub fn scheduler() -> *mut Scheduler {
    SCHEDULER
        .try_with(|c| c.get())
        .unwrap_or(std::ptr::null_mut())
}

/// Whether this thread has a live fiber runtime
#[inline]
pub fn is_runtime_thread() -> bool {
    !scheduler().is_null()
}

/// Bootstrap on first touch, with environment-driven defaults
pub fn ensure_runtime() -> FiberResult<*mut Scheduler> {
    let existing = scheduler();
    if !existing.is_null() {
        return Ok(existing);
    }
    bootstrap(RuntimeConfig::default())
}

/// Bootstrap with an explicit configuration
///
/// Returns `false` when the thread's runtime already existed, in which
/// case the configuration is ignored.
pub fn bootstrap_with(config: RuntimeConfig) -> FiberResult<bool> {
    if is_runtime_thread() {
        return Ok(false);
    }
    bootstrap(config)?;
    Ok(true)
}

fn bootstrap(config: RuntimeConfig) -> FiberResult<*mut Scheduler> {
    config
        .validate()
        .map_err(ResourceError::InvalidConfig)?;

    let dispatcher_stack = FiberStack::allocate(config.stack_size)?;

    let sched = Box::into_raw(Box::new(Scheduler::new(config)));
    let main_ctx = FiberContext::new_main(sched);
    let dispatcher_ctx = FiberContext::new_dispatcher(dispatcher_stack, sched);
    unsafe {
        (*sched).set_main_context(main_ctx);
        (*sched).set_dispatcher_context(dispatcher_ctx);
    }

    SCHEDULER.with(|c| c.set(sched));
    ACTIVE.with(|c| c.set(main_ctx));
    RUNTIME.with(|r| {
        *r.borrow_mut() = Some(ThreadRuntime {
            scheduler: sched,
            main_ctx,
            dispatcher_ctx,
        })
    });

    Ok(sched)
}

impl Drop for ThreadRuntime {
    fn drop(&mut self) {
        unsafe {
            let sched = &*self.scheduler;

            // Drive remaining fibers: suspending the main fiber without a
            // queue entry hands the thread to the dispatcher, which runs
            // everything runnable and switches back once idle.
            loop {
                sched.reap_terminated();
                if !sched.has_workers() {
                    break;
                }
                if !sched.has_progress() {
                    fwarn!(
                        "thread runtime teardown: {} fiber(s) still blocked; leaking them",
                        sched.blocked_workers()
                    );
                    break;
                }
                sched.re_schedule(self.main_ctx);
            }
            sched.reap_terminated();

            FiberContext::release_ref(self.dispatcher_ctx);
            FiberContext::release_ref(self.main_ctx);

            set_active(std::ptr::null_mut());
            let _ = SCHEDULER.try_with(|c| c.set(std::ptr::null_mut()));
            drop(Box::from_raw(self.scheduler));
        }
    }
}
