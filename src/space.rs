//! Fiber space: the per-process fiber context and the switch engine.
//!
//! # Example
//!
//! ```no_run
//! use fibers::{FiberSpace, FiberStack};
//! use std::ffi::c_void;
//! use std::sync::OnceLock;
//!
//! static SPACE: OnceLock<FiberSpace> = OnceLock::new();
//!
//! extern "C" fn worker(home: *mut c_void) {
//!     let space = SPACE.get().unwrap();
//!     loop {
//!         println!("in worker");
//!         space.switch_to(fibers::FiberId(home as u64)).unwrap();
//!     }
//! }
//!
//! let space = SPACE.get_or_init(FiberSpace::new);
//! let home = space.convert_current().unwrap();
//! let stack = FiberStack::with_default_size();
//! let child = space
//!     .create_with_stack(stack, worker, home.as_u64() as *mut c_void)
//!     .unwrap();
//! space.switch_to(child).unwrap();
//! println!("back home");
//! ```

use crate::arch::{Context, FpuState, context_switch, current_pc};
use crate::common::{CpuTime, FiberStack, MIN_FRAME, SignalMask, os_thread_id};
use crate::config::FiberConfig;
use crate::error::{FiberError, Result};
use crate::fiber::{Fiber, FiberId, FiberStats};
use crate::fls::FlsTable;
use crate::registry::Registry;
use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Entry function of a created fiber. It receives the creation parameter
/// and must never return.
pub type FiberEntry = extern "C" fn(param: *mut c_void);

/// Parameters for [`FiberSpace::create`].
#[derive(Debug, Clone, Copy)]
pub struct CreateParams {
    /// Top of the fiber's stack (highest address).
    pub stack: *mut u8,
    pub entry_point: FiberEntry,
    pub param: *mut c_void,
}

/// Source of [`FiberSpace`] tags.
static NEXT_SPACE_TAG: AtomicU64 = AtomicU64::new(0);

/// A fiber together with the tag of the space it is registered in.
#[derive(Clone)]
struct Bound {
    space: u64,
    fiber: Arc<Fiber>,
}

thread_local! {
    /// Fiber the current thread is running as.
    static CURRENT_FIBER: RefCell<Option<Bound>> = const { RefCell::new(None) };

    /// Outgoing and incoming fiber of a switch in flight on this thread.
    static PENDING_SWITCH: Cell<Option<(Arc<Fiber>, Bound)>> = const { Cell::new(None) };
}

fn current_bound() -> Option<Bound> {
    CURRENT_FIBER.with(|f| f.borrow().clone())
}

/// Identifier of the fiber the calling thread is running as, if any,
/// whichever space it belongs to.
pub fn current() -> Option<FiberId> {
    CURRENT_FIBER.with(|f| f.borrow().as_ref().map(|bound| bound.fiber.id()))
}

/// Completes a switch on whichever thread the resumed code now runs on.
///
/// Kept out of line: a fiber may resume on a different thread than the one
/// it suspended on, so thread-local addresses must be computed afresh here.
#[inline(never)]
fn finish_switch() {
    let Some((prev, next)) = PENDING_SWITCH.with(|p| p.take()) else {
        return;
    };
    prev.release();
    CURRENT_FIBER.with(|f| *f.borrow_mut() = Some(next));
}

/// Where every created fiber starts, reached through the arch trampoline.
extern "C" fn fiber_main(entry: usize, param: usize) -> ! {
    finish_switch();

    let entry = unsafe { std::mem::transmute::<usize, FiberEntry>(entry) };
    entry(param as *mut c_void);

    tracing::error!(
        fiber = ?current(),
        entry = format_args!("{:#x}", entry as usize),
        "fiber returned from its entry function"
    );
    std::process::abort();
}

/// # Safety
/// `top - 16 .. top` must be writable and owned by the new fiber.
unsafe fn initial_context(top: usize, entry: FiberEntry, param: *mut c_void) -> Context {
    unsafe { Context::new(top, fiber_main, entry as usize, param as usize) }
}

/// Per-process fiber context: a registry of fibers and an FLS table.
///
/// Shared across threads by reference or `Arc`. A thread runs as a fiber
/// of at most one space at a time.
pub struct FiberSpace {
    tag: u64,
    registry: Registry,
    fls: FlsTable,
    config: FiberConfig,
}

impl Default for FiberSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl FiberSpace {
    pub fn new() -> Self {
        Self::with_config(FiberConfig::default())
    }

    pub fn with_config(config: FiberConfig) -> Self {
        FiberSpace {
            tag: NEXT_SPACE_TAG.fetch_add(1, Ordering::Relaxed),
            registry: Registry::new(config.max_fibers),
            fls: FlsTable::new(config.fls_capacity),
            config,
        }
    }

    pub fn config(&self) -> &FiberConfig {
        &self.config
    }

    /// Number of registered fibers.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Fiber of this space the calling thread is running as, if any.
    pub fn current(&self) -> Option<FiberId> {
        self.current_fiber().map(|fiber| fiber.id())
    }

    fn current_fiber(&self) -> Option<Arc<Fiber>> {
        current_bound()
            .filter(|bound| bound.space == self.tag)
            .map(|bound| bound.fiber)
    }

    /// Turn the calling thread into a fiber of this space.
    ///
    /// The thread keeps running, now as the returned fiber. Its registers
    /// are captured the first time it switches away.
    pub fn convert_current(&self) -> Result<FiberId> {
        if let Some(bound) = current_bound() {
            let id = bound.fiber.id();
            if bound.space == self.tag {
                tracing::warn!(fiber = %id, "thread is already a fiber");
                return Err(FiberError::AlreadyFiber(id));
            }
            tracing::warn!(fiber = %id, "thread is a fiber of another space");
            return Err(FiberError::ForeignFiber(id));
        }

        let creator = os_thread_id();
        let fiber = Fiber::running(creator, current_pc(), CpuTime::now());
        let fiber = self.registry.register(fiber).inspect_err(|_| {
            tracing::warn!(creator, "failed to convert thread to fiber");
        })?;

        let id = fiber.id();
        let bound = Bound {
            space: self.tag,
            fiber,
        };
        CURRENT_FIBER.with(|f| *f.borrow_mut() = Some(bound));
        tracing::debug!(%id, creator, "thread converted to fiber");
        Ok(id)
    }

    /// Create a stopped fiber on a caller-provided stack.
    ///
    /// # Safety
    /// `params.stack` must be the top of writable memory that stays valid,
    /// and is used by nothing else, for as long as the fiber may run.
    pub unsafe fn create(&self, params: CreateParams) -> Result<FiberId> {
        let top = params.stack as usize & !0xF;
        if params.stack.is_null() || top < MIN_FRAME {
            tracing::warn!(stack = ?params.stack, "invalid fiber stack");
            return Err(FiberError::InvalidParams("stack pointer is null or too low"));
        }
        let context = unsafe { initial_context(top, params.entry_point, params.param) };
        self.register_stopped(context, params.entry_point, None)
    }

    /// Create a stopped fiber that owns `stack`.
    pub fn create_with_stack(
        &self,
        mut stack: FiberStack,
        entry_point: FiberEntry,
        param: *mut c_void,
    ) -> Result<FiberId> {
        let top = stack.top() as usize;
        if top < stack.bottom() as usize + MIN_FRAME {
            tracing::warn!(size = stack.size(), "fiber stack too small");
            return Err(FiberError::InvalidParams("stack too small"));
        }
        // The stack's heap block does not move when the FiberStack is moved
        // into the record below.
        let context = unsafe { initial_context(top, entry_point, param) };
        self.register_stopped(context, entry_point, Some(stack))
    }

    /// A stack of the configured default size.
    pub fn alloc_stack(&self) -> FiberStack {
        FiberStack::new(self.config.stack_size)
    }

    fn register_stopped(
        &self,
        context: Context,
        entry_point: FiberEntry,
        stack: Option<FiberStack>,
    ) -> Result<FiberId> {
        let creator = os_thread_id();
        // The creator's FPU control state is the template for the new fiber.
        let fiber = Fiber::stopped(
            context,
            FpuState::capture(),
            creator,
            entry_point as usize,
            stack,
        );
        let fiber = self.registry.register(fiber).inspect_err(|_| {
            tracing::warn!(creator, "failed to create fiber");
        })?;
        tracing::debug!(
            id = %fiber.id(),
            entry = format_args!("{:#x}", fiber.entry_point()),
            "fiber created"
        );
        Ok(fiber.id())
    }

    /// Suspend the calling fiber and resume `target` on this thread.
    ///
    /// Returns once some thread switches back into the calling fiber. Fails
    /// without side effects if the caller is not a fiber of this space or
    /// `target` is unknown; fails with [`FiberError::Busy`] if `target` is
    /// running.
    pub fn switch_to(&self, target: FiberId) -> Result<()> {
        let Some(prev) = self.current_fiber() else {
            tracing::warn!("attempt to switch not from fiber context");
            return Err(FiberError::NotInFiber);
        };

        let Some(next) = self.registry.lookup(target) else {
            tracing::warn!(%target, "failed to switch: no such fiber");
            return Err(FiberError::NotFound(target));
        };

        if !next.try_claim() {
            next.record_failed_activation();
            tracing::trace!(%target, "target fiber busy");
            return Err(FiberError::Busy(target));
        }
        next.record_activation();

        let now = CpuTime::now();
        prev.charge(now);
        next.mark_started(now);

        tracing::trace!(from = %prev.id(), to = %target, "switching fiber");

        // We hold both claims: `prev` as its running thread, `next` just won.
        unsafe {
            *prev.fpu_ptr() = FpuState::capture();
            {
                let _mask = if self.config.mask_signals {
                    SignalMask::block_all()
                } else {
                    SignalMask::none()
                };
                (*next.fpu_ptr()).install();
            }

            let prev_ctx = prev.context_ptr();
            let next_ctx = next.context_ptr();
            let next = Bound {
                space: self.tag,
                fiber: next,
            };
            PENDING_SWITCH.with(|p| p.set(Some((prev, next))));

            context_switch(prev_ctx, next_ctx);
        }

        // Resumed, possibly on another thread.
        finish_switch();
        Ok(())
    }

    /// Find a registered fiber.
    pub fn lookup(&self, id: FiberId) -> Option<Arc<Fiber>> {
        self.registry.lookup(id)
    }

    pub fn stats(&self, id: FiberId) -> Result<FiberStats> {
        self.registry
            .lookup(id)
            .map(|fiber| fiber.stats())
            .ok_or(FiberError::NotFound(id))
    }

    /// Statistics of every registered fiber, in identifier order.
    pub fn all_stats(&self) -> Vec<FiberStats> {
        self.registry.iter().map(|fiber| fiber.stats()).collect()
    }

    /// Full textual report of one fiber.
    pub fn report(&self, id: FiberId) -> Result<String> {
        self.stats(id).map(|stats| stats.to_string())
    }

    pub fn fls(&self) -> &FlsTable {
        &self.fls
    }

    pub fn fls_alloc(&self) -> Result<usize> {
        self.fls.alloc()
    }

    pub fn fls_free(&self, index: i64) -> Result<()> {
        self.fls.free(index)
    }

    pub fn fls_set(&self, index: i64, value: u64) -> Result<()> {
        self.fls.set(index, value)
    }

    pub fn fls_get(&self, index: i64) -> Result<u64> {
        self.fls.get(index)
    }
}
