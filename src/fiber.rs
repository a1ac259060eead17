//! The fiber record: saved execution state plus lifecycle statistics.

use crate::arch::{Context, FpuState};
use crate::common::{CpuTime, FiberStack};
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Identifier of a fiber within its space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(pub u64);

impl FiberId {
    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fiber lifecycle state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Suspended; its saved context may be installed by a claimant.
    Stopped = 0,
    /// Some thread's live registers belong to this fiber.
    Running = 1,
}

impl FiberState {
    fn from_bit(running: bool) -> Self {
        if running {
            FiberState::Running
        } else {
            FiberState::Stopped
        }
    }
}

/// A registered fiber.
///
/// `running` is both state and lock: whoever flips it from false to true
/// owns `context` and `fpu` until it flips it back.
pub struct Fiber {
    id: FiberId,
    running: AtomicBool,
    context: UnsafeCell<Context>,
    fpu: UnsafeCell<FpuState>,
    creator: u64,
    entry_point: usize,
    activations: AtomicU64,
    failed_activations: AtomicU64,
    utime: AtomicU64,
    stime: AtomicU64,
    last_start_utime: AtomicU64,
    last_start_stime: AtomicU64,
    _stack: Option<FiberStack>, // Keep stack alive
}

// Fiber is shared between threads through the registry. The UnsafeCell
// fields are only touched by the holder of the running claim.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Record for the calling thread itself, already running.
    ///
    /// Its register context is filled in at the first switch away.
    pub(crate) fn running(creator: u64, entry_point: usize, started: CpuTime) -> Self {
        let fiber = Fiber::build(
            true,
            Context::default(),
            FpuState::capture(),
            creator,
            entry_point,
            None,
        );
        fiber.activations.store(1, Ordering::Relaxed);
        fiber.mark_started(started);
        fiber
    }

    /// Record for a fiber that has not run yet.
    pub(crate) fn stopped(
        context: Context,
        fpu: FpuState,
        creator: u64,
        entry_point: usize,
        stack: Option<FiberStack>,
    ) -> Self {
        Fiber::build(false, context, fpu, creator, entry_point, stack)
    }

    fn build(
        running: bool,
        context: Context,
        fpu: FpuState,
        creator: u64,
        entry_point: usize,
        stack: Option<FiberStack>,
    ) -> Self {
        Fiber {
            id: FiberId(u64::MAX),
            running: AtomicBool::new(running),
            context: UnsafeCell::new(context),
            fpu: UnsafeCell::new(fpu),
            creator,
            entry_point,
            activations: AtomicU64::new(0),
            failed_activations: AtomicU64::new(0),
            utime: AtomicU64::new(0),
            stime: AtomicU64::new(0),
            last_start_utime: AtomicU64::new(0),
            last_start_stime: AtomicU64::new(0),
            _stack: stack,
        }
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: FiberId) {
        self.id = id;
    }

    pub fn state(&self) -> FiberState {
        FiberState::from_bit(self.running.load(Ordering::Acquire))
    }

    pub fn creator(&self) -> u64 {
        self.creator
    }

    pub fn entry_point(&self) -> usize {
        self.entry_point
    }

    pub fn activations(&self) -> u64 {
        self.activations.load(Ordering::Relaxed)
    }

    pub fn failed_activations(&self) -> u64 {
        self.failed_activations.load(Ordering::Relaxed)
    }

    /// Try to take the running claim. Returns false if someone holds it.
    pub(crate) fn try_claim(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Give up the running claim. Must follow the save of `context`.
    pub(crate) fn release(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub(crate) fn record_activation(&self) {
        self.activations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_activation(&self) {
        self.failed_activations.fetch_add(1, Ordering::Relaxed);
    }

    /// Charge the time since the last activation to this fiber.
    pub(crate) fn charge(&self, now: CpuTime) {
        let user = now
            .user_ns
            .saturating_sub(self.last_start_utime.load(Ordering::Relaxed));
        let system = now
            .system_ns
            .saturating_sub(self.last_start_stime.load(Ordering::Relaxed));
        self.utime.fetch_add(user, Ordering::Relaxed);
        self.stime.fetch_add(system, Ordering::Relaxed);
    }

    /// Set the baseline the next `charge` measures from.
    pub(crate) fn mark_started(&self, now: CpuTime) {
        self.last_start_utime.store(now.user_ns, Ordering::Relaxed);
        self.last_start_stime.store(now.system_ns, Ordering::Relaxed);
    }

    /// # Safety
    /// The caller must hold this fiber's running claim.
    pub(crate) unsafe fn context_ptr(&self) -> *mut Context {
        self.context.get()
    }

    /// # Safety
    /// The caller must hold this fiber's running claim.
    pub(crate) unsafe fn fpu_ptr(&self) -> *mut FpuState {
        self.fpu.get()
    }

    /// Snapshot of the statistics, safe to take from any thread.
    pub fn stats(&self) -> FiberStats {
        FiberStats {
            id: self.id,
            state: self.state(),
            entry_point: self.entry_point,
            creator: self.creator,
            activations: self.activations(),
            failed_activations: self.failed_activations(),
            utime_ns: self.utime.load(Ordering::Relaxed),
            stime_ns: self.stime.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("entry_point", &format_args!("{:#x}", self.entry_point))
            .field("creator", &self.creator)
            .finish()
    }
}

/// Point-in-time statistics of one fiber.
///
/// `Display` renders the per-fiber report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiberStats {
    pub id: FiberId,
    pub state: FiberState,
    pub entry_point: usize,
    pub creator: u64,
    pub activations: u64,
    pub failed_activations: u64,
    pub utime_ns: u64,
    pub stime_ns: u64,
}

impl fmt::Display for FiberStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "state: {}", self.state as u8)?;
        writeln!(f, "entry point: {:x}", self.entry_point)?;
        writeln!(f, "creator pid: {}", self.creator)?;
        writeln!(f, "# activations: {}", self.activations)?;
        writeln!(f, "# failed activations: {}", self.failed_activations)?;
        writeln!(f, "utime (ns): {}", self.utime_ns)?;
        writeln!(f, "stime (ns): {}", self.stime_ns)
    }
}
