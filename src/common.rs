//! Common components shared by the fiber engine: stacks, CPU clocks and
//! the small amount of OS plumbing the switch path needs.

/// Default stack size for fibers created with an owned stack (64KB)
pub const STACK_SIZE: usize = 64 * 1024;

/// Bytes the x86_64 initial frame needs below the stack top.
pub(crate) const MIN_FRAME: usize = 16;

/// Stack memory owned by a fiber.
///
/// The memory is never moved once allocated, so the aligned top handed to
/// the context stays valid for as long as the `FiberStack` lives.
pub struct FiberStack {
    memory: Vec<u8>,
}

impl FiberStack {
    /// Allocate a zeroed stack of `size` bytes.
    pub fn new(size: usize) -> Self {
        FiberStack {
            memory: vec![0u8; size],
        }
    }

    /// Allocate a stack of the default size.
    pub fn with_default_size() -> Self {
        Self::new(STACK_SIZE)
    }

    /// Size of the allocation in bytes.
    pub fn size(&self) -> usize {
        self.memory.len()
    }

    /// Highest usable address, aligned down to 16 bytes (required by ABI).
    pub fn top(&mut self) -> *mut u8 {
        let top = self.memory.as_mut_ptr() as usize + self.memory.len();
        (top & !0xF) as *mut u8
    }

    /// Lowest address of the allocation.
    pub fn bottom(&self) -> *const u8 {
        self.memory.as_ptr()
    }
}

impl std::fmt::Debug for FiberStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberStack")
            .field("bottom", &self.bottom())
            .field("size", &self.size())
            .finish()
    }
}

/// User/system CPU time consumed by the calling thread, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTime {
    pub user_ns: u64,
    pub system_ns: u64,
}

impl CpuTime {
    /// Sample the calling thread's CPU usage.
    ///
    /// Falls back to process-wide usage on platforms without per-thread
    /// accounting, and to zero if the query fails.
    pub fn now() -> Self {
        #[cfg(target_os = "linux")]
        let who = libc::RUSAGE_THREAD;
        #[cfg(not(target_os = "linux"))]
        let who = libc::RUSAGE_SELF;

        unsafe {
            let mut usage = std::mem::zeroed::<libc::rusage>();
            if libc::getrusage(who, &mut usage) == 0 {
                CpuTime {
                    user_ns: timeval_ns(&usage.ru_utime),
                    system_ns: timeval_ns(&usage.ru_stime),
                }
            } else {
                CpuTime::default()
            }
        }
    }

    /// Sum of user and system time.
    pub fn total_ns(&self) -> u64 {
        self.user_ns + self.system_ns
    }
}

fn timeval_ns(tv: &libc::timeval) -> u64 {
    (tv.tv_sec as u64) * 1_000_000_000 + (tv.tv_usec as u64) * 1_000
}

/// Identifier of the calling OS thread.
#[cfg(target_os = "linux")]
pub fn os_thread_id() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// Identifier of the calling OS thread.
#[cfg(not(target_os = "linux"))]
pub fn os_thread_id() -> u64 {
    unsafe { libc::pthread_self() as usize as u64 }
}

/// Blocks asynchronous signal delivery to the calling thread until dropped.
///
/// A handler running between two halves of an FPU install would observe a
/// mixed control state.
pub(crate) struct SignalMask {
    previous: Option<libc::sigset_t>,
}

impl SignalMask {
    pub(crate) fn block_all() -> Self {
        unsafe {
            let mut all = std::mem::zeroed::<libc::sigset_t>();
            let mut previous = std::mem::zeroed::<libc::sigset_t>();
            libc::sigfillset(&mut all);
            if libc::pthread_sigmask(libc::SIG_BLOCK, &all, &mut previous) == 0 {
                SignalMask {
                    previous: Some(previous),
                }
            } else {
                SignalMask { previous: None }
            }
        }
    }

    /// A guard that masks nothing.
    pub(crate) fn none() -> Self {
        SignalMask { previous: None }
    }
}

impl Drop for SignalMask {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            unsafe {
                libc::pthread_sigmask(libc::SIG_SETMASK, &previous, std::ptr::null_mut());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_top_is_aligned_and_in_bounds() {
        let mut stack = FiberStack::new(4096 + 7);
        let top = stack.top() as usize;
        let bottom = stack.bottom() as usize;
        assert_eq!(top % 16, 0);
        assert!(top <= bottom + stack.size());
        assert!(top > bottom + stack.size() - 16);
    }

    #[test]
    fn cpu_time_is_monotonic() {
        let before = CpuTime::now();
        let mut x = 0u64;
        for i in 0..2_000_000u64 {
            x = x.wrapping_add(i * i);
        }
        std::hint::black_box(x);
        let after = CpuTime::now();
        assert!(after.user_ns >= before.user_ns);
        assert!(after.system_ns >= before.system_ns);
    }

    #[test]
    fn thread_ids_differ_between_threads() {
        let here = os_thread_id();
        let there = std::thread::spawn(os_thread_id).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn signal_mask_restores_previous_mask() {
        unsafe fn current_mask() -> libc::sigset_t {
            unsafe {
                let mut set = std::mem::zeroed::<libc::sigset_t>();
                libc::pthread_sigmask(libc::SIG_BLOCK, std::ptr::null(), &mut set);
                set
            }
        }

        unsafe {
            assert_eq!(libc::sigismember(&current_mask(), libc::SIGUSR1), 0);
            {
                let _guard = SignalMask::block_all();
                assert_eq!(libc::sigismember(&current_mask(), libc::SIGUSR1), 1);
            }
            assert_eq!(libc::sigismember(&current_mask(), libc::SIGUSR1), 0);
        }
    }
}
