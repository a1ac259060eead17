//! Configuration for a fiber space.

use crate::common::STACK_SIZE;

/// Default number of fiber-local storage slots.
pub const MAX_FLS: usize = 1024;

/// Default upper bound on fibers registered in one space.
pub const MAX_FIBERS: usize = 1 << 20;

/// Configuration for a [`FiberSpace`](crate::FiberSpace).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiberConfig {
    /// Maximum number of fibers the registry will hand out identifiers for.
    pub max_fibers: usize,
    /// Number of fiber-local storage slots.
    pub fls_capacity: usize,
    /// Stack size used by [`FiberSpace::alloc_stack`](crate::FiberSpace::alloc_stack).
    pub stack_size: usize,
    /// Block signals while a fiber's FPU state is installed.
    pub mask_signals: bool,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            max_fibers: MAX_FIBERS,
            fls_capacity: MAX_FLS,
            stack_size: STACK_SIZE,
            mask_signals: true,
        }
    }
}

impl FiberConfig {
    /// Set the registry capacity.
    pub fn with_max_fibers(mut self, max_fibers: usize) -> Self {
        self.max_fibers = max_fibers;
        self
    }

    /// Set the number of FLS slots.
    pub fn with_fls_capacity(mut self, capacity: usize) -> Self {
        self.fls_capacity = capacity;
        self
    }

    /// Set the default stack size.
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Enable or disable signal masking around FPU installs.
    pub fn with_mask_signals(mut self, mask: bool) -> Self {
        self.mask_signals = mask;
        self
    }
}
