//! Fiber and fiber-local storage errors.

use crate::fiber::FiberId;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FiberError>;

/// Broad class of a failure, independent of which operation produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A record or slot could not be allocated.
    Allocation,
    /// A record was allocated but could not be published.
    Registration,
    /// The referenced fiber or slot does not exist.
    NotFound,
    /// The target fiber is already running somewhere.
    Busy,
    /// The call was made in the wrong context or with unusable input.
    Precondition,
}

/// An error returned by a fiber or FLS operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FiberError {
    /// Every fiber identifier of the space is in use.
    #[error("fiber registry is full ({capacity} fibers)")]
    RegistryFull { capacity: usize },

    /// The identifier was allocated but the record could not be published.
    #[error("could not publish fiber {0}")]
    Registration(FiberId),

    #[error("fiber {0} not found")]
    NotFound(FiberId),

    /// The target fiber's claim failed; counted as a failed activation.
    #[error("fiber {0} is already running")]
    Busy(FiberId),

    #[error("switch attempted outside fiber context")]
    NotInFiber,

    #[error("thread is already running as fiber {0}")]
    AlreadyFiber(FiberId),

    /// The thread already runs as a fiber of a different space.
    #[error("thread is running as fiber {0} of another fiber space")]
    ForeignFiber(FiberId),

    /// Creation parameters supplied by the caller cannot be used.
    #[error("invalid creation parameters: {0}")]
    InvalidParams(&'static str),

    /// A raw control payload was short or malformed.
    #[error("malformed payload for command {command}: {reason}")]
    InvalidPayload { command: u32, reason: &'static str },

    #[error("no free fls slot")]
    FlsExhausted,

    #[error("fls slot {0} is not allocated")]
    SlotNotAllocated(usize),

    #[error("fls index {index} out of range (capacity {capacity})")]
    InvalidSlot { index: i64, capacity: usize },
}

impl FiberError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FiberError::RegistryFull { .. } | FiberError::FlsExhausted => ErrorKind::Allocation,
            FiberError::Registration(_) => ErrorKind::Registration,
            FiberError::NotFound(_) | FiberError::SlotNotAllocated(_) => ErrorKind::NotFound,
            FiberError::Busy(_) => ErrorKind::Busy,
            FiberError::NotInFiber
            | FiberError::AlreadyFiber(_)
            | FiberError::ForeignFiber(_)
            | FiberError::InvalidParams(_)
            | FiberError::InvalidPayload { .. }
            | FiberError::InvalidSlot { .. } => ErrorKind::Precondition,
        }
    }
}
