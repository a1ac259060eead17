//! Cooperative fibers with explicit context switching.
//!
//! A thread becomes a fiber with [`FiberSpace::convert_current`], creates
//! further fibers with [`FiberSpace::create_with_stack`] (or the raw
//! [`FiberSpace::create`]), and hands its execution unit to another fiber
//! with [`FiberSpace::switch_to`]. A fiber runs on at most one thread at a
//! time: switching into a fiber that is already running fails with
//! [`FiberError::Busy`] and is counted as a failed activation.
//!
//! Fiber-local storage is a fixed table of 64-bit slots shared by every
//! fiber of a space ([`FiberSpace::fls_alloc`] and friends).
//!
//! Components:
//! - arch: register snapshots and the context switch routine
//! - fiber: fiber record, state and statistics
//! - registry: identifier allocation and lock-free lookup
//! - fls: fiber-local storage slots
//! - space: the switch engine
//! - control: request/response command surface

pub mod arch;
pub mod common;
pub mod config;
pub mod control;
pub mod error;
pub mod fiber;
pub mod fls;
pub mod registry;
pub mod space;

pub use common::{CpuTime, FiberStack, STACK_SIZE};
pub use config::{FiberConfig, MAX_FLS};
pub use control::{Request, Response};
pub use error::{ErrorKind, FiberError, Result};
pub use fiber::{Fiber, FiberId, FiberState, FiberStats};
pub use space::{CreateParams, FiberEntry, FiberSpace, current};
