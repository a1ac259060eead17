//! Architecture-specific register snapshots and context switching.
//!
//! Each backend provides the same surface:
//! - `Context`: callee-saved register state of a suspended fiber
//! - `FpuState`: floating-point control/status state
//! - `context_switch`: save the live registers into one context, load another
//! - `start_trampoline`: first code a freshly created fiber executes
//! - `current_pc`: address of the calling instruction

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::*;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("fibers supports only x86_64 and aarch64");

/// Function a fresh fiber jumps to once the trampoline has moved its start
/// arguments into the argument registers.
pub type StartFn = extern "C" fn(entry: usize, param: usize) -> !;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fpu_state_survives_install() {
        let state = FpuState::capture();
        state.install();
        assert_eq!(FpuState::capture(), state);
    }

    #[test]
    fn fresh_context_starts_below_stack_top() {
        extern "C" fn start(_: usize, _: usize) -> ! {
            std::process::abort();
        }

        let mut stack = crate::common::FiberStack::new(256);
        let top = stack.top() as usize;
        let ctx = unsafe { Context::new(top, start, 1, 2) };
        assert!(ctx.stack_pointer() <= top);
        assert!(ctx.stack_pointer() >= top - 16);
        assert_eq!(ctx.stack_pointer() % 16, 0);
    }

    #[test]
    fn current_pc_is_nonzero() {
        assert_ne!(current_pc(), 0);
    }
}
