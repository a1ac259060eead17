//! x86_64 implementation of context switching

use super::StartFn;
use std::arch::asm;
use std::arch::naked_asm;

/// Saved CPU context for context switching
///
/// On x86_64 System V ABI, these are the callee-saved registers
/// that must be preserved across function calls.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Stack pointer
    rsp: u64,
    /// Frame pointer
    rbp: u64,
    /// General purpose (callee-saved)
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

impl Context {
    /// Create the context of a fiber that has never run.
    ///
    /// - `stack_top`: The top of the stack (highest address), 16-byte aligned
    /// - `start`: Function the trampoline jumps to
    /// - `entry`, `param`: Handed to `start` as its two arguments
    ///
    /// # Safety
    /// `stack_top - 16 .. stack_top` must be writable memory owned by the fiber.
    pub unsafe fn new(stack_top: usize, start: StartFn, entry: usize, param: usize) -> Self {
        // System V ABI requires RSP to be 16-byte aligned BEFORE `call` instruction.
        // After `call`, RSP becomes 16n+8 (due to pushed return address).
        // Since we use `ret` instead of `call`, we need to simulate this:
        //
        // Stack layout (growing downward):
        //   stack_top - 8:  (padding for alignment)
        //   stack_top - 16: return address (trampoline)
        //
        // After `ret`: RSP = stack_top - 8, which is 16n+8 as required.
        let initial_rsp = stack_top - 16;

        unsafe {
            std::ptr::write(initial_rsp as *mut u64, start_trampoline as usize as u64);
            std::ptr::write((stack_top - 8) as *mut u64, 0);
        }

        Context {
            rsp: initial_rsp as u64,
            r12: entry as u64,
            r13: param as u64,
            r14: start as usize as u64,
            ..Default::default()
        }
    }

    /// Stack pointer recorded in this context.
    pub fn stack_pointer(&self) -> usize {
        self.rsp as usize
    }
}

/// Floating-point control state: SSE control/status and x87 control word.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpuState {
    mxcsr: u32,
    fcw: u16,
}

impl Default for FpuState {
    /// Power-on defaults: all exceptions masked, round to nearest.
    fn default() -> Self {
        FpuState {
            mxcsr: 0x1F80,
            fcw: 0x037F,
        }
    }
}

impl FpuState {
    /// Read the live floating-point control state of this thread.
    pub fn capture() -> Self {
        let mut state = FpuState::default();
        unsafe {
            asm!(
                "stmxcsr [{mxcsr}]",
                "fnstcw [{fcw}]",
                mxcsr = in(reg) &raw mut state.mxcsr,
                fcw = in(reg) &raw mut state.fcw,
                options(nostack, preserves_flags)
            );
        }
        state
    }

    /// Install this state into the live floating-point unit.
    pub fn install(&self) {
        unsafe {
            asm!(
                "ldmxcsr [{mxcsr}]",
                "fldcw [{fcw}]",
                mxcsr = in(reg) &raw const self.mxcsr,
                fcw = in(reg) &raw const self.fcw,
                options(nostack, preserves_flags, readonly)
            );
        }
    }
}

/// Address of the instruction following this call site.
#[inline(always)]
pub fn current_pc() -> usize {
    let pc: usize;
    unsafe {
        asm!(
            "lea {}, [rip]",
            out(reg) pc,
            options(nomem, nostack, preserves_flags)
        );
    }
    pc
}

/// First instructions of a fresh fiber.
///
/// Moves the entry and parameter out of callee-saved registers into the
/// argument registers and jumps to the start function kept in r14.
#[unsafe(naked)]
pub extern "C" fn start_trampoline() -> ! {
    naked_asm!("mov rdi, r12", "mov rsi, r13", "jmp r14");
}

/// Switch from one context to another
///
/// Saves the current CPU state into `old` and restores state from `new`.
/// This function returns when another context switches back to `old`.
///
/// # Safety
/// Both pointers must be valid. The `new` context must have been properly
/// initialized (either by a previous `context_switch` or by `Context::new`).
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut Context, _new: *const Context) {
    naked_asm!(
        // Save callee-saved registers to old context (rdi)
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        // Load callee-saved registers from new context (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        // Return to the new context
        // For a fresh fiber: pops the trampoline address and jumps there
        // For a suspended fiber: returns to where it called context_switch
        "ret",
    );
}
