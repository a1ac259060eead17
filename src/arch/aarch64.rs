//! aarch64 implementation of context switching

use super::StartFn;
use std::arch::asm;
use std::arch::naked_asm;

/// Saved CPU context for context switching
///
/// On aarch64 (AAPCS64), these are the callee-saved registers
/// that must be preserved across function calls:
/// - x19-x28: general purpose callee-saved registers
/// - d8-d15: floating-point/SIMD callee-saved registers (lower 64 bits of v8-v15)
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Stack pointer
    sp: u64,
    /// Link register (return address)
    lr: u64,
    /// Frame pointer
    fp: u64,
    /// General purpose (callee-saved)
    x19: u64,
    x20: u64,
    x21: u64,
    x22: u64,
    x23: u64,
    x24: u64,
    x25: u64,
    x26: u64,
    x27: u64,
    x28: u64,
    /// Floating-point/SIMD (callee-saved, lower 64 bits)
    d8: u64,
    d9: u64,
    d10: u64,
    d11: u64,
    d12: u64,
    d13: u64,
    d14: u64,
    d15: u64,
}

impl Context {
    /// Create the context of a fiber that has never run.
    ///
    /// - `stack_top`: The top of the stack (highest address), 16-byte aligned
    /// - `start`: Function the trampoline branches to
    /// - `entry`, `param`: Handed to `start` as its two arguments
    ///
    /// # Safety
    /// Kept `unsafe` to match the x86_64 backend, which writes into the stack.
    pub unsafe fn new(stack_top: usize, start: StartFn, entry: usize, param: usize) -> Self {
        // On aarch64, `ret` jumps to the address in lr (link register).
        // No need to push return address on stack like x86_64.
        Context {
            sp: stack_top as u64,
            lr: start_trampoline as usize as u64,
            x19: entry as u64,
            x20: param as u64,
            x21: start as usize as u64,
            ..Default::default()
        }
    }

    /// Stack pointer recorded in this context.
    pub fn stack_pointer(&self) -> usize {
        self.sp as usize
    }
}

/// Floating-point control and status registers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FpuState {
    fpcr: u64,
    fpsr: u64,
}

impl FpuState {
    /// Read the live floating-point control state of this thread.
    pub fn capture() -> Self {
        let fpcr: u64;
        let fpsr: u64;
        unsafe {
            asm!(
                "mrs {fpcr}, fpcr",
                "mrs {fpsr}, fpsr",
                fpcr = out(reg) fpcr,
                fpsr = out(reg) fpsr,
                options(nomem, nostack, preserves_flags)
            );
        }
        FpuState { fpcr, fpsr }
    }

    /// Install this state into the live floating-point unit.
    pub fn install(&self) {
        unsafe {
            asm!(
                "msr fpcr, {fpcr}",
                "msr fpsr, {fpsr}",
                fpcr = in(reg) self.fpcr,
                fpsr = in(reg) self.fpsr,
                options(nomem, nostack, preserves_flags)
            );
        }
    }
}

/// Address of this instruction.
#[inline(always)]
pub fn current_pc() -> usize {
    let pc: usize;
    unsafe {
        asm!(
            "adr {}, .",
            out(reg) pc,
            options(nomem, nostack, preserves_flags)
        );
    }
    pc
}

/// First instructions of a fresh fiber.
///
/// Moves the entry and parameter out of callee-saved registers into the
/// argument registers and branches to the start function kept in x21.
#[unsafe(naked)]
pub extern "C" fn start_trampoline() -> ! {
    naked_asm!("mov x0, x19", "mov x1, x20", "br x21");
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
    // Arguments: x0 = old, x1 = new
    naked_asm!(
        // Save callee-saved registers to old context (x0)
        "mov x9, sp",
        "str x9,  [x0, #0x00]", // sp
        "str lr,  [x0, #0x08]", // lr (x30)
        "str fp,  [x0, #0x10]", // fp (x29)
        "str x19, [x0, #0x18]",
        "str x20, [x0, #0x20]",
        "str x21, [x0, #0x28]",
        "str x22, [x0, #0x30]",
        "str x23, [x0, #0x38]",
        "str x24, [x0, #0x40]",
        "str x25, [x0, #0x48]",
        "str x26, [x0, #0x50]",
        "str x27, [x0, #0x58]",
        "str x28, [x0, #0x60]",
        // Save floating-point callee-saved registers
        "str d8,  [x0, #0x68]",
        "str d9,  [x0, #0x70]",
        "str d10, [x0, #0x78]",
        "str d11, [x0, #0x80]",
        "str d12, [x0, #0x88]",
        "str d13, [x0, #0x90]",
        "str d14, [x0, #0x98]",
        "str d15, [x0, #0xa0]",
        // Load callee-saved registers from new context (x1)
        "ldr x9,  [x1, #0x00]", // sp
        "mov sp, x9",
        "ldr lr,  [x1, #0x08]", // lr (x30)
        "ldr fp,  [x1, #0x10]", // fp (x29)
        "ldr x19, [x1, #0x18]",
        "ldr x20, [x1, #0x20]",
        "ldr x21, [x1, #0x28]",
        "ldr x22, [x1, #0x30]",
        "ldr x23, [x1, #0x38]",
        "ldr x24, [x1, #0x40]",
        "ldr x25, [x1, #0x48]",
        "ldr x26, [x1, #0x50]",
        "ldr x27, [x1, #0x58]",
        "ldr x28, [x1, #0x60]",
        // Load floating-point callee-saved registers
        "ldr d8,  [x1, #0x68]",
        "ldr d9,  [x1, #0x70]",
        "ldr d10, [x1, #0x78]",
        "ldr d11, [x1, #0x80]",
        "ldr d12, [x1, #0x88]",
        "ldr d13, [x1, #0x90]",
        "ldr d14, [x1, #0x98]",
        "ldr d15, [x1, #0xa0]",
        // Return to the new context
        "ret",
    );
}
