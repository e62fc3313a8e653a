//! x86_64 context switching
//!
//! Voluntary switches only need the System V callee-saved set plus the
//! stack and instruction pointers; everything else is dead across the
//! `context_switch` call boundary.

use std::arch::naked_asm;

/// Callee-saved register state for a suspended fiber
///
/// Field order is load-bearing: the assembly below addresses these by
/// fixed offsets.
#[repr(C)]
#[derive(Debug)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl Context {
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Aim a fresh context at `entry`
///
/// On first activation the context starts in the trampoline with the
/// entry function in r12. The stack pointer is 16-byte aligned so the
/// trampoline's `call` leaves `entry` with the ABI-required alignment.
///
/// # Safety
///
/// `ctx` must point to valid `Context` memory and `stack_top` must be the
/// top of a live, writable stack.
pub unsafe fn init_context(ctx: *mut Context, stack_top: *mut u8, entry: usize) {
    let ctx = &mut *ctx;
    ctx.rsp = (stack_top as usize & !0xF) as u64;
    ctx.rip = fiber_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry as u64;
    ctx.r13 = 0;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// First-activation trampoline: calls the entry function in r12
///
/// The entry function never returns (it ends in a terminal yield); the
/// trap after the call only fires if that contract is broken.
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "call r12", //
        "ud2",
    );
}

/// Symmetric context switch
///
/// Saves the callee-saved set into `old`, restores from `new` and jumps.
/// Returns (into the `old` context) when something later switches back.
///
/// # Safety
///
/// Both pointers must reference valid `Context` memory; `new` must hold
/// either a freshly initialized context or one previously saved here.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut Context, _new: *const Context) {
    naked_asm!(
        // Save callee-saved registers to old (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}
