use core::arch::naked_asm;

pub const STACK_ALIGNMENT: usize = 16;
pub const MIN_STACK_SIZE: usize = 4096;

/// Saved task state for the x86-64 System V calling convention.
///
/// Only the callee-saved integer registers, the stack pointer, and the two
/// pieces of FPU state the ABI requires a callee to preserve (MXCSR, the x87
/// control word) are stored here; every other register is already spilled to
/// the stack by the compiler at the `call` site that entered the context
/// switch, by virtue of being caller-saved.
#[repr(C)]
#[derive(Debug)]
pub struct Context {
    rsp: u64,
    r15: u64,
    r14: u64,
    r13: u64,
    r12: u64,
    rbx: u64,
    rbp: u64,
    mxcsr: u32,
    x87cw: u32,
}

impl Context {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            rsp: 0,
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbx: 0,
            rbp: 0,
            mxcsr: 0,
            x87cw: 0,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Save the caller's callee-saved registers and stack pointer into `*ctx`,
/// returning 0. A later [`restore_context`] targeting `ctx` makes this
/// function's call site "return" again with the resumer's chosen value.
#[naked]
pub unsafe extern "C" fn save_context(ctx: *mut Context) -> i32 {
    // Safety: naked function body, `ctx` is the first argument in `rdi` per
    // the System V ABI.
    unsafe {
        naked_asm!(
            "mov [rdi + 0x00], rsp",
            "mov [rdi + 0x08], r15",
            "mov [rdi + 0x10], r14",
            "mov [rdi + 0x18], r13",
            "mov [rdi + 0x20], r12",
            "mov [rdi + 0x28], rbx",
            "mov [rdi + 0x30], rbp",
            "stmxcsr [rdi + 0x38]",
            "fnstcw [rdi + 0x3c]",
            "xor eax, eax",
            "ret",
        )
    }
}

/// Restore `*ctx` and jump to it, making its matching [`save_context`] call
/// site observe `retval` as its return value. Never returns.
#[naked]
pub unsafe extern "C" fn restore_context(ctx: *const Context, retval: i32) -> ! {
    // Safety: naked function body, `ctx`/`retval` arrive in `rdi`/`esi`.
    unsafe {
        naked_asm!(
            "mov rsp, [rdi + 0x00]",
            "mov r15, [rdi + 0x08]",
            "mov r14, [rdi + 0x10]",
            "mov r13, [rdi + 0x18]",
            "mov r12, [rdi + 0x20]",
            "mov rbx, [rdi + 0x28]",
            "mov rbp, [rdi + 0x30]",
            "ldmxcsr [rdi + 0x38]",
            "fldcw [rdi + 0x3c]",
            "mov eax, esi",
            "ret",
        )
    }
}

/// Save the caller into `*old`, then restore `*new` without going back
/// through the caller's return-value convention: the next resume of `old`
/// simply falls through to the instruction after the call.
#[naked]
pub unsafe extern "C" fn swap_context(old: *mut Context, new: *const Context) {
    // Safety: naked function body, `old`/`new` arrive in `rdi`/`rsi`.
    unsafe {
        naked_asm!(
            "mov [rdi + 0x00], rsp",
            "mov [rdi + 0x08], r15",
            "mov [rdi + 0x10], r14",
            "mov [rdi + 0x18], r13",
            "mov [rdi + 0x20], r12",
            "mov [rdi + 0x28], rbx",
            "mov [rdi + 0x30], rbp",
            "stmxcsr [rdi + 0x38]",
            "fnstcw [rdi + 0x3c]",
            "mov rsp, [rsi + 0x00]",
            "mov r15, [rsi + 0x08]",
            "mov r14, [rsi + 0x10]",
            "mov r13, [rsi + 0x18]",
            "mov r12, [rsi + 0x20]",
            "mov rbx, [rsi + 0x28]",
            "mov rbp, [rsi + 0x30]",
            "ldmxcsr [rsi + 0x38]",
            "fldcw [rsi + 0x3c]",
            "ret",
        )
    }
}

/// Trampoline planted at the bottom of a freshly made context's stack. The
/// first resume of that context lands here with `r12` holding the user
/// argument and `r13` holding the real entry point, both loaded there by
/// [`make_context`].
#[naked]
unsafe extern "C" fn trampoline() -> ! {
    // Safety: naked function body; `r12`/`r13` were populated by `make_context`.
    unsafe {
        naked_asm!(
            "mov rdi, r12",
            "call r13",
            // entry points never return (they diverge into the task-exit
            // path), but if one did there is nothing sensible to return to.
            "ud2",
        )
    }
}

/// # Safety
/// See [`crate::makecontext`].
pub unsafe fn make_context(
    ctx: *mut Context,
    stack: &mut [u8],
    entry: extern "C" fn(usize) -> !,
    arg: usize,
) {
    assert!(stack.len() >= MIN_STACK_SIZE);
    // Safety: `stack` is a valid writable slice; the resulting pointer is
    // one-past-the-end, which is in-bounds to form (never dereferenced
    // directly).
    let top = unsafe { stack.as_mut_ptr().add(stack.len()) };
    let aligned_top = (top as usize) & !(STACK_ALIGNMENT - 1);
    // `restore_context`/`swap_context` both end in a bare `ret`, which pops
    // the word at `[rsp]` and jumps there. Reserve that word just below the
    // aligned top of the stack and point it at the trampoline, so the first
    // resume of this context lands there instead of reading garbage.
    let sp = aligned_top - 8;

    // Safety: `sp` is `aligned_top - 8`, which stays within `stack` because
    // `stack.len() >= MIN_STACK_SIZE` was just asserted and is 8-byte aligned.
    unsafe {
        core::ptr::write(sp as *mut u64, trampoline as usize as u64);
    }

    // Safety: `ctx` is valid for writes, per this function's caller contract.
    unsafe {
        let ctx = &mut *ctx;
        ctx.rsp = sp as u64;
        ctx.r12 = arg as u64;
        ctx.r13 = entry as usize as u64;
        ctx.r15 = 0;
        ctx.r14 = 0;
        ctx.rbx = 0;
        ctx.rbp = 0;
        ctx.mxcsr = 0x1F80; // default MXCSR: all exceptions masked
        ctx.x87cw = 0x037F; // default x87 control word
    }
}
