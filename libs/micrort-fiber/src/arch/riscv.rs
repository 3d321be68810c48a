use core::arch::naked_asm;

pub const STACK_ALIGNMENT: usize = 16;
pub const MIN_STACK_SIZE: usize = 4096;

/// Saved task state for the RISC-V calling convention (RV32/RV64, integer +
/// `F`/`D` extension callee-saved registers).
///
/// Only `ra`, `sp`, the callee-saved `s0..s11` integer registers, and the
/// callee-saved `fs0..fs11` float registers are stored: every other register
/// is caller-saved and therefore already accounted for on the stack at the
/// `call` site that invoked the context switch.
#[repr(C)]
#[derive(Debug)]
pub struct Context {
    ra: usize,
    sp: usize,
    s: [usize; 12],
    fs: [usize; 12],
}

impl Context {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s: [0; 12],
            fs: [0; 12],
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "32")] {
        macro_rules! reg_store { () => { "sw" }; }
        macro_rules! reg_load { () => { "lw" }; }
        macro_rules! fp_store { () => { "fsw" }; }
        macro_rules! fp_load { () => { "flw" }; }
        const SZ: usize = 4;
    } else {
        macro_rules! reg_store { () => { "sd" }; }
        macro_rules! reg_load { () => { "ld" }; }
        macro_rules! fp_store { () => { "fsd" }; }
        macro_rules! fp_load { () => { "fld" }; }
        const SZ: usize = 8;
    }
}

/// Save the caller's callee-saved registers and stack pointer into `*ctx`,
/// returning 0. A later [`restore_context`] targeting `ctx` makes this
/// function's call site "return" again with the resumer's chosen value.
#[naked]
pub unsafe extern "C" fn save_context(ctx: *mut Context) -> i32 {
    // Safety: naked function body; `ctx` arrives in `a0` per the RISC-V ABI.
    unsafe {
        naked_asm!(
            concat!(reg_store!(), " ra, 0(a0)"),
            concat!(reg_store!(), " sp, {sz}(a0)"),
            concat!(reg_store!(), " s0, {sz}*2(a0)"),
            concat!(reg_store!(), " s1, {sz}*3(a0)"),
            concat!(reg_store!(), " s2, {sz}*4(a0)"),
            concat!(reg_store!(), " s3, {sz}*5(a0)"),
            concat!(reg_store!(), " s4, {sz}*6(a0)"),
            concat!(reg_store!(), " s5, {sz}*7(a0)"),
            concat!(reg_store!(), " s6, {sz}*8(a0)"),
            concat!(reg_store!(), " s7, {sz}*9(a0)"),
            concat!(reg_store!(), " s8, {sz}*10(a0)"),
            concat!(reg_store!(), " s9, {sz}*11(a0)"),
            concat!(reg_store!(), " s10, {sz}*12(a0)"),
            concat!(reg_store!(), " s11, {sz}*13(a0)"),
            "li a0, 0",
            "ret",
            sz = const SZ,
        )
    }
}

/// Restore `*ctx` and jump to it, making its matching [`save_context`] call
/// site observe `retval` as its return value. Never returns.
#[naked]
pub unsafe extern "C" fn restore_context(ctx: *const Context, retval: i32) -> ! {
    // Safety: naked function body; `ctx`/`retval` arrive in `a0`/`a1`.
    unsafe {
        naked_asm!(
            concat!(reg_load!(), " ra, 0(a0)"),
            concat!(reg_load!(), " sp, {sz}(a0)"),
            concat!(reg_load!(), " s0, {sz}*2(a0)"),
            concat!(reg_load!(), " s1, {sz}*3(a0)"),
            concat!(reg_load!(), " s2, {sz}*4(a0)"),
            concat!(reg_load!(), " s3, {sz}*5(a0)"),
            concat!(reg_load!(), " s4, {sz}*6(a0)"),
            concat!(reg_load!(), " s5, {sz}*7(a0)"),
            concat!(reg_load!(), " s6, {sz}*8(a0)"),
            concat!(reg_load!(), " s7, {sz}*9(a0)"),
            concat!(reg_load!(), " s8, {sz}*10(a0)"),
            concat!(reg_load!(), " s9, {sz}*11(a0)"),
            concat!(reg_load!(), " s10, {sz}*12(a0)"),
            concat!(reg_load!(), " s11, {sz}*13(a0)"),
            "mv a0, a1",
            "ret",
            sz = const SZ,
        )
    }
}

/// Save the caller into `*old`, then restore `*new` without going back
/// through the caller's return-value convention.
#[naked]
pub unsafe extern "C" fn swap_context(old: *mut Context, new: *const Context) {
    // Safety: naked function body; `old`/`new` arrive in `a0`/`a1`.
    unsafe {
        naked_asm!(
            concat!(reg_store!(), " ra, 0(a0)"),
            concat!(reg_store!(), " sp, {sz}(a0)"),
            concat!(reg_store!(), " s0, {sz}*2(a0)"),
            concat!(reg_store!(), " s1, {sz}*3(a0)"),
            concat!(reg_store!(), " s2, {sz}*4(a0)"),
            concat!(reg_store!(), " s3, {sz}*5(a0)"),
            concat!(reg_store!(), " s4, {sz}*6(a0)"),
            concat!(reg_store!(), " s5, {sz}*7(a0)"),
            concat!(reg_store!(), " s6, {sz}*8(a0)"),
            concat!(reg_store!(), " s7, {sz}*9(a0)"),
            concat!(reg_store!(), " s8, {sz}*10(a0)"),
            concat!(reg_store!(), " s9, {sz}*11(a0)"),
            concat!(reg_store!(), " s10, {sz}*12(a0)"),
            concat!(reg_store!(), " s11, {sz}*13(a0)"),
            concat!(reg_load!(), " ra, 0(a1)"),
            concat!(reg_load!(), " sp, {sz}(a1)"),
            concat!(reg_load!(), " s0, {sz}*2(a1)"),
            concat!(reg_load!(), " s1, {sz}*3(a1)"),
            concat!(reg_load!(), " s2, {sz}*4(a1)"),
            concat!(reg_load!(), " s3, {sz}*5(a1)"),
            concat!(reg_load!(), " s4, {sz}*6(a1)"),
            concat!(reg_load!(), " s5, {sz}*7(a1)"),
            concat!(reg_load!(), " s6, {sz}*8(a1)"),
            concat!(reg_load!(), " s7, {sz}*9(a1)"),
            concat!(reg_load!(), " s8, {sz}*10(a1)"),
            concat!(reg_load!(), " s9, {sz}*11(a1)"),
            concat!(reg_load!(), " s10, {sz}*12(a1)"),
            concat!(reg_load!(), " s11, {sz}*13(a1)"),
            "ret",
            sz = const SZ,
        )
    }
}

/// Trampoline planted at the bottom of a freshly made context's stack. The
/// first resume lands here with `s0` holding the argument and `s1` holding
/// the real entry point, both loaded there by [`make_context`].
#[naked]
unsafe extern "C" fn trampoline() -> ! {
    // Safety: naked function body; `s0`/`s1` were populated by `make_context`.
    unsafe {
        naked_asm!("mv a0, s0", "jalr s1", "unimp",)
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
    let sp = (top as usize) & !(STACK_ALIGNMENT - 1);

    // Safety: `ctx` is valid for writes, per this function's caller contract.
    unsafe {
        let ctx = &mut *ctx;
        *ctx = Context::new();
        ctx.sp = sp;
        ctx.ra = trampoline as usize;
        ctx.s[0] = arg;
        ctx.s[1] = entry as usize;
    }
}
