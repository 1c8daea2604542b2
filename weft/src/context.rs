//! Machine-level execution contexts.
//!
//! A [`CpuContext`] holds the callee-saved register file, stack pointer and
//! resume address of a suspended computation. [`switch`] saves the current
//! registers into one context and restores another in a single primitive; the
//! call itself is the compiler barrier, since nothing may be cached across an
//! opaque extern call.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {

/// Callee-saved register file for x86-64 System V.
///
/// Field order is ABI here: the offsets are baked into the assembly of
/// [`switch`]. `fcw`/`mxcsr` carry the FP control state, which is
/// callee-saved and must survive a switch.
#[repr(C)]
pub(crate) struct CpuContext {
    r15: u64,    // 0x00
    r14: u64,    // 0x08
    r13: u64,    // 0x10
    r12: u64,    // 0x18
    rbx: u64,    // 0x20
    rbp: u64,    // 0x28
    rsp: u64,    // 0x30
    rflags: u64, // 0x38
    rip: u64,    // 0x40
    fcw: u64,    // 0x48
    mxcsr: u64,  // 0x50
}

impl CpuContext {
    pub(crate) const fn zeroed() -> Self {
        CpuContext {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbx: 0,
            rbp: 0,
            rsp: 0,
            rflags: 0,
            rip: 0,
            fcw: 0,
            mxcsr: 0,
        }
    }

    /// Fabricate a context that, on its first switch, enters `entry(arg)` on
    /// a fresh stack.
    ///
    /// The bootstrap values ride in callee-saved registers: `r15` carries the
    /// argument and `r14` the entry address; [`start_shim`] moves them into
    /// place. `rbp` starts null so stack walks terminate.
    pub(crate) fn prepare(&mut self, entry: usize, arg: usize, stack_top: usize) {
        *self = CpuContext {
            r15: arg as u64,
            r14: entry as u64,
            r13: 0,
            r12: 0,
            rbx: 0,
            rbp: 0,
            // 16-byte aligned at shim entry; the shim's `call` then produces
            // the ABI-required rsp % 16 == 8 inside the entry function.
            rsp: (stack_top & !15) as u64,
            rflags: 0x202,
            rip: start_shim as usize as u64,
            fcw: 0x037f,
            mxcsr: 0x1f80,
        };
    }

    pub(crate) fn stack_pointer(&self) -> usize {
        self.rsp as usize
    }
}

/// Save the current execution state into `*old` and resume `*new`.
///
/// # Safety
/// `old` must be writable, `new` must hold a context previously saved by this
/// function or fabricated by [`CpuContext::prepare`], and the target stack
/// must be live. Returns on the target stack.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch(old: *mut CpuContext, new: *const CpuContext) {
    core::arch::naked_asm!(
        // Save callee-saved registers into old
        "mov [rdi + 0x00], r15",
        "mov [rdi + 0x08], r14",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], rbx",
        "mov [rdi + 0x28], rbp",
        // Save rsp, rflags and the resume address
        "mov [rdi + 0x30], rsp",
        "pushfq",
        "pop qword ptr [rdi + 0x38]",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x40], rax",
        // FP control state
        "fnstcw word ptr [rdi + 0x48]",
        "stmxcsr dword ptr [rdi + 0x50]",
        "ldmxcsr dword ptr [rsi + 0x50]",
        "fldcw word ptr [rsi + 0x48]",
        // Load the new register file
        "mov r15, [rsi + 0x00]",
        "mov r14, [rsi + 0x08]",
        "mov r13, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov rbx, [rsi + 0x20]",
        "mov rbp, [rsi + 0x28]",
        "mov rsp, [rsi + 0x30]",
        "push qword ptr [rsi + 0x38]",
        "popfq",
        "jmp qword ptr [rsi + 0x40]",
        // Resume point for a context saved above: the original return
        // address is back on top of the restored stack.
        "2:",
        "ret",
    );
}

/// First-switch target of a fresh context: unpack the bootstrap registers and
/// enter the coroutine. The entry function never returns.
#[unsafe(naked)]
unsafe extern "C" fn start_shim() -> ! {
    core::arch::naked_asm!("mov rdi, r15", "xor ebp, ebp", "call r14", "ud2");
}

pub(crate) fn current_stack_pointer() -> usize {
    let sp: usize;
    unsafe { core::arch::asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack)) };
    sp
}

    } else if #[cfg(target_arch = "aarch64")] {

/// Callee-saved register file for AArch64 AAPCS64. Offsets are baked into
/// the assembly of [`switch`]; d8-d15 are the callee-saved SIMD halves.
#[repr(C)]
pub(crate) struct CpuContext {
    x19: u64, // 0x00
    x20: u64, // 0x08
    x21: u64, // 0x10
    x22: u64, // 0x18
    x23: u64, // 0x20
    x24: u64, // 0x28
    x25: u64, // 0x30
    x26: u64, // 0x38
    x27: u64, // 0x40
    x28: u64, // 0x48
    fp: u64,  // 0x50
    lr: u64,  // 0x58
    sp: u64,  // 0x60
    d8: u64,  // 0x68
    d9: u64,  // 0x70
    d10: u64, // 0x78
    d11: u64, // 0x80
    d12: u64, // 0x88
    d13: u64, // 0x90
    d14: u64, // 0x98
    d15: u64, // 0xA0
    fpcr: u64, // 0xA8
}

impl CpuContext {
    pub(crate) const fn zeroed() -> Self {
        // Safety: all-zero is a valid register file.
        unsafe { core::mem::zeroed() }
    }

    /// Fabricate a context that, on its first switch, enters `entry(arg)` on
    /// a fresh stack. `x19` carries the argument and `x20` the entry address;
    /// [`start_shim`] moves them into place.
    pub(crate) fn prepare(&mut self, entry: usize, arg: usize, stack_top: usize) {
        *self = Self::zeroed();
        self.x19 = arg as u64;
        self.x20 = entry as u64;
        self.lr = start_shim as usize as u64;
        self.sp = (stack_top & !15) as u64;
    }

    pub(crate) fn stack_pointer(&self) -> usize {
        self.sp as usize
    }
}

/// Save the current execution state into `*old` and resume `*new`.
///
/// # Safety
/// As the x86-64 variant: both pointers must reference valid context storage
/// and the target stack must be live.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch(old: *mut CpuContext, new: *const CpuContext) {
    core::arch::naked_asm!(
        "stp x19, x20, [x0, #0x00]",
        "stp x21, x22, [x0, #0x10]",
        "stp x23, x24, [x0, #0x20]",
        "stp x25, x26, [x0, #0x30]",
        "stp x27, x28, [x0, #0x40]",
        "stp x29, x30, [x0, #0x50]",
        "mov x2, sp",
        "str x2, [x0, #0x60]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        "mrs x3, fpcr",
        "str x3, [x0, #0xA8]",
        "ldr x3, [x1, #0xA8]",
        "msr fpcr, x3",
        "ldp d14, d15, [x1, #0x98]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d8, d9, [x1, #0x68]",
        "ldr x2, [x1, #0x60]",
        "mov sp, x2",
        "ldp x29, x30, [x1, #0x50]",
        "ldp x27, x28, [x1, #0x40]",
        "ldp x25, x26, [x1, #0x30]",
        "ldp x23, x24, [x1, #0x20]",
        "ldp x21, x22, [x1, #0x10]",
        "ldp x19, x20, [x1, #0x00]",
        "ret",
    );
}

/// First-switch target of a fresh context.
#[unsafe(naked)]
unsafe extern "C" fn start_shim() -> ! {
    core::arch::naked_asm!("mov x0, x19", "blr x20", "brk #0x1");
}

pub(crate) fn current_stack_pointer() -> usize {
    let sp: usize;
    unsafe { core::arch::asm!("mov {}, sp", out(reg) sp, options(nomem, nostack)) };
    sp
}

    } else {
        compile_error!("no context-switch port for this architecture");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static PHASE: AtomicUsize = AtomicUsize::new(0);
    static mut HOST: CpuContext = CpuContext::zeroed();
    static mut GUEST: CpuContext = CpuContext::zeroed();

    extern "C" fn guest_main(arg: usize) -> ! {
        PHASE.store(arg, Ordering::SeqCst);
        unsafe { switch(&raw mut GUEST, &raw const HOST) };
        unreachable!("terminated context resumed");
    }

    #[test]
    fn switch_round_trip() {
        let stack = vec![0u8; 64 * 1024];
        let top = stack.as_ptr() as usize + stack.len();
        unsafe {
            (*(&raw mut GUEST)).prepare(guest_main as usize, 7, top);
            switch(&raw mut HOST, &raw const GUEST);
        }
        assert_eq!(PHASE.load(Ordering::SeqCst), 7);
    }
}
