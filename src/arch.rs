//! Per-CPU constants and primitives for in-place code patching.
//!
//! `Instruction` is the unit of patching: x86 breakpoints are a single
//! byte, the RISC targets overwrite one fixed-width instruction word.
//! `flush_cache` must make a rewritten slot visible to instruction fetch
//! on every core before the patched address can be executed.

#[cfg(target_arch = "x86_64")]
mod imp {
    pub type Instruction = u8;
    pub type AtomicInstruction = core::sync::atomic::AtomicU8;

    /// `int3`
    pub const BREAKPOINT: Instruction = 0xcc;
    pub const BREAKPOINT_OFFSET: usize = 0;
    pub const CAN_MOVE_SP: bool = true;

    pub fn rmb() {
        unsafe {
            core::arch::asm!("lfence", options(nostack, preserves_flags));
        }
    }

    /// # Safety
    /// `addr` must point into mapped memory.
    pub unsafe fn flush_cache(addr: *const Instruction) {
        core::arch::asm!(
            "mfence",
            "clflush [{addr}]",
            "mfence",
            addr = in(reg) addr,
            options(nostack, preserves_flags)
        );
    }
}

#[cfg(target_arch = "aarch64")]
mod imp {
    pub type Instruction = u32;
    pub type AtomicInstruction = core::sync::atomic::AtomicU32;

    /// `brk #0`
    pub const BREAKPOINT: Instruction = 0xd4200000;
    pub const BREAKPOINT_OFFSET: usize = 0;
    pub const CAN_MOVE_SP: bool = true;

    pub fn rmb() {
        unsafe {
            core::arch::asm!("dmb ish", options(nostack, preserves_flags));
        }
    }

    /// # Safety
    /// `addr` must point into mapped memory.
    pub unsafe fn flush_cache(addr: *const Instruction) {
        super::clear_cache(addr);
    }
}

#[cfg(target_arch = "arm")]
mod imp {
    pub type Instruction = u32;
    pub type AtomicInstruction = core::sync::atomic::AtomicU32;

    /// `udf` in the canonical permanently-undefined encoding.
    pub const BREAKPOINT: Instruction = 0xe7f001f0;
    pub const BREAKPOINT_OFFSET: usize = 0;
    pub const CAN_MOVE_SP: bool = true;

    pub fn rmb() {
        unsafe {
            core::arch::asm!("dmb ish", options(nostack, preserves_flags));
        }
    }

    /// # Safety
    /// `addr` must point into mapped memory.
    pub unsafe fn flush_cache(addr: *const Instruction) {
        super::clear_cache(addr);
    }
}

#[cfg(all(target_arch = "powerpc64", target_endian = "little"))]
mod imp {
    pub type Instruction = u32;
    pub type AtomicInstruction = core::sync::atomic::AtomicU32;

    /// `trap`
    pub const BREAKPOINT: Instruction = 0x7fe00008;
    // The first two instruction slots are the local-entry trampoline,
    // skipped when the call comes from within the same compilation unit.
    pub const BREAKPOINT_OFFSET: usize = 2;
    // There is a valid back link to the previous frame at all times; the
    // callee stores the return address in the caller's frame before it
    // constructs its own with one atomic operation.
    pub const CAN_MOVE_SP: bool = false;

    pub fn rmb() {
        // Inline assembly is not stable for this target; a full fence
        // subsumes the `sync` the hand-written version would issue.
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }

    /// # Safety
    /// `addr` must point into mapped memory.
    pub unsafe fn flush_cache(addr: *const Instruction) {
        super::clear_cache(addr);
    }
}

pub use imp::*;

pub fn spin_pause() {
    core::hint::spin_loop();
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn clear_cache(addr: *const Instruction) {
    extern "C" {
        // Provided by the compiler runtime; what the C builtin lowers to.
        fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
    }
    __clear_cache(
        addr as *mut libc::c_char,
        addr.add(1) as *mut libc::c_char,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breakpoint_fits_one_patch_unit() {
        // The install path relies on a single aligned store being atomic
        // at instruction-fetch granularity.
        assert_eq!(
            std::mem::size_of_val(&BREAKPOINT),
            std::mem::size_of::<Instruction>()
        );
    }

    #[test]
    fn flush_cache_accepts_any_mapped_address() {
        let slot: Instruction = BREAKPOINT;
        unsafe { flush_cache(&slot) };
        rmb();
        spin_pause();
    }
}
