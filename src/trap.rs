//! A single interception target inside the JVM's native library.
//!
//! Installing a trap rewrites one instruction slot of the target's
//! prologue to the CPU's breakpoint encoding; uninstalling puts the
//! saved slot back. The write is a single aligned store of one patch
//! unit, which every supported CPU observes atomically at fetch
//! granularity, so concurrent execution of the target needs no further
//! synchronization beyond the cache flush.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use nix::sys::mman::{mprotect, ProtFlags};
use tracing::debug;

use crate::arch::{self, AtomicInstruction, Instruction, BREAKPOINT, BREAKPOINT_OFFSET};
use crate::code_cache::NativeCodeCache;
use crate::util::{page_start, roundup_page};

pub struct Trap {
    symbol_prefix: &'static str,
    entry: AtomicUsize,
    saved_insn: AtomicInstruction,
    installed: AtomicBool,
}

impl Trap {
    pub const fn new(symbol_prefix: &'static str) -> Self {
        Trap {
            symbol_prefix,
            entry: AtomicUsize::new(0),
            saved_insn: AtomicInstruction::new(0),
            installed: AtomicBool::new(false),
        }
    }

    pub fn symbol_prefix(&self) -> &'static str {
        self.symbol_prefix
    }

    /// Entry address of the target function, or 0 while unresolved.
    pub fn entry(&self) -> usize {
        self.entry.load(Ordering::Acquire)
    }

    /// Address of the instruction slot that gets patched.
    pub fn breakpoint_address(&self) -> usize {
        breakpoint_address(self.entry())
    }

    /// Looks the target up by mangled-name prefix and makes its code
    /// page writable. Returns whether the trap is resolved; a missing
    /// symbol is not an error, a failed protection change is.
    pub fn resolve(&self, library: &NativeCodeCache) -> nix::Result<bool> {
        if self.entry() != 0 {
            return Ok(true);
        }
        let Some(address) = library.find_symbol_by_prefix(self.symbol_prefix) else {
            return Ok(false);
        };

        unlock_code_page(breakpoint_address(address))?;
        self.entry.store(address, Ordering::Release);
        debug!("resolved {} at 0x{:x}", self.symbol_prefix, address);
        Ok(true)
    }

    #[cfg(test)]
    pub(crate) fn resolve_at(&self, address: usize) {
        self.entry.store(address, Ordering::Release);
    }

    pub fn install(&self) {
        let entry = self.entry();
        if entry == 0 || self.installed.swap(true, Ordering::AcqRel) {
            return;
        }

        let slot = breakpoint_address(entry) as *mut Instruction;
        unsafe {
            self.saved_insn
                .store(ptr::read_volatile(slot), Ordering::Release);
            ptr::write_volatile(slot, BREAKPOINT);
            arch::flush_cache(slot);
        }
    }

    pub fn uninstall(&self) {
        let entry = self.entry();
        if entry == 0 || !self.installed.swap(false, Ordering::AcqRel) {
            return;
        }

        let slot = breakpoint_address(entry) as *mut Instruction;
        unsafe {
            ptr::write_volatile(slot, self.saved_insn.load(Ordering::Acquire));
            arch::flush_cache(slot);
        }
    }
}

fn breakpoint_address(entry: usize) -> usize {
    entry + BREAKPOINT_OFFSET * std::mem::size_of::<Instruction>()
}

/// Elevates the page(s) holding the patch slot to read/write/execute.
/// The elevation is kept for the lifetime of the process.
fn unlock_code_page(slot: usize) -> nix::Result<()> {
    let start = page_start(slot);
    let length = roundup_page(slot + std::mem::size_of::<Instruction>() - start);
    let start = ptr::NonNull::new(start as *mut libc::c_void).expect("patch slot on the null page");
    unsafe {
        mprotect(
            start,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
        )
    }
}
