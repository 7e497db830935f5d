//! Heap-allocation interception.
//!
//! HotSpot calls a small family of notification functions every time a
//! thread retires a TLAB or allocates outside one. This module plants
//! breakpoints on those functions, catches the resulting SIGTRAPs,
//! reads the allocated class and size out of the trapped register file,
//! throttles by sampled-byte interval, hands the sample to the
//! registered sink, and resumes the thread as if the notification had
//! returned. The notification bodies never run; their only side effect
//! is emitting JFR events, which the tracer deliberately suppresses.
//!
//! Two generations of symbols exist: the `_event` pair up to JDK 9 and
//! the plain pair from JDK 10 on. Whichever resolves gets trapped.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use thiserror::Error;
use tracing::info;

use crate::arch::{self, Instruction};
use crate::code_cache::NativeCodeCache;
use crate::signals;
use crate::stack_frame::StackFrame;
use crate::trap::Trap;
use crate::vm_structs;

/// The debug-trap signal the planted breakpoints raise.
pub const TRAP_SIGNAL: libc::c_int = libc::SIGTRAP;

/// Pseudo bytecode indices that let the sink tell allocation samples
/// apart from ordinary stack samples.
pub const BCI_SYMBOL: i32 = -11;
pub const BCI_SYMBOL_OUTSIDE_TLAB: i32 = -12;

/// Anything above this is treated as an argument mis-decode rather than
/// a real allocation, and skipped.
const MAX_PLAUSIBLE_ALLOCATION: u64 = 1 << 40;

/// Sample consumer, registered at [`start`]. Called from the signal
/// handler, so it must be async-signal-safe: no allocation, no locks,
/// no library calls that may take locks.
pub type SampleSink = fn(ucontext: *mut libc::c_void, size: u64, bci_tag: i32, method_id: u64);

#[derive(Debug, Error)]
pub enum TracerError {
    #[error("VMStructs unavailable. Unsupported JVM?")]
    RuntimeUnsupported,
    #[error("No AllocTracer symbols found. Are JDK debug symbols installed?")]
    SymbolsMissing,
    #[error("changing code page protection failed: {0}")]
    Protection(#[from] nix::errno::Errno),
    #[error("installing the trap signal handler failed: {0}")]
    SignalHandler(#[from] std::io::Error),
}

#[derive(Debug, Default, Clone)]
pub struct TracerArgs {
    /// Allocated bytes between recorded samples; 0 records everything.
    pub interval: u64,
}

/// Which intercepted function a trap matched, selecting the calling
/// convention for argument recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrapKind {
    InNewTlab,
    OutsideTlab,
    InNewTlabV2,
    OutsideTlabV2,
}

impl TrapKind {
    fn outside_tlab(self) -> bool {
        matches!(self, TrapKind::OutsideTlab | TrapKind::OutsideTlabV2)
    }

    /// Recovers `(class handle, size)` from the trapped frame.
    ///
    /// Target signatures:
    ///   legacy: in_new_tlab(class, tlab_size, alloc_size)
    ///           outside_tlab(class, alloc_size)
    ///   v2:     in_new_tlab(class, obj, tlab_size, alloc_size, thread)
    ///           outside_tlab(class, obj, alloc_size, thread)
    fn extract(self, frame: &StackFrame) -> (usize, u64) {
        match self {
            TrapKind::InNewTlab | TrapKind::OutsideTlab => (frame.arg0() as usize, frame.arg1()),
            TrapKind::InNewTlabV2 | TrapKind::OutsideTlabV2 => {
                (frame.arg0() as usize, frame.arg2())
            }
        }
    }
}

const TRAP_KINDS: [TrapKind; 4] = [
    TrapKind::InNewTlab,
    TrapKind::OutsideTlab,
    TrapKind::InNewTlabV2,
    TrapKind::OutsideTlabV2,
];

// Mangled-name prefixes; the tails carry type signatures that vary with
// the toolchain, so resolution matches on the prefix only.
static TRAPS: [Trap; 4] = [
    Trap::new("_ZN11AllocTracer33send_allocation_in_new_tlab_event"),
    Trap::new("_ZN11AllocTracer34send_allocation_outside_tlab_event"),
    Trap::new("_ZN11AllocTracer27send_allocation_in_new_tlab"),
    Trap::new("_ZN11AllocTracer28send_allocation_outside_tlab"),
];

static INTERVAL: AtomicU64 = AtomicU64::new(0);
static ALLOCATED_BYTES: AtomicU64 = AtomicU64::new(0);
static SINK: AtomicUsize = AtomicUsize::new(0);
static NEXT_HANDLER: AtomicUsize = AtomicUsize::new(libc::SIG_DFL);
static HANDLER_CHAINED: AtomicBool = AtomicBool::new(false);

/// Resolves the allocation hooks in `libjvm`, arms the traps and starts
/// forwarding samples to `sink`.
pub fn start(
    libjvm: &NativeCodeCache,
    args: &TracerArgs,
    sink: SampleSink,
) -> Result<(), TracerError> {
    if !vm_structs::available() {
        return Err(TracerError::RuntimeUnsupported);
    }

    // Non-short-circuiting on purpose: resolve every variant that is
    // present, old and new generation alike.
    let in_new_tlab = TRAPS[0].resolve(libjvm)? | TRAPS[2].resolve(libjvm)?;
    let outside_tlab = TRAPS[1].resolve(libjvm)? | TRAPS[3].resolve(libjvm)?;
    if !in_new_tlab || !outside_tlab {
        return Err(TracerError::SymbolsMissing);
    }

    INTERVAL.store(args.interval, Ordering::Release);
    ALLOCATED_BYTES.store(0, Ordering::Release);
    SINK.store(sink as usize, Ordering::Release);

    install_trap_handler()?;

    for trap in &TRAPS {
        trap.install();
    }

    info!(
        "allocation tracing started, sampling every {} bytes",
        args.interval
    );
    Ok(())
}

/// Disarms all traps. The signal handler stays in place; traps raised
/// after this point fall through to the chained handler.
pub fn stop() {
    for trap in &TRAPS {
        trap.uninstall();
    }
    ALLOCATED_BYTES.store(0, Ordering::Release);
    info!("allocation tracing stopped");
}

/// Captures the pre-existing SIGTRAP handler (once per process, so a
/// stop/start cycle never chains the tracer to itself) and installs our
/// own.
fn install_trap_handler() -> std::io::Result<()> {
    if !HANDLER_CHAINED.swap(true, Ordering::AcqRel) {
        match signals::get_signal_handler(TRAP_SIGNAL) {
            Ok(previous) => NEXT_HANDLER.store(previous, Ordering::Release),
            Err(e) => {
                HANDLER_CHAINED.store(false, Ordering::Release);
                return Err(e);
            }
        }
    }
    signals::install_signal_handler(TRAP_SIGNAL, trap_handler)
}

/// The SIGTRAP handler. Runs on the allocating thread; everything here
/// is atomics and raw register access.
extern "C" fn trap_handler(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    arch::rmb();

    let mut frame = unsafe { StackFrame::new(ucontext) };
    let pc = frame.pc();

    for (kind, trap) in TRAP_KINDS.iter().zip(&TRAPS) {
        if trap.entry() == 0 {
            continue;
        }
        // The kernel reports the PC either at the trap instruction or
        // just past it, depending on the architecture.
        let delta = pc.wrapping_sub(trap.breakpoint_address());
        if delta > mem::size_of::<Instruction>() {
            continue;
        }

        let (klass, size) = kind.extract(&frame);
        unsafe { record_allocation(ucontext, klass, size, kind.outside_tlab()) };
        frame.ret();
        return;
    }

    // Not one of ours; hand it to whoever had the signal before us.
    unsafe { signals::forward(NEXT_HANDLER.load(Ordering::Acquire), signo, info, ucontext) };
}

/// Accounts an allocation and, when it crosses the sampling interval,
/// resolves the class name symbol and submits a sample. Outside-TLAB
/// samples invert the low bit of the symbol pointer so the sink can
/// recover both the symbol and the TLAB flag from one word.
///
/// # Safety
///
/// `klass` must be a JVM class pointer (or 0) and the VM structure
/// offsets must describe the running JVM.
unsafe fn record_allocation(
    ucontext: *mut libc::c_void,
    klass: usize,
    size: u64,
    outside_tlab: bool,
) {
    if klass == 0 || size == 0 || size > MAX_PLAUSIBLE_ALLOCATION {
        return;
    }

    let interval = INTERVAL.load(Ordering::Acquire);
    if interval > 0 && !crosses_interval(&ALLOCATED_BYTES, interval, size) {
        return;
    }

    let name_offset = vm_structs::klass_name_offset();
    if name_offset < 0 {
        return;
    }
    let name_symbol = *((klass + name_offset as usize) as *const usize) as u64;

    let (bci_tag, method_id) = if outside_tlab {
        (BCI_SYMBOL_OUTSIDE_TLAB, name_symbol ^ 1)
    } else {
        (BCI_SYMBOL, name_symbol)
    };

    let sink = SINK.load(Ordering::Acquire);
    if sink == 0 {
        return;
    }
    let sink: SampleSink = mem::transmute(sink);
    sink(ucontext, size, bci_tag, method_id);
}

/// Adds `size` to the accumulator modulo `interval` and reports whether
/// the interval boundary was reached. Losing CAS racers retry with their
/// size intact, so no bytes are ever dropped from the account.
fn crosses_interval(accumulator: &AtomicU64, interval: u64, size: u64) -> bool {
    let mut previous = accumulator.load(Ordering::Relaxed);
    loop {
        // Saturating, not wrapping: an overflow check panic has no place
        // in a signal handler.
        let total = previous.saturating_add(size);
        let next = if total >= interval {
            total % interval
        } else {
            total
        };
        match accumulator.compare_exchange_weak(previous, next, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return total >= interval,
            Err(observed) => {
                previous = observed;
                arch::spin_pause();
            }
        }
    }
}
