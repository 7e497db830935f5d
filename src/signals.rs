//! Thin sigaction wrappers for the debug-trap signal.
//!
//! The trap signal is shared with whatever the JVM installed before us
//! (safepoint polling uses it on some CPUs), so the previous handler is
//! read out first and kept for chaining.

use std::io;
use std::mem;
use std::ptr;

pub type SignalHandlerFn = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// The currently-registered `sa_sigaction` value for `signo`.
pub fn get_signal_handler(signo: libc::c_int) -> io::Result<usize> {
    let mut oact: libc::sigaction = unsafe { mem::zeroed() };
    if unsafe { libc::sigaction(signo, ptr::null(), &mut oact) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(oact.sa_sigaction)
}

pub fn install_signal_handler(signo: libc::c_int, handler: SignalHandlerFn) -> io::Result<()> {
    let mut act: libc::sigaction = unsafe { mem::zeroed() };
    unsafe { libc::sigemptyset(&mut act.sa_mask) };
    act.sa_sigaction = handler as usize;
    act.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;

    if unsafe { libc::sigaction(signo, &act, ptr::null_mut()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Whether a stored handler value is an actual function that can be
/// chained to. `SIG_DFL` doubles as the null value.
pub fn chainable(handler: usize) -> bool {
    handler != libc::SIG_DFL && handler != libc::SIG_IGN && handler != libc::SIG_ERR
}

/// Invokes a stored prior handler with the original signal context.
///
/// # Safety
///
/// `handler` must be a value previously read out of `sa_sigaction`, and
/// the remaining arguments must be the ones our own handler received.
pub unsafe fn forward(
    handler: usize,
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    if !chainable(handler) {
        return;
    }
    let handler: SignalHandlerFn = mem::transmute(handler);
    handler(signo, info, ucontext);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudo_handlers_are_not_chainable() {
        assert!(!chainable(libc::SIG_DFL));
        assert!(!chainable(libc::SIG_IGN));
        assert!(!chainable(libc::SIG_ERR));
        assert!(chainable(0x7f00_0000_1000));
    }

    extern "C" fn noop_handler(
        _signo: libc::c_int,
        _info: *mut libc::siginfo_t,
        _ucontext: *mut libc::c_void,
    ) {
    }

    #[test]
    fn installed_handler_can_be_read_back() {
        // SIGUSR2 is otherwise unused by the test harness.
        install_signal_handler(libc::SIGUSR2, noop_handler).unwrap();
        assert_eq!(
            get_signal_handler(libc::SIGUSR2).unwrap(),
            noop_handler as usize
        );
    }
}
