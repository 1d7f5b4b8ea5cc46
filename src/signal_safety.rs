//! Process-wide SIGBUS interception for the `safe_*` family of TLB window
//! accessors (spec §4.C "Signal-safe (`safe_*`) variant", §5 "Signal
//! safety").
//!
//! A device that hangs or has been reset delivers SIGBUS on the next MMIO
//! access to its BAR. Outside a guarded call this is fatal by design (spec
//! §7: "elsewhere it terminates the process"); inside one, the handler
//! longjmps back to the call site and [`execute_safe`] turns that into a
//! [`DriverError::BusError`].
//!
//! Grounded in `silicon_tlb_window.cpp`'s `sigbus_handler` /
//! `ScopedJumpGuard` / `execute_safe`, translated from C++'s
//! `sigsetjmp`/`siglongjmp` pair to the same two libc entry points called
//! directly, since the `libc` crate (already a dependency) does not wrap
//! them.

use std::cell::Cell;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

use crate::error::{DriverError, Result};

#[repr(C, align(16))]
struct SigJmpBuf([u8; 256]);

impl SigJmpBuf {
    const fn zeroed() -> Self {
        SigJmpBuf([0u8; 256])
    }
}

extern "C" {
    #[link_name = "__sigsetjmp"]
    fn sigsetjmp_raw(env: *mut SigJmpBuf, savesigs: c_int) -> c_int;
    fn siglongjmp(env: *mut SigJmpBuf, val: c_int) -> !;
}

thread_local! {
    static JUMP_BUF: Cell<*mut SigJmpBuf> = Cell::new(std::ptr::null_mut());
    static JUMP_ARMED: Cell<bool> = const { Cell::new(false) };
}

static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);
static INSTALL_ONCE: Once = Once::new();

extern "C" fn sigbus_handler(sig: c_int) {
    let armed = JUMP_ARMED.with(Cell::get);
    if armed {
        let buf = JUMP_BUF.with(Cell::get);
        // Safety: `buf` points at the `SigJmpBuf` a prior `sigsetjmp_raw`
        // call populated on this same thread's still-live stack frame while
        // `JUMP_ARMED` was true; jumping back into it is exactly what
        // `execute_safe` is waiting for.
        unsafe { siglongjmp(buf, 1) }
    } else {
        // Spec §5: "outside safe_* scopes the handler performs _exit(SIGBUS)
        // — no silent corruption."
        unsafe { libc::_exit(sig) };
    }
}

/// Installs the process-wide SIGBUS handler. Idempotent; safe to call from
/// multiple threads or multiple times.
pub fn init() {
    INSTALL_ONCE.call_once(|| {
        // Safety: constructing a valid `sigaction` and registering it is the
        // documented way to intercept SIGBUS; `sa_sigaction`/`sa_mask` are
        // zero-initialized before being filled in.
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = sigbus_handler as usize;
            libc::sigemptyset(&mut sa.sa_mask);
            // SA_NODEFER: a SIGBUS that re-enters after the longjmp must
            // still be catchable (spec §5).
            sa.sa_flags = libc::SA_NODEFER;
            if libc::sigaction(libc::SIGBUS, &sa, std::ptr::null_mut()) != 0 {
                panic!("sigaction(SIGBUS) failed: {}", std::io::Error::last_os_error());
            }
        }
        HANDLER_INSTALLED.store(true, Ordering::SeqCst);
    });
}

/// Restores the default SIGBUS disposition. Only meaningful for tests; a
/// long-lived driver process installs once and keeps the handler for its
/// whole lifetime.
pub fn shutdown() {
    if HANDLER_INSTALLED.swap(false, Ordering::SeqCst) {
        unsafe {
            libc::signal(libc::SIGBUS, libc::SIG_DFL);
        }
    }
}

/// Arms the thread-local jump target for the duration of the guard's scope.
/// Re-arming is idempotent: nested guards on one thread just extend the
/// innermost scope's disarm point, which is always the right behavior since
/// `execute_safe` never calls itself reentrantly.
struct ScopedJumpGuard;

impl ScopedJumpGuard {
    fn new() -> Self {
        JUMP_ARMED.with(|armed| armed.set(true));
        ScopedJumpGuard
    }
}

impl Drop for ScopedJumpGuard {
    fn drop(&mut self) {
        JUMP_ARMED.with(|armed| armed.set(false));
    }
}

/// Runs `f`, catching a SIGBUS that fires during its execution and turning it
/// into [`DriverError::BusError`] instead of terminating the process.
///
/// `f` must not unwind (no panics) and should touch only POD state: a
/// longjmp out of `f` skips any destructors that would otherwise run inside
/// it, exactly as in the reference implementation's `execute_safe`.
#[inline(never)]
pub fn execute_safe<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    if !HANDLER_INSTALLED.load(Ordering::SeqCst) {
        init();
    }
    let mut buf = SigJmpBuf::zeroed();
    // Safety: `buf` is a valid, writable `SigJmpBuf` on this thread's stack.
    let rc = unsafe { sigsetjmp_raw(&mut buf, 1) };
    if rc == 0 {
        JUMP_BUF.with(|cell| cell.set(&mut buf));
        let _guard = ScopedJumpGuard::new();
        f()
    } else {
        JUMP_ARMED.with(|armed| armed.set(false));
        Err(DriverError::BusError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unarmed_call_succeeds_without_touching_the_handler() {
        let result = execute_safe(|| Ok(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn init_is_idempotent() {
        init();
        init();
        assert!(HANDLER_INSTALLED.load(Ordering::SeqCst));
    }
}
