//! Ownership of the fatal signals.
//!
//! Crash interception installs one terminal handler for every fatal signal, and the
//! [`SignalGuard`] keeps the target under test from replacing it afterwards.

use crate::hypercall::Hypercall;
use crate::platform::{FaultHandler, Platform, PlatformError};
use crate::utils::BoundedBuf;
use nix::sys::signal::{
    Signal, SIGABRT, SIGBUS, SIGFPE, SIGILL, SIGIOT, SIGSEGV, SIGSYS, SIGTRAP,
};
use std::{
    fmt::Write,
    os::raw::c_int,
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Signals that end an iteration as a crash. `SIGIOT` is an alias of `SIGABRT`.
pub const FATAL_SIGNALS: [Signal; 8] = [
    SIGSEGV, SIGFPE, SIGBUS, SIGILL, SIGABRT, SIGIOT, SIGTRAP, SIGSYS,
];

const DISCARD_MSG_SIZE: usize = 0x80;

pub fn is_fatal(signum: c_int) -> bool {
    FATAL_SIGNALS.iter().any(|s| *s as c_int == signum)
}

/// Installs `handler` for all [`FATAL_SIGNALS`], stops at the first failure.
pub fn install_crash_handlers<P: Platform>(
    platform: &P,
    handler: FaultHandler,
) -> Result<(), PlatformError> {
    for signal in FATAL_SIGNALS.iter().copied() {
        platform.install_signal_handler(signal, handler)?;
    }
    Ok(())
}

/// Filter in front of the target's `sigaction` calls.
///
/// Discards are reported through the hypercall transport itself, so a target that
/// registers handlers before the agent is initialized is still seen by the host.
pub struct SignalGuard<P, T> {
    platform: P,
    hypercall: T,
    discarded: AtomicUsize,
}

impl<P, T> SignalGuard<P, T> {
    pub const fn new(platform: P, hypercall: T) -> Self {
        Self {
            platform,
            hypercall,
            discarded: AtomicUsize::new(0),
        }
    }

    /// Number of handler installations dropped so far.
    pub fn discarded(&self) -> usize {
        self.discarded.load(Ordering::Relaxed)
    }
}

impl<P: Platform, T: Hypercall> SignalGuard<P, T> {
    /// `sigaction(2)` as seen by the target.
    ///
    /// Installations for a fatal signal report success without touching the
    /// handler; `oldact` still receives the current disposition. Pure queries and
    /// all other signals go to the real implementation unchanged.
    ///
    /// # Safety
    ///
    /// Same contract as `sigaction(2)`.
    pub unsafe fn intercept(
        &self,
        signum: c_int,
        act: *const libc::sigaction,
        oldact: *mut libc::sigaction,
    ) -> c_int {
        if act.is_null() || !is_fatal(signum) {
            return self.platform.forward_sigaction(signum, act, oldact);
        }

        self.discarded.fetch_add(1, Ordering::Relaxed);
        let mut msg = BoundedBuf::<DISCARD_MSG_SIZE>::new();
        let _ = writeln!(
            msg,
            "[warning] Target attempts to install own SIG: {} handler (ignoring)",
            signum
        );
        self.hypercall.hprintf(msg.as_str());
        if !oldact.is_null() {
            self.platform.forward_sigaction(signum, ptr::null(), oldact);
        }
        0
    }
}
