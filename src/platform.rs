//! Binding to the process primitives the agent shadows.
//!
//! The agent itself overrides `sigaction`, so handler installation has to reach the
//! real libc entry point. [`Libc`] resolves it once through the dynamic linker; the
//! rest of the crate only sees the [`Platform`] trait.

use nix::{errno::Errno, sys::signal::SigSet, sys::signal::Signal};
use std::{
    ffi::CStr,
    mem,
    os::raw::{c_int, c_void},
    ptr, slice,
    sync::atomic::{AtomicUsize, Ordering},
};
use thiserror::Error;

/// `SA_SIGINFO` style fault handler.
pub type FaultHandler = extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void);

type SigactionFn =
    unsafe extern "C" fn(c_int, *const libc::sigaction, *mut libc::sigaction) -> c_int;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("failed to resolve '{0}'")]
    Unresolved(&'static str),
    #[error("{signal}: sigaction: {source}")]
    Sigaction { signal: Signal, source: Errno },
}

/// Process-level primitives used by the agent.
pub trait Platform {
    /// Installs `handler` for `signal`, bypassing any interposed `sigaction`.
    fn install_signal_handler(
        &self,
        signal: Signal,
        handler: FaultHandler,
    ) -> Result<(), PlatformError>;

    /// Hands a `sigaction` request to the real implementation.
    ///
    /// # Safety
    ///
    /// Same contract as `sigaction(2)`: `act` and `oldact` are null or valid.
    unsafe fn forward_sigaction(
        &self,
        signum: c_int,
        act: *const libc::sigaction,
        oldact: *mut libc::sigaction,
    ) -> c_int;

    /// Externally populated coverage bitmap, if the target carries one.
    /// `default_len` is used when the bitmap does not export its size.
    fn coverage_bitmap(&self, default_len: usize) -> Option<&[u8]>;

    /// Terminates the process at once, no handlers, no atexit.
    fn exit(&self, code: i32) -> !;
}

impl<P: Platform + ?Sized> Platform for &P {
    fn install_signal_handler(
        &self,
        signal: Signal,
        handler: FaultHandler,
    ) -> Result<(), PlatformError> {
        (**self).install_signal_handler(signal, handler)
    }

    unsafe fn forward_sigaction(
        &self,
        signum: c_int,
        act: *const libc::sigaction,
        oldact: *mut libc::sigaction,
    ) -> c_int {
        (**self).forward_sigaction(signum, act, oldact)
    }

    fn coverage_bitmap(&self, default_len: usize) -> Option<&[u8]> {
        (**self).coverage_bitmap(default_len)
    }

    fn exit(&self, code: i32) -> ! {
        (**self).exit(code)
    }
}

/// The libc of the running process.
#[derive(Debug, Default, Clone, Copy)]
pub struct Libc;

static REAL_SIGACTION: AtomicUsize = AtomicUsize::new(0);

fn real_sigaction() -> Option<SigactionFn> {
    let mut addr = REAL_SIGACTION.load(Ordering::Acquire);
    if addr == 0 {
        addr = dlsym(libc::RTLD_NEXT, b"sigaction\0") as usize;
        if addr == 0 {
            return None;
        }
        REAL_SIGACTION.store(addr, Ordering::Release);
    }
    Some(unsafe { mem::transmute::<usize, SigactionFn>(addr) })
}

fn dlsym(handle: *mut c_void, name: &'static [u8]) -> *mut c_void {
    let name = CStr::from_bytes_with_nul(name).unwrap_or_default();
    unsafe { libc::dlsym(handle, name.as_ptr()) }
}

impl Platform for Libc {
    fn install_signal_handler(
        &self,
        signal: Signal,
        handler: FaultHandler,
    ) -> Result<(), PlatformError> {
        let real = real_sigaction().ok_or(PlatformError::Unresolved("sigaction"))?;
        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_SIGINFO;
        action.sa_mask = *SigSet::empty().as_ref();
        if unsafe { real(signal as c_int, &action, ptr::null_mut()) } == -1 {
            return Err(PlatformError::Sigaction {
                signal,
                source: Errno::last(),
            });
        }
        Ok(())
    }

    unsafe fn forward_sigaction(
        &self,
        signum: c_int,
        act: *const libc::sigaction,
        oldact: *mut libc::sigaction,
    ) -> c_int {
        match real_sigaction() {
            Some(real) => real(signum, act, oldact),
            None => {
                *libc::__errno_location() = libc::ENOSYS;
                -1
            }
        }
    }

    fn coverage_bitmap(&self, default_len: usize) -> Option<&[u8]> {
        // afl++ exports `uint8_t *__afl_area_ptr` and `uint32_t __afl_map_size`.
        let area = dlsym(libc::RTLD_DEFAULT, b"__afl_area_ptr\0") as *const *mut u8;
        if area.is_null() {
            return None;
        }
        let map = unsafe { *area };
        if map.is_null() {
            return None;
        }
        let size = dlsym(libc::RTLD_DEFAULT, b"__afl_map_size\0") as *const u32;
        let len = if size.is_null() {
            default_len
        } else {
            unsafe { *size as usize }
        };
        Some(unsafe { slice::from_raw_parts(map, len) })
    }

    fn exit(&self, code: i32) -> ! {
        unsafe { libc::_exit(code) }
    }
}
