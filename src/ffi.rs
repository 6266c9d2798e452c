//! C entry points of the preloaded agent.
//!
//! Besides the `nyx_*` API for harnesses, this module shadows the libc symbols that
//! would otherwise let a crash escape the host: the abort family, the assertion
//! failure hooks and `sigaction`.

use crate::{
    agent::Agent,
    crash::{CrashInterceptor, CRASH_REASON_SIZE},
    host_log::HostLogger,
    hypercall::{Hypercall, Vmcall},
    options::AgentOptions,
    platform::Libc,
    signals::SignalGuard,
    utils::BoundedBuf,
};
use lazy_static::lazy_static;
use std::{
    ffi::CStr,
    fmt::Write,
    os::raw::{c_char, c_int, c_uint, c_void},
    panic, slice,
    sync::Once,
};

lazy_static! {
    static ref AGENT: Agent<Vmcall, Libc> = {
        let options = AgentOptions::from_env()
            .unwrap_or_else(|e| Vmcall.habort(&format!("Error: {}", e)));
        Agent::new(Vmcall, Libc, options, fault_handler)
    };
}

static CRASH: CrashInterceptor = CrashInterceptor::new();
static GUARD: SignalGuard<Libc, Vmcall> = SignalGuard::new(Libc, Vmcall);
static LOGGER: HostLogger<Vmcall> = HostLogger::new(Vmcall);
static SETUP: Once = Once::new();

fn setup() {
    SETUP.call_once(|| {
        let _ = LOGGER.init(AGENT.options().log_level);
        panic::set_hook(Box::new(|info| {
            let mut reason = BoundedBuf::<CRASH_REASON_SIZE>::new();
            let _ = write!(reason, "{}", info);
            CRASH.report(&Vmcall, Some(reason.as_str()))
        }));
    });
}

extern "C" fn fault_handler(signo: c_int, _: *mut libc::siginfo_t, _: *mut c_void) {
    CRASH.report_signal(&Vmcall, signo)
}

/// Handshake with the host, returns the max input size.
#[no_mangle]
pub extern "C" fn nyx_init() -> usize {
    setup();
    AGENT.initialize()
}

/// Waits for the next input and copies at most `max_size` bytes of it to `data`.
///
/// # Safety
///
/// `data` must be valid for `max_size` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn nyx_get_fuzz_data(data: *mut u8, max_size: usize) -> usize {
    setup();
    if data.is_null() {
        AGENT.hprintf("[error] nyx_get_fuzz_data: null buffer\n");
        return 0;
    }
    AGENT.next_input(slice::from_raw_parts_mut(data, max_size))
}

#[no_mangle]
pub extern "C" fn nyx_release() {
    setup();
    AGENT.release()
}

/// Prints `msg` on the host, as is.
///
/// # Safety
///
/// `msg` is null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn nyx_printf(msg: *const c_char) {
    if msg.is_null() {
        return;
    }
    let msg = CStr::from_ptr(msg).to_string_lossy();
    Vmcall.hprintf(&msg);
}

#[no_mangle]
pub extern "C" fn abort() -> ! {
    CRASH.report_abort(&Vmcall)
}

#[no_mangle]
pub extern "C" fn _abort() -> ! {
    CRASH.report_abort(&Vmcall)
}

#[no_mangle]
pub extern "C" fn __abort() -> ! {
    CRASH.report_abort(&Vmcall)
}

/// # Safety
///
/// String arguments are null or NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn __assert(
    func: *const c_char,
    file: *const c_char,
    line: c_int,
    failed_expr: *const c_char,
) -> ! {
    CRASH.report_assert(&Vmcall, func, file, line, failed_expr)
}

/// # Safety
///
/// String arguments are null or NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn __assert_fail(
    assertion: *const c_char,
    file: *const c_char,
    line: c_uint,
    function: *const c_char,
) -> ! {
    CRASH.report_assert_fail(&Vmcall, assertion, file, line, function)
}

/// # Safety
///
/// String arguments are null or NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn __assert_perror_fail(
    errnum: c_int,
    file: *const c_char,
    line: c_uint,
    function: *const c_char,
) -> ! {
    CRASH.report_assert_perror_fail(&Vmcall, errnum, file, line, function)
}

/// `sigaction(2)` for the target, fatal signals stay with the agent.
///
/// # Safety
///
/// Same contract as `sigaction(2)`.
#[no_mangle]
pub unsafe extern "C" fn sigaction(
    signum: c_int,
    act: *const libc::sigaction,
    oldact: *mut libc::sigaction,
) -> c_int {
    GUARD.intercept(signum, act, oldact)
}
