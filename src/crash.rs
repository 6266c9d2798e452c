//! Crash interception: turns every fatal event into a report to the host.
//!
//! The interceptor starts ARMED. A fatal signal, an `abort` or a failed assertion
//! moves it to REPORTING, which is terminal: a backtrace is captured, formatted into
//! a bounded [`CrashReport`], sent with `PANIC_EXTENDED`, and the vCPU is parked.

use crate::hypercall::{halt, Hypercall};
use crate::utils::BoundedBuf;
use nix::sys::signal::Signal;
use std::{
    convert::TryFrom,
    ffi::CStr,
    fmt::{self, Write},
    os::raw::{c_char, c_int, c_uint, c_void},
    sync::atomic::{AtomicBool, Ordering},
};

/// Max number of captured stack frames.
pub const MAX_BACKTRACE_SIZE: usize = 50;
/// Max size of a crash report, including the terminator.
pub const CRASH_REPORT_SIZE: usize = 0x1000;
/// Max size of a crash reason.
pub const CRASH_REASON_SIZE: usize = 0x400;

const REPORT_HEADER: &str = "====== BACKTRACE ======";
const TRUNCATED_NOTICE: &str = "(backtrace may be truncated)";

/// Return addresses of the interrupted call stack, innermost first.
pub struct Backtrace {
    ips: [usize; MAX_BACKTRACE_SIZE],
    len: usize,
}

impl Backtrace {
    /// Walks the current stack, stopping at [`MAX_BACKTRACE_SIZE`] frames.
    pub fn capture() -> Self {
        let mut bt = Self {
            ips: [0; MAX_BACKTRACE_SIZE],
            len: 0,
        };
        // The process is single threaded and about to be reset, no lock needed.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                bt.ips[bt.len] = frame.ip() as usize;
                bt.len += 1;
                bt.len < MAX_BACKTRACE_SIZE
            })
        };
        bt
    }

    /// Backtrace from known addresses, anything past the cap is dropped.
    pub fn from_ips(ips: &[usize]) -> Self {
        let mut bt = Self {
            ips: [0; MAX_BACKTRACE_SIZE],
            len: ips.len().min(MAX_BACKTRACE_SIZE),
        };
        bt.ips[..bt.len].copy_from_slice(&ips[..bt.len]);
        bt
    }

    pub fn frames(&self) -> &[usize] {
        &self.ips[..self.len]
    }

    /// The walk hit the frame cap, outer frames may be missing.
    pub fn is_truncated(&self) -> bool {
        self.len == MAX_BACKTRACE_SIZE
    }
}

/// Max length of one frame line, longer symbols are cut.
const FRAME_LINE_SIZE: usize = 0x200;

/// One symbolized frame, without the line break: `#idx ip symbol+off (file:line)`.
fn write_frame(out: &mut impl Write, idx: usize, ip: usize) -> fmt::Result {
    write!(out, "#{:<2} {:#018x}", idx, ip)?;
    let mut resolved = false;
    unsafe {
        backtrace::resolve_unsynchronized(ip as *mut c_void, |sym| {
            if resolved {
                return;
            }
            resolved = true;
            match sym.name() {
                Some(name) => {
                    let _ = write!(out, " {}", name);
                }
                None => {
                    let _ = out.write_str(" <unknown>");
                }
            }
            if let Some(addr) = sym.addr() {
                let _ = write!(out, "+{:#x}", ip.wrapping_sub(addr as usize));
            }
            if let (Some(file), Some(line)) = (sym.filename(), sym.lineno()) {
                let _ = write!(out, " ({}:{})", file.display(), line);
            }
        })
    };
    if !resolved {
        out.write_str(" <unknown>")?;
    }
    Ok(())
}

/// Bounded crash report text sent with `PANIC_EXTENDED`.
pub struct CrashReport {
    text: BoundedBuf<CRASH_REPORT_SIZE>,
}

impl CrashReport {
    /// Header, truncation notice, reason, then frames for as long as they fit.
    pub fn assemble(reason: Option<&str>, bt: &Backtrace) -> Self {
        let mut text = BoundedBuf::new();
        let _ = writeln!(text, "{}", REPORT_HEADER);
        if bt.is_truncated() {
            let _ = writeln!(text, "{}", TRUNCATED_NOTICE);
        }
        if let Some(reason) = reason {
            let _ = writeln!(text, "Reason: {}", reason);
        }
        let mut line = BoundedBuf::<FRAME_LINE_SIZE>::new();
        for (idx, ip) in bt.frames().iter().enumerate() {
            line.clear();
            let _ = write_frame(&mut line, idx, *ip);
            // drop whole frames instead of emitting a partial last line
            if text.len() + line.len() + 1 > text.capacity() {
                break;
            }
            text.push_str(line.as_str());
            text.push_str("\n");
        }
        Self { text }
    }

    pub fn as_str(&self) -> &str {
        self.text.as_str()
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn as_cstr(&self) -> &CStr {
        // the buffer always carries a terminator after the text
        unsafe { CStr::from_ptr(self.text.as_ptr().cast()) }
    }
}

/// Observable states of the interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashState {
    Armed,
    Reporting,
}

/// Terminal crash path shared by signal, abort and assertion entry points.
pub struct CrashInterceptor {
    reporting: AtomicBool,
}

impl CrashInterceptor {
    pub const fn new() -> Self {
        Self {
            reporting: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> CrashState {
        if self.reporting.load(Ordering::SeqCst) {
            CrashState::Reporting
        } else {
            CrashState::Armed
        }
    }

    /// Reports a crash to the host and never returns.
    ///
    /// For signal paths the host restores the snapshot inside the hypercall; when it
    /// does hand control back, the vCPU is parked. A fault raised while a report is
    /// being built skips straight to the park.
    pub fn report<T: Hypercall>(&self, hypercall: &T, reason: Option<&str>) -> ! {
        if self.reporting.swap(true, Ordering::SeqCst) {
            halt()
        }
        let bt = Backtrace::capture();
        let report = CrashReport::assemble(reason, &bt);
        hypercall.panic_extended(report.as_cstr());
        halt()
    }

    pub fn report_signal<T: Hypercall>(&self, hypercall: &T, signo: c_int) -> ! {
        let mut reason = BoundedBuf::<CRASH_REASON_SIZE>::new();
        let _ = signal_reason(&mut reason, signo);
        self.report(hypercall, Some(reason.as_str()))
    }

    /// `abort` and its aliases.
    pub fn report_abort<T: Hypercall>(&self, hypercall: &T) -> ! {
        self.report(hypercall, Some("abort"))
    }

    /// BSD `__assert`, arguments in C order.
    ///
    /// # Safety
    ///
    /// String arguments are null or NUL-terminated.
    pub unsafe fn report_assert<T: Hypercall>(
        &self,
        hypercall: &T,
        func: *const c_char,
        file: *const c_char,
        line: c_int,
        failed_expr: *const c_char,
    ) -> ! {
        let mut reason = BoundedBuf::<CRASH_REASON_SIZE>::new();
        let _ = assertion_reason(
            &mut reason,
            c_str(failed_expr),
            c_str(func),
            c_str(file),
            line as u32,
        );
        self.report(hypercall, Some(reason.as_str()))
    }

    /// glibc `__assert_fail`, arguments in C order.
    ///
    /// # Safety
    ///
    /// String arguments are null or NUL-terminated.
    pub unsafe fn report_assert_fail<T: Hypercall>(
        &self,
        hypercall: &T,
        assertion: *const c_char,
        file: *const c_char,
        line: c_uint,
        function: *const c_char,
    ) -> ! {
        let mut reason = BoundedBuf::<CRASH_REASON_SIZE>::new();
        let _ = assertion_reason(
            &mut reason,
            c_str(assertion),
            c_str(function),
            c_str(file),
            line,
        );
        self.report(hypercall, Some(reason.as_str()))
    }

    /// glibc `__assert_perror_fail`, arguments in C order.
    ///
    /// # Safety
    ///
    /// String arguments are null or NUL-terminated.
    pub unsafe fn report_assert_perror_fail<T: Hypercall>(
        &self,
        hypercall: &T,
        errnum: c_int,
        file: *const c_char,
        line: c_uint,
        function: *const c_char,
    ) -> ! {
        let mut reason = BoundedBuf::<CRASH_REASON_SIZE>::new();
        let _ = perror_reason(&mut reason, errnum, c_str(function), c_str(file), line);
        self.report(hypercall, Some(reason.as_str()))
    }
}

/// Borrows a C string from a crashing caller, `"?"` when absent or not UTF-8.
unsafe fn c_str<'a>(s: *const c_char) -> &'a str {
    if s.is_null() {
        return "?";
    }
    CStr::from_ptr(s).to_str().unwrap_or("?")
}

impl Default for CrashInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

pub fn signal_reason(out: &mut impl Write, signo: c_int) -> fmt::Result {
    match Signal::try_from(signo) {
        Ok(signal) => write!(out, "caught signal: {} ({})", signo, signal),
        Err(_) => write!(out, "caught signal: {}", signo),
    }
}

/// Reason for `__assert` and `__assert_fail`.
pub fn assertion_reason(
    out: &mut impl Write,
    expr: &str,
    func: &str,
    file: &str,
    line: u32,
) -> fmt::Result {
    write!(
        out,
        "assertion failed: \"{}\" in {} ({}:{})",
        expr, func, file, line
    )
}

/// Reason for `__assert_perror_fail`.
pub fn perror_reason(
    out: &mut impl Write,
    errnum: c_int,
    func: &str,
    file: &str,
    line: u32,
) -> fmt::Result {
    write!(
        out,
        "assert_perror: {} in {} ({}:{})",
        nix::errno::Errno::from_i32(errnum),
        func,
        file,
        line
    )
}
