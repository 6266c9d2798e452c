//! In-process stand-ins for the hypervisor and libc, used by unit tests.

use crate::hypercall::*;
use crate::platform::{FaultHandler, Platform, PlatformError};
use crate::protocol::{AgentConfig, HostConfig, NYX_HOST_MAGIC, NYX_HOST_VERSION};
use nix::{errno::Errno, sys::signal::Signal};
use std::{
    collections::{HashMap, VecDeque},
    ffi::CStr,
    os::raw::{c_char, c_int},
    panic::{self, AssertUnwindSafe},
    ptr,
    sync::Mutex,
};

/// Unwinds out of a hypercall the real host never returns from.
#[derive(Debug)]
pub(crate) struct HostReset;

/// Runs `f`, which must end in a call the host does not return from.
pub(crate) fn expect_host_reset<F: FnOnce() -> R, R>(f: F) {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(_) => panic!("call returned, expected the host to take over"),
        Err(e) if e.is::<HostReset>() => {}
        Err(e) => panic::resume_unwind(e),
    }
}

/// Guest-side view of a host that answers hypercalls in process.
pub(crate) struct MockHost {
    config: HostConfig,
    calls: Mutex<Vec<(HypercallOp, u64)>>,
    payload_addr: Mutex<Option<u64>>,
    inputs: Mutex<VecDeque<Vec<u8>>>,
    agent_config: Mutex<Option<AgentConfig>>,
    trace_at_release: Mutex<Vec<Vec<u8>>>,
    messages: Mutex<Vec<String>>,
    panics: Mutex<Vec<String>>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new(HostConfig {
            host_magic: NYX_HOST_MAGIC,
            host_version: NYX_HOST_VERSION,
            bitmap_size: 0x10000,
            ijon_bitmap_size: 0x1000,
            payload_buffer_size: 0x1000,
            worker_id: 0,
        })
    }
}

impl MockHost {
    pub(crate) fn new(config: HostConfig) -> Self {
        Self {
            config,
            calls: Mutex::new(Vec::new()),
            payload_addr: Mutex::new(None),
            inputs: Mutex::new(VecDeque::new()),
            agent_config: Mutex::new(None),
            trace_at_release: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            panics: Mutex::new(Vec::new()),
        }
    }

    /// Queues an input, delivered on the next `USER_FAST_ACQUIRE`.
    pub(crate) fn push_input(&self, input: &[u8]) {
        self.inputs.lock().unwrap().push_back(input.to_vec());
    }

    pub(crate) fn calls(&self) -> Vec<(HypercallOp, u64)> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, op: HypercallOp) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.0 == op).count()
    }

    pub(crate) fn agent_config(&self) -> Option<AgentConfig> {
        *self.agent_config.lock().unwrap()
    }

    pub(crate) fn payload_addr(&self) -> Option<u64> {
        *self.payload_addr.lock().unwrap()
    }

    pub(crate) fn trace_at_release(&self) -> Vec<Vec<u8>> {
        self.trace_at_release.lock().unwrap().clone()
    }

    pub(crate) fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub(crate) fn panics(&self) -> Vec<String> {
        self.panics.lock().unwrap().clone()
    }

    unsafe fn deliver_input(&self) {
        let addr = match self.payload_addr() {
            Some(addr) => addr as *mut u8,
            None => return,
        };
        let input = match self.inputs.lock().unwrap().pop_front() {
            Some(input) => input,
            None => return,
        };
        let room = self.config.payload_buffer_size as usize - 4;
        let n = input.len().min(room);
        ptr::write_unaligned(addr as *mut i32, input.len() as i32);
        ptr::copy_nonoverlapping(input.as_ptr(), addr.add(4), n);
    }

    unsafe fn snapshot_trace(&self) {
        if let Some(cfg) = self.agent_config() {
            let addr = cfg.trace_buffer_vaddr as *const u8;
            let len = self.config.bitmap_size as usize;
            let trace = std::slice::from_raw_parts(addr, len).to_vec();
            self.trace_at_release.lock().unwrap().push(trace);
        }
    }
}

unsafe fn c_string(arg: u64) -> String {
    CStr::from_ptr(arg as *const c_char)
        .to_string_lossy()
        .into_owned()
}

impl Hypercall for MockHost {
    unsafe fn hypercall(&self, op: HypercallOp, arg: u64) -> u64 {
        self.calls.lock().unwrap().push((op, arg));
        match op {
            HYPERCALL_KAFL_GET_HOST_CONFIG => {
                ptr::write_unaligned(arg as *mut HostConfig, self.config);
            }
            HYPERCALL_KAFL_SET_AGENT_CONFIG => {
                let cfg = ptr::read_unaligned(arg as *const AgentConfig);
                *self.agent_config.lock().unwrap() = Some(cfg);
            }
            HYPERCALL_KAFL_GET_PAYLOAD => {
                *self.payload_addr.lock().unwrap() = Some(arg);
            }
            HYPERCALL_KAFL_USER_FAST_ACQUIRE => self.deliver_input(),
            HYPERCALL_KAFL_RELEASE => self.snapshot_trace(),
            HYPERCALL_KAFL_PRINTF => {
                let msg = c_string(arg);
                self.messages.lock().unwrap().push(msg);
            }
            HYPERCALL_KAFL_USER_ABORT => {
                let msg = c_string(arg);
                self.messages.lock().unwrap().push(msg);
                panic::panic_any(HostReset);
            }
            HYPERCALL_KAFL_PANIC_EXTENDED => {
                let msg = c_string(arg);
                self.panics.lock().unwrap().push(msg);
                panic::panic_any(HostReset);
            }
            _ => {}
        }
        0
    }
}

/// Signal table and coverage map of a fake process.
pub(crate) struct MockPlatform {
    handlers: Mutex<HashMap<c_int, usize>>,
    forwarded: Mutex<Vec<c_int>>,
    fail_on: Option<Signal>,
    coverage: Option<Vec<u8>>,
}

impl MockPlatform {
    pub(crate) fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            forwarded: Mutex::new(Vec::new()),
            fail_on: None,
            coverage: None,
        }
    }

    pub(crate) fn fail_on(mut self, signal: Signal) -> Self {
        self.fail_on = Some(signal);
        self
    }

    pub(crate) fn with_coverage(mut self, coverage: Vec<u8>) -> Self {
        self.coverage = Some(coverage);
        self
    }

    pub(crate) fn handler(&self, signo: c_int) -> Option<usize> {
        self.handlers.lock().unwrap().get(&signo).copied()
    }

    /// Signals whose handler was installed through `forward_sigaction`.
    pub(crate) fn forwarded_installs(&self) -> Vec<c_int> {
        self.forwarded.lock().unwrap().clone()
    }

    /// Runs the handler currently installed for `signo`, as the kernel would.
    pub(crate) fn deliver(&self, signo: c_int) {
        let handler = self.handler(signo).expect("no handler installed");
        let handler: FaultHandler = unsafe { std::mem::transmute(handler) };
        handler(signo, ptr::null_mut(), ptr::null_mut());
    }
}

impl Platform for MockPlatform {
    fn install_signal_handler(
        &self,
        signal: Signal,
        handler: FaultHandler,
    ) -> Result<(), PlatformError> {
        if self.fail_on == Some(signal) {
            return Err(PlatformError::Sigaction {
                signal,
                source: Errno::EINVAL,
            });
        }
        self.handlers
            .lock()
            .unwrap()
            .insert(signal as c_int, handler as usize);
        Ok(())
    }

    unsafe fn forward_sigaction(
        &self,
        signum: c_int,
        act: *const libc::sigaction,
        oldact: *mut libc::sigaction,
    ) -> c_int {
        let mut handlers = self.handlers.lock().unwrap();
        if !oldact.is_null() {
            (*oldact).sa_sigaction = handlers.get(&signum).copied().unwrap_or(libc::SIG_DFL);
        }
        if !act.is_null() {
            handlers.insert(signum, (*act).sa_sigaction);
            self.forwarded.lock().unwrap().push(signum);
        }
        0
    }

    fn coverage_bitmap(&self, _default_len: usize) -> Option<&[u8]> {
        self.coverage.as_deref()
    }

    fn exit(&self, code: i32) -> ! {
        panic!("process exit({})", code)
    }
}
