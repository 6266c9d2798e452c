//! The agent proper: handshake, payload acquisition and snapshot release.

use crate::{
    hypercall::*,
    options::AgentOptions,
    platform::{FaultHandler, Platform},
    protocol::{AgentConfig, HostConfig, Payload, KAFL_MODE_64, PAYLOAD_HEADER_SIZE},
    shmem::SharedRegion,
    signals,
};
use std::sync::OnceLock;

/// State negotiated with the host, fixed after the first `initialize`.
#[derive(Debug)]
pub struct Session {
    trace: SharedRegion,
    ijon_trace: Option<SharedRegion>,
    max_payload_size: usize,
}

impl Session {
    /// Coverage buffer registered with the host.
    pub fn trace_buffer(&self) -> &SharedRegion {
        &self.trace
    }

    pub fn ijon_trace_buffer(&self) -> Option<&SharedRegion> {
        self.ijon_trace.as_ref()
    }

    /// Upper bound of fuzz input sizes announced by the host.
    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }
}

/// Guest-side agent over a hypercall transport `T` and process binding `P`.
///
/// Each shared region is allocated and registered at most once for the life of
/// the process.
pub struct Agent<T, P> {
    hypercall: T,
    platform: P,
    options: AgentOptions,
    fault_handler: FaultHandler,
    session: OnceLock<Session>,
    payload: OnceLock<SharedRegion>,
}

impl<T: Hypercall, P: Platform> Agent<T, P> {
    pub fn new(
        hypercall: T,
        platform: P,
        options: AgentOptions,
        fault_handler: FaultHandler,
    ) -> Self {
        Self {
            hypercall,
            platform,
            options,
            fault_handler,
            session: OnceLock::new(),
            payload: OnceLock::new(),
        }
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    pub fn hypercall(&self) -> &T {
        &self.hypercall
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Negotiated state, `None` before the handshake.
    pub fn session(&self) -> Option<&Session> {
        self.session.get()
    }

    /// Payload buffer, `None` before the first input request.
    pub fn payload_buffer(&self) -> Option<&SharedRegion> {
        self.payload.get()
    }

    /// Performs the handshake and returns the max size of fuzz inputs.
    ///
    /// Only the first call talks to the host, later calls return the same size.
    pub fn initialize(&self) -> usize {
        self.session
            .get_or_init(|| self.handshake())
            .max_payload_size
    }

    fn handshake(&self) -> Session {
        // Armed first, so a failing handshake is reported like any other crash.
        if let Err(e) = signals::install_crash_handlers(&self.platform, self.fault_handler) {
            self.fatal(&e.to_string());
        }

        let mut host_config = HostConfig::default();
        unsafe {
            self.hypercall.hypercall(
                HYPERCALL_KAFL_GET_HOST_CONFIG,
                &mut host_config as *mut HostConfig as u64,
            );
        }
        if let Err(e) = host_config.check() {
            self.hypercall.habort(&format!("Error: {}", e));
        }

        log::info!("host_config.bitmap_size: {:#x}", host_config.bitmap_size);
        log::info!("host_config.ijon_bitmap_size: {:#x}", host_config.ijon_bitmap_size);
        log::info!("host_config.payload_buffer_size: {:#x}", host_config.payload_buffer_size);

        let trace = self.map_region(host_config.bitmap_size as usize, "trace buffer");
        let ijon_trace = if self.options.ijon_tracing && host_config.ijon_bitmap_size != 0 {
            Some(self.map_region(host_config.ijon_bitmap_size as usize, "ijon trace buffer"))
        } else {
            None
        };

        let agent_config = AgentConfig::new(&self.options, &trace, ijon_trace.as_ref());
        unsafe {
            self.hypercall.hypercall(
                HYPERCALL_KAFL_SET_AGENT_CONFIG,
                &agent_config as *const AgentConfig as u64,
            );
        }

        Session {
            trace,
            ijon_trace,
            max_payload_size: host_config.payload_buffer_size as usize,
        }
    }

    /// Blocks until the host delivers a new input, copies it into `out` and returns
    /// its size.
    ///
    /// The first call registers the payload buffer with the host, the host takes its
    /// snapshot at the following acquire. Every later iteration resumes right after
    /// that acquire.
    pub fn next_input(&self, out: &mut [u8]) -> usize {
        let max_payload_size = self.initialize();
        let payload = self
            .payload
            .get_or_init(|| self.register_payload(out.len().max(max_payload_size)));

        unsafe {
            self.hypercall
                .hypercall(HYPERCALL_KAFL_USER_SUBMIT_MODE, KAFL_MODE_64);
            self.hypercall.hypercall(HYPERCALL_KAFL_USER_FAST_ACQUIRE, 0);
        }

        if let Some(session) = self.session() {
            session.trace.set_byte(0, 1);
        }

        let data = Payload::new(unsafe { payload.as_slice() }).data();
        let n = data.len().min(out.len());
        out[..n].copy_from_slice(&data[..n]);
        n
    }

    fn register_payload(&self, len: usize) -> SharedRegion {
        let payload = self.map_region(len, "payload buffer");
        if let Err(e) = payload.lock() {
            log::warn!("payload buffer stays swappable: {}", e);
        }
        unsafe {
            self.hypercall
                .hypercall(HYPERCALL_KAFL_GET_PAYLOAD, payload.addr());
        }
        log::info!(
            "payload buffer is mapped at {:#x} (size: {:#x}, max input: {:#x})",
            payload.addr(),
            len,
            len.saturating_sub(PAYLOAD_HEADER_SIZE)
        );
        payload
    }

    /// Publishes the iteration's coverage and asks the host to restore the snapshot.
    ///
    /// With the host in reload mode this does not return to the caller: execution
    /// continues inside the `next_input` call that took the snapshot.
    pub fn release(&self) {
        if let Some(session) = self.session() {
            let trace = &session.trace;
            if let Some(coverage) = self.platform.coverage_bitmap(trace.len()) {
                trace.fill_from(coverage);
            }
        }
        unsafe {
            self.hypercall.hypercall(HYPERCALL_KAFL_RELEASE, 0);
        }
    }

    /// Sends `msg` to the host log.
    pub fn hprintf(&self, msg: &str) {
        self.hypercall.hprintf(msg)
    }

    /// The agent can not work without this resource: tell the host, then exit.
    fn fatal(&self, msg: &str) -> ! {
        self.hypercall.hprintf(msg);
        self.platform.exit(1)
    }

    fn map_region(&self, len: usize, what: &str) -> SharedRegion {
        SharedRegion::map(len).unwrap_or_else(|e| self.fatal(&format!("{}: {}", what, e)))
    }
}
