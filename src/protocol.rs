//! Binary layouts shared with the hypervisor.

use crate::options::AgentOptions;
use crate::shmem::SharedRegion;
use std::mem::size_of;
use thiserror::Error;

pub const NYX_HOST_MAGIC: u32 = 0x4878_794e;
pub const NYX_AGENT_MAGIC: u32 = 0x4178_794e;
pub const NYX_HOST_VERSION: u32 = 2;
pub const NYX_AGENT_VERSION: u32 = 1;

/// Execution modes for `USER_SUBMIT_MODE`.
pub const KAFL_MODE_64: u64 = 0;
pub const KAFL_MODE_32: u64 = 1;
pub const KAFL_MODE_16: u64 = 2;

/// Capabilities reported by the host through `GET_HOST_CONFIG`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HostConfig {
    pub host_magic: u32,
    pub host_version: u32,
    /// Size of the coverage bitmap, which sizes the trace buffer.
    pub bitmap_size: u32,
    /// Size of the auxiliary (IJON) bitmap.
    pub ijon_bitmap_size: u32,
    /// Max size of the payload buffer, also the limit for fuzz inputs.
    pub payload_buffer_size: u32,
    pub worker_id: u32,
}

const _: () = assert!(size_of::<HostConfig>() == 24);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("NYX_HOST_MAGIC not found in host configuration (got {found:#x}, want {expected:#x}) - you are probably using an outdated version of QEMU-Nyx")]
    HostMagic { found: u32, expected: u32 },
    #[error("NYX_HOST_VERSION not found in host configuration (got {found}, want {expected}) - you are probably using an outdated version of QEMU-Nyx")]
    HostVersion { found: u32, expected: u32 },
}

impl HostConfig {
    /// Checks the host speaks the protocol revision this agent was built for.
    pub fn check(&self) -> Result<(), ProtocolError> {
        if self.host_magic != NYX_HOST_MAGIC {
            return Err(ProtocolError::HostMagic {
                found: self.host_magic,
                expected: NYX_HOST_MAGIC,
            });
        }
        if self.host_version != NYX_HOST_VERSION {
            return Err(ProtocolError::HostVersion {
                found: self.host_version,
                expected: NYX_HOST_VERSION,
            });
        }
        Ok(())
    }
}

/// Agent configuration sent through `SET_AGENT_CONFIG`.
///
/// Packed: the host reads it field by field at these exact offsets. Copy fields out
/// before borrowing them.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct AgentConfig {
    pub agent_magic: u32,
    pub agent_version: u32,
    pub agent_timeout_detection: u8,
    pub agent_tracing: u8,
    pub agent_ijon_tracing: u8,
    pub agent_non_reload_mode: u8,
    pub trace_buffer_vaddr: u64,
    pub ijon_trace_buffer_vaddr: u64,
    pub coverage_bitmap_size: u32,
    pub input_buffer_size: u32,
    /// Set by the hypervisor.
    pub dump_payloads: u8,
}

const _: () = assert!(size_of::<AgentConfig>() == 37);

impl AgentConfig {
    pub fn new(
        options: &AgentOptions,
        trace: &SharedRegion,
        ijon_trace: Option<&SharedRegion>,
    ) -> Self {
        Self {
            agent_magic: NYX_AGENT_MAGIC,
            agent_version: NYX_AGENT_VERSION,
            agent_timeout_detection: options.timeout_detection as u8,
            agent_tracing: options.tracing as u8,
            agent_ijon_tracing: ijon_trace.is_some() as u8,
            agent_non_reload_mode: options.non_reload_mode as u8,
            trace_buffer_vaddr: trace.addr(),
            ijon_trace_buffer_vaddr: ijon_trace.map(SharedRegion::addr).unwrap_or(0),
            ..Default::default()
        }
    }
}

/// Size of the length prefix of the payload container.
pub const PAYLOAD_HEADER_SIZE: usize = size_of::<i32>();

/// View of the payload container: an `i32` size followed by the input bytes.
#[derive(Debug, Clone, Copy)]
pub struct Payload<'a> {
    raw: &'a [u8],
}

impl<'a> Payload<'a> {
    pub fn new(raw: &'a [u8]) -> Self {
        Self { raw }
    }

    /// Size as written by the host, negative values read as zero.
    pub fn declared_size(&self) -> usize {
        if self.raw.len() < PAYLOAD_HEADER_SIZE {
            return 0;
        }
        let mut hdr = [0; PAYLOAD_HEADER_SIZE];
        hdr.copy_from_slice(&self.raw[..PAYLOAD_HEADER_SIZE]);
        let sz = i32::from_ne_bytes(hdr);
        if sz < 0 {
            0
        } else {
            sz as usize
        }
    }

    /// Max number of input bytes this container can hold.
    pub fn capacity(&self) -> usize {
        self.raw.len().saturating_sub(PAYLOAD_HEADER_SIZE)
    }

    /// Input bytes, never past the end of the container.
    pub fn data(&self) -> &'a [u8] {
        if self.raw.len() < PAYLOAD_HEADER_SIZE {
            return &[];
        }
        let sz = self.declared_size().min(self.capacity());
        &self.raw[PAYLOAD_HEADER_SIZE..PAYLOAD_HEADER_SIZE + sz]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! offset_of_packed {
        ($ty:ty, $field:ident) => {{
            let v = <$ty>::default();
            let base = &v as *const $ty as usize;
            let field = std::ptr::addr_of!(v.$field) as usize;
            field - base
        }};
    }

    #[test]
    fn agent_config_layout() {
        assert_eq!(offset_of_packed!(AgentConfig, agent_timeout_detection), 8);
        assert_eq!(offset_of_packed!(AgentConfig, agent_non_reload_mode), 11);
        assert_eq!(offset_of_packed!(AgentConfig, trace_buffer_vaddr), 12);
        assert_eq!(offset_of_packed!(AgentConfig, ijon_trace_buffer_vaddr), 20);
        assert_eq!(offset_of_packed!(AgentConfig, coverage_bitmap_size), 28);
        assert_eq!(offset_of_packed!(AgentConfig, dump_payloads), 36);
    }

    #[test]
    fn host_config_check() {
        let mut cfg = HostConfig {
            host_magic: NYX_HOST_MAGIC,
            host_version: NYX_HOST_VERSION,
            ..Default::default()
        };
        assert_eq!(cfg.check(), Ok(()));

        cfg.host_version = 1;
        assert_eq!(
            cfg.check(),
            Err(ProtocolError::HostVersion {
                found: 1,
                expected: NYX_HOST_VERSION
            })
        );

        cfg.host_magic = 0xdead;
        assert!(matches!(cfg.check(), Err(ProtocolError::HostMagic { .. })));
    }

    #[test]
    fn payload_view() {
        let mut raw = vec![0u8; 16];
        raw[..4].copy_from_slice(&5i32.to_ne_bytes());
        raw[4..9].copy_from_slice(b"hello");
        let p = Payload::new(&raw);
        assert_eq!(p.capacity(), 12);
        assert_eq!(p.declared_size(), 5);
        assert_eq!(p.data(), b"hello");

        // oversized and negative sizes stay inside the container
        raw[..4].copy_from_slice(&1000i32.to_ne_bytes());
        assert_eq!(Payload::new(&raw).data().len(), 12);
        raw[..4].copy_from_slice(&(-1i32).to_ne_bytes());
        assert!(Payload::new(&raw).data().is_empty());

        assert!(Payload::new(&raw[..2]).data().is_empty());
    }
}
