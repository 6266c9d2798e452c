//! Guest-side agent for snapshot fuzzing under the Nyx hypervisor.
//!
//! Loaded into the target with `LD_PRELOAD`, the agent negotiates shared buffers with
//! the host, hands one fuzz input per iteration to the harness, publishes coverage,
//! and turns every crash of the target into a report to the host.

pub mod agent;
pub mod crash;
#[cfg(all(feature = "interpose", not(test)))]
mod ffi;
pub mod host_log;
pub mod hypercall;
#[cfg(test)]
pub(crate) mod mock;
pub mod options;
pub mod platform;
pub mod protocol;
pub mod shmem;
pub mod signals;
pub mod utils;

pub use agent::{Agent, Session};
pub use crash::{CrashInterceptor, CrashReport, CrashState};
pub use hypercall::{Hypercall, Vmcall};
pub use options::AgentOptions;
pub use platform::{Libc, Platform};
