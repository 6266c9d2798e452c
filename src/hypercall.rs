//! Hypercall transport to the Nyx hypervisor.
//!
//! Every call traps into the host, which suspends the vCPU, acts on the request and
//! resumes the guest. Opcodes and the register convention follow QEMU-Nyx exactly.

use crate::utils::BoundedBuf;
use std::ffi::CStr;

/// Value in `rax` that marks a trap as a kAFL/Nyx hypercall.
pub const HYPERCALL_KAFL_RAX_ID: u64 = 0x01f;

/// Opcode of one hypercall, passed in `rbx`.
pub type HypercallOp = u64;

pub const HYPERCALL_KAFL_ACQUIRE: HypercallOp = 0;
pub const HYPERCALL_KAFL_GET_PAYLOAD: HypercallOp = 1;
pub const HYPERCALL_KAFL_RELEASE: HypercallOp = 4;
pub const HYPERCALL_KAFL_PRINTF: HypercallOp = 13;
pub const HYPERCALL_KAFL_USER_SUBMIT_MODE: HypercallOp = 17;
pub const HYPERCALL_KAFL_USER_FAST_ACQUIRE: HypercallOp = 18;
pub const HYPERCALL_KAFL_USER_ABORT: HypercallOp = 20;
pub const HYPERCALL_KAFL_PANIC_EXTENDED: HypercallOp = 32;
pub const HYPERCALL_KAFL_GET_HOST_CONFIG: HypercallOp = 35;
pub const HYPERCALL_KAFL_SET_AGENT_CONFIG: HypercallOp = 36;

/// Max size of one printf/abort message, including the terminator.
pub const HPRINTF_MAX_SIZE: usize = 0x1000;

/// Synchronous guest-to-host call.
pub trait Hypercall {
    /// Traps into the host with `op` and a single word-sized argument.
    ///
    /// # Safety
    ///
    /// For opcodes that carry an address, `arg` must point to memory that stays
    /// valid (and writable, if the host fills it) for the duration of the call.
    unsafe fn hypercall(&self, op: HypercallOp, arg: u64) -> u64;

    /// Prints `msg` on the host side, truncated to [`HPRINTF_MAX_SIZE`].
    fn hprintf(&self, msg: &str) {
        let mut buf = BoundedBuf::<HPRINTF_MAX_SIZE>::new();
        buf.push_str(msg);
        unsafe {
            self.hypercall(HYPERCALL_KAFL_PRINTF, buf.as_ptr() as u64);
        }
    }

    /// Asks the host to abort the fuzzing session. Never returns.
    fn habort(&self, msg: &str) -> ! {
        let mut buf = BoundedBuf::<HPRINTF_MAX_SIZE>::new();
        buf.push_str(msg);
        unsafe {
            self.hypercall(HYPERCALL_KAFL_USER_ABORT, buf.as_ptr() as u64);
        }
        halt()
    }

    /// Reports a crash with a free-form message.
    fn panic_extended(&self, report: &CStr) {
        unsafe {
            self.hypercall(HYPERCALL_KAFL_PANIC_EXTENDED, report.as_ptr() as u64);
        }
    }
}

impl<T: Hypercall + ?Sized> Hypercall for &T {
    unsafe fn hypercall(&self, op: HypercallOp, arg: u64) -> u64 {
        (**self).hypercall(op, arg)
    }
}

/// The real transport: `vmcall` with the kAFL register convention.
#[derive(Debug, Default, Clone, Copy)]
pub struct Vmcall;

#[cfg(target_arch = "x86_64")]
impl Hypercall for Vmcall {
    unsafe fn hypercall(&self, op: HypercallOp, arg: u64) -> u64 {
        let ret: u64;
        // rbx is reserved by llvm, swap the opcode in and out around the trap.
        std::arch::asm!(
            "xchg {op}, rbx",
            "vmcall",
            "xchg {op}, rbx",
            op = inout(reg) op => _,
            inout("rax") HYPERCALL_KAFL_RAX_ID => ret,
            in("rcx") arg,
        );
        ret
    }
}

#[cfg(not(target_arch = "x86_64"))]
impl Hypercall for Vmcall {
    unsafe fn hypercall(&self, op: HypercallOp, _arg: u64) -> u64 {
        panic!("nyx hypercall {} needs an x86_64 guest", op)
    }
}

/// Parks the vCPU forever. Used once the host has been told the guest is done.
pub fn halt() -> ! {
    loop {
        std::hint::spin_loop();
    }
}
