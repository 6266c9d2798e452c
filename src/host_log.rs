//! `log` backend that prints through the hypervisor.
//!
//! The guest has no console the fuzzer can see, so every record ends up in the
//! host log via `PRINTF`.

use crate::hypercall::{Hypercall, HPRINTF_MAX_SIZE};
use crate::utils::BoundedBuf;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::fmt::Write;

pub struct HostLogger<T> {
    hypercall: T,
}

impl<T> HostLogger<T> {
    pub const fn new(hypercall: T) -> Self {
        Self { hypercall }
    }
}

impl<T: Hypercall + Send + Sync + 'static> HostLogger<T> {
    /// Registers `self` as the global logger. Calling it again only adjusts the level.
    pub fn init(&'static self, level: LevelFilter) -> Result<(), SetLoggerError> {
        let ret = log::set_logger(self);
        log::set_max_level(level);
        match ret {
            Err(_) if is_registered(self) => Ok(()),
            ret => ret,
        }
    }
}

fn is_registered<T>(logger: &'static HostLogger<T>) -> bool {
    let current = log::logger() as *const dyn Log as *const u8;
    current == logger as *const HostLogger<T> as *const u8
}

impl<T: Hypercall + Send + Sync> Log for HostLogger<T> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        let mut buf = BoundedBuf::<HPRINTF_MAX_SIZE>::new();
        let _ = writeln!(buf, "[{}] {}", record.level(), record.args());
        self.hypercall.hprintf(buf.as_str());
    }

    fn flush(&self) {}
}
