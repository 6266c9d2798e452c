//! Agent configuration, read from the environment of the target process.

use log::LevelFilter;
use std::str::FromStr;
use thiserror::Error;

pub const ENV_TRACING: &str = "NYX_AGENT_TRACING";
pub const ENV_TIMEOUT_DETECTION: &str = "NYX_AGENT_TIMEOUT_DETECTION";
pub const ENV_IJON_TRACING: &str = "NYX_AGENT_IJON_TRACING";
pub const ENV_NON_RELOAD_MODE: &str = "NYX_AGENT_NON_RELOAD_MODE";
pub const ENV_LOG: &str = "NYX_AGENT_LOG";

/// Flags advertised to the host plus agent-local settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOptions {
    /// Coverage tracing through the trace buffer.
    pub tracing: bool,
    /// Let the host detect hangs.
    pub timeout_detection: bool,
    /// Allocate and advertise the auxiliary (IJON) trace buffer.
    pub ijon_tracing: bool,
    /// Host keeps the guest running instead of restoring after each release.
    pub non_reload_mode: bool,
    /// Max level forwarded to the host log.
    pub log_level: LevelFilter,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            tracing: true,
            timeout_detection: false,
            ijon_tracing: false,
            non_reload_mode: false,
            log_level: LevelFilter::Info,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("invalid boolean '{value}' for {var}")]
    InvalidBool { var: &'static str, value: String },
    #[error("invalid log level '{value}' for {var}")]
    InvalidLevel { var: &'static str, value: String },
}

impl AgentOptions {
    pub fn from_env() -> Result<Self, OptionsError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds options from `lookup`, unset variables keep their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, OptionsError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut opts = Self::default();
        let flags: [(&'static str, &mut bool); 4] = [
            (ENV_TRACING, &mut opts.tracing),
            (ENV_TIMEOUT_DETECTION, &mut opts.timeout_detection),
            (ENV_IJON_TRACING, &mut opts.ijon_tracing),
            (ENV_NON_RELOAD_MODE, &mut opts.non_reload_mode),
        ];
        for (var, flag) in flags {
            if let Some(value) = lookup(var) {
                *flag = parse_bool(&value).ok_or(OptionsError::InvalidBool { var, value })?;
            }
        }
        if let Some(value) = lookup(ENV_LOG) {
            opts.log_level = LevelFilter::from_str(value.trim()).map_err(|_| {
                OptionsError::InvalidLevel {
                    var: ENV_LOG,
                    value,
                }
            })?;
        }
        Ok(opts)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
