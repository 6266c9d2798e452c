use anyhow::Context;
use nyx_sharedir::{create, SharedirConfig};
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "nyx-sharedir",
    about = "Create the share dir used by AFL++ Nyx mode for snapshot fuzzing."
)]
struct Settings {
    /// Path to the share dir, must exist.
    #[structopt(long)]
    sharedir: PathBuf,
    /// Name of the harness target to fuzz.
    #[structopt(long)]
    target: String,
    /// Path to the fuzz binary.
    #[structopt(long)]
    binary: PathBuf,
    /// File name of the agent library in the guest.
    #[structopt(long, default_value = "libnyx_agent.so")]
    agent_name: String,
    /// Agent library to copy into the share dir.
    #[structopt(long)]
    agent: Option<PathBuf>,
    /// Environment variable the harness reads its target from.
    #[structopt(long, default_value = "FUZZ")]
    target_env: String,
    /// Verbose.
    #[structopt(long, short = "v")]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::from_args();
    let level = if settings.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context("failed to init logger")?;

    let config = SharedirConfig {
        sharedir: settings.sharedir,
        target: settings.target,
        target_env: settings.target_env,
        binary: settings.binary,
        agent_name: settings.agent_name,
        agent: settings.agent,
    };
    create(&config)
        .with_context(|| format!("failed to create share dir '{}'", config.sharedir.display()))
}
