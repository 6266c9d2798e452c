//! Share directory layout of AFL++ Nyx mode.
//!
//! The guest boots with `fuzz_no_pt.sh`, which pulls every file it needs out of the
//! share directory with `hget` and then starts the target with the agent preloaded.

use std::{
    fs, io,
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
};
use thiserror::Error;

/// Name of the boot script AFL++ looks for.
pub const FUZZ_SCRIPT: &str = "fuzz_no_pt.sh";
/// Name of the target binary inside the share directory.
pub const FUZZ_BINARY: &str = "fuzz";
/// Dynamic loader, which has to be executable inside the guest.
const DYNAMIC_LOADER: &str = "ld-linux-x86-64.so.2";

#[derive(Debug, Error)]
pub enum SharedirError {
    #[error("share dir '{0}' does not exist")]
    MissingSharedir(PathBuf),
    #[error("failed to spawn lddtree: {0}")]
    Spawn(#[source] io::Error),
    #[error("lddtree {status}: {stderr}")]
    Lddtree { status: ExitStatus, stderr: String },
    #[error("unexpected lddtree output line: '{0}'")]
    MalformedLine(String),
    #[error("failed to copy '{}' to '{}': {source}", .from.display(), .to.display())]
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
    #[error("failed to write '{}': {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
}

/// Everything needed to lay out one share directory.
#[derive(Debug, Clone)]
pub struct SharedirConfig {
    pub sharedir: PathBuf,
    /// Harness target, exported to the guest in `target_env`.
    pub target: String,
    pub target_env: String,
    pub binary: PathBuf,
    /// File name of the agent library inside the guest.
    pub agent_name: String,
    /// Agent library to copy in, if it is not there yet.
    pub agent: Option<PathBuf>,
}

/// One shared library the binary links against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    pub path: PathBuf,
}

/// Parses `lddtree` output. The first line names the binary itself, every other line
/// reads `name => path`.
pub fn parse_lddtree(output: &str) -> Result<Vec<Dependency>, SharedirError> {
    let mut deps = Vec::new();
    for line in output.lines().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let mut parts = line.split("=>");
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), Some(path), None) if !name.trim().is_empty() && !path.trim().is_empty() => {
                deps.push(Dependency {
                    name: name.trim().to_string(),
                    path: PathBuf::from(path.trim()),
                });
            }
            _ => return Err(SharedirError::MalformedLine(line.to_string())),
        }
    }
    Ok(deps)
}

/// Lists the shared libraries of `binary` with `lddtree`.
pub fn lddtree(binary: &Path) -> Result<Vec<Dependency>, SharedirError> {
    let output = Command::new("lddtree")
        .arg(binary)
        .output()
        .map_err(SharedirError::Spawn)?;
    if !output.status.success() {
        return Err(SharedirError::Lddtree {
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    parse_lddtree(&String::from_utf8_lossy(&output.stdout))
}

fn copy_file(from: &Path, to: PathBuf) -> Result<(), SharedirError> {
    fs::copy(from, &to)
        .map(|_| ())
        .map_err(|source| SharedirError::Copy {
            from: from.to_path_buf(),
            to,
            source,
        })
}

/// Copies each library into `sharedir`, returns the names in the guest.
pub fn copy_shared_libs(
    deps: &[Dependency],
    sharedir: &Path,
) -> Result<Vec<String>, SharedirError> {
    let mut names = Vec::with_capacity(deps.len());
    for dep in deps {
        copy_file(&dep.path, sharedir.join(&dep.name))?;
        log::debug!("{} => {}", dep.name, dep.path.display());
        names.push(dep.name.clone());
    }
    Ok(names)
}

/// Boot script for the guest. `files` are fetched with `hget` in order.
pub fn fuzz_script(target: &str, target_env: &str, agent_name: &str, files: &[String]) -> String {
    let mut lines = vec![
        "chmod +x hget".to_string(),
        "cp hget /tmp".to_string(),
        "cd /tmp".to_string(),
        "echo 0 > /proc/sys/kernel/randomize_va_space".to_string(),
        "echo 0 > /proc/sys/kernel/printk".to_string(),
        "./hget hcat_no_pt hcat".to_string(),
        "./hget habort_no_pt habort".to_string(),
    ];
    lines.extend(files.iter().map(|f| format!("./hget {} {}", f, f)));
    for exe in &["habort", "hcat", FUZZ_BINARY, agent_name, DYNAMIC_LOADER] {
        lines.push(format!("chmod +x {}", exe));
    }
    lines.push(format!("export {}={}", target_env, target));
    lines.push("export __AFL_DEFER_FORKSRV=1".to_string());
    lines.push(format!(
        "LD_LIBRARY_PATH=/tmp LD_BIND_NOW=1 LD_PRELOAD={} ./{} > output.txt 2>&1",
        agent_name, FUZZ_BINARY
    ));

    let mut script = lines.join("\n");
    script.push('\n');
    script
}

pub fn write_fuzz_script(sharedir: &Path, script: &str) -> Result<PathBuf, SharedirError> {
    let path = sharedir.join(FUZZ_SCRIPT);
    fs::write(&path, script).map_err(|source| SharedirError::Write {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// Fills the share directory: libraries, binary, agent, boot script.
pub fn create(config: &SharedirConfig) -> Result<(), SharedirError> {
    if !config.sharedir.is_dir() {
        return Err(SharedirError::MissingSharedir(config.sharedir.clone()));
    }
    let deps = lddtree(&config.binary)?;
    populate(config, &deps)
}

fn populate(config: &SharedirConfig, deps: &[Dependency]) -> Result<(), SharedirError> {
    let mut files = copy_shared_libs(deps, &config.sharedir)?;
    log::info!("{} shared libraries copied", files.len());

    copy_file(&config.binary, config.sharedir.join(FUZZ_BINARY))?;
    if let Some(agent) = config.agent.as_ref() {
        copy_file(agent, config.sharedir.join(&config.agent_name))?;
    }
    files.push(FUZZ_BINARY.to_string());
    files.push(config.agent_name.clone());

    let script = fuzz_script(
        &config.target,
        &config.target_env,
        &config.agent_name,
        &files,
    );
    let path = write_fuzz_script(&config.sharedir, &script)?;
    log::info!("boot script written to '{}'", path.display());
    Ok(())
}
