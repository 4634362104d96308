// SPDX-License-Identifier: PMPL-1.0-or-later

//! OS-facing collaborators consumed by the injectors.
//!
//! Injectors never touch processes or traffic-control state directly; they go
//! through [`ProcessControl`] and [`TrafficControl`] so the lifecycle can be
//! exercised against the in-memory implementations in [`crate::testing`].

pub mod process;
pub mod tc;

pub use process::SystemProcesses;
pub use tc::{FlowMatch, NetemDelay, TcCli};

use crate::config::AgentConfig;
use crate::error::{HostError, HostResult};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Term => "TERM",
            Signal::Kill => "KILL",
        }
    }
}

pub trait ProcessControl: Send + Sync {
    /// Start `program` in its own process group without waiting for it.
    fn spawn_detached(&self, program: &Path, args: &[String]) -> HostResult<u32>;

    /// Whether any running process has `key` in its command line.
    fn exists(&self, key: &str) -> HostResult<bool>;

    /// Signal every running process whose command line contains `key`.
    fn kill(&self, key: &str, signal: Signal) -> HostResult<()>;
}

pub trait TrafficControl: Send + Sync {
    fn tool_available(&self) -> bool;

    fn interface_exists(&self, interface: &str) -> bool;

    /// Whether a non-default root qdisc is installed on `interface`.
    fn has_root_qdisc(&self, interface: &str) -> HostResult<bool>;

    /// Attach a netem qdisc at the root (`parent = None`) or under a class.
    fn add_netem(
        &self,
        interface: &str,
        parent: Option<&str>,
        delay: &NetemDelay,
    ) -> HostResult<()>;

    /// Install a root prio qdisc with the given handle and band count.
    fn add_prio(&self, interface: &str, handle: &str, bands: u8) -> HostResult<()>;

    /// Route traffic matching `flow` into class `flowid`.
    fn add_filter(&self, interface: &str, flowid: &str, flow: &FlowMatch) -> HostResult<()>;

    /// Remove the whole rule tree from `interface`.
    fn clear(&self, interface: &str) -> HostResult<()>;
}

/// Handles to the collaborators plus the paths of the helper programs.
#[derive(Clone)]
pub struct Host {
    pub processes: Arc<dyn ProcessControl>,
    pub network: Arc<dyn TrafficControl>,
    pub tools_dir: PathBuf,
    /// The agent executable, re-invoked for scheduled recovery.
    pub agent: PathBuf,
}

impl Host {
    pub fn system(config: &AgentConfig) -> Result<Self> {
        Ok(Self {
            processes: Arc::new(SystemProcesses),
            network: Arc::new(TcCli::new(config.tc_program())),
            tools_dir: config.tools_dir()?,
            agent: env::current_exe().context("locating agent executable")?,
        })
    }

    pub fn tool_path(&self, name: &str) -> PathBuf {
        self.tools_dir.join(name)
    }
}

/// Whether a process key (`<program> <arg>...`) appears in `argv` as whole
/// tokens. The program token matches by basename, so `chaosmeta_diskburn a`
/// matches `/opt/tools/chaosmeta_diskburn a ...` but not `... a-1 ...`.
pub fn argv_matches_key(argv: &[&str], key: &str) -> bool {
    let wanted: Vec<&str> = key.split_whitespace().collect();
    let Some((program, rest)) = wanted.split_first() else {
        return false;
    };
    argv.windows(wanted.len()).any(|window| {
        let head = window[0];
        let basename = head.rsplit('/').next().unwrap_or(head);
        basename == *program && window[1..] == *rest
    })
}

/// Run a command to completion, failing on a non-zero exit.
pub(crate) fn run(program: &str, args: &[String]) -> HostResult<Output> {
    log::debug!("exec: {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()?;

    if !output.status.success() {
        return Err(HostError::CommandFailed {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

/// Resolve `program` against `PATH` unless it is already a path.
pub(crate) fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return path.is_file().then_some(path);
    }
    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    })
}
