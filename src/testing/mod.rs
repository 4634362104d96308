// SPDX-License-Identifier: PMPL-1.0-or-later

//! In-memory collaborators for exercising injectors without touching the host.

use crate::error::{HostError, HostResult};
use crate::host::{
    argv_matches_key, FlowMatch, Host, NetemDelay, ProcessControl, Signal, TrafficControl,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const TOOLS_DIR: &str = "/opt/chaos/tools";
pub const AGENT: &str = "/opt/chaos/bin/chaos-agent";

pub fn memory_host(processes: Arc<MemoryProcesses>, network: Arc<MemoryTc>) -> Host {
    Host {
        processes,
        network,
        tools_dir: PathBuf::from(TOOLS_DIR),
        agent: PathBuf::from(AGENT),
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spawned {
    pub pid: u32,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Spawned {
    fn matches_key(&self, key: &str) -> bool {
        let program = self.program.display().to_string();
        let mut argv = vec![program.as_str()];
        argv.extend(self.args.iter().map(String::as_str));
        argv_matches_key(&argv, key)
    }
}

#[derive(Default)]
struct ProcessState {
    next_pid: u32,
    running: Vec<Spawned>,
    spawned: Vec<Spawned>,
    kills: Vec<(String, Signal)>,
    fail_spawn: bool,
}

/// Process table that records spawns and kills.
#[derive(Default)]
pub struct MemoryProcesses {
    state: Mutex<ProcessState>,
}

impl MemoryProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_spawn(&self) {
        locked(&self.state).fail_spawn = true;
    }

    pub fn spawned(&self) -> Vec<Spawned> {
        locked(&self.state).spawned.clone()
    }

    pub fn running(&self) -> Vec<Spawned> {
        locked(&self.state).running.clone()
    }

    pub fn kills(&self) -> Vec<(String, Signal)> {
        locked(&self.state).kills.clone()
    }
}

impl ProcessControl for MemoryProcesses {
    fn spawn_detached(&self, program: &Path, args: &[String]) -> HostResult<u32> {
        let mut state = locked(&self.state);
        if state.fail_spawn {
            return Err(HostError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", program.display()),
            )));
        }
        state.next_pid += 1;
        let spawned = Spawned {
            pid: 1000 + state.next_pid,
            program: program.to_path_buf(),
            args: args.to_vec(),
        };
        state.spawned.push(spawned.clone());
        state.running.push(spawned.clone());
        Ok(spawned.pid)
    }

    fn exists(&self, key: &str) -> HostResult<bool> {
        Ok(locked(&self.state)
            .running
            .iter()
            .any(|process| process.matches_key(key)))
    }

    fn kill(&self, key: &str, signal: Signal) -> HostResult<()> {
        let mut state = locked(&self.state);
        state.kills.push((key.to_string(), signal));
        state
            .running
            .retain(|process| !process.matches_key(key));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Qdisc {
    Netem(NetemDelay),
    Prio { handle: String, bands: u8 },
}

/// The tc state of one interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleTree {
    pub root: Option<Qdisc>,
    pub children: Vec<(String, NetemDelay)>,
    pub filters: Vec<(String, FlowMatch)>,
}

impl RuleTree {
    pub fn netem_count(&self) -> usize {
        let root = usize::from(matches!(self.root, Some(Qdisc::Netem(_))));
        root + self.children.len()
    }

    pub fn child_parents(&self) -> Vec<&str> {
        self.children
            .iter()
            .map(|(parent, _)| parent.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcOp {
    Show,
    Netem,
    Prio,
    Filter,
    Clear,
}

#[derive(Default)]
struct TcState {
    trees: HashMap<String, RuleTree>,
    fail_on: Option<TcOp>,
    mutations: usize,
}

impl TcState {
    fn check(&self, op: TcOp) -> HostResult<()> {
        if self.fail_on == Some(op) {
            return Err(HostError::CommandFailed {
                program: "tc".to_string(),
                status: "exit status: 2".to_string(),
                stderr: format!("injected {:?} failure", op),
            });
        }
        Ok(())
    }

    fn tree(&mut self, interface: &str) -> &mut RuleTree {
        self.trees.entry(interface.to_string()).or_default()
    }
}

fn rejected(reason: &str) -> HostError {
    HostError::CommandFailed {
        program: "tc".to_string(),
        status: "exit status: 2".to_string(),
        stderr: reason.to_string(),
    }
}

/// Traffic control that keeps one [`RuleTree`] per interface and enforces
/// the same structural rules the kernel does.
pub struct MemoryTc {
    interfaces: Vec<String>,
    tool: bool,
    state: Mutex<TcState>,
}

impl MemoryTc {
    pub fn with_interfaces(interfaces: &[&str]) -> Self {
        Self {
            interfaces: interfaces.iter().map(|name| name.to_string()).collect(),
            tool: true,
            state: Mutex::new(TcState::default()),
        }
    }

    pub fn without_tool(mut self) -> Self {
        self.tool = false;
        self
    }

    pub fn fail_on(&self, op: TcOp) {
        locked(&self.state).fail_on = Some(op);
    }

    /// The installed tree, or `None` when the interface has no root qdisc.
    pub fn tree(&self, interface: &str) -> Option<RuleTree> {
        locked(&self.state)
            .trees
            .get(interface)
            .filter(|tree| tree.root.is_some())
            .cloned()
    }

    /// Install a tree as if another tool had put it there.
    pub fn preinstall(&self, interface: &str, tree: RuleTree) {
        locked(&self.state)
            .trees
            .insert(interface.to_string(), tree);
    }

    /// Number of successful add/clear operations.
    pub fn mutations(&self) -> usize {
        locked(&self.state).mutations
    }
}

impl TrafficControl for MemoryTc {
    fn tool_available(&self) -> bool {
        self.tool
    }

    fn interface_exists(&self, interface: &str) -> bool {
        self.interfaces.iter().any(|name| name == interface)
    }

    fn has_root_qdisc(&self, interface: &str) -> HostResult<bool> {
        let state = locked(&self.state);
        state.check(TcOp::Show)?;
        Ok(state
            .trees
            .get(interface)
            .is_some_and(|tree| tree.root.is_some()))
    }

    fn add_netem(
        &self,
        interface: &str,
        parent: Option<&str>,
        delay: &NetemDelay,
    ) -> HostResult<()> {
        let mut state = locked(&self.state);
        state.check(TcOp::Netem)?;
        let tree = state.tree(interface);
        match parent {
            None => {
                if tree.root.is_some() {
                    return Err(rejected("Exclusivity flag on, cannot modify"));
                }
                tree.root = Some(Qdisc::Netem(*delay));
            }
            Some(parent) => {
                let Some(Qdisc::Prio { bands, .. }) = &tree.root else {
                    return Err(rejected("Cannot find specified qdisc on specified device"));
                };
                let band: u8 = parent
                    .split_once(':')
                    .and_then(|(_, minor)| minor.parse().ok())
                    .unwrap_or(0);
                if band == 0 || band > *bands {
                    return Err(rejected("Invalid class handle"));
                }
                if tree.children.iter().any(|(existing, _)| existing == parent) {
                    return Err(rejected("Exclusivity flag on, cannot modify"));
                }
                tree.children.push((parent.to_string(), *delay));
            }
        }
        state.mutations += 1;
        Ok(())
    }

    fn add_prio(&self, interface: &str, handle: &str, bands: u8) -> HostResult<()> {
        let mut state = locked(&self.state);
        state.check(TcOp::Prio)?;
        let tree = state.tree(interface);
        if tree.root.is_some() {
            return Err(rejected("Exclusivity flag on, cannot modify"));
        }
        tree.root = Some(Qdisc::Prio {
            handle: handle.to_string(),
            bands,
        });
        state.mutations += 1;
        Ok(())
    }

    fn add_filter(&self, interface: &str, flowid: &str, flow: &FlowMatch) -> HostResult<()> {
        let mut state = locked(&self.state);
        state.check(TcOp::Filter)?;
        let tree = state.tree(interface);
        if !matches!(tree.root, Some(Qdisc::Prio { .. })) {
            return Err(rejected("Cannot find specified qdisc on specified device"));
        }
        tree.filters.push((flowid.to_string(), flow.clone()));
        state.mutations += 1;
        Ok(())
    }

    fn clear(&self, interface: &str) -> HostResult<()> {
        let mut state = locked(&self.state);
        state.check(TcOp::Clear)?;
        let had_root = state
            .trees
            .remove(interface)
            .is_some_and(|tree| tree.root.is_some());
        if !had_root {
            return Err(rejected("Cannot delete qdisc with handle of zero"));
        }
        state.mutations += 1;
        Ok(())
    }
}
