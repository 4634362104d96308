// SPDX-License-Identifier: PMPL-1.0-or-later

//! Process control backed by `/proc` and the `kill` utility.

use super::{argv_matches_key, run, ProcessControl, Signal};
use crate::error::{HostError, HostResult};
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// How long a freshly spawned process must survive to count as started.
const SPAWN_GRACE: Duration = Duration::from_millis(200);
const SPAWN_POLL: Duration = Duration::from_millis(20);

pub struct SystemProcesses;

impl SystemProcesses {
    fn pids_by_key(key: &str) -> HostResult<Vec<u32>> {
        let own = std::process::id();
        let mut pids = Vec::new();

        for entry in fs::read_dir("/proc")? {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            if pid == own {
                continue;
            }
            // Processes may exit between listing and reading.
            let Ok(raw) = fs::read(entry.path().join("cmdline")) else {
                continue;
            };
            if cmdline_matches(&raw, key) {
                pids.push(pid);
            }
        }

        Ok(pids)
    }

    fn leads_group(pid: u32) -> bool {
        fs::read_to_string(format!("/proc/{}/stat", pid))
            .ok()
            .and_then(|stat| process_group(&stat))
            .is_some_and(|pgrp| pgrp == pid)
    }
}

impl ProcessControl for SystemProcesses {
    fn spawn_detached(&self, program: &Path, args: &[String]) -> HostResult<u32> {
        log::debug!("spawn: {} {}", program.display(), args.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()?;

        let deadline = Instant::now() + SPAWN_GRACE;
        while Instant::now() < deadline {
            if let Some(status) = child.try_wait()? {
                if !status.success() {
                    return Err(HostError::CommandFailed {
                        program: program.display().to_string(),
                        status: status.to_string(),
                        stderr: "exited right after start".to_string(),
                    });
                }
                break;
            }
            thread::sleep(SPAWN_POLL);
        }
        Ok(child.id())
    }

    fn exists(&self, key: &str) -> HostResult<bool> {
        Ok(!Self::pids_by_key(key)?.is_empty())
    }

    fn kill(&self, key: &str, signal: Signal) -> HostResult<()> {
        for pid in Self::pids_by_key(key)? {
            // A group leader takes its children (e.g. `dd`) down with it.
            let target = if Self::leads_group(pid) {
                format!("-{}", pid)
            } else {
                pid.to_string()
            };
            let args = vec![
                "-s".to_string(),
                signal.name().to_string(),
                "--".to_string(),
                target,
            ];
            if let Err(err) = run("kill", &args) {
                if Path::new(&format!("/proc/{}", pid)).exists() {
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

fn cmdline_matches(raw: &[u8], key: &str) -> bool {
    let text = String::from_utf8_lossy(raw);
    let argv: Vec<&str> = text.split('\0').filter(|arg| !arg.is_empty()).collect();
    argv_matches_key(&argv, key)
}

/// Extract the process group id from `/proc/<pid>/stat`. The command name
/// sits in parentheses and may itself contain spaces or parentheses.
fn process_group(stat: &str) -> Option<u32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(2)?.parse().ok()
}
