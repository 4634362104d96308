// SPDX-License-Identifier: PMPL-1.0-or-later

//! chaosmeta_diskburn: keep a device busy with direct I/O through `dd`.
//!
//! Usage: `chaosmeta_diskburn <uid> <file> <read|write> <block> <count> <flag> <timeout-secs>`
//!
//! The uid is not used for the I/O itself; it sits right after the program
//! name so the agent can find this process by `chaosmeta_diskburn <uid>`.

use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

#[derive(Debug)]
struct BurnPlan {
    uid: String,
    file: PathBuf,
    mode: Mode,
    block: String,
    count: u64,
    flag: String,
    timeout: Option<Duration>,
}

impl BurnPlan {
    fn from_args(args: &[String]) -> Result<Self> {
        let [uid, file, mode, block, count, flag, timeout] = args else {
            bail!(
                "expected 7 arguments: <uid> <file> <mode> <block> <count> <flag> <timeout>, got {}",
                args.len()
            );
        };
        let mode = match mode.as_str() {
            "read" => Mode::Read,
            "write" => Mode::Write,
            other => return Err(anyhow!("unknown mode '{}'", other)),
        };
        let count: u64 = count
            .parse()
            .with_context(|| format!("invalid count '{}'", count))?;
        let timeout: u64 = timeout
            .parse()
            .with_context(|| format!("invalid timeout '{}'", timeout))?;

        Ok(Self {
            uid: uid.clone(),
            file: PathBuf::from(file),
            mode,
            block: block.clone(),
            count,
            flag: flag.clone(),
            timeout: (timeout > 0).then(|| Duration::from_secs(timeout)),
        })
    }

    fn dd_args(&self, mode: Mode, direct: bool) -> Vec<String> {
        let file = self.file.display().to_string();
        let (input, output, flag_key) = match mode {
            Mode::Write => ("/dev/zero".to_string(), file, "oflag"),
            Mode::Read => (file, "/dev/null".to_string(), "iflag"),
        };
        let mut args = vec![
            format!("if={}", input),
            format!("of={}", output),
            format!("bs={}", self.block),
            format!("count={}", self.count),
        ];
        if direct && !self.flag.is_empty() {
            args.push(format!("{}={}", flag_key, self.flag));
        }
        args
    }
}

/// Run `dd`, killing it if the deadline passes first. Returns false once the
/// deadline has been reached.
fn run_dd(args: &[String], deadline: Option<Instant>) -> Result<bool> {
    let mut child = Command::new("dd")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .context("Failed to execute dd")?;

    loop {
        if let Some(status) = child.try_wait()? {
            if !status.success() {
                let output = child.wait_with_output()?;
                bail!(
                    "dd exited with {}: {}",
                    status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            return Ok(deadline.map_or(true, |deadline| Instant::now() < deadline));
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(false);
        }
        thread::sleep(Duration::from_millis(20));
    }
}

fn burn(plan: &BurnPlan) -> Result<()> {
    let deadline = plan.timeout.map(|timeout| Instant::now() + timeout);

    if plan.mode == Mode::Read && !run_dd(&plan.dd_args(Mode::Write, false), deadline)? {
        return Ok(());
    }

    while run_dd(&plan.dd_args(plan.mode, true), deadline)? {}
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    let plan = BurnPlan::from_args(&args)?;
    log::info!(
        "uid={} burning {} ({:?}, bs={}, count={}, timeout={:?})",
        plan.uid,
        plan.file.display(),
        plan.mode,
        plan.block,
        plan.count,
        plan.timeout
    );

    let result = burn(&plan);
    if let Err(err) = fs::remove_file(&plan.file) {
        log::debug!("uid={} remove {}: {}", plan.uid, plan.file.display(), err);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn write_plan_uses_direct_output() {
        let plan = BurnPlan::from_args(&args(&[
            "abc", "/tmp/burn/f", "write", "4096K", "256", "direct", "0",
        ]))
        .unwrap();
        assert_eq!(plan.timeout, None);
        assert_eq!(
            plan.dd_args(Mode::Write, true).join(" "),
            "if=/dev/zero of=/tmp/burn/f bs=4096K count=256 oflag=direct"
        );
    }

    #[test]
    fn read_plan_reads_into_null() {
        let plan = BurnPlan::from_args(&args(&[
            "abc", "/tmp/f", "read", "1024K", "1024", "direct", "30",
        ]))
        .unwrap();
        assert_eq!(plan.timeout, Some(Duration::from_secs(30)));
        assert_eq!(
            plan.dd_args(Mode::Read, true).join(" "),
            "if=/tmp/f of=/dev/null bs=1024K count=1024 iflag=direct"
        );
        assert!(!plan.dd_args(Mode::Write, false).join(" ").contains("oflag"));
    }

    #[test]
    fn rejects_short_or_bad_argument_lists() {
        assert!(BurnPlan::from_args(&args(&["abc", "/tmp/f"])).is_err());
        assert!(BurnPlan::from_args(&args(&[
            "abc", "/tmp/f", "erase", "1K", "1", "direct", "0"
        ]))
        .is_err());
    }
}
