// SPDX-License-Identifier: PMPL-1.0-or-later

//! Disk I/O burn: saturate a directory's device with direct reads or writes
//! from a detached helper process.

use super::{undo_and_fail, BaseInjector, FaultDomain, Info, Injector, Registry};
use crate::error::{FaultError, FaultResult};
use crate::host::{Host, Signal};
use crate::units;
use clap::{Arg, ArgMatches, Command};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

pub const FAULT_BURN: &str = "burn";

/// Name of the helper binary; `<key> <uid>` tags its command line.
pub const BURN_KEY: &str = "chaosmeta_diskburn";
pub const BURN_FILE_PREFIX: &str = "chaosmeta_diskburn";

/// Volume moved by one helper pass, in KB (1 GB).
pub const MAX_BLOCK_KBYTES: u64 = 1024 * 1024;

pub const MODE_READ: &str = "read";
pub const MODE_WRITE: &str = "write";
pub const DEFAULT_DIR: &str = "/tmp";
pub const DEFAULT_BLOCK: &str = "10MB";
pub const FLAG_DIRECT: &str = "direct";

pub fn register(registry: &mut Registry) {
    registry.register(FaultDomain::Diskio, FAULT_BURN, construct);
}

fn construct(info: Info, host: Host) -> Box<dyn Injector> {
    Box::new(BurnInjector::new(info, host))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurnArgs {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub block: String,
    #[serde(default)]
    pub dir: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BurnRuntime {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

pub struct BurnInjector {
    base: BaseInjector,
    pub args: BurnArgs,
    runtime: BurnRuntime,
    host: Host,
}

impl BurnInjector {
    pub fn new(info: Info, host: Host) -> Self {
        Self {
            base: BaseInjector::new(info),
            args: BurnArgs::default(),
            runtime: BurnRuntime::default(),
            host,
        }
    }

    pub fn burn_file(&self) -> PathBuf {
        burn_file(&self.args.dir, &self.base.info.uid)
    }

    /// Repeat count so that `count * block` covers exactly [`MAX_BLOCK_KBYTES`].
    pub fn burn_count(&self) -> FaultResult<(u64, u64)> {
        let kbytes = units::parse_block_kbytes(&self.args.block).map_err(|err| {
            FaultError::validation("block", format!("[{}] is invalid: {}", self.args.block, err))
        })?;
        if kbytes == 0 || kbytes > MAX_BLOCK_KBYTES {
            return Err(FaultError::validation(
                "block",
                format!("[{}] value must be in (0, 1G]", self.args.block),
            ));
        }
        if MAX_BLOCK_KBYTES % kbytes != 0 {
            return Err(FaultError::validation(
                "block",
                format!(
                    "[{}] must divide 1G evenly (a power of two in KB)",
                    self.args.block
                ),
            ));
        }
        Ok((kbytes, MAX_BLOCK_KBYTES / kbytes))
    }

    fn helper_args(&self, kbytes: u64, count: u64) -> Vec<String> {
        vec![
            self.base.info.uid.clone(),
            self.burn_file().display().to_string(),
            self.args.mode.clone(),
            format!("{}K", kbytes),
            count.to_string(),
            FLAG_DIRECT.to_string(),
            self.base.timeout_secs().to_string(),
        ]
    }
}

pub fn burn_file(dir: &str, uid: &str) -> PathBuf {
    PathBuf::from(format!("{}/{}_{}", dir, BURN_FILE_PREFIX, uid))
}

pub fn process_key(uid: &str) -> String {
    format!("{} {}", BURN_KEY, uid)
}

impl Injector for BurnInjector {
    fn domain(&self) -> FaultDomain {
        FaultDomain::Diskio
    }

    fn fault(&self) -> &'static str {
        FAULT_BURN
    }

    fn base(&self) -> &BaseInjector {
        &self.base
    }

    fn host(&self) -> &Host {
        &self.host
    }

    fn args(&self) -> Value {
        serde_json::to_value(&self.args).unwrap_or(Value::Null)
    }

    fn load_args(&mut self, args: Value) -> FaultResult<()> {
        self.args = serde_json::from_value(args).map_err(|err| FaultError::Args(err.to_string()))?;
        Ok(())
    }

    fn runtime(&self) -> Value {
        serde_json::to_value(&self.runtime).unwrap_or(Value::Null)
    }

    fn set_default(&mut self) {
        self.base.set_default();

        if self.args.dir.is_empty() {
            self.args.dir = DEFAULT_DIR.to_string();
        }
        if self.args.mode.is_empty() {
            self.args.mode = MODE_READ.to_string();
        }
        if self.args.block.is_empty() {
            self.args.block = DEFAULT_BLOCK.to_string();
        }
    }

    fn set_option(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .help(format!(
                    "disk IO mode, support: {}, {} (default {})",
                    MODE_READ, MODE_WRITE, MODE_READ
                )),
        )
        .arg(Arg::new("block").short('b').long("block").help(format!(
            "disk IO block size (default {}), support unit: KB/MB (default KB)",
            DEFAULT_BLOCK
        )))
        .arg(
            Arg::new("dir")
                .short('d')
                .long("dir")
                .help(format!("disk IO burn directory (default {})", DEFAULT_DIR)),
        )
    }

    fn bind_options(&mut self, matches: &ArgMatches) {
        if let Some(mode) = matches.get_one::<String>("mode") {
            self.args.mode = mode.clone();
        }
        if let Some(block) = matches.get_one::<String>("block") {
            self.args.block = block.clone();
        }
        if let Some(dir) = matches.get_one::<String>("dir") {
            self.args.dir = dir.clone();
        }
    }

    fn validate(&self) -> FaultResult<()> {
        let dir = &self.args.dir;
        if dir.is_empty() {
            return Err(FaultError::validation("dir", "is empty"));
        }
        match fs::metadata(dir) {
            Ok(meta) if !meta.is_dir() => {
                return Err(FaultError::validation(
                    "dir",
                    format!("[{}] is not a directory", dir),
                ))
            }
            Ok(meta) if meta.permissions().readonly() => {
                return Err(FaultError::validation(
                    "dir",
                    format!("[{}] is not writable", dir),
                ))
            }
            Ok(_) => {}
            Err(err) => {
                return Err(FaultError::validation(
                    "dir",
                    format!("[{}] check error: {}", dir, err),
                ))
            }
        }

        if self.args.mode != MODE_READ && self.args.mode != MODE_WRITE {
            return Err(FaultError::validation(
                "mode",
                format!(
                    "not support {}, only support: {}, {}",
                    self.args.mode, MODE_READ, MODE_WRITE
                ),
            ));
        }

        self.burn_count()?;

        self.base.validate()
    }

    fn inject(&mut self) -> FaultResult<()> {
        let (kbytes, count) = self
            .burn_count()
            .map_err(|err| FaultError::Injection(err.to_string()))?;
        let tool = self.host.tool_path(BURN_KEY);
        let argv = self.helper_args(kbytes, count);

        match self.host.processes.spawn_detached(&tool, &argv) {
            Ok(pid) => {
                log::info!(
                    "uid={} disk burn started (pid {}, {} x {}K {} on {})",
                    self.base.info.uid,
                    pid,
                    count,
                    kbytes,
                    self.args.mode,
                    self.args.dir
                );
                self.runtime.pid = Some(pid);
                Ok(())
            }
            Err(err) => {
                let err = FaultError::Injection(format!(
                    "start {} error: {}",
                    tool.display(),
                    err
                ));
                Err(undo_and_fail(self, err))
            }
        }
    }

    fn recover(&mut self) -> FaultResult<()> {
        let Self {
            base, args, host, ..
        } = self;

        base.recover_once(|info| {
            let key = process_key(&info.uid);
            let running = host.processes.exists(&key).map_err(|err| {
                FaultError::Recovery(format!("check process exist by key[{}] error: {}", key, err))
            })?;
            if running {
                host.processes.kill(&key, Signal::Kill).map_err(|err| {
                    FaultError::Recovery(format!("kill process by key[{}] error: {}", key, err))
                })?;
            }

            let file = burn_file(&args.dir, &info.uid);
            let present = file.try_exists().map_err(|err| {
                FaultError::Recovery(format!("check file[{}] exist error: {}", file.display(), err))
            })?;
            if present {
                match fs::remove_file(&file) {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => {
                        return Err(FaultError::Recovery(format!(
                            "remove file[{}] error: {}",
                            file.display(),
                            err
                        )))
                    }
                }
            }

            log::info!("uid={} disk burn recovered", info.uid);
            Ok(())
        })
    }
}
