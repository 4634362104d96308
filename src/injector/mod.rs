// SPDX-License-Identifier: PMPL-1.0-or-later

//! Injector lifecycle: create, default, validate, inject, recover.
//!
//! Every fault type implements [`Injector`] and embeds a [`BaseInjector`]
//! for its identity and the recover-once guard. Recovery is always derived
//! from the uid and the fault arguments, never from a record of what inject
//! did, so a fresh process holding only those two can undo a fault.

pub mod diskio;
pub mod network;
pub mod registry;

pub use registry::Registry;

use crate::error::{FaultError, FaultResult};
use crate::host::Host;
use crate::units;
use clap::{ArgMatches, Command};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultDomain {
    Diskio,
    Network,
}

impl FaultDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultDomain::Diskio => "diskio",
            FaultDomain::Network => "network",
        }
    }
}

impl fmt::Display for FaultDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaultDomain {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "diskio" => Ok(FaultDomain::Diskio),
            "network" => Ok(FaultDomain::Network),
            other => Err(format!("unknown fault domain \"{}\"", other)),
        }
    }
}

/// Identity of one fault instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default)]
    pub created_at: String,
}

impl Info {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }
}

/// State shared by every injector.
#[derive(Debug, Clone, Default)]
pub struct BaseInjector {
    pub info: Info,
    recovered: bool,
}

impl BaseInjector {
    pub fn new(info: Info) -> Self {
        Self {
            info,
            recovered: false,
        }
    }

    pub fn set_default(&mut self) {
        if self.info.uid.is_empty() {
            self.info.uid = generate_uid();
        }
        if self.info.created_at.is_empty() {
            self.info.created_at = chrono::Utc::now().to_rfc3339();
        }
        if self
            .info
            .timeout
            .as_deref()
            .is_some_and(|timeout| timeout.trim().is_empty())
        {
            self.info.timeout = None;
        }
    }

    pub fn validate(&self) -> FaultResult<()> {
        let uid = &self.info.uid;
        if uid.is_empty() {
            return Err(FaultError::validation("uid", "is empty"));
        }
        if !uid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(FaultError::validation(
                "uid",
                format!("[{}] may only contain [A-Za-z0-9_-]", uid),
            ));
        }
        if let Some(timeout) = &self.info.timeout {
            let parsed = units::parse_timeout(timeout).map_err(|err| {
                FaultError::validation("timeout", format!("[{}] is invalid: {}", timeout, err))
            })?;
            if parsed.as_secs() == 0 {
                return Err(FaultError::validation(
                    "timeout",
                    format!("[{}] must be at least 1s", timeout),
                ));
            }
        }
        Ok(())
    }

    /// Whole seconds of the timeout, or 0 when none was given.
    pub fn timeout_secs(&self) -> u64 {
        self.info
            .timeout
            .as_deref()
            .and_then(|timeout| units::parse_timeout(timeout).ok())
            .map(|timeout| timeout.as_secs())
            .unwrap_or(0)
    }

    pub fn is_recovered(&self) -> bool {
        self.recovered
    }

    /// Run `undo` unless this instance was already recovered. The instance
    /// is only marked recovered once `undo` succeeds, so a failed recovery
    /// can be retried by calling again.
    pub fn recover_once<F>(&mut self, undo: F) -> FaultResult<()>
    where
        F: FnOnce(&Info) -> FaultResult<()>,
    {
        if self.recovered {
            log::debug!("uid={} already recovered", self.info.uid);
            return Ok(());
        }
        undo(&self.info)?;
        self.recovered = true;
        Ok(())
    }
}

/// Sixteen hex characters from the OS random source.
pub fn generate_uid() -> String {
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        // Extremely unlikely; fall back to something still unique per process.
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        bytes = (nanos as u64 ^ u64::from(std::process::id())).to_be_bytes();
    }
    hex::encode(bytes)
}

/// The capability set every fault type provides.
pub trait Injector: Send {
    fn domain(&self) -> FaultDomain;

    fn fault(&self) -> &'static str;

    fn base(&self) -> &BaseInjector;

    fn info(&self) -> &Info {
        &self.base().info
    }

    /// Fault arguments as JSON.
    fn args(&self) -> Value;

    /// Replace the fault arguments from their JSON form.
    fn load_args(&mut self, args: Value) -> FaultResult<()>;

    /// Runtime state as JSON; empty for faults that keep none.
    fn runtime(&self) -> Value {
        Value::Object(Default::default())
    }

    fn set_default(&mut self);

    /// Declare the fault's command line flags.
    fn set_option(&self, cmd: Command) -> Command;

    /// Copy flags declared by [`Injector::set_option`] into the arguments.
    fn bind_options(&mut self, matches: &ArgMatches);

    fn validate(&self) -> FaultResult<()>;

    fn inject(&mut self) -> FaultResult<()>;

    /// Arrange for [`Injector::recover`] to run after `timeout_secs`, in a
    /// detached agent process that outlives the caller.
    fn delay_recover(&mut self, timeout_secs: u64) -> FaultResult<()> {
        schedule_recover(self.host(), self.domain(), self.fault(), self.info(), &self.args(), timeout_secs)
    }

    fn recover(&mut self) -> FaultResult<()>;

    fn host(&self) -> &Host;
}

/// Spawn `<agent> recover <domain> <fault> --uid <uid> --args <json> --after <secs>`.
pub fn schedule_recover(
    host: &Host,
    domain: FaultDomain,
    fault: &str,
    info: &Info,
    args: &Value,
    timeout_secs: u64,
) -> FaultResult<()> {
    let argv = vec![
        "recover".to_string(),
        domain.to_string(),
        fault.to_string(),
        "--uid".to_string(),
        info.uid.clone(),
        "--args".to_string(),
        args.to_string(),
        "--after".to_string(),
        timeout_secs.to_string(),
    ];
    let pid = host
        .processes
        .spawn_detached(&host.agent, &argv)
        .map_err(|err| FaultError::Injection(format!("schedule recover error: {}", err)))?;
    log::info!(
        "uid={} recover scheduled in {}s (pid {})",
        info.uid,
        timeout_secs,
        pid
    );
    Ok(())
}

/// Log a failed self-undo and hand back the original inject error.
pub(crate) fn undo_and_fail(injector: &mut dyn Injector, err: FaultError) -> FaultError {
    if let Err(undo_err) = injector.recover() {
        log::warn!("uid={} undo error: {}", injector.info().uid, undo_err);
    }
    err
}
