// SPDX-License-Identifier: PMPL-1.0-or-later

//! Network delay: add latency to egress traffic with a tc rule tree.
//!
//! Without filter conditions a single netem qdisc sits at the interface
//! root. With conditions the tree is:
//!
//! ```text
//! prio 1: (bands 4, priomap never selects 1:4)
//!   ├── 1:1 ─┐
//!   ├── 1:2  ├── netem in exclude mode
//!   ├── 1:3 ─┘
//!   └── 1:4 ──── netem in normal mode
//! filter: matched traffic -> 1:4
//! ```
//!
//! Only one tree is owned per interface, so recovery clears the whole root.

use super::{undo_and_fail, BaseInjector, FaultDomain, Info, Injector, Registry};
use crate::error::{FaultError, FaultResult};
use crate::host::{FlowMatch, Host, NetemDelay, TrafficControl};
use crate::units;
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const FAULT_DELAY: &str = "delay";

pub const DIRECTION_OUT: &str = "out";
pub const MODE_NORMAL: &str = "normal";
pub const MODE_EXCLUDE: &str = "exclude";

pub const PRIO_HANDLE: &str = "1:";
pub const PRIO_BANDS: u8 = 4;
/// Band reserved for filtered traffic.
pub const FILTER_BAND: &str = "1:4";

pub fn register(registry: &mut Registry) {
    registry.register(FaultDomain::Network, FAULT_DELAY, construct);
}

fn construct(info: Info, host: Host) -> Box<dyn Injector> {
    Box::new(DelayInjector::new(info, host))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayArgs {
    #[serde(default)]
    pub interface: String,
    #[serde(default)]
    pub latency: String,
    #[serde(default)]
    pub jitter: String,
    #[serde(default)]
    pub direction: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub src_ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dst_ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub src_port: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dst_port: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force: bool,
}

impl DelayArgs {
    pub fn has_filter(&self) -> bool {
        !(self.src_ip.is_empty()
            && self.dst_ip.is_empty()
            && self.src_port.is_empty()
            && self.dst_port.is_empty())
    }
}

pub struct DelayInjector {
    base: BaseInjector,
    pub args: DelayArgs,
    host: Host,
}

impl DelayInjector {
    pub fn new(info: Info, host: Host) -> Self {
        Self {
            base: BaseInjector::new(info),
            args: DelayArgs::default(),
            host,
        }
    }

    fn netem_delay(&self) -> FaultResult<NetemDelay> {
        let latency = units::parse_time_value(&self.args.latency).map_err(|err| {
            FaultError::validation("latency", format!("[{}] is invalid: {}", self.args.latency, err))
        })?;
        let jitter = if self.args.jitter.is_empty() {
            Duration::ZERO
        } else {
            units::parse_time_value(&self.args.jitter).map_err(|err| {
                FaultError::validation("jitter", format!("[{}] is invalid: {}", self.args.jitter, err))
            })?
        };
        Ok(NetemDelay { latency, jitter })
    }

    fn flow_match(&self) -> FaultResult<FlowMatch> {
        let mut flow = FlowMatch::default();
        if !self.args.src_ip.is_empty() {
            flow.src_ip = parse_ips("src-ip", &self.args.src_ip)?;
        }
        if !self.args.dst_ip.is_empty() {
            flow.dst_ip = parse_ips("dst-ip", &self.args.dst_ip)?;
        }
        if !self.args.src_port.is_empty() {
            flow.src_port = parse_ports("src-port", &self.args.src_port)?;
        }
        if !self.args.dst_port.is_empty() {
            flow.dst_port = parse_ports("dst-port", &self.args.dst_port)?;
        }
        Ok(flow)
    }

    /// Netem parents for the filtered tree.
    fn delayed_bands(&self) -> Vec<String> {
        if self.args.mode == MODE_EXCLUDE {
            (1..PRIO_BANDS).map(|band| format!("1:{}", band)).collect()
        } else {
            vec![FILTER_BAND.to_string()]
        }
    }

    fn build_tree(
        &self,
        network: &dyn TrafficControl,
        delay: &NetemDelay,
        flow: &FlowMatch,
    ) -> FaultResult<()> {
        let interface = &self.args.interface;

        if flow.is_empty() {
            return network.add_netem(interface, None, delay).map_err(|err| {
                FaultError::Injection(format!("add root netem qdisc for {} error: {}", interface, err))
            });
        }

        network
            .add_prio(interface, PRIO_HANDLE, PRIO_BANDS)
            .map_err(|err| {
                FaultError::Injection(format!("add root prio qdisc for {} error: {}", interface, err))
            })?;

        for parent in self.delayed_bands() {
            network
                .add_netem(interface, Some(&parent), delay)
                .map_err(|err| {
                    FaultError::Injection(format!(
                        "add parent {} netem qdisc for {} error: {}",
                        parent, interface, err
                    ))
                })?;
        }

        network
            .add_filter(interface, FILTER_BAND, flow)
            .map_err(|err| {
                FaultError::Injection(format!("add filter for {} error: {}", interface, err))
            })
    }
}

fn parse_ips(arg: &'static str, raw: &str) -> FaultResult<Vec<units::IpMatch>> {
    units::parse_ip_list(raw)
        .map_err(|err| FaultError::validation(arg, format!("[{}] is invalid: {}", raw, err)))
}

fn parse_ports(arg: &'static str, raw: &str) -> FaultResult<Vec<units::PortMatch>> {
    units::parse_port_list(raw)
        .map_err(|err| FaultError::validation(arg, format!("[{}] is invalid: {}", raw, err)))
}

impl Injector for DelayInjector {
    fn domain(&self) -> FaultDomain {
        FaultDomain::Network
    }

    fn fault(&self) -> &'static str {
        FAULT_DELAY
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

    fn set_default(&mut self) {
        self.base.set_default();

        if self.args.direction.is_empty() {
            self.args.direction = DIRECTION_OUT.to_string();
        }
        if self.args.mode.is_empty() {
            self.args.mode = MODE_NORMAL.to_string();
        }
    }

    fn set_option(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("latency")
                .short('l')
                .long("latency")
                .help("delay time value, support unit: \"s, ms, us\" (default us)"),
        )
        .arg(
            Arg::new("jitter")
                .short('j')
                .long("jitter")
                .help("jitter time value, support unit: \"s, ms, us\" (default us)"),
        )
        .arg(Arg::new("direction").short('d').long("direction").help(format!(
            "flow direction to inject, support: {} (default {})",
            DIRECTION_OUT, DIRECTION_OUT
        )))
        .arg(Arg::new("mode").short('m').long("mode").help(format!(
            "inject mode, support: {} (default), {} (whitelist: delay everything except the filter match)",
            MODE_NORMAL, MODE_EXCLUDE
        )))
        .arg(
            Arg::new("force")
                .short('f')
                .long("force")
                .action(ArgAction::SetTrue)
                .help("overwrite the existing tc rule tree on the interface"),
        )
        .arg(
            Arg::new("interface")
                .short('i')
                .long("interface")
                .help("network interface to inject, eg: eth0"),
        )
        .arg(
            Arg::new("src-ip")
                .long("src-ip")
                .help("filter condition: source ip, eg: 10.10.0.0/16,192.168.2.5"),
        )
        .arg(
            Arg::new("dst-ip")
                .long("dst-ip")
                .help("filter condition: destination ip, eg: 10.10.0.0/16,192.168.2.5"),
        )
        .arg(
            Arg::new("src-port")
                .long("src-port")
                .help("filter condition: source port, eg: 8080,9090,12000/8"),
        )
        .arg(
            Arg::new("dst-port")
                .long("dst-port")
                .help("filter condition: destination port, eg: 8080,9090,12000/8"),
        )
    }

    fn bind_options(&mut self, matches: &ArgMatches) {
        let fields: [(&str, &mut String); 9] = [
            ("latency", &mut self.args.latency),
            ("jitter", &mut self.args.jitter),
            ("direction", &mut self.args.direction),
            ("mode", &mut self.args.mode),
            ("interface", &mut self.args.interface),
            ("src-ip", &mut self.args.src_ip),
            ("dst-ip", &mut self.args.dst_ip),
            ("src-port", &mut self.args.src_port),
            ("dst-port", &mut self.args.dst_port),
        ];
        for (id, field) in fields {
            if let Some(value) = matches.get_one::<String>(id) {
                *field = value.clone();
            }
        }
        if matches.get_flag("force") {
            self.args.force = true;
        }
    }

    /// Only one tc network fault can be active on an interface at a time.
    fn validate(&self) -> FaultResult<()> {
        let network = &self.host.network;

        if !network.tool_available() {
            return Err(FaultError::validation("tc", "command not found"));
        }

        let interface = &self.args.interface;
        if interface.is_empty() {
            return Err(FaultError::validation("interface", "is empty"));
        }
        if !network.interface_exists(interface) {
            return Err(FaultError::validation(
                "interface",
                format!("[{}] does not exist", interface),
            ));
        }

        if self.args.latency.is_empty() {
            return Err(FaultError::validation("latency", "must be provided"));
        }
        self.netem_delay()?;

        if self.args.direction != DIRECTION_OUT {
            return Err(FaultError::validation(
                "direction",
                format!("only support: {}", DIRECTION_OUT),
            ));
        }

        if self.args.mode != MODE_NORMAL && self.args.mode != MODE_EXCLUDE {
            return Err(FaultError::validation(
                "mode",
                format!(
                    "not support {}, only support: {}, {}",
                    self.args.mode, MODE_NORMAL, MODE_EXCLUDE
                ),
            ));
        }

        self.flow_match()?;

        let exist = network.has_root_qdisc(interface).map_err(|err| {
            FaultError::validation("interface", format!("check tc rule error: {}", err))
        })?;
        if exist && !self.args.force {
            return Err(FaultError::validation(
                "interface",
                format!(
                    "[{}] has another tc root rule, provide [-f] or [--force] to overwrite it",
                    interface
                ),
            ));
        }

        self.base.validate()
    }

    fn inject(&mut self) -> FaultResult<()> {
        let network = Arc::clone(&self.host.network);
        let interface = self.args.interface.clone();

        let replace = self.args.force
            && network.has_root_qdisc(&interface).map_err(|err| {
                FaultError::Injection(format!("check tc rule for {} error: {}", interface, err))
            })?;
        if replace {
            network.clear(&interface).map_err(|err| {
                FaultError::Injection(format!("reset tc rule for {} error: {}", interface, err))
            })?;
        }

        let delay = self
            .netem_delay()
            .map_err(|err| FaultError::Injection(err.to_string()))?;
        let flow = self
            .flow_match()
            .map_err(|err| FaultError::Injection(err.to_string()))?;

        if let Err(err) = self.build_tree(network.as_ref(), &delay, &flow) {
            return Err(undo_and_fail(self, err));
        }

        log::info!(
            "uid={} delay {:?} (jitter {:?}) injected on {} ({}, filtered: {})",
            self.base.info.uid,
            delay.latency,
            delay.jitter,
            interface,
            self.args.mode,
            !flow.is_empty()
        );
        Ok(())
    }

    /// tc rules persist until explicitly cleared; there is no timed expiry.
    fn delay_recover(&mut self, _timeout_secs: u64) -> FaultResult<()> {
        Ok(())
    }

    fn recover(&mut self) -> FaultResult<()> {
        let Self { base, args, host } = self;
        let interface = &args.interface;

        base.recover_once(|info| {
            let exist = host.network.has_root_qdisc(interface).map_err(|err| {
                FaultError::Recovery(format!("check tc rule exist error: {}", err))
            })?;
            if exist {
                host.network.clear(interface).map_err(|err| {
                    FaultError::Recovery(format!("clear tc rule for {} error: {}", interface, err))
                })?;
            }
            log::info!("uid={} delay on {} recovered", info.uid, interface);
            Ok(())
        })
    }
}
