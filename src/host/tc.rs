// SPDX-License-Identifier: PMPL-1.0-or-later

//! Traffic control through the `tc` command line tool.

use super::{find_program, run, TrafficControl};
use crate::error::HostResult;
use crate::units::{IpMatch, PortMatch};
use std::path::Path;
use std::time::Duration;

/// Kernel-provided root qdiscs; their presence does not mean a rule tree was
/// installed by anyone.
const DEFAULT_ROOT_QDISCS: &[&str] = &["noqueue", "pfifo_fast", "mq", "fq_codel", "pfifo"];

/// Bands 0..=2 only, so the fourth band is reachable solely through filters.
const PRIOMAP: [&str; 16] = [
    "1", "2", "2", "2", "1", "2", "0", "0", "1", "1", "1", "1", "1", "1", "1", "1",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetemDelay {
    pub latency: Duration,
    pub jitter: Duration,
}

impl NetemDelay {
    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "netem".to_string(),
            "delay".to_string(),
            format!("{}us", self.latency.as_micros()),
        ];
        if !self.jitter.is_zero() {
            args.push(format!("{}us", self.jitter.as_micros()));
        }
        args
    }
}

/// Filter conditions; an empty dimension matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlowMatch {
    pub src_ip: Vec<IpMatch>,
    pub dst_ip: Vec<IpMatch>,
    pub src_port: Vec<PortMatch>,
    pub dst_port: Vec<PortMatch>,
}

impl FlowMatch {
    pub fn is_empty(&self) -> bool {
        self.src_ip.is_empty()
            && self.dst_ip.is_empty()
            && self.src_port.is_empty()
            && self.dst_port.is_empty()
    }
}

pub struct TcCli {
    program: String,
}

impl TcCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn tc(&self, args: Vec<String>) -> HostResult<String> {
        let output = run(&self.program, &args)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl TrafficControl for TcCli {
    fn tool_available(&self) -> bool {
        find_program(&self.program).is_some()
    }

    fn interface_exists(&self, interface: &str) -> bool {
        !interface.contains('/') && Path::new("/sys/class/net").join(interface).exists()
    }

    fn has_root_qdisc(&self, interface: &str) -> HostResult<bool> {
        let listing = self.tc(strings(&["qdisc", "show", "dev", interface]))?;
        Ok(listing_has_custom_root(&listing))
    }

    fn add_netem(
        &self,
        interface: &str,
        parent: Option<&str>,
        delay: &NetemDelay,
    ) -> HostResult<()> {
        self.tc(netem_args(interface, parent, delay)).map(drop)
    }

    fn add_prio(&self, interface: &str, handle: &str, bands: u8) -> HostResult<()> {
        self.tc(prio_args(interface, handle, bands)).map(drop)
    }

    fn add_filter(&self, interface: &str, flowid: &str, flow: &FlowMatch) -> HostResult<()> {
        for args in filter_args(interface, flowid, flow) {
            self.tc(args)?;
        }
        Ok(())
    }

    fn clear(&self, interface: &str) -> HostResult<()> {
        self.tc(strings(&["qdisc", "del", "dev", interface, "root"]))
            .map(drop)
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

fn listing_has_custom_root(listing: &str) -> bool {
    listing.lines().any(|line| {
        let mut fields = line.split_whitespace();
        if fields.next() != Some("qdisc") {
            return false;
        }
        let kind = fields.next().unwrap_or_default();
        let is_root = line.split_whitespace().any(|field| field == "root");
        is_root && !DEFAULT_ROOT_QDISCS.contains(&kind)
    })
}

fn netem_args(interface: &str, parent: Option<&str>, delay: &NetemDelay) -> Vec<String> {
    let mut args = strings(&["qdisc", "add", "dev", interface]);
    match parent {
        Some(parent) => args.extend(strings(&["parent", parent])),
        None => args.push("root".to_string()),
    }
    args.extend(delay.args());
    args
}

fn prio_args(interface: &str, handle: &str, bands: u8) -> Vec<String> {
    let mut args = strings(&["qdisc", "add", "dev", interface, "root", "handle", handle]);
    args.extend(strings(&["prio", "bands"]));
    args.push(bands.to_string());
    args.push("priomap".to_string());
    args.extend(strings(&PRIOMAP));
    args
}

/// One `u32` rule per combination of the supplied dimensions; u32 matches
/// inside a rule are ANDed, separate rules are ORed.
fn filter_args(interface: &str, flowid: &str, flow: &FlowMatch) -> Vec<Vec<String>> {
    let parent = match flowid.split_once(':') {
        Some((major, _)) => format!("{}:", major),
        None => "1:".to_string(),
    };

    let src_ip = optional(&flow.src_ip);
    let dst_ip = optional(&flow.dst_ip);
    let src_port = optional(&flow.src_port);
    let dst_port = optional(&flow.dst_port);

    let mut rules = Vec::new();
    for sip in &src_ip {
        for dip in &dst_ip {
            for sport in &src_port {
                for dport in &dst_port {
                    let mut args = strings(&["filter", "add", "dev", interface, "parent"]);
                    args.push(parent.clone());
                    args.extend(strings(&["protocol", "ip", "prio", "1", "u32"]));
                    if let Some(ip) = sip {
                        args.extend(ip_match("src", ip));
                    }
                    if let Some(ip) = dip {
                        args.extend(ip_match("dst", ip));
                    }
                    if let Some(port) = sport {
                        args.extend(port_match("sport", port));
                    }
                    if let Some(port) = dport {
                        args.extend(port_match("dport", port));
                    }
                    args.extend(strings(&["flowid", flowid]));
                    rules.push(args);
                }
            }
        }
    }
    rules
}

fn optional<T>(items: &[T]) -> Vec<Option<&T>> {
    if items.is_empty() {
        vec![None]
    } else {
        items.iter().map(Some).collect()
    }
}

fn ip_match(direction: &str, ip: &IpMatch) -> Vec<String> {
    vec![
        "match".to_string(),
        "ip".to_string(),
        direction.to_string(),
        ip.to_string(),
    ]
}

fn port_match(direction: &str, port: &PortMatch) -> Vec<String> {
    vec![
        "match".to_string(),
        "ip".to_string(),
        direction.to_string(),
        port.port.to_string(),
        format!("0x{:04x}", port.mask()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::{parse_ip_list, parse_port_list};

    #[test]
    fn netem_at_root_or_under_class() {
        let delay = NetemDelay {
            latency: Duration::from_millis(100),
            jitter: Duration::ZERO,
        };
        assert_eq!(
            netem_args("eth0", None, &delay).join(" "),
            "qdisc add dev eth0 root netem delay 100000us"
        );

        let delay = NetemDelay {
            latency: Duration::from_millis(50),
            jitter: Duration::from_millis(5),
        };
        assert_eq!(
            netem_args("eth0", Some("1:4"), &delay).join(" "),
            "qdisc add dev eth0 parent 1:4 netem delay 50000us 5000us"
        );
    }

    #[test]
    fn prio_keeps_fourth_band_out_of_priomap() {
        let args = prio_args("eth0", "1:", 4);
        assert_eq!(&args[..9].join(" "), "qdisc add dev eth0 root handle 1: prio bands");
        assert_eq!(args[9], "4");
        assert!(args[11..].iter().all(|band| band != "3"));
    }

    #[test]
    fn filter_expands_cartesian_product() {
        let flow = FlowMatch {
            dst_ip: parse_ip_list("10.0.0.1,10.0.1.0/24").unwrap(),
            dst_port: parse_port_list("22,80").unwrap(),
            ..FlowMatch::default()
        };
        let rules = filter_args("eth0", "1:4", &flow);
        assert_eq!(rules.len(), 4);
        assert_eq!(
            rules[0].join(" "),
            "filter add dev eth0 parent 1: protocol ip prio 1 u32 \
             match ip dst 10.0.0.1/32 match ip dport 22 0xffff flowid 1:4"
        );
    }

    #[test]
    fn default_root_qdiscs_are_not_rule_trees() {
        assert!(!listing_has_custom_root(
            "qdisc noqueue 0: root refcnt 2\n"
        ));
        assert!(!listing_has_custom_root(
            "qdisc fq_codel 0: root refcnt 2 limit 10240p flows 1024\n"
        ));
        assert!(listing_has_custom_root(
            "qdisc netem 8001: root refcnt 2 limit 1000 delay 100ms\n"
        ));
        assert!(listing_has_custom_root(
            "qdisc prio 1: root refcnt 2 bands 4\nqdisc netem 8002: parent 1:4 limit 1000\n"
        ));
    }
}
