// SPDX-License-Identifier: PMPL-1.0-or-later

//! Parsers for the value strings faults accept on the command line:
//! block sizes, time values, timeouts, IP and port filter lists.

use regex::Regex;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{value:?}: {reason}")]
pub struct UnitError {
    pub value: String,
    pub reason: String,
}

impl UnitError {
    fn new(value: &str, reason: impl Into<String>) -> Self {
        Self {
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

fn value_unit_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d+)\s*([A-Za-z]*)$").expect("value/unit pattern compiles")
    })
}

fn split_value_unit(raw: &str) -> Result<(u64, String), UnitError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(UnitError::new(raw, "value is empty"));
    }
    let caps = value_unit_pattern()
        .captures(trimmed)
        .ok_or_else(|| UnitError::new(raw, "expected <number>[unit]"))?;
    let value: u64 = caps[1]
        .parse()
        .map_err(|_| UnitError::new(raw, "number out of range"))?;
    Ok((value, caps[2].to_ascii_lowercase()))
}

/// Parse a block size such as `512`, `512KB` or `4M` into kilobytes.
/// A bare number is taken as KB.
pub fn parse_block_kbytes(raw: &str) -> Result<u64, UnitError> {
    let (value, unit) = split_value_unit(raw)?;
    let factor = match unit.as_str() {
        "" | "k" | "kb" => 1,
        "m" | "mb" => 1024,
        other => {
            return Err(UnitError::new(
                raw,
                format!("unsupported unit \"{}\", support: KB, MB", other),
            ))
        }
    };
    value
        .checked_mul(factor)
        .ok_or_else(|| UnitError::new(raw, "block size overflows"))
}

/// Parse a traffic-control time value (`100ms`, `1s`, `250us`).
/// A bare number is taken as microseconds, matching `tc`.
pub fn parse_time_value(raw: &str) -> Result<Duration, UnitError> {
    let (value, unit) = split_value_unit(raw)?;
    match unit.as_str() {
        "" | "us" => Ok(Duration::from_micros(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        other => Err(UnitError::new(
            raw,
            format!("unsupported unit \"{}\", support: s, ms, us", other),
        )),
    }
}

/// Parse a fault timeout (`30`, `90s`, `5m`, `2h`, `1d`). A bare number is
/// taken as seconds.
pub fn parse_timeout(raw: &str) -> Result<Duration, UnitError> {
    let (value, unit) = split_value_unit(raw)?;
    let secs = match unit.as_str() {
        "us" => return Ok(Duration::from_micros(value)),
        "ms" => return Ok(Duration::from_millis(value)),
        "" | "s" => Some(value),
        "m" => value.checked_mul(60),
        "h" => value.checked_mul(3_600),
        "d" => value.checked_mul(86_400),
        other => {
            return Err(UnitError::new(
                raw,
                format!("unsupported unit \"{}\", support: us, ms, s, m, h, d", other),
            ))
        }
    };
    secs.map(Duration::from_secs)
        .ok_or_else(|| UnitError::new(raw, "timeout overflows"))
}

/// An IPv4 address or network used as a filter condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpMatch {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl fmt::Display for IpMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// A port, optionally widened by a prefix over the 16-bit port space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMatch {
    pub port: u16,
    pub prefix: u8,
}

impl PortMatch {
    pub fn mask(&self) -> u16 {
        if self.prefix == 0 {
            0
        } else {
            u16::MAX << (16 - u32::from(self.prefix))
        }
    }
}

/// Parse `10.10.0.0/16,192.168.2.5` into a list of IP matches.
pub fn parse_ip_list(raw: &str) -> Result<Vec<IpMatch>, UnitError> {
    split_list(raw)?
        .into_iter()
        .map(|item| {
            let (addr, prefix) = match item.split_once('/') {
                Some((addr, prefix)) => {
                    let prefix: u8 = prefix
                        .parse()
                        .map_err(|_| UnitError::new(item, "invalid prefix length"))?;
                    if prefix > 32 {
                        return Err(UnitError::new(item, "prefix length must be in [0, 32]"));
                    }
                    (addr, prefix)
                }
                None => (item, 32),
            };
            let addr: Ipv4Addr = addr
                .parse()
                .map_err(|_| UnitError::new(item, "invalid IPv4 address"))?;
            Ok(IpMatch { addr, prefix })
        })
        .collect()
}

/// Parse `8080,9090,12000/8` into a list of port matches.
pub fn parse_port_list(raw: &str) -> Result<Vec<PortMatch>, UnitError> {
    split_list(raw)?
        .into_iter()
        .map(|item| {
            let (port, prefix) = match item.split_once('/') {
                Some((port, prefix)) => {
                    let prefix: u8 = prefix
                        .parse()
                        .map_err(|_| UnitError::new(item, "invalid port prefix"))?;
                    if prefix > 16 {
                        return Err(UnitError::new(item, "port prefix must be in [0, 16]"));
                    }
                    (port, prefix)
                }
                None => (item, 16),
            };
            let port: u16 = port
                .parse()
                .map_err(|_| UnitError::new(item, "port must be in [0, 65535]"))?;
            Ok(PortMatch { port, prefix })
        })
        .collect()
}

fn split_list(raw: &str) -> Result<Vec<&str>, UnitError> {
    let items: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect();
    if items.is_empty() {
        return Err(UnitError::new(raw, "list is empty"));
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_sizes_default_to_kilobytes() {
        assert_eq!(parse_block_kbytes("512").unwrap(), 512);
        assert_eq!(parse_block_kbytes("512KB").unwrap(), 512);
        assert_eq!(parse_block_kbytes("4M").unwrap(), 4096);
        assert_eq!(parse_block_kbytes("4mb").unwrap(), 4096);
        assert!(parse_block_kbytes("4GB").is_err());
        assert!(parse_block_kbytes("-4").is_err());
        assert!(parse_block_kbytes("").is_err());
    }

    #[test]
    fn time_values_follow_tc_units() {
        assert_eq!(parse_time_value("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_time_value("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_time_value("250").unwrap(), Duration::from_micros(250));
        assert!(parse_time_value("5m").is_err());
        assert!(parse_time_value("fast").is_err());
    }

    #[test]
    fn timeouts_default_to_seconds() {
        assert_eq!(parse_timeout("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_timeout("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_timeout("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_timeout("1w").is_err());
    }

    #[test]
    fn ip_lists_accept_hosts_and_networks() {
        let list = parse_ip_list("10.10.0.0/16, 192.168.2.5").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].prefix, 16);
        assert_eq!(list[1].prefix, 32);
        assert_eq!(list[1].to_string(), "192.168.2.5/32");
        assert!(parse_ip_list("10.0.0.0/33").is_err());
        assert!(parse_ip_list("300.1.1.1").is_err());
        assert!(parse_ip_list(" , ").is_err());
    }

    #[test]
    fn port_lists_carry_masks() {
        let list = parse_port_list("22,12000/8").unwrap();
        assert_eq!(list[0].mask(), 0xffff);
        assert_eq!(list[1].mask(), 0xff00);
        assert!(parse_port_list("70000").is_err());
        assert!(parse_port_list("80/17").is_err());
    }
}
