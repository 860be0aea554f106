use std::net::IpAddr;

use anyhow::{bail, Context, Result};

/// Host allow/deny filter applied at accept time.
///
/// Deny entries win over allow entries; an empty allow list admits any peer
/// that no deny entry matches. When disabled, every peer is admitted.
#[derive(Debug, Clone)]
pub struct AccessList {
    enabled: bool,
    allow: Vec<Cidr>,
    deny: Vec<Cidr>,
}

#[derive(Debug, Clone, Copy)]
struct Cidr {
    ip: IpAddr,
    prefix: u8,
}

impl AccessList {
    /// Build a filter from configured CIDR strings (`10.0.0.0/8`,
    /// `192.168.1.5`, `fd00::/8`). A bare address means a full-length prefix.
    pub fn parse(enabled: bool, allow: &[String], deny: &[String]) -> Result<Self> {
        Ok(Self {
            enabled,
            allow: parse_all(allow).context("in access allow list")?,
            deny: parse_all(deny).context("in access deny list")?,
        })
    }

    /// Filter that admits everyone.
    pub fn open() -> Self {
        Self {
            enabled: false,
            allow: Vec::new(),
            deny: Vec::new(),
        }
    }

    pub fn permits(&self, peer: IpAddr) -> bool {
        if !self.enabled {
            return true;
        }
        let peer = normalize(peer);
        if self.deny.iter().any(|c| c.contains(peer)) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|c| c.contains(peer))
    }
}

fn parse_all(entries: &[String]) -> Result<Vec<Cidr>> {
    entries.iter().map(|e| parse_cidr(e)).collect()
}

fn parse_cidr(s: &str) -> Result<Cidr> {
    let (addr, prefix) = match s.split_once('/') {
        Some((addr, len)) => {
            let prefix: u8 = len
                .parse()
                .with_context(|| format!("invalid prefix length in '{s}'"))?;
            (addr, Some(prefix))
        }
        None => (s, None),
    };

    let ip: IpAddr = addr
        .parse()
        .with_context(|| format!("invalid address in '{s}'"))?;
    let ip = normalize(ip);

    let max = if ip.is_ipv4() { 32 } else { 128 };
    let prefix = prefix.unwrap_or(max);
    if prefix > max {
        bail!("prefix length {prefix} too long in '{s}'");
    }

    Ok(Cidr { ip, prefix })
}

/// IPv4-mapped IPv6 peers compare as plain IPv4.
fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        v4 => v4,
    }
}

impl Cidr {
    fn contains(&self, ip: IpAddr) -> bool {
        match (self.ip, ip) {
            (IpAddr::V4(net), IpAddr::V4(host)) => {
                let mask = prefix_mask_v4(self.prefix);
                u32::from(net) & mask == u32::from(host) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(host)) => {
                let mask = prefix_mask_v6(self.prefix);
                u128::from(net) & mask == u128::from(host) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn prefix_mask_v6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}
