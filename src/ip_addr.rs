use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use anyhow::{anyhow, Result};
use if_addrs::get_if_addrs;

use crate::config::IpFamily;

/// Convenience wrapper so builder methods accept anything address-like.
pub struct IpAddress(pub(crate) IpAddr);

impl From<IpAddr> for IpAddress {
    fn from(ip: IpAddr) -> Self {
        IpAddress(ip)
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(ip: Ipv4Addr) -> Self {
        IpAddress(IpAddr::V4(ip))
    }
}

impl From<&str> for IpAddress {
    fn from(s: &str) -> Self {
        IpAddress(IpAddr::from_str(s).unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)))
    }
}

impl IpAddress {
    /// Picks the first interface address of this host that the cluster's
    /// address family can use: non-loopback, and for IPv6 not link-local
    /// (those need a scope id to bind).
    pub(crate) fn find_system_ip(family: IpFamily) -> Result<IpAddr> {
        let interfaces = get_if_addrs()?;
        for iface in interfaces {
            let ip = iface.addr.ip();
            if iface.is_loopback() || !family.matches(ip) {
                continue;
            }
            if let IpAddr::V6(v6) = ip {
                if (v6.segments()[0] & 0xffc0) == 0xfe80 {
                    continue;
                }
            }
            return Ok(ip);
        }
        Err(anyhow!("no suitable {:?} address found", family))
    }
}
