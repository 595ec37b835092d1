//! Tunnel ACLs
//!
//! An [`Acl`] is a parsed list of single IPv4 addresses and IPv4 CIDR
//! ranges. Tunnel listeners match every inbound peer against it before the
//! connection gets a channel.

use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use thiserror::Error;

/// ACL parse errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AclError {
    #[error("invalid ACL address: {0}")]
    InvalidAddress(String),

    #[error("invalid ACL CIDR: {0}")]
    InvalidCidr(String),
}

/// One IPv4 network; a single address is a /32.
#[derive(Debug, Clone, PartialEq)]
struct Ipv4Network {
    addr: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Network {
    fn parse(s: &str) -> Result<Self, AclError> {
        if let Some((ip_str, prefix_str)) = s.split_once('/') {
            let addr = Ipv4Addr::from_str(ip_str)
                .map_err(|_| AclError::InvalidAddress(s.to_string()))?;
            let prefix_len: u8 = prefix_str
                .parse()
                .map_err(|_| AclError::InvalidCidr(s.to_string()))?;
            if prefix_len > 32 {
                return Err(AclError::InvalidCidr(s.to_string()));
            }
            Ok(Self { addr, prefix_len })
        } else {
            let addr =
                Ipv4Addr::from_str(s).map_err(|_| AclError::InvalidAddress(s.to_string()))?;
            Ok(Self {
                addr,
                prefix_len: 32,
            })
        }
    }

    fn contains(&self, ip: Ipv4Addr) -> bool {
        if self.prefix_len == 0 {
            return true;
        }
        let mask = !0u32 << (32 - self.prefix_len);
        (u32::from(self.addr) & mask) == (u32::from(ip) & mask)
    }
}

/// Parsed tunnel ACL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Acl {
    entries: Vec<String>,
    networks: Vec<Ipv4Network>,
}

impl Acl {
    /// Parse a list of `"ip"` / `"ip/prefix"` entries.
    pub fn parse(entries: &[String]) -> Result<Self, AclError> {
        let mut networks = Vec::with_capacity(entries.len());
        for entry in entries {
            networks.push(Ipv4Network::parse(entry.trim())?);
        }
        Ok(Self {
            entries: entries.to_vec(),
            networks,
        })
    }

    /// Parse a comma-separated ACL value as it appears in API requests.
    pub fn parse_csv(csv: &str) -> Result<Self, AclError> {
        let entries: Vec<String> = csv
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Self::parse(&entries)
    }

    /// Whether the peer address is admitted. Only IPv4 peers can match;
    /// IPv6 peers are rejected whenever an ACL is present.
    pub fn allows(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.networks.iter().any(|n| n.contains(v4)),
            IpAddr::V6(_) => false,
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn single_ip_match() {
        let acl = Acl::parse_csv("192.168.1.100").unwrap();
        assert!(acl.allows(ip("192.168.1.100")));
        assert!(!acl.allows(ip("192.168.1.101")));
    }

    #[test]
    fn cidr_match() {
        let acl = Acl::parse_csv("10.0.0.0/8").unwrap();
        assert!(acl.allows(ip("10.0.0.5")));
        assert!(acl.allows(ip("10.255.255.255")));
        assert!(!acl.allows(ip("11.0.0.1")));
        assert!(!acl.allows(ip("192.0.2.1")));
    }

    #[test]
    fn union_of_entries() {
        let acl = Acl::parse_csv("10.0.0.0/8, 203.0.113.7").unwrap();
        assert!(acl.allows(ip("10.1.2.3")));
        assert!(acl.allows(ip("203.0.113.7")));
        assert!(!acl.allows(ip("203.0.113.8")));
    }

    #[test]
    fn ipv6_peers_never_match() {
        let acl = Acl::parse_csv("0.0.0.0/0").unwrap();
        assert!(!acl.allows(ip("::1")));
    }

    #[test]
    fn invalid_entries_rejected() {
        assert!(Acl::parse_csv("not-an-ip").is_err());
        assert!(Acl::parse_csv("10.0.0.0/33").is_err());
        assert!(Acl::parse_csv("2001:db8::/32").is_err());
    }

    #[test]
    fn zero_prefix_matches_all_v4() {
        let acl = Acl::parse_csv("0.0.0.0/0").unwrap();
        assert!(acl.allows(ip("8.8.8.8")));
    }
}
