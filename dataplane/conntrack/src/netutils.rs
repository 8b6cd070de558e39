/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use crate::Error;

/// An IPv4 or IPv6 prefix such as `10.244.0.0/16`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, Error> {
        let max = max_prefix_len(&addr);
        if prefix_len > max {
            return Err(Error::InvalidCidrError(format!("{}/{}", addr, prefix_len)));
        }
        Ok(Cidr { addr, prefix_len })
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask(self.prefix_len, 32) as u32;
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask(self.prefix_len, 128);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidCidrError(s.to_string());
        let (addr, prefix_len) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
        let prefix_len: u8 = prefix_len.parse().map_err(|_| invalid())?;
        Cidr::new(addr, prefix_len).map_err(|_| invalid())
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

fn max_prefix_len(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

// Mask with the top `prefix_len` bits set within a `bits` wide address.
fn prefix_mask(prefix_len: u8, bits: u32) -> u128 {
    if prefix_len == 0 {
        return 0;
    }
    (u128::MAX << (128 - prefix_len as u32)) >> (128 - bits)
}

/// Decides which destinations are external to the cluster.
///
/// Only flows leaving the pod and service networks, and not addressed to the
/// node itself, are accounted.
#[derive(Copy, Clone, Debug)]
pub struct ExternalGate {
    pod_cidr: Cidr,
    service_cidr: Cidr,
    node_ip: IpAddr,
}

impl ExternalGate {
    pub fn new(pod_cidr: Cidr, service_cidr: Cidr, node_ip: IpAddr) -> Self {
        ExternalGate {
            pod_cidr,
            service_cidr,
            node_ip,
        }
    }

    pub fn is_external(&self, dst: &IpAddr) -> bool {
        !self.pod_cidr.contains(dst) && !self.service_cidr.contains(dst) && *dst != self.node_ip
    }
}

/// Parses the node address exported by the downward API.
pub fn parse_node_ip(value: Option<&str>) -> Result<IpAddr, Error> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(Error::MissingNodeIpError)?;
    value
        .parse::<IpAddr>()
        .map_err(|err| Error::InvalidConfigError(format!("node ip {}: {}", value, err)))
}

pub fn ipv4_from_be(addr: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from_be(addr))
}
