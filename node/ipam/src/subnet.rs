// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 subnet in `a.b.c.d/len` form. Offsets 0 and size-1 (network and
/// broadcast) are never allocated.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Subnet {
    network: u32,
    prefix: u8,
}

impl Subnet {
    pub fn parse(text: &str) -> Result<Self, Error> {
        let bad = || Error::BadSubnet(text.to_string());
        let (addr, len) = text.split_once('/').ok_or_else(bad)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| bad())?;
        let prefix: u8 = len.parse().map_err(|_| bad())?;
        if prefix > 32 {
            return Err(bad());
        }
        if prefix > 30 {
            return Err(Error::SubnetTooSmall(prefix));
        }
        let mask = u32::MAX << (32 - prefix);
        Ok(Subnet {
            network: u32::from(addr) & mask,
            prefix,
        })
    }

    /// Number of allocatable host offsets, `size - 2`.
    pub fn allocatable(&self) -> u64 {
        (1u64 << (32 - self.prefix)) - 2
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn network_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    pub fn broadcast_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network | !(u32::MAX << (32 - self.prefix)))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::MAX << (32 - self.prefix);
        u32::from(ip) & mask == self.network
    }

    pub(crate) fn ip_at_offset(&self, offset: u32) -> Ipv4Addr {
        debug_assert!(u64::from(offset) <= self.allocatable());
        Ipv4Addr::from(self.network + offset)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.network_address(), self.prefix)
    }
}

impl FromStr for Subnet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Subnet::parse(s)
    }
}

impl Serialize for Subnet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Subnet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Subnet::parse(&text).map_err(serde::de::Error::custom)
    }
}
