// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Collaborators the engine queries but does not own: interface addresses and named address
//! tables referenced by rule predicates.

use ahash::RandomState;
use ipnet::IpNet;
use net::ip::IpFamily;
use std::collections::HashMap;
use std::net::IpAddr;

/// Resolves the address of an interface, for rules translating to "the interface's address".
pub trait InterfaceResolver: Send + Sync {
    fn address(&self, iface: &str, family: IpFamily) -> Option<IpAddr>;
}

/// Membership test for named address tables.
pub trait AddrTables: Send + Sync {
    fn contains(&self, table: &str, addr: IpAddr) -> bool;
}

/// A fixed set of interface addresses.
#[derive(Debug, Default, Clone)]
pub struct StaticInterfaces {
    addrs: HashMap<String, Vec<IpAddr>, RandomState>,
}

impl StaticInterfaces {
    #[must_use]
    pub fn new() -> Self {
        Self {
            addrs: HashMap::with_hasher(RandomState::with_seed(0)),
        }
    }

    #[must_use]
    pub fn with(mut self, iface: &str, addr: IpAddr) -> Self {
        self.addrs.entry(iface.to_string()).or_default().push(addr);
        self
    }
}

impl InterfaceResolver for StaticInterfaces {
    fn address(&self, iface: &str, family: IpFamily) -> Option<IpAddr> {
        self.addrs
            .get(iface)?
            .iter()
            .find(|a| IpFamily::of(a) == family)
            .copied()
    }
}

/// Named lists of prefixes.
#[derive(Debug, Default, Clone)]
pub struct NamedTables {
    tables: HashMap<String, Vec<IpNet>, RandomState>,
}

impl NamedTables {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: HashMap::with_hasher(RandomState::with_seed(0)),
        }
    }

    #[must_use]
    pub fn with(mut self, table: &str, net: IpNet) -> Self {
        self.tables.entry(table.to_string()).or_default().push(net);
        self
    }
}

impl AddrTables for NamedTables {
    fn contains(&self, table: &str, addr: IpAddr) -> bool {
        self.tables
            .get(table)
            .is_some_and(|nets| nets.iter().any(|n| n.contains(&addr)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn interface_by_family() {
        let ifs = StaticInterfaces::new()
            .with("eth0", "203.0.113.1".parse().unwrap())
            .with("eth0", "2001:db8::1".parse().unwrap());
        assert_eq!(
            ifs.address("eth0", IpFamily::V6),
            Some("2001:db8::1".parse().unwrap())
        );
        assert_eq!(ifs.address("eth1", IpFamily::V4), None);
    }

    #[test]
    fn table_membership() {
        let tables = NamedTables::new().with("blocked", "192.0.2.0/24".parse().unwrap());
        assert!(tables.contains("blocked", "192.0.2.7".parse().unwrap()));
        assert!(!tables.contains("blocked", "192.0.3.7".parse().unwrap()));
        assert!(!tables.contains("other", "192.0.2.7".parse().unwrap()));
    }
}
