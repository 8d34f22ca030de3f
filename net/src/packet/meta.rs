// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use std::net::IpAddr;

/// The outer endpoints of an encapsulation tunnel, or the inner flow restored by decapsulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Tunnel {
    /// source address
    pub src: IpAddr,
    /// source port
    pub sport: u16,
    /// destination address
    pub dst: IpAddr,
    /// destination port
    pub dport: u16,
}

/// Work left to the encapsulation layer by a divert rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivertAction {
    /// Wrap the datagram in UDP with these endpoints.
    Encapsulate(Tunnel),
    /// Strip the UDP wrapper; the inner datagram belongs to this flow.
    Decapsulate(Tunnel),
    /// An ICMP error about tunnel traffic; the quoted flow is this one.
    TunnelError(Tunnel),
}

/// Per-packet metadata exchanged with the surrounding filter layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketMeta {
    /// Interface the datagram is crossing
    pub iface: Option<String>,
    /// Set when translation was required but could not be performed
    pub bad_nat: bool,
    /// Set once the datagram has been rewritten
    pub natted: bool,
    /// Encapsulation work for divert rules
    pub divert: Option<DivertAction>,
}
