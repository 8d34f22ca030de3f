// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Display implementations for rules, in a form close to the classic rule syntax

use std::fmt::Display;

use super::{AddrMatch, NatRule, Pool, PoolSpec, RuleFlags, RuleKind, RuleStore};

fn not(negated: bool) -> &'static str {
    if negated { "! " } else { "" }
}

impl Display for AddrMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddrMatch::Any => write!(f, "any"),
            AddrMatch::Net { net, not: n } => write!(f, "{}{net}", not(*n)),
            AddrMatch::Table { name, not: n } => write!(f, "{}<{name}>", not(*n)),
        }
    }
}

impl Display for PoolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolSpec::Addr(addr) => write!(f, "{addr}"),
            PoolSpec::Cidr(net) => write!(f, "{net}"),
            PoolSpec::Range { start, end } => write!(f, "range {start}-{end}"),
            PoolSpec::Split(a, b) => write!(f, "{a},{b}"),
            PoolSpec::Interface => write!(f, "0/32"),
            PoolSpec::Identity => write!(f, "0/0"),
        }
    }
}

impl Display for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pool::Range(range) => write!(f, "{range}"),
            Pool::Split(a, b) => write!(f, "{a},{b}"),
            Pool::Interface => write!(f, "0/32"),
            Pool::Identity => write!(f, "0/0"),
        }
    }
}

macro_rules! FLAG_NAMES {
    () => {
        [
            (RuleFlags::ROUND_ROBIN, "round-robin"),
            (RuleFlags::STICKY, "sticky"),
            (RuleFlags::FIXED_SPORT, "fixed-sport"),
            (RuleFlags::FIXED_DPORT, "fixed-dport"),
            (RuleFlags::PURGE, "purge"),
        ]
    };
}

impl Display for NatRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let spec = self.spec();
        write!(f, "{} {}", self.id(), self.kind())?;
        if let Some(name) = self.name() {
            write!(f, " \"{name}\"")?;
        }
        if let Some(iface) = &spec.interface {
            write!(f, " on {iface}")?;
        }
        if let Some(proto) = spec.proto {
            write!(f, " {proto}")?;
        }
        write!(f, " from {}", spec.src)?;
        if let Some(ports) = spec.sports {
            write!(f, " port {ports}")?;
        }
        write!(f, " to {}", spec.dst)?;
        if let Some(ports) = spec.dports {
            write!(f, " port {ports}")?;
        }
        match (self.kind(), self.divert()) {
            (RuleKind::Divert, Some(divert)) => write!(
                f,
                " -> udp {}-{}:{}",
                divert.local, divert.remote, divert.dport
            )?,
            _ => write!(f, " -> {}", spec.pool)?,
        }
        if let Some(ports) = self.xlat_ports() {
            write!(f, " ports {ports} {}", spec.port_mode)?;
        }
        for (flag, name) in FLAG_NAMES!() {
            if self.flags().contains(flag) {
                write!(f, " {name}")?;
            }
        }
        if let Some(proxy) = self.proxy() {
            write!(f, " proxy {proxy}")?;
        }
        if self.is_deleted() {
            write!(f, " (deleted)")?;
        }
        Ok(())
    }
}

impl Display for RuleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, " ━━━━━━━━━━━━━━━━━━━━━━━━ NAT rules ━━━━━━━━━━━━━━━━━━━━━━━━")?;
        if self.is_empty() {
            return writeln!(f, " (empty)");
        }
        for rule in self.iter() {
            writeln!(
                f,
                "{rule}  [sessions:{} hits:{} capacity:{}/{}]",
                rule.use_count(),
                rule.hits(),
                rule.capacity(),
                rule.pool_size()
            )?;
        }
        Ok(())
    }
}
