// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Paginated iteration over the engine state. A page ends with a token from which the next
//! page resumes.

use crate::NatDirection;
use crate::alloc::hostmap::{HostMap, HostMapCache};
use crate::rules::{NatRuleSpec, RuleId, RuleStore};
use crate::session::{NatSession, NatTuple, SessionId, SessionTable, TcpState, WildPorts};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WalkKind {
    Rules,
    Sessions,
    HostMaps,
}

/// Where the next page of a walk starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkToken {
    pub kind: WalkKind,
    pub position: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleInfo {
    pub id: RuleId,
    pub spec: NatRuleSpec,
    pub sessions: u32,
    pub hits: u64,
    pub capacity: u64,
    pub pool_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub rule: RuleId,
    pub dir: NatDirection,
    pub orig: NatTuple,
    pub xlat: NatTuple,
    pub wild: WildPorts,
    pub tcp_state: TcpState,
    pub expires: u64,
    pub packets: (u64, u64),
    pub bytes: (u64, u64),
    pub proxy: Option<String>,
}

impl SessionInfo {
    #[must_use]
    pub fn of_session(session: &NatSession) -> Self {
        let tuples = session.tuples();
        let (fp, fb) = session.forward.read();
        let (rp, rb) = session.reply.read();
        Self {
            id: session.id(),
            rule: session.rule().id(),
            dir: session.dir(),
            orig: tuples.orig,
            xlat: tuples.xlat,
            wild: tuples.wild,
            tcp_state: session.tcp_state(),
            expires: session.expires(),
            packets: (fp, rp),
            bytes: (fb, rb),
            proxy: session.proxy().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WalkItem {
    Rule(RuleInfo),
    Session(SessionInfo),
    HostMap(HostMap),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalkPage {
    pub items: Vec<WalkItem>,
    /// `None` once the walk is complete
    pub next: Option<WalkToken>,
}

fn token(kind: WalkKind, position: u64) -> Option<WalkToken> {
    Some(WalkToken { kind, position })
}

pub(crate) fn rules(store: &RuleStore, after: u64, limit: usize) -> WalkPage {
    let mut items = Vec::new();
    let mut remaining = store
        .iter()
        .filter(|r| u64::from(r.id().0) >= after)
        .peekable();
    while items.len() < limit {
        let Some(rule) = remaining.next() else {
            break;
        };
        items.push(WalkItem::Rule(RuleInfo {
            id: rule.id(),
            spec: rule.spec().clone(),
            sessions: rule.use_count(),
            hits: rule.hits(),
            capacity: rule.capacity(),
            pool_size: rule.pool_size(),
        }));
    }
    let next = remaining
        .peek()
        .and_then(|r| token(WalkKind::Rules, u64::from(r.id().0)));
    WalkPage { items, next }
}

pub(crate) fn sessions(table: &SessionTable, from: u64, limit: usize) -> WalkPage {
    let mut items = Vec::new();
    let mut index = usize::try_from(from).unwrap_or(usize::MAX);
    while items.len() < limit {
        let Some((slot, session)) = table.next_from(index) else {
            return WalkPage { items, next: None };
        };
        items.push(WalkItem::Session(SessionInfo::of_session(session)));
        index = slot + 1;
    }
    let next = table
        .next_from(index)
        .and_then(|(slot, _)| token(WalkKind::Sessions, u64::try_from(slot).ok()?));
    WalkPage { items, next }
}

pub(crate) fn hostmaps(cache: &HostMapCache, from: u64, limit: usize) -> WalkPage {
    let maps = cache.sorted();
    let start = usize::try_from(from).unwrap_or(usize::MAX).min(maps.len());
    let end = start.saturating_add(limit).min(maps.len());
    let items = maps[start..end]
        .iter()
        .map(|map| WalkItem::HostMap((**map).clone()))
        .collect();
    let next = (end < maps.len())
        .then(|| token(WalkKind::HostMaps, u64::try_from(end).ok()?))
        .flatten();
    WalkPage { items, next }
}
