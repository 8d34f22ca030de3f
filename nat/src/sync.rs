// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flat, serializable records of sessions, for state synchronization between engines and for
//! saving state across restarts.

use crate::NatDirection;
use crate::alloc::hostmap::HostMap;
use crate::rules::{NatRuleSpec, RuleError, RuleKind};
use crate::session::{NatSession, NatTuple, SessionId, TableError, TcpState, WildPorts};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum SyncError {
    #[error("no session {0}")]
    NotFound(SessionId),
    #[error("a session for {0} already exists")]
    Duplicate(NatTuple),
    #[error("record is inconsistent: {0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Traffic counters of one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    pub packets: u64,
    pub bytes: u64,
}

/// Everything needed to re-create a session elsewhere, including the rule that created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionRecord {
    pub kind: RuleKind,
    pub dir: NatDirection,
    pub rule: NatRuleSpec,
    pub orig: NatTuple,
    pub xlat: NatTuple,
    #[serde(default)]
    pub wild: WildPorts,
    #[serde(default)]
    pub tcp_state: TcpState,
    #[serde(default)]
    pub hostmap: Option<HostMap>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub forward: CounterRecord,
    #[serde(default)]
    pub reply: CounterRecord,
}

impl SessionRecord {
    #[must_use]
    pub fn of_session(session: &NatSession) -> Self {
        let tuples = session.tuples();
        let (fp, fb) = session.forward.read();
        let (rp, rb) = session.reply.read();
        Self {
            kind: session.kind(),
            dir: session.dir(),
            rule: session.rule().spec().clone(),
            orig: tuples.orig,
            xlat: tuples.xlat,
            wild: tuples.wild,
            tcp_state: session.tcp_state(),
            hostmap: session.hostmap().map(|map| (**map).clone()),
            proxy: session.proxy().map(str::to_string),
            forward: CounterRecord {
                packets: fp,
                bytes: fb,
            },
            reply: CounterRecord {
                packets: rp,
                bytes: rb,
            },
        }
    }

    /// Reject records that cannot describe a session.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Invalid` naming the inconsistency.
    pub fn check(&self) -> Result<(), SyncError> {
        if self.kind != self.rule.kind {
            return Err(SyncError::Invalid("kind differs from the rule"));
        }
        if self.kind != RuleKind::Divert && self.orig.proto != self.xlat.proto {
            return Err(SyncError::Invalid("protocols differ"));
        }
        if self.kind != RuleKind::Divert && self.orig.family() != self.xlat.family() {
            return Err(SyncError::Invalid("address families differ"));
        }
        if self.orig.src.is_ipv4() != self.orig.dst.is_ipv4() {
            return Err(SyncError::Invalid("mixed address families"));
        }
        Ok(())
    }
}
