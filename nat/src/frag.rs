// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Fragment trains. Only the first fragment of a datagram carries ports, so the session it
//! resolved to is remembered here for the fragments that follow.

use crate::session::NatSession;
use ahash::RandomState;
use net::ip::NextHeader;
use net::packet::Packet;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};

#[allow(unused)]
use tracing::{debug, warn};

/// Identifies the fragments of one datagram, as they arrive (before translation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FragKey {
    src: IpAddr,
    dst: IpAddr,
    proto: NextHeader,
    id: u32,
}

impl FragKey {
    pub(crate) fn of(packet: &Packet) -> Option<Self> {
        let frag = packet.fragment()?;
        Some(Self {
            src: packet.src_addr(),
            dst: packet.dst_addr(),
            proto: packet.proto(),
            id: frag.id,
        })
    }
}

/// Whether the train belongs to the initiating direction of the session or to its replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Forward,
    Reply,
}

#[derive(Debug)]
struct FragEntry {
    session: Weak<NatSession>,
    role: Role,
    expires: u64,
}

#[derive(Debug)]
pub(crate) struct FragCache {
    entries: HashMap<FragKey, FragEntry, RandomState>,
    max: usize,
    timeout: u64,
}

impl FragCache {
    pub(crate) fn new(max: usize, timeout_ticks: u64) -> Self {
        Self {
            entries: HashMap::with_hasher(RandomState::with_seed(0)),
            max: max.max(1),
            timeout: timeout_ticks.max(1),
        }
    }

    /// Remember the session of a train. Returns false if the cache is full.
    pub(crate) fn insert(
        &mut self,
        key: FragKey,
        session: &Arc<NatSession>,
        role: Role,
        now: u64,
    ) -> bool {
        if self.entries.len() >= self.max && !self.entries.contains_key(&key) {
            self.expire(now);
            if self.entries.len() >= self.max {
                warn!("Fragment cache full ({} entries)", self.max);
                return false;
            }
        }
        self.entries.insert(
            key,
            FragEntry {
                session: Arc::downgrade(session),
                role,
                expires: now.saturating_add(self.timeout),
            },
        );
        true
    }

    /// The live session a fragment belongs to.
    pub(crate) fn lookup(&self, key: &FragKey, now: u64) -> Option<(Arc<NatSession>, Role)> {
        let entry = self.entries.get(key)?;
        if entry.expires <= now {
            return None;
        }
        let session = entry.session.upgrade().filter(|s| s.is_live())?;
        Some((session, entry.role))
    }

    /// Drop trains past their lifetime or whose session is gone.
    pub(crate) fn expire(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.expires > now && e.session.strong_count() > 0);
        before - self.entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
