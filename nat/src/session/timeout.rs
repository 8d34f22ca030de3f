// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Expiry-ordered session queues.
//!
//! Every queue has one timeout, and entries are only ever appended at the tail with an expiry of
//! `now + timeout`. As the clock never goes backwards, each queue is sorted by expiry and the
//! sweep can stop at the first entry not yet due.

use super::{SessionId, TcpState};
use crate::config::{NatConfig, NatTimeouts};
use crate::rules::RuleTimeouts;
use ahash::RandomState;
use net::ip::NextHeader;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;

#[allow(unused)]
use tracing::{debug, error, warn};

/// Identifies one timeout queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueId {
    Tcp(TcpState),
    Udp,
    Icmp,
    Ip,
    /// Created for a per-rule timeout override; the value is the timeout in ticks
    Custom(u64),
}

impl Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueId::Tcp(state) => write!(f, "tcp-{state}"),
            QueueId::Udp => write!(f, "udp"),
            QueueId::Icmp => write!(f, "icmp"),
            QueueId::Ip => write!(f, "ip"),
            QueueId::Custom(ticks) => write!(f, "custom-{ticks}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    queue: QueueId,
    touched: u64,
    expires: u64,
    prev: Option<SessionId>,
    next: Option<SessionId>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Queue {
    timeout: u64,
    head: Option<SessionId>,
    tail: Option<SessionId>,
    len: usize,
}

/// Length of one queue, for statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue: QueueId,
    pub timeout_ticks: u64,
    pub len: usize,
}

#[derive(Debug)]
pub struct TimeoutQueues {
    queues: HashMap<QueueId, Queue, RandomState>,
    entries: HashMap<SessionId, Entry, RandomState>,
}

fn tick_secs(tick_ms: u64, secs: u64) -> u64 {
    let ticks = u128::from(secs) * 1000 / u128::from(tick_ms.max(1));
    u64::try_from(ticks).unwrap_or(u64::MAX).max(1)
}

impl TimeoutQueues {
    #[must_use]
    pub fn new(config: &NatConfig) -> Self {
        let NatTimeouts {
            tcp_syn_sent,
            tcp_syn_received,
            tcp_established,
            tcp_fin_wait,
            tcp_closing,
            tcp_time_wait,
            tcp_closed,
            udp,
            icmp,
            ip,
        } = config.timeouts;
        let fixed = [
            (QueueId::Tcp(TcpState::SynSent), tcp_syn_sent),
            (QueueId::Tcp(TcpState::SynReceived), tcp_syn_received),
            (QueueId::Tcp(TcpState::Established), tcp_established),
            (QueueId::Tcp(TcpState::FinWait), tcp_fin_wait),
            (QueueId::Tcp(TcpState::Closing), tcp_closing),
            (QueueId::Tcp(TcpState::TimeWait), tcp_time_wait),
            (QueueId::Tcp(TcpState::Closed), tcp_closed),
            (QueueId::Udp, udp),
            (QueueId::Icmp, icmp),
            (QueueId::Ip, ip),
        ];
        let mut queues = HashMap::with_hasher(RandomState::with_seed(0));
        for (id, secs) in fixed {
            queues.insert(
                id,
                Queue {
                    timeout: tick_secs(config.tick_ms, secs),
                    ..Default::default()
                },
            );
        }
        Self {
            queues,
            entries: HashMap::with_hasher(RandomState::with_seed(0)),
        }
    }

    /// The queue a session of protocol `proto` in TCP state `state` belongs to, creating the
    /// custom queue of a rule override if needed.
    pub fn queue_for(
        &mut self,
        proto: NextHeader,
        state: TcpState,
        overrides: &RuleTimeouts,
        tick_ms: u64,
    ) -> QueueId {
        let (fixed, custom) = match proto {
            NextHeader::TCP => {
                let custom = (state == TcpState::Established)
                    .then_some(overrides.tcp_established)
                    .flatten();
                (QueueId::Tcp(state), custom)
            }
            NextHeader::UDP => (QueueId::Udp, overrides.udp),
            p if p.is_icmp() => (QueueId::Icmp, overrides.icmp),
            _ => (QueueId::Ip, overrides.ip),
        };
        let Some(secs) = custom else {
            return fixed;
        };
        let ticks = tick_secs(tick_ms, secs);
        let id = QueueId::Custom(ticks);
        self.queues.entry(id).or_insert_with(|| {
            debug!("Creating timeout queue {id}");
            Queue {
                timeout: ticks,
                ..Default::default()
            }
        });
        id
    }

    /// Timeout of a queue, in ticks.
    #[must_use]
    pub fn timeout(&self, queue: QueueId) -> Option<u64> {
        self.queues.get(&queue).map(|q| q.timeout)
    }

    fn unlink(&mut self, id: SessionId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        if let Some(prev) = entry.prev
            && let Some(p) = self.entries.get_mut(&prev)
        {
            p.next = entry.next;
        }
        if let Some(next) = entry.next
            && let Some(n) = self.entries.get_mut(&next)
        {
            n.prev = entry.prev;
        }
        if let Some(queue) = self.queues.get_mut(&entry.queue) {
            if queue.head == Some(id) {
                queue.head = entry.next;
            }
            if queue.tail == Some(id) {
                queue.tail = entry.prev;
            }
            queue.len -= 1;
        }
        Some(entry)
    }

    /// Append a session at the tail of `queue`, moving it there if it was queued elsewhere.
    /// Returns the new expiry tick, or `None` if the queue does not exist.
    pub fn touch(&mut self, id: SessionId, queue: QueueId, now: u64) -> Option<u64> {
        let timeout = self.queues.get(&queue)?.timeout;
        self.unlink(id);
        let queue_ref = self.queues.get_mut(&queue)?;
        let expires = now.saturating_add(timeout);
        let prev = queue_ref.tail;
        queue_ref.tail = Some(id);
        if queue_ref.head.is_none() {
            queue_ref.head = Some(id);
        }
        queue_ref.len += 1;
        if let Some(prev) = prev
            && let Some(p) = self.entries.get_mut(&prev)
        {
            p.next = Some(id);
        }
        self.entries.insert(
            id,
            Entry {
                queue,
                touched: now,
                expires,
                prev,
                next: None,
            },
        );
        Some(expires)
    }

    pub fn remove(&mut self, id: SessionId) -> bool {
        self.unlink(id).is_some()
    }

    #[must_use]
    pub fn queue_of(&self, id: SessionId) -> Option<QueueId> {
        self.entries.get(&id).map(|e| e.queue)
    }

    #[must_use]
    pub fn expiry_of(&self, id: SessionId) -> Option<u64> {
        self.entries.get(&id).map(|e| e.expires)
    }

    /// Unlink and return every session due at `now`.
    pub fn take_expired(&mut self, now: u64) -> Vec<SessionId> {
        let mut due = Vec::new();
        let heads: Vec<Option<SessionId>> = self.queues.values().map(|q| q.head).collect();
        for mut cursor in heads {
            while let Some(id) = cursor {
                let Some(entry) = self.entries.get(&id).copied() else {
                    error!("Timeout queue links to unknown session {id}");
                    break;
                };
                if entry.expires > now {
                    break;
                }
                cursor = entry.next;
                self.unlink(id);
                due.push(id);
            }
        }
        due
    }

    /// Sessions queued in `queue`, head first.
    #[must_use]
    pub fn members(&self, queue: QueueId) -> Vec<SessionId> {
        let mut out = Vec::new();
        let mut cursor = self.queues.get(&queue).and_then(|q| q.head);
        while let Some(id) = cursor {
            out.push(id);
            cursor = self.entries.get(&id).and_then(|e| e.next);
        }
        out
    }

    /// Sessions not touched for at least `idle` ticks.
    #[must_use]
    pub fn idle(&self, idle: u64, now: u64) -> Vec<SessionId> {
        let mut out: Vec<SessionId> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.touched) >= idle)
            .map(|(id, _)| *id)
            .collect();
        out.sort_unstable();
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> Vec<QueueStats> {
        let mut stats: Vec<QueueStats> = self
            .queues
            .iter()
            .map(|(queue, q)| QueueStats {
                queue: *queue,
                timeout_ticks: q.timeout,
                len: q.len,
            })
            .collect();
        stats.sort_by_key(|s| s.queue);
        stats
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    fn sid(index: u32) -> SessionId {
        SessionId {
            index,
            generation: 0,
        }
    }

    fn queues() -> TimeoutQueues {
        let mut config = NatConfig {
            tick_ms: 1000,
            ..Default::default()
        };
        config.timeouts.udp = 10;
        config.timeouts.tcp_syn_sent = 5;
        TimeoutQueues::new(&config)
    }

    #[test]
    fn expiry_stops_at_first_entry_not_due() {
        let mut q = queues();
        assert_eq!(q.touch(sid(1), QueueId::Udp, 0), Some(10));
        assert_eq!(q.touch(sid(2), QueueId::Udp, 3), Some(13));
        assert_eq!(q.touch(sid(3), QueueId::Udp, 5), Some(15));
        assert!(q.take_expired(9).is_empty());
        assert_eq!(q.take_expired(13), vec![sid(1), sid(2)]);
        assert_eq!(q.members(QueueId::Udp), vec![sid(3)]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn touch_moves_to_tail_and_between_queues() {
        let mut q = queues();
        q.touch(sid(1), QueueId::Udp, 0);
        q.touch(sid(2), QueueId::Udp, 1);
        q.touch(sid(1), QueueId::Udp, 2);
        assert_eq!(q.members(QueueId::Udp), vec![sid(2), sid(1)]);

        let syn = QueueId::Tcp(TcpState::SynSent);
        q.touch(sid(2), syn, 3);
        assert_eq!(q.queue_of(sid(2)), Some(syn));
        assert_eq!(q.expiry_of(sid(2)), Some(8));
        assert_eq!(q.members(QueueId::Udp), vec![sid(1)]);
        assert!(q.remove(sid(1)));
        assert!(!q.remove(sid(1)));
        assert!(q.members(QueueId::Udp).is_empty());
    }

    #[test]
    fn custom_queues_per_override() {
        let mut q = queues();
        let overrides = RuleTimeouts {
            udp: Some(30),
            ..Default::default()
        };
        let custom = q.queue_for(NextHeader::UDP, TcpState::default(), &overrides, 1000);
        assert_eq!(custom, QueueId::Custom(30));
        assert_eq!(q.timeout(custom), Some(30));
        let plain = q.queue_for(NextHeader::TCP, TcpState::SynSent, &overrides, 1000);
        assert_eq!(plain, QueueId::Tcp(TcpState::SynSent));
    }

    #[test]
    fn idle_sessions() {
        let mut q = queues();
        q.touch(sid(1), QueueId::Udp, 0);
        q.touch(sid(2), QueueId::Udp, 4);
        assert_eq!(q.idle(5, 6), vec![sid(1)]);
    }

    #[test]
    fn touching_never_moves_expiry_backwards() {
        bolero::check!()
            .with_type()
            .for_each(|steps: &Vec<(u8, bool)>| {
                let mut q = queues();
                let mut now = 0u64;
                let mut last = 0u64;
                for (advance, tcp) in steps {
                    now += u64::from(*advance);
                    let queue = if *tcp {
                        QueueId::Tcp(TcpState::SynSent)
                    } else {
                        QueueId::Udp
                    };
                    let expires = q.touch(sid(7), queue, now).unwrap();
                    assert_eq!(expires, now + q.timeout(queue).unwrap());
                    if queue == QueueId::Udp {
                        assert!(expires >= last);
                        last = expires;
                    }
                }
            });
    }
}
