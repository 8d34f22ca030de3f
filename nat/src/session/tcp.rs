// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! TCP connection tracking, as far as choosing a timeout is concerned.

use net::tcp::TcpFlags;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU16, Ordering};

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum TcpState {
    #[default]
    SynSent = 0,
    SynReceived = 1,
    Established = 2,
    /// One side has sent a FIN
    FinWait = 3,
    /// Both sides have sent a FIN
    Closing = 4,
    TimeWait = 5,
    Closed = 6,
}

impl TcpState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TcpState::SynSent,
            1 => TcpState::SynReceived,
            2 => TcpState::Established,
            3 => TcpState::FinWait,
            4 => TcpState::Closing,
            5 => TcpState::TimeWait,
            _ => TcpState::Closed,
        }
    }

    /// States in which the connection is being torn down.
    #[must_use]
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            TcpState::FinWait | TcpState::Closing | TcpState::TimeWait | TcpState::Closed
        )
    }

    /// The state a session starts in, given the segment that created it.
    #[must_use]
    pub fn initial(flags: TcpFlags) -> Self {
        if flags.contains(TcpFlags::RST) {
            TcpState::Closed
        } else if flags.contains(TcpFlags::FIN) {
            TcpState::FinWait
        } else if flags.is_syn_only() {
            TcpState::SynSent
        } else if flags.is_syn_ack() {
            TcpState::SynReceived
        } else {
            // picked up mid-stream
            TcpState::Established
        }
    }
}

const FIN_INITIATOR: u16 = 1 << 8;
const FIN_RESPONDER: u16 = 1 << 9;
const STATE_MASK: u16 = 0xff;

/// TCP state plus the FIN seen from each side, packed so that packets of both directions can
/// update it concurrently.
#[derive(Debug, Default)]
pub struct TcpTracker(AtomicU16);

fn decode(raw: u16) -> TcpState {
    TcpState::from_u8(u8::try_from(raw & STATE_MASK).unwrap_or(u8::MAX))
}

fn step(raw: u16, flags: TcpFlags, from_initiator: bool) -> u16 {
    let state = decode(raw);
    let mut fins = raw & !STATE_MASK;
    let next = if flags.contains(TcpFlags::RST) {
        TcpState::Closed
    } else {
        match state {
            TcpState::TimeWait | TcpState::Closed if from_initiator && flags.is_syn_only() => {
                fins = 0;
                TcpState::SynSent
            }
            TcpState::SynSent if !from_initiator && flags.is_syn_ack() => TcpState::SynReceived,
            // either side: a session picked up from a SYN|ACK sees the handshake ACK as a reply
            TcpState::SynReceived
                if flags.contains(TcpFlags::ACK)
                    && !flags.intersects(TcpFlags::SYN | TcpFlags::FIN) =>
            {
                TcpState::Established
            }
            TcpState::SynReceived | TcpState::Established | TcpState::FinWait
                if flags.contains(TcpFlags::FIN) =>
            {
                fins |= if from_initiator {
                    FIN_INITIATOR
                } else {
                    FIN_RESPONDER
                };
                if fins == FIN_INITIATOR | FIN_RESPONDER {
                    TcpState::Closing
                } else {
                    TcpState::FinWait
                }
            }
            TcpState::Closing
                if flags.contains(TcpFlags::ACK) && !flags.contains(TcpFlags::FIN) =>
            {
                TcpState::TimeWait
            }
            other => other,
        }
    };
    fins | u16::from(next as u8)
}

impl TcpTracker {
    #[must_use]
    pub fn new(state: TcpState) -> Self {
        Self(AtomicU16::new(u16::from(state as u8)))
    }

    #[must_use]
    pub fn state(&self) -> TcpState {
        decode(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: TcpState) {
        self.0.store(u16::from(state as u8), Ordering::Release);
    }

    /// Account one segment; returns the state before and after it.
    pub fn observe(&self, flags: TcpFlags, from_initiator: bool) -> (TcpState, TcpState) {
        let before = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                Some(step(raw, flags, from_initiator))
            })
            .unwrap_or_else(|raw| raw);
        let after = step(before, flags, from_initiator);
        (decode(before), decode(after))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn three_way_handshake_then_close() {
        let tracker = TcpTracker::new(TcpState::initial(TcpFlags::SYN));
        assert_eq!(tracker.state(), TcpState::SynSent);
        assert_eq!(
            tracker.observe(TcpFlags::SYN | TcpFlags::ACK, false),
            (TcpState::SynSent, TcpState::SynReceived)
        );
        tracker.observe(TcpFlags::ACK, true);
        assert_eq!(tracker.state(), TcpState::Established);
        tracker.observe(TcpFlags::FIN | TcpFlags::ACK, true);
        assert_eq!(tracker.state(), TcpState::FinWait);
        // a retransmitted FIN from the same side changes nothing
        tracker.observe(TcpFlags::FIN | TcpFlags::ACK, true);
        assert_eq!(tracker.state(), TcpState::FinWait);
        tracker.observe(TcpFlags::FIN | TcpFlags::ACK, false);
        assert_eq!(tracker.state(), TcpState::Closing);
        tracker.observe(TcpFlags::ACK, true);
        assert_eq!(tracker.state(), TcpState::TimeWait);
        // port reuse
        tracker.observe(TcpFlags::SYN, true);
        assert_eq!(tracker.state(), TcpState::SynSent);
    }

    #[test]
    fn reset_closes_from_any_state() {
        for initial in [TcpFlags::SYN, TcpFlags::ACK, TcpFlags::FIN] {
            let tracker = TcpTracker::new(TcpState::initial(initial));
            tracker.observe(TcpFlags::RST, false);
            assert_eq!(tracker.state(), TcpState::Closed);
        }
    }

    #[test]
    fn initial_states() {
        assert_eq!(TcpState::initial(TcpFlags::ACK), TcpState::Established);
        assert_eq!(
            TcpState::initial(TcpFlags::SYN | TcpFlags::ACK),
            TcpState::SynReceived
        );
        assert!(TcpState::initial(TcpFlags::RST).is_closing());
    }

    #[test]
    fn picked_up_from_syn_ack() {
        let tracker = TcpTracker::new(TcpState::initial(TcpFlags::SYN | TcpFlags::ACK));
        assert_eq!(
            tracker.observe(TcpFlags::ACK, false),
            (TcpState::SynReceived, TcpState::Established)
        );
        // a retransmitted SYN|ACK does not complete the handshake
        let tracker = TcpTracker::new(TcpState::SynReceived);
        tracker.observe(TcpFlags::SYN | TcpFlags::ACK, true);
        assert_eq!(tracker.state(), TcpState::SynReceived);
    }
}
