// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! TCP control bits.

use bitflags::bitflags;

bitflags! {
    /// The control bits of a TCP header (byte 13).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TcpFlags: u8 {
        /// No more data from sender
        const FIN = 0x01;
        /// Synchronize sequence numbers
        const SYN = 0x02;
        /// Reset the connection
        const RST = 0x04;
        /// Push function
        const PSH = 0x08;
        /// Acknowledgment field significant
        const ACK = 0x10;
        /// Urgent pointer field significant
        const URG = 0x20;
        /// ECN echo
        const ECE = 0x40;
        /// Congestion window reduced
        const CWR = 0x80;
    }
}

impl TcpFlags {
    /// A connection opening segment (SYN without ACK).
    #[must_use]
    pub fn is_syn_only(self) -> bool {
        self.contains(TcpFlags::SYN) && !self.contains(TcpFlags::ACK)
    }

    /// The second segment of the three-way handshake.
    #[must_use]
    pub fn is_syn_ack(self) -> bool {
        self.contains(TcpFlags::SYN | TcpFlags::ACK)
    }
}
