// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Internet checksum arithmetic (RFC 1071) and incremental updates (RFC 1624).
//!
//! A [`ChecksumDelta`] is the one's-complement sum of `new - old` over the 16-bit words a rewrite
//! changes. It is computed once (for instance when a NAT session is created) and then applied to
//! every packet of the flow with one of [`fix_outbound`], [`fix_inbound`] or [`fix_embedded`].
//!
//! All three functions implement `HC' = ~(~HC + ~m + m')` (RFC 1624, eqn. 3), which yields the
//! same value as recomputing the checksum over the rewritten bytes.

use std::net::IpAddr;

/// Fold a 32-bit accumulator into 16 bits with end-around carry.
#[must_use]
pub fn fold(mut sum: u32) -> u16 {
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    #[allow(clippy::cast_possible_truncation)] // folded above
    let folded = sum as u16;
    folded
}

/// Add the big-endian 16-bit words of `data` to `sum`.
///
/// An odd trailing byte is padded with zero, as in RFC 1071.
#[must_use]
pub fn sum_bytes(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = u32::from(fold(sum)) + u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum = u32::from(fold(sum)) + (u32::from(*last) << 8);
    }
    sum
}

/// Compute the internet checksum of `data` from scratch.
#[must_use]
pub fn checksum(data: &[u8]) -> u16 {
    !fold(sum_bytes(0, data))
}

/// 16-bit words of an address, in network order.
fn addr_words(addr: IpAddr) -> ([u16; 8], usize) {
    let mut words = [0u16; 8];
    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            words[0] = u16::from_be_bytes([o[0], o[1]]);
            words[1] = u16::from_be_bytes([o[2], o[3]]);
            (words, 2)
        }
        IpAddr::V6(v6) => (v6.segments(), 8),
    }
}

/// Precomputed incremental checksum adjustment.
///
/// The default value is the empty adjustment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChecksumDelta(u16);

impl ChecksumDelta {
    /// The adjustment that changes nothing.
    pub const NONE: ChecksumDelta = ChecksumDelta(0);

    /// Adjustment for replacing the words `old` with `new`.
    ///
    /// # Panics
    ///
    /// Debug builds panic if the slices differ in length.
    #[must_use]
    pub fn from_words(old: &[u16], new: &[u16]) -> Self {
        debug_assert_eq!(old.len(), new.len());
        let mut sum = 0u32;
        for (o, n) in old.iter().zip(new) {
            sum = u32::from(fold(sum)) + u32::from(!*o) + u32::from(*n);
        }
        ChecksumDelta(fold(sum))
    }

    /// Adjustment for replacing address `old` with `new`.
    ///
    /// Mixed address families yield [`ChecksumDelta::NONE`]; callers check families first.
    #[must_use]
    pub fn from_addrs(old: IpAddr, new: IpAddr) -> Self {
        if old.is_ipv4() != new.is_ipv4() {
            return Self::NONE;
        }
        let (o, len) = addr_words(old);
        let (n, _) = addr_words(new);
        Self::from_words(&o[..len], &n[..len])
    }

    /// Adjustment for replacing a port (or ICMP identifier) `old` with `new`.
    #[must_use]
    pub fn from_port(old: u16, new: u16) -> Self {
        Self::from_words(&[old], &[new])
    }

    /// Sum of two adjustments.
    #[must_use]
    pub fn combine(self, other: ChecksumDelta) -> Self {
        ChecksumDelta(fold(u32::from(self.0) + u32::from(other.0)))
    }

    /// The adjustment undoing `self`.
    #[must_use]
    pub fn negate(self) -> Self {
        ChecksumDelta(!self.0)
    }

    /// Raw folded value.
    #[must_use]
    pub fn value(self) -> u16 {
        self.0
    }

    /// Account for bytes `old` being replaced with `new` at byte offset `offset` of the region a
    /// checksum covers.
    ///
    /// Works at byte granularity so that edits need not be word aligned.
    pub fn track(&mut self, offset: usize, old: &[u8], new: &[u8]) {
        debug_assert_eq!(old.len(), new.len());
        let mut sum = u32::from(self.0);
        for (i, (o, n)) in old.iter().zip(new).enumerate() {
            let shift = if (offset + i) % 2 == 0 { 8 } else { 0 };
            let o = u32::from(*o) << shift;
            let n = u32::from(*n) << shift;
            sum = u32::from(fold(sum)) + (0xffff - o) + n;
        }
        self.0 = fold(sum);
    }
}

fn apply(cksum: u16, delta: ChecksumDelta) -> u16 {
    let sum = fold(u32::from(!cksum) + u32::from(delta.0));
    // ~HC is never +0 for real data; keep the result canonical when it happens anyway
    if sum == 0 { 0 } else { !sum }
}

/// Fix a checksum already finalized by the sender of an outbound packet.
#[must_use]
pub fn fix_outbound(cksum: u16, delta: ChecksumDelta) -> u16 {
    apply(cksum, delta)
}

/// Fix a checksum of a received packet, before the receiving stack validates it.
#[must_use]
pub fn fix_inbound(cksum: u16, delta: ChecksumDelta) -> u16 {
    apply(cksum, delta)
}

/// Fix a checksum carried inside packet data, such as the copy of the offending datagram quoted
/// by an ICMP error.
///
/// A zero checksum means "no checksum" for UDP over IPv4 and is left untouched.
#[must_use]
pub fn fix_embedded(cksum: u16, delta: ChecksumDelta) -> u16 {
    if cksum == 0 {
        return 0;
    }
    apply(cksum, delta)
}
