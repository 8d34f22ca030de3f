// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Classification of `ICMPv4` and `ICMPv6` message types.

use crate::ip::IpFamily;

/// How an ICMP message relates to other traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpClass {
    /// A request carrying an identifier (echo, timestamp, information, address mask).
    QueryRequest,
    /// The reply matching a [`IcmpClass::QueryRequest`].
    QueryReply,
    /// An error quoting the header of the datagram that caused it.
    Error,
    /// Anything else (router advertisements, neighbor discovery, ...).
    Other,
}

/// Classify an ICMP type.
#[must_use]
pub fn classify(family: IpFamily, icmp_type: u8) -> IcmpClass {
    match family {
        IpFamily::V4 => match icmp_type {
            // echo, timestamp, information, address mask
            8 | 13 | 15 | 17 => IcmpClass::QueryRequest,
            0 | 14 | 16 | 18 => IcmpClass::QueryReply,
            // unreachable, source quench, redirect, time exceeded, parameter problem
            3 | 4 | 5 | 11 | 12 => IcmpClass::Error,
            _ => IcmpClass::Other,
        },
        IpFamily::V6 => match icmp_type {
            128 => IcmpClass::QueryRequest,
            129 => IcmpClass::QueryReply,
            // unreachable, packet too big, time exceeded, parameter problem
            1..=4 => IcmpClass::Error,
            _ => IcmpClass::Other,
        },
    }
}

/// Whether an ICMP type is an error message.
#[must_use]
pub fn is_error(family: IpFamily, icmp_type: u8) -> bool {
    classify(family, icmp_type) == IcmpClass::Error
}

/// Whether an ICMP type is a query or a query reply, i.e. carries an identifier.
#[must_use]
pub fn is_query(family: IpFamily, icmp_type: u8) -> bool {
    matches!(
        classify(family, icmp_type),
        IcmpClass::QueryRequest | IcmpClass::QueryReply
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn v4_types() {
        assert_eq!(classify(IpFamily::V4, 8), IcmpClass::QueryRequest);
        assert_eq!(classify(IpFamily::V4, 0), IcmpClass::QueryReply);
        assert!(is_error(IpFamily::V4, 3));
        assert!(is_error(IpFamily::V4, 11));
        assert_eq!(classify(IpFamily::V4, 9), IcmpClass::Other);
    }

    #[test]
    fn v6_types() {
        assert!(is_query(IpFamily::V6, 128));
        assert!(is_query(IpFamily::V6, 129));
        assert!(is_error(IpFamily::V6, 2));
        assert!(!is_error(IpFamily::V6, 135));
    }
}
