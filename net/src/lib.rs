// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! A library for inspecting and editing IP datagrams in place.
//!
//! The [`packet::Packet`] type wraps one IPv4 or IPv6 datagram, exposes the fields the NAT engine
//! needs (addresses, ports, ICMP identifiers, fragment status, the header embedded in ICMP errors)
//! and rewrites them while keeping every checksum valid through incremental updates
//! (see [`checksum`]).

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(clippy::should_panic_without_expect)]

pub mod checksum;
pub mod icmp;
pub mod ip;
pub mod packet;
pub mod tcp;
