// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![allow(clippy::unwrap_used)]

use super::test_utils::{assert_checksums, icmp_echo, icmp_unreachable, tcp_packet, udp_packet};
use super::*;
use crate::checksum::ChecksumDelta;
use crate::tcp::TcpFlags;

fn addr(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn src_rewrite(packet: &Packet, new: IpAddr, port: u16) -> Translation {
    let (sport, _) = packet.ports().unwrap();
    let ip_delta = ChecksumDelta::from_addrs(packet.src_addr(), new);
    let port_delta = ChecksumDelta::from_port(sport, port);
    let l4_delta = match packet.proto() {
        NextHeader::ICMP => port_delta,
        _ => ip_delta.combine(port_delta),
    };
    Translation {
        src: Some(new),
        src_port: Some(port),
        ip_delta,
        l4_delta,
        ..Default::default()
    }
}

#[test]
fn parse_tcp_syn() {
    let p = tcp_packet(addr("10.0.0.5"), 4000, addr("93.184.1.1"), 80, TcpFlags::SYN);
    assert_eq!(p.family(), IpFamily::V4);
    assert_eq!(p.proto(), NextHeader::TCP);
    assert_eq!(p.src_addr(), addr("10.0.0.5"));
    assert_eq!(p.dst_addr(), addr("93.184.1.1"));
    assert_eq!(p.ports(), Some((4000, 80)));
    assert_eq!(p.tcp_flags(), Some(TcpFlags::SYN));
    assert!(p.fragment().is_none());
    assert_checksums(&p);
}

#[test]
fn parse_rejects_garbage() {
    assert_eq!(Packet::parse(vec![]).unwrap_err(), ParseError::Empty);
    assert_eq!(Packet::parse(vec![0x10; 20]).unwrap_err(), ParseError::Version(1));
    assert!(matches!(
        Packet::parse(vec![0x45, 0, 0]).unwrap_err(),
        ParseError::Ipv4(_)
    ));
}

#[test]
fn parse_icmp_query_and_error() {
    let echo = icmp_echo(addr("10.0.0.5"), addr("8.8.8.8"), 0x1234, 1, false);
    assert!(matches!(
        echo.transport(),
        Transport::IcmpQuery { icmp_type: 8, id: 0x1234, .. }
    ));
    assert_eq!(echo.ports(), Some((0x1234, 0x1234)));

    let udp = udp_packet(addr("203.0.113.5"), 20001, addr("93.184.1.1"), 53);
    let err = icmp_unreachable(addr("93.184.1.1"), addr("203.0.113.5"), &udp, 28);
    let Transport::IcmpError { icmp_type, embedded, .. } = err.transport() else {
        panic!("expected an ICMP error, got {:?}", err.transport());
    };
    assert_eq!(*icmp_type, 3);
    assert_eq!(embedded.src, addr("203.0.113.5"));
    assert_eq!(embedded.dst, addr("93.184.1.1"));
    assert_eq!(embedded.proto, NextHeader::UDP);
    assert_eq!(
        embedded.transport,
        EmbeddedTransport::Ports {
            sport: 20001,
            dport: 53
        }
    );
    assert!(embedded.ip_checksum_ok);
}

#[test]
fn ipv4_fragment_fields() {
    let mut p = udp_packet(addr("10.0.0.5"), 1000, addr("10.0.0.9"), 2000);
    // set MF and offset 0, fix the header checksum
    p.buf[6] = 0x20;
    p.buf[10..12].copy_from_slice(&[0, 0]);
    let ck = crate::checksum::checksum(&p.buf[..20]);
    p.buf[10..12].copy_from_slice(&ck.to_be_bytes());
    let p = Packet::parse(p.into_bytes()).unwrap();
    let frag = p.fragment().unwrap();
    assert!(frag.more);
    assert!(frag.is_first());
    assert!(matches!(p.transport(), Transport::Udp { .. }));
}

/// Insert eight bytes of hop-by-hop padding after the fixed IPv6 header.
fn with_hop_by_hop(packet: Packet) -> Packet {
    let mut buf = packet.into_bytes();
    let upper = buf[6];
    buf[6] = NextHeader::HOPOPT.to_u8();
    let len = u16::from_be_bytes([buf[4], buf[5]]) + 8;
    buf[4..6].copy_from_slice(&len.to_be_bytes());
    buf.splice(40..40, [upper, 0, 1, 4, 0, 0, 0, 0]);
    Packet::parse(buf).unwrap()
}

#[test]
fn ipv6_extension_headers_are_walked() {
    let mut p = with_hop_by_hop(udp_packet(addr("fd00::5"), 4000, addr("2001:db8:1::1"), 53));
    assert_eq!(p.proto(), NextHeader::UDP);
    assert_eq!(p.l4_offset(), 48);
    assert_eq!(p.ports(), Some((4000, 53)));
    assert_checksums(&p);

    let edit = src_rewrite(&p, addr("2001:db8::5"), 20000);
    p.translate(&edit).unwrap();
    assert_eq!(p.src_addr(), addr("2001:db8::5"));
    assert_eq!(p.ports(), Some((20000, 53)));
    assert_checksums(&p);
}

#[test]
fn ipv6_fragment_behind_destination_options() {
    let whole = udp_packet(addr("fd00::5"), 4000, addr("2001:db8:1::1"), 53).into_bytes();
    let mut buf = whole[..40].to_vec();
    buf[6] = NextHeader::IPV6_DSTOPTS.to_u8();
    buf.extend_from_slice(&[NextHeader::IPV6_FRAGMENT.to_u8(), 0, 1, 4, 0, 0, 0, 0]);
    // offset 1, last fragment, id 42
    buf.extend_from_slice(&[NextHeader::UDP.to_u8(), 0, 0, 8, 0, 0, 0, 42]);
    buf.extend_from_slice(&whole[40..]);
    let len = u16::try_from(buf.len() - 40).unwrap();
    buf[4..6].copy_from_slice(&len.to_be_bytes());

    let p = Packet::parse(buf).unwrap();
    assert_eq!(
        p.fragment(),
        Some(Fragment {
            id: 42,
            offset: 1,
            more: false
        })
    );
    assert_eq!(p.proto(), NextHeader::UDP);
    assert_eq!(p.l4_offset(), 56);
    assert_eq!(p.transport(), &Transport::Other);
}

#[test]
fn truncated_ipv6_extension_header() {
    let mut buf = udp_packet(addr("fd00::5"), 4000, addr("2001:db8:1::1"), 53).into_bytes();
    // the udp header now reads as a hop-by-hop header far longer than the datagram
    buf[6] = NextHeader::HOPOPT.to_u8();
    let p = Packet::parse(buf).unwrap();
    assert_eq!(p.proto(), NextHeader::HOPOPT);
    assert_eq!(p.l4_offset(), 40);
    assert_eq!(p.ports(), None);
    assert_eq!(p.transport(), &Transport::Other);
}

#[test]
fn translate_tcp_source() {
    let mut p = tcp_packet(addr("10.0.0.5"), 4000, addr("93.184.1.1"), 80, TcpFlags::SYN);
    let edit = src_rewrite(&p, addr("203.0.113.5"), 20005);
    p.translate(&edit).unwrap();
    assert_eq!(p.src_addr(), addr("203.0.113.5"));
    assert_eq!(p.ports(), Some((20005, 80)));
    assert!(p.meta().natted);
    assert_checksums(&p);

    // cross-check against etherparse
    let (ip, rest) = etherparse::Ipv4Header::from_slice(p.as_bytes()).unwrap();
    assert_eq!(ip.header_checksum, ip.calc_header_checksum());
    let (tcp, payload) = etherparse::TcpHeader::from_slice(rest).unwrap();
    assert_eq!(tcp.checksum, tcp.calc_checksum_ipv4(&ip, payload).unwrap());
}

#[test]
fn translate_udp_destination_reply() {
    let mut p = udp_packet(addr("93.184.1.1"), 53, addr("203.0.113.5"), 20005);
    let new = addr("10.0.0.5");
    let ip_delta = ChecksumDelta::from_addrs(p.dst_addr(), new);
    let edit = Translation {
        dst: Some(new),
        dst_port: Some(4000),
        ip_delta,
        l4_delta: ip_delta.combine(ChecksumDelta::from_port(20005, 4000)),
        context: ChecksumContext::Inbound,
        ..Default::default()
    };
    p.translate(&edit).unwrap();
    assert_eq!(p.dst_addr(), new);
    assert_eq!(p.ports(), Some((53, 4000)));
    assert_checksums(&p);
}

#[test]
fn translate_icmp_identifier() {
    let mut p = icmp_echo(addr("10.0.0.5"), addr("8.8.8.8"), 0x1234, 7, false);
    let edit = src_rewrite(&p, addr("203.0.113.5"), 20050);
    p.translate(&edit).unwrap();
    assert_eq!(p.ports(), Some((20050, 20050)));
    assert_checksums(&p);
}

#[test]
fn translate_ipv6_tcp() {
    let mut p = tcp_packet(addr("fd00::5"), 4000, addr("2001:db8::1"), 443, TcpFlags::SYN);
    let edit = src_rewrite(&p, addr("2001:db8:ffff::5"), 30000);
    p.translate(&edit).unwrap();
    assert_eq!(p.src_addr(), addr("2001:db8:ffff::5"));
    assert_checksums(&p);
}

#[test]
fn translate_rejects_bad_edits() {
    let mut p = tcp_packet(addr("10.0.0.5"), 4000, addr("93.184.1.1"), 80, TcpFlags::SYN);
    let before = p.as_bytes().to_vec();
    let edit = Translation {
        src: Some(addr("fd00::1")),
        ..Default::default()
    };
    assert!(matches!(
        p.translate(&edit),
        Err(EditError::FamilyMismatch { .. })
    ));
    assert_eq!(p.as_bytes(), before.as_slice());

    let mut err = icmp_unreachable(addr("93.184.1.1"), addr("10.0.0.5"), &p, 28);
    let edit = Translation {
        src_port: Some(1),
        ..Default::default()
    };
    assert_eq!(err.translate(&edit), Err(EditError::NoPorts));
    assert_eq!(
        p.translate_embedded(&EmbeddedEdit::default()),
        Err(EditError::NotIcmpError)
    );
}

#[test]
fn translate_embedded_restores_quoted_flow() {
    // 10.0.0.5:4000 was mapped to 203.0.113.5:20005; a router reports the translated segment
    let sent = tcp_packet(addr("203.0.113.5"), 20005, addr("93.184.1.1"), 80, TcpFlags::SYN);
    for quote in [28, 48, sent.len()] {
        let mut err = icmp_unreachable(addr("198.51.100.1"), addr("203.0.113.5"), &sent, quote);
        let orig = addr("10.0.0.5");
        let ip_delta = ChecksumDelta::from_addrs(addr("203.0.113.5"), orig);
        let edit = EmbeddedEdit {
            src: Some(orig),
            src_port: Some(4000),
            ip_delta,
            l4_delta: ip_delta.combine(ChecksumDelta::from_port(20005, 4000)),
            outer_dst: Some(orig),
            context: ChecksumContext::Inbound,
            ..Default::default()
        };
        err.translate_embedded(&edit).unwrap();
        assert_eq!(err.dst_addr(), orig);
        let Transport::IcmpError { embedded, .. } = err.transport() else {
            panic!("still an ICMP error");
        };
        assert_eq!(embedded.src, orig);
        assert_eq!(
            embedded.transport,
            EmbeddedTransport::Ports {
                sport: 4000,
                dport: 80
            }
        );
        assert!(embedded.ip_checksum_ok);
        assert_checksums(&err);
    }
}

#[test]
fn translate_embedded_full_quote_keeps_inner_tcp_checksum_valid() {
    let sent = tcp_packet(addr("203.0.113.5"), 20005, addr("93.184.1.1"), 80, TcpFlags::SYN);
    let mut err = icmp_unreachable(addr("93.184.1.1"), addr("203.0.113.5"), &sent, sent.len());
    let orig = addr("10.0.0.5");
    let ip_delta = ChecksumDelta::from_addrs(addr("203.0.113.5"), orig);
    err.translate_embedded(&EmbeddedEdit {
        src: Some(orig),
        src_port: Some(4000),
        ip_delta,
        l4_delta: ip_delta.combine(ChecksumDelta::from_port(20005, 4000)),
        outer_dst: Some(orig),
        ..Default::default()
    })
    .unwrap();
    let Transport::IcmpError { embedded, .. } = err.transport() else {
        panic!("still an ICMP error");
    };
    let quoted = Packet::parse(err.as_bytes()[embedded.ip_offset..].to_vec()).unwrap();
    assert_eq!(quoted.src_addr(), orig);
    assert_checksums(&quoted);
}

#[test]
fn translate_embedded_ipv6() {
    let sent = udp_packet(addr("2001:db8:ffff::5"), 30000, addr("2001:db8::1"), 53);
    let mut err =
        icmp_unreachable(addr("2001:db8::1"), addr("2001:db8:ffff::5"), &sent, sent.len());
    let orig = addr("fd00::5");
    let ip_delta = ChecksumDelta::from_addrs(addr("2001:db8:ffff::5"), orig);
    err.translate_embedded(&EmbeddedEdit {
        src: Some(orig),
        src_port: Some(4000),
        ip_delta,
        l4_delta: ip_delta.combine(ChecksumDelta::from_port(30000, 4000)),
        outer_dst: Some(orig),
        context: ChecksumContext::Inbound,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(err.dst_addr(), orig);
    assert_checksums(&err);
}

#[test]
fn translate_is_checksum_exact_for_any_rewrite() {
    bolero::check!()
        .with_type()
        .for_each(|(a, b, sport, dport, new_port, udp): &([u8; 4], [u8; 4], u16, u16, u16, bool)| {
            let src = IpAddr::from(*a);
            let dst = addr("93.184.1.1");
            let mut p = if *udp {
                udp_packet(src, *sport, dst, *dport)
            } else {
                tcp_packet(src, *sport, dst, *dport, TcpFlags::SYN)
            };
            let edit = src_rewrite(&p, IpAddr::from(*b), *new_port);
            p.translate(&edit).unwrap();
            assert_checksums(&p);
        });
}
