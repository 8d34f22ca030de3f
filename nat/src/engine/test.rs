// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![allow(clippy::unwrap_used)]

use super::*;
use crate::lookup::{NamedTables, StaticInterfaces};
use crate::ranges::PortRange;
use crate::rules::{DivertSpec, NatRuleSpec, PoolSpec, PortMode, RuleKind};
use crate::sync::SyncError;
use crate::walk::{WalkItem, WalkKind};
use net::checksum::checksum;
use net::packet::test_utils::{
    assert_checksums, icmp_echo, icmp_unreachable, recompute_ip_checksum, tcp_packet, udp_packet,
};
use net::packet::{DivertAction, Tunnel};
use std::net::IpAddr;
use std::sync::Barrier;
use std::thread;
use tracing_test::traced_test;

fn addr(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn net(s: &str) -> ipnet::IpNet {
    s.parse().unwrap()
}

fn ports(first: u16, last: u16) -> PortRange {
    PortRange::new(first, last).unwrap()
}

fn tcp(src: &str, sport: u16, dst: &str, dport: u16) -> NatTuple {
    NatTuple::new(NextHeader::TCP, addr(src), sport, addr(dst), dport)
}

fn config(rules: Vec<NatRuleSpec>) -> NatConfig {
    NatConfig {
        hash_seed: Some(7),
        rules,
        ..Default::default()
    }
}

fn engine_with(config: NatConfig) -> NatEngine {
    NatEngine::new(
        config,
        Arc::new(StaticInterfaces::new().with("eth1", addr("198.51.100.1"))),
        Arc::new(NamedTables::new()),
    )
    .unwrap()
}

fn engine(rules: Vec<NatRuleSpec>) -> NatEngine {
    engine_with(config(rules))
}

/// map 10.0.0.0/24 -> 203.0.113.5 ports 20000-20100 auto
fn auto_map() -> NatRuleSpec {
    NatRuleSpec::map(net("10.0.0.0/24"), PoolSpec::Addr(addr("203.0.113.5")))
        .with_ports(ports(20000, 20100), PortMode::Auto)
}

/// rdr 203.0.113.5 port 8080 -> 10.0.0.9 port 80 tcp
fn web_rdr() -> NatRuleSpec {
    NatRuleSpec::redirect(net("203.0.113.5/32"), PoolSpec::Addr(addr("10.0.0.9")))
        .with_proto(NextHeader::TCP)
        .with_dports(ports(8080, 8080))
        .with_ports(ports(80, 80), PortMode::Sequential)
}

fn syn(src: &str, sport: u16, dst: &str, dport: u16) -> Packet {
    tcp_packet(addr(src), sport, addr(dst), dport, TcpFlags::SYN)
}

fn segment(src: &str, sport: u16, dst: &str, dport: u16, flags: TcpFlags) -> Packet {
    tcp_packet(addr(src), sport, addr(dst), dport, flags)
}

fn udp(src: &str, sport: u16, dst: &str, dport: u16) -> Packet {
    udp_packet(addr(src), sport, addr(dst), dport)
}

/// Rewrite the IPv4 flags and fragment offset of a datagram.
fn as_fragment(packet: Packet, flags_offset: [u8; 2]) -> Packet {
    let mut buf = packet.into_bytes();
    buf[6..8].copy_from_slice(&flags_offset);
    buf[10..12].copy_from_slice(&[0, 0]);
    let ck = checksum(&buf[..20]);
    buf[10..12].copy_from_slice(&ck.to_be_bytes());
    Packet::parse(buf).unwrap()
}

fn session_ids(nat: &NatEngine) -> Vec<SessionId> {
    nat.walk(WalkKind::Sessions, None, usize::MAX)
        .items
        .into_iter()
        .filter_map(|item| match item {
            WalkItem::Session(info) => Some(info.id),
            _ => None,
        })
        .collect()
}

#[test]
#[traced_test]
fn outbound_map_and_reply() {
    let nat = engine(vec![auto_map()]);
    let mut p = syn("10.0.0.5", 4000, "93.184.1.1", 80);
    assert_eq!(nat.process_outbound(&mut p), NatVerdict::Translated);
    assert_eq!(p.src_addr(), addr("203.0.113.5"));
    assert_eq!(p.ports(), Some((20005, 80)));
    assert!(p.meta().natted);
    assert_checksums(&p);

    let mut reply = segment("93.184.1.1", 80, "203.0.113.5", 20005, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(nat.process_inbound(&mut reply), NatVerdict::Translated);
    assert_eq!(reply.dst_addr(), addr("10.0.0.5"));
    assert_eq!(reply.ports(), Some((80, 4000)));
    assert_checksums(&reply);

    let mut ack = segment("10.0.0.5", 4000, "93.184.1.1", 80, TcpFlags::ACK);
    assert_eq!(nat.process_outbound(&mut ack), NatVerdict::Translated);

    let stats = nat.stats();
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.counters.created, 1);
    assert_eq!(stats.counters.translated, 3);

    let info = nat.session(session_ids(&nat)[0]).unwrap();
    assert_eq!(info.tcp_state, TcpState::Established);
    assert_eq!(info.orig, tcp("10.0.0.5", 4000, "93.184.1.1", 80));
    assert_eq!(info.xlat, tcp("203.0.113.5", 20005, "93.184.1.1", 80));
    assert_eq!(info.packets, (2, 1));
}

#[test]
fn unmatched_traffic_passes_untouched() {
    let nat = engine(vec![auto_map()]);
    let mut p = syn("192.168.1.1", 4000, "93.184.1.1", 80);
    let before = p.as_bytes().to_vec();
    assert_eq!(nat.process_outbound(&mut p), NatVerdict::Pass);
    assert_eq!(p.as_bytes(), &before[..]);
    assert!(!p.meta().natted);

    // map rules do not translate inbound first packets
    let mut p = syn("93.184.1.1", 80, "10.0.0.5", 4000);
    assert_eq!(nat.process_inbound(&mut p), NatVerdict::Pass);
    let stats = nat.stats();
    assert_eq!((stats.sessions, stats.counters.passed), (0, 2));
}

#[test]
#[traced_test]
fn inbound_redirect() {
    let nat = engine(vec![web_rdr()]);
    let mut p = syn("93.184.1.1", 5000, "203.0.113.5", 8080);
    assert_eq!(nat.process_inbound(&mut p), NatVerdict::Translated);
    assert_eq!(p.dst_addr(), addr("10.0.0.9"));
    assert_eq!(p.ports(), Some((5000, 80)));
    assert_eq!(p.src_addr(), addr("93.184.1.1"));
    assert_checksums(&p);

    let mut reply = segment("10.0.0.9", 80, "93.184.1.1", 5000, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(nat.process_outbound(&mut reply), NatVerdict::Translated);
    assert_eq!(reply.src_addr(), addr("203.0.113.5"));
    assert_eq!(reply.ports(), Some((8080, 5000)));
    assert_checksums(&reply);

    let found = nat
        .lookup_redirect(NatDirection::Inbound, &tcp("93.184.1.1", 5000, "203.0.113.5", 8080))
        .unwrap();
    assert_eq!(found.dir, NatDirection::Inbound);
    assert_eq!(found.xlat, tcp("93.184.1.1", 5000, "10.0.0.9", 80));
    // the same session, seen from the reply side
    let same = nat
        .lookup_redirect(NatDirection::Outbound, &tcp("10.0.0.9", 80, "93.184.1.1", 5000))
        .unwrap();
    assert_eq!(same.id, found.id);

    // another destination port is not redirected
    let mut other = syn("93.184.1.1", 5001, "203.0.113.5", 22);
    assert_eq!(nat.process_inbound(&mut other), NatVerdict::Pass);
}

#[test]
fn racing_first_packets_create_one_session() {
    let nat = engine(vec![auto_map()]);
    let barrier = Barrier::new(8);
    let translated: Vec<Option<(u16, u16)>> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    let mut p = syn("10.0.0.5", 4000, "93.184.1.1", 80);
                    barrier.wait();
                    assert_eq!(nat.process_outbound(&mut p), NatVerdict::Translated);
                    p.ports()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(translated.iter().all(|p| *p == translated[0]));
    let stats = nat.stats();
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.counters.created, 1);
}

#[test]
fn concurrent_flows_get_distinct_translations() {
    let nat = engine(vec![
        NatRuleSpec::map(net("10.0.0.0/16"), PoolSpec::Addr(addr("203.0.113.5")))
            .with_ports(ports(10000, 60000), PortMode::Sequential),
    ]);
    let xlat: Vec<(u16, u16)> = thread::scope(|s| {
        let handles: Vec<_> = (0..4u16)
            .map(|t| {
                let nat = &nat;
                s.spawn(move || {
                    (0..50u16)
                        .map(|i| {
                            let mut p = udp(&format!("10.0.{t}.{}", i + 1), 1000, "93.184.1.1", 53);
                            assert_eq!(nat.process_outbound(&mut p), NatVerdict::Translated);
                            p.ports().unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });
    let mut sports: Vec<u16> = xlat.iter().map(|(s, _)| *s).collect();
    sports.sort_unstable();
    sports.dedup();
    assert_eq!(sports.len(), 200);
    assert_eq!(nat.stats().sessions, 200);
}

#[test]
#[traced_test]
fn exhausted_pool_blocks() {
    let nat = engine(vec![
        NatRuleSpec::map(net("10.0.0.0/24"), PoolSpec::Addr(addr("203.0.113.5")))
            .with_ports(ports(20000, 20000), PortMode::Sequential),
    ]);
    let mut first = syn("10.0.0.5", 4000, "93.184.1.1", 80);
    assert_eq!(nat.process_outbound(&mut first), NatVerdict::Translated);
    assert_eq!(first.ports(), Some((20000, 80)));

    let mut second = syn("10.0.0.6", 4001, "93.184.1.1", 80);
    assert_eq!(
        nat.process_outbound(&mut second),
        NatVerdict::Block(BlockReason::Exhausted)
    );
    assert!(second.meta().bad_nat);
    assert_eq!(second.src_addr(), addr("10.0.0.6"));
    assert_eq!(NatVerdict::Block(BlockReason::Exhausted).rval(), -1);

    let stats = nat.stats();
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.counters.exhausted, 1);
    assert_eq!(stats.counters.blocked, 1);
    assert!(logs_contain("no translation left"));

    // a different destination makes the same translated source usable again
    let mut third = syn("10.0.0.6", 4001, "93.184.1.2", 80);
    assert_eq!(nat.process_outbound(&mut third), NatVerdict::Translated);
}

#[test]
fn next_rule_is_tried_when_the_first_is_exhausted() {
    let nat = engine(vec![
        NatRuleSpec::map(net("10.0.0.0/24"), PoolSpec::Addr(addr("203.0.113.5")))
            .with_ports(ports(20000, 20000), PortMode::Sequential),
        NatRuleSpec::map(net("10.0.0.0/16"), PoolSpec::Addr(addr("203.0.113.6")))
            .with_ports(ports(30000, 30010), PortMode::Sequential),
    ]);
    let mut a = syn("10.0.0.5", 4000, "93.184.1.1", 80);
    let mut b = syn("10.0.0.6", 4000, "93.184.1.1", 80);
    assert_eq!(nat.process_outbound(&mut a), NatVerdict::Translated);
    assert_eq!(nat.process_outbound(&mut b), NatVerdict::Translated);
    assert_eq!(a.src_addr(), addr("203.0.113.5"));
    assert_eq!((b.src_addr(), b.ports()), (addr("203.0.113.6"), Some((30000, 80))));
    assert_eq!(nat.stats().counters.exhausted, 1);
}

#[test]
fn udp_and_icmp_queries() {
    let nat = engine(vec![auto_map()]);
    let mut q = udp("10.0.0.7", 5353, "8.8.8.8", 53);
    assert_eq!(nat.process_outbound(&mut q), NatVerdict::Translated);
    let (sport, _) = q.ports().unwrap();
    assert!((20000..=20100).contains(&sport));
    assert_checksums(&q);
    let mut answer = udp("8.8.8.8", 53, "203.0.113.5", sport);
    assert_eq!(nat.process_inbound(&mut answer), NatVerdict::Translated);
    assert_eq!((answer.dst_addr(), answer.ports()), (addr("10.0.0.7"), Some((53, 5353))));
    assert_checksums(&answer);

    let mut ping = icmp_echo(addr("10.0.0.5"), addr("93.184.1.1"), 777, 1, false);
    assert_eq!(nat.process_outbound(&mut ping), NatVerdict::Translated);
    assert_eq!(ping.src_addr(), addr("203.0.113.5"));
    let (id, _) = ping.ports().unwrap();
    assert!((20000..=20100).contains(&id));
    assert_checksums(&ping);
    let mut pong = icmp_echo(addr("93.184.1.1"), addr("203.0.113.5"), id, 1, true);
    assert_eq!(nat.process_inbound(&mut pong), NatVerdict::Translated);
    assert_eq!((pong.dst_addr(), pong.ports()), (addr("10.0.0.5"), Some((777, 777))));
    assert_checksums(&pong);
}

#[test]
fn ipv6_map() {
    let nat = engine(vec![
        NatRuleSpec::map(net("fd00::/64"), PoolSpec::Addr(addr("2001:db8::5")))
            .with_ports(ports(40000, 40100), PortMode::Sequential),
    ]);
    let mut p = udp("fd00::5", 4000, "2001:db8:1::1", 53);
    assert_eq!(nat.process_outbound(&mut p), NatVerdict::Translated);
    assert_eq!(p.src_addr(), addr("2001:db8::5"));
    assert_checksums(&p);

    // IPv4 traffic never matches an IPv6 rule
    let mut v4 = udp("10.0.0.5", 4000, "8.8.8.8", 53);
    assert_eq!(nat.process_outbound(&mut v4), NatVerdict::Pass);
}

#[test]
fn checksums_survive_translation_both_ways() {
    bolero::check!()
        .with_type::<(u8, u16, u16)>()
        .with_iterations(200)
        .for_each(|&(host, sport, dport)| {
            let nat = engine(vec![auto_map()]);
            let src = format!("10.0.0.{host}");
            let mut out = segment(&src, sport, "93.184.1.1", dport, TcpFlags::ACK);
            assert_eq!(nat.process_outbound(&mut out), NatVerdict::Translated);
            assert_checksums(&out);
            let (xport, _) = out.ports().unwrap();
            let mut back = segment("93.184.1.1", dport, "203.0.113.5", xport, TcpFlags::ACK);
            assert_eq!(nat.process_inbound(&mut back), NatVerdict::Translated);
            assert_checksums(&back);
            assert_eq!(back.dst_addr(), addr(&src));
            assert_eq!(back.ports(), Some((dport, sport)));
        });
}

#[test]
#[traced_test]
fn icmp_error_about_a_forward_datagram() {
    let nat = engine(vec![auto_map()]);
    let mut p = syn("10.0.0.5", 4000, "93.184.1.1", 80);
    assert_eq!(nat.process_outbound(&mut p), NatVerdict::Translated);

    // a router beyond the NAT reports the translated segment
    let mut err = icmp_unreachable(addr("198.51.100.254"), addr("203.0.113.5"), &p, p.len());
    assert_eq!(nat.process_inbound(&mut err), NatVerdict::Translated);
    assert_eq!(err.dst_addr(), addr("10.0.0.5"));
    assert_eq!(err.src_addr(), addr("198.51.100.254"));
    assert_eq!(
        NatTuple::of_embedded(&err),
        Some(tcp("10.0.0.5", 4000, "93.184.1.1", 80))
    );
    assert_checksums(&err);

    // a truncated quote still carries the ports
    let mut short = icmp_unreachable(addr("198.51.100.254"), addr("203.0.113.5"), &p, 28);
    assert_eq!(nat.process_inbound(&mut short), NatVerdict::Translated);
    assert_eq!(short.dst_addr(), addr("10.0.0.5"));
    assert_checksums(&short);
    assert_eq!(nat.stats().counters.icmp_translated, 2);
}

#[test]
fn icmp_error_about_a_reply() {
    let nat = engine(vec![web_rdr()]);
    let mut p = syn("93.184.1.1", 5000, "203.0.113.5", 8080);
    assert_eq!(nat.process_inbound(&mut p), NatVerdict::Translated);
    let mut reply = segment("10.0.0.9", 80, "93.184.1.1", 5000, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(nat.process_outbound(&mut reply), NatVerdict::Translated);

    let mut err =
        icmp_unreachable(addr("198.51.100.254"), addr("203.0.113.5"), &reply, reply.len());
    assert_eq!(nat.process_inbound(&mut err), NatVerdict::Translated);
    assert_eq!(err.dst_addr(), addr("10.0.0.9"));
    assert_eq!(
        NatTuple::of_embedded(&err),
        Some(tcp("10.0.0.9", 80, "93.184.1.1", 5000))
    );
    assert_checksums(&err);
}

#[test]
fn icmp_error_from_the_inside() {
    let nat = engine(vec![auto_map()]);
    let mut p = syn("10.0.0.5", 4000, "93.184.1.1", 80);
    assert_eq!(nat.process_outbound(&mut p), NatVerdict::Translated);
    let mut reply = segment("93.184.1.1", 80, "203.0.113.5", 20005, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(nat.process_inbound(&mut reply), NatVerdict::Translated);

    // the internal host rejects the (already translated) reply
    let mut err = icmp_unreachable(addr("10.0.0.5"), addr("93.184.1.1"), &reply, reply.len());
    assert_eq!(nat.process_outbound(&mut err), NatVerdict::Translated);
    assert_eq!(err.src_addr(), addr("203.0.113.5"));
    assert_eq!(
        NatTuple::of_embedded(&err),
        Some(tcp("93.184.1.1", 80, "203.0.113.5", 20005))
    );
    assert_checksums(&err);
}

#[test]
fn unknown_icmp_errors_pass() {
    let nat = engine(vec![auto_map()]);
    let stray = syn("203.0.113.5", 20050, "93.184.1.1", 80);
    let mut err =
        icmp_unreachable(addr("198.51.100.254"), addr("203.0.113.5"), &stray, stray.len());
    let before = err.as_bytes().to_vec();
    assert_eq!(nat.process_inbound(&mut err), NatVerdict::Pass);
    assert_eq!(err.as_bytes(), &before[..]);
    assert_eq!(nat.stats().counters.icmp_miss, 1);
}

#[test]
fn fragments_follow_their_first_fragment() {
    let nat = engine(vec![auto_map()]);
    // first fragment: MF set, offset 0
    let mut head = as_fragment(udp("10.0.0.5", 4000, "93.184.1.1", 53), [0x20, 0x00]);
    assert_eq!(nat.process_outbound(&mut head), NatVerdict::Translated);
    assert_eq!(head.src_addr(), addr("203.0.113.5"));
    assert_eq!(nat.stats().fragments, 1);

    // last fragment: offset 3 (24 bytes), no ports
    let mut tail = as_fragment(udp("10.0.0.5", 4000, "93.184.1.1", 53), [0x00, 0x03]);
    assert!(tail.ports().is_none());
    let before = tail.as_bytes()[20..].to_vec();
    assert_eq!(nat.process_outbound(&mut tail), NatVerdict::Translated);
    assert_eq!(tail.src_addr(), addr("203.0.113.5"));
    assert_eq!(&tail.as_bytes()[20..], &before[..]);
    assert_eq!(
        recompute_ip_checksum(&tail),
        Some(u16::from_be_bytes([tail.as_bytes()[10], tail.as_bytes()[11]]))
    );

    // a fragment of an unknown train
    let mut stray = as_fragment(udp("10.0.0.77", 4000, "93.184.1.1", 53), [0x00, 0x03]);
    assert_eq!(nat.process_outbound(&mut stray), NatVerdict::Pass);

    let counters = nat.stats().counters;
    assert_eq!((counters.frag_hit, counters.frag_miss), (1, 1));
    assert_eq!(nat.stats().sessions, 1);
}

#[test]
fn fragment_trains_age_out() {
    let nat = engine(vec![auto_map()]);
    let mut head = as_fragment(udp("10.0.0.5", 4000, "93.184.1.1", 53), [0x20, 0x00]);
    assert_eq!(nat.process_outbound(&mut head), NatVerdict::Translated);
    // 60 seconds at 500ms per tick
    nat.advance(120);
    assert_eq!(nat.stats().fragments, 0);
    let mut tail = as_fragment(udp("10.0.0.5", 4000, "93.184.1.1", 53), [0x00, 0x03]);
    assert_eq!(nat.process_outbound(&mut tail), NatVerdict::Pass);
}

#[test]
#[traced_test]
fn sessions_expire_when_idle() {
    let nat = engine(vec![auto_map()]);
    let mut p = udp("10.0.0.5", 4000, "8.8.8.8", 53);
    assert_eq!(nat.process_outbound(&mut p), NatVerdict::Translated);
    // udp times out after 120s, 240 ticks
    assert_eq!(nat.advance(200), 0);
    let mut again = udp("10.0.0.5", 4000, "8.8.8.8", 53);
    assert_eq!(nat.process_outbound(&mut again), NatVerdict::Translated);
    assert_eq!(nat.advance(239), 0);
    assert_eq!(nat.tick(), 1);
    let stats = nat.stats();
    assert_eq!(stats.sessions, 0);
    assert_eq!(stats.counters.expired, 1);
    assert_eq!(stats.now, 440);
    // the translation is free again
    let mut p = udp("10.0.0.5", 4000, "8.8.8.8", 53);
    assert_eq!(nat.process_outbound(&mut p), NatVerdict::Translated);
    assert_eq!(nat.stats().counters.created, 2);
}

#[test]
fn aging_never_removes_live_sessions_early() {
    bolero::check!()
        .with_type::<Vec<u8>>()
        .with_iterations(50)
        .for_each(|steps| {
            let nat = engine(vec![auto_map()]);
            let mut p = udp("10.0.0.5", 4000, "8.8.8.8", 53);
            assert_eq!(nat.process_outbound(&mut p), NatVerdict::Translated);
            let mut idle = 0u64;
            for step in steps.iter().take(16) {
                let step = u64::from(*step % 64);
                nat.advance(step);
                idle += step;
                let live = nat.stats().sessions == 1;
                assert_eq!(live, idle < 240, "idle {idle}");
                if !live {
                    break;
                }
            }
        });
}

#[test]
fn tcp_teardown_moves_queues() {
    let nat = engine(vec![auto_map()]);
    let flows = [("10.0.0.5", 4000), ("10.0.0.6", 4001)];
    for (src, port) in flows {
        let mut p = syn(src, port, "93.184.1.1", 80);
        assert_eq!(nat.process_outbound(&mut p), NatVerdict::Translated);
    }
    let mut synack = segment("93.184.1.1", 80, "203.0.113.5", 20005, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(nat.process_inbound(&mut synack), NatVerdict::Translated);
    let mut ack = segment("10.0.0.5", 4000, "93.184.1.1", 80, TcpFlags::ACK);
    assert_eq!(nat.process_outbound(&mut ack), NatVerdict::Translated);
    let mut fin = segment("10.0.0.5", 4000, "93.184.1.1", 80, TcpFlags::FIN | TcpFlags::ACK);
    assert_eq!(nat.process_outbound(&mut fin), NatVerdict::Translated);

    let queues = nat.stats().queues;
    let len = |id: QueueId| queues.iter().find(|q| q.queue == id).map_or(0, |q| q.len);
    assert_eq!(len(QueueId::Tcp(TcpState::FinWait)), 1);
    assert_eq!(len(QueueId::Tcp(TcpState::SynSent)), 1);

    assert_eq!(nat.flush(FlushMode::ClosingTcp), 1);
    assert_eq!(nat.stats().sessions, 1);
}

#[test]
fn flush_modes() {
    let nat = engine(vec![auto_map(), web_rdr()]);
    let mut a = udp("10.0.0.5", 4000, "8.8.8.8", 53);
    assert_eq!(nat.process_outbound(&mut a), NatVerdict::Translated);
    nat.advance(100);
    let mut b = udp("10.0.0.6", 4000, "8.8.8.8", 53);
    assert_eq!(nat.process_outbound(&mut b), NatVerdict::Translated);
    let mut c = syn("93.184.1.1", 5000, "203.0.113.5", 8080);
    assert_eq!(nat.process_inbound(&mut c), NatVerdict::Translated);
    assert_eq!(nat.stats().sessions, 3);

    // 30 seconds are 60 ticks: only the first session is that idle
    assert_eq!(nat.flush(FlushMode::IdleFor(30)), 1);
    let rdr = nat
        .lookup_redirect(NatDirection::Inbound, &tcp("93.184.1.1", 5000, "203.0.113.5", 8080))
        .unwrap()
        .rule;
    assert_eq!(nat.flush(FlushMode::Rule(rdr)), 1);
    assert_eq!(nat.flush(FlushMode::All), 1);
    let stats = nat.stats();
    assert_eq!((stats.sessions, stats.counters.flushed), (0, 3));
    assert!(stats.queues.iter().all(|q| q.len == 0));
}

#[test]
#[traced_test]
fn removing_rules() {
    let nat = engine(vec![]);
    let keep = nat.add_rule(auto_map().with_name("keep")).unwrap();
    let purge = nat
        .add_rule(
            NatRuleSpec::map(net("10.1.0.0/24"), PoolSpec::Addr(addr("203.0.113.6")))
                .with_flags(RuleFlags::PURGE),
        )
        .unwrap();
    let mut a = syn("10.0.0.5", 4000, "93.184.1.1", 80);
    let mut b = syn("10.1.0.5", 4000, "93.184.1.1", 80);
    assert_eq!(nat.process_outbound(&mut a), NatVerdict::Translated);
    assert_eq!(nat.process_outbound(&mut b), NatVerdict::Translated);

    assert_eq!(nat.remove_rule(purge).unwrap(), 1);
    assert_eq!(nat.remove_rule(keep).unwrap(), 0);
    assert!(matches!(
        nat.remove_rule(keep),
        Err(NatError::Rule(RuleError::NotFound(_)))
    ));

    // the surviving session still translates, new flows no longer do
    let mut reply = segment("93.184.1.1", 80, "203.0.113.5", 20005, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(nat.process_inbound(&mut reply), NatVerdict::Translated);
    assert_eq!(reply.dst_addr(), addr("10.0.0.5"));
    let mut fresh = syn("10.0.0.5", 4001, "93.184.1.1", 80);
    assert_eq!(nat.process_outbound(&mut fresh), NatVerdict::Pass);

    let stats = nat.stats();
    assert_eq!((stats.rules, stats.sessions), (0, 1));
    assert!(logs_contain("Removed rule"));
}

#[test]
fn rules_naming_a_proxy_need_it_registered() {
    let nat = engine(vec![]);
    let spec = NatRuleSpec {
        proxy: Some("ftp".to_string()),
        ..auto_map()
    };
    assert!(matches!(
        nat.add_rule(spec.clone()),
        Err(NatError::Rule(RuleError::UnknownProxy(_)))
    ));
    assert!(nat.register_proxy("ftp"));
    assert!(!nat.register_proxy("ftp"));
    nat.add_rule(spec).unwrap();

    let mut p = syn("10.0.0.5", 4000, "93.184.1.1", 21);
    assert_eq!(nat.process_outbound(&mut p), NatVerdict::Translated);
    let info = nat.session(session_ids(&nat)[0]).unwrap();
    assert_eq!(info.proxy.as_deref(), Some("ftp"));
}

#[test]
#[traced_test]
fn extra_flush_under_pressure() {
    let nat = engine_with(NatConfig {
        table_max: 10,
        table_wm_high: 50,
        table_wm_low: 30,
        ..config(vec![auto_map()])
    });
    for host in 1..=5 {
        let mut p = udp(&format!("10.0.0.{host}"), 4000, "8.8.8.8", 53);
        assert_eq!(nat.process_outbound(&mut p), NatVerdict::Translated);
    }
    // idle for more than 30 seconds, well before the udp timeout
    nat.advance(61);
    let mut p = udp("10.0.0.6", 4000, "8.8.8.8", 53);
    assert_eq!(nat.process_outbound(&mut p), NatVerdict::Translated);

    let stats = nat.stats();
    assert_eq!(stats.counters.extra_flush, 1);
    assert_eq!(stats.counters.flushed, 3);
    assert_eq!(stats.sessions, 3);
    assert!(logs_contain("flushed 3 sessions"));
}

#[test]
fn full_table_blocks() {
    let nat = engine_with(NatConfig {
        table_max: 2,
        table_wm_high: 100,
        table_wm_low: 100,
        ..config(vec![auto_map()])
    });
    for host in 1..=2 {
        let mut p = udp(&format!("10.0.0.{host}"), 4000, "8.8.8.8", 53);
        assert_eq!(nat.process_outbound(&mut p), NatVerdict::Translated);
    }
    let mut p = udp("10.0.0.3", 4000, "8.8.8.8", 53);
    assert_eq!(
        nat.process_outbound(&mut p),
        NatVerdict::Block(BlockReason::TableFull)
    );
    let stats = nat.stats();
    assert_eq!((stats.sessions, stats.counters.table_max), (2, 1));
}

#[test]
fn full_bucket_blocks() {
    let nat = engine_with(NatConfig {
        table_size: 1,
        max_bucket: 1,
        ..config(vec![auto_map()])
    });
    let mut a = udp("10.0.0.1", 4000, "8.8.8.8", 53);
    assert_eq!(nat.process_outbound(&mut a), NatVerdict::Translated);
    let mut b = udp("10.0.0.2", 4000, "8.8.8.8", 53);
    assert!(matches!(
        nat.process_outbound(&mut b),
        NatVerdict::Block(BlockReason::BucketFull(_))
    ));
    let counters = nat.stats().counters;
    assert_eq!(counters.bucket_max_orig + counters.bucket_max_xlat, 1);
}

#[test]
#[traced_test]
fn wildcard_sessions_are_promoted_once() {
    let nat = engine(vec![auto_map()]);
    let rule = nat.walk(WalkKind::Rules, None, 1).items.into_iter().find_map(|i| match i {
        WalkItem::Rule(r) => Some(r.id),
        _ => None,
    });
    let id = nat
        .add_wildcard_session(WildcardSpec {
            rule: rule.unwrap(),
            dir: NatDirection::Outbound,
            orig: tcp("10.0.0.5", 0, "93.184.1.1", 20),
            xlat: tcp("203.0.113.5", 0, "93.184.1.1", 20),
            wild: WildPorts::SPORT,
        })
        .unwrap();
    assert_eq!(nat.session(id).unwrap().wild, WildPorts::SPORT);

    for _ in 0..2 {
        let mut p = syn("10.0.0.5", 40000, "93.184.1.1", 20);
        assert_eq!(nat.process_outbound(&mut p), NatVerdict::Translated);
        assert_eq!(p.src_addr(), addr("203.0.113.5"));
        assert_eq!(p.ports(), Some((40000, 20)));
        assert_checksums(&p);
    }
    let info = nat.session(id).unwrap();
    assert!(info.wild.is_empty());
    assert_eq!(info.orig, tcp("10.0.0.5", 40000, "93.184.1.1", 20));

    let stats = nat.stats();
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.counters.promoted, 1);
    assert_eq!(stats.counters.created, 1);
}

#[test]
fn wildcard_sessions_are_promoted_by_replies() {
    let nat = engine(vec![auto_map()]);
    let rule = nat.add_rule(web_rdr()).unwrap();
    let id = nat
        .add_wildcard_session(WildcardSpec {
            rule,
            dir: NatDirection::Inbound,
            orig: tcp("93.184.1.1", 0, "203.0.113.5", 8080),
            xlat: tcp("93.184.1.1", 0, "10.0.0.9", 80),
            wild: WildPorts::SPORT,
        })
        .unwrap();
    // the internal server speaks first
    let mut p = syn("10.0.0.9", 80, "93.184.1.1", 6000);
    assert_eq!(nat.process_outbound(&mut p), NatVerdict::Translated);
    assert_eq!(p.src_addr(), addr("203.0.113.5"));
    assert_eq!(p.ports(), Some((8080, 6000)));
    assert_eq!(
        nat.session(id).unwrap().orig,
        tcp("93.184.1.1", 6000, "203.0.113.5", 8080)
    );
}

#[test]
fn sessions_survive_export_and_import() {
    let a = engine(vec![auto_map()]);
    let mut p = syn("10.0.0.5", 4000, "93.184.1.1", 80);
    assert_eq!(a.process_outbound(&mut p), NatVerdict::Translated);
    let id = session_ids(&a)[0];
    let record = a.export_session(id).unwrap();
    assert_eq!(record.kind, RuleKind::Map);
    assert_eq!(record.forward.packets, 1);

    let text = serde_json::to_string(&record).unwrap();
    let record: crate::sync::SessionRecord = serde_json::from_str(&text).unwrap();

    let b = engine(vec![]);
    let imported = b.import_session(record.clone()).unwrap();
    assert_eq!(b.stats().rules, 1);
    assert_eq!(b.stats().counters.imported, 1);
    assert_eq!(b.session(imported).unwrap().packets, (1, 0));
    assert!(matches!(
        b.import_session(record),
        Err(SyncError::Duplicate(_))
    ));

    let mut reply = segment("93.184.1.1", 80, "203.0.113.5", 20005, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(b.process_inbound(&mut reply), NatVerdict::Translated);
    assert_eq!(reply.dst_addr(), addr("10.0.0.5"));

    assert_eq!(a.flush(FlushMode::All), 1);
    assert_eq!(a.export_session(id), Err(SyncError::NotFound(id)));
}

#[test]
fn imports_reuse_an_identical_rule() {
    let a = engine(vec![auto_map()]);
    let b = engine(vec![auto_map()]);
    let mut p = udp("10.0.0.5", 4000, "8.8.8.8", 53);
    assert_eq!(a.process_outbound(&mut p), NatVerdict::Translated);
    let record = a.export_session(session_ids(&a)[0]).unwrap();
    b.import_session(record).unwrap();
    assert_eq!(b.stats().rules, 1);

    let mut bad = a.export_session(session_ids(&a)[0]).unwrap();
    bad.kind = RuleKind::Redirect;
    assert!(matches!(b.import_session(bad), Err(SyncError::Invalid(_))));
}

#[test]
fn walks_are_paginated() {
    let nat = engine(vec![auto_map(), web_rdr()]);
    for host in 1..=5 {
        let mut p = udp(&format!("10.0.0.{host}"), 4000, "8.8.8.8", 53);
        assert_eq!(nat.process_outbound(&mut p), NatVerdict::Translated);
    }
    let mut seen = Vec::new();
    let mut token = None;
    let mut pages = 0;
    loop {
        let page = nat.walk(WalkKind::Sessions, token, 2);
        pages += 1;
        seen.extend(page.items);
        token = page.next;
        if token.is_none() {
            break;
        }
    }
    assert_eq!((seen.len(), pages), (5, 3));

    let page = nat.walk(WalkKind::Rules, None, 1);
    assert_eq!(page.items.len(), 1);
    let next = nat.walk(WalkKind::Rules, page.next, 1);
    assert_eq!(next.items.len(), 1);
    assert!(next.next.is_none());

    // a token of another kind restarts
    let restarted = nat.walk(WalkKind::Sessions, page.next, 10);
    assert_eq!(restarted.items.len(), 5);
}

#[test]
fn bimap_translates_both_directions() {
    let nat = engine(vec![NatRuleSpec {
        kind: RuleKind::Bimap,
        ..NatRuleSpec::map(net("10.0.1.0/24"), PoolSpec::Cidr(net("203.0.113.0/24")))
    }]);
    let mut out = syn("10.0.1.77", 4000, "93.184.1.1", 80);
    assert_eq!(nat.process_outbound(&mut out), NatVerdict::Translated);
    assert_eq!((out.src_addr(), out.ports()), (addr("203.0.113.77"), Some((4000, 80))));
    assert_checksums(&out);

    let mut inb = syn("93.184.1.1", 5000, "203.0.113.9", 22);
    assert_eq!(nat.process_inbound(&mut inb), NatVerdict::Translated);
    assert_eq!(inb.dst_addr(), addr("10.0.1.9"));
    assert_checksums(&inb);
    let mut back = segment("10.0.1.9", 22, "93.184.1.1", 5000, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(nat.process_outbound(&mut back), NatVerdict::Translated);
    assert_eq!(back.src_addr(), addr("203.0.113.9"));
    assert_eq!(nat.stats().sessions, 2);
}

#[test]
fn divert_sessions_annotate_packets() {
    let local = addr("192.0.2.1");
    let remote = addr("192.0.2.99");
    let nat = engine(vec![NatRuleSpec {
        kind: RuleKind::Divert,
        divert: Some(DivertSpec {
            local,
            remote,
            dport: 4789,
        }),
        ports: Some(ports(50000, 50001)),
        ..NatRuleSpec::map(net("10.0.0.0/24"), PoolSpec::Identity)
    }]);
    let mut p = syn("10.0.0.5", 4000, "93.184.1.1", 80);
    let before = p.as_bytes().to_vec();
    assert_eq!(nat.process_outbound(&mut p), NatVerdict::Translated);
    assert_eq!(p.as_bytes(), &before[..]);
    assert_eq!(
        p.meta().divert,
        Some(DivertAction::Encapsulate(Tunnel {
            src: local,
            sport: 50000,
            dst: remote,
            dport: 4789,
        }))
    );

    let mut wrapped = udp("192.0.2.99", 4789, "192.0.2.1", 50000);
    assert_eq!(nat.process_inbound(&mut wrapped), NatVerdict::Translated);
    assert_eq!(
        wrapped.meta().divert,
        Some(DivertAction::Decapsulate(Tunnel {
            src: addr("93.184.1.1"),
            sport: 80,
            dst: addr("10.0.0.5"),
            dport: 4000,
        }))
    );

    let outer = udp("192.0.2.1", 50000, "192.0.2.99", 4789);
    let mut err = icmp_unreachable(addr("198.51.100.254"), local, &outer, outer.len());
    assert_eq!(nat.process_inbound(&mut err), NatVerdict::Translated);
    assert_eq!(
        err.meta().divert,
        Some(DivertAction::TunnelError(Tunnel {
            src: addr("10.0.0.5"),
            sport: 4000,
            dst: addr("93.184.1.1"),
            dport: 80,
        }))
    );
}

#[test]
fn engine_from_yaml() {
    let yaml = r"
table_max: 500
tick_ms: 1000
rules:
  - kind: map
    src: { net: { net: 10.0.0.0/24 } }
    pool: { addr: 203.0.113.5 }
    ports: { first: 20000, last: 20100 }
    port_mode: sequential
";
    let nat = NatEngine::with_config(NatConfig::from_yaml(yaml).unwrap()).unwrap();
    assert_eq!(nat.stats().table_max, 500);
    let mut p = syn("10.0.0.5", 4000, "93.184.1.1", 80);
    assert_eq!(nat.process_outbound(&mut p), NatVerdict::Translated);
    assert_eq!(p.ports(), Some((20000, 80)));

    let invalid = NatConfig {
        rules: vec![NatRuleSpec::map(net("10.0.0.0/24"), PoolSpec::Addr(addr("2001:db8::1")))],
        ..Default::default()
    };
    assert!(matches!(
        NatEngine::with_config(invalid),
        Err(NatError::Rule(RuleError::FamilyMismatch))
    ));
}

#[test]
fn host_maps_go_with_their_sessions() {
    let sticky = NatRuleSpec::map(net("10.0.0.0/24"), PoolSpec::Addr(addr("203.0.113.5")))
        .with_ports(ports(20000, 20100), PortMode::Sequential)
        .with_flags(RuleFlags::STICKY);
    let nat = engine(vec![sticky]);
    let mut a = syn("10.0.0.5", 4000, "93.184.1.1", 80);
    assert_eq!(nat.process_outbound(&mut a), NatVerdict::Translated);
    nat.advance(100);
    let mut b = syn("10.0.0.5", 4001, "93.184.1.1", 80);
    assert_eq!(nat.process_outbound(&mut b), NatVerdict::Translated);
    let stats = nat.stats();
    assert_eq!((stats.sessions, stats.hostmaps), (2, 1));

    // the second session still uses the map
    assert_eq!(nat.flush(FlushMode::IdleFor(30)), 1);
    assert_eq!(nat.stats().hostmaps, 1);
    assert_eq!(nat.flush(FlushMode::All), 1);
    let stats = nat.stats();
    assert_eq!((stats.sessions, stats.hostmaps), (0, 0));
    assert!(nat.walk(WalkKind::HostMaps, None, usize::MAX).items.is_empty());

    // expiry releases them as well, udp lives 240 ticks
    let mut q = udp("10.0.0.6", 4000, "8.8.8.8", 53);
    assert_eq!(nat.process_outbound(&mut q), NatVerdict::Translated);
    assert_eq!(nat.stats().hostmaps, 1);
    assert_eq!(nat.advance(240), 1);
    assert_eq!(nat.stats().hostmaps, 0);
}

#[test]
fn ipv6_extension_headers_keep_checksums_valid() {
    let nat = engine(vec![
        NatRuleSpec::map(net("fd00::/64"), PoolSpec::Addr(addr("2001:db8::5")))
            .with_ports(ports(40000, 40100), PortMode::Sequential),
    ]);
    let mut buf = udp("fd00::5", 4000, "2001:db8:1::1", 53).into_bytes();
    // eight bytes of hop-by-hop padding in front of the udp header
    let upper = buf[6];
    buf[6] = NextHeader::HOPOPT.to_u8();
    let len = u16::from_be_bytes([buf[4], buf[5]]) + 8;
    buf[4..6].copy_from_slice(&len.to_be_bytes());
    buf.splice(40..40, [upper, 0, 1, 4, 0, 0, 0, 0]);
    let mut p = Packet::parse(buf).unwrap();
    assert_eq!(p.proto(), NextHeader::UDP);

    assert_eq!(nat.process_outbound(&mut p), NatVerdict::Translated);
    assert_eq!(p.src_addr(), addr("2001:db8::5"));
    assert_eq!(p.ports(), Some((40000, 53)));
    assert_checksums(&p);
}

#[test]
fn unmatched_first_packets_stay_off_the_creation_path() {
    let nat = engine(vec![auto_map()]);
    let mut known = syn("10.0.0.5", 4000, "93.184.1.1", 80);
    assert_eq!(nat.process_outbound(&mut known), NatVerdict::Translated);

    // a creation in progress stalls neither unmatched traffic nor known sessions
    let _creating = nat.create.lock();
    let mut other = syn("192.168.1.1", 4000, "93.184.1.1", 80);
    assert_eq!(nat.process_outbound(&mut other), NatVerdict::Pass);
    let mut inbound = syn("93.184.1.1", 80, "10.0.0.5", 4001);
    assert_eq!(nat.process_inbound(&mut inbound), NatVerdict::Pass);
    let mut ack = segment("10.0.0.5", 4000, "93.184.1.1", 80, TcpFlags::ACK);
    assert_eq!(nat.process_outbound(&mut ack), NatVerdict::Translated);
}

#[test]
fn full_fragment_cache_is_counted() {
    let nat = engine_with(NatConfig {
        frag_max: 1,
        ..config(vec![auto_map()])
    });
    let mut first = as_fragment(udp("10.0.0.5", 4000, "93.184.1.1", 53), [0x20, 0x00]);
    assert_eq!(nat.process_outbound(&mut first), NatVerdict::Translated);
    let mut second = as_fragment(udp("10.0.0.6", 4000, "93.184.1.1", 53), [0x20, 0x00]);
    assert_eq!(nat.process_outbound(&mut second), NatVerdict::Translated);
    let stats = nat.stats();
    assert_eq!((stats.fragments, stats.counters.frag_full), (1, 1));

    let mut lost = as_fragment(udp("10.0.0.6", 4000, "93.184.1.1", 53), [0x00, 0x03]);
    assert_eq!(nat.process_outbound(&mut lost), NatVerdict::Pass);
    let mut kept = as_fragment(udp("10.0.0.5", 4000, "93.184.1.1", 53), [0x00, 0x03]);
    assert_eq!(nat.process_outbound(&mut kept), NatVerdict::Translated);
    assert_eq!(kept.src_addr(), addr("203.0.113.5"));
    let counters = nat.stats().counters;
    assert_eq!((counters.frag_hit, counters.frag_miss), (1, 1));
}

#[test]
fn icmp_error_quoting_an_echo_request() {
    let nat = engine(vec![auto_map()]);
    let mut ping = icmp_echo(addr("10.0.0.5"), addr("93.184.1.1"), 777, 1, false);
    assert_eq!(nat.process_outbound(&mut ping), NatVerdict::Translated);
    let (id, _) = ping.ports().unwrap();
    assert_ne!(id, 777);

    let mut err = icmp_unreachable(addr("198.51.100.254"), addr("203.0.113.5"), &ping, ping.len());
    assert_eq!(nat.process_inbound(&mut err), NatVerdict::Translated);
    assert_eq!(err.dst_addr(), addr("10.0.0.5"));
    assert_eq!(
        NatTuple::of_embedded(&err),
        Some(NatTuple::new(NextHeader::ICMP, addr("10.0.0.5"), 777, addr("93.184.1.1"), 777))
    );
    assert_checksums(&err);
    // the quoted echo request is whole, its own checksum must hold as well
    assert_eq!(checksum(&err.as_bytes()[48..]), 0);
    assert_eq!(nat.stats().counters.icmp_translated, 1);
}

#[test]
fn icmpv6_error_about_a_forward_datagram() {
    let nat = engine(vec![
        NatRuleSpec::map(net("fd00::/64"), PoolSpec::Addr(addr("2001:db8::5")))
            .with_ports(ports(40000, 40100), PortMode::Sequential),
    ]);
    let mut sent = udp("fd00::5", 4000, "2001:db8:1::1", 53);
    assert_eq!(nat.process_outbound(&mut sent), NatVerdict::Translated);
    assert_eq!(sent.ports(), Some((40000, 53)));

    let mut err =
        icmp_unreachable(addr("2001:db8:ffff::1"), addr("2001:db8::5"), &sent, sent.len());
    assert_eq!(nat.process_inbound(&mut err), NatVerdict::Translated);
    assert_eq!(err.dst_addr(), addr("fd00::5"));
    assert_eq!(err.src_addr(), addr("2001:db8:ffff::1"));
    assert_eq!(
        NatTuple::of_embedded(&err),
        Some(NatTuple::new(NextHeader::UDP, addr("fd00::5"), 4000, addr("2001:db8:1::1"), 53))
    );
    // the ICMPv6 checksum covers the rewritten destination through the pseudo-header
    assert_checksums(&err);
}
