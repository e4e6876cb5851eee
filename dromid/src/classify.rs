//! Raw queued packets to [`Flow`]s.

use std::cmp;
use std::net::IpAddr;

use dromi_interface::{Action, Flow, PacketId, Port, Proto};
use log::warn;
use pnet::packet::icmp::IcmpPacket;
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;

use crate::dns::{dns_answers, DnsCache};
use crate::netfilter::VerdictSink;

const DNS_PORT: u16 = 53;

struct Network<'a> {
    src: IpAddr,
    dst: IpAddr,
    next: IpNextHeaderProtocol,
    payload: &'a [u8],
}

/// Decodes the packet and feeds any DNS answers it carries to `dns`. Returns
/// `None` when the packet could not be decoded; it has been dropped already.
pub fn classify(id: PacketId, payload: &[u8], dns: &DnsCache, sink: &dyn VerdictSink) -> Option<Flow> {
    let flow = network(payload).and_then(|net| transport(id, &net, dns));
    if flow.is_none() {
        warn!("dropping undecodable packet {} ({} bytes)", id, payload.len());
        sink.submit(id, Action::Deny);
    }
    flow
}

fn network(payload: &[u8]) -> Option<Network<'_>> {
    match payload.first()? >> 4 {
        4 => {
            let pkt = Ipv4Packet::new(payload)?;
            let header = usize::from(pkt.get_header_length()) * 4;
            let total = usize::from(pkt.get_total_length());
            if header < Ipv4Packet::minimum_packet_size() || header > payload.len() || total < header {
                return None;
            }
            Some(Network {
                src: pkt.get_source().into(),
                dst: pkt.get_destination().into(),
                next: pkt.get_next_level_protocol(),
                payload: &payload[header..cmp::min(total, payload.len())],
            })
        }
        6 => {
            let pkt = Ipv6Packet::new(payload)?;
            let header = Ipv6Packet::minimum_packet_size();
            let end = header + usize::from(pkt.get_payload_length());
            Some(Network {
                src: pkt.get_source().into(),
                dst: pkt.get_destination().into(),
                next: pkt.get_next_header(),
                payload: &payload[header..cmp::min(end, payload.len())],
            })
        }
        _ => None,
    }
}

fn transport(id: PacketId, net: &Network<'_>, dns: &DnsCache) -> Option<Flow> {
    let proto = Proto::from_ip_number(net.next.0);
    let (sport, dport, data) = match net.next {
        IpNextHeaderProtocols::Tcp => {
            let pkt = TcpPacket::new(net.payload)?;
            let offset = usize::from(pkt.get_data_offset()) * 4;
            let data = net.payload.get(offset..).unwrap_or_default();
            // DNS over TCP prefixes each message with its length
            let data = data.get(2..).unwrap_or_default();
            (pkt.get_source(), pkt.get_destination(), data)
        }
        IpNextHeaderProtocols::Udp | IpNextHeaderProtocols::UdpLite => {
            let pkt = UdpPacket::new(net.payload)?;
            let end = cmp::min(usize::from(pkt.get_length()), net.payload.len());
            let data = net.payload.get(UdpPacket::minimum_packet_size()..end).unwrap_or_default();
            (pkt.get_source(), pkt.get_destination(), data)
        }
        IpNextHeaderProtocols::Icmp | IpNextHeaderProtocols::Icmpv6 => {
            IcmpPacket::new(net.payload)?;
            return Some(Flow::new(id, proto, net.src, Port::Any, net.dst, Port::Any));
        }
        _ => return Some(Flow::new(id, proto, net.src, Port::Any, net.dst, Port::Any)),
    };
    if sport == DNS_PORT || dport == DNS_PORT {
        for (name, addr) in dns_answers(data) {
            dns.update(&name, addr);
        }
    }
    Some(Flow::new(id, proto, net.src, Port::Num(sport), net.dst, Port::Num(dport)))
}

/// A DNS response addressed to this host.
pub fn is_inbound_dns(flow: &Flow, dns: &DnsCache) -> bool {
    flow.src_port == Port::Num(DNS_PORT) && dns.is_localhost(flow.dst_ip)
}

pub fn is_icmp(flow: &Flow) -> bool {
    flow.proto == Proto::Icmp
}

/// UDP sent by a socket to itself.
pub fn is_udp_loopback(flow: &Flow) -> bool {
    flow.proto == Proto::Udp && flow.src_ip == flow.dst_ip && flow.src_port == flow.dst_port
}

/// Flows decided without an info-level log line.
pub fn is_quiet(flow: &Flow, dns: &DnsCache) -> bool {
    is_icmp(flow) || is_udp_loopback(flow) || is_inbound_dns(flow, dns)
}
