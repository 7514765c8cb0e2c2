#![cfg(any(test, feature = "test-internals"))]
#![allow(dead_code)] // Allow unused helpers - they're used by library tests but not binary tests

//! Packet builders shared by the test suites.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use pnet::packet::MutablePacket;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::MutableIpv4Packet;
use pnet::packet::ipv6::MutableIpv6Packet;
use pnet::packet::tcp::{MutableTcpPacket, TcpFlags};
use pnet::packet::udp::MutableUdpPacket;

use crate::carrier::PacketCarrier;
use crate::packet::Packet;

pub const SRC4: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const DST4: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const SRC6: Ipv6Addr = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
pub const DST6: Ipv6Addr = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2);

/// IPv4/TCP packet with the given id, sequence number, flags, and payload.
pub fn ipv4_tcp(id: u16, seq: u32, flags: u8, payload: &[u8]) -> Packet {
    let total = 20 + 20 + payload.len();
    let mut bytes = vec![0u8; total];
    {
        let mut ip = MutableIpv4Packet::new(&mut bytes).unwrap();
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length(total as u16);
        ip.set_identification(id);
        ip.set_ttl(64);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
        ip.set_source(SRC4);
        ip.set_destination(DST4);
    }
    write_tcp(&mut bytes[20..], seq, flags, payload);
    checked(bytes)
}

/// Default IPv4/TCP packet carrying `payload`.
pub fn tcp_payload_packet(payload: &[u8]) -> Packet {
    ipv4_tcp(0x1234, 1000, TcpFlags::PSH | TcpFlags::ACK, payload)
}

/// IPv4/UDP packet.
pub fn ipv4_udp(payload: &[u8]) -> Packet {
    let total = 20 + 8 + payload.len();
    let mut bytes = vec![0u8; total];
    {
        let mut ip = MutableIpv4Packet::new(&mut bytes).unwrap();
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length(total as u16);
        ip.set_identification(0x4242);
        ip.set_ttl(64);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        ip.set_source(SRC4);
        ip.set_destination(DST4);
    }
    write_udp(&mut bytes[20..], payload);
    checked(bytes)
}

/// IPv6/TCP packet.
pub fn ipv6_tcp(seq: u32, flags: u8, payload: &[u8]) -> Packet {
    let mut bytes = vec![0u8; 40 + 20 + payload.len()];
    {
        let mut ip = MutableIpv6Packet::new(&mut bytes).unwrap();
        ip.set_version(6);
        ip.set_payload_length((20 + payload.len()) as u16);
        ip.set_next_header(IpNextHeaderProtocols::Tcp);
        ip.set_hop_limit(64);
        ip.set_source(SRC6);
        ip.set_destination(DST6);
    }
    write_tcp(&mut bytes[40..], seq, flags, payload);
    checked(bytes)
}

/// IPv6/UDP packet.
pub fn ipv6_udp(payload: &[u8]) -> Packet {
    let mut bytes = vec![0u8; 40 + 8 + payload.len()];
    {
        let mut ip = MutableIpv6Packet::new(&mut bytes).unwrap();
        ip.set_version(6);
        ip.set_payload_length((8 + payload.len()) as u16);
        ip.set_next_header(IpNextHeaderProtocols::Udp);
        ip.set_hop_limit(64);
        ip.set_source(SRC6);
        ip.set_destination(DST6);
    }
    write_udp(&mut bytes[40..], payload);
    checked(bytes)
}

/// IPv6 packet with a hop-by-hop header between the base header and TCP.
pub fn ipv6_hopopt_tcp(payload: &[u8]) -> Packet {
    let mut bytes = vec![0u8; 40 + 8 + 20 + payload.len()];
    {
        let mut ip = MutableIpv6Packet::new(&mut bytes).unwrap();
        ip.set_version(6);
        ip.set_payload_length((8 + 20 + payload.len()) as u16);
        ip.set_next_header(IpNextHeaderProtocols::Hopopt);
        ip.set_hop_limit(64);
        ip.set_source(SRC6);
        ip.set_destination(DST6);
    }
    // Hop-by-hop header: next = TCP, length 0 (8 bytes), one PadN option.
    bytes[40] = IpNextHeaderProtocols::Tcp.0;
    bytes[41] = 0;
    bytes[42] = 1; // PadN
    bytes[43] = 4; // 4 padding bytes follow
    write_tcp(&mut bytes[48..], 1000, TcpFlags::PSH | TcpFlags::ACK, payload);
    checked(bytes)
}

/// Carrier of `n` distinguishable TCP packets; packet `k` carries payload
/// `[k; 4]`.
pub fn carrier_of(n: usize) -> PacketCarrier {
    let mut carrier = PacketCarrier::new();
    for k in 0..n {
        carrier.append(tcp_payload_packet(&[k as u8; 4]), Duration::ZERO);
    }
    carrier
}

/// First payload byte, used to identify packets built by `carrier_of`.
pub fn payload_byte(packet: &Packet) -> u8 {
    packet.transport_payload().unwrap()[0]
}

fn write_tcp(buf: &mut [u8], seq: u32, flags: u8, payload: &[u8]) {
    let mut tcp = MutableTcpPacket::new(buf).unwrap();
    tcp.set_source(40000);
    tcp.set_destination(80);
    tcp.set_sequence(seq);
    tcp.set_data_offset(5);
    tcp.set_flags(flags);
    tcp.set_window(65535);
    tcp.payload_mut()[..payload.len()].copy_from_slice(payload);
}

fn write_udp(buf: &mut [u8], payload: &[u8]) {
    let mut udp = MutableUdpPacket::new(buf).unwrap();
    udp.set_source(40000);
    udp.set_destination(9);
    udp.set_length((8 + payload.len()) as u16);
    udp.payload_mut()[..payload.len()].copy_from_slice(payload);
}

fn checked(bytes: Vec<u8>) -> Packet {
    let mut packet = Packet::from_bytes(bytes);
    packet.fix_checksums().unwrap();
    packet
}
