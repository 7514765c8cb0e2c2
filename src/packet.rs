//! Byte-backed packets with typed layer views.
//!
//! A [`Packet`] owns the raw bytes exactly as they came off the wire,
//! starting at the network layer. All structure queries run on demand
//! through `pnet` views over those bytes, so a parse/serialize round trip
//! can never alter an untouched packet.

use std::fmt;
use std::fmt::Write as _;
use std::net::IpAddr;

use pnet::packet::icmp::{IcmpPacket, MutableIcmpPacket};
use pnet::packet::icmpv6::{Icmpv6Packet, MutableIcmpv6Packet};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::{Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::{MutableTcpPacket, TcpPacket};
use pnet::packet::udp::{MutableUdpPacket, UdpPacket};
use pnet::packet::{icmp, icmpv6, ipv4, tcp, udp};

use crate::error::{Error, Result};

/// Protocol layers addressable by the modifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layer {
    Ipv4,
    Ipv6,
    Tcp,
    Udp,
    Icmp,
    Payload,
}

/// A single network packet as raw bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    bytes: Vec<u8>,
}

impl Packet {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// IP version nibble, when the buffer holds one.
    pub fn ip_version(&self) -> Option<u8> {
        self.bytes.first().map(|b| b >> 4).filter(|v| *v == 4 || *v == 6)
    }

    pub fn is_ipv4(&self) -> bool {
        self.ip_version() == Some(4)
    }

    pub fn is_ipv6(&self) -> bool {
        self.ip_version() == Some(6)
    }

    /// Transport protocol and the byte offset where its header starts,
    /// walking the IPv6 extension chain when needed.
    pub fn transport(&self) -> Option<(IpNextHeaderProtocol, usize)> {
        match self.ip_version()? {
            4 => {
                let ip = Ipv4Packet::new(&self.bytes)?;
                let ihl = usize::from(ip.get_header_length()) * 4;
                if ihl < 20 || ihl > self.bytes.len() {
                    return None;
                }
                Some((ip.get_next_level_protocol(), ihl))
            }
            6 => {
                let ip = Ipv6Packet::new(&self.bytes)?;
                let mut proto = ip.get_next_header();
                let mut off = 40usize;
                loop {
                    match proto {
                        IpNextHeaderProtocols::Hopopt
                        | IpNextHeaderProtocols::Ipv6Route
                        | IpNextHeaderProtocols::Ipv6Opts => {
                            let hdr = self.bytes.get(off..off + 2)?;
                            let (next, len) = (hdr[0], hdr[1]);
                            proto = IpNextHeaderProtocol(next);
                            off += (usize::from(len) + 1) * 8;
                        }
                        IpNextHeaderProtocols::Ipv6Frag => {
                            let hdr = self.bytes.get(off..off + 8)?;
                            proto = IpNextHeaderProtocol(hdr[0]);
                            off += 8;
                        }
                        _ => break,
                    }
                    if off > self.bytes.len() {
                        return None;
                    }
                }
                Some((proto, off))
            }
            _ => None,
        }
    }

    /// True when this packet is an IP fragment (IPv4 offset/MF, or an IPv6
    /// Fragment extension header). Fragments carry no computable transport
    /// checksum of their own.
    pub fn is_fragment(&self) -> bool {
        match self.ip_version() {
            Some(4) => Ipv4Packet::new(&self.bytes).is_some_and(|ip| {
                ip.get_fragment_offset() != 0 || ip.get_flags() & Ipv4Flags::MoreFragments != 0
            }),
            Some(6) => {
                let Some(ip) = Ipv6Packet::new(&self.bytes) else {
                    return false;
                };
                let mut proto = ip.get_next_header();
                let mut off = 40usize;
                while matches!(
                    proto,
                    IpNextHeaderProtocols::Hopopt
                        | IpNextHeaderProtocols::Ipv6Route
                        | IpNextHeaderProtocols::Ipv6Opts
                ) {
                    let Some(hdr) = self.bytes.get(off..off + 2) else {
                        return false;
                    };
                    proto = IpNextHeaderProtocol(hdr[0]);
                    off += (usize::from(hdr[1]) + 1) * 8;
                }
                proto == IpNextHeaderProtocols::Ipv6Frag
            }
            _ => false,
        }
    }

    pub fn has_layer(&self, layer: Layer) -> bool {
        match layer {
            Layer::Ipv4 => self.is_ipv4(),
            Layer::Ipv6 => self.is_ipv6(),
            Layer::Tcp => matches!(self.transport(), Some((IpNextHeaderProtocols::Tcp, _))),
            Layer::Udp => matches!(self.transport(), Some((IpNextHeaderProtocols::Udp, _))),
            Layer::Icmp => matches!(
                self.transport(),
                Some((IpNextHeaderProtocols::Icmp, _)) | Some((IpNextHeaderProtocols::Icmpv6, _))
            ),
            Layer::Payload => self.transport_payload().is_some_and(|p| !p.is_empty()),
        }
    }

    fn transport_bytes(&self) -> Option<(IpNextHeaderProtocol, &[u8])> {
        let (proto, off) = self.transport()?;
        self.bytes.get(off..).map(|rest| (proto, rest))
    }

    /// TCP view over this packet, when it carries one.
    pub fn tcp(&self) -> Option<TcpPacket<'_>> {
        match self.transport_bytes()? {
            (IpNextHeaderProtocols::Tcp, rest) => TcpPacket::new(rest),
            _ => None,
        }
    }

    /// UDP view over this packet, when it carries one.
    pub fn udp(&self) -> Option<UdpPacket<'_>> {
        match self.transport_bytes()? {
            (IpNextHeaderProtocols::Udp, rest) => UdpPacket::new(rest),
            _ => None,
        }
    }

    /// Application payload above the transport header.
    pub fn transport_payload(&self) -> Option<&[u8]> {
        let (proto, rest) = self.transport_bytes()?;
        match proto {
            IpNextHeaderProtocols::Tcp => {
                let t = TcpPacket::new(rest)?;
                rest.get(usize::from(t.get_data_offset()) * 4..)
            }
            IpNextHeaderProtocols::Udp => rest.get(8..),
            _ => Some(rest),
        }
    }

    pub fn source_ip(&self) -> Option<IpAddr> {
        match self.ip_version()? {
            4 => Ipv4Packet::new(&self.bytes).map(|ip| IpAddr::V4(ip.get_source())),
            6 => Ipv6Packet::new(&self.bytes).map(|ip| IpAddr::V6(ip.get_source())),
            _ => None,
        }
    }

    pub fn destination_ip(&self) -> Option<IpAddr> {
        match self.ip_version()? {
            4 => Ipv4Packet::new(&self.bytes).map(|ip| IpAddr::V4(ip.get_destination())),
            6 => Ipv6Packet::new(&self.bytes).map(|ip| IpAddr::V6(ip.get_destination())),
            _ => None,
        }
    }

    /// Recompute every checksum the packet carries. Call after any mutation.
    ///
    /// Fragments only get their IP header checksum refreshed: the transport
    /// checksum covers the whole original datagram and must ride along
    /// inside the payload bytes.
    pub fn fix_checksums(&mut self) -> Result<()> {
        match self.ip_version() {
            Some(4) => self.fix_v4(),
            Some(6) => self.fix_v6(),
            _ => Ok(()),
        }
    }

    fn fix_v4(&mut self) -> Result<()> {
        if !self.is_fragment() {
            if let Some((proto, off)) = self.transport() {
                let (src, dst) = {
                    let ip = Ipv4Packet::new(&self.bytes)
                        .ok_or_else(|| Error::internal("ipv4 view"))?;
                    (ip.get_source(), ip.get_destination())
                };
                match proto {
                    IpNextHeaderProtocols::Tcp => {
                        let sum = TcpPacket::new(&self.bytes[off..])
                            .map(|t| tcp::ipv4_checksum(&t, &src, &dst));
                        if let (Some(sum), Some(mut t)) =
                            (sum, MutableTcpPacket::new(&mut self.bytes[off..]))
                        {
                            t.set_checksum(sum);
                        }
                    }
                    IpNextHeaderProtocols::Udp => {
                        let sum = UdpPacket::new(&self.bytes[off..])
                            .map(|u| udp::ipv4_checksum(&u, &src, &dst));
                        if let (Some(sum), Some(mut u)) =
                            (sum, MutableUdpPacket::new(&mut self.bytes[off..]))
                        {
                            u.set_checksum(sum);
                        }
                    }
                    IpNextHeaderProtocols::Icmp => {
                        let sum = IcmpPacket::new(&self.bytes[off..]).map(|p| icmp::checksum(&p));
                        if let (Some(sum), Some(mut p)) =
                            (sum, MutableIcmpPacket::new(&mut self.bytes[off..]))
                        {
                            p.set_checksum(sum);
                        }
                    }
                    _ => {}
                }
            }
        }
        let sum = Ipv4Packet::new(&self.bytes).map(|ip| ipv4::checksum(&ip));
        if let (Some(sum), Some(mut ip)) = (sum, MutableIpv4Packet::new(&mut self.bytes)) {
            ip.set_checksum(sum);
        }
        Ok(())
    }

    fn fix_v6(&mut self) -> Result<()> {
        if self.is_fragment() {
            return Ok(());
        }
        let Some((proto, off)) = self.transport() else {
            return Ok(());
        };
        let (src, dst) = {
            let ip = Ipv6Packet::new(&self.bytes).ok_or_else(|| Error::internal("ipv6 view"))?;
            (ip.get_source(), ip.get_destination())
        };
        match proto {
            IpNextHeaderProtocols::Tcp => {
                let sum =
                    TcpPacket::new(&self.bytes[off..]).map(|t| tcp::ipv6_checksum(&t, &src, &dst));
                if let (Some(sum), Some(mut t)) =
                    (sum, MutableTcpPacket::new(&mut self.bytes[off..]))
                {
                    t.set_checksum(sum);
                }
            }
            IpNextHeaderProtocols::Udp => {
                let sum =
                    UdpPacket::new(&self.bytes[off..]).map(|u| udp::ipv6_checksum(&u, &src, &dst));
                if let (Some(sum), Some(mut u)) =
                    (sum, MutableUdpPacket::new(&mut self.bytes[off..]))
                {
                    u.set_checksum(sum);
                }
            }
            IpNextHeaderProtocols::Icmpv6 => {
                let sum = Icmpv6Packet::new(&self.bytes[off..])
                    .map(|p| icmpv6::checksum(&p, &src, &dst));
                if let (Some(sum), Some(mut p)) =
                    (sum, MutableIcmpv6Packet::new(&mut self.bytes[off..]))
                {
                    p.set_checksum(sum);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Human summary used by the `print` modification and debug logs.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        match self.ip_version() {
            Some(4) => {
                if let Some(ip) = Ipv4Packet::new(&self.bytes) {
                    let _ = write!(
                        out,
                        "IPv4 {} -> {} id={:#06x} ttl={} len={}",
                        ip.get_source(),
                        ip.get_destination(),
                        ip.get_identification(),
                        ip.get_ttl(),
                        ip.get_total_length()
                    );
                    if self.is_fragment() {
                        let _ = write!(
                            out,
                            " frag(off={} mf={})",
                            ip.get_fragment_offset(),
                            u8::from(ip.get_flags() & Ipv4Flags::MoreFragments != 0)
                        );
                    }
                }
            }
            Some(6) => {
                if let Some(ip) = Ipv6Packet::new(&self.bytes) {
                    let _ = write!(
                        out,
                        "IPv6 {} -> {} plen={} nh={}",
                        ip.get_source(),
                        ip.get_destination(),
                        ip.get_payload_length(),
                        ip.get_next_header().0
                    );
                }
            }
            _ => {
                let _ = write!(out, "non-IP {}B", self.bytes.len());
                return out;
            }
        }
        if let Some(t) = self.tcp() {
            let _ = write!(
                out,
                " | TCP {} -> {} seq={} flags={:#05x}",
                t.get_source(),
                t.get_destination(),
                t.get_sequence(),
                t.get_flags()
            );
        } else if let Some(u) = self.udp() {
            let _ = write!(out, " | UDP {} -> {}", u.get_source(), u.get_destination());
        } else if let Some((proto, _)) = self.transport() {
            let _ = write!(out, " | proto {}", proto.0);
        }
        if let Some(payload) = self.transport_payload() {
            let _ = write!(out, " | {}B payload", payload.len());
        }
        out
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet({}B)", self.bytes.len())
    }
}
