use pnet::packet::ipv4::{Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpFlags;

use crate::carrier::PacketCarrier;
use crate::error::Error;
use crate::mods::{self, Mod, ModContext, OptValue};
use crate::packet::Packet;
use crate::test_helpers::{ipv4_tcp, ipv4_udp, ipv6_udp, ipv6_hopopt_tcp, tcp_payload_packet};

fn ctx() -> ModContext {
    ModContext::new(0xabcd)
}

fn build(name: &str, args: &[OptValue]) -> Box<dyn Mod> {
    (mods::lookup(name).unwrap().build)(args).unwrap()
}

fn apply_one(m: &dyn Mod, packet: Packet, ctx: &mut ModContext) -> Vec<Packet> {
    m.apply(PacketCarrier::single(packet), ctx)
        .unwrap()
        .into_iter()
        .map(|e| e.packet)
        .collect()
}

// -- IPv4 --

fn v4_view(packet: &Packet) -> Ipv4Packet<'_> {
    Ipv4Packet::new(packet.as_bytes()).unwrap()
}

/// Trivial in-order reassembler: concatenate payloads by offset, restore
/// the first fragment's header.
fn reassemble4(fragments: &[Packet]) -> Packet {
    let mut sorted: Vec<&Packet> = fragments.iter().collect();
    sorted.sort_by_key(|p| v4_view(p).get_fragment_offset());

    let ihl = usize::from(v4_view(sorted[0]).get_header_length()) * 4;
    let ident = v4_view(sorted[0]).get_identification();
    let mut bytes = sorted[0].as_bytes()[..ihl].to_vec();
    for fragment in &sorted {
        assert_eq!(v4_view(fragment).get_identification(), ident);
        bytes.extend_from_slice(&fragment.as_bytes()[ihl..]);
    }
    let total = bytes.len();
    {
        let mut view = MutableIpv4Packet::new(&mut bytes).unwrap();
        view.set_total_length(total as u16);
        view.set_flags(0);
        view.set_fragment_offset(0);
    }
    let mut packet = Packet::from_bytes(bytes);
    packet.fix_checksums().unwrap();
    packet
}

#[test]
fn test_fragment4_size8_on_40_byte_payload() {
    // TCP header (20) + 20 data bytes = 40 bytes of IP payload.
    let packet = ipv4_tcp(0x1234, 1000, TcpFlags::ACK, &[7u8; 20]);
    let fragments = apply_one(&*build("fragment4", &[OptValue::Int(8)]), packet, &mut ctx());

    assert_eq!(fragments.len(), 5);
    for (k, fragment) in fragments.iter().enumerate() {
        let view = v4_view(fragment);
        assert_eq!(view.get_fragment_offset(), k as u16);
        assert_eq!(view.get_total_length(), 28);
        let more = view.get_flags() & Ipv4Flags::MoreFragments != 0;
        assert_eq!(more, k < 4, "fragment {k}");
        assert_eq!(view.get_flags() & Ipv4Flags::DontFragment, 0);
        assert_eq!(view.get_identification(), 0x1234);
        // Refreshed header checksum must verify.
        assert_eq!(pnet::packet::ipv4::checksum(&view), view.get_checksum());
    }
}

#[test]
fn test_fragment4_reassembles_to_original() {
    let packet = ipv4_tcp(0x7777, 99, TcpFlags::PSH | TcpFlags::ACK, &[3u8; 61]);
    let fragments = apply_one(
        &*build("fragment4", &[OptValue::Int(16)]),
        packet.clone(),
        &mut ctx(),
    );
    assert!(fragments.len() > 1);
    assert_eq!(reassemble4(&fragments).as_bytes(), packet.as_bytes());
}

#[test]
fn test_fragment4_rounds_size_down() {
    // size 15 fragments like size 8.
    let packet = ipv4_udp(&[1u8; 32]);
    let fragments = apply_one(&*build("fragment4", &[OptValue::Int(15)]), packet, &mut ctx());
    // 8 bytes UDP header + 32 payload = 40 -> 5 fragments of 8.
    assert_eq!(fragments.len(), 5);
    assert!(fragments.iter().all(|f| v4_view(f).get_total_length() == 28));
}

#[test]
fn test_fragment4_allocates_ident_when_zero() {
    let packet = ipv4_tcp(0, 1, TcpFlags::ACK, &[0u8; 40]);
    let mut context = ctx();
    let first = apply_one(&*build("fragment4", &[OptValue::Int(8)]), packet.clone(), &mut context);
    let second = apply_one(&*build("fragment4", &[OptValue::Int(8)]), packet, &mut context);

    let id_of = |frags: &[Packet]| v4_view(&frags[0]).get_identification();
    assert!(first.iter().all(|f| v4_view(f).get_identification() == id_of(&first)));
    // Distinct across originals.
    assert_ne!(id_of(&first), id_of(&second));
}

#[test]
fn test_fragment4_passes_through_when_fitting() {
    let packet = tcp_payload_packet(b"tiny");
    let out = build("fragment4", &[OptValue::Int(1000)])
        .apply(PacketCarrier::single(packet.clone()), &mut ctx())
        .unwrap();
    assert_eq!(out, PacketCarrier::single(packet));
}

#[test]
fn test_fragment4_ignores_ipv6() {
    let packet = ipv6_udp(&[5u8; 200]);
    let out = build("fragment4", &[OptValue::Int(8)])
        .apply(PacketCarrier::single(packet.clone()), &mut ctx())
        .unwrap();
    assert_eq!(out, PacketCarrier::single(packet));
}

// -- IPv6 --

struct Frag6 {
    inner_nh: u8,
    offset_units: u16,
    more: bool,
    ident: u32,
    data: Vec<u8>,
}

/// Parse a fragment produced from an extension-free original, where the
/// fragment header sits directly after the base header.
fn frag6_parse(packet: &Packet) -> Frag6 {
    let bytes = packet.as_bytes();
    assert_eq!(bytes[6], 44, "base header must chain to the fragment header");
    let field = u16::from_be_bytes([bytes[42], bytes[43]]);
    Frag6 {
        inner_nh: bytes[40],
        offset_units: field >> 3,
        more: field & 1 == 1,
        ident: u32::from_be_bytes([bytes[44], bytes[45], bytes[46], bytes[47]]),
        data: bytes[48..].to_vec(),
    }
}

fn reassemble6(fragments: &[Packet]) -> Packet {
    let mut parsed: Vec<Frag6> = fragments.iter().map(frag6_parse).collect();
    parsed.sort_by_key(|f| f.offset_units);
    let ident = parsed[0].ident;
    let inner = parsed[0].inner_nh;
    let mut payload = Vec::new();
    for (k, frag) in parsed.iter().enumerate() {
        assert_eq!(frag.ident, ident);
        assert_eq!(frag.more, k < parsed.len() - 1);
        assert_eq!(frag.offset_units as usize * 8, payload.len());
        payload.extend_from_slice(&frag.data);
    }
    let mut bytes = fragments[0].as_bytes()[..40].to_vec();
    bytes.extend_from_slice(&payload);
    bytes[6] = inner;
    let plen = (bytes.len() - 40) as u16;
    bytes[4..6].copy_from_slice(&plen.to_be_bytes());
    Packet::from_bytes(bytes)
}

#[test]
fn test_fragment6_reassembles_for_many_sizes() {
    let packet = ipv6_udp(&[0xa5; 300]);
    for size in [56, 64, 96, 200, 1280] {
        let fragments = apply_one(
            &*build("fragment6", &[OptValue::Int(size)]),
            packet.clone(),
            &mut ctx(),
        );
        if fragments.len() == 1 {
            // Large sizes leave the packet untouched by default.
            assert_eq!(fragments[0].as_bytes(), packet.as_bytes());
            continue;
        }
        for fragment in &fragments[..fragments.len() - 1] {
            let parsed = frag6_parse(fragment);
            assert_eq!(parsed.data.len() % 8, 0, "size {size}");
            assert!(fragment.len() <= size as usize, "size {size}");
        }
        assert_eq!(
            reassemble6(&fragments).as_bytes(),
            packet.as_bytes(),
            "size {size}"
        );
    }
}

#[test]
fn test_fragment6_ident_constant_within_distinct_across() {
    let mut carrier = PacketCarrier::new();
    carrier.append(ipv6_udp(&[1u8; 120]), std::time::Duration::ZERO);
    carrier.append(ipv6_udp(&[2u8; 120]), std::time::Duration::ZERO);
    let out = build("fragment6", &[OptValue::Int(64)])
        .apply(carrier, &mut ctx())
        .unwrap();

    let idents: Vec<u32> = out.iter().map(|e| frag6_parse(&e.packet).ident).collect();
    assert!(idents.len() > 2);
    let first = idents[0];
    let split = idents.iter().position(|&id| id != first).unwrap();
    assert!(idents[..split].iter().all(|&id| id == first));
    assert!(idents[split..].iter().all(|&id| id == idents[split]));
}

#[test]
fn test_fragment6_atomic_versus_pass() {
    let packet = ipv6_udp(b"fits easily");

    let passed = build("fragment6", &[OptValue::Int(1280)])
        .apply(PacketCarrier::single(packet.clone()), &mut ctx())
        .unwrap();
    assert_eq!(passed, PacketCarrier::single(packet.clone()));

    let atomic = apply_one(
        &*build(
            "fragment6",
            &[OptValue::Int(1280), OptValue::Str("atomic".into())],
        ),
        packet.clone(),
        &mut ctx(),
    );
    assert_eq!(atomic.len(), 1);
    let parsed = frag6_parse(&atomic[0]);
    assert_eq!(parsed.offset_units, 0);
    assert!(!parsed.more);
    assert_eq!(parsed.data, packet.as_bytes()[40..].to_vec());
}

#[test]
fn test_fragment6_repeats_unfragmentable_chain() {
    let packet = ipv6_hopopt_tcp(&[9u8; 100]);
    let fragments = apply_one(
        &*build("fragment6", &[OptValue::Int(80)]),
        packet,
        &mut ctx(),
    );
    assert!(fragments.len() > 1);
    for fragment in &fragments {
        let bytes = fragment.as_bytes();
        // Base header still chains to hop-by-hop, which now chains to the
        // fragment header, which carries the TCP payload.
        assert_eq!(bytes[0] >> 4, 6);
        assert_eq!(bytes[6], 0);
        assert_eq!(bytes[40], 44);
        assert_eq!(bytes[48], 6);
        let plen = Ipv6Packet::new(bytes).unwrap().get_payload_length();
        assert_eq!(usize::from(plen), bytes.len() - 40);
    }
}

#[test]
fn test_fragment6_size_too_small_is_runtime_error() {
    let out = build("fragment6", &[OptValue::Int(48)])
        .apply(PacketCarrier::single(ipv6_udp(&[0u8; 64])), &mut ctx());
    assert!(matches!(out, Err(Error::ModificationRuntime { .. })));
}

#[test]
fn test_fragment6_ignores_ipv4() {
    let packet = tcp_payload_packet(&[1u8; 100]);
    let out = build("fragment6", &[OptValue::Int(56)])
        .apply(PacketCarrier::single(packet.clone()), &mut ctx())
        .unwrap();
    assert_eq!(out, PacketCarrier::single(packet));
}
