//! Shared packet-surgery helpers for the fragmenting and segmenting
//! modifications.

use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::ipv6::MutableIpv6Packet;
use pnet::packet::tcp::{MutableTcpPacket, TcpPacket};

use crate::error::{Error, Result};
use crate::mods::ModContext;
use crate::packet::Packet;

/// Round a fragment budget down to the 8-byte granularity the IP offset
/// field imposes, with a floor of one unit.
fn align8(size: usize) -> usize {
    (size / 8 * 8).max(8)
}

/// Split an IPv4 packet into fragments carrying at most `size` payload
/// bytes each (rounded down to a multiple of 8). Returns `None` when the
/// packet is not IPv4 or the payload already fits.
///
/// DF is cleared on every fragment. The original identification is kept
/// when nonzero so reassembly round-trips; packets the stack sent with
/// id 0 get one from the context counter.
pub(crate) fn fragment4(
    packet: &Packet,
    size: usize,
    ctx: &mut ModContext,
) -> Result<Option<Vec<Packet>>> {
    if !packet.is_ipv4() {
        return Ok(None);
    }
    let bytes = packet.as_bytes();
    let Some(ip) = Ipv4Packet::new(bytes) else {
        return Ok(None);
    };
    let ihl = usize::from(ip.get_header_length()) * 4;
    let total = usize::from(ip.get_total_length()).min(bytes.len());
    if ihl < 20 || ihl > total {
        return Ok(None);
    }
    let payload = &bytes[ihl..total];
    let chunk = align8(size);
    if payload.len() <= chunk {
        return Ok(None);
    }

    let ident = match ip.get_identification() {
        0 => (ctx.next_ident() & 0xffff) as u16,
        id => id,
    };
    let base_offset = ip.get_fragment_offset();
    // Splitting a middle fragment keeps MF set on its last piece.
    let tail_mf = ip.get_flags() & Ipv4Flags::MoreFragments != 0;
    let header = &bytes[..ihl];

    let pieces: Vec<&[u8]> = payload.chunks(chunk).collect();
    let last = pieces.len() - 1;
    let mut fragments = Vec::with_capacity(pieces.len());
    for (k, piece) in pieces.into_iter().enumerate() {
        let mut out = Vec::with_capacity(ihl + piece.len());
        out.extend_from_slice(header);
        out.extend_from_slice(piece);
        {
            let mut view = MutableIpv4Packet::new(&mut out)
                .ok_or_else(|| Error::internal("ipv4 fragment view"))?;
            view.set_total_length((ihl + piece.len()) as u16);
            view.set_identification(ident);
            view.set_fragment_offset(base_offset + (k * chunk / 8) as u16);
            let more = k != last || tail_mf;
            view.set_flags(if more { Ipv4Flags::MoreFragments } else { 0 });
        }
        let mut fragment = Packet::from_bytes(out);
        fragment.fix_checksums()?;
        fragments.push(fragment);
    }
    Ok(Some(fragments))
}

/// Split an IPv6 packet into fragments of at most `size` total bytes by
/// inserting a Fragment extension header after the unfragmentable part
/// (base header plus the hop-by-hop and routing chain).
///
/// Returns `None` when the packet is not IPv6, or when the payload already
/// fits and `atomic` is false. With `atomic` a fitting payload still gets
/// wrapped into a single fragment with offset 0 and M clear.
pub(crate) fn fragment6(
    packet: &Packet,
    size: usize,
    atomic: bool,
    ctx: &mut ModContext,
) -> Result<Option<Vec<Packet>>> {
    if !packet.is_ipv6() {
        return Ok(None);
    }
    let bytes = packet.as_bytes();
    if bytes.len() < 40 {
        return Ok(None);
    }

    // Walk the headers every fragment must repeat, remembering where the
    // last next-header byte sits so it can point at the fragment header.
    let mut nh_pos = 6usize;
    let mut unfrag_end = 40usize;
    let mut nh = bytes[6];
    while nh == IpNextHeaderProtocols::Hopopt.0 || nh == IpNextHeaderProtocols::Ipv6Route.0 {
        let Some(hdr) = bytes.get(unfrag_end..unfrag_end + 2) else {
            return Ok(None);
        };
        let (next, len) = (hdr[0], (usize::from(hdr[1]) + 1) * 8);
        nh_pos = unfrag_end;
        nh = next;
        unfrag_end += len;
        if unfrag_end > bytes.len() {
            return Ok(None);
        }
    }
    let fragmentable = &bytes[unfrag_end..];

    let overhead = unfrag_end + 8;
    if size < overhead + 8 {
        return Err(Error::runtime(
            "fragment6",
            format!("size {size} cannot fit {overhead} header bytes plus one 8-byte unit"),
        ));
    }
    let chunk = (size - overhead) / 8 * 8;
    if fragmentable.len() <= chunk && !atomic {
        return Ok(None);
    }

    let ident = ctx.next_ident();
    let pieces: Vec<&[u8]> = if fragmentable.is_empty() {
        vec![&[][..]]
    } else {
        fragmentable.chunks(chunk).collect()
    };
    let last = pieces.len() - 1;
    let mut fragments = Vec::with_capacity(pieces.len());
    for (k, piece) in pieces.into_iter().enumerate() {
        let mut out = Vec::with_capacity(overhead + piece.len());
        out.extend_from_slice(&bytes[..unfrag_end]);
        let offset_units = (k * chunk / 8) as u16;
        let more = u16::from(k != last);
        out.push(nh);
        out.push(0);
        out.extend_from_slice(&((offset_units << 3) | more).to_be_bytes());
        out.extend_from_slice(&ident.to_be_bytes());
        out.extend_from_slice(piece);
        out[nh_pos] = IpNextHeaderProtocols::Ipv6Frag.0;
        let payload_len = (out.len() - 40) as u16;
        {
            let mut view = MutableIpv6Packet::new(&mut out)
                .ok_or_else(|| Error::internal("ipv6 fragment view"))?;
            view.set_payload_length(payload_len);
        }
        fragments.push(Packet::from_bytes(out));
    }
    Ok(Some(fragments))
}

/// Borrowed pieces of a TCP packet.
pub(crate) struct TcpParts<'a> {
    /// Network headers up to the TCP header (base + extension headers).
    pub l3: &'a [u8],
    /// TCP header including options.
    pub header: &'a [u8],
    pub payload: &'a [u8],
    pub seq: u32,
    pub flags: u8,
}

/// Take a TCP packet apart, when there is one to take apart.
pub(crate) fn tcp_parts(packet: &Packet) -> Option<TcpParts<'_>> {
    let (proto, off) = packet.transport()?;
    if proto != IpNextHeaderProtocols::Tcp || packet.is_fragment() {
        return None;
    }
    let bytes = packet.as_bytes();
    let rest = bytes.get(off..)?;
    let tcp = TcpPacket::new(rest)?;
    let header_len = usize::from(tcp.get_data_offset()) * 4;
    if header_len < 20 || header_len > rest.len() {
        return None;
    }
    Some(TcpParts {
        l3: &bytes[..off],
        header: &rest[..header_len],
        payload: &rest[header_len..],
        seq: tcp.get_sequence(),
        flags: tcp.get_flags(),
    })
}

/// Assemble a TCP packet from parts, fixing length fields and checksums.
pub(crate) fn build_tcp(
    l3: &[u8],
    header: &[u8],
    seq: u32,
    flags: u8,
    payload: &[u8],
) -> Result<Packet> {
    let mut out = Vec::with_capacity(l3.len() + header.len() + payload.len());
    out.extend_from_slice(l3);
    out.extend_from_slice(header);
    out.extend_from_slice(payload);
    let total = out.len();
    match out.first().map(|b| b >> 4) {
        Some(4) => {
            let mut view = MutableIpv4Packet::new(&mut out)
                .ok_or_else(|| Error::internal("ipv4 rebuild view"))?;
            view.set_total_length(total as u16);
        }
        Some(6) => {
            let mut view = MutableIpv6Packet::new(&mut out)
                .ok_or_else(|| Error::internal("ipv6 rebuild view"))?;
            view.set_payload_length((total - 40) as u16);
        }
        _ => return Err(Error::internal("tcp rebuild on non-IP bytes")),
    }
    {
        let mut view = MutableTcpPacket::new(&mut out[l3.len()..])
            .ok_or_else(|| Error::internal("tcp rebuild view"))?;
        view.set_sequence(seq);
        view.set_flags(flags);
    }
    let mut packet = Packet::from_bytes(out);
    packet.fix_checksums()?;
    Ok(packet)
}

/// Split a TCP payload into adjacent segments of at most `size` bytes.
/// Returns `None` for non-TCP packets and payloads that already fit.
pub(crate) fn tcp_segment(packet: &Packet, size: usize) -> Result<Option<Vec<Packet>>> {
    use pnet::packet::tcp::TcpFlags;

    let Some(parts) = tcp_parts(packet) else {
        return Ok(None);
    };
    if parts.payload.is_empty() || parts.payload.len() <= size {
        return Ok(None);
    }
    let pieces: Vec<&[u8]> = parts.payload.chunks(size).collect();
    let last = pieces.len() - 1;
    let mut segments = Vec::with_capacity(pieces.len());
    let mut offset = 0u32;
    for (k, piece) in pieces.into_iter().enumerate() {
        let mut flags = parts.flags;
        if k != 0 {
            flags &= !TcpFlags::SYN;
        }
        if k != last {
            flags &= !TcpFlags::FIN;
        }
        let seq = parts.seq.wrapping_add(offset);
        segments.push(build_tcp(parts.l3, parts.header, seq, flags, piece)?);
        offset = offset.wrapping_add(piece.len() as u32);
    }
    Ok(Some(segments))
}
