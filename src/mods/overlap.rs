//! Overlapping TCP segments for inspection-evasion testing.
//!
//! Unlike `segment`, the produced segments cover overlapping sequence
//! ranges, so a reassembling middlebox and the end host can disagree about
//! the stream contents. The overlap region is 8 bytes (clamped to the
//! segment size) of RNG-supplied data:
//!
//! - `favor_first`: every non-final segment carries trailing random bytes
//!   covering the start of the next segment's data. A stack that keeps the
//!   first copy it saw reassembles garbage.
//! - `favor_last`: every non-initial segment starts early with random
//!   bytes covering the tail of the previous segment. A stack that keeps
//!   the last copy reassembles garbage.
//! - `zero_length`: a zero-payload decoy segment is inserted at every
//!   boundary, aimed at inspectors that mishandle empty segments.

use std::fmt;

use pnet::packet::tcp::TcpFlags;
use rand::Rng;

use crate::carrier::PacketCarrier;
use crate::error::{Error, Result};
use crate::mods::util::{build_tcp, tcp_parts};
use crate::mods::{Mod, ModContext, OptValue, expect_args, int_arg, str_arg};
use crate::packet::Packet;

pub(crate) const USAGE: &str = "overlap {favor_first|favor_last|zero_length} <size>\n\
    Split each TCP payload into overlapping segments of <size> bytes using\n\
    the named strategy. The overlap region holds 8 random bytes (clamped\n\
    to <size>); zero_length inserts empty decoy segments instead.";

const OVERLAP_LEN: usize = 8;

/// How the overlapping bytes are laid out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    FavorFirst,
    FavorLast,
    ZeroLength,
}

impl Strategy {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "favor_first" => Ok(Strategy::FavorFirst),
            "favor_last" => Ok(Strategy::FavorLast),
            "zero_length" => Ok(Strategy::ZeroLength),
            other => Err(Error::argument(
                "overlap",
                format!("unknown strategy '{other}'; use favor_first, favor_last or zero_length"),
            )),
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Strategy::FavorFirst => "favor_first",
            Strategy::FavorLast => "favor_last",
            Strategy::ZeroLength => "zero_length",
        }
    }
}

#[derive(Debug)]
pub struct Overlap {
    strategy: Strategy,
    size: usize,
}

impl Overlap {
    pub fn build(args: &[OptValue]) -> Result<Box<dyn Mod>> {
        expect_args("overlap", args, 2)?;
        let strategy = Strategy::parse(str_arg("overlap", args, 0)?)?;
        let size = int_arg("overlap", args, 1)?;
        let size = usize::try_from(size)
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| Error::argument("overlap", format!("size must be positive, got {size}")))?;
        Ok(Box::new(Self { strategy, size }))
    }

    fn overlap_segments(
        &self,
        packet: &Packet,
        ctx: &mut ModContext,
    ) -> Result<Option<Vec<Packet>>> {
        let Some(parts) = tcp_parts(packet) else {
            return Ok(None);
        };
        if parts.payload.is_empty() || parts.payload.len() <= self.size {
            return Ok(None);
        }
        let extra = OVERLAP_LEN.min(self.size);
        let pieces: Vec<&[u8]> = parts.payload.chunks(self.size).collect();
        let last = pieces.len() - 1;
        let mut segments = Vec::new();
        let mut offset = 0usize;
        for (k, piece) in pieces.into_iter().enumerate() {
            let mut flags = parts.flags;
            if k != 0 {
                flags &= !TcpFlags::SYN;
            }
            if k != last {
                flags &= !TcpFlags::FIN;
            }
            match self.strategy {
                Strategy::FavorFirst => {
                    let mut data = piece.to_vec();
                    if k != last {
                        data.extend((0..extra).map(|_| ctx.rng().random::<u8>()));
                    }
                    let seq = parts.seq.wrapping_add(offset as u32);
                    segments.push(build_tcp(parts.l3, parts.header, seq, flags, &data)?);
                }
                Strategy::FavorLast => {
                    let lead = if k == 0 { 0 } else { extra.min(offset) };
                    let mut data: Vec<u8> =
                        (0..lead).map(|_| ctx.rng().random::<u8>()).collect();
                    data.extend_from_slice(piece);
                    let seq = parts.seq.wrapping_add((offset - lead) as u32);
                    segments.push(build_tcp(parts.l3, parts.header, seq, flags, &data)?);
                }
                Strategy::ZeroLength => {
                    let seq = parts.seq.wrapping_add(offset as u32);
                    segments.push(build_tcp(parts.l3, parts.header, seq, flags, piece)?);
                    if k != last {
                        let boundary = parts.seq.wrapping_add((offset + piece.len()) as u32);
                        let decoy_flags = parts.flags & !(TcpFlags::SYN | TcpFlags::FIN | TcpFlags::PSH);
                        segments.push(build_tcp(
                            parts.l3,
                            parts.header,
                            boundary,
                            decoy_flags,
                            &[],
                        )?);
                    }
                }
            }
            offset += piece.len();
        }
        Ok(Some(segments))
    }
}

impl Mod for Overlap {
    fn name(&self) -> &'static str {
        "overlap"
    }

    fn apply(&self, carrier: PacketCarrier, ctx: &mut ModContext) -> Result<PacketCarrier> {
        let mut out = PacketCarrier::new();
        for entry in carrier {
            match self.overlap_segments(&entry.packet, ctx)? {
                Some(segments) => {
                    let last = segments.len() - 1;
                    for (k, segment) in segments.into_iter().enumerate() {
                        let delay = if k == last { entry.delay } else { Default::default() };
                        out.append(segment, delay);
                    }
                }
                None => out.push_entry(entry),
            }
        }
        Ok(out)
    }
}

impl fmt::Display for Overlap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Overlap {} {}", self.strategy.label(), self.size)
    }
}
