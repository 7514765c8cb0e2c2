//! Split TCP payloads into adjacent segments.

use std::fmt;

use crate::carrier::PacketCarrier;
use crate::error::{Error, Result};
use crate::mods::{Mod, ModContext, OptValue, expect_args, int_arg, util};

pub(crate) const USAGE: &str = "segment <size>\n\
    Split each TCP payload into segments of at most <size> bytes. Sequence\n\
    numbers advance by the preceding payload lengths; SYN stays on the\n\
    first segment only, FIN on the last; checksums are recomputed.";

#[derive(Debug)]
pub struct Segment {
    size: usize,
}

impl Segment {
    pub fn build(args: &[OptValue]) -> Result<Box<dyn Mod>> {
        expect_args("segment", args, 1)?;
        let size = int_arg("segment", args, 0)?;
        let size = usize::try_from(size)
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| Error::argument("segment", format!("size must be positive, got {size}")))?;
        Ok(Box::new(Self { size }))
    }
}

impl Mod for Segment {
    fn name(&self) -> &'static str {
        "segment"
    }

    fn apply(&self, carrier: PacketCarrier, _ctx: &mut ModContext) -> Result<PacketCarrier> {
        let mut segmented = PacketCarrier::new();
        for entry in carrier {
            match util::tcp_segment(&entry.packet, self.size)? {
                Some(segments) => {
                    let last = segments.len() - 1;
                    for (k, segment) in segments.into_iter().enumerate() {
                        let delay = if k == last { entry.delay } else { Default::default() };
                        segmented.append(segment, delay);
                    }
                }
                None => segmented.push_entry(entry),
            }
        }
        Ok(segmented)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Segment {}", self.size)
    }
}
