//! Fragment IPv4 packets at the network layer.

use std::fmt;

use crate::carrier::PacketCarrier;
use crate::error::{Error, Result};
use crate::mods::{Mod, ModContext, OptValue, expect_args, int_arg, util};

pub(crate) const USAGE: &str = "fragment4 <size>\n\
    Split each IPv4 packet into fragments carrying at most <size> payload\n\
    bytes, rounded down to a multiple of 8. DF is cleared, MF set on all\n\
    but the last fragment, offsets count in 8-byte units.";

#[derive(Debug)]
pub struct Fragment4 {
    size: usize,
}

impl Fragment4 {
    pub fn build(args: &[OptValue]) -> Result<Box<dyn Mod>> {
        expect_args("fragment4", args, 1)?;
        let size = int_arg("fragment4", args, 0)?;
        let size = usize::try_from(size)
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| Error::argument("fragment4", format!("size must be positive, got {size}")))?;
        Ok(Box::new(Self { size }))
    }
}

impl Mod for Fragment4 {
    fn name(&self) -> &'static str {
        "fragment4"
    }

    fn apply(&self, carrier: PacketCarrier, ctx: &mut ModContext) -> Result<PacketCarrier> {
        let mut fragmented = PacketCarrier::new();
        for entry in carrier {
            match util::fragment4(&entry.packet, self.size, ctx)? {
                Some(fragments) => {
                    // The original's post-delay rides on the last fragment.
                    let last = fragments.len() - 1;
                    for (k, fragment) in fragments.into_iter().enumerate() {
                        let delay = if k == last { entry.delay } else { Default::default() };
                        fragmented.append(fragment, delay);
                    }
                }
                None => fragmented.push_entry(entry),
            }
        }
        Ok(fragmented)
    }
}

impl fmt::Display for Fragment4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fragment4 {}", self.size)
    }
}
