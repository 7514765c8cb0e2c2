//! Fragment IPv6 packets by inserting a Fragment extension header.

use std::fmt;

use crate::carrier::PacketCarrier;
use crate::error::{Error, Result};
use crate::mods::{Mod, ModContext, OptValue, int_arg, str_arg, util};

pub(crate) const USAGE: &str = "fragment6 <size> [atomic|pass]\n\
    Split each IPv6 packet into fragments of at most <size> bytes total,\n\
    repeating the hop-by-hop and routing chain in every fragment. When the\n\
    payload already fits, 'atomic' emits a single fragment (offset 0, M=0)\n\
    and 'pass' (the default) leaves the packet untouched.";

#[derive(Debug)]
pub struct Fragment6 {
    size: usize,
    atomic: bool,
}

impl Fragment6 {
    pub fn build(args: &[OptValue]) -> Result<Box<dyn Mod>> {
        if args.is_empty() || args.len() > 2 {
            return Err(Error::argument(
                "fragment6",
                format!("expected 1 or 2 argument(s), got {}", args.len()),
            ));
        }
        let size = int_arg("fragment6", args, 0)?;
        let size = usize::try_from(size)
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| Error::argument("fragment6", format!("size must be positive, got {size}")))?;
        let atomic = if args.len() == 2 {
            match str_arg("fragment6", args, 1)? {
                "atomic" => true,
                "pass" => false,
                other => {
                    return Err(Error::argument(
                        "fragment6",
                        format!("expected 'atomic' or 'pass', got '{other}'"),
                    ));
                }
            }
        } else {
            false
        };
        Ok(Box::new(Self { size, atomic }))
    }
}

impl Mod for Fragment6 {
    fn name(&self) -> &'static str {
        "fragment6"
    }

    fn apply(&self, carrier: PacketCarrier, ctx: &mut ModContext) -> Result<PacketCarrier> {
        let mut fragmented = PacketCarrier::new();
        for entry in carrier {
            match util::fragment6(&entry.packet, self.size, self.atomic, ctx)? {
                Some(fragments) => {
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

impl fmt::Display for Fragment6 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.atomic {
            write!(f, "Fragment6 {} atomic", self.size)
        } else {
            write!(f, "Fragment6 {}", self.size)
        }
    }
}
