//! Duplicate one entry (or every entry), the copy landing directly after
//! the original.

use std::fmt;

use rand::Rng;

use crate::carrier::PacketCarrier;
use crate::error::{Error, Result};
use crate::mods::{Mod, ModContext, OptValue, expect_args};

pub(crate) const USAGE: &str = "duplicate {<index>|first|last|random|all}\n\
    Insert a copy of the chosen packet directly after the original.\n\
    'all' duplicates every packet in place.";

#[derive(Debug)]
enum Pick {
    Index(i64),
    Random,
    All,
}

#[derive(Debug)]
pub struct Duplicate {
    pick: Pick,
}

impl Duplicate {
    pub fn build(args: &[OptValue]) -> Result<Box<dyn Mod>> {
        expect_args("duplicate", args, 1)?;
        let pick = match &args[0] {
            OptValue::Int(n) => Pick::Index(*n),
            OptValue::Str(s) => match s.as_str() {
                "first" => Pick::Index(0),
                "last" => Pick::Index(-1),
                "random" => Pick::Random,
                "all" => Pick::All,
                other => {
                    return Err(Error::argument(
                        "duplicate",
                        format!("expected an index, 'first', 'last', 'random' or 'all', got '{other}'"),
                    ));
                }
            },
            OptValue::Absent => {
                return Err(Error::argument("duplicate", "argument 1 must not be none"));
            }
        };
        Ok(Box::new(Self { pick }))
    }
}

impl Mod for Duplicate {
    fn name(&self) -> &'static str {
        "duplicate"
    }

    fn apply(&self, mut carrier: PacketCarrier, ctx: &mut ModContext) -> Result<PacketCarrier> {
        if carrier.is_empty() {
            return Ok(carrier);
        }
        let len = carrier.len();
        match self.pick {
            Pick::All => {
                let mut doubled = PacketCarrier::new();
                for entry in carrier {
                    doubled.push_entry(entry.clone());
                    doubled.push_entry(entry);
                }
                Ok(doubled)
            }
            Pick::Index(i) => {
                let index = i.rem_euclid(len as i64) as usize;
                let entry = carrier.get(index).cloned();
                if let Some(entry) = entry {
                    carrier.insert(index + 1, entry.packet, entry.delay);
                }
                Ok(carrier)
            }
            Pick::Random => {
                let index = ctx.rng().random_range(0..len);
                let entry = carrier.get(index).cloned();
                if let Some(entry) = entry {
                    carrier.insert(index + 1, entry.packet, entry.delay);
                }
                Ok(carrier)
            }
        }
    }
}

impl fmt::Display for Duplicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pick {
            Pick::Index(i) => write!(f, "Duplicate {i}"),
            Pick::Random => write!(f, "Duplicate random"),
            Pick::All => write!(f, "Duplicate all"),
        }
    }
}
