//! Keep only the listed entries, in the listed order. A selection can
//! filter, reorder, and repeat packets all at once.

use std::fmt;

use crate::carrier::PacketCarrier;
use crate::error::{Error, Result};
use crate::mods::{Mod, ModContext, OptValue, int_arg};

pub(crate) const USAGE: &str = "select <i0> [i1 ...]\n\
    Keep only the packets at the listed indexes, in the order given.\n\
    Indexes may repeat; an out-of-range index fails the pipeline.";

#[derive(Debug)]
pub struct Select {
    indexes: Vec<usize>,
}

impl Select {
    pub fn build(args: &[OptValue]) -> Result<Box<dyn Mod>> {
        if args.is_empty() {
            return Err(Error::argument("select", "expected at least 1 index"));
        }
        let mut indexes = Vec::with_capacity(args.len());
        for i in 0..args.len() {
            let n = int_arg("select", args, i)?;
            let index = usize::try_from(n)
                .map_err(|_| Error::argument("select", format!("index {n} must not be negative")))?;
            indexes.push(index);
        }
        Ok(Box::new(Self { indexes }))
    }
}

impl Mod for Select {
    fn name(&self) -> &'static str {
        "select"
    }

    fn apply(&self, carrier: PacketCarrier, _ctx: &mut ModContext) -> Result<PacketCarrier> {
        let mut selected = PacketCarrier::new();
        for &index in &self.indexes {
            let entry = carrier.get(index).ok_or_else(|| {
                Error::runtime(
                    "select",
                    format!("index {index} out of range for carrier of {}", carrier.len()),
                )
            })?;
            selected.push_entry(entry.clone());
        }
        Ok(selected)
    }
}

impl fmt::Display for Select {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Select")?;
        for index in &self.indexes {
            write!(f, " {index}")?;
        }
        Ok(())
    }
}
