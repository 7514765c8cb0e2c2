//! Drop a single entry from the carrier.

use std::fmt;

use crate::carrier::PacketCarrier;
use crate::error::Result;
use crate::mods::{Mod, ModContext, OptValue, expect_args, int_arg};

pub(crate) const USAGE: &str = "drop_one <index>\n\
    Remove the packet at <index>, wrapped modulo the carrier length.\n\
    Negative indexes count from the end; an empty carrier passes through.";

/// Removes the entry at `index mod len`.
#[derive(Debug)]
pub struct DropOne {
    index: i64,
}

impl DropOne {
    pub fn build(args: &[OptValue]) -> Result<Box<dyn Mod>> {
        expect_args("drop_one", args, 1)?;
        let index = int_arg("drop_one", args, 0)?;
        Ok(Box::new(Self { index }))
    }
}

impl Mod for DropOne {
    fn name(&self) -> &'static str {
        "drop_one"
    }

    fn apply(&self, mut carrier: PacketCarrier, _ctx: &mut ModContext) -> Result<PacketCarrier> {
        if carrier.is_empty() {
            return Ok(carrier);
        }
        let index = self.index.rem_euclid(carrier.len() as i64) as usize;
        carrier.remove(index);
        Ok(carrier)
    }
}

impl fmt::Display for DropOne {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DropOne {}", self.index)
    }
}
