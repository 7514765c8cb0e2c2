//! Drop each entry independently with a fixed probability.

use std::fmt;

use rand::Rng;

use crate::carrier::PacketCarrier;
use crate::error::{Error, Result};
use crate::mods::{Mod, ModContext, OptValue, expect_args, f64_arg};

pub(crate) const USAGE: &str = "drop_proba <proba>\n\
    Drop each packet independently with probability <proba> in [0, 1].\n\
    Survivors keep their relative order.";

/// Bernoulli drop per entry, driven by the runtime RNG.
#[derive(Debug)]
pub struct DropProba {
    proba: f64,
}

impl DropProba {
    pub fn build(args: &[OptValue]) -> Result<Box<dyn Mod>> {
        expect_args("drop_proba", args, 1)?;
        let proba = f64_arg("drop_proba", args, 0)?;
        if !(0.0..=1.0).contains(&proba) {
            return Err(Error::argument(
                "drop_proba",
                format!("probability must be in [0, 1], got {proba}"),
            ));
        }
        Ok(Box::new(Self { proba }))
    }
}

impl Mod for DropProba {
    fn name(&self) -> &'static str {
        "drop_proba"
    }

    fn apply(&self, carrier: PacketCarrier, ctx: &mut ModContext) -> Result<PacketCarrier> {
        let mut kept = PacketCarrier::new();
        for entry in carrier {
            if !ctx.rng().random_bool(self.proba) {
                kept.push_entry(entry);
            }
        }
        Ok(kept)
    }
}

impl fmt::Display for DropProba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DropProba {}", self.proba)
    }
}
