//! Log a dump of every packet in the carrier.

use std::fmt;

use tracing::info;

use crate::carrier::PacketCarrier;
use crate::error::Result;
use crate::mods::{Mod, ModContext, OptValue, expect_args};

pub(crate) const USAGE: &str = "print\n\
    Log a dump of each packet in the carrier; packets pass through untouched.";

#[derive(Debug)]
pub struct Print;

impl Print {
    pub fn build(args: &[OptValue]) -> Result<Box<dyn Mod>> {
        expect_args("print", args, 0)?;
        Ok(Box::new(Self))
    }
}

impl Mod for Print {
    fn name(&self) -> &'static str {
        "print"
    }

    fn apply(&self, carrier: PacketCarrier, _ctx: &mut ModContext) -> Result<PacketCarrier> {
        for (i, entry) in carrier.iter().enumerate() {
            if entry.delay.is_zero() {
                info!("packet {}: {}", i, entry.packet.dump());
            } else {
                info!(
                    "packet {}: {} (+{}ms)",
                    i,
                    entry.packet.dump(),
                    entry.delay.as_millis()
                );
            }
        }
        Ok(carrier)
    }
}

impl fmt::Display for Print {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Print")
    }
}
