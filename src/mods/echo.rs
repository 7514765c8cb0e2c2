//! Write a trace line without touching the carrier. Useful for anchoring a
//! test's position in logs.

use std::fmt;

use tracing::info;

use crate::carrier::PacketCarrier;
use crate::error::{Error, Result};
use crate::mods::{Mod, ModContext, OptValue, expect_args};

pub(crate) const USAGE: &str = "echo <string>\n\
    Log <string> when the pipeline runs; packets pass through untouched.";

#[derive(Debug)]
pub struct Echo {
    message: String,
}

impl Echo {
    pub fn build(args: &[OptValue]) -> Result<Box<dyn Mod>> {
        expect_args("echo", args, 1)?;
        let message = match &args[0] {
            OptValue::Str(s) => s.clone(),
            OptValue::Int(n) => n.to_string(),
            OptValue::Absent => {
                return Err(Error::argument("echo", "argument 1 must be a string"));
            }
        };
        Ok(Box::new(Self { message }))
    }
}

impl Mod for Echo {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn apply(&self, carrier: PacketCarrier, ctx: &mut ModContext) -> Result<PacketCarrier> {
        info!("echo: {}", self.message);
        ctx.trace.push(self.message.clone());
        Ok(carrier)
    }
}

impl fmt::Display for Echo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Echo {:?}", self.message)
    }
}
