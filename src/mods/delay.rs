//! Set the post-delay of selected entries. The runtime waits that long
//! after emitting the entry before emitting the next one.

use std::fmt;
use std::time::Duration;

use rand::Rng;

use crate::carrier::PacketCarrier;
use crate::error::{Error, Result};
use crate::mods::{Mod, ModContext, OptValue, expect_args, int_arg};

pub(crate) const USAGE: &str = "delay <ms> {<index>|first|last|random|all}\n\
    Set the post-delay of the selected packet(s) to <ms> milliseconds.";

#[derive(Debug)]
enum Target {
    Index(i64),
    Random,
    All,
}

#[derive(Debug)]
pub struct Delay {
    ms: u64,
    target: Target,
}

impl Delay {
    pub fn build(args: &[OptValue]) -> Result<Box<dyn Mod>> {
        expect_args("delay", args, 2)?;
        let ms = int_arg("delay", args, 0)?;
        let ms = u64::try_from(ms)
            .map_err(|_| Error::argument("delay", format!("delay {ms}ms must not be negative")))?;
        let target = match &args[1] {
            OptValue::Int(n) => Target::Index(*n),
            OptValue::Str(s) => match s.as_str() {
                "first" => Target::Index(0),
                "last" => Target::Index(-1),
                "random" => Target::Random,
                "all" => Target::All,
                other => {
                    return Err(Error::argument(
                        "delay",
                        format!("expected an index, 'first', 'last', 'random' or 'all', got '{other}'"),
                    ));
                }
            },
            OptValue::Absent => return Err(Error::argument("delay", "argument 2 must not be none")),
        };
        Ok(Box::new(Self { ms, target }))
    }
}

impl Mod for Delay {
    fn name(&self) -> &'static str {
        "delay"
    }

    fn apply(&self, mut carrier: PacketCarrier, ctx: &mut ModContext) -> Result<PacketCarrier> {
        if carrier.is_empty() {
            return Ok(carrier);
        }
        let len = carrier.len();
        let delay = Duration::from_millis(self.ms);
        match self.target {
            Target::All => {
                for index in 0..len {
                    carrier.set_delay(index, delay);
                }
            }
            Target::Index(i) => {
                carrier.set_delay(i.rem_euclid(len as i64) as usize, delay);
            }
            Target::Random => {
                let index = ctx.rng().random_range(0..len);
                carrier.set_delay(index, delay);
            }
        }
        Ok(carrier)
    }
}

impl fmt::Display for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Target::Index(i) => write!(f, "Delay {}ms {i}", self.ms),
            Target::Random => write!(f, "Delay {}ms random", self.ms),
            Target::All => write!(f, "Delay {}ms all", self.ms),
        }
    }
}
