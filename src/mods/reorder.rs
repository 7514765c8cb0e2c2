//! Rearrange the carrier: uniformly at random, reversed, or by an explicit
//! permutation.

use std::fmt;

use rand::seq::SliceRandom;

use crate::carrier::{PacketCarrier, PacketEntry};
use crate::error::{Error, Result};
use crate::mods::{Mod, ModContext, OptValue, int_arg};

pub(crate) const USAGE: &str = "reorder {random|reverse|<i0> <i1> ...}\n\
    Apply a permutation to the carrier: uniformly random, reversed, or the\n\
    explicit index list (which must be a permutation of 0..len).";

#[derive(Debug)]
enum Order {
    Random,
    Reverse,
    Explicit(Vec<usize>),
}

#[derive(Debug)]
pub struct Reorder {
    order: Order,
}

impl Reorder {
    pub fn build(args: &[OptValue]) -> Result<Box<dyn Mod>> {
        if args.is_empty() {
            return Err(Error::argument("reorder", "expected at least 1 argument"));
        }
        if args.len() == 1 {
            if let OptValue::Str(s) = &args[0] {
                return match s.as_str() {
                    "random" => Ok(Box::new(Self { order: Order::Random })),
                    "reverse" => Ok(Box::new(Self { order: Order::Reverse })),
                    other => Err(Error::argument(
                        "reorder",
                        format!("expected 'random', 'reverse' or indexes, got '{other}'"),
                    )),
                };
            }
        }
        let mut indexes = Vec::with_capacity(args.len());
        for i in 0..args.len() {
            let n = int_arg("reorder", args, i)?;
            let index = usize::try_from(n).map_err(|_| {
                Error::argument("reorder", format!("index {n} must not be negative"))
            })?;
            indexes.push(index);
        }
        Ok(Box::new(Self {
            order: Order::Explicit(indexes),
        }))
    }

    fn permute(carrier: PacketCarrier, sequence: &[usize]) -> Result<PacketCarrier> {
        if sequence.len() != carrier.len() {
            return Err(Error::runtime(
                "reorder",
                format!(
                    "permutation length {} does not match carrier length {}",
                    sequence.len(),
                    carrier.len()
                ),
            ));
        }
        let mut slots: Vec<Option<PacketEntry>> = carrier.into_iter().map(Some).collect();
        let mut reordered = PacketCarrier::new();
        for &index in sequence {
            let entry = slots
                .get_mut(index)
                .and_then(Option::take)
                .ok_or_else(|| {
                    Error::runtime(
                        "reorder",
                        format!("index {index} is out of range or repeated"),
                    )
                })?;
            reordered.push_entry(entry);
        }
        Ok(reordered)
    }
}

impl Mod for Reorder {
    fn name(&self) -> &'static str {
        "reorder"
    }

    fn apply(&self, carrier: PacketCarrier, ctx: &mut ModContext) -> Result<PacketCarrier> {
        match &self.order {
            Order::Reverse => {
                let mut sequence: Vec<usize> = (0..carrier.len()).collect();
                sequence.reverse();
                Self::permute(carrier, &sequence)
            }
            Order::Random => {
                let mut sequence: Vec<usize> = (0..carrier.len()).collect();
                sequence.shuffle(ctx.rng());
                Self::permute(carrier, &sequence)
            }
            Order::Explicit(sequence) => Self::permute(carrier, sequence),
        }
    }
}

impl fmt::Display for Reorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.order {
            Order::Random => write!(f, "Reorder random"),
            Order::Reverse => write!(f, "Reorder reverse"),
            Order::Explicit(seq) => {
                write!(f, "Reorder")?;
                for index in seq {
                    write!(f, " {index}")?;
                }
                Ok(())
            }
        }
    }
}
