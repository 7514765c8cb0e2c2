//! Argument atoms and the test-plan expander.
//!
//! A configuration names modifications whose options may be single values,
//! sequences, or ranges. Expansion enumerates the Cartesian product of all
//! option atoms across both pipelines, treating the earliest modification's
//! atom as the slowest-changing digit, so adjacent tests usually differ
//! only in the last parameter. Decoding an index is pure arithmetic, which
//! keeps the enumeration deterministic and random access cheap.

use crate::config::{Config, ModDescriptor, RawOpt};
use crate::direction::Direction;
use crate::error::{Error, Result};
use crate::mods::{self, Mod, ModKind, OptValue, Pipeline, PipelineStage};

/// Generator for the concrete values of one modification parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum OptAtom {
    Scalar(OptValue),
    SeqInt(Vec<i64>),
    SeqStr(Vec<String>),
    Range { start: i64, stop: i64, step: i64 },
    Absent,
}

impl OptAtom {
    /// Parse one raw configuration option. Strings starting with a typing
    /// keyword parse as that atom; anything else is a scalar of its
    /// natural kind.
    pub fn parse(mod_name: &str, raw: &RawOpt) -> Result<Self> {
        match raw {
            RawOpt::Int(n) => Ok(OptAtom::Scalar(OptValue::Int(*n))),
            RawOpt::Str(s) => Self::parse_str(mod_name, s),
        }
    }

    fn parse_str(mod_name: &str, s: &str) -> Result<Self> {
        let mut tokens = s.split_whitespace();
        let Some(head) = tokens.next() else {
            return Err(Error::argument(mod_name, "empty option string"));
        };
        let rest: Vec<&str> = tokens.collect();
        match head {
            "none" => {
                if !rest.is_empty() {
                    return Err(Error::argument(mod_name, "'none' takes no tokens"));
                }
                Ok(OptAtom::Absent)
            }
            "int" => {
                let [token] = rest.as_slice() else {
                    return Err(Error::argument(mod_name, "'int' takes exactly one token"));
                };
                Ok(OptAtom::Scalar(OptValue::Int(parse_int(mod_name, token)?)))
            }
            "str" => {
                let [token] = rest.as_slice() else {
                    return Err(Error::argument(mod_name, "'str' takes exactly one token"));
                };
                Ok(OptAtom::Scalar(OptValue::Str(token.to_string())))
            }
            "seq_int" => {
                if rest.is_empty() {
                    return Err(Error::argument(mod_name, "'seq_int' needs at least one int"));
                }
                let values = rest
                    .iter()
                    .map(|t| parse_int(mod_name, t))
                    .collect::<Result<Vec<_>>>()?;
                Ok(OptAtom::SeqInt(values))
            }
            "seq_str" => {
                if rest.is_empty() {
                    return Err(Error::argument(mod_name, "'seq_str' needs at least one token"));
                }
                Ok(OptAtom::SeqStr(rest.iter().map(|t| t.to_string()).collect()))
            }
            "range" => Self::parse_range(mod_name, &rest),
            // No recognized keyword: the whole string is a scalar.
            _ => Ok(OptAtom::Scalar(OptValue::Str(s.to_string()))),
        }
    }

    /// `range <stop>`, `range <start> <stop>`, or
    /// `range <start> <stop> <step>`; stop-exclusive, like the values a
    /// counting loop would visit.
    fn parse_range(mod_name: &str, tokens: &[&str]) -> Result<Self> {
        let ints = tokens
            .iter()
            .map(|t| parse_int(mod_name, t))
            .collect::<Result<Vec<_>>>()?;
        let (start, stop, step) = match ints.as_slice() {
            [stop] => (0, *stop, 1),
            [start, stop] => (*start, *stop, 1),
            [start, stop, step] => (*start, *stop, *step),
            _ => {
                return Err(Error::argument(
                    mod_name,
                    format!("'range' takes 1 to 3 ints, got {}", tokens.len()),
                ));
            }
        };
        if step == 0 {
            return Err(Error::argument(mod_name, "'range' step must not be 0"));
        }
        if (step > 0 && start >= stop) || (step < 0 && start <= stop) {
            return Err(Error::argument(
                mod_name,
                format!("empty range {start}..{stop} (step {step})"),
            ));
        }
        Ok(OptAtom::Range { start, stop, step })
    }

    /// How many concrete values this atom yields.
    pub fn cardinality(&self) -> u64 {
        match self {
            OptAtom::Scalar(_) | OptAtom::Absent => 1,
            OptAtom::SeqInt(values) => values.len() as u64,
            OptAtom::SeqStr(values) => values.len() as u64,
            OptAtom::Range { start, stop, step } => {
                let (span, step) = if *step > 0 {
                    (stop - start, *step)
                } else {
                    (start - stop, -*step)
                };
                (span as u128).div_ceil(step as u128) as u64
            }
        }
    }

    /// The `i`-th concrete value; `i` must be below the cardinality.
    pub fn get(&self, i: u64) -> OptValue {
        match self {
            OptAtom::Scalar(value) => value.clone(),
            OptAtom::Absent => OptValue::Absent,
            OptAtom::SeqInt(values) => OptValue::Int(values[i as usize]),
            OptAtom::SeqStr(values) => OptValue::Str(values[i as usize].clone()),
            OptAtom::Range { start, step, .. } => OptValue::Int(start + step * i as i64),
        }
    }
}

fn parse_int(mod_name: &str, token: &str) -> Result<i64> {
    token
        .parse::<i64>()
        .map_err(|_| Error::argument(mod_name, format!("cannot parse '{token}' as an int")))
}

/// One modification with unexpanded options.
#[derive(Clone, Debug)]
pub struct ModSpec {
    pub kind: &'static ModKind,
    pub atoms: Vec<OptAtom>,
    pub optional: bool,
}

impl ModSpec {
    pub fn from_descriptor(descriptor: &ModDescriptor) -> Result<Self> {
        let kind = mods::lookup(&descriptor.mod_name)?;
        let atoms = descriptor
            .mod_opts
            .iter()
            .map(|raw| OptAtom::parse(kind.name, raw))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            kind,
            atoms,
            optional: descriptor.optional,
        })
    }
}

/// Unexpanded pipeline description.
#[derive(Clone, Debug)]
pub struct PipelineSpec {
    pub direction: Direction,
    pub mods: Vec<ModSpec>,
}

impl PipelineSpec {
    pub fn from_descriptors(direction: Direction, descriptors: &[ModDescriptor]) -> Result<Self> {
        let mods = descriptors
            .iter()
            .map(ModSpec::from_descriptor)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { direction, mods })
    }
}

/// Modification bound to concrete argument values.
#[derive(Clone, Debug)]
pub struct BoundMod {
    pub kind: &'static ModKind,
    pub args: Vec<OptValue>,
    pub optional: bool,
}

impl BoundMod {
    pub fn instantiate(&self) -> Result<Box<dyn Mod>> {
        (self.kind.build)(&self.args)
    }

    pub fn describe(&self) -> String {
        let mut out = self.kind.name.to_string();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&arg.to_string());
        }
        out
    }
}

impl PartialEq for BoundMod {
    fn eq(&self, other: &Self) -> bool {
        self.kind.name == other.kind.name
            && self.args == other.args
            && self.optional == other.optional
    }
}

/// One fully expanded test: a concrete pipeline pair.
#[derive(Clone, Debug, PartialEq)]
pub struct TestCase {
    pub index: u64,
    pub input: Vec<BoundMod>,
    pub output: Vec<BoundMod>,
}

impl TestCase {
    /// Build the runnable pipeline for one direction.
    pub fn pipeline(&self, direction: Direction) -> Result<Pipeline> {
        let bound = match direction {
            Direction::Input => &self.input,
            Direction::Output => &self.output,
        };
        let stages = bound
            .iter()
            .map(|b| {
                Ok(PipelineStage {
                    modification: b.instantiate()?,
                    optional: b.optional,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Pipeline::new(direction, stages))
    }

    /// One-line parameter rendering for logs and failure reports.
    pub fn describe(&self) -> String {
        let render = |bound: &[BoundMod]| {
            bound
                .iter()
                .map(BoundMod::describe)
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "input=[{}] output=[{}]",
            render(&self.input),
            render(&self.output)
        )
    }
}

/// The full declarative plan, expandable by test index.
#[derive(Clone, Debug)]
pub struct TestPlan {
    pub input: PipelineSpec,
    pub output: PipelineSpec,
}

impl TestPlan {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            input: PipelineSpec::from_descriptors(Direction::Input, &config.input)?,
            output: PipelineSpec::from_descriptors(Direction::Output, &config.output)?,
        })
    }

    fn atoms(&self) -> impl Iterator<Item = &OptAtom> {
        self.input
            .mods
            .iter()
            .chain(self.output.mods.iter())
            .flat_map(|m| m.atoms.iter())
    }

    /// Total number of tests: the product of every atom's cardinality.
    pub fn test_count(&self) -> Result<u64> {
        let mut count: u64 = 1;
        for atom in self.atoms() {
            count = count
                .checked_mul(atom.cardinality())
                .ok_or_else(|| Error::config("test count overflows u64"))?;
        }
        Ok(count)
    }

    /// Decode the `index`-th concrete test. The same index always decodes
    /// to the same argument tuple.
    pub fn concrete(&self, index: u64) -> Result<TestCase> {
        let count = self.test_count()?;
        if index >= count {
            return Err(Error::internal(format!(
                "test index {index} out of range 0..{count}"
            )));
        }
        // The earliest atom is the most significant digit, so peel
        // remainders walking the atom list backwards.
        let atoms: Vec<&OptAtom> = self.atoms().collect();
        let mut digits = vec![0u64; atoms.len()];
        let mut rest = index;
        for (digit, atom) in digits.iter_mut().zip(atoms.iter()).rev() {
            let cardinality = atom.cardinality();
            *digit = rest % cardinality;
            rest /= cardinality;
        }
        let values: Vec<OptValue> = digits
            .iter()
            .zip(atoms.iter())
            .map(|(digit, atom)| atom.get(*digit))
            .collect();

        let mut cursor = 0usize;
        let mut bind = |spec: &PipelineSpec| -> Vec<BoundMod> {
            spec.mods
                .iter()
                .map(|m| {
                    let args = values[cursor..cursor + m.atoms.len()].to_vec();
                    cursor += m.atoms.len();
                    BoundMod {
                        kind: m.kind,
                        args,
                        optional: m.optional,
                    }
                })
                .collect()
        };
        let input = bind(&self.input);
        let output = bind(&self.output);
        Ok(TestCase {
            index,
            input,
            output,
        })
    }

    /// Lazily enumerate every test in index order.
    pub fn iter(&self) -> Result<impl Iterator<Item = Result<TestCase>> + '_> {
        let count = self.test_count()?;
        Ok((0..count).map(move |index| self.concrete(index)))
    }
}
