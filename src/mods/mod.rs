//! Packet modifications: the trait, the runtime context, the registry, and
//! the pipeline that chains them.
//!
//! Modification kinds live in a compile-time table keyed by their
//! lower_snake configuration name. Each kind builds an instance from
//! concrete option values; the expander binds the values, the per-test
//! runtime supplies the [`ModContext`].

mod delay;
mod drop_one;
mod drop_proba;
mod duplicate;
mod echo;
mod fragment4;
mod fragment6;
mod overlap;
mod print;
mod reorder;
mod segment;
mod select;
pub(crate) mod util;

use std::fmt;

pub use delay::Delay;
pub use drop_one::DropOne;
pub use drop_proba::DropProba;
pub use duplicate::Duplicate;
pub use echo::Echo;
pub use fragment4::Fragment4;
pub use fragment6::Fragment6;
pub use overlap::{Overlap, Strategy};
pub use print::Print;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
pub use reorder::Reorder;
pub use segment::Segment;
pub use select::Select;
use tracing::warn;

use crate::carrier::PacketCarrier;
use crate::direction::Direction;
use crate::error::{Error, Result};

/// Concrete option value bound to one modification parameter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OptValue {
    Int(i64),
    Str(String),
    Absent,
}

impl fmt::Display for OptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptValue::Int(n) => write!(f, "{n}"),
            OptValue::Str(s) => write!(f, "{s}"),
            OptValue::Absent => write!(f, "none"),
        }
    }
}

/// Per-pipeline runtime state handed to every `apply`.
///
/// Holds the seeded RNG every randomised modification must draw from, the
/// identification counter used when fragments need fresh IP ids, and the
/// side-channel trace written by `echo`.
pub struct ModContext {
    rng: StdRng,
    ident: u32,
    pub trace: Vec<String>,
}

impl ModContext {
    pub fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let ident = rng.random();
        Self {
            rng,
            ident,
            trace: Vec::new(),
        }
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Next value of the monotonically increasing identification counter.
    /// The counter starts at a pseudo-random point derived from the seed.
    pub fn next_ident(&mut self) -> u32 {
        self.ident = self.ident.wrapping_add(1);
        self.ident
    }
}

/// A packet-list transform bound to concrete arguments.
///
/// `apply` must be deterministic given the constructor arguments and the
/// context's RNG seed, and side-effect-free on everything but the carrier.
pub trait Mod: fmt::Display + fmt::Debug + Send {
    fn name(&self) -> &'static str;
    fn apply(&self, carrier: PacketCarrier, ctx: &mut ModContext) -> Result<PacketCarrier>;
}

type BuildFn = fn(&[OptValue]) -> Result<Box<dyn Mod>>;

/// Registry entry for one modification kind.
pub struct ModKind {
    /// lower_snake name used in configurations.
    pub name: &'static str,
    /// UpperCamel name derived from `name`, used in descriptions.
    pub class_name: &'static str,
    pub usage: &'static str,
    pub build: BuildFn,
}

impl fmt::Debug for ModKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModKind").field("name", &self.name).finish()
    }
}

/// Built-in modification kinds, sorted by name.
pub static BUILTINS: &[ModKind] = &[
    ModKind {
        name: "delay",
        class_name: "Delay",
        usage: delay::USAGE,
        build: Delay::build,
    },
    ModKind {
        name: "drop_one",
        class_name: "DropOne",
        usage: drop_one::USAGE,
        build: DropOne::build,
    },
    ModKind {
        name: "drop_proba",
        class_name: "DropProba",
        usage: drop_proba::USAGE,
        build: DropProba::build,
    },
    ModKind {
        name: "duplicate",
        class_name: "Duplicate",
        usage: duplicate::USAGE,
        build: Duplicate::build,
    },
    ModKind {
        name: "echo",
        class_name: "Echo",
        usage: echo::USAGE,
        build: Echo::build,
    },
    ModKind {
        name: "fragment4",
        class_name: "Fragment4",
        usage: fragment4::USAGE,
        build: Fragment4::build,
    },
    ModKind {
        name: "fragment6",
        class_name: "Fragment6",
        usage: fragment6::USAGE,
        build: Fragment6::build,
    },
    ModKind {
        name: "overlap",
        class_name: "Overlap",
        usage: overlap::USAGE,
        build: Overlap::build,
    },
    ModKind {
        name: "print",
        class_name: "Print",
        usage: print::USAGE,
        build: Print::build,
    },
    ModKind {
        name: "reorder",
        class_name: "Reorder",
        usage: reorder::USAGE,
        build: Reorder::build,
    },
    ModKind {
        name: "segment",
        class_name: "Segment",
        usage: segment::USAGE,
        build: Segment::build,
    },
    ModKind {
        name: "select",
        class_name: "Select",
        usage: select::USAGE,
        build: Select::build,
    },
];

/// All registered kinds.
pub fn list() -> &'static [ModKind] {
    BUILTINS
}

/// Find a kind by its configuration name. Both the lower_snake and the
/// UpperCamel spelling resolve.
pub fn lookup(name: &str) -> Result<&'static ModKind> {
    BUILTINS
        .iter()
        .find(|kind| kind.name == name || kind.class_name == name)
        .ok_or_else(|| Error::UnknownModification(name.to_string()))
}

pub fn usage(name: &str) -> Result<&'static str> {
    Ok(lookup(name)?.usage)
}

/// Sanity-check the registry table. A broken entry reports as a load
/// failure for that entry only; the rest of the table stays usable.
pub fn verify() -> Vec<Error> {
    let mut problems = Vec::new();
    let mut seen = rustc_hash::FxHashSet::default();
    for kind in BUILTINS {
        if !seen.insert(kind.name) {
            problems.push(Error::ModificationLoad {
                name: kind.name.to_string(),
                reason: "duplicate registry name".to_string(),
            });
        }
        if kind.class_name != upper_camel(kind.name) {
            problems.push(Error::ModificationLoad {
                name: kind.name.to_string(),
                reason: format!(
                    "class name '{}' does not match '{}'",
                    kind.class_name,
                    upper_camel(kind.name)
                ),
            });
        }
    }
    problems
}

/// `drop_one` -> `DropOne`.
pub(crate) fn upper_camel(name: &str) -> String {
    name.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

// -- argument helpers shared by the builders --

pub(crate) fn expect_args(name: &'static str, args: &[OptValue], n: usize) -> Result<()> {
    if args.len() != n {
        return Err(Error::argument(
            name,
            format!("expected {n} argument(s), got {}", args.len()),
        ));
    }
    Ok(())
}

pub(crate) fn int_arg(name: &'static str, args: &[OptValue], i: usize) -> Result<i64> {
    match args.get(i) {
        Some(OptValue::Int(n)) => Ok(*n),
        other => Err(Error::argument(
            name,
            format!("argument {} must be an int, got {}", i + 1, fmt_opt(other)),
        )),
    }
}

pub(crate) fn str_arg<'a>(name: &'static str, args: &'a [OptValue], i: usize) -> Result<&'a str> {
    match args.get(i) {
        Some(OptValue::Str(s)) => Ok(s),
        other => Err(Error::argument(
            name,
            format!("argument {} must be a string, got {}", i + 1, fmt_opt(other)),
        )),
    }
}

pub(crate) fn f64_arg(name: &'static str, args: &[OptValue], i: usize) -> Result<f64> {
    match args.get(i) {
        Some(OptValue::Int(n)) => Ok(*n as f64),
        Some(OptValue::Str(s)) => s.parse::<f64>().map_err(|_| {
            Error::argument(name, format!("argument {} is not a number: '{s}'", i + 1))
        }),
        other => Err(Error::argument(
            name,
            format!("argument {} must be a number, got {}", i + 1, fmt_opt(other)),
        )),
    }
}

fn fmt_opt(value: Option<&OptValue>) -> String {
    value.map_or_else(|| "nothing".to_string(), |v| format!("'{v}'"))
}

// -- pipeline --

/// One bound modification inside a pipeline.
pub struct PipelineStage {
    pub modification: Box<dyn Mod>,
    pub optional: bool,
}

/// Ordered modifications with one orientation.
pub struct Pipeline {
    pub direction: Direction,
    stages: Vec<PipelineStage>,
}

impl Pipeline {
    pub fn new(direction: Direction, stages: Vec<PipelineStage>) -> Self {
        Self { direction, stages }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Apply every stage in declared order. Empty carriers still flow all
    /// the way through: some stages observe zero-length input.
    ///
    /// A failing optional stage logs and passes the carrier through
    /// unchanged; a failing non-optional stage aborts the fold.
    pub fn apply(&self, mut carrier: PacketCarrier, ctx: &mut ModContext) -> Result<PacketCarrier> {
        for stage in &self.stages {
            if stage.optional {
                let kept = carrier.clone();
                match stage.modification.apply(carrier, ctx) {
                    Ok(next) => carrier = next,
                    Err(err) => {
                        warn!(
                            name = stage.modification.name(),
                            %err,
                            "optional modification failed; carrier unchanged"
                        );
                        carrier = kept;
                    }
                }
            } else {
                carrier = stage.modification.apply(carrier, ctx)?;
            }
        }
        Ok(carrier)
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} [", self.direction)?;
        for stage in &self.stages {
            let marker = if stage.optional { " (optional)" } else { "" };
            writeln!(f, "  - {}{}", stage.modification, marker)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upper_camel() {
        assert_eq!(upper_camel("drop_one"), "DropOne");
        assert_eq!(upper_camel("fragment6"), "Fragment6");
        assert_eq!(upper_camel("echo"), "Echo");
    }

    #[test]
    fn test_context_ident_is_monotonic() {
        let mut ctx = ModContext::new(7);
        let first = ctx.next_ident();
        assert_eq!(ctx.next_ident(), first.wrapping_add(1));
    }

    #[test]
    fn test_context_is_deterministic() {
        let mut a = ModContext::new(99);
        let mut b = ModContext::new(99);
        assert_eq!(a.next_ident(), b.next_ident());
        assert_eq!(a.rng().random::<u64>(), b.rng().random::<u64>());
    }
}
