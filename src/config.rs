//! JSON suite configuration: the command template, the diversion rules,
//! and the two modification pipelines.

use std::fs;
use std::path::Path;

use rustc_hash::FxHashSet;
use serde::Deserialize;

use crate::error::{Error, Result};

fn default_true() -> bool {
    true
}

fn default_repeat() -> u32 {
    1
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Command template; `{i}` is the test index, `{j}` the iteration.
    pub cmd: String,
    /// Packet selectors that divert traffic into the userspace queues.
    pub nfrules: Vec<NfRule>,
    /// Modifications applied to intercepted input packets.
    #[serde(default)]
    pub input: Vec<ModDescriptor>,
    /// Modifications applied to intercepted output packets.
    #[serde(default)]
    pub output: Vec<ModDescriptor>,
    /// How many times the command runs per test; every run must exit 0.
    #[serde(default = "default_repeat")]
    pub repeat: u32,
    /// Optional file pattern for the command's stdout (`{i}`/`{j}`
    /// placeholders). Without a pattern the output is discarded.
    #[serde(default)]
    pub stdout_pattern: Option<String>,
    /// Ditto for stderr.
    #[serde(default)]
    pub stderr_pattern: Option<String>,
}

/// One packet selector. `qnum` must be even: the rule delivers OUTPUT
/// traffic to `qnum` and INPUT traffic to `qnum + 1`.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NfRule {
    #[serde(default = "default_true")]
    pub output_chain: bool,
    #[serde(default = "default_true")]
    pub input_chain: bool,
    /// iptables protocol name. Defaults to tcp when only a port is given.
    #[serde(default)]
    pub proto: Option<String>,
    /// IPv4 host or hostname filter.
    #[serde(default)]
    pub host: Option<String>,
    /// IPv6 host filter; falls back to `host`.
    #[serde(default)]
    pub host6: Option<String>,
    /// Port filter, iptables syntax (a number or a range like `80:90`).
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default = "default_true")]
    pub ipv4: bool,
    #[serde(default = "default_true")]
    pub ipv6: bool,
    pub qnum: u16,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModDescriptor {
    pub mod_name: String,
    #[serde(default)]
    pub mod_opts: ModOpts,
    /// Optional modifications downgrade apply failures to warnings.
    #[serde(default)]
    pub optional: bool,
}

/// `mod_opts` accepts a single value or a list of values.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum ModOpts {
    One(RawOpt),
    Many(Vec<RawOpt>),
}

impl Default for ModOpts {
    fn default() -> Self {
        ModOpts::Many(Vec::new())
    }
}

impl ModOpts {
    pub fn iter(&self) -> std::slice::Iter<'_, RawOpt> {
        match self {
            ModOpts::One(opt) => std::slice::from_ref(opt).iter(),
            ModOpts::Many(opts) => opts.iter(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ModOpts::One(_) => 1,
            ModOpts::Many(opts) => opts.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A raw literal from the configuration: an int or a string. Strings may
/// carry a typed-atom prefix, resolved by the expander.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RawOpt {
    Int(i64),
    Str(String),
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|err| Error::config(format!("read {}: {err}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(text).map_err(|err| Error::config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        if self.cmd.trim().is_empty() {
            return Err(Error::config("cmd is empty"));
        }
        if self.nfrules.is_empty() {
            return Err(Error::config("at least one nfrules entry is required"));
        }
        if self.repeat == 0 {
            return Err(Error::config("repeat must be at least 1"));
        }
        let mut output_qnums = FxHashSet::default();
        let mut input_qnums = FxHashSet::default();
        for (i, rule) in self.nfrules.iter().enumerate() {
            let at = |msg: &str| Error::config(format!("nfrules[{i}]: {msg}"));
            if rule.qnum % 2 != 0 {
                return Err(at("qnum must be even"));
            }
            if !rule.output_chain && !rule.input_chain {
                return Err(at("cannot disable both chains"));
            }
            if !rule.ipv4 && !rule.ipv6 {
                return Err(at("cannot disable both IPv4 and IPv6"));
            }
            if rule.output_chain && !output_qnums.insert(rule.qnum) {
                return Err(at("duplicate output queue number"));
            }
            if rule.input_chain && !input_qnums.insert(rule.qnum + 1) {
                return Err(at("duplicate input queue number"));
            }
        }
        Ok(())
    }
}
