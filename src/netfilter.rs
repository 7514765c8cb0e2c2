//! Kernel diversion rules: iptables/ip6tables NFQUEUE plumbing with
//! breadcrumb-backed crash recovery.
//!
//! Rule building is pure and unit-testable; execution goes through an
//! [`Exec`] mode so dry runs and tests share the code path. Every rule is
//! tagged with a comment so leftovers from a crashed run are recognisable,
//! and the breadcrumb file records what is installed at any moment so the
//! next start can sweep it away.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::NfRule;
use crate::error::{Error, Result};

/// Comment tag carried by every rule this system installs.
pub const RULE_TAG: &str = "fragsuite";

/// Default location of the installed-rules breadcrumb.
pub const DEFAULT_BREADCRUMB: &str = "/run/fragsuite-rules.json";

/// Which rule table a command targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub const fn binary(self) -> &'static str {
        match self {
            IpFamily::V4 => "iptables",
            IpFamily::V6 => "ip6tables",
        }
    }
}

/// One fully built rule: the table binary and the argument vector, chain
/// first. `-I` or `-D` is prepended at execution time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleCmd {
    pub family: IpFamily,
    pub args: Vec<String>,
}

struct Chain {
    name: &'static str,
    host_flag: &'static str,
    port_flag: &'static str,
    qnum_offset: u16,
}

const OUTPUT: Chain = Chain {
    name: "OUTPUT",
    host_flag: "-d",
    port_flag: "--dport",
    qnum_offset: 0,
};

const INPUT: Chain = Chain {
    name: "INPUT",
    host_flag: "-s",
    port_flag: "--sport",
    qnum_offset: 1,
};

/// Declarative packet selector scoped to one test.
#[derive(Clone, Debug)]
pub struct DiversionRule {
    pub output_chain: bool,
    pub input_chain: bool,
    pub proto: Option<String>,
    pub host: Option<String>,
    pub host6: Option<String>,
    pub port: Option<String>,
    pub ipv4: bool,
    pub ipv6: bool,
    pub qnum: u16,
}

impl DiversionRule {
    pub fn from_config(rule: &NfRule) -> Result<Self> {
        if rule.qnum % 2 != 0 {
            return Err(Error::config("qnum must be even"));
        }
        if !rule.output_chain && !rule.input_chain {
            return Err(Error::config("cannot disable both chains"));
        }
        if !rule.ipv4 && !rule.ipv6 {
            return Err(Error::config("cannot disable both IPv4 and IPv6"));
        }
        // A port filter needs a port-aware protocol; default to tcp when
        // only the port was given.
        let proto = match (&rule.proto, &rule.port) {
            (None, Some(_)) => Some("tcp".to_string()),
            (proto, _) => proto.clone(),
        };
        let port = match proto.as_deref() {
            Some("tcp") | Some("udp") => rule.port.clone(),
            _ => None,
        };
        Ok(Self {
            output_chain: rule.output_chain,
            input_chain: rule.input_chain,
            proto,
            host: rule.host.clone(),
            host6: rule.host6.clone().or_else(|| rule.host.clone()),
            port,
            ipv4: rule.ipv4,
            ipv6: rule.ipv6,
            qnum: rule.qnum,
        })
    }

    fn nfqueue_args(&self, chain: &Chain, host: Option<&str>) -> Vec<String> {
        let mut args = vec![chain.name.to_string()];
        if let Some(host) = host {
            args.push(chain.host_flag.to_string());
            args.push(host.to_string());
        }
        if let Some(proto) = &self.proto {
            args.push("-p".to_string());
            args.push(proto.clone());
            if let Some(port) = &self.port {
                args.push(chain.port_flag.to_string());
                args.push(port.clone());
            }
        }
        args.extend([
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            RULE_TAG.to_string(),
        ]);
        args.extend([
            "-j".to_string(),
            "NFQUEUE".to_string(),
            "--queue-num".to_string(),
            (self.qnum + chain.qnum_offset).to_string(),
        ]);
        args
    }

    /// Extra OUTPUT rule dropping the kernel's own RST replies for TCP
    /// flows; the local stack would otherwise kill the connection under
    /// test as soon as it sees unexpected segments.
    fn rst_args(&self, chain: &Chain, host: Option<&str>) -> Vec<String> {
        let mut args = vec!["OUTPUT".to_string()];
        if let Some(host) = host {
            args.push("-d".to_string());
            args.push(host.to_string());
        }
        args.push("-p".to_string());
        args.push("tcp".to_string());
        if let Some(port) = &self.port {
            args.push(chain.port_flag.to_string());
            args.push(port.clone());
        }
        args.extend(["--tcp-flags".to_string(), "RST".to_string(), "RST".to_string()]);
        args.extend([
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            RULE_TAG.to_string(),
        ]);
        args.extend(["-j".to_string(), "DROP".to_string()]);
        args
    }

    /// Every concrete table command this selector expands to.
    pub fn commands(&self) -> Vec<RuleCmd> {
        let mut families: Vec<(IpFamily, Option<&str>)> = Vec::new();
        if self.ipv4 {
            families.push((IpFamily::V4, self.host.as_deref()));
        }
        if self.ipv6 {
            families.push((IpFamily::V6, self.host6.as_deref()));
        }
        let mut chains: Vec<&Chain> = Vec::new();
        if self.output_chain {
            chains.push(&OUTPUT);
        }
        if self.input_chain {
            chains.push(&INPUT);
        }
        let tcp = self.proto.as_deref() == Some("tcp");

        let mut cmds = Vec::new();
        for (family, host) in &families {
            for chain in &chains {
                cmds.push(RuleCmd {
                    family: *family,
                    args: self.nfqueue_args(chain, *host),
                });
                if tcp {
                    cmds.push(RuleCmd {
                        family: *family,
                        args: self.rst_args(chain, *host),
                    });
                }
            }
        }
        cmds
    }
}

/// How rule commands are executed.
#[derive(Clone)]
pub enum Exec {
    /// Run the real table binaries.
    System,
    /// Log only; used by dry runs.
    Dry,
    /// Record actions for assertions.
    #[cfg(any(test, feature = "test-internals"))]
    Record(std::sync::Arc<std::sync::Mutex<Vec<(String, RuleCmd)>>>),
}

impl Exec {
    fn run(&self, action: &str, cmd: &RuleCmd) -> Result<()> {
        match self {
            Exec::System => {
                let output = Command::new(cmd.family.binary())
                    .arg(action)
                    .args(&cmd.args)
                    .output()
                    .map_err(|err| {
                        Error::setup(format!("spawn {}: {err}", cmd.family.binary()))
                    })?;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(Error::setup(format!(
                        "{} {} {} failed: {}",
                        cmd.family.binary(),
                        action,
                        cmd.args.join(" "),
                        stderr.trim()
                    )));
                }
                Ok(())
            }
            Exec::Dry => {
                debug!("{} {} {}", cmd.family.binary(), action, cmd.args.join(" "));
                Ok(())
            }
            #[cfg(any(test, feature = "test-internals"))]
            Exec::Record(log) => {
                log.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push((action.to_string(), cmd.clone()));
                Ok(())
            }
        }
    }
}

/// The diversion rules owned by one test: install/teardown tracking plus
/// the on-disk breadcrumb.
pub struct RuleSet {
    planned: Vec<RuleCmd>,
    installed: Vec<RuleCmd>,
    exec: Exec,
    breadcrumb: PathBuf,
}

impl RuleSet {
    pub fn new(rules: &[DiversionRule], exec: Exec, breadcrumb: PathBuf) -> Self {
        Self {
            planned: rules.iter().flat_map(DiversionRule::commands).collect(),
            installed: Vec::new(),
            exec,
            breadcrumb,
        }
    }

    pub fn commands(&self) -> &[RuleCmd] {
        &self.planned
    }

    /// Install every planned rule. On failure the already-installed prefix
    /// is removed before the error returns.
    pub fn install(&mut self) -> Result<()> {
        for cmd in self.planned.clone() {
            if let Err(err) = self.exec.run("-I", &cmd) {
                self.uninstall();
                return Err(err);
            }
            self.installed.push(cmd);
            self.write_breadcrumb();
        }
        Ok(())
    }

    /// Remove the installed rules in reverse install order. Removal errors
    /// are logged, never raised: teardown must always finish.
    pub fn uninstall(&mut self) {
        while let Some(cmd) = self.installed.pop() {
            if let Err(err) = self.exec.run("-D", &cmd) {
                warn!(%err, "failed to remove diversion rule");
            }
        }
        if let Err(err) = fs::remove_file(&self.breadcrumb) {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(%err, "could not remove breadcrumb");
            }
        }
    }

    pub fn active(&self) -> bool {
        !self.installed.is_empty()
    }

    fn write_breadcrumb(&self) {
        match serde_json::to_vec_pretty(&self.installed) {
            Ok(json) => {
                if let Err(err) = fs::write(&self.breadcrumb, json) {
                    warn!(
                        %err,
                        path = %self.breadcrumb.display(),
                        "could not write rule breadcrumb"
                    );
                }
            }
            Err(err) => warn!(%err, "could not serialize rule breadcrumb"),
        }
    }
}

impl Drop for RuleSet {
    fn drop(&mut self) {
        if self.active() {
            warn!("diversion rules still installed at drop; removing");
            self.uninstall();
        }
    }
}

/// Remove any rules a previous crashed run left behind, as recorded by its
/// breadcrumb. Safe to call repeatedly; a missing breadcrumb is a no-op.
pub fn sweep_stale(breadcrumb: &Path, exec: &Exec) -> Result<usize> {
    let text = match fs::read_to_string(breadcrumb) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => {
            return Err(Error::setup(format!(
                "read breadcrumb {}: {err}",
                breadcrumb.display()
            )));
        }
    };
    let stale: Vec<RuleCmd> = serde_json::from_str(&text)
        .map_err(|err| Error::setup(format!("parse breadcrumb: {err}")))?;
    for cmd in stale.iter().rev() {
        if let Err(err) = exec.run("-D", cmd) {
            warn!(%err, "stale rule removal failed");
        }
    }
    fs::remove_file(breadcrumb)
        .map_err(|err| Error::setup(format!("remove breadcrumb: {err}")))?;
    Ok(stale.len())
}
