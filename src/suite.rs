//! Suite orchestration: expand the plan, run tests sequentially, aggregate
//! outcomes, and cancel cleanly on an interrupt.
//!
//! Tests run one at a time because each test exclusively owns the kernel
//! diversion rules for its queue numbers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::Rng;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::direction::Direction;
use crate::error::{Error, Result};
use crate::netfilter::{self, DiversionRule};
use crate::plan::TestPlan;
use crate::report::{Aggregator, TestStatus};
use crate::runtime::{TestEnv, run_test};
use crate::utils::substitute;
use crate::{mods, plan};

#[derive(Clone, Copy, Debug, Default)]
pub struct SuiteOptions {
    /// Seed for every randomised modification; random when omitted.
    pub seed: Option<u64>,
    /// First test index to run.
    pub from: Option<u64>,
    /// Last test index to run, inclusive.
    pub to: Option<u64>,
    /// Expand and print without touching the kernel or running commands.
    pub dry_run: bool,
}

/// One-shot cancellation switch shared between the signal listener and the
/// active test.
#[derive(Debug, Default)]
pub struct Cancel {
    flag: AtomicBool,
    notify: Notify,
}

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a waiter arriving later still
        // completes immediately.
        self.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn notified(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Validate a configuration end to end without touching the kernel.
/// Returns the expanded plan and its test count.
pub fn checkconfig(cfg: &Config) -> Result<(TestPlan, u64)> {
    if let Some(problem) = mods::verify().into_iter().next() {
        return Err(problem);
    }
    cfg.validate()?;
    let plan = TestPlan::from_config(cfg)?;
    let count = plan.test_count()?;

    // Every test must expand and every modification must accept its bound
    // arguments; a full enumeration also proves the advertised count.
    let mut enumerated = 0u64;
    for case in plan.iter()? {
        let case = case?;
        case.pipeline(Direction::Input)?;
        case.pipeline(Direction::Output)?;
        enumerated += 1;
    }
    if enumerated != count {
        return Err(Error::internal(format!(
            "expanded {enumerated} tests, expected {count}"
        )));
    }

    for rule in &cfg.nfrules {
        DiversionRule::from_config(rule)?;
    }
    if substitute(&cfg.cmd, 0, 0).trim().is_empty() {
        return Err(Error::config("cmd is empty after substitution"));
    }
    Ok((plan, count))
}

/// Run the whole suite against `env`.
pub async fn run_suite(cfg: &Config, opts: SuiteOptions, env: &TestEnv) -> Result<Aggregator> {
    let (plan, count) = checkconfig(cfg)?;
    let seed = opts.seed.unwrap_or_else(|| rand::rng().random());
    let from = opts.from.unwrap_or(0);
    let to = opts.to.unwrap_or(count - 1).min(count - 1);
    if from > to {
        return Err(Error::config(format!("--from {from} is past --to {to}")));
    }
    info!(tests = count, from, to, seed, "suite expanded");

    match netfilter::sweep_stale(&env.breadcrumb, &env.exec) {
        Ok(0) => {}
        Ok(n) => warn!(rules = n, "swept stale diversion rules from a previous run"),
        Err(err) => warn!(%err, "stale-rule sweep failed"),
    }

    if opts.dry_run {
        let rules = cfg
            .nfrules
            .iter()
            .map(DiversionRule::from_config)
            .collect::<Result<Vec<_>>>()?;
        for cmd in rules.iter().flat_map(DiversionRule::commands) {
            info!("{} -I {}", cmd.family.binary(), cmd.args.join(" "));
        }
    }

    let cancel = Arc::new(Cancel::new());
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; stopping after the active test");
                cancel.trigger();
            }
        });
    }

    let mut aggregator = Aggregator::default();
    for index in from..=to {
        if cancel.is_cancelled() {
            break;
        }
        let case = plan.concrete(index)?;
        if opts.dry_run {
            info!(test = index, "{}", case.describe());
            continue;
        }
        let result = run_test(cfg, &case, seed, env, &cancel).await;
        match result.status {
            TestStatus::Passed => info!(test = index, exit = ?result.exit_code, "passed"),
            TestStatus::Failed => warn!(test = index, exit = ?result.exit_code, "failed"),
            TestStatus::SetupError => {
                error!(test = index, "setup error: {}", result.notes.join("; "));
            }
            TestStatus::Cancelled => warn!(test = index, "cancelled"),
        }
        let stop = result.status == TestStatus::Cancelled;
        aggregator.record(result);
        if stop {
            break;
        }
    }
    Ok(aggregator)
}

/// Convenience wrapper: expand one test by index, for tooling and tests.
pub fn expand_one(cfg: &Config, index: u64) -> Result<plan::TestCase> {
    let (test_plan, _) = checkconfig(cfg)?;
    test_plan.concrete(index)
}
