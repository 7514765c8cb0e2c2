//! Per-test runtime: rules in, queues open, command running, packets
//! flowing through the pipelines, everything torn down on the way out.
//!
//! Each bound queue number gets one blocking worker; the two directions of
//! a rule therefore run concurrently while the suite itself stays
//! sequential. Workers dequeue with a bounded timeout so they can notice
//! the stop flag, and they drain their queue with accept verdicts before
//! exiting so no packet stays parked in the kernel.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::carrier::{PacketCarrier, PacketEntry};
use crate::config::Config;
use crate::direction::Direction;
use crate::error::{Error, Result};
use crate::inject::{Injector, RawInjector};
use crate::mods::{ModContext, Pipeline};
use crate::netfilter::{DEFAULT_BREADCRUMB, DiversionRule, Exec, RuleSet};
use crate::packet::Packet;
use crate::plan::TestCase;
use crate::queue::{QueueDriver, QueuedPacket, Verdict};
use crate::report::{TestResult, TestStatus};
use crate::suite::Cancel;
use crate::utils::substitute;

/// How long a worker waits for a packet before rechecking the stop flag.
pub const QUEUE_POLL: Duration = Duration::from_millis(200);
/// Drain window after the command exits.
const DRAIN_POLL: Duration = Duration::from_millis(20);

type QueueFactory = dyn Fn(u16) -> Result<Box<dyn QueueDriver>> + Send + Sync;
type InjectorFactory = dyn Fn() -> Result<Box<dyn Injector>> + Send + Sync;

/// The environment a test runs against. Production talks to the kernel;
/// tests plug in channel drivers and recording injectors.
pub struct TestEnv {
    pub exec: Exec,
    pub breadcrumb: PathBuf,
    pub queues: Box<QueueFactory>,
    pub injectors: Box<InjectorFactory>,
}

impl TestEnv {
    /// Kernel-backed environment: NFQUEUE drivers and raw-socket injection.
    #[cfg(target_os = "linux")]
    pub fn system() -> Self {
        Self {
            exec: Exec::System,
            breadcrumb: PathBuf::from(DEFAULT_BREADCRUMB),
            queues: Box::new(|qnum| {
                Ok(Box::new(crate::nfqueue::NfqDriver::open(qnum)?) as Box<dyn QueueDriver>)
            }),
            injectors: Box::new(|| Ok(Box::new(RawInjector::new()) as Box<dyn Injector>)),
        }
    }
}

/// Deterministic per-worker RNG seed derived from the suite seed, the test
/// index, and the queue binding.
fn worker_seed(suite_seed: u64, index: u64, qnum: u16) -> u64 {
    let mut h = suite_seed ^ 0x517c_c1b7_2722_0a95;
    for v in [index, u64::from(qnum)] {
        h = (h ^ v).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        h ^= h >> 32;
    }
    h
}

#[derive(Debug, Default)]
pub(crate) struct WorkerReport {
    pub received: u64,
    pub accepted: u64,
    pub mangled: u64,
    pub dropped: u64,
    pub injected: u64,
    pub error: Option<String>,
}

/// One queue's packet loop. Runs on a blocking thread until the stop flag
/// rises, then drains the queue with accept verdicts.
pub(crate) fn worker_loop(
    mut driver: Box<dyn QueueDriver>,
    pipeline: Pipeline,
    mut injector: Box<dyn Injector>,
    seed: u64,
    stop: Arc<AtomicBool>,
    poll: Duration,
) -> WorkerReport {
    let mut ctx = ModContext::new(seed);
    let mut report = WorkerReport::default();
    let mut pass_through = false;

    while !stop.load(Ordering::Relaxed) {
        let packet = match driver.recv_timeout(poll) {
            Ok(Some(packet)) => packet,
            Ok(None) => continue,
            Err(err) => {
                report.error.get_or_insert(err.to_string());
                break;
            }
        };
        report.received += 1;
        if pass_through {
            accept(&mut *driver, packet.id, &mut report);
            continue;
        }
        let carrier = PacketCarrier::single(Packet::from_bytes(packet.payload.clone()));
        match pipeline.apply(carrier, &mut ctx) {
            Ok(result) => deliver(
                &mut *driver,
                &mut *injector,
                &packet,
                result,
                pipeline.direction,
                &mut report,
            ),
            Err(err) => {
                warn!(%err, direction = %pipeline.direction, "pipeline failed; passing packets through");
                report.error.get_or_insert(err.to_string());
                pass_through = true;
                accept(&mut *driver, packet.id, &mut report);
            }
        }
    }

    while let Ok(Some(packet)) = driver.recv_timeout(DRAIN_POLL) {
        accept(&mut *driver, packet.id, &mut report);
    }
    report
}

fn accept(driver: &mut dyn QueueDriver, id: u32, report: &mut WorkerReport) {
    match driver.verdict(id, Verdict::Accept) {
        Ok(()) => report.accepted += 1,
        Err(err) => warn!(%err, "accept verdict failed"),
    }
}

/// Turn a pipeline's result carrier into verdicts and injections.
fn deliver(
    driver: &mut dyn QueueDriver,
    injector: &mut dyn Injector,
    original: &QueuedPacket,
    result: PacketCarrier,
    direction: Direction,
    report: &mut WorkerReport,
) {
    let mut entries: Vec<PacketEntry> = result.into_iter().collect();

    if entries.is_empty() {
        match driver.verdict(original.id, Verdict::Drop) {
            Ok(()) => report.dropped += 1,
            Err(err) => warn!(%err, "drop verdict failed"),
        }
        return;
    }

    if entries.len() == 1 {
        let entry = entries.remove(0);
        let delay = entry.delay;
        let bytes = entry.packet.into_bytes();
        if bytes == original.payload {
            accept(driver, original.id, report);
        } else {
            match driver.verdict(original.id, Verdict::Mangle(bytes)) {
                Ok(()) => report.mangled += 1,
                Err(err) => warn!(%err, "mangle verdict failed"),
            }
        }
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        return;
    }

    match direction {
        Direction::Output => {
            // Fan out through the raw socket, honoring inter-entry delays,
            // then drop the original.
            for entry in entries {
                match injector.inject(&entry.packet) {
                    Ok(()) => report.injected += 1,
                    Err(err) => warn!(%err, "injection failed"),
                }
                if !entry.delay.is_zero() {
                    std::thread::sleep(entry.delay);
                }
            }
            match driver.verdict(original.id, Verdict::Drop) {
                Ok(()) => report.dropped += 1,
                Err(err) => warn!(%err, "drop verdict failed"),
            }
        }
        Direction::Input => {
            // A verdict can re-enter at most one packet on the input path.
            warn!(
                count = entries.len(),
                "input pipeline fanned out; only the first packet re-enters the stack"
            );
            let first = entries.remove(0);
            match driver.verdict(original.id, Verdict::Mangle(first.packet.into_bytes())) {
                Ok(()) => report.mangled += 1,
                Err(err) => warn!(%err, "mangle verdict failed"),
            }
        }
    }
}

fn child_stdio(pattern: Option<&str>, i: u64, j: u32) -> Result<Stdio> {
    match pattern {
        None => Ok(Stdio::null()),
        Some(pattern) => {
            let path = substitute(pattern, i, j);
            let file = std::fs::File::create(&path)
                .map_err(|err| Error::setup(format!("create {path}: {err}")))?;
            Ok(Stdio::from(file))
        }
    }
}

/// Run one concrete test: install rules, bind queues, run the command
/// (repeating per the config), reap everything, and always uninstall.
pub async fn run_test(
    cfg: &Config,
    case: &TestCase,
    suite_seed: u64,
    env: &TestEnv,
    cancel: &Cancel,
) -> TestResult {
    let started = Utc::now();
    let params = case.describe();
    let mut notes: Vec<String> = Vec::new();

    let finish = |status: TestStatus, exit_code: Option<i32>, notes: Vec<String>| TestResult {
        index: case.index,
        status,
        exit_code,
        started,
        finished: Utc::now(),
        params: params.clone(),
        notes,
    };

    // 1. Diversion rules.
    let rules = match cfg
        .nfrules
        .iter()
        .map(DiversionRule::from_config)
        .collect::<Result<Vec<_>>>()
    {
        Ok(rules) => rules,
        Err(err) => {
            notes.push(err.to_string());
            return finish(TestStatus::SetupError, None, notes);
        }
    };
    let mut ruleset = RuleSet::new(&rules, env.exec.clone(), env.breadcrumb.clone());
    if let Err(err) = ruleset.install() {
        notes.push(err.to_string());
        return finish(TestStatus::SetupError, None, notes);
    }

    // 2. One worker per bound queue number.
    let mut bindings: Vec<(u16, Direction)> = Vec::new();
    {
        let mut seen = rustc_hash::FxHashSet::default();
        for rule in &rules {
            if rule.output_chain && seen.insert(rule.qnum) {
                bindings.push((rule.qnum, Direction::Output));
            }
            if rule.input_chain && seen.insert(rule.qnum + 1) {
                bindings.push((rule.qnum + 1, Direction::Input));
            }
        }
    }
    let stop = Arc::new(AtomicBool::new(false));
    let mut workers = Vec::new();
    let mut setup_error: Option<Error> = None;
    for (qnum, direction) in bindings {
        let spawned = (|| -> Result<_> {
            let driver = (env.queues)(qnum)?;
            let pipeline = case.pipeline(direction)?;
            let injector = (env.injectors)()?;
            Ok((driver, pipeline, injector))
        })();
        match spawned {
            Ok((driver, pipeline, injector)) => {
                let stop = stop.clone();
                let seed = worker_seed(suite_seed, case.index, qnum);
                workers.push(tokio::task::spawn_blocking(move || {
                    worker_loop(driver, pipeline, injector, seed, stop, QUEUE_POLL)
                }));
            }
            Err(err) => {
                setup_error = Some(err);
                break;
            }
        }
    }
    if let Some(err) = setup_error {
        stop.store(true, Ordering::Relaxed);
        for worker in workers {
            let _ = worker.await;
        }
        ruleset.uninstall();
        notes.push(err.to_string());
        return finish(TestStatus::SetupError, None, notes);
    }

    // 3. The command, repeated per config; all iterations must pass.
    let mut status = TestStatus::Passed;
    let mut exit_code: Option<i32> = None;
    'runs: for j in 0..cfg.repeat {
        let cmdline = substitute(&cfg.cmd, case.index, j);
        debug!(test = case.index, iteration = j, %cmdline, "running command");
        let spawned = (|| -> Result<_> {
            let mut command = Command::new("sh");
            command
                .arg("-c")
                .arg(&cmdline)
                .stdin(Stdio::null())
                .stdout(child_stdio(cfg.stdout_pattern.as_deref(), case.index, j)?)
                .stderr(child_stdio(cfg.stderr_pattern.as_deref(), case.index, j)?);
            command
                .spawn()
                .map_err(|err| Error::setup(format!("spawn '{cmdline}': {err}")))
        })();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                status = TestStatus::SetupError;
                notes.push(err.to_string());
                break 'runs;
            }
        };
        tokio::select! {
            waited = child.wait() => match waited {
                Ok(exit) => {
                    exit_code = exit.code();
                    if !exit.success() {
                        status = TestStatus::Failed;
                        notes.push(Error::Command(exit.code().unwrap_or(-1)).to_string());
                        break 'runs;
                    }
                }
                Err(err) => {
                    status = TestStatus::SetupError;
                    notes.push(format!("wait for command: {err}"));
                    break 'runs;
                }
            },
            _ = cancel.notified() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                status = TestStatus::Cancelled;
                notes.push("cancelled by signal".to_string());
                break 'runs;
            }
        }
    }

    // 4-7. Stop the workers, merge their reports, always tear down.
    stop.store(true, Ordering::Relaxed);
    for worker in workers {
        match worker.await {
            Ok(report) => {
                debug!(
                    received = report.received,
                    accepted = report.accepted,
                    mangled = report.mangled,
                    injected = report.injected,
                    dropped = report.dropped,
                    "worker finished"
                );
                if let Some(err) = report.error {
                    if status == TestStatus::Passed {
                        status = TestStatus::Failed;
                    }
                    notes.push(err);
                }
            }
            Err(err) => {
                if status == TestStatus::Passed {
                    status = TestStatus::Failed;
                }
                notes.push(format!("worker panicked: {err}"));
            }
        }
    }
    ruleset.uninstall();
    finish(status, exit_code, notes)
}
