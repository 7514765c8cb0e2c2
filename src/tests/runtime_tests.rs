use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::config::Config;
use crate::direction::Direction;
use crate::inject::{Injector, RecordingInjector};
use crate::mods::{self, Mod, OptValue, Pipeline, PipelineStage};
use crate::netfilter::{Exec, RuleCmd};
use crate::queue::{ChannelDriver, QueueDriver, Verdict};
use crate::report::TestStatus;
use crate::runtime::{TestEnv, run_test, worker_loop};
use crate::suite::{self, Cancel, SuiteOptions};
use crate::test_helpers::tcp_payload_packet;

type ExecLog = Arc<Mutex<Vec<(String, RuleCmd)>>>;
type VerdictLog = Arc<Mutex<Vec<(u32, Verdict)>>>;
type SentLog = Arc<Mutex<Vec<Vec<u8>>>>;

/// Environment with empty queues and a shared recording injector.
fn quiet_env(exec: Exec) -> (TestEnv, SentLog, TempDir) {
    let tmp = TempDir::new().unwrap();
    let sent: SentLog = Arc::new(Mutex::new(Vec::new()));
    let injector_sent = sent.clone();
    let env = TestEnv {
        exec,
        breadcrumb: tmp.path().join("rules.json"),
        queues: Box::new(|_qnum| {
            // Sender dropped immediately: the queue stays silent.
            let (driver, _tx, _verdicts) = ChannelDriver::new();
            Ok(Box::new(driver) as Box<dyn QueueDriver>)
        }),
        injectors: Box::new(move || {
            Ok(Box::new(RecordingInjector {
                sent: injector_sent.clone(),
            }) as Box<dyn Injector>)
        }),
    };
    (env, sent, tmp)
}

fn build(name: &str, args: &[OptValue]) -> Box<dyn Mod> {
    (mods::lookup(name).unwrap().build)(args).unwrap()
}

fn pipeline(direction: Direction, stages: Vec<(Box<dyn Mod>, bool)>) -> Pipeline {
    Pipeline::new(
        direction,
        stages
            .into_iter()
            .map(|(modification, optional)| PipelineStage {
                modification,
                optional,
            })
            .collect(),
    )
}

/// Feed `packets` to a worker, let it process them, then stop it.
fn run_worker(
    packets: Vec<Vec<u8>>,
    pipeline: Pipeline,
) -> (crate::runtime::WorkerReport, VerdictLog, SentLog) {
    let (driver, tx, verdicts) = ChannelDriver::new();
    for packet in packets {
        tx.send(packet).unwrap();
    }
    drop(tx);

    let injector = RecordingInjector::new();
    let sent = injector.sent.clone();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_worker = stop.clone();
    let handle = std::thread::spawn(move || {
        worker_loop(
            Box::new(driver),
            pipeline,
            Box::new(injector),
            42,
            stop_worker,
            Duration::from_millis(5),
        )
    });
    std::thread::sleep(Duration::from_millis(100));
    stop.store(true, Ordering::Relaxed);
    let report = handle.join().unwrap();
    (report, verdicts, sent)
}

#[test]
fn test_worker_accepts_untouched_packets() {
    let bytes = tcp_payload_packet(b"hello").into_bytes();
    let stages = pipeline(
        Direction::Output,
        vec![(build("echo", &[OptValue::Str("x".into())]), false)],
    );
    let (report, verdicts, sent) = run_worker(vec![bytes], stages);

    assert_eq!(report.received, 1);
    assert_eq!(report.accepted, 1);
    assert_eq!(verdicts.lock().unwrap().as_slice(), &[(0, Verdict::Accept)]);
    assert!(sent.lock().unwrap().is_empty());
}

#[test]
fn test_worker_drops_when_pipeline_empties() {
    let bytes = tcp_payload_packet(b"bye").into_bytes();
    let stages = pipeline(
        Direction::Output,
        vec![(build("drop_proba", &[OptValue::Int(1)]), false)],
    );
    let (report, verdicts, _) = run_worker(vec![bytes], stages);

    assert_eq!(report.dropped, 1);
    assert_eq!(verdicts.lock().unwrap().as_slice(), &[(0, Verdict::Drop)]);
}

#[test]
fn test_worker_mangles_first_packet_on_input_fan_out() {
    let packet = tcp_payload_packet(&[7u8; 64]);
    let bytes = packet.into_bytes();
    let stages = pipeline(
        Direction::Input,
        vec![(build("fragment4", &[OptValue::Int(16)]), false)],
    );
    let (report, verdicts, _) = run_worker(vec![bytes], stages);

    // Input fan-out mangles the first fragment only.
    assert_eq!(report.mangled, 1);
    let log = verdicts.lock().unwrap();
    assert_eq!(log.len(), 1);
    match &log[0] {
        (0, Verdict::Mangle(mangled)) => {
            assert_eq!(mangled[0] >> 4, 4);
            assert!(mangled.len() < 104, "one fragment, not the whole packet");
        }
        other => panic!("expected mangle, got {other:?}"),
    }
}

#[test]
fn test_worker_fans_out_via_injector_on_output() {
    let packet = tcp_payload_packet(&[7u8; 64]);
    let original = packet.as_bytes().to_vec();
    let stages = pipeline(
        Direction::Output,
        vec![(build("fragment4", &[OptValue::Int(16)]), false)],
    );
    let (report, verdicts, sent) = run_worker(vec![original], stages);

    // 20 TCP header + 64 payload = 84 payload bytes -> 6 fragments of 16.
    assert_eq!(report.injected, 6);
    assert_eq!(report.dropped, 1);
    assert_eq!(sent.lock().unwrap().len(), 6);
    assert_eq!(verdicts.lock().unwrap().as_slice(), &[(0, Verdict::Drop)]);
}

#[test]
fn test_worker_failure_switches_to_pass_through() {
    let first = tcp_payload_packet(b"one").into_bytes();
    let second = tcp_payload_packet(b"two").into_bytes();
    let stages = pipeline(
        Direction::Output,
        vec![(build("select", &[OptValue::Int(9)]), false)],
    );
    let (report, verdicts, _) = run_worker(vec![first, second], stages);

    assert!(report.error.is_some());
    // Both packets are accepted: the failing one and the pass-through one.
    let log = verdicts.lock().unwrap();
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|(_, v)| *v == Verdict::Accept));
}

#[test]
fn test_worker_optional_failure_is_harmless() {
    let bytes = tcp_payload_packet(b"ok").into_bytes();
    let stages = pipeline(
        Direction::Output,
        vec![(build("select", &[OptValue::Int(9)]), true)],
    );
    let (report, verdicts, _) = run_worker(vec![bytes], stages);

    assert!(report.error.is_none());
    assert_eq!(verdicts.lock().unwrap().as_slice(), &[(0, Verdict::Accept)]);
}

// -- whole-test and whole-suite scenarios --

fn config(json: &str) -> Config {
    Config::from_json(json).unwrap()
}

#[tokio::test]
async fn test_single_trivial_test_passes() {
    // One test, no packets, /bin/true: the suite reports a clean pass.
    let cfg = config(
        r#"{
            "cmd": "true",
            "nfrules": [{"qnum": 0, "input_chain": false, "ipv4": false}],
            "output": [{"mod_name": "echo", "mod_opts": "str x"}]
        }"#,
    );
    let (env, sent, _tmp) = quiet_env(Exec::Dry);
    let agg = suite::run_suite(&cfg, SuiteOptions::default(), &env)
        .await
        .unwrap();

    assert_eq!(agg.len(), 1);
    assert!(agg.all_passed());
    assert_eq!(agg.results()[0].exit_code, Some(0));
    assert!(sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_exit_code_drives_pass_fail() {
    // Three tests exiting with their own index: only test 0 passes.
    let cfg = config(
        r#"{
            "cmd": "sh -c 'exit {i}'",
            "nfrules": [{"qnum": 0}],
            "output": [{"mod_name": "echo", "mod_opts": "seq_str a b c"}]
        }"#,
    );
    let (env, _, _tmp) = quiet_env(Exec::Dry);
    let agg = suite::run_suite(&cfg, SuiteOptions::default(), &env)
        .await
        .unwrap();

    assert_eq!(agg.len(), 3);
    let statuses: Vec<TestStatus> = agg.results().iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![TestStatus::Passed, TestStatus::Failed, TestStatus::Failed]
    );
    assert_eq!(agg.results()[2].exit_code, Some(2));
    assert!(!agg.all_passed());

    let summary = agg.summary();
    assert_eq!(summary.passed, 1);
    assert_eq!(summary.failed, 2);
}

#[tokio::test]
async fn test_from_to_window() {
    let cfg = config(
        r#"{
            "cmd": "sh -c 'exit {i}'",
            "nfrules": [{"qnum": 0}],
            "output": [{"mod_name": "echo", "mod_opts": "seq_str a b c d"}]
        }"#,
    );
    let (env, _, _tmp) = quiet_env(Exec::Dry);
    let opts = SuiteOptions {
        from: Some(1),
        to: Some(2),
        ..Default::default()
    };
    let agg = suite::run_suite(&cfg, opts, &env).await.unwrap();
    let indexes: Vec<u64> = agg.results().iter().map(|r| r.index).collect();
    assert_eq!(indexes, vec![1, 2]);
}

#[tokio::test]
async fn test_dry_run_executes_nothing() {
    let cfg = config(
        r#"{
            "cmd": "sh -c 'exit 1'",
            "nfrules": [{"qnum": 0}],
            "output": [{"mod_name": "echo", "mod_opts": "seq_str a b"}]
        }"#,
    );
    let (mut env, _, _tmp) = quiet_env(Exec::Dry);
    env.queues = Box::new(|_| panic!("dry run must not open queues"));
    let opts = SuiteOptions {
        dry_run: true,
        ..Default::default()
    };
    let agg = suite::run_suite(&cfg, opts, &env).await.unwrap();
    assert!(agg.is_empty());
    assert!(agg.all_passed());
}

#[tokio::test]
async fn test_repeat_fails_on_any_iteration() {
    // Iteration {j}=1 exits 1, so the single test fails despite j=0 passing.
    let cfg = config(
        r#"{
            "cmd": "sh -c 'exit {j}'",
            "nfrules": [{"qnum": 0}],
            "repeat": 2
        }"#,
    );
    let (env, _, _tmp) = quiet_env(Exec::Dry);
    let agg = suite::run_suite(&cfg, SuiteOptions::default(), &env)
        .await
        .unwrap();
    assert_eq!(agg.len(), 1);
    assert_eq!(agg.results()[0].status, TestStatus::Failed);
    assert_eq!(agg.results()[0].exit_code, Some(1));
}

#[tokio::test]
async fn test_teardown_removes_rules_on_every_path() {
    let log: ExecLog = Arc::new(Mutex::new(Vec::new()));
    for cmd in ["true", "false"] {
        let cfg = config(&format!(
            r#"{{"cmd": "{cmd}", "nfrules": [{{"host": "h", "port": "80", "qnum": 0}}]}}"#
        ));
        let (env, _, _tmp) = quiet_env(Exec::Record(log.clone()));
        let breadcrumb = env.breadcrumb.clone();

        let case = suite::expand_one(&cfg, 0).unwrap();
        let cancel = Cancel::new();
        let result = run_test(&cfg, &case, 1, &env, &cancel).await;
        assert_ne!(result.status, TestStatus::SetupError);
        assert!(!breadcrumb.exists(), "breadcrumb gone after teardown");

        let entries = log.lock().unwrap();
        let installs: Vec<&RuleCmd> = entries
            .iter()
            .filter(|(a, _)| a == "-I")
            .map(|(_, c)| c)
            .collect();
        let removes: Vec<&RuleCmd> = entries
            .iter()
            .filter(|(a, _)| a == "-D")
            .map(|(_, c)| c)
            .collect();
        assert_eq!(installs.len(), removes.len());
        let reversed: Vec<&RuleCmd> = installs.iter().rev().copied().collect();
        assert_eq!(removes, reversed);
        drop(entries);
        log.lock().unwrap().clear();
    }
}

#[tokio::test]
async fn test_queue_open_failure_is_setup_error() {
    let cfg = config(r#"{"cmd": "true", "nfrules": [{"qnum": 0}]}"#);
    let (mut env, _, _tmp) = quiet_env(Exec::Dry);
    env.queues = Box::new(|qnum| Err(crate::error::Error::setup(format!("no queue {qnum}"))));

    let case = suite::expand_one(&cfg, 0).unwrap();
    let cancel = Cancel::new();
    let result = run_test(&cfg, &case, 1, &env, &cancel).await;
    assert_eq!(result.status, TestStatus::SetupError);
    assert!(result.notes.iter().any(|n| n.contains("no queue")));
}

#[tokio::test]
async fn test_cancellation_kills_the_child() {
    let cfg = config(r#"{"cmd": "sleep 30", "nfrules": [{"qnum": 0}]}"#);
    let (env, _, _tmp) = quiet_env(Exec::Dry);
    let case = suite::expand_one(&cfg, 0).unwrap();
    let cancel = Arc::new(Cancel::new());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.trigger();
    });

    let started = Instant::now();
    let result = run_test(&cfg, &case, 1, &env, &cancel).await;
    assert_eq!(result.status, TestStatus::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_worker_mod_error_fails_the_test() {
    // A queue with one packet and a pipeline that always fails: the
    // command succeeds but the test is marked failed.
    let cfg = config(
        r#"{
            "cmd": "sleep 0.3",
            "nfrules": [{"qnum": 0, "input_chain": false}],
            "output": [{"mod_name": "select", "mod_opts": 9}]
        }"#,
    );
    let tmp = TempDir::new().unwrap();
    let env = TestEnv {
        exec: Exec::Dry,
        breadcrumb: tmp.path().join("rules.json"),
        queues: Box::new(|_| {
            let (driver, tx, _verdicts) = ChannelDriver::new();
            tx.send(tcp_payload_packet(b"doomed").into_bytes()).unwrap();
            Ok(Box::new(driver) as Box<dyn QueueDriver>)
        }),
        injectors: Box::new(|| Ok(Box::new(RecordingInjector::new()) as Box<dyn Injector>)),
    };

    let case = suite::expand_one(&cfg, 0).unwrap();
    let cancel = Cancel::new();
    let result = run_test(&cfg, &case, 1, &env, &cancel).await;
    assert_eq!(result.status, TestStatus::Failed);
    assert_eq!(result.exit_code, Some(0));
    assert!(result.notes.iter().any(|n| n.contains("select")));
}
