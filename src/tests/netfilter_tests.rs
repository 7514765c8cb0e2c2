use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use crate::config::Config;
use crate::netfilter::{self, DiversionRule, Exec, IpFamily, RuleCmd, RuleSet};

type ExecLog = Arc<Mutex<Vec<(String, RuleCmd)>>>;

fn recorder() -> (Exec, ExecLog) {
    let log: ExecLog = Arc::new(Mutex::new(Vec::new()));
    (Exec::Record(log.clone()), log)
}

fn rules_from(json: &str) -> Vec<DiversionRule> {
    let cfg = Config::from_json(json).unwrap();
    cfg.nfrules
        .iter()
        .map(|r| DiversionRule::from_config(r).unwrap())
        .collect()
}

fn args_of(cmds: &[RuleCmd]) -> Vec<String> {
    cmds.iter().map(|c| c.args.join(" ")).collect()
}

#[test]
fn test_tcp_port_rule_expands_to_eight_commands() {
    let rules = rules_from(
        r#"{"cmd": "true", "nfrules": [{"host": "example.com", "port": "80", "qnum": 0}]}"#,
    );
    let cmds = rules[0].commands();
    // 2 families x 2 chains x (nfqueue + rst-drop)
    assert_eq!(cmds.len(), 8);
    assert_eq!(cmds.iter().filter(|c| c.family == IpFamily::V4).count(), 4);

    let rendered = args_of(&cmds);
    assert!(rendered.contains(&"OUTPUT -d example.com -p tcp --dport 80 -m comment --comment fragsuite -j NFQUEUE --queue-num 0".to_string()));
    assert!(rendered.contains(&"INPUT -s example.com -p tcp --sport 80 -m comment --comment fragsuite -j NFQUEUE --queue-num 1".to_string()));
    assert!(rendered.contains(&"OUTPUT -d example.com -p tcp --dport 80 --tcp-flags RST RST -m comment --comment fragsuite -j DROP".to_string()));
}

#[test]
fn test_port_defaults_protocol_to_tcp() {
    let rules = rules_from(r#"{"cmd": "true", "nfrules": [{"port": "443", "qnum": 0}]}"#);
    assert_eq!(rules[0].proto.as_deref(), Some("tcp"));
}

#[test]
fn test_port_dropped_for_portless_protocol() {
    let rules = rules_from(
        r#"{"cmd": "true", "nfrules": [{"proto": "icmp", "port": "80", "qnum": 0}]}"#,
    );
    assert_eq!(rules[0].port, None);
    let rendered = args_of(&rules[0].commands());
    assert!(rendered.iter().all(|args| !args.contains("--dport")));
}

#[test]
fn test_host6_falls_back_to_host() {
    let rules = rules_from(
        r#"{"cmd": "true", "nfrules": [{"host": "dual.example", "qnum": 0}]}"#,
    );
    assert_eq!(rules[0].host6.as_deref(), Some("dual.example"));

    let cmds = rules[0].commands();
    let v6: Vec<_> = cmds.iter().filter(|c| c.family == IpFamily::V6).collect();
    assert!(!v6.is_empty());
    assert!(v6.iter().all(|c| c.args.contains(&"dual.example".to_string())));
}

#[test]
fn test_ipv6_only_output_rule() {
    let rules = rules_from(
        r#"{"cmd": "true", "nfrules": [{"qnum": 4, "input_chain": false, "ipv4": false}]}"#,
    );
    let cmds = rules[0].commands();
    assert_eq!(cmds.len(), 1);
    assert_eq!(cmds[0].family, IpFamily::V6);
    assert_eq!(
        cmds[0].args.join(" "),
        "OUTPUT -m comment --comment fragsuite -j NFQUEUE --queue-num 4"
    );
}

#[test]
fn test_every_command_carries_the_tag() {
    let rules = rules_from(
        r#"{"cmd": "true", "nfrules": [{"host": "h", "port": "80", "qnum": 0}]}"#,
    );
    for cmd in rules[0].commands() {
        assert!(cmd.args.contains(&netfilter::RULE_TAG.to_string()));
    }
}

#[test]
fn test_install_then_uninstall_reverses_order() {
    let tmp = TempDir::new().unwrap();
    let breadcrumb = tmp.path().join("rules.json");
    let (exec, log) = recorder();
    let rules = rules_from(
        r#"{"cmd": "true", "nfrules": [{"host": "h", "port": "80", "qnum": 0}]}"#,
    );

    let mut set = RuleSet::new(&rules, exec, breadcrumb.clone());
    set.install().unwrap();
    assert!(set.active());
    assert!(breadcrumb.exists(), "breadcrumb present while installed");

    set.uninstall();
    assert!(!set.active());
    assert!(!breadcrumb.exists(), "breadcrumb removed on clean teardown");

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
    assert_eq!(installs.len(), 8);
    assert_eq!(removes.len(), 8);
    let reversed: Vec<&RuleCmd> = installs.iter().rev().copied().collect();
    assert_eq!(removes, reversed);
}

#[test]
fn test_drop_uninstalls_leftover_rules() {
    let tmp = TempDir::new().unwrap();
    let breadcrumb = tmp.path().join("rules.json");
    let (exec, log) = recorder();
    let rules = rules_from(r#"{"cmd": "true", "nfrules": [{"qnum": 0}]}"#);

    {
        let mut set = RuleSet::new(&rules, exec, breadcrumb.clone());
        set.install().unwrap();
        // Dropped while active: the guard must clean up.
    }
    assert!(!breadcrumb.exists());
    let entries = log.lock().unwrap();
    let installs = entries.iter().filter(|(a, _)| a == "-I").count();
    let removes = entries.iter().filter(|(a, _)| a == "-D").count();
    assert_eq!(installs, removes);
}

#[test]
fn test_sweep_replays_breadcrumb_in_reverse() {
    let tmp = TempDir::new().unwrap();
    let breadcrumb = tmp.path().join("rules.json");
    let (exec, log) = recorder();
    let rules = rules_from(r#"{"cmd": "true", "nfrules": [{"qnum": 0}]}"#);

    let mut set = RuleSet::new(&rules, exec.clone(), breadcrumb.clone());
    set.install().unwrap();
    // Simulate a crash: the breadcrumb survives, the guard never runs.
    std::mem::forget(set);
    assert!(breadcrumb.exists());

    let installed_order: Vec<RuleCmd> = log
        .lock()
        .unwrap()
        .iter()
        .filter(|(a, _)| a == "-I")
        .map(|(_, c)| c.clone())
        .collect();
    log.lock().unwrap().clear();

    let swept = netfilter::sweep_stale(&breadcrumb, &exec).unwrap();
    assert_eq!(swept, installed_order.len());
    assert!(!breadcrumb.exists());

    let removes: Vec<RuleCmd> = log
        .lock()
        .unwrap()
        .iter()
        .map(|(action, cmd)| {
            assert_eq!(action, "-D");
            cmd.clone()
        })
        .collect();
    let reversed: Vec<RuleCmd> = installed_order.into_iter().rev().collect();
    assert_eq!(removes, reversed);
}

#[test]
fn test_sweep_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let breadcrumb = tmp.path().join("rules.json");
    let (exec, log) = recorder();

    // Nothing to sweep: both calls are no-ops.
    assert_eq!(netfilter::sweep_stale(&breadcrumb, &exec).unwrap(), 0);
    assert_eq!(netfilter::sweep_stale(&breadcrumb, &exec).unwrap(), 0);
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn test_dry_exec_touches_nothing() {
    let tmp = TempDir::new().unwrap();
    let breadcrumb = tmp.path().join("rules.json");
    let rules = rules_from(r#"{"cmd": "true", "nfrules": [{"qnum": 0}]}"#);

    let mut set = RuleSet::new(&rules, Exec::Dry, breadcrumb.clone());
    set.install().unwrap();
    set.uninstall();
    assert!(!breadcrumb.exists());
}
