//! Check evaluation for snapshot-backed and locally evaluated checks.
//!
//! Delegated checks (packages, users, reachability, HTTP) never come through
//! here; their verdicts come back from the verification runner.

use crate::contracts::{CheckKind, ContractCheck, GRADING_HOST, ResolvedPort};
use crate::context::{ConvergeRecord, HostSnapshot, SnapshotRequest};
use crate::report::HostOutcome;
use labspec::contracts::{FileItem, FirewallType, MatchType};
use labspec::{BindingTarget, ExpectedRuns, Phase};
use regex::Regex;
use std::collections::BTreeMap;

/// What to collect on `host` for the given snapshot checks.
pub fn snapshot_request(host: &str, checks: &[&ContractCheck]) -> SnapshotRequest {
    let mut req = SnapshotRequest {
        host: host.to_string(),
        ..Default::default()
    };
    fn add_path(req: &mut SnapshotRequest, path: &str, content: bool) {
        if !req.paths.iter().any(|p| p == path) {
            req.paths.push(path.to_string());
        }
        if content && !req.content_paths.iter().any(|p| p == path) {
            req.content_paths.push(path.to_string());
        }
    }

    for check in checks {
        match &check.kind {
            CheckKind::Binding { target, .. } => match target {
                BindingTarget::ServiceListenPort { .. } => req.listening = true,
                BindingTarget::FirewallPortOpen { .. } => req.firewall = true,
                other => {
                    if let Some(path) = other.path() {
                        add_path(&mut req, path, other.pattern().is_some());
                    }
                }
            },
            CheckKind::File { items } => {
                for item in items {
                    add_path(&mut req, &item.path, item.content_regex.is_some());
                }
            }
            CheckKind::Service { name, .. } => {
                if !req.services.contains(name) {
                    req.services.push(name.clone());
                }
            }
            CheckKind::Firewall { .. } => req.firewall = true,
            _ => {}
        }
    }
    req
}

/// Evaluate a snapshot-backed check against one host's snapshot.
pub fn evaluate_snapshot(check: &ContractCheck, snapshot: &HostSnapshot) -> HostOutcome {
    match &check.kind {
        CheckKind::Binding { target, port, .. } => binding(target, *port, snapshot),
        CheckKind::Service { name, enabled, running } => match snapshot.services.get(name) {
            None => HostOutcome::fail(format!("service {name} not found")),
            Some(state) if state.enabled != *enabled => HostOutcome::fail(format!(
                "service {name} enabled={}, expected {enabled}",
                state.enabled
            )),
            Some(state) if state.active != *running => HostOutcome::fail(format!(
                "service {name} running={}, expected {running}",
                state.active
            )),
            Some(_) => HostOutcome::pass(),
        },
        CheckKind::Firewall { ports, firewall_type } => {
            let missing: Vec<String> = ports
                .iter()
                .filter(|p| !port_open(snapshot, p, *firewall_type))
                .map(|p| format!("{}/{}", p.port, p.protocol))
                .collect();
            if missing.is_empty() {
                HostOutcome::pass()
            } else {
                HostOutcome::fail(format!("ports not open: {}", missing.join(", ")))
            }
        }
        CheckKind::File { items } => {
            let problems: Vec<String> = items.iter().filter_map(|i| file_item(i, snapshot)).collect();
            if problems.is_empty() {
                HostOutcome::pass()
            } else {
                HostOutcome::fail(problems.join("; "))
            }
        }
        other => HostOutcome::fail(format!("{} checks are not snapshot-evaluated", other.name())),
    }
}

fn binding(target: &BindingTarget, port: Option<u16>, snapshot: &HostSnapshot) -> HostOutcome {
    match target {
        BindingTarget::ServiceListenPort {
            service,
            protocol,
            address,
        } => {
            let Some(port) = port else {
                return HostOutcome::fail("no expected port");
            };
            let listening = snapshot.listening.iter().any(|s| {
                s.port == port
                    && s.protocol == *protocol
                    && address_matches(address, &s.address)
                    && s.process.as_deref().is_none_or(|p| p.contains(service.as_str()) || service.contains(p))
            });
            if listening {
                HostOutcome::pass()
            } else {
                HostOutcome::fail(format!("{service} not listening on {address}:{port}/{protocol}"))
            }
        }
        BindingTarget::FirewallPortOpen { zone, protocol } => {
            let Some(port) = port else {
                return HostOutcome::fail("no expected port");
            };
            let open = snapshot
                .firewall
                .iter()
                .any(|p| p.port == port && p.protocol == *protocol && p.zone.as_deref().is_none_or(|z| z == zone.as_str()));
            if open {
                HostOutcome::pass()
            } else {
                HostOutcome::fail(format!("{port}/{protocol} not open in zone {zone}"))
            }
        }
        BindingTarget::TemplateContains { path, pattern } | BindingTarget::FileContains { path, pattern } => {
            match snapshot.files.get(path) {
                Some(state) if state.exists => match &state.content {
                    Some(content) if content.contains(pattern.as_str()) => HostOutcome::pass(),
                    Some(_) => HostOutcome::fail(format!("{path} does not contain {pattern:?}")),
                    None => HostOutcome::fail(format!("content of {path} not collected")),
                },
                _ => HostOutcome::fail(format!("{path} does not exist")),
            }
        }
        BindingTarget::FileExists { path } => match snapshot.files.get(path) {
            Some(state) if state.exists => HostOutcome::pass(),
            _ => HostOutcome::fail(format!("{path} does not exist")),
        },
        BindingTarget::FileMode { path, mode } => match snapshot.files.get(path) {
            Some(state) if state.exists => match &state.mode {
                Some(actual) if same_mode(actual, mode) => HostOutcome::pass(),
                actual => HostOutcome::fail(format!("{path} mode {}, expected {mode}", actual.as_deref().unwrap_or("unknown"))),
            },
            _ => HostOutcome::fail(format!("{path} does not exist")),
        },
        BindingTarget::FileOwner { path, owner, group } => match snapshot.files.get(path) {
            Some(state) if state.exists => {
                if state.owner.as_deref() == Some(owner.as_str()) && state.group.as_deref() == Some(group.as_str()) {
                    HostOutcome::pass()
                } else {
                    HostOutcome::fail(format!(
                        "{path} owned by {}:{}, expected {owner}:{group}",
                        state.owner.as_deref().unwrap_or("?"),
                        state.group.as_deref().unwrap_or("?")
                    ))
                }
            }
            _ => HostOutcome::fail(format!("{path} does not exist")),
        },
    }
}

/// `0.0.0.0` accepts any bound address; a specific address also accepts wildcard binds.
fn address_matches(expected: &str, actual: &str) -> bool {
    expected == "0.0.0.0" || actual == expected || matches!(actual, "0.0.0.0" | "*" | "::" | "[::]")
}

fn same_mode(a: &str, b: &str) -> bool {
    let norm = |m: &str| {
        let t = m.trim().trim_start_matches('0');
        if t.is_empty() { "0".to_string() } else { t.to_string() }
    };
    norm(a) == norm(b)
}

fn port_open(snapshot: &HostSnapshot, port: &ResolvedPort, firewall_type: FirewallType) -> bool {
    snapshot.firewall.iter().any(|p| {
        p.port == port.port
            && p.protocol == port.protocol
            && match firewall_type {
                FirewallType::Firewalld => p.zone.as_deref() == Some(port.zone.as_str()),
                FirewallType::Iptables => true,
            }
    })
}

fn file_item(item: &FileItem, snapshot: &HostSnapshot) -> Option<String> {
    let path = &item.path;
    let state = snapshot.files.get(path).cloned().unwrap_or_default();
    if !item.present {
        return state.exists.then(|| format!("{path} should be absent"));
    }
    if !state.exists {
        return Some(format!("{path} does not exist"));
    }
    if item.is_directory != state.is_directory {
        let want = if item.is_directory { "a directory" } else { "a regular file" };
        return Some(format!("{path} is not {want}"));
    }
    if let Some(mode) = &item.mode
        && !state.mode.as_deref().is_some_and(|m| same_mode(m, mode))
    {
        return Some(format!("{path} mode {}, expected {mode}", state.mode.as_deref().unwrap_or("unknown")));
    }
    if let Some(owner) = &item.owner
        && state.owner.as_ref() != Some(owner)
    {
        return Some(format!("{path} owner {}, expected {owner}", state.owner.as_deref().unwrap_or("unknown")));
    }
    if let Some(group) = &item.group
        && state.group.as_ref() != Some(group)
    {
        return Some(format!("{path} group {}, expected {group}", state.group.as_deref().unwrap_or("unknown")));
    }
    if let Some(pattern) = &item.content_regex {
        let re = match Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => return Some(format!("bad content_regex for {path}: {e}")),
        };
        if !state.content.as_deref().is_some_and(|c| re.is_match(c)) {
            return Some(format!("{path} content does not match {pattern:?}"));
        }
    }
    None
}

/// Converge records of phases that ran before the current one.
pub type HandlerHistory<'a> = [(Phase, &'a ConvergeRecord)];

/// Evaluate a locally evaluated check (output, handler, idempotence).
pub fn evaluate_local(
    check: &ContractCheck,
    phase: Phase,
    record: &ConvergeRecord,
    history: &HandlerHistory<'_>,
) -> BTreeMap<String, HostOutcome> {
    match &check.kind {
        CheckKind::Output {
            pattern,
            match_type,
            expected,
            ..
        } => {
            let found = match match_type {
                MatchType::Contains => Ok(record.output.contains(pattern.as_str())),
                MatchType::Regex => Regex::new(pattern).map(|re| re.is_match(&record.output)),
            };
            let outcome = match found {
                Ok(found) if found == *expected => HostOutcome::pass(),
                Ok(true) => HostOutcome::fail(format!("output unexpectedly matches {pattern:?}")),
                Ok(false) => HostOutcome::fail(format!("output does not match {pattern:?}")),
                Err(e) => HostOutcome::fail(format!("invalid pattern: {e}")),
            };
            BTreeMap::from([(GRADING_HOST.to_string(), outcome)])
        }
        CheckKind::Handler {
            handler_name,
            expected_runs,
            ..
        } => {
            let expected = expected_runs.for_phase(phase);
            check
                .host_targets
                .iter()
                .map(|host| {
                    let runs = record.handler_runs(handler_name, host);
                    let outcome = if !expected.admits(runs) {
                        HostOutcome::fail(format!("{handler_name} ran {runs} time(s), expected {expected}"))
                    } else if phase == Phase::Idempotence && expected == ExpectedRuns::Zero {
                        zero_run_credit(handler_name, host, expected_runs, history)
                    } else {
                        HostOutcome::pass()
                    };
                    (host.clone(), outcome)
                })
                .collect()
        }
        CheckKind::Idempotence {
            allowed_changes,
            require_changed_zero,
            require_no_handlers,
        } => {
            let mut problems = Vec::new();
            if *require_changed_zero {
                let unexpected: Vec<&str> = record
                    .changed_tasks
                    .iter()
                    .filter(|t| !allowed_changes.contains(t))
                    .map(String::as_str)
                    .collect();
                // Each allowed task changes at most once per host; anything the
                // recap counts beyond that came from tasks the parser missed.
                let hosts = record.hosts.len().max(1) as u32;
                let explained = record.changed_tasks.len() as u32 * hosts;
                if !unexpected.is_empty() {
                    problems.push(format!("tasks changed on re-run: {}", unexpected.join(", ")));
                } else if record.totals.changed > explained {
                    problems.push(format!(
                        "{} change(s) reported on re-run, {explained} explained by allowed tasks",
                        record.totals.changed
                    ));
                }
            }
            if *require_no_handlers {
                let ran: Vec<&str> = record
                    .handlers
                    .iter()
                    .filter(|(_, hosts)| hosts.values().any(|n| *n > 0))
                    .map(|(name, _)| name.as_str())
                    .collect();
                if !ran.is_empty() {
                    problems.push(format!("handlers ran on re-run: {}", ran.join(", ")));
                }
            }
            let outcome = if problems.is_empty() { HostOutcome::pass() } else { HostOutcome::fail(problems.join("; ")) };
            BTreeMap::from([(GRADING_HOST.to_string(), outcome)])
        }
        other => check
            .host_targets
            .iter()
            .map(|h| (h.clone(), HostOutcome::fail(format!("{} checks are not evaluated locally", other.name()))))
            .collect(),
    }
}

/// A handler that must not run in idempotence only earns credit if it
/// actually ran in an earlier phase that expected it to.
fn zero_run_credit(
    handler: &str,
    host: &str,
    expected_runs: &labspec::overlays::ExpectedRunsSet,
    history: &HandlerHistory<'_>,
) -> HostOutcome {
    let mut expecting = history
        .iter()
        .filter(|(p, _)| expected_runs.for_phase(*p).expects_run())
        .peekable();
    if expecting.peek().is_none() {
        return HostOutcome::pass();
    }
    if expecting.any(|(_, record)| record.handler_runs(handler, host) > 0) {
        HostOutcome::pass()
    } else {
        HostOutcome::fail(format!("{handler} never ran in an earlier phase that expected it"))
    }
}
