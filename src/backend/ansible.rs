//! ansible-playbook as the automation runner.
//!
//! Staging writes the phase's variable layers where ansible picks them up
//! at the matching precedence: inventory vars in the YAML inventory,
//! `group_vars/` and `host_vars/` next to the playbook, extra vars passed
//! with `-e @extra_vars.json`. Converge runs the playbook under a deadline
//! and parses its default-callback output into a [`ConvergeRecord`].

use grading::GradeError;
use grading::context::{AutomationRunner, CancelToken, ConvergeRecord, ConvergeRequest, RecapCounters};
use grading::variables::PhaseVariablePlan;
use labspec::{LabSpec, Phase};
use labspec::overlays::VarMap;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::AnsibleConfig;
use crate::runner;

const INVENTORY_FILE: &str = "inventory.yml";
const EXTRA_VARS_FILE: &str = "extra_vars.json";

/// A lab node as the inventory lists it
#[derive(Debug, Clone)]
struct InventoryHost {
    name: String,
    address: String,
    groups: Vec<String>,
}

pub struct AnsibleRunner {
    config: AnsibleConfig,
    hosts: Vec<InventoryHost>,
    playbook: String,
    work_dir: PathBuf,
    logs_dir: PathBuf,
    cancel: CancelToken,
}

impl AnsibleRunner {
    /// A cancelled `cancel` kills a running playbook along with its process group.
    pub fn new(spec: &LabSpec, config: &AnsibleConfig, work_dir: &Path, logs_dir: &Path, cancel: CancelToken) -> Self {
        let hosts = spec
            .topology
            .nodes
            .iter()
            .map(|n| InventoryHost {
                name: n.name.clone(),
                address: config.address(&n.name).to_string(),
                groups: n.groups.clone(),
            })
            .collect();
        Self {
            config: config.clone(),
            hosts,
            playbook: spec.entrypoints.playbook_path.clone(),
            work_dir: work_dir.to_path_buf(),
            logs_dir: logs_dir.to_path_buf(),
            cancel,
        }
    }

    fn inventory(&self, vars: &VarMap) -> Value {
        let mut hosts = Map::new();
        let mut children: BTreeMap<&str, Map<String, Value>> = BTreeMap::new();
        for host in &self.hosts {
            let mut entry = Map::new();
            entry.insert("ansible_host".into(), json!(host.address));
            entry.insert("ansible_user".into(), json!(self.config.user));
            if let Some(key) = self.config.private_key_path() {
                entry.insert("ansible_ssh_private_key_file".into(), json!(key));
            }
            hosts.insert(host.name.clone(), Value::Object(entry));
            for group in &host.groups {
                children
                    .entry(group.as_str())
                    .or_default()
                    .insert(host.name.clone(), json!({}));
            }
        }
        let children: Map<String, Value> = children
            .into_iter()
            .map(|(group, members)| (group.to_string(), json!({ "hosts": members })))
            .collect();
        json!({
            "all": {
                "vars": vars,
                "hosts": hosts,
                "children": children,
            }
        })
    }

    fn write_yaml(path: &Path, value: &impl serde::Serialize) -> grading::Result<()> {
        let text = serde_yaml::to_string(value)
            .map_err(|e| GradeError::io(format!("encoding {}", path.display()), std::io::Error::other(e)))?;
        fs::write(path, text).map_err(|e| GradeError::io(format!("writing {}", path.display()), e))
    }

    fn reset_dir(path: &Path) -> grading::Result<()> {
        if path.exists() {
            fs::remove_dir_all(path).map_err(|e| GradeError::io(format!("clearing {}", path.display()), e))?;
        }
        fs::create_dir_all(path).map_err(|e| GradeError::io(format!("creating {}", path.display()), e))
    }
}

impl AutomationRunner for AnsibleRunner {
    fn stage(&self, phase: Phase, vars: &PhaseVariablePlan) -> grading::Result<()> {
        let dir = &self.work_dir;
        Self::write_yaml(&dir.join(INVENTORY_FILE), &self.inventory(&vars.inventory_vars))?;

        let group_dir = dir.join("group_vars");
        Self::reset_dir(&group_dir)?;
        for (group, values) in &vars.group_vars {
            Self::write_yaml(&group_dir.join(format!("{group}.yml")), values)?;
        }
        let host_dir = dir.join("host_vars");
        Self::reset_dir(&host_dir)?;
        for (host, values) in &vars.host_vars {
            Self::write_yaml(&host_dir.join(format!("{host}.yml")), values)?;
        }

        let extra_path = dir.join(EXTRA_VARS_FILE);
        let extra = serde_json::to_string_pretty(&vars.extra_vars)?;
        fs::write(&extra_path, extra).map_err(|e| GradeError::io(format!("writing {}", extra_path.display()), e))?;

        log::info!(
            "Staged {phase} variables: {} group file(s), {} host file(s), {} extra var(s)",
            vars.group_vars.len(),
            vars.host_vars.len(),
            vars.extra_vars.len()
        );
        Ok(())
    }

    fn converge(&self, request: &ConvergeRequest) -> grading::Result<ConvergeRecord> {
        let mut cmd = Command::new(&self.config.playbook_bin);
        cmd.current_dir(&self.work_dir)
            .args(["-i", INVENTORY_FILE, "-e"])
            .arg(format!("@{EXTRA_VARS_FILE}"))
            .args(&self.config.extra_args)
            .arg(&self.playbook)
            .env("ANSIBLE_NOCOLOR", "1")
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .env("ANSIBLE_STDOUT_CALLBACK", "default")
            .env("ANSIBLE_RETRY_FILES_ENABLED", "False");

        log::info!("Running {} for {}", self.config.playbook_bin, request.phase);
        let out = runner::run_with_timeout(&mut cmd, request.timeout, &self.cancel)
            .map_err(|e| GradeError::io(format!("running {}", self.config.playbook_bin), e))?;

        let log_path = self.logs_dir.join(format!("{}.log", request.phase));
        fs::create_dir_all(&self.logs_dir)
            .and_then(|()| fs::write(&log_path, out.combined()))
            .map_err(|e| GradeError::io(format!("writing {}", log_path.display()), e))?;
        if out.cancelled {
            log::warn!("{} converge cancelled, partial log in {}", request.phase, log_path.display());
            return Err(GradeError::Cancelled);
        }

        let mut record = parse_output(&out.stdout);
        record.exit_code = out.status;
        record.timed_out = out.timed_out;
        record.duration_secs = out.duration.as_secs_f64();
        record.output = out.combined();
        log::debug!(
            "{} converge: exit {:?}, changed {}, failed {}, log {}",
            request.phase,
            record.exit_code,
            record.totals.changed,
            record.totals.failed,
            log_path.display()
        );
        Ok(record)
    }
}

/// Text between the first `[` and the last `]` of a banner or result line.
fn bracketed(line: &str) -> Option<&str> {
    let start = line.find('[')?;
    let end = line.rfind(']')?;
    (end > start).then(|| &line[start + 1..end])
}

/// Task or handler name without its `role : ` prefix.
fn task_name(banner: &str) -> String {
    let name = bracketed(banner).unwrap_or_default();
    name.split_once(" : ").map_or(name, |(_, n)| n).trim().to_string()
}

/// Host of a `changed: [web1]` style line; `[web1 -> localhost]` for
/// delegated tasks counts for web1.
fn result_host(line: &str) -> Option<&str> {
    let start = line.find('[')?;
    let end = start + line[start..].find(']')?;
    line[start + 1..end].split_whitespace().next()
}

enum Block {
    Other,
    Task(String),
    Handler(String),
    Recap,
}

/// Parse default-callback output of ansible-playbook.
pub(crate) fn parse_output(output: &str) -> ConvergeRecord {
    let mut record = ConvergeRecord::default();
    let mut block = Block::Other;
    let mut pending_failure: Option<String> = None;

    for line in output.lines() {
        let line = line.trim_end();

        // ignore_errors prints "...ignoring" right after the failure
        if let Some(message) = pending_failure.take()
            && line.trim() != "...ignoring"
        {
            record.failure_messages.push(message);
        }

        if line.starts_with("PLAY RECAP") {
            block = Block::Recap;
            continue;
        }
        if line.starts_with("PLAY [") {
            block = Block::Other;
            continue;
        }
        if line.starts_with("RUNNING HANDLER [") {
            block = Block::Handler(task_name(line));
            continue;
        }
        if line.starts_with("TASK [") {
            block = Block::Task(task_name(line));
            continue;
        }

        match &block {
            Block::Recap => {
                if let Some((host, counters)) = parse_recap_line(line) {
                    record.totals.add(&counters);
                    record.hosts.insert(host, counters);
                }
            }
            Block::Handler(name) => {
                if (line.starts_with("changed: [") || line.starts_with("ok: ["))
                    && let Some(host) = result_host(line)
                {
                    *record
                        .handlers
                        .entry(name.clone())
                        .or_default()
                        .entry(host.to_string())
                        .or_default() += 1;
                }
            }
            Block::Task(name) => {
                if line.starts_with("changed: [") && !record.changed_tasks.contains(name) {
                    record.changed_tasks.push(name.clone());
                }
            }
            Block::Other => {}
        }

        if line.starts_with("fatal: [") || line.starts_with("failed: [") {
            pending_failure = Some(failure_message(line));
        }
    }
    if let Some(message) = pending_failure {
        record.failure_messages.push(message);
    }
    record
}

/// `[host] msg` from a `fatal: [host]: FAILED! => {...}` line.
fn failure_message(line: &str) -> String {
    let host = result_host(line).unwrap_or("?");
    let detail = line
        .split_once("=> ")
        .and_then(|(_, json)| serde_json::from_str::<Value>(json).ok())
        .and_then(|v| v.get("msg").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| line.to_string());
    format!("[{host}] {detail}")
}

/// `web1 : ok=12 changed=1 unreachable=0 failed=0 skipped=0 rescued=0 ignored=0`
fn parse_recap_line(line: &str) -> Option<(String, RecapCounters)> {
    let (host, rest) = line.split_once(" : ")?;
    let host = host.trim();
    if host.is_empty() {
        return None;
    }
    let mut counters = RecapCounters::default();
    let mut seen = false;
    for pair in rest.split_whitespace() {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let slot = match key {
            "ok" => &mut counters.ok,
            "changed" => &mut counters.changed,
            "unreachable" => &mut counters.unreachable,
            "failed" => &mut counters.failed,
            "skipped" => &mut counters.skipped,
            "rescued" => &mut counters.rescued,
            "ignored" => &mut counters.ignored,
            _ => continue,
        };
        if let Ok(value) = value.parse() {
            *slot = value;
            seen = true;
        }
    }
    seen.then(|| (host.to_string(), counters))
}
