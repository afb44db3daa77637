//! Collaborator traits and the records they exchange with the orchestrator.
//!
//! The orchestrator never runs a command itself. Converge runs, reboots,
//! state collection and remote probes are delegated through these traits so
//! the engine can be driven by real backends or by test doubles.

use crate::contracts::ContractCheck;
use crate::error::{GradeError, Result};
use crate::report::{PhaseResult, PhaseState};
use crate::variables::PhaseVariablePlan;
use labspec::{OverlayPhase, Phase, Protocol};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// One converge invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergeRequest {
    pub phase: Phase,
    /// Overlay whose staged inputs the run uses
    pub overlay_phase: OverlayPhase,
    pub timeout: Duration,
}

/// PLAY RECAP counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecapCounters {
    pub ok: u32,
    pub changed: u32,
    pub unreachable: u32,
    pub failed: u32,
    pub skipped: u32,
    pub rescued: u32,
    pub ignored: u32,
}

impl RecapCounters {
    pub fn add(&mut self, other: &Self) {
        self.ok += other.ok;
        self.changed += other.changed;
        self.unreachable += other.unreachable;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.rescued += other.rescued;
        self.ignored += other.ignored;
    }
}

/// What a converge run produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvergeRecord {
    /// `None` when the process was killed
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_secs: f64,
    pub totals: RecapCounters,
    pub hosts: BTreeMap<String, RecapCounters>,
    /// `fatal:` and `FAILED!` lines, in output order
    pub failure_messages: Vec<String>,
    /// handler name -> host -> run count
    pub handlers: BTreeMap<String, BTreeMap<String, u32>>,
    /// Names of tasks that reported `changed`
    pub changed_tasks: Vec<String>,
    /// Full combined output; kept out of the report JSON
    #[serde(skip)]
    pub output: String,
}

impl ConvergeRecord {
    /// Exit 0 with no failed and no unreachable hosts.
    pub fn is_clean(&self) -> bool {
        !self.timed_out
            && self.exit_code == Some(0)
            && self.totals.failed == 0
            && self.totals.unreachable == 0
    }

    pub fn handler_runs(&self, handler: &str, host: &str) -> u32 {
        self.handlers
            .get(handler)
            .and_then(|hosts| hosts.get(host))
            .copied()
            .unwrap_or(0)
    }

    pub fn handler_total(&self, handler: &str) -> u32 {
        self.handlers
            .get(handler)
            .map(|hosts| hosts.values().sum())
            .unwrap_or(0)
    }

    /// Hosts the recap reported unreachable.
    pub fn unreachable_hosts(&self) -> impl Iterator<Item = &str> {
        self.hosts
            .iter()
            .filter(|(_, c)| c.unreachable > 0)
            .map(|(h, _)| h.as_str())
    }
}

/// Runs the student's automation.
pub trait AutomationRunner: Send + Sync {
    /// Materialize the overlay layers of `vars` as converge inputs.
    fn stage(&self, phase: Phase, vars: &PhaseVariablePlan) -> Result<()>;

    /// Run the playbook against the staged inputs.
    ///
    /// A run that hits the deadline is returned with `timed_out` set and
    /// whatever output was captured, not as an error.
    fn converge(&self, request: &ConvergeRequest) -> Result<ConvergeRecord>;
}

/// Reboots lab machines and probes whether they answer.
pub trait RebootAgent: Send + Sync {
    /// Ask the host to reboot. Returns once the request is issued.
    fn reboot(&self, host: &str) -> Result<()>;

    /// One reachability probe bounded by `timeout`.
    fn is_reachable(&self, host: &str, timeout: Duration) -> bool;
}

/// What to collect from one host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotRequest {
    pub host: String,
    pub paths: Vec<String>,
    /// Paths whose content is needed, a subset of `paths`
    pub content_paths: Vec<String>,
    pub services: Vec<String>,
    pub listening: bool,
    pub firewall: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub exists: bool,
    #[serde(default)]
    pub is_directory: bool,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListeningSocket {
    pub address: String,
    pub port: u16,
    pub protocol: Protocol,
    /// Owning process name when the probe could see it
    #[serde(default)]
    pub process: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    pub enabled: bool,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenPort {
    /// Firewalld zone; `None` for iptables rules
    pub zone: Option<String>,
    pub port: u16,
    pub protocol: Protocol,
}

/// Read-only observation of one host after converge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub host: String,
    pub files: BTreeMap<String, FileState>,
    pub listening: Vec<ListeningSocket>,
    pub services: BTreeMap<String, ServiceState>,
    pub firewall: Vec<OpenPort>,
}

/// Collects host state for snapshot-evaluated checks.
pub trait SnapshotCollector: Send + Sync {
    fn snapshot(&self, request: &SnapshotRequest) -> Result<HostSnapshot>;
}

/// Pass, fail or skip for one check.
///
/// `Skip` means the check never ran, e.g. its host could not be probed. It
/// earns nothing, like a failure, but is reported separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    Fail,
    Skip,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Skip => "skip",
        }
    }
}

/// Outcome of one check on one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostVerdict {
    pub check_id: String,
    pub outcome: Outcome,
    #[serde(default)]
    pub message: Option<String>,
}

impl HostVerdict {
    pub fn pass(check_id: impl Into<String>) -> Self {
        Self {
            check_id: check_id.into(),
            outcome: Outcome::Pass,
            message: None,
        }
    }

    pub fn fail(check_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            check_id: check_id.into(),
            outcome: Outcome::Fail,
            message: Some(message.into()),
        }
    }

    pub fn skip(check_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            check_id: check_id.into(),
            outcome: Outcome::Skip,
            message: Some(message.into()),
        }
    }
}

/// Runs probes on (or against) a host for delegated checks.
///
/// Called from several threads at once, one call per host.
pub trait VerificationRunner: Send + Sync {
    /// Verify `checks` on `host`. A missing verdict counts as a failure.
    fn run_checks(&self, phase: Phase, host: &str, checks: &[&ContractCheck]) -> Result<Vec<HostVerdict>>;
}

/// Progress callback for phase execution.
pub trait PhaseObserver: Send {
    /// Called when a phase starts
    fn on_phase_start(&mut self, phase: Phase);

    /// Called on every state transition
    fn on_state(&mut self, phase: Phase, state: PhaseState);

    /// Called when a phase reaches a terminal state
    fn on_phase_complete(&mut self, result: &PhaseResult);
}

/// No-op observer
pub struct NoProgress;

impl PhaseObserver for NoProgress {
    fn on_phase_start(&mut self, _phase: Phase) {}
    fn on_state(&mut self, _phase: Phase, _state: PhaseState) {}
    fn on_phase_complete(&mut self, _result: &PhaseResult) {}
}

/// Shared cancellation flag, checked at every state transition and inside
/// polling loops.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(GradeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_requires_zero_exit_and_no_failures() {
        let mut record = ConvergeRecord {
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(record.is_clean());

        record.totals.unreachable = 1;
        assert!(!record.is_clean());

        record.totals.unreachable = 0;
        record.exit_code = Some(2);
        assert!(!record.is_clean());

        record.exit_code = None;
        record.timed_out = true;
        assert!(!record.is_clean());
    }

    #[test]
    fn test_handler_counts_per_host() {
        let mut record = ConvergeRecord::default();
        record
            .handlers
            .entry("restart nginx".into())
            .or_default()
            .extend([("web1".to_string(), 1), ("web2".to_string(), 2)]);
        assert_eq!(record.handler_runs("restart nginx", "web2"), 2);
        assert_eq!(record.handler_runs("restart nginx", "db1"), 0);
        assert_eq!(record.handler_total("restart nginx"), 3);
        assert_eq!(record.handler_total("reload nginx"), 0);
    }

    #[test]
    fn test_output_not_serialized() {
        let record = ConvergeRecord {
            output: "PLAY [all]".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("PLAY [all]"));
    }

    #[test]
    fn test_cancel_token_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(GradeError::Cancelled)));
    }

    #[test]
    fn test_recap_add() {
        let mut total = RecapCounters::default();
        total.add(&RecapCounters {
            ok: 3,
            changed: 1,
            ..Default::default()
        });
        total.add(&RecapCounters {
            ok: 2,
            failed: 1,
            ..Default::default()
        });
        assert_eq!((total.ok, total.changed, total.failed), (5, 1, 1));
    }
}
