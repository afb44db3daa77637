//! Phase results and the persisted grade report.

use crate::context::{ConvergeRecord, Outcome};
use crate::error::{FailureKind, GradeError, Result};
use crate::policy::ConvergeOutcome;
use chrono::{DateTime, Utc};
use labspec::Phase;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const REPORT_FILE: &str = "report.json";
pub const SUMMARY_FILE: &str = "summary.txt";

/// Orchestrator states a phase moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Pending,
    Overlaying,
    Converging,
    Rebooting,
    Snapshotting,
    Verifying,
    Scored,
    Aborted,
}

impl PhaseState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Overlaying => "overlaying",
            Self::Converging => "converging",
            Self::Rebooting => "rebooting",
            Self::Snapshotting => "snapshotting",
            Self::Verifying => "verifying",
            Self::Scored => "scored",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Scored | Self::Aborted)
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Scored,
    Aborted,
    NotRun,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scored => "scored",
            Self::Aborted => "aborted",
            Self::NotRun => "not run",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Aborted,
}

/// Earned versus possible weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Score {
    pub earned: f64,
    pub possible: f64,
    pub percentage: f64,
}

impl Score {
    /// A score with nothing to earn is 100%.
    pub fn new(earned: f64, possible: f64) -> Self {
        let percentage = if possible > 0.0 {
            (earned / possible * 100.0).clamp(0.0, 100.0)
        } else {
            100.0
        };
        Self {
            earned,
            possible,
            percentage,
        }
    }

    /// Zero of `possible`, for aborted and skipped phases.
    pub fn zero(possible: f64) -> Self {
        Self {
            earned: 0.0,
            possible,
            percentage: 0.0,
        }
    }

    /// Weight-weighted combination of phase scores.
    pub fn combine<'a>(scores: impl IntoIterator<Item = &'a Self>) -> Self {
        let (earned, possible) = scores
            .into_iter()
            .fold((0.0, 0.0), |(e, p), s| (e + s.earned, p + s.possible));
        Self::new(earned, possible)
    }
}

/// Outcome of one check on one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostOutcome {
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HostOutcome {
    pub fn pass() -> Self {
        Self {
            outcome: Outcome::Pass,
            message: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Fail,
            message: Some(message.into()),
        }
    }

    pub fn skip(message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Skip,
            message: Some(message.into()),
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Pass
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub id: String,
    pub kind: &'static str,
    pub weight: f64,
    /// `pass` only when every target host passed; any host failure makes it
    /// `fail`, otherwise any skipped host makes it `skip`
    pub outcome: Outcome,
    pub hosts: BTreeMap<String, HostOutcome>,
}

impl CheckResult {
    pub fn new(id: impl Into<String>, kind: &'static str, weight: f64, hosts: BTreeMap<String, HostOutcome>) -> Self {
        let outcome = if hosts.is_empty() || hosts.values().any(|h| h.outcome == Outcome::Fail) {
            Outcome::Fail
        } else if hosts.values().any(|h| h.outcome == Outcome::Skip) {
            Outcome::Skip
        } else {
            Outcome::Pass
        };
        Self {
            id: id.into(),
            kind,
            weight,
            outcome,
            hosts,
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Pass
    }

    /// First message of a host that did not pass, for summaries.
    pub fn failure_message(&self) -> Option<(&str, &str)> {
        self.hosts
            .iter()
            .find(|(_, o)| o.outcome == self.outcome && !o.passed())
            .map(|(h, o)| (h.as_str(), o.message.as_deref().unwrap_or(o.outcome.as_str())))
    }
}

/// A failure that ended a phase or the whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FatalError {
    pub kind: FailureKind,
    pub message: String,
    pub advice: &'static str,
}

impl From<&GradeError> for FatalError {
    fn from(err: &GradeError) -> Self {
        let kind = err.kind();
        Self {
            kind,
            message: err.to_string(),
            advice: kind.advice(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseResult {
    pub phase: Phase,
    pub status: PhaseStatus,
    /// Every state entered, in order
    pub states: Vec<PhaseState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converge: Option<ConvergeRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converge_outcome: Option<ConvergeOutcome>,
    pub checks: Vec<CheckResult>,
    pub score: Score,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FatalError>,
    pub duration_secs: f64,
}

impl PhaseResult {
    /// A phase skipped because an earlier one aborted.
    pub fn not_run(phase: Phase, possible: f64) -> Self {
        Self {
            phase,
            status: PhaseStatus::NotRun,
            states: vec![PhaseState::Pending],
            converge: None,
            converge_outcome: None,
            checks: Vec::new(),
            score: Score::zero(possible),
            error: None,
            duration_secs: 0.0,
        }
    }

    pub fn passed_checks(&self) -> usize {
        self.count(Outcome::Pass)
    }

    pub fn failed_checks(&self) -> usize {
        self.count(Outcome::Fail)
    }

    pub fn skipped_checks(&self) -> usize {
        self.count(Outcome::Skip)
    }

    fn count(&self, outcome: Outcome) -> usize {
        self.checks.iter().filter(|c| c.outcome == outcome).count()
    }
}

/// The persisted result of a grading run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradeReport {
    pub assignment_id: Option<String>,
    pub generated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_fingerprint: Option<String>,
    pub status: RunStatus,
    pub phases: Vec<PhaseResult>,
    pub score: Score,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<FatalError>,
}

impl GradeReport {
    pub fn new(assignment_id: &str, plan_fingerprint: Option<String>, phases: Vec<PhaseResult>) -> Self {
        let status = if phases.iter().any(|p| p.status != PhaseStatus::Scored) {
            RunStatus::Aborted
        } else {
            RunStatus::Completed
        };
        let score = Score::combine(phases.iter().map(|p| &p.score));
        Self {
            assignment_id: Some(assignment_id.to_string()),
            generated_at: Utc::now(),
            plan_fingerprint,
            status,
            phases,
            score,
            fatal_error: None,
        }
    }

    /// Report for a run that failed before any phase started.
    pub fn fatal(assignment_id: Option<&str>, err: &GradeError) -> Self {
        Self {
            assignment_id: assignment_id.map(str::to_string),
            generated_at: Utc::now(),
            plan_fingerprint: None,
            status: RunStatus::Aborted,
            phases: Vec::new(),
            score: Score::zero(0.0),
            fatal_error: Some(FatalError::from(err)),
        }
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseResult> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed && self.phases.iter().all(|p| p.checks.iter().all(CheckResult::passed))
    }

    /// Human-readable summary.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str("HAMMER Grading Report\n");
        out.push_str("=====================\n");
        out.push_str(&format!(
            "Assignment: {}\n",
            self.assignment_id.as_deref().unwrap_or("unknown")
        ));
        out.push_str(&format!("Timestamp: {}\n", self.generated_at.to_rfc3339()));
        if let Some(fp) = &self.plan_fingerprint {
            out.push_str(&format!("Plan: {}\n", &fp[..fp.len().min(16)]));
        }

        if let Some(err) = &self.fatal_error {
            out.push_str(&format!("\nFatal ({}): {}\n", err.kind, err.message));
            out.push_str(&format!("Hint: {}\n", err.advice));
        }

        if !self.phases.is_empty() {
            out.push_str("\nResults by Phase:\n");
            out.push_str("-----------------\n");
        }
        for phase in &self.phases {
            out.push_str(&format!("\n{}:\n", phase.phase.as_str().to_uppercase()));
            match &phase.converge {
                Some(record) => {
                    let verdict = if phase.converge_outcome.is_some() { "PASS" } else { "FAIL" };
                    out.push_str(&format!("  Converge: {verdict}\n"));
                    out.push_str(&format!(
                        "    ok={}, changed={}, failed={}, unreachable={}\n",
                        record.totals.ok, record.totals.changed, record.totals.failed, record.totals.unreachable
                    ));
                }
                None => out.push_str(&format!("  Converge: {}\n", phase.status.as_str())),
            }
            if let Some(err) = &phase.error {
                out.push_str(&format!("  Aborted ({}): {}\n", err.kind, err.message));
            }
            out.push_str(&format!(
                "  Checks: {} passed, {} failed, {} skipped\n",
                phase.passed_checks(),
                phase.failed_checks(),
                phase.skipped_checks()
            ));
            for check in phase.checks.iter().filter(|c| !c.passed()) {
                if let Some((host, message)) = check.failure_message() {
                    let label = check.outcome.as_str().to_uppercase();
                    out.push_str(&format!("    {label} {} [{host}]: {message}\n", check.id));
                }
            }
            out.push_str(&format!(
                "  Score: {:.1} / {:.1}\n",
                phase.score.earned, phase.score.possible
            ));
        }

        out.push_str(&format!(
            "\nTotal Score: {:.1} / {:.1} ({:.1}%)\n",
            self.score.earned, self.score.possible, self.score.percentage
        ));
        out.push_str(&format!(
            "Overall: {}\n",
            if self.is_success() { "PASS" } else { "FAIL" }
        ));
        out
    }

    /// Write `report.json` and `summary.txt` into `dir`, creating it.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir).map_err(|e| GradeError::io(format!("creating {}", dir.display()), e))?;
        let report_path = dir.join(REPORT_FILE);
        fs::write(&report_path, serde_json::to_string_pretty(self)?)
            .map_err(|e| GradeError::io(format!("writing {}", report_path.display()), e))?;
        let summary_path = dir.join(SUMMARY_FILE);
        fs::write(&summary_path, self.summary())
            .map_err(|e| GradeError::io(format!("writing {}", summary_path.display()), e))?;
        Ok(report_path)
    }
}
