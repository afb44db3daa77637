//! Phase orchestration: runs the plan's phases in order against the
//! collaborators and scores them.
//!
//! Each phase walks `pending -> overlaying -> converging -> (rebooting) ->
//! snapshotting -> verifying -> scored`, or drops to `aborted` from any
//! state. An aborted phase stops the run; the remaining phases are recorded
//! as not run and score zero of their weight.

use crate::context::{
    AutomationRunner, CancelToken, ConvergeRecord, ConvergeRequest, HostSnapshot, HostVerdict,
    PhaseObserver, RebootAgent, SnapshotCollector, VerificationRunner,
};
use crate::contracts::{ContractCheck, Evaluation};
use crate::error::{FailureKind, GradeError, Result};
use crate::plan::{self, ExecutionPlan, PhasePlan, PlanOptions, RebootPlan};
use crate::poll::{Clock, LogCallback, PollOutcome, poll_until};
use crate::policy::{self, ConvergeOutcome};
use crate::report::{CheckResult, FatalError, GradeReport, HostOutcome, PhaseResult, PhaseState, PhaseStatus, Score};
use crate::verify;
use labspec::{LabSpec, Phase};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::time::Duration;

/// The outside world, as the orchestrator sees it.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub runner: &'a dyn AutomationRunner,
    pub reboot: &'a dyn RebootAgent,
    pub snapshots: &'a dyn SnapshotCollector,
    pub verifier: &'a dyn VerificationRunner,
    pub clock: &'a dyn Clock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorOptions {
    pub converge_timeout: Duration,
    /// How long a rebooted host gets to stop answering
    pub reboot_down_timeout: Duration,
    /// Deadline of a single reachability probe
    pub reboot_probe_timeout: Duration,
    /// Worker threads for per-host verification and reboot polling
    pub verify_jobs: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            converge_timeout: Duration::from_secs(1800),
            reboot_down_timeout: Duration::from_secs(30),
            reboot_probe_timeout: Duration::from_secs(10),
            verify_jobs: 4,
        }
    }
}

pub struct Orchestrator<'a> {
    collab: Collaborators<'a>,
    options: OrchestratorOptions,
    cancel: CancelToken,
    pool: rayon::ThreadPool,
}

/// Mutable trail of one phase while it runs.
struct PhaseRun {
    states: Vec<PhaseState>,
    converge: Option<ConvergeRecord>,
    outcome: Option<ConvergeOutcome>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(collab: Collaborators<'a>, options: OrchestratorOptions, cancel: CancelToken) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.verify_jobs.max(1))
            .build()
            .map_err(|e| GradeError::Configuration(format!("failed to create thread pool: {e}")))?;
        Ok(Self {
            collab,
            options,
            cancel,
            pool,
        })
    }

    /// Run every phase of `plan` and build the report.
    pub fn run(&self, plan: &ExecutionPlan, observer: &mut dyn PhaseObserver) -> GradeReport {
        let mut history: Vec<(Phase, ConvergeRecord)> = Vec::new();
        let mut results = Vec::with_capacity(plan.phases.len());
        let mut stopped = false;

        for phase_plan in &plan.phases {
            if stopped {
                log::info!("Skipping {} after an earlier abort", phase_plan.phase);
                results.push(PhaseResult::not_run(
                    phase_plan.phase,
                    phase_plan.contracts.total_weight(),
                ));
                continue;
            }
            let result = self.run_phase(phase_plan, &history, observer);
            if result.status == PhaseStatus::Aborted {
                stopped = true;
            } else if let Some(record) = &result.converge {
                history.push((result.phase, record.clone()));
            }
            results.push(result);
        }

        let fingerprint = plan
            .fingerprint()
            .inspect_err(|e| log::warn!("Could not fingerprint plan: {e}"))
            .ok();
        GradeReport::new(&plan.assignment_id, fingerprint, results)
    }

    fn run_phase(
        &self,
        plan: &PhasePlan,
        history: &[(Phase, ConvergeRecord)],
        observer: &mut dyn PhaseObserver,
    ) -> PhaseResult {
        let phase = plan.phase;
        let started = self.collab.clock.now();
        log::info!("Starting {phase} phase ({} checks)", plan.contracts.checks.len());
        observer.on_phase_start(phase);

        let mut run = PhaseRun {
            states: vec![PhaseState::Pending],
            converge: None,
            outcome: None,
        };
        let executed = self.execute(plan, history, &mut run, observer);
        let total = plan.contracts.total_weight();

        let (status, checks, score, error) = match executed {
            Ok(checks) => {
                let earned = checks.iter().filter(|c| c.passed()).map(|c| c.weight).sum();
                run.states.push(PhaseState::Scored);
                observer.on_state(phase, PhaseState::Scored);
                (PhaseStatus::Scored, checks, Score::new(earned, total), None)
            }
            Err(err) => {
                log::warn!("{phase} phase aborted: {err}");
                run.states.push(PhaseState::Aborted);
                observer.on_state(phase, PhaseState::Aborted);
                (PhaseStatus::Aborted, Vec::new(), Score::zero(total), Some(FatalError::from(&err)))
            }
        };

        let result = PhaseResult {
            phase,
            status,
            states: run.states,
            converge: run.converge,
            converge_outcome: run.outcome,
            checks,
            score,
            error,
            duration_secs: self.collab.clock.now().saturating_duration_since(started).as_secs_f64(),
        };
        log::info!(
            "Finished {phase} phase: {} ({:.1}/{:.1})",
            result.status.as_str(),
            result.score.earned,
            result.score.possible
        );
        observer.on_phase_complete(&result);
        result
    }

    fn transition(&self, phase: Phase, run: &mut PhaseRun, state: PhaseState, observer: &mut dyn PhaseObserver) -> Result<()> {
        self.cancel.check()?;
        log::debug!("{phase}: {state}");
        run.states.push(state);
        observer.on_state(phase, state);
        Ok(())
    }

    fn execute(
        &self,
        plan: &PhasePlan,
        history: &[(Phase, ConvergeRecord)],
        run: &mut PhaseRun,
        observer: &mut dyn PhaseObserver,
    ) -> Result<Vec<CheckResult>> {
        let phase = plan.phase;

        self.transition(phase, run, PhaseState::Overlaying, observer)?;
        self.collab.runner.stage(phase, &plan.variables)?;

        self.transition(phase, run, PhaseState::Converging, observer)?;
        let request = ConvergeRequest {
            phase,
            overlay_phase: plan.overlay_phase,
            timeout: self.options.converge_timeout,
        };
        let record = run.converge.insert(self.collab.runner.converge(&request)?);
        let outcome = policy::classify(record, &plan.policy.failure, self.options.converge_timeout.as_secs())?;
        run.outcome = Some(outcome);
        let record = record.clone();

        if let Some(reboot) = &plan.policy.reboot {
            self.transition(phase, run, PhaseState::Rebooting, observer)?;
            self.reboot(reboot)?;
        }

        self.transition(phase, run, PhaseState::Snapshotting, observer)?;
        let snapshots = self.snapshot(&plan.contracts.checks)?;

        self.transition(phase, run, PhaseState::Verifying, observer)?;
        let history: Vec<(Phase, &ConvergeRecord)> = history.iter().map(|(p, r)| (*p, r)).collect();
        self.verify(plan, &record, &snapshots, &history)
    }

    /// Reboot hosts in parallel, then wait for each to go down and come back.
    fn reboot(&self, plan: &RebootPlan) -> Result<()> {
        log::info!("Rebooting {}", plan.hosts.join(", "));
        let results: Vec<Result<()>> = self
            .pool
            .install(|| plan.hosts.par_iter().map(|host| self.reboot_host(host, plan)).collect());
        results.into_iter().collect()
    }

    fn reboot_host(&self, host: &str, plan: &RebootPlan) -> Result<()> {
        let agent = self.collab.reboot;
        let probe = self.options.reboot_probe_timeout;
        let interval = Duration::from_secs(plan.poll_interval_secs);
        agent.reboot(host)?;

        match poll_until(
            self.collab.clock,
            self.options.reboot_down_timeout,
            interval,
            &self.cancel,
            Some(&LogCallback(host)),
            || !agent.is_reachable(host, probe),
        ) {
            PollOutcome::Ready { .. } => log::debug!("{host} went down"),
            PollOutcome::TimedOut { .. } => {
                return Err(GradeError::Timeout {
                    operation: format!("waiting for {host} to go down after the reboot request"),
                    seconds: self.options.reboot_down_timeout.as_secs(),
                });
            }
            PollOutcome::Cancelled => return Err(GradeError::Cancelled),
        }

        match poll_until(
            self.collab.clock,
            Duration::from_secs(plan.timeout_secs),
            interval,
            &self.cancel,
            Some(&LogCallback(host)),
            || agent.is_reachable(host, probe),
        ) {
            PollOutcome::Ready { attempts } => {
                log::info!("{host} is back after {attempts} probe(s)");
                Ok(())
            }
            PollOutcome::TimedOut { .. } => Err(GradeError::Unreachable {
                host: host.to_string(),
                message: format!("not reachable {}s after reboot", plan.timeout_secs),
            }),
            PollOutcome::Cancelled => Err(GradeError::Cancelled),
        }
    }

    /// Collect snapshots for every host a snapshot-evaluated check targets.
    fn snapshot(&self, checks: &[ContractCheck]) -> Result<BTreeMap<String, HostSnapshot>> {
        let mut per_host: BTreeMap<&str, Vec<&ContractCheck>> = BTreeMap::new();
        for check in checks.iter().filter(|c| c.kind.evaluation() == Evaluation::Snapshot) {
            for host in &check.host_targets {
                per_host.entry(host).or_default().push(check);
            }
        }

        let mut snapshots = BTreeMap::new();
        for (host, checks) in per_host {
            self.cancel.check()?;
            let request = verify::snapshot_request(host, &checks);
            let snapshot = self.collab.snapshots.snapshot(&request)?;
            snapshots.insert(host.to_string(), snapshot);
        }
        Ok(snapshots)
    }

    fn verify(
        &self,
        plan: &PhasePlan,
        record: &ConvergeRecord,
        snapshots: &BTreeMap<String, HostSnapshot>,
        history: &[(Phase, &ConvergeRecord)],
    ) -> Result<Vec<CheckResult>> {
        let phase = plan.phase;
        let checks = &plan.contracts.checks;
        let remote = self.delegate(phase, checks)?;

        let results = checks
            .iter()
            .map(|check| {
                let hosts: BTreeMap<String, HostOutcome> = match check.kind.evaluation() {
                    Evaluation::Local => verify::evaluate_local(check, phase, record, history),
                    Evaluation::Snapshot => check
                        .host_targets
                        .iter()
                        .map(|host| {
                            let outcome = match snapshots.get(host) {
                                Some(snapshot) => verify::evaluate_snapshot(check, snapshot),
                                None => HostOutcome::skip("no snapshot collected"),
                            };
                            (host.clone(), outcome)
                        })
                        .collect(),
                    Evaluation::Remote => check
                        .host_targets
                        .iter()
                        .map(|host| {
                            let outcome = remote
                                .get(&(check.id.as_str(), host.as_str()))
                                .cloned()
                                .unwrap_or_else(|| HostOutcome::fail("no verdict returned"));
                            (host.clone(), outcome)
                        })
                        .collect(),
                };
                CheckResult::new(check.id.clone(), check.kind.name(), check.weight, hosts)
            })
            .collect();
        Ok(results)
    }

    /// Run delegated checks through the verification runner, hosts in parallel.
    ///
    /// A verifier timeout or cancellation aborts the phase. Any other verifier
    /// error skips that host's checks.
    fn delegate<'c>(
        &self,
        phase: Phase,
        checks: &'c [ContractCheck],
    ) -> Result<BTreeMap<(&'c str, &'c str), HostOutcome>> {
        let mut per_host: BTreeMap<&str, Vec<&ContractCheck>> = BTreeMap::new();
        for check in checks.iter().filter(|c| c.kind.evaluation() == Evaluation::Remote) {
            for host in &check.host_targets {
                per_host.entry(host).or_default().push(check);
            }
        }
        let groups: Vec<(&str, Vec<&ContractCheck>)> = per_host.into_iter().collect();

        let verifier = self.collab.verifier;
        let replies: Vec<Result<Vec<HostVerdict>>> = self.pool.install(|| {
            groups
                .par_iter()
                .map(|(host, checks)| verifier.run_checks(phase, host, checks))
                .collect()
        });

        let mut outcomes = BTreeMap::new();
        for ((host, checks), reply) in groups.iter().zip(replies) {
            match reply {
                Ok(verdicts) => {
                    for check in checks {
                        let outcome = match verdicts.iter().find(|v| v.check_id == check.id) {
                            Some(v) => HostOutcome {
                                outcome: v.outcome,
                                message: v.message.clone(),
                            },
                            None => HostOutcome::fail("no verdict returned"),
                        };
                        outcomes.insert((check.id.as_str(), *host), outcome);
                    }
                }
                Err(err) if matches!(err.kind(), FailureKind::Timeout | FailureKind::Aborted) => {
                    return Err(err);
                }
                Err(err) => {
                    log::warn!("Verification on {host} failed: {err}");
                    for check in checks {
                        outcomes.insert((check.id.as_str(), *host), HostOutcome::skip(err.to_string()));
                    }
                }
            }
        }
        Ok(outcomes)
    }
}

/// Assemble the plan and run it; plan failures become a report with no phases.
pub fn grade(
    spec: &LabSpec,
    plan_options: &PlanOptions,
    orchestrator: &Orchestrator<'_>,
    observer: &mut dyn PhaseObserver,
) -> GradeReport {
    match plan::assemble(spec, plan_options) {
        Ok(plan) => orchestrator.run(&plan, observer),
        Err(err) => {
            log::error!("Could not build execution plan: {err}");
            GradeReport::fatal(Some(&spec.assignment_id), &err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{NoProgress, Outcome};
    use crate::report::RunStatus;
    use crate::testutil::{FakeClock, SimulatedLab, web_lab, web_lab_with};

    fn collaborators<'a>(lab: &'a SimulatedLab, clock: &'a FakeClock) -> Collaborators<'a> {
        Collaborators {
            runner: lab,
            reboot: lab,
            snapshots: lab,
            verifier: lab,
            clock,
        }
    }

    fn run_lab(spec: &LabSpec, lab: &SimulatedLab) -> GradeReport {
        let clock = FakeClock::new();
        let orchestrator = Orchestrator::new(
            collaborators(lab, &clock),
            OrchestratorOptions::default(),
            CancelToken::new(),
        )
        .unwrap();
        grade(spec, &PlanOptions::default(), &orchestrator, &mut NoProgress)
    }

    #[test]
    fn test_correct_submission_scores_full_marks() {
        let report = run_lab(&web_lab(), &SimulatedLab::new());
        assert_eq!(report.status, RunStatus::Completed);
        for phase in &report.phases {
            let failed: Vec<_> = phase.checks.iter().filter(|c| !c.passed()).collect();
            assert!(failed.is_empty(), "{}: {failed:?}", phase.phase);
            assert_eq!(phase.score.percentage, 100.0);
        }
        assert_eq!(report.score.possible, 39.0);
        assert!(report.is_success());
        assert!(report.plan_fingerprint.is_some());
    }

    #[test]
    fn test_state_trail() {
        let report = run_lab(&web_lab(), &SimulatedLab::new());
        use PhaseState as S;
        assert_eq!(
            report.phase(Phase::Baseline).unwrap().states,
            [S::Pending, S::Overlaying, S::Converging, S::Snapshotting, S::Verifying, S::Scored]
        );
        assert_eq!(
            report.phase(Phase::Mutation).unwrap().states,
            [
                S::Pending,
                S::Overlaying,
                S::Converging,
                S::Rebooting,
                S::Snapshotting,
                S::Verifying,
                S::Scored
            ]
        );
        // idempotence re-applies the mutation overlay, reboot included
        assert!(report.phase(Phase::Idempotence).unwrap().states.contains(&S::Rebooting));
    }

    #[test]
    fn test_snapshot_strictly_after_reboot_confirmed() {
        let lab = SimulatedLab::new();
        run_lab(&web_lab(), &lab);
        let events = lab.events();
        let converge = events.iter().position(|e| e == "converge mutation").unwrap();
        let reboot = events.iter().position(|e| e == "reboot db1").unwrap();
        let up = events.iter().position(|e| e == "up db1").unwrap();
        let snapshot = events
            .iter()
            .skip(converge)
            .position(|e| e.starts_with("snapshot"))
            .map(|i| i + converge)
            .unwrap();
        assert!(converge < reboot);
        assert!(reboot < up);
        assert!(up < snapshot);
    }

    #[test]
    fn test_failure_policy_boundary() {
        // one matching failure in mutation is tolerated
        let lab = SimulatedLab::new();
        lab.fail_converge(Phase::Mutation, &["fatal: [web1]: FAILED! => connection refused"]);
        let report = run_lab(&web_lab(), &lab);
        let mutation = report.phase(Phase::Mutation).unwrap();
        assert_eq!(mutation.status, PhaseStatus::Scored);
        assert_eq!(mutation.converge_outcome, Some(ConvergeOutcome::Tolerated { failed: 1 }));

        // two abort the phase and stop the run
        let lab = SimulatedLab::new();
        lab.fail_converge(Phase::Mutation, &["connection refused", "connection refused"]);
        let report = run_lab(&web_lab(), &lab);
        assert_eq!(report.status, RunStatus::Aborted);
        let mutation = report.phase(Phase::Mutation).unwrap();
        assert_eq!(mutation.status, PhaseStatus::Aborted);
        assert_eq!(mutation.error.as_ref().unwrap().kind, FailureKind::Converge);
        assert_eq!(mutation.score.earned, 0.0);
        let idem = report.phase(Phase::Idempotence).unwrap();
        assert_eq!(idem.status, PhaseStatus::NotRun);
        assert_eq!(idem.score, Score::zero(13.0));

        // one non-matching failure aborts too
        let lab = SimulatedLab::new();
        lab.fail_converge(Phase::Mutation, &["permission denied"]);
        let report = run_lab(&web_lab(), &lab);
        assert_eq!(report.phase(Phase::Mutation).unwrap().status, PhaseStatus::Aborted);
    }

    #[test]
    fn test_baseline_abort_stops_everything() {
        let lab = SimulatedLab::new();
        lab.fail_converge(Phase::Baseline, &["connection refused"]);
        let report = run_lab(&web_lab(), &lab);
        let statuses: Vec<PhaseStatus> = report.phases.iter().map(|p| p.status).collect();
        assert_eq!(statuses, [PhaseStatus::Aborted, PhaseStatus::NotRun, PhaseStatus::NotRun]);
        assert_eq!(report.score.earned, 0.0);
        assert_eq!(report.score.possible, 39.0);
        assert!(!lab.events().iter().any(|e| e == "converge mutation"));
    }

    #[test]
    fn test_converge_timeout_keeps_partial_record() {
        let lab = SimulatedLab::new();
        lab.time_out_converge(Phase::Baseline);
        let report = run_lab(&web_lab(), &lab);
        let baseline = report.phase(Phase::Baseline).unwrap();
        assert_eq!(baseline.error.as_ref().unwrap().kind, FailureKind::Timeout);
        assert!(baseline.converge.as_ref().unwrap().timed_out);
        assert!(baseline.converge_outcome.is_none());
    }

    #[test]
    fn test_reboot_that_never_returns_is_unreachable() {
        let lab = SimulatedLab::new();
        lab.never_returns("db1");
        let report = run_lab(&web_lab(), &lab);
        let mutation = report.phase(Phase::Mutation).unwrap();
        assert_eq!(mutation.error.as_ref().unwrap().kind, FailureKind::Unreachable);
        let events = lab.events();
        let converge = events.iter().position(|e| e == "converge mutation").unwrap();
        assert!(!events[converge..].iter().any(|e| e.starts_with("snapshot") || e == "up db1"));
    }

    #[test]
    fn test_reboot_must_be_observed() {
        let lab = SimulatedLab::new();
        lab.ignores_reboot("db1");
        let report = run_lab(&web_lab(), &lab);
        let error = report.phase(Phase::Mutation).unwrap().error.clone().unwrap();
        assert_eq!(error.kind, FailureKind::Timeout);
        assert_eq!(
            error.message,
            "waiting for db1 to go down after the reboot request timed out after 30s"
        );
    }

    #[test]
    fn test_cancel_during_verification_aborts_phase() {
        let lab = SimulatedLab::new();
        let cancel = CancelToken::new();
        lab.cancel_during_verification(&cancel);
        let clock = FakeClock::new();
        let orchestrator =
            Orchestrator::new(collaborators(&lab, &clock), OrchestratorOptions::default(), cancel.clone()).unwrap();
        let report = grade(&web_lab(), &PlanOptions::default(), &orchestrator, &mut NoProgress);

        assert!(cancel.is_cancelled());
        assert_eq!(report.status, RunStatus::Aborted);
        let baseline = report.phase(Phase::Baseline).unwrap();
        assert_eq!(baseline.status, PhaseStatus::Aborted);
        assert_eq!(baseline.error.as_ref().unwrap().kind, FailureKind::Aborted);
        assert_eq!(baseline.states.last(), Some(&PhaseState::Aborted));
        assert_eq!(report.phase(Phase::Mutation).unwrap().status, PhaseStatus::NotRun);
        assert!(!lab.events().iter().any(|e| e == "converge mutation"));
    }

    #[test]
    fn test_failed_checks_reduce_score_only() {
        let lab = SimulatedLab::new();
        lab.fail_check("package:0:nginx");
        let report = run_lab(&web_lab(), &lab);
        assert_eq!(report.status, RunStatus::Completed);
        let baseline = report.phase(Phase::Baseline).unwrap();
        assert_eq!(baseline.score.earned, 13.0);
        assert!(baseline.score.percentage < 100.0);
        assert!(!report.is_success());
    }

    #[test]
    fn test_verifier_error_skips_host_checks() {
        let lab = SimulatedLab::new();
        lab.verifier_error("web1", FailureKind::Verification);
        let report = run_lab(&web_lab(), &lab);
        let baseline = report.phase(Phase::Baseline).unwrap();
        assert_eq!(baseline.status, PhaseStatus::Scored);
        let package = baseline.checks.iter().find(|c| c.id == "package:0:nginx").unwrap();
        assert_eq!(package.hosts["web1"].outcome, Outcome::Skip);
        assert!(package.hosts["web2"].passed());
        assert_eq!(package.outcome, Outcome::Skip);
        assert!(baseline.skipped_checks() > 0);
        assert_eq!(baseline.failed_checks(), 0);
        assert!(baseline.score.earned < baseline.score.possible);
    }

    #[test]
    fn test_verifier_timeout_aborts_phase() {
        let lab = SimulatedLab::new();
        lab.verifier_error("web2", FailureKind::Timeout);
        let report = run_lab(&web_lab(), &lab);
        let baseline = report.phase(Phase::Baseline).unwrap();
        assert_eq!(baseline.status, PhaseStatus::Aborted);
        assert_eq!(baseline.error.as_ref().unwrap().kind, FailureKind::Timeout);
    }

    #[test]
    fn test_zero_weight_phase_scores_full() {
        let lab = SimulatedLab::new();
        let clock = FakeClock::new();
        let orchestrator =
            Orchestrator::new(collaborators(&lab, &clock), OrchestratorOptions::default(), CancelToken::new()).unwrap();
        let mut plan = plan::assemble(&web_lab(), &PlanOptions::default()).unwrap();
        plan.phases[0].contracts.checks.clear();
        let report = orchestrator.run(&plan, &mut NoProgress);
        let baseline = report.phase(Phase::Baseline).unwrap();
        assert_eq!(baseline.score.percentage, 100.0);
        assert_eq!(baseline.score.possible, 0.0);
    }

    #[test]
    fn test_cancelled_run_aborts_first_phase() {
        let lab = SimulatedLab::new();
        let clock = FakeClock::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let orchestrator =
            Orchestrator::new(collaborators(&lab, &clock), OrchestratorOptions::default(), cancel).unwrap();
        let report = grade(&web_lab(), &PlanOptions::default(), &orchestrator, &mut NoProgress);
        let baseline = report.phase(Phase::Baseline).unwrap();
        assert_eq!(baseline.status, PhaseStatus::Aborted);
        assert_eq!(baseline.error.as_ref().unwrap().kind, FailureKind::Aborted);
        assert!(lab.events().is_empty());
    }

    #[test]
    fn test_resolution_failure_touches_nothing() {
        let lab = SimulatedLab::new();
        let spec = web_lab_with(&[("db1: {db_port: 5433}", "db1: {db_port: null}")]);
        let report = run_lab(&spec, &lab);
        assert_eq!(report.status, RunStatus::Aborted);
        assert!(report.phases.is_empty());
        assert_eq!(report.fatal_error.unwrap().kind, FailureKind::Resolution);
        assert!(lab.events().is_empty());
    }

    #[test]
    fn test_observer_sees_every_transition() {
        struct Recorder(Vec<String>);
        impl PhaseObserver for Recorder {
            fn on_phase_start(&mut self, phase: Phase) {
                self.0.push(format!("start {phase}"));
            }
            fn on_state(&mut self, phase: Phase, state: PhaseState) {
                self.0.push(format!("{phase} {state}"));
            }
            fn on_phase_complete(&mut self, result: &PhaseResult) {
                self.0.push(format!("done {}", result.phase));
            }
        }

        let lab = SimulatedLab::new();
        let clock = FakeClock::new();
        let orchestrator =
            Orchestrator::new(collaborators(&lab, &clock), OrchestratorOptions::default(), CancelToken::new()).unwrap();
        let mut recorder = Recorder(Vec::new());
        grade(&web_lab(), &PlanOptions::default(), &orchestrator, &mut recorder);
        assert_eq!(recorder.0.first().map(String::as_str), Some("start baseline"));
        assert_eq!(recorder.0.last().map(String::as_str), Some("done idempotence"));
        assert!(recorder.0.contains(&"mutation rebooting".to_string()));
    }
}
