//! Execution plan assembly.
//!
//! The plan is built once, before any machine is touched, and is read-only
//! afterwards. The idempotence phase re-applies the mutation overlay, so it
//! shares the mutation phase's variable plan and policy by reference.

use crate::contracts::{self, PhaseContractPlan};
use crate::error::Result;
use crate::variables::{self, PhaseVariablePlan, ResolveOptions};
use labspec::{FailurePolicy, LabSpec, OverlayPhase, Phase};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Converge,
    Snapshot,
    Verify,
}

impl StepAction {
    const ALL: [Self; 3] = [Self::Converge, Self::Snapshot, Self::Verify];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Converge => "converge",
            Self::Snapshot => "snapshot",
            Self::Verify => "verify",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionStep {
    /// `<phase>_<action>`, e.g. `baseline_converge`
    pub name: String,
    pub phase: Phase,
    pub action: StepAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebootPlan {
    pub hosts: Vec<String>,
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
}

/// Failure handling and reboot behaviour of one overlay phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhasePolicy {
    pub failure: FailurePolicy,
    pub reboot: Option<RebootPlan>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhasePlan {
    pub phase: Phase,
    pub overlay_phase: OverlayPhase,
    pub variables: Arc<PhaseVariablePlan>,
    pub policy: Arc<PhasePolicy>,
    pub contracts: PhaseContractPlan,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanOptions {
    pub resolve: ResolveOptions,
}

/// Everything a grading run will do, in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPlan {
    pub assignment_id: String,
    pub assignment_version: String,
    pub seed: u64,
    pub phases: Vec<PhasePlan>,
    pub steps: Vec<ExecutionStep>,
}

impl ExecutionPlan {
    pub fn phase(&self, phase: Phase) -> Option<&PhasePlan> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Hex blake3 digest of the plan's canonical JSON.
    ///
    /// Maps serialize in key order, so equal plans hash equal.
    pub fn fingerprint(&self) -> Result<String> {
        let mut hasher = blake3::Hasher::new();
        serde_json::to_writer(&mut hasher, self)?;
        Ok(hasher.finalize().to_hex().to_string())
    }
}

/// Assemble the plan for all three phases.
///
/// Fails on the first phase whose checks cannot be resolved; no partial plan
/// is returned.
pub fn assemble(spec: &LabSpec, options: &PlanOptions) -> Result<ExecutionPlan> {
    let mut overlays: Vec<(OverlayPhase, Arc<PhaseVariablePlan>, Arc<PhasePolicy>)> = Vec::new();
    let mut phases = Vec::with_capacity(Phase::ALL.len());

    for phase in Phase::ALL {
        let overlay_phase = phase.overlay_phase();
        let (variables, policy) = match overlays.iter().find(|(o, _, _)| *o == overlay_phase) {
            Some((_, vars, policy)) => (Arc::clone(vars), Arc::clone(policy)),
            None => {
                let vars = Arc::new(variables::resolve(spec, overlay_phase, &options.resolve));
                let policy = Arc::new(phase_policy(spec, overlay_phase));
                overlays.push((overlay_phase, Arc::clone(&vars), Arc::clone(&policy)));
                (vars, policy)
            }
        };
        let contracts = contracts::build(spec, phase, &variables)?;
        phases.push(PhasePlan {
            phase,
            overlay_phase,
            variables,
            policy,
            contracts,
        });
    }

    let steps = Phase::ALL
        .into_iter()
        .flat_map(|phase| {
            StepAction::ALL.into_iter().map(move |action| ExecutionStep {
                name: format!("{phase}_{}", action.as_str()),
                phase,
                action,
            })
        })
        .collect();

    Ok(ExecutionPlan {
        assignment_id: spec.assignment_id.clone(),
        assignment_version: spec.assignment_version.clone(),
        seed: spec.seed,
        phases,
        steps,
    })
}

fn phase_policy(spec: &LabSpec, overlay_phase: OverlayPhase) -> PhasePolicy {
    let Some(overlay) = spec.phase_overlays.get(overlay_phase) else {
        return PhasePolicy::default();
    };
    let reboot = overlay.reboot.as_ref().filter(|r| r.enabled).map(|r| RebootPlan {
        hosts: r
            .nodes
            .clone()
            .unwrap_or_else(|| spec.topology.node_names().map(str::to_string).collect()),
        timeout_secs: r.timeout,
        poll_interval_secs: r.poll_interval,
    });
    PhasePolicy {
        failure: overlay.failure_policy.clone().unwrap_or_default(),
        reboot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{web_lab, web_lab_with};
    use crate::variables::GroupPrecedence;

    #[test]
    fn test_nine_steps_in_fixed_order() {
        let plan = assemble(&web_lab(), &PlanOptions::default()).unwrap();
        let names: Vec<&str> = plan.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "baseline_converge",
                "baseline_snapshot",
                "baseline_verify",
                "mutation_converge",
                "mutation_snapshot",
                "mutation_verify",
                "idempotence_converge",
                "idempotence_snapshot",
                "idempotence_verify",
            ]
        );
    }

    #[test]
    fn test_idempotence_shares_mutation_resolution() {
        let plan = assemble(&web_lab(), &PlanOptions::default()).unwrap();
        let mutation = plan.phase(Phase::Mutation).unwrap();
        let idempotence = plan.phase(Phase::Idempotence).unwrap();
        let baseline = plan.phase(Phase::Baseline).unwrap();

        assert!(Arc::ptr_eq(&mutation.variables, &idempotence.variables));
        assert!(Arc::ptr_eq(&mutation.policy, &idempotence.policy));
        assert!(!Arc::ptr_eq(&baseline.variables, &mutation.variables));
        assert_eq!(idempotence.overlay_phase, OverlayPhase::Mutation);
    }

    #[test]
    fn test_mutation_policy_from_overlay() {
        let plan = assemble(&web_lab(), &PlanOptions::default()).unwrap();
        let mutation = plan.phase(Phase::Mutation).unwrap();
        let reboot = mutation.policy.reboot.as_ref().unwrap();
        assert_eq!(reboot.hosts, ["db1"]);
        assert_eq!((reboot.timeout_secs, reboot.poll_interval_secs), (60, 2));
        assert_eq!(mutation.policy.failure.max_failures, Some(1));

        let baseline = plan.phase(Phase::Baseline).unwrap();
        assert!(baseline.policy.reboot.is_none());
        assert!(!baseline.policy.failure.allow_failures);
    }

    #[test]
    fn test_reboot_without_nodes_targets_every_node() {
        let spec = web_lab_with(&[("      nodes: [db1]\n", "")]);
        let plan = assemble(&spec, &PlanOptions::default()).unwrap();
        let reboot = plan.phase(Phase::Mutation).unwrap().policy.reboot.clone().unwrap();
        assert_eq!(reboot.hosts, ["web1", "web2", "db1"]);
    }

    #[test]
    fn test_assembly_is_deterministic() {
        let spec = web_lab();
        let a = assemble(&spec, &PlanOptions::default()).unwrap();
        let b = assemble(&spec, &PlanOptions::default()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        assert_eq!(a.fingerprint().unwrap().len(), 64);
    }

    #[test]
    fn test_fingerprint_changes_with_plan() {
        let a = assemble(&web_lab(), &PlanOptions::default()).unwrap();
        let b = assemble(&web_lab_with(&[("seed: 42", "seed: 43")]), &PlanOptions::default()).unwrap();
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn test_alphabetical_precedence_still_assembles() {
        let options = PlanOptions {
            resolve: ResolveOptions {
                group_precedence: GroupPrecedence::Alphabetical,
            },
        };
        let plan = assemble(&web_lab(), &options).unwrap();
        assert_eq!(plan.phases.len(), 3);
        assert_eq!(plan.steps.len(), 9);
    }

    #[test]
    fn test_resolution_failure_yields_no_plan() {
        let spec = web_lab_with(&[("db1: {db_port: 5433}", "db1: {db_port: null}")]);
        let err = assemble(&spec, &PlanOptions::default()).unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::Resolution);
    }

    #[test]
    fn test_mutation_scenario_resolves_extra_vars() {
        let plan = assemble(&web_lab(), &PlanOptions::default()).unwrap();
        let baseline = plan.phase(Phase::Baseline).unwrap();
        let mutation = plan.phase(Phase::Mutation).unwrap();
        assert_eq!(baseline.variables.value("http_port"), Some(&serde_json::json!(8080)));
        assert_eq!(mutation.variables.value("http_port"), Some(&serde_json::json!(9090)));
    }
}
