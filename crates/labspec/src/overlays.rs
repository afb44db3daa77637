//! Handler contracts, idempotence policy and per-phase overlays.

use crate::topology::NodeSelector;
use crate::types::{ExpectedRuns, OverlayPhase, Phase, default_true, default_weight};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Something that should cause a handler to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Trigger {
    FileChanged { file_changed: String },
    TemplateChanged { template_changed: String },
    VariableChanged { variable_changed: String },
}

/// Something that must not cause a handler to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NonTrigger {
    NoopRerun { noop_rerun: bool },
    UnrelatedFileChanged { unrelated_file_changed: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerAction {
    Restart,
    Reload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerTarget {
    pub service: String,
    pub action: HandlerAction,
}

/// Expected handler run count for each phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedRunsSet {
    pub baseline: ExpectedRuns,
    pub mutation: ExpectedRuns,
    pub idempotence: ExpectedRuns,
}

impl ExpectedRunsSet {
    pub fn for_phase(&self, phase: Phase) -> ExpectedRuns {
        match phase {
            Phase::Baseline => self.baseline,
            Phase::Mutation => self.mutation,
            Phase::Idempotence => self.idempotence,
        }
    }
}

fn default_handler_weight() -> f64 {
    2.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerContract {
    pub handler_name: String,
    pub node_selector: NodeSelector,
    pub handler_target: HandlerTarget,
    #[serde(default)]
    pub trigger_conditions: Vec<Trigger>,
    #[serde(default)]
    pub non_trigger_conditions: Vec<NonTrigger>,
    pub expected_runs: ExpectedRunsSet,
    #[serde(default = "default_handler_weight")]
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotenceEnforcement {
    #[serde(default = "default_true")]
    pub require_changed_zero: bool,
    #[serde(default = "default_true")]
    pub require_no_handlers: bool,
}

impl Default for IdempotenceEnforcement {
    fn default() -> Self {
        Self {
            require_changed_zero: true,
            require_no_handlers: true,
        }
    }
}

/// Rules for the idempotence re-run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencePolicy {
    #[serde(default = "default_true")]
    pub required: bool,
    /// Task names allowed to report `changed` on the re-run
    #[serde(default)]
    pub allowed_changes: Vec<String>,
    #[serde(default)]
    pub enforcement: IdempotenceEnforcement,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

impl Default for IdempotencePolicy {
    fn default() -> Self {
        Self {
            required: true,
            allowed_changes: Vec::new(),
            enforcement: IdempotenceEnforcement::default(),
            weight: 1.0,
        }
    }
}

/// Which converge failures a phase tolerates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePolicy {
    #[serde(default)]
    pub allow_failures: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failures: Option<u32>,
    /// Regexes every failure message must match (case-insensitive)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected_patterns: Vec<String>,
}

fn default_reboot_timeout() -> u64 {
    120
}

fn default_poll_interval() -> u64 {
    5
}

/// Reboot nodes after converge and before snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Nodes to reboot; `None` means every node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<String>>,
    /// Seconds to wait for each node to come back
    #[serde(default = "default_reboot_timeout")]
    pub timeout: u64,
    /// Seconds between reachability polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
}

impl Default for RebootConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            nodes: None,
            timeout: default_reboot_timeout(),
            poll_interval: default_poll_interval(),
        }
    }
}

pub type VarMap = BTreeMap<String, Value>;

/// Grader-injected configuration for one overlay phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseOverlay {
    #[serde(default)]
    pub inventory_vars: VarMap,
    /// group name -> variables
    #[serde(default)]
    pub group_vars: BTreeMap<String, VarMap>,
    /// host name -> variables
    #[serde(default)]
    pub host_vars: BTreeMap<String, VarMap>,
    #[serde(default)]
    pub extra_vars: VarMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reboot: Option<RebootConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,
}

impl PhaseOverlay {
    /// Whether any layer of this overlay declares `name`.
    pub fn declares(&self, name: &str) -> bool {
        self.inventory_vars.contains_key(name)
            || self.extra_vars.contains_key(name)
            || self.group_vars.values().any(|v| v.contains_key(name))
            || self.host_vars.values().any(|v| v.contains_key(name))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseOverlays {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<PhaseOverlay>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation: Option<PhaseOverlay>,
}

impl PhaseOverlays {
    pub fn get(&self, phase: OverlayPhase) -> Option<&PhaseOverlay> {
        match phase {
            OverlayPhase::Baseline => self.baseline.as_ref(),
            OverlayPhase::Mutation => self.mutation.as_ref(),
        }
    }

    /// Declared overlays with their phase.
    pub fn iter(&self) -> impl Iterator<Item = (OverlayPhase, &PhaseOverlay)> {
        [OverlayPhase::Baseline, OverlayPhase::Mutation]
            .into_iter()
            .filter_map(|p| self.get(p).map(|o| (p, o)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triggers_are_untagged() {
        let triggers: Vec<Trigger> = serde_yaml::from_str(
            "- {template_changed: templates/nginx.conf.j2}\n- {variable_changed: http_port}\n",
        )
        .unwrap();
        assert_eq!(
            triggers[1],
            Trigger::VariableChanged {
                variable_changed: "http_port".into()
            }
        );

        let non: NonTrigger = serde_yaml::from_str("noop_rerun: true").unwrap();
        assert_eq!(non, NonTrigger::NoopRerun { noop_rerun: true });
    }

    #[test]
    fn test_expected_runs_per_phase() {
        let set: ExpectedRunsSet = serde_yaml::from_str(
            "{baseline: at_least_once, mutation: exactly_once, idempotence: zero}",
        )
        .unwrap();
        assert_eq!(set.for_phase(Phase::Idempotence), ExpectedRuns::Zero);
        assert_eq!(set.for_phase(Phase::Mutation), ExpectedRuns::ExactlyOnce);
    }

    #[test]
    fn test_idempotence_policy_defaults() {
        let policy: IdempotencePolicy = serde_yaml::from_str("{}").unwrap();
        assert_eq!(policy, IdempotencePolicy::default());
        assert!(policy.enforcement.require_no_handlers);
    }

    #[test]
    fn test_overlay_declares_any_layer() {
        let overlay: PhaseOverlay = serde_yaml::from_str(
            r"
group_vars:
  web: {http_port: 8080}
host_vars:
  db1: {db_port: 5432}
",
        )
        .unwrap();
        assert!(overlay.declares("http_port"));
        assert!(overlay.declares("db_port"));
        assert!(!overlay.declares("missing"));
    }

    #[test]
    fn test_reboot_defaults() {
        let reboot: RebootConfig = serde_yaml::from_str("enabled: true").unwrap();
        assert_eq!(reboot.timeout, 120);
        assert_eq!(reboot.poll_interval, 5);
        assert!(reboot.nodes.is_none());
    }
}
