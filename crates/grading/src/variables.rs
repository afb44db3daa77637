//! Variable resolution: the winning value of every declared variable for an
//! overlay phase, plan-wide and per host.
//!
//! Layers, lowest to highest precedence:
//!
//! 1. the contract's student default
//! 2. `inventory_vars`
//! 3. `group_vars` (`all` first, then the node's groups)
//! 4. `host_vars`
//! 5. `extra_vars`
//!
//! A layer that declares a name replaces the value entirely; there is no
//! merging of lists or maps. Resolution is pure: the same spec and phase
//! always produce structurally equal plans.

use labspec::overlays::VarMap;
use labspec::{LabSpec, OverlayPhase, PhaseOverlay, VariableContract};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The layer a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarSource {
    Default,
    InventoryVars,
    GroupVars,
    HostVars,
    ExtraVars,
}

impl VarSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::InventoryVars => "inventory_vars",
            Self::GroupVars => "group_vars",
            Self::HostVars => "host_vars",
            Self::ExtraVars => "extra_vars",
        }
    }
}

/// A variable's winning value and where it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedVariable {
    pub name: String,
    pub value: Value,
    pub source: VarSource,
}

/// Order in which a node's group_vars are applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupPrecedence {
    /// `all` first, then the node's groups in the order the node lists them;
    /// the last group declaring a variable wins.
    #[default]
    LastDeclared,
    /// `all` first, then groups in lexicographic order. Kept for labs graded
    /// under the old rule; never the default.
    Alphabetical,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveOptions {
    #[serde(default)]
    pub group_precedence: GroupPrecedence,
}

/// Resolved variables for one overlay phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseVariablePlan {
    pub overlay_phase: OverlayPhase,
    /// Plan-wide winner per variable
    pub resolved: BTreeMap<String, ResolvedVariable>,
    /// host -> variable -> winner
    pub host_resolved: BTreeMap<String, BTreeMap<String, ResolvedVariable>>,
    pub inventory_vars: VarMap,
    pub group_vars: BTreeMap<String, VarMap>,
    pub host_vars: BTreeMap<String, VarMap>,
    pub extra_vars: VarMap,
}

impl PhaseVariablePlan {
    /// Plan-wide value of a variable.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.resolved.get(name).map(|r| &r.value)
    }

    /// A variable as one host sees it.
    pub fn for_host(&self, host: &str, name: &str) -> Option<&ResolvedVariable> {
        self.host_resolved.get(host).and_then(|vars| vars.get(name))
    }
}

/// Resolve every declared variable for an overlay phase.
///
/// A phase without an overlay section resolves every variable to its
/// student default.
pub fn resolve(spec: &LabSpec, phase: OverlayPhase, opts: &ResolveOptions) -> PhaseVariablePlan {
    let empty = PhaseOverlay::default();
    let overlay = spec.phase_overlays.get(phase).unwrap_or(&empty);

    let plan_groups = plan_group_order(spec, overlay, opts.group_precedence);
    let resolved = spec
        .variable_contracts
        .iter()
        .map(|var| {
            let hosts = spec.topology.node_names();
            let winner = winner(var, overlay, &plan_groups, hosts);
            (var.name.clone(), winner)
        })
        .collect();

    let host_resolved = spec
        .topology
        .nodes
        .iter()
        .map(|node| {
            let groups = node_group_order(&node.groups, opts.group_precedence);
            let vars = spec
                .variable_contracts
                .iter()
                .map(|var| {
                    let winner = winner(var, overlay, &groups, std::iter::once(node.name.as_str()));
                    (var.name.clone(), winner)
                })
                .collect();
            (node.name.clone(), vars)
        })
        .collect();

    log::debug!(
        "Resolved {} variable(s) for {phase} ({:?} group precedence)",
        spec.variable_contracts.len(),
        opts.group_precedence
    );

    PhaseVariablePlan {
        overlay_phase: phase,
        resolved,
        host_resolved,
        inventory_vars: overlay.inventory_vars.clone(),
        group_vars: overlay.group_vars.clone(),
        host_vars: overlay.host_vars.clone(),
        extra_vars: overlay.extra_vars.clone(),
    }
}

/// Walk the layers low to high; the last layer declaring the name wins.
fn winner<'a>(
    var: &VariableContract,
    overlay: &PhaseOverlay,
    groups: &[&str],
    hosts: impl Iterator<Item = &'a str>,
) -> ResolvedVariable {
    let name = var.name.as_str();
    let mut value = &var.defaults.student;
    let mut source = VarSource::Default;

    let layers = std::iter::once((Some(&overlay.inventory_vars), VarSource::InventoryVars))
        .chain(
            groups
                .iter()
                .map(|g| (overlay.group_vars.get(*g), VarSource::GroupVars)),
        )
        .chain(hosts.map(|h| (overlay.host_vars.get(h), VarSource::HostVars)))
        .chain(std::iter::once((Some(&overlay.extra_vars), VarSource::ExtraVars)));

    for (layer, layer_source) in layers {
        if let Some(v) = layer.and_then(|vars| vars.get(name)) {
            value = v;
            source = layer_source;
        }
    }

    ResolvedVariable {
        name: var.name.clone(),
        value: value.clone(),
        source,
    }
}

/// Group application order for one node.
fn node_group_order(groups: &[String], precedence: GroupPrecedence) -> Vec<&str> {
    let mut ordered: Vec<&str> = groups.iter().map(String::as_str).filter(|g| *g != "all").collect();
    if precedence == GroupPrecedence::Alphabetical {
        ordered.sort_unstable();
        ordered.dedup();
    }
    ordered.insert(0, "all");
    ordered
}

/// Group application order for the plan-wide value: every node's groups in
/// topology order, so the last-declared membership wins.
fn plan_group_order<'a>(
    spec: &'a LabSpec,
    overlay: &'a PhaseOverlay,
    precedence: GroupPrecedence,
) -> Vec<&'a str> {
    let mut ordered = vec!["all"];
    match precedence {
        GroupPrecedence::LastDeclared => {
            ordered.extend(
                spec.topology
                    .nodes
                    .iter()
                    .flat_map(|n| n.groups.iter().map(String::as_str))
                    .filter(|g| *g != "all"),
            );
        }
        GroupPrecedence::Alphabetical => {
            // BTreeMap keys are already sorted.
            ordered.extend(
                overlay
                    .group_vars
                    .keys()
                    .map(String::as_str)
                    .filter(|g| *g != "all" && spec.topology.has_group(g)),
            );
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{web_lab, web_lab_with};
    use labspec::Phase;
    use serde_json::json;

    fn resolve_phase(spec: &LabSpec, phase: Phase) -> PhaseVariablePlan {
        resolve(spec, phase.overlay_phase(), &ResolveOptions::default())
    }

    #[test]
    fn test_mutation_extra_vars_beat_group_vars() {
        let spec = web_lab();
        let plan = resolve_phase(&spec, Phase::Mutation);
        let port = &plan.resolved["http_port"];
        assert_eq!(port.value, json!(9090));
        assert_eq!(port.source, VarSource::ExtraVars);
        assert_eq!(plan.for_host("web2", "http_port").unwrap().value, json!(9090));
    }

    #[test]
    fn test_baseline_group_vars_win_over_default() {
        let spec = web_lab();
        let plan = resolve_phase(&spec, Phase::Baseline);
        assert_eq!(plan.resolved["http_port"].source, VarSource::GroupVars);
        assert_eq!(plan.value("http_port"), Some(&json!(8080)));
        // db1 is not in group web, so it only sees the default
        let db = plan.for_host("db1", "http_port").unwrap();
        assert_eq!(db.source, VarSource::Default);
    }

    #[test]
    fn test_host_vars_scoped_to_host() {
        let spec = web_lab();
        let plan = resolve_phase(&spec, Phase::Mutation);
        assert_eq!(plan.for_host("db1", "db_port").unwrap().value, json!(5433));
        assert_eq!(plan.for_host("db1", "db_port").unwrap().source, VarSource::HostVars);
        assert_eq!(plan.for_host("web1", "db_port").unwrap().value, json!(5432));
        assert_eq!(plan.resolved["db_port"].value, json!(5433));
    }

    #[test]
    fn test_each_layer_overrides_the_one_below() {
        let base = web_lab_with(&[(
            "  baseline:\n    group_vars:\n      web: {http_port: 8080}\n",
            "  baseline:\n    inventory_vars: {http_port: 8081}\n    group_vars:\n      web: {http_port: 8082}\n      all: {http_port: 8083}\n",
        )]);
        let plan = resolve_phase(&base, Phase::Baseline);
        // group web beats group all beats inventory
        let web1 = plan.for_host("web1", "http_port").unwrap();
        assert_eq!((web1.value.clone(), web1.source), (json!(8082), VarSource::GroupVars));
        let db1 = plan.for_host("db1", "http_port").unwrap();
        assert_eq!((db1.value.clone(), db1.source), (json!(8083), VarSource::GroupVars));

        let with_host = web_lab_with(&[(
            "      db1: {db_port: 5432}\n  mutation:",
            "      db1: {db_port: 5432}\n      web1: {http_port: 8084}\n  mutation:",
        )]);
        let plan = resolve_phase(&with_host, Phase::Baseline);
        assert_eq!(plan.for_host("web1", "http_port").unwrap().value, json!(8084));
        assert_eq!(plan.for_host("web2", "http_port").unwrap().value, json!(8080));
    }

    #[test]
    fn test_group_tie_break_last_declared_vs_alphabetical() {
        // web1 lists [web, frontend]; both groups set the port
        let spec = web_lab_with(&[(
            "  baseline:\n    group_vars:\n      web: {http_port: 8080}\n",
            "  baseline:\n    group_vars:\n      web: {http_port: 8080}\n      frontend: {http_port: 9090}\n",
        )]);

        let last = resolve(&spec, OverlayPhase::Baseline, &ResolveOptions::default());
        assert_eq!(last.for_host("web1", "http_port").unwrap().value, json!(9090));

        let alpha = resolve(
            &spec,
            OverlayPhase::Baseline,
            &ResolveOptions {
                group_precedence: GroupPrecedence::Alphabetical,
            },
        );
        // frontend < web, so web is applied last
        assert_eq!(alpha.for_host("web1", "http_port").unwrap().value, json!(8080));
        assert_eq!(alpha.resolved["http_port"].value, json!(8080));
    }

    #[test]
    fn test_plan_wide_last_declared_membership_wins() {
        // web2 is declared after web1, so web's value is applied after frontend's
        let spec = web_lab_with(&[(
            "  baseline:\n    group_vars:\n      web: {http_port: 8080}\n",
            "  baseline:\n    group_vars:\n      web: {http_port: 8080}\n      frontend: {http_port: 9090}\n",
        )]);
        let plan = resolve(&spec, OverlayPhase::Baseline, &ResolveOptions::default());
        assert_eq!(plan.resolved["http_port"].value, json!(8080));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let spec = web_lab();
        let a = resolve_phase(&spec, Phase::Mutation);
        let b = resolve_phase(&spec, Phase::Mutation);
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_missing_overlay_uses_defaults() {
        let mut spec = web_lab();
        spec.phase_overlays.mutation = None;
        let plan = resolve(&spec, OverlayPhase::Mutation, &ResolveOptions::default());
        assert_eq!(plan.resolved["http_port"].source, VarSource::Default);
        assert_eq!(plan.resolved["db_port"].value, json!(5432));
        assert!(plan.extra_vars.is_empty());
    }
}
