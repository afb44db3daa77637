//! Contract plan builder: expands assertions and variable bindings into
//! host-targeted checks for one phase.
//!
//! Every check is a [`ContractCheck`] envelope (id, hosts, weight) around a
//! closed [`CheckKind`] union. Ids are derived from the assertion's position
//! in the spec, so the same assertion has the same id in every phase.

use crate::error::{GradeError, Result};
use crate::selector::{hosts_in_groups, resolve_selector};
use crate::variables::PhaseVariablePlan;
use labspec::contracts::{
    FileItem, FirewallType, HttpMethod, MatchType, PackageState, ReachabilityExpectation,
};
use labspec::overlays::{ExpectedRunsSet, HandlerAction, NonTrigger, Trigger};
use labspec::{
    BindingTarget, LabSpec, OverlayKind, Phase, PortRef, Protocol, VariableContract,
    applies_to_phase,
};
use serde::Serialize;
use serde_json::Value;

/// Host name used for checks evaluated on the grading machine itself.
pub const GRADING_HOST: &str = "localhost";

/// How a package is looked up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageManager {
    System,
    Pip { python: Option<String> },
}

/// Where an HTTP probe is sent from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpOrigin {
    /// From each target node
    Nodes,
    /// From the machine running the grader
    GradingHost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPort {
    pub port: u16,
    pub protocol: Protocol,
    pub zone: String,
}

/// What a check asserts. Exhaustive; the orchestrator dispatches on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckKind {
    /// A variable's value shows up in an observable property
    Binding {
        variable: String,
        binding_index: usize,
        expected: Value,
        /// Target with `{{ value }}` already substituted in patterns
        target: BindingTarget,
        /// Expected port, for port-valued targets
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
    Package {
        name: String,
        state: PackageState,
        manager: PackageManager,
    },
    Service {
        name: String,
        enabled: bool,
        running: bool,
    },
    User {
        name: String,
        exists: bool,
        uid: Option<u32>,
        gid: Option<u32>,
        home: Option<String>,
        shell: Option<String>,
        groups: Option<Vec<String>>,
    },
    Group {
        name: String,
        exists: bool,
        gid: Option<u32>,
    },
    Firewall {
        ports: Vec<ResolvedPort>,
        firewall_type: FirewallType,
    },
    File {
        items: Vec<FileItem>,
    },
    Reachability {
        to_host: String,
        port: u16,
        protocol: Protocol,
        expectation: ReachabilityExpectation,
    },
    Http {
        origin: HttpOrigin,
        url: String,
        method: HttpMethod,
        expected_status: u16,
        response_contains: Option<String>,
        response_regex: Option<String>,
        timeout_seconds: u32,
    },
    Output {
        pattern: String,
        match_type: MatchType,
        expected: bool,
        description: Option<String>,
    },
    Handler {
        handler_name: String,
        service: String,
        action: HandlerAction,
        expected_runs: ExpectedRunsSet,
        triggers: Vec<Trigger>,
        non_triggers: Vec<NonTrigger>,
    },
    /// Implicit "re-running changes nothing" check for the idempotence phase
    Idempotence {
        allowed_changes: Vec<String>,
        require_changed_zero: bool,
        require_no_handlers: bool,
    },
}

/// How a check gets evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// From the converge record and handler history
    Local,
    /// From host snapshots
    Snapshot,
    /// By the verification runner on the target host
    Remote,
}

impl CheckKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Binding { .. } => "binding",
            Self::Package { .. } => "package",
            Self::Service { .. } => "service",
            Self::User { .. } => "user",
            Self::Group { .. } => "group",
            Self::Firewall { .. } => "firewall",
            Self::File { .. } => "file",
            Self::Reachability { .. } => "reachability",
            Self::Http { .. } => "http",
            Self::Output { .. } => "output",
            Self::Handler { .. } => "handler",
            Self::Idempotence { .. } => "idempotence",
        }
    }

    pub fn evaluation(&self) -> Evaluation {
        match self {
            Self::Output { .. } | Self::Handler { .. } | Self::Idempotence { .. } => {
                Evaluation::Local
            }
            Self::Binding { .. } | Self::File { .. } | Self::Firewall { .. } | Self::Service { .. } => {
                Evaluation::Snapshot
            }
            Self::Package { .. }
            | Self::User { .. }
            | Self::Group { .. }
            | Self::Reachability { .. }
            | Self::Http { .. } => Evaluation::Remote,
        }
    }
}

/// A check bound to the hosts it runs against.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContractCheck {
    pub id: String,
    /// Never empty; [`GRADING_HOST`] for checks evaluated on the grading machine
    pub host_targets: Vec<String>,
    pub weight: f64,
    #[serde(flatten)]
    pub kind: CheckKind,
}

/// The checks that apply to one phase, in build order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseContractPlan {
    pub phase: Phase,
    pub checks: Vec<ContractCheck>,
}

impl PhaseContractPlan {
    pub fn total_weight(&self) -> f64 {
        self.checks.iter().map(|c| c.weight).sum()
    }

    pub fn get(&self, id: &str) -> Option<&ContractCheck> {
        self.checks.iter().find(|c| c.id == id)
    }
}

/// Build the contract plan for `phase` from the phase's variable resolution.
///
/// Fails with a resolution error when a bound or referenced variable has no
/// usable value on some target host.
pub fn build(spec: &LabSpec, phase: Phase, vars: &PhaseVariablePlan) -> Result<PhaseContractPlan> {
    let mut builder = Builder {
        spec,
        phase,
        vars,
        checks: Vec::new(),
    };

    for var in &spec.variable_contracts {
        builder.bindings(var)?;
    }
    builder.behavioral()?;
    builder.handlers();

    let policy = &spec.idempotence;
    if phase == Phase::Idempotence && policy.required {
        builder.checks.push(ContractCheck {
            id: "idempotence".to_string(),
            host_targets: vec![GRADING_HOST.to_string()],
            weight: policy.weight,
            kind: CheckKind::Idempotence {
                allowed_changes: policy.allowed_changes.clone(),
                require_changed_zero: policy.enforcement.require_changed_zero,
                require_no_handlers: policy.enforcement.require_no_handlers,
            },
        });
    }

    // Empty selectors produce no check rather than an unsatisfiable one.
    builder.checks.retain(|c| !c.host_targets.is_empty());

    log::debug!(
        "Built {} check(s) for {phase} (total weight {})",
        builder.checks.len(),
        builder.checks.iter().map(|c| c.weight).sum::<f64>()
    );

    Ok(PhaseContractPlan {
        phase,
        checks: builder.checks,
    })
}

struct Builder<'a> {
    spec: &'a LabSpec,
    phase: Phase,
    vars: &'a PhaseVariablePlan,
    checks: Vec<ContractCheck>,
}

impl Builder<'_> {
    fn push(&mut self, id: String, host_targets: Vec<String>, weight: f64, kind: CheckKind) {
        self.checks.push(ContractCheck {
            id,
            host_targets,
            weight,
            kind,
        });
    }

    /// A host's value for a variable, rejecting missing and null values.
    fn host_value(&self, host: &str, name: &str) -> Result<&Value> {
        match self.vars.for_host(host, name) {
            Some(r) if !r.value.is_null() => Ok(&r.value),
            Some(_) => Err(self.unresolved(name, format!("value is null on host {host}"))),
            None => Err(self.unresolved(name, format!("not resolved for host {host}"))),
        }
    }

    fn host_port(&self, host: &str, port: &PortRef) -> Result<u16> {
        match port {
            PortRef::Number(n) => Ok(*n),
            PortRef::Var { var } => {
                let value = self.host_value(host, var)?;
                as_port(value).ok_or_else(|| {
                    self.unresolved(var, format!("value {value} on host {host} is not a valid port"))
                })
            }
        }
    }

    fn unresolved(&self, variable: &str, message: String) -> GradeError {
        GradeError::Resolution {
            variable: variable.to_string(),
            phase: self.phase,
            message,
        }
    }

    /// Hosts a binding is checked on: the most specific overlay targets.
    fn binding_hosts(&self, var: &VariableContract) -> Vec<String> {
        let topology = &self.spec.topology;
        let host_targets: Vec<String> = topology
            .nodes
            .iter()
            .filter(|n| var.targets_of(OverlayKind::HostVars).any(|h| h == n.name))
            .map(|n| n.name.clone())
            .collect();
        if !host_targets.is_empty() {
            return host_targets;
        }
        let groups: Vec<&str> = var.targets_of(OverlayKind::GroupVars).collect();
        if !groups.is_empty() {
            return hosts_in_groups(topology, groups);
        }
        topology.nodes.iter().map(|n| n.name.clone()).collect()
    }

    fn bindings(&mut self, var: &VariableContract) -> Result<()> {
        if !var.has_bindings() {
            return Ok(());
        }
        let hosts = self.binding_hosts(var);

        // Group hosts by the value they resolve to, first-seen order.
        let mut groups: Vec<(Value, Vec<String>)> = Vec::new();
        for host in &hosts {
            let value = self.host_value(host, &var.name)?.clone();
            match groups.iter_mut().find(|(v, _)| *v == value) {
                Some((_, members)) => members.push(host.clone()),
                None => groups.push((value, vec![host.clone()])),
            }
        }

        for (index, binding) in var.binding_targets.iter().enumerate() {
            let fan_out = groups.len() > 1;
            for (n, (value, members)) in groups.iter().enumerate() {
                let port = if binding.target.needs_port() {
                    let port = as_port(value).ok_or_else(|| {
                        self.unresolved(&var.name, format!("value {value} is not a valid port"))
                    })?;
                    Some(port)
                } else {
                    None
                };
                let id = if fan_out {
                    format!("binding:{}:{index}:{n}", var.name)
                } else {
                    format!("binding:{}:{index}", var.name)
                };
                self.push(
                    id,
                    members.clone(),
                    binding.weight,
                    CheckKind::Binding {
                        variable: var.name.clone(),
                        binding_index: index,
                        expected: value.clone(),
                        target: substitute(&binding.target, value),
                        port,
                    },
                );
            }
        }
        Ok(())
    }

    fn behavioral(&mut self) -> Result<()> {
        let spec = self.spec;
        let topo = &spec.topology;
        let bc = &spec.behavioral_contracts;
        let phase = self.phase;

        for (i, p) in bc.packages.iter().enumerate() {
            if applies_to_phase(p.phases.as_deref(), phase) {
                self.push(
                    format!("package:{i}:{}", p.name),
                    resolve_selector(topo, &p.node_selector),
                    p.weight,
                    CheckKind::Package {
                        name: p.name.clone(),
                        state: p.state,
                        manager: PackageManager::System,
                    },
                );
            }
        }
        for (i, p) in bc.pip_packages.iter().enumerate() {
            if applies_to_phase(p.phases.as_deref(), phase) {
                self.push(
                    format!("pip_package:{i}:{}", p.name),
                    resolve_selector(topo, &p.node_selector),
                    p.weight,
                    CheckKind::Package {
                        name: p.name.clone(),
                        state: p.state,
                        manager: PackageManager::Pip {
                            python: p.python.clone(),
                        },
                    },
                );
            }
        }
        for (i, s) in bc.services.iter().enumerate() {
            if applies_to_phase(s.phases.as_deref(), phase) {
                self.push(
                    format!("service:{i}:{}", s.name),
                    resolve_selector(topo, &s.node_selector),
                    s.weight,
                    CheckKind::Service {
                        name: s.name.clone(),
                        enabled: s.enabled,
                        running: s.running,
                    },
                );
            }
        }
        for (i, u) in bc.users.iter().enumerate() {
            if applies_to_phase(u.phases.as_deref(), phase) {
                self.push(
                    format!("user:{i}:{}", u.name),
                    resolve_selector(topo, &u.node_selector),
                    u.weight,
                    CheckKind::User {
                        name: u.name.clone(),
                        exists: u.exists,
                        uid: u.uid,
                        gid: u.gid,
                        home: u.home.clone(),
                        shell: u.shell.clone(),
                        groups: u.groups.clone(),
                    },
                );
            }
        }
        for (i, g) in bc.groups.iter().enumerate() {
            if applies_to_phase(g.phases.as_deref(), phase) {
                self.push(
                    format!("group:{i}:{}", g.name),
                    resolve_selector(topo, &g.node_selector),
                    g.weight,
                    CheckKind::Group {
                        name: g.name.clone(),
                        exists: g.exists,
                        gid: g.gid,
                    },
                );
            }
        }
        for (i, fw) in bc.firewall.iter().enumerate() {
            if !applies_to_phase(fw.phases.as_deref(), phase) {
                continue;
            }
            // Ports may resolve differently per host; one check per distinct port set.
            let mut groups: Vec<(Vec<ResolvedPort>, Vec<String>)> = Vec::new();
            for host in resolve_selector(topo, &fw.node_selector) {
                let ports = fw
                    .open_ports
                    .iter()
                    .map(|p| {
                        Ok(ResolvedPort {
                            port: self.host_port(&host, &p.port)?,
                            protocol: p.protocol,
                            zone: p.zone.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                match groups.iter_mut().find(|(p, _)| *p == ports) {
                    Some((_, members)) => members.push(host),
                    None => groups.push((ports, vec![host])),
                }
            }
            let fan_out = groups.len() > 1;
            for (n, (ports, members)) in groups.into_iter().enumerate() {
                let id = if fan_out {
                    format!("firewall:{i}:{n}")
                } else {
                    format!("firewall:{i}")
                };
                self.push(
                    id,
                    members,
                    fw.weight,
                    CheckKind::Firewall {
                        ports,
                        firewall_type: fw.firewall_type,
                    },
                );
            }
        }
        for (i, f) in bc.files.iter().enumerate() {
            if applies_to_phase(f.phases.as_deref(), phase) {
                self.push(
                    format!("files:{i}"),
                    resolve_selector(topo, &f.node_selector),
                    f.weight,
                    CheckKind::File {
                        items: f.items.clone(),
                    },
                );
            }
        }
        for (i, r) in bc.reachability.iter().enumerate() {
            if applies_to_phase(r.phases.as_deref(), phase) {
                // The listening side decides the port.
                let port = self.host_port(&r.to_host, &r.port)?;
                self.push(
                    format!("reachability:{i}:{}->{}", r.from_host, r.to_host),
                    vec![r.from_host.clone()],
                    r.weight,
                    CheckKind::Reachability {
                        to_host: r.to_host.clone(),
                        port,
                        protocol: r.protocol,
                        expectation: r.expectation,
                    },
                );
            }
        }
        for (i, h) in bc.http_endpoints.iter().enumerate() {
            if applies_to_phase(h.phases.as_deref(), phase) {
                self.push(
                    format!("http:{i}"),
                    resolve_selector(topo, &h.node_selector),
                    h.weight,
                    CheckKind::Http {
                        origin: HttpOrigin::Nodes,
                        url: h.url.clone(),
                        method: h.method,
                        expected_status: h.expected_status,
                        response_contains: h.response_contains.clone(),
                        response_regex: h.response_regex.clone(),
                        timeout_seconds: h.timeout_seconds,
                    },
                );
            }
        }
        for (i, h) in bc.external_http.iter().enumerate() {
            if !applies_to_phase(h.phases.as_deref(), phase) {
                continue;
            }
            let (origin, hosts) = match &h.from_node {
                Some(sel) if !h.from_host => (HttpOrigin::Nodes, resolve_selector(topo, sel)),
                _ => (HttpOrigin::GradingHost, vec![GRADING_HOST.to_string()]),
            };
            self.push(
                format!("external_http:{i}"),
                hosts,
                h.weight,
                CheckKind::Http {
                    origin,
                    url: h.url.clone(),
                    method: h.method,
                    expected_status: h.expected_status,
                    response_contains: h.response_contains.clone(),
                    response_regex: h.response_regex.clone(),
                    timeout_seconds: h.timeout_seconds,
                },
            );
        }
        for (i, o) in bc.output_checks.iter().enumerate() {
            if applies_to_phase(o.phases.as_deref(), phase) {
                self.push(
                    format!("output:{i}"),
                    vec![GRADING_HOST.to_string()],
                    o.weight,
                    CheckKind::Output {
                        pattern: o.pattern.clone(),
                        match_type: o.match_type,
                        expected: o.expected,
                        description: o.description.clone(),
                    },
                );
            }
        }
        Ok(())
    }

    /// Handler checks carry the whole expectation table and apply to every phase.
    fn handlers(&mut self) {
        let spec = self.spec;
        for (i, h) in spec.handler_contracts.iter().enumerate() {
            self.push(
                format!("handler:{i}"),
                resolve_selector(&spec.topology, &h.node_selector),
                h.weight,
                CheckKind::Handler {
                    handler_name: h.handler_name.clone(),
                    service: h.handler_target.service.clone(),
                    action: h.handler_target.action,
                    expected_runs: h.expected_runs,
                    triggers: h.trigger_conditions.clone(),
                    non_triggers: h.non_trigger_conditions.clone(),
                },
            );
        }
    }
}

/// A port number from a dynamic value (integers or numeric strings).
fn as_port(value: &Value) -> Option<u16> {
    let n = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    u16::try_from(n).ok().filter(|p| *p != 0)
}

/// Text form of a value as it appears in rendered files.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace `{{ value }}` in a binding's pattern with the expected value.
fn substitute(target: &BindingTarget, value: &Value) -> BindingTarget {
    let text = display_value(value);
    let render = |pattern: &str| pattern.replace("{{ value }}", &text).replace("{{value}}", &text);
    match target {
        BindingTarget::TemplateContains { path, pattern } => BindingTarget::TemplateContains {
            path: path.clone(),
            pattern: render(pattern),
        },
        BindingTarget::FileContains { path, pattern } => BindingTarget::FileContains {
            path: path.clone(),
            pattern: render(pattern),
        },
        other => other.clone(),
    }
}
