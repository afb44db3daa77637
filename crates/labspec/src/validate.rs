//! Semantic validation of a parsed [`LabSpec`].
//!
//! Serde enforces shape; this module enforces everything that needs the
//! whole document: cross references between sections, value ranges, feature
//! gating and string safety for anything that ends up in a shell command on
//! a lab machine.

use crate::contracts::PortRef;
use crate::error::Violation;
use crate::overlays::Trigger;
use crate::spec::LabSpec;
use crate::topology::NodeSelector;
use crate::types::VarType;
use crate::variables::{BindingTarget, OverlayKind};
use regex::Regex;
use std::collections::HashSet;

const ALLOWED_ABSOLUTE_PREFIXES: &[&str] =
    &["/etc/", "/opt/", "/usr/", "/var/", "/tmp/", "/home/", "/srv/"];

const SHELL_METACHARS: &[char] = &[';', '&', '|', '$', '`', '\\'];

/// Identifier rule for node, group, service, user and variable names:
/// a letter followed by up to 63 letters, digits, `_` or `-`.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && s.len() <= 64
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_domain(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 253
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        && !s.starts_with(['.', '-'])
        && !s.ends_with(['.', '-'])
}

fn is_file_mode(s: &str) -> bool {
    (3..=4).contains(&s.len()) && s.chars().all(|c| ('0'..='7').contains(&c))
}

/// Whether `path` is safe to hand to a remote shell: no traversal, no shell
/// metacharacters, and absolute paths only under the usual system prefixes.
pub fn is_safe_path(path: &str) -> bool {
    !path.is_empty()
        && !path.split('/').any(|seg| seg == "..")
        && (!path.starts_with('/') || ALLOWED_ABSOLUTE_PREFIXES.iter().any(|p| path.starts_with(p)))
        && !path.contains(SHELL_METACHARS)
}

/// Like [`is_safe_path`] but the path must be relative to the submission root.
pub fn is_safe_relative_path(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.split('/').any(|seg| seg == "..")
        && !path.contains(SHELL_METACHARS)
}

/// `http://` or `https://` followed by no whitespace or shell metacharacters.
pub fn is_safe_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    rest.is_some_and(|r| {
        !r.is_empty() && !r.contains(|c: char| c.is_whitespace() || matches!(c, ';' | '&' | '|' | '`'))
    })
}

/// Collects violations with their field paths.
#[derive(Default)]
struct Checker {
    violations: Vec<Violation>,
}

impl Checker {
    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.violations.push(Violation {
            field: field.into(),
            message: message.into(),
        });
    }

    fn identifier(&mut self, field: impl Into<String>, value: &str) {
        if !is_identifier(value) {
            self.push(
                field,
                format!(
                    "invalid identifier '{value}' (must start with a letter; letters, digits, '_' or '-', max 64 chars)"
                ),
            );
        }
    }

    fn path(&mut self, field: impl Into<String>, value: &str) {
        if !is_safe_path(value) {
            self.push(field, format!("unsafe path '{value}'"));
        }
    }

    fn relative_path(&mut self, field: impl Into<String>, value: &str) {
        if !is_safe_relative_path(value) {
            self.push(field, format!("expected a safe relative path, got '{value}'"));
        }
    }

    fn pattern(&mut self, field: impl Into<String>, value: &str) {
        if value.is_empty() || value.contains('\0') {
            self.push(field, "pattern must be non-empty and free of null bytes");
        }
    }

    fn regex(&mut self, field: impl Into<String>, value: &str) {
        if let Err(e) = Regex::new(value) {
            self.push(field, format!("invalid regex '{value}': {e}"));
        }
    }

    fn weight(&mut self, field: impl Into<String>, value: f64) {
        if !value.is_finite() || value < 0.0 {
            self.push(field, format!("weight must be a non-negative number, got {value}"));
        }
    }

    fn url(&mut self, field: impl Into<String>, value: &str) {
        if !is_safe_url(value) {
            self.push(field, format!("invalid url '{value}'"));
        }
    }
}

/// Names known to the topology, used to check references.
struct Names<'a> {
    nodes: HashSet<&'a str>,
    groups: HashSet<&'a str>,
    variables: HashSet<&'a str>,
}

impl Names<'_> {
    fn check_selector(&self, c: &mut Checker, field: String, sel: &NodeSelector) {
        match sel {
            NodeSelector::Host(h) if !self.nodes.contains(h.as_str()) => {
                c.push(field, format!("unknown host '{h}' in selector"));
            }
            NodeSelector::Group(g) if !self.groups.contains(g.as_str()) => {
                c.push(field, format!("unknown group '{g}' in selector"));
            }
            NodeSelector::Host(h) | NodeSelector::Group(h) => c.identifier(field, h),
        }
    }

    fn check_port_ref(&self, c: &mut Checker, spec: &LabSpec, field: String, port: &PortRef) {
        match port {
            PortRef::Number(0) => c.push(field, "port must be between 1 and 65535"),
            PortRef::Number(_) => {}
            PortRef::Var { var } => match spec.variable(var) {
                None => c.push(field, format!("references undefined variable '{var}'")),
                Some(v) if v.var_type != VarType::Int => c.push(
                    field,
                    format!("variable '{var}' is used as a port but is not an int"),
                ),
                Some(_) => {}
            },
        }
    }

    fn check_host(&self, c: &mut Checker, field: String, host: &str) {
        if !self.nodes.contains(host) {
            c.push(field, format!("unknown host '{host}'"));
        }
    }
}

/// Run every semantic check over `spec` and return the violations found.
pub fn check(spec: &LabSpec) -> Vec<Violation> {
    let mut c = Checker::default();

    let names = Names {
        nodes: spec.topology.node_names().collect(),
        groups: spec
            .topology
            .nodes
            .iter()
            .flat_map(|n| n.groups.iter().map(String::as_str))
            .collect(),
        variables: spec.variable_contracts.iter().map(|v| v.name.as_str()).collect(),
    };

    c.identifier("assignment_id", &spec.assignment_id);
    if spec.assignment_version.trim().is_empty() {
        c.push("assignment_version", "must not be empty");
    }

    check_topology(&mut c, spec, &names);
    check_entrypoints(&mut c, spec);
    check_variables(&mut c, spec, &names);
    check_precedence(&mut c, spec);
    check_contracts(&mut c, spec, &names);
    check_handlers(&mut c, spec, &names);
    check_overlays(&mut c, spec, &names);

    if spec.idempotence.allowed_changes.iter().any(|t| t.trim().is_empty()) {
        c.push("idempotence.allowed_changes", "task names must not be empty");
    }
    c.weight("idempotence.weight", spec.idempotence.weight);

    if !c.violations.is_empty() {
        log::debug!("Spec validation found {} violation(s)", c.violations.len());
    }
    c.violations
}

fn check_topology(c: &mut Checker, spec: &LabSpec, names: &Names<'_>) {
    let topo = &spec.topology;
    if topo.nodes.is_empty() {
        c.push("topology.nodes", "at least one node is required");
    }
    if let Some(domain) = &topo.domain
        && !is_domain(domain)
    {
        c.push("topology.domain", format!("invalid domain '{domain}'"));
    }

    let mut seen = HashSet::new();
    for (i, node) in topo.nodes.iter().enumerate() {
        let field = format!("topology.nodes[{i}]");
        c.identifier(format!("{field}.name"), &node.name);
        if !seen.insert(node.name.as_str()) {
            c.push(format!("{field}.name"), format!("duplicate node name '{}'", node.name));
        }
        for (j, group) in node.groups.iter().enumerate() {
            c.identifier(format!("{field}.groups[{j}]"), group);
        }
        if !(1..=64).contains(&node.resources.cpu) {
            c.push(format!("{field}.resources.cpu"), "cpu must be between 1 and 64");
        }
        if !(256..=262_144).contains(&node.resources.ram_mb) {
            c.push(
                format!("{field}.resources.ram_mb"),
                "ram_mb must be between 256 and 262144",
            );
        }
        for (j, fp) in node.forwarded_ports.iter().enumerate() {
            if fp.host_port == 0 || fp.guest_port == 0 {
                c.push(format!("{field}.forwarded_ports[{j}]"), "ports must be between 1 and 65535");
            }
        }
    }

    for (i, dep) in topo.dependencies.iter().enumerate() {
        let field = format!("topology.dependencies[{i}]");
        names.check_host(c, format!("{field}.from_host"), &dep.from_host);
        names.check_host(c, format!("{field}.to_host"), &dep.to_host);
    }
}

fn check_entrypoints(c: &mut Checker, spec: &LabSpec) {
    let ep = &spec.entrypoints;
    c.relative_path("entrypoints.playbook_path", &ep.playbook_path);
    for (i, role) in ep.required_roles.iter().enumerate() {
        c.identifier(format!("entrypoints.required_roles[{i}]"), role);
    }
    for (i, file) in ep.required_files.iter().enumerate() {
        c.relative_path(format!("entrypoints.required_files[{i}]"), file);
    }
    for (i, pf) in ep.provided_files.iter().enumerate() {
        c.relative_path(format!("entrypoints.provided_files[{i}].source"), &pf.source);
        c.relative_path(
            format!("entrypoints.provided_files[{i}].destination"),
            &pf.destination,
        );
    }
}

fn check_variables(c: &mut Checker, spec: &LabSpec, names: &Names<'_>) {
    if !spec.variable_contracts.is_empty() && spec.phase_overlays.baseline.is_none() {
        c.push(
            "phase_overlays.baseline",
            "baseline overlay must be defined when variable_contracts exist",
        );
    }

    let mut seen = HashSet::new();
    for (i, var) in spec.variable_contracts.iter().enumerate() {
        let field = format!("variable_contracts[{i}]");
        c.identifier(format!("{field}.name"), &var.name);
        if !seen.insert(var.name.as_str()) {
            c.push(format!("{field}.name"), format!("duplicate variable '{}'", var.name));
        }

        let default = &var.defaults.student;
        if !default.is_null() && !var.var_type.matches(default) {
            c.push(
                format!("{field}.defaults.student"),
                format!("default {default} does not match declared type {:?}", var.var_type),
            );
        }
        for (j, value) in var.allowed_values.iter().enumerate() {
            if !var.var_type.matches(value) {
                c.push(
                    format!("{field}.allowed_values[{j}]"),
                    format!("value {value} does not match declared type {:?}", var.var_type),
                );
            }
        }
        if var.has_bindings() && var.allowed_values.len() < 2 {
            c.push(
                format!("{field}.allowed_values"),
                format!("variable '{}' has bindings but fewer than 2 allowed_values", var.name),
            );
        }

        if var.grading_overlay_targets.is_empty() {
            c.push(
                format!("{field}.grading_overlay_targets"),
                format!("variable '{}' must declare at least one overlay target", var.name),
            );
        }
        for (j, target) in var.grading_overlay_targets.iter().enumerate() {
            let tfield = format!("{field}.grading_overlay_targets[{j}]");
            c.identifier(format!("{tfield}.target_name"), &target.target_name);
            match target.overlay_kind {
                OverlayKind::GroupVars
                    if target.target_name != "all"
                        && !names.groups.contains(target.target_name.as_str()) =>
                {
                    c.push(tfield, format!("overlay targets unknown group '{}'", target.target_name));
                }
                OverlayKind::HostVars if !names.nodes.contains(target.target_name.as_str()) => {
                    c.push(tfield, format!("overlay targets unknown host '{}'", target.target_name));
                }
                _ => {}
            }
        }

        for (j, binding) in var.binding_targets.iter().enumerate() {
            let bfield = format!("{field}.binding_targets[{j}]");
            c.weight(format!("{bfield}.weight"), binding.weight);
            check_binding_target(c, &bfield, &binding.target);
            if binding.target.needs_port() && var.var_type != VarType::Int {
                c.push(
                    bfield,
                    format!("'{}' binding requires an int variable", binding.target.type_name()),
                );
            }
        }

        let overlaid = spec
            .phase_overlays
            .iter()
            .any(|(_, overlay)| overlay.declares(&var.name));
        if var.has_bindings() && !overlaid {
            c.push(
                field,
                format!(
                    "variable '{}' has bindings but is never set in phase_overlays",
                    var.name
                ),
            );
        }
    }

    // Overlay layers may carry undeclared helper variables, but declared ones must type-check.
    for (phase, overlay) in spec.phase_overlays.iter() {
        let layers = std::iter::once(("inventory_vars".to_string(), &overlay.inventory_vars))
            .chain(std::iter::once(("extra_vars".to_string(), &overlay.extra_vars)))
            .chain(overlay.group_vars.iter().map(|(g, v)| (format!("group_vars.{g}"), v)))
            .chain(overlay.host_vars.iter().map(|(h, v)| (format!("host_vars.{h}"), v)));
        for (layer, vars) in layers {
            for (name, value) in vars {
                if let Some(var) = spec.variable(name)
                    && !value.is_null()
                    && !var.var_type.matches(value)
                {
                    c.push(
                        format!("phase_overlays.{phase}.{layer}.{name}"),
                        format!("value {value} does not match declared type {:?}", var.var_type),
                    );
                }
            }
        }
    }
}

fn check_binding_target(c: &mut Checker, field: &str, target: &BindingTarget) {
    match target {
        BindingTarget::ServiceListenPort {
            service, address, ..
        } => {
            c.identifier(format!("{field}.target.service"), service);
            if address.trim().is_empty() {
                c.push(format!("{field}.target.address"), "address must not be empty");
            }
        }
        BindingTarget::FirewallPortOpen { zone, .. } => {
            c.identifier(format!("{field}.target.zone"), zone);
        }
        BindingTarget::TemplateContains { path, pattern }
        | BindingTarget::FileContains { path, pattern } => {
            c.path(format!("{field}.target.path"), path);
            c.pattern(format!("{field}.target.pattern"), pattern);
        }
        BindingTarget::FileExists { path } => c.path(format!("{field}.target.path"), path),
        BindingTarget::FileMode { path, mode } => {
            c.path(format!("{field}.target.path"), path);
            if !is_file_mode(mode) {
                c.push(format!("{field}.target.mode"), format!("invalid octal mode '{mode}'"));
            }
        }
        BindingTarget::FileOwner { path, owner, group } => {
            c.path(format!("{field}.target.path"), path);
            c.identifier(format!("{field}.target.owner"), owner);
            c.identifier(format!("{field}.target.group"), group);
        }
    }
}

fn check_precedence(c: &mut Checker, spec: &LabSpec) {
    for (i, scen) in spec.precedence_scenarios.iter().enumerate() {
        let field = format!("precedence_scenarios[{i}]");
        c.identifier(format!("{field}.name"), &scen.name);
        if scen.layers.len() < 2 {
            c.push(format!("{field}.layers"), "at least two layers are required");
        }
        if !scen.layers.contains(&scen.expected_winner) {
            c.push(
                format!("{field}.expected_winner"),
                "expected_winner must be one of the listed layers",
            );
        }
        match spec.variable(&scen.variable) {
            None => c.push(
                format!("{field}.variable"),
                format!("references unknown variable '{}'", scen.variable),
            ),
            Some(var) => {
                for &idx in &scen.bindings_to_verify {
                    if idx >= var.binding_targets.len() {
                        c.push(
                            format!("{field}.bindings_to_verify"),
                            format!("index {idx} out of range for variable '{}'", var.name),
                        );
                    }
                }
            }
        }
    }
}

fn check_contracts(c: &mut Checker, spec: &LabSpec, names: &Names<'_>) {
    let bc = &spec.behavioral_contracts;
    let base = "behavioral_contracts";

    for (i, p) in bc.packages.iter().enumerate() {
        let field = format!("{base}.packages[{i}]");
        c.identifier(format!("{field}.name"), &p.name);
        names.check_selector(c, format!("{field}.node_selector"), &p.node_selector);
        c.weight(format!("{field}.weight"), p.weight);
    }
    for (i, p) in bc.pip_packages.iter().enumerate() {
        let field = format!("{base}.pip_packages[{i}]");
        if p.name.trim().is_empty() || p.name.contains(char::is_whitespace) {
            c.push(format!("{field}.name"), format!("invalid pip package name '{}'", p.name));
        }
        if let Some(python) = &p.python {
            c.path(format!("{field}.python"), python);
        }
        names.check_selector(c, format!("{field}.node_selector"), &p.node_selector);
        c.weight(format!("{field}.weight"), p.weight);
    }
    for (i, s) in bc.services.iter().enumerate() {
        let field = format!("{base}.services[{i}]");
        c.identifier(format!("{field}.name"), &s.name);
        names.check_selector(c, format!("{field}.node_selector"), &s.node_selector);
        c.weight(format!("{field}.weight"), s.weight);
    }
    for (i, u) in bc.users.iter().enumerate() {
        let field = format!("{base}.users[{i}]");
        c.identifier(format!("{field}.name"), &u.name);
        for (key, path) in [("home", &u.home), ("shell", &u.shell)] {
            if let Some(path) = path {
                c.path(format!("{field}.{key}"), path);
            }
        }
        for (j, g) in u.groups.iter().flatten().enumerate() {
            c.identifier(format!("{field}.groups[{j}]"), g);
        }
        names.check_selector(c, format!("{field}.node_selector"), &u.node_selector);
        c.weight(format!("{field}.weight"), u.weight);
    }
    for (i, g) in bc.groups.iter().enumerate() {
        let field = format!("{base}.groups[{i}]");
        c.identifier(format!("{field}.name"), &g.name);
        names.check_selector(c, format!("{field}.node_selector"), &g.node_selector);
        c.weight(format!("{field}.weight"), g.weight);
    }
    for (i, fw) in bc.firewall.iter().enumerate() {
        let field = format!("{base}.firewall[{i}]");
        for (j, port) in fw.open_ports.iter().enumerate() {
            names.check_port_ref(c, spec, format!("{field}.open_ports[{j}].port"), &port.port);
            c.identifier(format!("{field}.open_ports[{j}].zone"), &port.zone);
        }
        names.check_selector(c, format!("{field}.node_selector"), &fw.node_selector);
        c.weight(format!("{field}.weight"), fw.weight);
    }
    for (i, files) in bc.files.iter().enumerate() {
        let field = format!("{base}.files[{i}]");
        for (j, item) in files.items.iter().enumerate() {
            let ifield = format!("{field}.items[{j}]");
            c.path(format!("{ifield}.path"), &item.path);
            if let Some(mode) = &item.mode
                && !is_file_mode(mode)
            {
                c.push(format!("{ifield}.mode"), format!("invalid octal mode '{mode}'"));
            }
            if let Some(owner) = &item.owner {
                c.identifier(format!("{ifield}.owner"), owner);
            }
            if let Some(group) = &item.group {
                c.identifier(format!("{ifield}.group"), group);
            }
            if let Some(re) = &item.content_regex {
                c.regex(format!("{ifield}.content_regex"), re);
            }
        }
        names.check_selector(c, format!("{field}.node_selector"), &files.node_selector);
        c.weight(format!("{field}.weight"), files.weight);
    }

    if !bc.reachability.is_empty() && !spec.features.reachability {
        c.push(
            format!("{base}.reachability"),
            "reachability contracts present but features.reachability is false",
        );
    }
    for (i, r) in bc.reachability.iter().enumerate() {
        let field = format!("{base}.reachability[{i}]");
        names.check_host(c, format!("{field}.from_host"), &r.from_host);
        names.check_host(c, format!("{field}.to_host"), &r.to_host);
        names.check_port_ref(c, spec, format!("{field}.port"), &r.port);
        c.weight(format!("{field}.weight"), r.weight);
    }

    for (i, h) in bc.http_endpoints.iter().enumerate() {
        let field = format!("{base}.http_endpoints[{i}]");
        check_http(
            c,
            &field,
            &h.url,
            h.expected_status,
            h.timeout_seconds,
            h.response_regex.as_deref(),
            h.response_contains.as_deref(),
        );
        names.check_selector(c, format!("{field}.node_selector"), &h.node_selector);
        c.weight(format!("{field}.weight"), h.weight);
    }
    for (i, h) in bc.external_http.iter().enumerate() {
        let field = format!("{base}.external_http[{i}]");
        check_http(
            c,
            &field,
            &h.url,
            h.expected_status,
            h.timeout_seconds,
            h.response_regex.as_deref(),
            h.response_contains.as_deref(),
        );
        match (&h.from_node, h.from_host) {
            (Some(_), true) => c.push(field.clone(), "cannot set both from_host and from_node"),
            (None, false) => c.push(field.clone(), "must set either from_host or from_node"),
            (Some(sel), false) => names.check_selector(c, format!("{field}.from_node"), sel),
            (None, true) => {}
        }
        c.weight(format!("{field}.weight"), h.weight);
    }

    for (i, out) in bc.output_checks.iter().enumerate() {
        let field = format!("{base}.output_checks[{i}]");
        c.pattern(format!("{field}.pattern"), &out.pattern);
        if out.match_type == crate::contracts::MatchType::Regex {
            c.regex(format!("{field}.pattern"), &out.pattern);
        }
        c.weight(format!("{field}.weight"), out.weight);
    }
}

fn check_http(
    c: &mut Checker,
    field: &str,
    url: &str,
    status: u16,
    timeout: u32,
    response_regex: Option<&str>,
    response_contains: Option<&str>,
) {
    c.url(format!("{field}.url"), url);
    if !(100..=599).contains(&status) {
        c.push(format!("{field}.expected_status"), "status must be between 100 and 599");
    }
    if !(1..=60).contains(&timeout) {
        c.push(format!("{field}.timeout_seconds"), "timeout must be between 1 and 60 seconds");
    }
    if let Some(re) = response_regex {
        c.regex(format!("{field}.response_regex"), re);
    }
    if let Some(text) = response_contains {
        c.pattern(format!("{field}.response_contains"), text);
    }
}

fn check_handlers(c: &mut Checker, spec: &LabSpec, names: &Names<'_>) {
    if !spec.handler_contracts.is_empty() && !spec.features.handlers {
        c.push(
            "handler_contracts",
            "handler contracts present but features.handlers is false",
        );
    }
    let mut seen = HashSet::new();
    for (i, h) in spec.handler_contracts.iter().enumerate() {
        let field = format!("handler_contracts[{i}]");
        if h.handler_name.trim().is_empty() {
            c.push(format!("{field}.handler_name"), "must not be empty");
        }
        if !seen.insert(h.handler_name.as_str()) {
            c.push(
                format!("{field}.handler_name"),
                format!("duplicate handler '{}'", h.handler_name),
            );
        }
        names.check_selector(c, format!("{field}.node_selector"), &h.node_selector);
        c.identifier(format!("{field}.handler_target.service"), &h.handler_target.service);
        for (j, trigger) in h.trigger_conditions.iter().enumerate() {
            let tfield = format!("{field}.trigger_conditions[{j}]");
            match trigger {
                Trigger::VariableChanged { variable_changed } => {
                    if !names.variables.contains(variable_changed.as_str()) {
                        c.push(
                            tfield,
                            format!(
                                "handler '{}' trigger references undefined variable '{variable_changed}'",
                                h.handler_name
                            ),
                        );
                    }
                }
                Trigger::FileChanged { file_changed: path }
                | Trigger::TemplateChanged {
                    template_changed: path,
                } => c.path(tfield, path),
            }
        }
        c.weight(format!("{field}.weight"), h.weight);
    }
}

fn check_overlays(c: &mut Checker, spec: &LabSpec, names: &Names<'_>) {
    for (phase, overlay) in spec.phase_overlays.iter() {
        let field = format!("phase_overlays.{phase}");

        if let Some(reboot) = &overlay.reboot {
            for (i, node) in reboot.nodes.iter().flatten().enumerate() {
                if !names.nodes.contains(node.as_str()) {
                    c.push(
                        format!("{field}.reboot.nodes[{i}]"),
                        format!("reboot references unknown node '{node}'"),
                    );
                }
            }
            if !(30..=600).contains(&reboot.timeout) {
                c.push(
                    format!("{field}.reboot.timeout"),
                    "reboot timeout must be between 30 and 600 seconds",
                );
            }
            if !(1..=30).contains(&reboot.poll_interval) {
                c.push(
                    format!("{field}.reboot.poll_interval"),
                    "poll interval must be between 1 and 30 seconds",
                );
            }
        }

        if let Some(policy) = &overlay.failure_policy {
            if policy.max_failures.is_some() && !policy.allow_failures {
                c.push(
                    format!("{field}.failure_policy.max_failures"),
                    "max_failures requires allow_failures",
                );
            }
            for (i, pattern) in policy.expected_patterns.iter().enumerate() {
                c.regex(format!("{field}.failure_policy.expected_patterns[{i}]"), pattern);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpecError;
    use crate::fixtures::WEB_LAB;

    fn violations_for(yaml: &str) -> Vec<Violation> {
        match LabSpec::from_yaml_str(yaml) {
            Err(SpecError::Invalid(v)) => v,
            Err(other) => panic!("expected validation failure, got {other}"),
            Ok(_) => panic!("expected validation failure, spec was accepted"),
        }
    }

    fn has(violations: &[Violation], needle: &str) -> bool {
        violations.iter().any(|v| v.to_string().contains(needle))
    }

    #[test]
    fn test_fixture_is_valid() {
        let spec: LabSpec = serde_yaml::from_str(WEB_LAB).unwrap();
        assert_eq!(check(&spec), Vec::new());
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_identifier("web-1_a"));
        assert!(!is_identifier("1web"));
        assert!(!is_identifier("web;rm"));
        assert!(!is_identifier(&"a".repeat(65)));
    }

    #[test]
    fn test_path_rules() {
        assert!(is_safe_path("/etc/nginx/nginx.conf"));
        assert!(is_safe_path("templates/app.j2"));
        assert!(!is_safe_path("/root/.ssh/id_rsa"));
        assert!(!is_safe_path("/etc/../root"));
        assert!(!is_safe_path("/etc/x;reboot"));
        assert!(is_safe_relative_path("site.yml"));
        assert!(!is_safe_relative_path("/etc/site.yml"));
    }

    #[test]
    fn test_url_rules() {
        assert!(is_safe_url("http://web1:8080/health"));
        assert!(!is_safe_url("ftp://web1/"));
        assert!(!is_safe_url("http://web1/`id`"));
    }

    #[test]
    fn test_duplicate_node_names() {
        let yaml = WEB_LAB.replace("name: web2", "name: web1");
        assert!(has(&violations_for(&yaml), "duplicate node name 'web1'"));
    }

    #[test]
    fn test_unknown_selector_group() {
        let yaml = WEB_LAB.replace("node_selector: {group: web}", "node_selector: {group: cache}");
        assert!(has(&violations_for(&yaml), "unknown group 'cache'"));
    }

    #[test]
    fn test_undefined_port_variable() {
        let yaml = WEB_LAB.replace("port: {var: db_port}", "port: {var: pg_port}");
        assert!(has(&violations_for(&yaml), "undefined variable 'pg_port'"));
    }

    #[test]
    fn test_reboot_range_and_node() {
        let yaml = WEB_LAB
            .replace("nodes: [db1]", "nodes: [db9]")
            .replace("timeout: 60", "timeout: 10");
        let v = violations_for(&yaml);
        assert!(has(&v, "unknown node 'db9'"));
        assert!(has(&v, "between 30 and 600"));
    }

    #[test]
    fn test_max_failures_requires_allow_failures() {
        let yaml = WEB_LAB.replace("allow_failures: true", "allow_failures: false");
        assert!(has(&violations_for(&yaml), "max_failures requires allow_failures"));
    }

    #[test]
    fn test_bad_failure_pattern() {
        let yaml = WEB_LAB.replace("expected_patterns: [refused]", "expected_patterns: [\"(\"]");
        assert!(has(&violations_for(&yaml), "invalid regex"));
    }

    #[test]
    fn test_reachability_feature_gate() {
        let yaml = WEB_LAB.replace("reachability: true", "reachability: false");
        assert!(has(&violations_for(&yaml), "features.reachability is false"));
    }

    #[test]
    fn test_bound_variable_must_be_overlaid() {
        let yaml = WEB_LAB.replace("db_port: 5432", "other: 1").replace("db_port: 5433", "other: 2");
        assert!(has(
            &violations_for(&yaml),
            "'db_port' has bindings but is never set in phase_overlays"
        ));
    }

    #[test]
    fn test_overlay_value_type_mismatch() {
        let yaml = WEB_LAB.replace("http_port: 9090", "http_port: \"9090\"");
        assert!(has(&violations_for(&yaml), "phase_overlays.mutation.extra_vars.http_port"));
    }

    #[test]
    fn test_reports_every_violation() {
        let yaml = WEB_LAB
            .replace("name: web2", "name: web1")
            .replace("timeout: 60", "timeout: 10");
        assert!(violations_for(&yaml).len() >= 2);
    }
}
