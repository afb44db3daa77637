//! Behavioral contracts: assertions about the state of the converged machines.

use crate::topology::NodeSelector;
use crate::types::{Phase, Protocol, default_weight};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A port given either literally or by reference to a declared variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortRef {
    Number(u16),
    Var { var: String },
}

impl PortRef {
    /// Referenced variable name, if this is not a literal.
    pub fn var(&self) -> Option<&str> {
        match self {
            Self::Number(_) => None,
            Self::Var { var } => Some(var),
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Var { var } => write!(f, "{{var: {var}}}"),
        }
    }
}

/// Whether an assertion with the given `phases` list applies in `phase`.
/// No list means every phase.
pub fn applies_to_phase(phases: Option<&[Phase]>, phase: Phase) -> bool {
    phases.is_none_or(|list| list.contains(&phase))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageState {
    #[default]
    Present,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageContract {
    pub name: String,
    pub state: PackageState,
    pub node_selector: NodeSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases: Option<Vec<Phase>>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipPackageContract {
    pub name: String,
    #[serde(default)]
    pub state: PackageState,
    /// Interpreter to query; the probe falls back to `python3`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python: Option<String>,
    pub node_selector: NodeSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases: Option<Vec<Phase>>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceContract {
    pub name: String,
    pub enabled: bool,
    pub running: bool,
    pub node_selector: NodeSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases: Option<Vec<Phase>>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_exists() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContract {
    pub name: String,
    #[serde(default = "default_exists")]
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
    pub node_selector: NodeSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases: Option<Vec<Phase>>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupContract {
    pub name: String,
    #[serde(default = "default_exists")]
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    pub node_selector: NodeSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases: Option<Vec<Phase>>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallPort {
    pub port: PortRef,
    pub protocol: Protocol,
    pub zone: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallType {
    #[default]
    Firewalld,
    Iptables,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallContract {
    pub open_ports: Vec<FirewallPort>,
    pub node_selector: NodeSelector,
    #[serde(default)]
    pub firewall_type: FirewallType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases: Option<Vec<Phase>>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileItem {
    pub path: String,
    pub present: bool,
    #[serde(default)]
    pub is_directory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_regex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesContract {
    pub items: Vec<FileItem>,
    pub node_selector: NodeSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases: Option<Vec<Phase>>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReachabilityExpectation {
    Reachable,
    NotReachable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReachabilityContract {
    pub from_host: String,
    pub to_host: String,
    pub protocol: Protocol,
    pub port: PortRef,
    pub expectation: ReachabilityExpectation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases: Option<Vec<Phase>>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Head,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
        }
    }
}

fn default_status() -> u16 {
    200
}

fn default_http_timeout() -> u32 {
    5
}

fn default_external_timeout() -> u32 {
    10
}

/// HTTP endpoint probed from the selected nodes themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpEndpointContract {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default = "default_status")]
    pub expected_status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_regex: Option<String>,
    #[serde(default = "default_http_timeout")]
    pub timeout_seconds: u32,
    pub node_selector: NodeSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases: Option<Vec<Phase>>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

/// HTTP endpoint probed either from the grading host or from another node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalHttpContract {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default = "default_status")]
    pub expected_status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_regex: Option<String>,
    #[serde(default = "default_external_timeout")]
    pub timeout_seconds: u32,
    #[serde(default)]
    pub from_host: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_node: Option<NodeSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases: Option<Vec<Phase>>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    #[default]
    Contains,
    Regex,
}

/// Assertion over the converge output text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputContract {
    pub pattern: String,
    #[serde(default)]
    pub match_type: MatchType,
    #[serde(default = "crate::types::default_true")]
    pub expected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases: Option<Vec<Phase>>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

/// All behavioral assertions of a lab, grouped by kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BehavioralContracts {
    #[serde(default)]
    pub packages: Vec<PackageContract>,
    #[serde(default)]
    pub pip_packages: Vec<PipPackageContract>,
    #[serde(default)]
    pub services: Vec<ServiceContract>,
    #[serde(default)]
    pub users: Vec<UserContract>,
    #[serde(default)]
    pub groups: Vec<GroupContract>,
    #[serde(default)]
    pub firewall: Vec<FirewallContract>,
    #[serde(default)]
    pub files: Vec<FilesContract>,
    #[serde(default)]
    pub reachability: Vec<ReachabilityContract>,
    #[serde(default)]
    pub http_endpoints: Vec<HttpEndpointContract>,
    #[serde(default)]
    pub external_http: Vec<ExternalHttpContract>,
    #[serde(default)]
    pub output_checks: Vec<OutputContract>,
}
