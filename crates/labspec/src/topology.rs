//! Lab topology: nodes, their groups, and node selectors.

use crate::types::Protocol;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to a set of nodes: exactly one of a host name or a group name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawSelector", into = "RawSelector")]
pub enum NodeSelector {
    Host(String),
    Group(String),
}

impl NodeSelector {
    pub fn host(name: impl Into<String>) -> Self {
        Self::Host(name.into())
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self::Group(name.into())
    }
}

impl fmt::Display for NodeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host(h) => write!(f, "host:{h}"),
            Self::Group(g) => write!(f, "group:{g}"),
        }
    }
}

/// Wire form of a selector (`{host: x}` or `{group: y}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group: Option<String>,
}

impl TryFrom<RawSelector> for NodeSelector {
    type Error = String;

    fn try_from(raw: RawSelector) -> Result<Self, Self::Error> {
        match (raw.host, raw.group) {
            (Some(host), None) => Ok(Self::Host(host)),
            (None, Some(group)) => Ok(Self::Group(group)),
            _ => Err("exactly one of 'host' or 'group' must be specified".to_string()),
        }
    }
}

impl From<NodeSelector> for RawSelector {
    fn from(sel: NodeSelector) -> Self {
        match sel {
            NodeSelector::Host(h) => Self {
                host: Some(h),
                group: None,
            },
            NodeSelector::Group(g) => Self {
                host: None,
                group: Some(g),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResources {
    pub cpu: u32,
    pub ram_mb: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedPort {
    pub host_port: u16,
    pub guest_port: u16,
    pub protocol: Protocol,
}

/// A machine in the lab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Group memberships, in declaration order. Order matters for group_vars precedence.
    pub groups: Vec<String>,
    pub resources: NodeResources,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forwarded_ports: Vec<ForwardedPort>,
}

impl Node {
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    Reachability,
    Ordering,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub from_host: String,
    pub to_host: String,
    pub kind: DependencyKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub nodes: Vec<Node>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forwarded_ports: Vec<ForwardedPort>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
}

impl Topology {
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.node(name).is_some()
    }

    /// Whether any node declares membership of `group`.
    pub fn has_group(&self, group: &str) -> bool {
        self.nodes.iter().any(|n| n.in_group(group))
    }

    /// Node names in declaration order.
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.name.as_str())
    }
}
