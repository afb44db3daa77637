//! Variable contracts: declared variables, where the grader overlays them,
//! and which observable system properties they must drive.

use crate::types::{OverlayPhase, Protocol, VarType, default_weight};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Where a graded value may be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayKind {
    InventoryVars,
    GroupVars,
    HostVars,
    ExtraVars,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayTarget {
    pub overlay_kind: OverlayKind,
    pub target_name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingsMode {
    #[default]
    All,
    Any,
}

/// Observable property a variable's value must show up in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum BindingTarget {
    ServiceListenPort {
        service: String,
        protocol: Protocol,
        #[serde(default = "default_listen_address")]
        address: String,
    },
    FirewallPortOpen {
        zone: String,
        protocol: Protocol,
    },
    TemplateContains {
        path: String,
        pattern: String,
    },
    FileContains {
        path: String,
        pattern: String,
    },
    FileExists {
        path: String,
    },
    FileMode {
        path: String,
        mode: String,
    },
    FileOwner {
        path: String,
        owner: String,
        group: String,
    },
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

impl BindingTarget {
    /// Snake-case binding type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ServiceListenPort { .. } => "service_listen_port",
            Self::FirewallPortOpen { .. } => "firewall_port_open",
            Self::TemplateContains { .. } => "template_contains",
            Self::FileContains { .. } => "file_contains",
            Self::FileExists { .. } => "file_exists",
            Self::FileMode { .. } => "file_mode",
            Self::FileOwner { .. } => "file_owner",
        }
    }

    /// Path on the target host, for file-backed bindings.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::TemplateContains { path, .. }
            | Self::FileContains { path, .. }
            | Self::FileExists { path }
            | Self::FileMode { path, .. }
            | Self::FileOwner { path, .. } => Some(path),
            Self::ServiceListenPort { .. } | Self::FirewallPortOpen { .. } => None,
        }
    }

    /// Content pattern, for bindings that grep a file.
    pub fn pattern(&self) -> Option<&str> {
        match self {
            Self::TemplateContains { pattern, .. } | Self::FileContains { pattern, .. } => {
                Some(pattern)
            }
            _ => None,
        }
    }

    /// Whether the bound value must be usable as a port number.
    pub fn needs_port(&self) -> bool {
        matches!(
            self,
            Self::ServiceListenPort { .. } | Self::FirewallPortOpen { .. }
        )
    }
}

/// A binding between a variable and an observable property.
///
/// On the wire the binding type sits next to `target` rather than inside it:
/// `{type: service_listen_port, target: {service: nginx, ...}, weight: 2}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawBinding", into = "RawBinding")]
pub struct Binding {
    pub target: BindingTarget,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBinding {
    #[serde(rename = "type")]
    kind: String,
    target: Map<String, Value>,
    #[serde(default = "default_weight")]
    weight: f64,
}

impl TryFrom<RawBinding> for Binding {
    type Error = String;

    fn try_from(raw: RawBinding) -> Result<Self, Self::Error> {
        let mut fields = raw.target;
        fields.insert("type".to_string(), Value::String(raw.kind.clone()));
        let target = serde_json::from_value(Value::Object(fields))
            .map_err(|e| format!("invalid '{}' binding target: {e}", raw.kind))?;
        Ok(Self {
            target,
            weight: raw.weight,
        })
    }
}

impl From<Binding> for RawBinding {
    fn from(binding: Binding) -> Self {
        let kind = binding.target.type_name().to_string();
        let mut target = match serde_json::to_value(&binding.target) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        target.remove("type");
        Self {
            kind,
            target,
            weight: binding.weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDefaults {
    pub student: Value,
}

/// A variable the student's automation must honor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableContract {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: VarType,
    pub defaults: VariableDefaults,
    #[serde(default)]
    pub allowed_values: Vec<Value>,
    #[serde(default)]
    pub grading_overlay_targets: Vec<OverlayTarget>,
    #[serde(default)]
    pub binding_targets: Vec<Binding>,
    #[serde(default)]
    pub bindings_mode: BindingsMode,
}

impl VariableContract {
    pub fn has_bindings(&self) -> bool {
        !self.binding_targets.is_empty()
    }

    /// Overlay target names of the given kind, in declaration order.
    pub fn targets_of(&self, kind: OverlayKind) -> impl Iterator<Item = &str> {
        self.grading_overlay_targets
            .iter()
            .filter(move |t| t.overlay_kind == kind)
            .map(|t| t.target_name.as_str())
    }
}

/// Ansible precedence layers a scenario may exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecedenceLayer {
    RoleDefault,
    RoleVars,
    PlayVars,
    VarsFiles,
    InventoryVars,
    GroupVars,
    HostVars,
    ExtraVars,
}

/// A declared precedence exercise: which layer is expected to win for a variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecedenceScenario {
    pub name: String,
    pub variable: String,
    pub layers: Vec<PrecedenceLayer>,
    pub expected_winner: PrecedenceLayer,
    #[serde(default)]
    pub bindings_to_verify: Vec<usize>,
    #[serde(default)]
    pub phase: OverlayPhase,
}
