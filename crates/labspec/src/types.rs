//! Primitive types shared across the spec model.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// A grading phase.
///
/// Phases always run in declaration order; the derived `Ord` follows it, so
/// a `BTreeMap<Phase, _>` iterates baseline, mutation, idempotence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// First converge against fresh machines with baseline overlays
    Baseline,
    /// Converge with mutated overlays to prove variables are honored
    Mutation,
    /// Re-run of mutation's inputs; must change nothing
    Idempotence,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 3] = [Phase::Baseline, Phase::Mutation, Phase::Idempotence];

    /// Lowercase identifier used in file names and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Mutation => "mutation",
            Self::Idempotence => "idempotence",
        }
    }

    /// The overlay phase whose configuration this phase runs with.
    ///
    /// Idempotence re-applies mutation's inputs, so it maps to mutation.
    pub fn overlay_phase(self) -> OverlayPhase {
        match self {
            Self::Baseline => OverlayPhase::Baseline,
            Self::Mutation | Self::Idempotence => OverlayPhase::Mutation,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "baseline" => Ok(Self::Baseline),
            "mutation" => Ok(Self::Mutation),
            "idempotence" => Ok(Self::Idempotence),
            other => Err(format!(
                "unknown phase '{other}' (expected baseline, mutation or idempotence)"
            )),
        }
    }
}

/// A phase that owns its own overlay configuration.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum OverlayPhase {
    #[default]
    Baseline,
    Mutation,
}

impl OverlayPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Mutation => "mutation",
        }
    }
}

impl fmt::Display for OverlayPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport protocol for ports and probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared type of a variable contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    Int,
    String,
    Bool,
    List,
    Dict,
}

impl VarType {
    /// Whether a dynamic value has this type. `null` never matches.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::Int => value.as_i64().is_some() || value.as_u64().is_some(),
            Self::String => value.is_string(),
            Self::Bool => value.is_boolean(),
            Self::List => value.is_array(),
            Self::Dict => value.is_object(),
        }
    }
}

/// How many times a handler is expected to run in a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedRuns {
    Zero,
    AtLeastOnce,
    ExactlyOnce,
}

impl ExpectedRuns {
    /// Whether an observed run count satisfies this expectation.
    pub fn admits(self, count: u32) -> bool {
        match self {
            Self::Zero => count == 0,
            Self::AtLeastOnce => count >= 1,
            Self::ExactlyOnce => count == 1,
        }
    }

    /// Whether the handler is expected to run at all.
    pub fn expects_run(self) -> bool {
        !matches!(self, Self::Zero)
    }
}

impl fmt::Display for ExpectedRuns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Zero => "zero",
            Self::AtLeastOnce => "at_least_once",
            Self::ExactlyOnce => "exactly_once",
        })
    }
}

/// Optional capabilities a lab may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default)]
    pub vault: bool,
    #[serde(default)]
    pub selinux: bool,
    #[serde(default = "default_true")]
    pub handlers: bool,
    #[serde(default)]
    pub reachability: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            vault: false,
            selinux: false,
            handlers: true,
            reachability: false,
        }
    }
}

pub(crate) fn default_true() -> bool {
    true
}

pub(crate) fn default_weight() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_idempotence_runs_with_mutation_overlays() {
        assert_eq!(Phase::Baseline.overlay_phase(), OverlayPhase::Baseline);
        assert_eq!(Phase::Mutation.overlay_phase(), OverlayPhase::Mutation);
        assert_eq!(Phase::Idempotence.overlay_phase(), OverlayPhase::Mutation);
    }

    #[test]
    fn test_phase_order_follows_execution() {
        let mut phases = vec![Phase::Idempotence, Phase::Baseline, Phase::Mutation];
        phases.sort();
        assert_eq!(phases, Phase::ALL.to_vec());
    }

    #[test]
    fn test_phase_from_str() {
        assert_eq!("Mutation".parse::<Phase>(), Ok(Phase::Mutation));
        assert!("reboot".parse::<Phase>().is_err());
    }

    #[test]
    fn test_expected_runs_admits() {
        assert!(ExpectedRuns::Zero.admits(0));
        assert!(!ExpectedRuns::Zero.admits(1));
        assert!(ExpectedRuns::AtLeastOnce.admits(3));
        assert!(!ExpectedRuns::AtLeastOnce.admits(0));
        assert!(ExpectedRuns::ExactlyOnce.admits(1));
        assert!(!ExpectedRuns::ExactlyOnce.admits(2));
    }

    #[test]
    fn test_var_type_matches() {
        assert!(VarType::Int.matches(&json!(8080)));
        assert!(!VarType::Int.matches(&json!("8080")));
        assert!(VarType::Dict.matches(&json!({"a": 1})));
        assert!(!VarType::Bool.matches(&Value::Null));
    }
}
