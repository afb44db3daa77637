//! The root lab specification document.

use crate::contracts::BehavioralContracts;
use crate::error::{Result, SpecError};
use crate::overlays::{HandlerContract, IdempotencePolicy, PhaseOverlays};
use crate::topology::Topology;
use crate::types::FeatureFlags;
use crate::validate;
use crate::variables::{PrecedenceScenario, VariableContract};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpecVersion {
    #[serde(rename = "1.0")]
    V1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Libvirt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsImage {
    Almalinux9,
}

/// A file shipped with the assignment and copied next to the submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvidedFile {
    pub source: String,
    pub destination: String,
}

/// What the student must submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entrypoints {
    /// Playbook to converge, relative to the submission root
    pub playbook_path: String,
    #[serde(default)]
    pub required_roles: Vec<String>,
    #[serde(default)]
    pub required_files: Vec<String>,
    #[serde(default)]
    pub provided_files: Vec<ProvidedFile>,
}

/// A complete, validated lab specification.
///
/// Construct one with [`LabSpec::load`] or [`LabSpec::from_yaml_str`]; both
/// run semantic validation, so every cross reference in a `LabSpec` you hold
/// (selectors, overlay targets, value references) is known to resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabSpec {
    pub assignment_id: String,
    pub assignment_version: String,
    pub spec_version: SpecVersion,
    pub seed: u64,
    pub provider: Provider,
    pub os: OsImage,
    #[serde(default)]
    pub features: FeatureFlags,
    pub topology: Topology,
    pub entrypoints: Entrypoints,
    #[serde(default)]
    pub variable_contracts: Vec<VariableContract>,
    #[serde(default)]
    pub precedence_scenarios: Vec<PrecedenceScenario>,
    #[serde(default)]
    pub behavioral_contracts: BehavioralContracts,
    #[serde(default)]
    pub handler_contracts: Vec<HandlerContract>,
    #[serde(default)]
    pub idempotence: IdempotencePolicy,
    pub phase_overlays: PhaseOverlays,
}

impl LabSpec {
    /// Parse and validate a spec from YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let spec: Self = serde_yaml::from_str(text)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Read, parse and validate a spec file.
    pub fn load(path: &Path) -> Result<Self> {
        log::debug!("Loading lab spec from {}", path.display());
        let text = std::fs::read_to_string(path).map_err(|source| SpecError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Run every semantic check, reporting all violations at once.
    pub fn validate(&self) -> Result<()> {
        let violations = validate::check(self);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(SpecError::Invalid(violations))
        }
    }

    /// Look up a variable contract by name.
    pub fn variable(&self, name: &str) -> Option<&VariableContract> {
        self.variable_contracts.iter().find(|v| v.name == name)
    }
}
