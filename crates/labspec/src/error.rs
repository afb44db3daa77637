//! Error types for loading and validating lab specifications.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A single semantic problem found in a spec, anchored to a field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Dotted path to the offending field (e.g. `behavioral_contracts.packages[0].node_selector`)
    pub field: String,
    /// What is wrong with it
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Errors that can occur while loading a lab specification.
#[derive(Debug, Error)]
pub enum SpecError {
    /// The spec file could not be read
    #[error("could not read spec {}: {source}", path.display())]
    Io {
        /// Path that was being read
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid YAML or does not match the schema
    #[error("invalid spec document: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The document parsed but breaks one or more semantic rules
    #[error("spec failed validation with {} violation(s):\n{}", .0.len(), render(.0))]
    Invalid(Vec<Violation>),
}

impl SpecError {
    /// Violations carried by an [`SpecError::Invalid`] error.
    pub fn violations(&self) -> &[Violation] {
        match self {
            Self::Invalid(violations) => violations,
            _ => &[],
        }
    }
}

fn render(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("  - {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Result type for spec operations.
pub type Result<T> = std::result::Result<T, SpecError>;
