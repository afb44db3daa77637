//! # Labspec
//!
//! The lab specification model for HAMMER: the immutable, validated
//! description of a graded lab.
//!
//! A spec declares
//!
//! - a **topology** of nodes and the groups they belong to,
//! - **variable contracts**: variables the student's automation must honor,
//!   the overlay layers the grader injects them through, and the observable
//!   properties ("bindings") each value must show up in,
//! - **behavioral contracts**: package, service, user, firewall, file,
//!   reachability, HTTP and output assertions,
//! - **handler contracts** with per-phase expected run counts,
//! - the **idempotence policy** and per-phase **overlays** (variable layers,
//!   reboot and failure policy).
//!
//! ```ignore
//! let spec = labspec::LabSpec::load(Path::new("lab.yaml"))?;
//! for node in &spec.topology.nodes {
//!     println!("{} {:?}", node.name, node.groups);
//! }
//! ```

pub mod contracts;
pub mod error;
pub mod overlays;
pub mod spec;
pub mod topology;
pub mod types;
pub mod validate;
pub mod variables;

#[cfg(test)]
mod fixtures;

pub use contracts::{BehavioralContracts, PortRef, applies_to_phase};
pub use error::{Result, SpecError, Violation};
pub use overlays::{FailurePolicy, PhaseOverlay, PhaseOverlays, RebootConfig};
pub use spec::LabSpec;
pub use topology::{Node, NodeSelector, Topology};
pub use types::{ExpectedRuns, FeatureFlags, OverlayPhase, Phase, Protocol, VarType};
pub use variables::{Binding, BindingTarget, OverlayKind, VariableContract};
