//! # Grading
//!
//! Configuration resolution and phase execution for HAMMER.
//!
//! Given a validated [`labspec::LabSpec`], this crate
//!
//! - resolves every variable per phase through the overlay precedence layers
//!   ([`variables`]),
//! - expands assertions and variable bindings into host-targeted checks
//!   ([`contracts`]),
//! - assembles the fixed three-phase execution plan ([`plan`]),
//! - runs the phases against pluggable collaborators and scores them
//!   ([`orchestrator`]), producing a [`report::GradeReport`].
//!
//! ## Example
//!
//! ```ignore
//! use grading::{Collaborators, Orchestrator, OrchestratorOptions, PlanOptions};
//! use grading::context::{CancelToken, NoProgress};
//!
//! let spec = labspec::LabSpec::load(path)?;
//! let collab = Collaborators {
//!     runner: &ansible,
//!     reboot: &ssh,
//!     snapshots: &ssh,
//!     verifier: &probes,
//!     clock: &grading::poll::SystemClock,
//! };
//! let orchestrator = Orchestrator::new(collab, OrchestratorOptions::default(), CancelToken::new())?;
//! let report = grading::grade(&spec, &PlanOptions::default(), &orchestrator, &mut NoProgress);
//! report.write(&results_dir)?;
//! ```

pub mod context;
pub mod contracts;
pub mod error;
pub mod orchestrator;
pub mod plan;
pub mod policy;
pub mod poll;
pub mod report;
pub mod selector;
pub mod variables;
pub mod verify;

pub use contracts::{CheckKind, ContractCheck, PhaseContractPlan};
pub use error::{FailureKind, GradeError, Result};
pub use orchestrator::{Collaborators, Orchestrator, OrchestratorOptions, grade};
pub use plan::{ExecutionPlan, PlanOptions, assemble};
pub use report::{GradeReport, PhaseResult, PhaseStatus, RunStatus, Score};
pub use selector::resolve_selector;
pub use variables::{GroupPrecedence, PhaseVariablePlan, ResolveOptions, resolve};
