pub mod doctor;
pub mod grade;
pub mod plan;
pub mod validate;

use anyhow::{Context, Result};
use labspec::LabSpec;
use std::path::Path;

use crate::ui;

/// Load a spec, listing every violation when validation fails.
pub(crate) fn load_spec(path: &Path) -> Result<LabSpec> {
    match LabSpec::load(path) {
        Ok(spec) => Ok(spec),
        Err(e) => {
            for violation in e.violations() {
                ui::error(&violation.to_string());
            }
            Err(e).with_context(|| format!("Could not load lab spec {}", path.display()))
        }
    }
}
