use anyhow::Result;

use crate::Context;
use crate::cli::SpecArgs;
use crate::ui;

pub fn run(ctx: &Context, args: &SpecArgs) -> Result<()> {
    let spec = super::load_spec(&args.spec)?;
    if ctx.quiet {
        return Ok(());
    }

    ui::success(&format!("{} is valid", args.spec.display()));
    ui::kv("Assignment", &format!("{} ({})", spec.assignment_id, spec.assignment_version));
    ui::kv("Nodes", &spec.topology.nodes.len().to_string());
    ui::kv("Variables", &spec.variable_contracts.len().to_string());
    ui::kv("Handlers", &spec.handler_contracts.len().to_string());
    let bindings: usize = spec.variable_contracts.iter().map(|v| v.binding_targets.len()).sum();
    ui::kv("Bindings", &bindings.to_string());
    Ok(())
}
