use anyhow::Result;
use colored::Colorize;
use grading::plan::PhasePlan;

use crate::Context;
use crate::cli::PlanArgs;
use crate::config::GraderConfig;
use crate::ui;

pub fn run(ctx: &Context, config: &GraderConfig, args: &PlanArgs) -> Result<()> {
    let spec = super::load_spec(&args.spec)?;
    let mut options = config.plan_options();
    if let Some(order) = args.group_order {
        options.resolve.group_precedence = order.into();
    }

    let plan = grading::assemble(&spec, &options)?;
    if args.json {
        println!("{}", plan.to_json()?);
        return Ok(());
    }

    ui::header(&format!("{} {}", plan.assignment_id, plan.assignment_version));
    ui::kv("Seed", &plan.seed.to_string());
    ui::kv("Fingerprint", &plan.fingerprint()?);
    for phase in &plan.phases {
        print_phase(ctx, phase);
    }

    ui::section("Steps");
    for step in &plan.steps {
        println!("  {}", step.name);
    }
    Ok(())
}

fn print_phase(ctx: &Context, phase: &PhasePlan) {
    ui::section(&format!("{} ({} overlay)", phase.phase, phase.overlay_phase));

    let failure = &phase.policy.failure;
    if failure.allow_failures {
        let limit = failure
            .max_failures
            .map_or_else(|| "unlimited".to_string(), |n| n.to_string());
        ui::kv("Failures", &format!("allowed (max {limit})"));
    }
    if let Some(reboot) = &phase.policy.reboot {
        ui::kv(
            "Reboot",
            &format!("{} (timeout {}s, poll {}s)", reboot.hosts.join(", "), reboot.timeout_secs, reboot.poll_interval_secs),
        );
    }

    if !phase.variables.resolved.is_empty() {
        println!("  {}", "Variables".bold());
        for (name, var) in &phase.variables.resolved {
            println!("    {name} = {} {}", var.value, format!("[{}]", var.source.as_str()).dimmed());
        }
    }
    if ctx.verbose > 0 {
        for (host, vars) in &phase.variables.host_resolved {
            println!("  {}", format!("Host {host}").bold());
            for (name, var) in vars {
                println!("    {name} = {} {}", var.value, format!("[{}]", var.source.as_str()).dimmed());
            }
        }
    }

    println!(
        "  {} {}",
        "Checks".bold(),
        format!("(total weight {:.1})", phase.contracts.total_weight()).dimmed()
    );
    for check in &phase.contracts.checks {
        println!(
            "    {:<40} {:<10} {:>5.1}  {}",
            check.id,
            check.kind.name(),
            check.weight,
            check.host_targets.join(",").dimmed()
        );
    }
}
