use anyhow::{Context as _, Result, bail};
use colored::Colorize;
use grading::context::CancelToken;
use grading::poll::SystemClock;
use grading::{Collaborators, GradeError, GradeReport, Orchestrator};
use labspec::LabSpec;
use std::io;
use std::path::Path;

use crate::Context;
use crate::backend::{AnsibleRunner, ProbeRunner, Ssh};
use crate::cli::GradeArgs;
use crate::config::GraderConfig;
use crate::progress::PhaseSpinner;
use crate::ui;
use crate::workspace::{self, RunDir};

pub fn run(ctx: &Context, mut config: GraderConfig, args: &GradeArgs) -> Result<()> {
    if let Some(secs) = args.converge_timeout {
        config.timeouts.converge = secs;
    }
    if let Some(jobs) = args.jobs {
        config.verification.jobs = jobs;
    }
    if let Some(order) = args.group_order {
        config.resolution.group_precedence = order.into();
    }
    config.validate().context("Invalid command-line override")?;

    let run_dir = RunDir::acquire(&args.output)?;

    let spec = match LabSpec::load(&args.spec) {
        Ok(spec) => spec,
        Err(e) => {
            for violation in e.violations() {
                ui::error(&violation.to_string());
            }
            let report = GradeReport::fatal(None, &GradeError::Spec(e));
            let path = report.write(run_dir.path())?;
            bail!("Lab spec {} is invalid; report written to {}", args.spec.display(), path.display());
        }
    };

    if !ctx.quiet {
        ui::header(&format!("Grading {} {}", spec.assignment_id, spec.assignment_version));
        ui::kv("Submission", &args.submission.display().to_string());
        ui::kv("Nodes", &spec.topology.nodes.iter().map(|n| n.name.as_str()).collect::<Vec<_>>().join(", "));
        ui::kv("Results", &run_dir.path().display().to_string());
        println!();
    }
    if !ui::confirm("Converge, reboot and inspect the lab machines?", args.yes)? {
        ui::info("Aborted");
        return Ok(());
    }

    let spec_dir = args.spec.parent().unwrap_or_else(|| Path::new("."));
    let work_dir = run_dir.work_dir();
    let staged = match workspace::stage_submission(&spec, spec_dir, &args.submission, &work_dir) {
        Ok(staged) => staged,
        Err(e) => {
            let err = GradeError::io("staging the submission", io::Error::other(format!("{e:#}")));
            abort(&run_dir, &spec, &err)?;
            return Err(e);
        }
    };
    log::info!("Staged {staged} file(s) into {}", work_dir.display());

    let cancel = CancelToken::new();
    install_interrupt_handler(&cancel);

    let logs_dir = run_dir.logs_dir();
    let ansible = AnsibleRunner::new(&spec, &config.ansible, &work_dir, &logs_dir, cancel.clone());
    let ssh = Ssh::from_config(&config, cancel.clone());
    let probes = ProbeRunner::new(ssh.clone(), config.verification_timeout());
    let collab = Collaborators {
        runner: &ansible,
        reboot: &ssh,
        snapshots: &ssh,
        verifier: &probes,
        clock: &SystemClock,
    };
    let orchestrator = match Orchestrator::new(collab, config.orchestrator_options(), cancel) {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            abort(&run_dir, &spec, &err)?;
            return Err(err.into());
        }
    };

    let mut spinner = PhaseSpinner::new(ctx.quiet);
    let report = grading::grade(&spec, &config.plan_options(), &orchestrator, &mut spinner);
    let path = report.write(run_dir.path())?;

    if !ctx.quiet {
        print_totals(&report);
        ui::dim(&format!("Report: {}", path.display()));
    }

    if let Some(fatal) = &report.fatal_error {
        bail!("Grading aborted ({}): {}", fatal.kind.as_str(), fatal.message);
    }
    if report.phases.iter().any(|p| p.error.is_some()) {
        bail!("Grading did not complete every phase");
    }
    Ok(())
}

/// Write an aborted report for a run that could not start.
fn abort(run_dir: &RunDir, spec: &LabSpec, err: &GradeError) -> Result<()> {
    let report = GradeReport::fatal(Some(&spec.assignment_id), err);
    let path = report.write(run_dir.path())?;
    ui::error(&format!("{err}"));
    ui::dim(&format!("Report: {}", path.display()));
    Ok(())
}

/// First Ctrl-C cancels the run so the report still gets written; a second
/// one exits immediately.
fn install_interrupt_handler(cancel: &CancelToken) {
    let token = cancel.clone();
    let installed = ctrlc::set_handler(move || {
        if token.is_cancelled() {
            std::process::exit(130);
        }
        eprintln!();
        log::warn!("Interrupted, stopping after the current step (Ctrl-C again to exit)");
        token.cancel();
    });
    if let Err(e) = installed {
        log::warn!("Could not install the Ctrl-C handler: {e}");
    }
}

fn print_totals(report: &GradeReport) {
    println!();
    let score = &report.score;
    println!(
        "  {} {:.1}/{:.1} ({})",
        "Total".bold(),
        score.earned,
        score.possible,
        ui::percentage(score.percentage)
    );
    for phase in &report.phases {
        if let Some(err) = &phase.error {
            ui::warn(&format!("{}: {} ({})", phase.phase, err.kind.description(), err.message));
            ui::dim(err.advice);
        }
    }
    if report.is_success() {
        ui::success("All checks passed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_missing_submission_still_writes_report() {
        let out = TempDir::new().unwrap();
        let args = GradeArgs {
            spec: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos/web_lab.yaml"),
            submission: out.path().join("no-such-submission"),
            output: out.path().join("results"),
            converge_timeout: None,
            jobs: None,
            group_order: None,
            yes: true,
        };
        let ctx = Context { verbose: 0, quiet: true };

        assert!(run(&ctx, GraderConfig::default(), &args).is_err());

        let report: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(out.path().join("results/report.json")).unwrap()).unwrap();
        assert_eq!(report["status"], "aborted");
        assert_eq!(report["fatal_error"]["kind"], "aborted");
        assert!(
            report["fatal_error"]["message"]
                .as_str()
                .unwrap()
                .starts_with("staging the submission: ")
        );
        assert!(report["phases"].as_array().unwrap().is_empty());
        assert!(out.path().join("results/summary.txt").exists());
    }
}
