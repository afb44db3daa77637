//! Progress display for grading runs.

use colored::Colorize;
use grading::context::PhaseObserver;
use grading::report::{PhaseResult, PhaseState, PhaseStatus};
use indicatif::{ProgressBar, ProgressStyle};
use labspec::Phase;
use std::time::Duration;

/// Spinner that follows the orchestrator through each phase and prints a
/// one-line result when a phase finishes.
pub struct PhaseSpinner {
    bar: Option<ProgressBar>,
    quiet: bool,
    started: usize,
}

impl PhaseSpinner {
    pub fn new(quiet: bool) -> Self {
        Self {
            bar: None,
            quiet,
            started: 0,
        }
    }

    fn label(&self, phase: Phase) -> String {
        format!("[{}/{}] {phase}", self.started, Phase::ALL.len())
    }
}

impl PhaseObserver for PhaseSpinner {
    fn on_phase_start(&mut self, phase: Phase) {
        self.started += 1;
        if self.quiet {
            return;
        }
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg} {elapsed:.dim}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(self.label(phase));
        bar.enable_steady_tick(Duration::from_millis(120));
        self.bar = Some(bar);
    }

    fn on_state(&mut self, phase: Phase, state: PhaseState) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("{}: {state}", self.label(phase)));
        }
    }

    fn on_phase_complete(&mut self, result: &PhaseResult) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        if self.quiet {
            return;
        }
        let score = &result.score;
        match result.status {
            PhaseStatus::Scored => {
                let skipped = match result.skipped_checks() {
                    0 => String::new(),
                    n => format!(", {n} skipped"),
                };
                let clean = result.failed_checks() == 0 && result.skipped_checks() == 0;
                println!(
                    "{} {:<12} {:.1}/{:.1} ({:.1}%)  {} passed, {} failed{skipped}",
                    if clean { "✓".green() } else { "⚠".yellow() },
                    result.phase.to_string().bold(),
                    score.earned,
                    score.possible,
                    score.percentage,
                    result.passed_checks(),
                    result.failed_checks()
                );
            }
            PhaseStatus::Aborted => {
                let reason = result
                    .error
                    .as_ref()
                    .map_or_else(String::new, |e| format!(" ({}): {}", e.kind, e.message));
                println!("{} {:<12} aborted{reason}", "✗".red(), result.phase.to_string().bold());
            }
            PhaseStatus::NotRun => {
                println!("  {:<12} {}", result.phase.to_string().dimmed(), "not run".dimmed());
            }
        }
    }
}
