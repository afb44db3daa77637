use anyhow::Result;
use colored::Colorize;
use std::path::Path;

use crate::Context;
use crate::config::GraderConfig;
use crate::paths;
use crate::runner;
use crate::ui;

struct Issue {
    category: &'static str,
    summary: String,
    detail: Option<String>,
    fix: Option<String>,
    fix_cmd: Option<String>,
}

pub fn run(_ctx: &Context, config_path: Option<&Path>) -> Result<()> {
    ui::banner();
    ui::header("Grader Health Check");

    let mut issues: Vec<Issue> = Vec::new();

    let config = check_config(config_path, &mut issues);
    check_commands(&config, &mut issues);
    check_private_key(&config, &mut issues);

    println!();
    if issues.is_empty() {
        ui::success("Ready to grade");
    } else {
        print_issue_summary(&issues);
    }
    Ok(())
}

fn print_issue_summary(issues: &[Issue]) {
    let count = issues.len();
    let label = if count == 1 { "Issue" } else { "Issues" };
    ui::header(&format!("{count} {label} Found"));

    for (i, issue) in issues.iter().enumerate() {
        println!(
            "  {}  {} {}",
            format!("{}.", i + 1).bold(),
            issue.summary,
            format!("[{}]", issue.category).dimmed()
        );
        if let Some(detail) = &issue.detail {
            for line in detail.lines() {
                println!("      {}", line.dimmed());
            }
        }
        if let Some(fix) = &issue.fix {
            println!("      {} {}", "Fix:".cyan(), fix);
        }
        if let Some(cmd) = &issue.fix_cmd {
            println!("      {} {}", "$".dimmed(), cmd.bold());
        }
        println!();
    }
}

fn check_config(explicit: Option<&Path>, issues: &mut Vec<Issue>) -> GraderConfig {
    ui::section("Configuration");

    let location = match explicit {
        Some(p) => p.display().to_string(),
        None => paths::config_file().map_or_else(|_| "(unknown)".to_string(), |p| p.display().to_string()),
    };
    match GraderConfig::load(explicit) {
        Ok(config) => {
            println!("  {} {}", "✓".green(), location);
            config
        }
        Err(e) => {
            println!("  {} {} {}", "✗".red(), location, "(invalid)".red());
            issues.push(Issue {
                category: "Configuration",
                summary: "Grader config could not be loaded".to_string(),
                detail: Some(format!("{e:#}")),
                fix: Some("Fix the file or remove it to use the defaults".to_string()),
                fix_cmd: None,
            });
            GraderConfig::default()
        }
    }
}

fn check_commands(config: &GraderConfig, issues: &mut Vec<Issue>) {
    ui::section("Required Commands");

    let commands = [
        (config.ansible.playbook_bin.as_str(), "Runs the submitted playbook", "python3 -m pip install --user ansible-core"),
        ("ansible", "Ad-hoc module runner shipped with ansible-core", "python3 -m pip install --user ansible-core"),
        ("ssh", "Reboots and inspects lab nodes", "sudo dnf install openssh-clients"),
    ];

    for (cmd, desc, install_hint) in commands {
        if runner::command_exists(cmd) {
            println!("  {} {} - {}", "✓".green(), cmd, desc.dimmed());
        } else {
            println!("  {} {} - {} {}", "✗".red(), cmd, desc, "(missing)".red());
            issues.push(Issue {
                category: "Required Commands",
                summary: format!("{cmd} is not installed"),
                detail: Some(format!("{desc}; grading cannot start without it")),
                fix: Some(format!("Install {cmd}")),
                fix_cmd: Some(install_hint.to_string()),
            });
        }
    }
}

fn check_private_key(config: &GraderConfig, issues: &mut Vec<Issue>) {
    let Some(key) = config.ansible.private_key_path() else {
        return;
    };
    ui::section("SSH Key");
    if key.is_file() {
        println!("  {} {}", "✓".green(), key.display());
    } else {
        println!("  {} {} {}", "✗".red(), key.display(), "(missing)".red());
        issues.push(Issue {
            category: "SSH Key",
            summary: format!("Private key {} does not exist", key.display()),
            detail: None,
            fix: Some("Point ansible.private_key at the key used by the lab nodes".to_string()),
            fix_cmd: None,
        });
    }
}
