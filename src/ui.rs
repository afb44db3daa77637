use anyhow::Result;
use colored::Colorize;

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Ask before doing something to the lab machines; `assume_yes` skips the
/// prompt.
pub fn confirm(prompt: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    let confirmed = dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?;
    Ok(confirmed)
}

/// Format seconds as `1h 02m 03s`, `4m 05s` or `6s`
pub fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

/// Color a percentage by how good it is
pub fn percentage(pct: f64) -> String {
    let text = format!("{pct:.1}%");
    if pct >= 100.0 {
        text.green().bold().to_string()
    } else if pct >= 50.0 {
        text.yellow().to_string()
    } else {
        text.red().to_string()
    }
}

/// Print the hammer banner
pub fn banner() {
    println!(
        "{}",
        r"
  ██╗  ██╗ █████╗ ███╗   ███╗███╗   ███╗███████╗██████╗
  ██║  ██║██╔══██╗████╗ ████║████╗ ████║██╔════╝██╔══██╗
  ███████║███████║██╔████╔██║██╔████╔██║█████╗  ██████╔╝
  ██╔══██║██╔══██║██║╚██╔╝██║██║╚██╔╝██║██╔══╝  ██╔══██╗
  ██║  ██║██║  ██║██║ ╚═╝ ██║██║ ╚═╝ ██║███████╗██║  ██║
  ╚═╝  ╚═╝╚═╝  ╚═╝╚═╝     ╚═╝╚═╝     ╚═╝╚══════╝╚═╝  ╚═╝
"
        .cyan()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration_seconds() {
        assert_eq!(format_duration(0.0), "0s");
        assert_eq!(format_duration(59.4), "59s");
    }

    #[test]
    fn test_format_duration_minutes() {
        assert_eq!(format_duration(60.0), "1m 00s");
        assert_eq!(format_duration(245.0), "4m 05s");
    }

    #[test]
    fn test_format_duration_hours() {
        assert_eq!(format_duration(3723.0), "1h 02m 03s");
    }

    #[test]
    fn test_confirm_assume_yes_skips_prompt() {
        assert!(confirm("Reboot every node?", true).unwrap());
    }

    #[test]
    fn test_percentage_keeps_value() {
        colored::control::set_override(false);
        assert_eq!(percentage(87.54), "87.5%");
        assert_eq!(percentage(100.0), "100.0%");
    }
}
