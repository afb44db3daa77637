//! Path resolution for hammer.
//!
//! # Environment Variables
//!
//! - `HAMMER_CONFIG_DIR` - Override the config directory
//!
//! # Path Resolution Priority
//!
//! For config_dir():
//! 1. `HAMMER_CONFIG_DIR` environment variable
//! 2. `XDG_CONFIG_HOME/hammer` (if set)
//! 3. `~/.config/hammer`

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "HAMMER_CONFIG_DIR";

/// Name of the grader config file inside the config directory
pub const CONFIG_FILE: &str = "config.toml";

/// Get the hammer config directory path
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_CONFIG_DIR) {
        let path = expand(&dir);
        log::debug!("Using config dir from {}: {}", ENV_CONFIG_DIR, path.display());
        return Ok(path);
    }

    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(xdg_config).join("hammer");
        log::debug!("Using XDG_CONFIG_HOME: {}", path.display());
        return Ok(path);
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".config").join("hammer");
    log::debug!("Using default config dir: {}", path.display());
    Ok(path)
}

/// Default location of the grader config file
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE))
}

/// Expand ~ and environment variables in a path string.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

/// Resolve `path` against `base` unless it is already absolute.
pub fn relative_to(base: &Path, path: &str) -> PathBuf {
    let expanded = expand(path);
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    #[allow(unsafe_code)]
    fn test_config_dir_env_override() {
        let original = env::var(ENV_CONFIG_DIR).ok();
        // SAFETY: no other test reads HAMMER_CONFIG_DIR
        unsafe { env::set_var(ENV_CONFIG_DIR, "/custom/hammer") };
        let result = config_dir().unwrap();
        match original {
            // SAFETY: as above
            Some(v) => unsafe { env::set_var(ENV_CONFIG_DIR, v) },
            None => unsafe { env::remove_var(ENV_CONFIG_DIR) },
        }
        assert_eq!(result, PathBuf::from("/custom/hammer"));
    }

    #[test]
    fn test_expand_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand("~/labs"), home.join("labs"));
    }

    #[test]
    fn test_expand_plain_path() {
        assert_eq!(expand("/tmp/results"), PathBuf::from("/tmp/results"));
    }

    #[test]
    fn test_relative_to() {
        let base = Path::new("/labs/web");
        assert_eq!(relative_to(base, "files/app.conf"), PathBuf::from("/labs/web/files/app.conf"));
        assert_eq!(relative_to(base, "/etc/hosts"), PathBuf::from("/etc/hosts"));
    }
}
