use anyhow::{Context, Result, bail};
use grading::GroupPrecedence;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths;

// ============================================================================
// Grader Config
// ============================================================================

/// Grader settings loaded from `config.toml`.
///
/// Every section is optional; a missing file means all defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    pub timeouts: TimeoutConfig,
    pub resolution: ResolutionConfig,
    pub ansible: AnsibleConfig,
    pub verification: VerificationConfig,
}

/// Timeouts, in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub converge: u64,
    pub reboot_down: u64,
    pub reboot_probe: u64,
    pub verification: u64,
    pub ssh_connect: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            converge: 1800,
            reboot_down: 30,
            reboot_probe: 10,
            verification: 120,
            ssh_connect: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    pub group_precedence: GroupPrecedence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnsibleConfig {
    /// ansible-playbook executable
    pub playbook_bin: String,
    pub extra_args: Vec<String>,
    /// SSH user for converge runs and probes
    pub user: String,
    pub private_key: Option<String>,
    /// Node name -> address; nodes not listed are addressed by name
    pub hosts: BTreeMap<String, String>,
}

impl Default for AnsibleConfig {
    fn default() -> Self {
        Self {
            playbook_bin: "ansible-playbook".to_string(),
            extra_args: Vec::new(),
            user: "vagrant".to_string(),
            private_key: None,
            hosts: BTreeMap::new(),
        }
    }
}

impl AnsibleConfig {
    /// Address to reach `node` at.
    pub fn address<'a>(&'a self, node: &'a str) -> &'a str {
        self.hosts.get(node).map_or(node, String::as_str)
    }

    /// Private key path with `~` expanded.
    pub fn private_key_path(&self) -> Option<PathBuf> {
        self.private_key.as_deref().map(paths::expand)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Hosts verified in parallel
    pub jobs: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self { jobs: 4 }
    }
}

impl GraderConfig {
    /// Load the config from `explicit`, or from the default location.
    ///
    /// An explicit path must exist; the default one may be missing.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => {
                let default = paths::config_file()?;
                if !default.exists() {
                    log::debug!("No config at {}, using defaults", default.display());
                    return Ok(Self::default());
                }
                default
            }
        };
        Self::load_file(&path)
    }

    fn load_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid config format in {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        log::debug!("Loaded grader config from {}", path.display());
        Ok(config)
    }

    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let t = &self.timeouts;
        for (name, value) in [
            ("converge", t.converge),
            ("reboot_down", t.reboot_down),
            ("reboot_probe", t.reboot_probe),
            ("verification", t.verification),
            ("ssh_connect", t.ssh_connect),
        ] {
            if value == 0 {
                bail!("timeouts.{name} must be greater than zero");
            }
        }
        if self.verification.jobs == 0 {
            bail!("verification.jobs must be at least 1");
        }
        if self.ansible.playbook_bin.trim().is_empty() {
            bail!("ansible.playbook_bin must not be empty");
        }
        Ok(())
    }

    pub fn converge_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.converge)
    }

    pub fn verification_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.verification)
    }

    pub fn orchestrator_options(&self) -> grading::OrchestratorOptions {
        grading::OrchestratorOptions {
            converge_timeout: self.converge_timeout(),
            reboot_down_timeout: Duration::from_secs(self.timeouts.reboot_down),
            reboot_probe_timeout: Duration::from_secs(self.timeouts.reboot_probe),
            verify_jobs: self.verification.jobs,
        }
    }

    pub fn plan_options(&self) -> grading::PlanOptions {
        grading::PlanOptions {
            resolve: grading::ResolveOptions {
                group_precedence: self.resolution.group_precedence,
            },
        }
    }
}
