//! Real collaborators for the grading engine: ansible-playbook for converge
//! runs and plain `ssh` for reboots, state snapshots and remote probes.

pub mod ansible;
pub mod probe;
pub mod reboot;
pub mod snapshot;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use grading::GradeError;
use grading::context::CancelToken;

use crate::config::GraderConfig;
use crate::runner::{self, CommandOutput};

pub use ansible::AnsibleRunner;
pub use probe::ProbeRunner;

/// Exit code ssh uses for its own failures
const SSH_ERROR: i32 = 255;

/// Line prefix that marks structured output of remote scripts
pub(crate) const MARKER: &str = "@@hammer:";

/// Non-interactive ssh transport to the lab nodes.
#[derive(Debug, Clone)]
pub struct Ssh {
    user: String,
    private_key: Option<PathBuf>,
    connect_timeout: u64,
    /// Deadline for snapshot and probe scripts
    command_timeout: Duration,
    hosts: BTreeMap<String, String>,
    cancel: CancelToken,
}

impl Ssh {
    /// Sessions are killed as soon as `cancel` fires.
    pub fn from_config(config: &GraderConfig, cancel: CancelToken) -> Self {
        Self {
            user: config.ansible.user.clone(),
            private_key: config.ansible.private_key_path(),
            connect_timeout: config.timeouts.ssh_connect,
            command_timeout: config.verification_timeout(),
            hosts: config.ansible.hosts.clone(),
            cancel,
        }
    }

    /// Address of a lab node
    pub fn address<'a>(&'a self, node: &'a str) -> &'a str {
        self.hosts.get(node).map_or(node, String::as_str)
    }

    fn command(&self, host: &str, connect_timeout: u64) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args([
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=ERROR",
            "-o",
        ])
        .arg(format!("ConnectTimeout={connect_timeout}"));
        if let Some(key) = &self.private_key {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(format!("{}@{}", self.user, self.address(host)));
        cmd
    }

    /// Run `script` as root on `host` through `sh`.
    pub fn run(&self, host: &str, script: &str, timeout: Duration) -> io::Result<CommandOutput> {
        let mut cmd = self.command(host, self.connect_timeout);
        cmd.arg(format!("sudo -n sh -c {}", quote(script)));
        log::trace!("ssh {host}: {script}");
        runner::run_with_timeout(&mut cmd, timeout, &self.cancel)
    }

    /// Whether `host` accepts an ssh session within `timeout`.
    pub fn ping(&self, host: &str, timeout: Duration) -> bool {
        let secs = timeout.as_secs().max(1);
        let mut cmd = self.command(host, secs);
        cmd.arg("true");
        runner::run_with_timeout(&mut cmd, timeout + Duration::from_secs(1), &self.cancel)
            .is_ok_and(|out| out.success())
    }
}

/// Map a finished remote command to an error when ssh itself failed, the
/// deadline passed or the run was cancelled. `wrap` builds the kind-specific
/// error.
pub(crate) fn check_transport(
    host: &str,
    operation: &str,
    timeout: Duration,
    result: io::Result<CommandOutput>,
    wrap: impl FnOnce(String) -> GradeError,
) -> grading::Result<CommandOutput> {
    let out = result.map_err(|e| GradeError::io(format!("{operation} on {host}"), e))?;
    if out.cancelled {
        return Err(GradeError::Cancelled);
    }
    if out.timed_out {
        return Err(GradeError::Timeout {
            operation: format!("{operation} on {host}"),
            seconds: timeout.as_secs(),
        });
    }
    if out.status == Some(SSH_ERROR) {
        return Err(wrap(out.stderr.trim().to_string()));
    }
    Ok(out)
}

/// Quote `s` for a POSIX shell.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("nginx"), "'nginx'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn test_address_falls_back_to_node_name() {
        let mut config = GraderConfig::default();
        config.ansible.hosts.insert("web1".into(), "10.0.0.11".into());
        let ssh = Ssh::from_config(&config, CancelToken::new());
        assert_eq!(ssh.address("web1"), "10.0.0.11");
        assert_eq!(ssh.address("db1"), "db1");
    }

    #[test]
    fn test_command_shape() {
        let mut config = GraderConfig::default();
        config.ansible.user = "student".into();
        let ssh = Ssh::from_config(&config, CancelToken::new());
        let cmd = ssh.command("web1", 7);
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=7".to_string()));
        assert_eq!(args.last().unwrap(), "student@web1");
    }

    #[test]
    fn test_transport_errors() {
        let timeout = Duration::from_secs(5);
        let timed_out = CommandOutput {
            timed_out: true,
            ..Default::default()
        };
        let err = check_transport("web1", "snapshot", timeout, Ok(timed_out), |m| {
            GradeError::Snapshot {
                host: "web1".into(),
                message: m,
            }
        })
        .unwrap_err();
        assert_eq!(err.kind(), grading::FailureKind::Timeout);

        let refused = CommandOutput {
            status: Some(255),
            stderr: "Connection refused\n".into(),
            ..Default::default()
        };
        let err = check_transport("web1", "snapshot", timeout, Ok(refused), |m| {
            GradeError::Snapshot {
                host: "web1".into(),
                message: m,
            }
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "snapshot of web1 failed: Connection refused");

        let cancelled = CommandOutput {
            cancelled: true,
            ..Default::default()
        };
        let err = check_transport("web1", "snapshot", timeout, Ok(cancelled), |m| GradeError::Converge { message: m })
            .unwrap_err();
        assert_eq!(err.kind(), grading::FailureKind::Aborted);

        let ok = CommandOutput {
            status: Some(1),
            ..Default::default()
        };
        assert!(check_transport("web1", "snapshot", timeout, Ok(ok), |m| GradeError::Converge { message: m }).is_ok());
    }
}
