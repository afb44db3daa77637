use grading::GradeError;
use grading::context::RebootAgent;
use std::time::Duration;

use super::{Ssh, check_transport};

/// Detached so the ssh session can close before the machine goes down.
const REBOOT_SCRIPT: &str = "nohup sh -c 'sleep 1; systemctl reboot' >/dev/null 2>&1 &";

const REBOOT_DEADLINE: Duration = Duration::from_secs(30);

impl RebootAgent for Ssh {
    fn reboot(&self, host: &str) -> grading::Result<()> {
        log::info!("Rebooting {host}");
        let out = check_transport(
            host,
            "reboot",
            REBOOT_DEADLINE,
            self.run(host, REBOOT_SCRIPT, REBOOT_DEADLINE),
            |message| GradeError::Unreachable {
                host: host.to_string(),
                message,
            },
        )?;
        if out.success() {
            Ok(())
        } else {
            Err(GradeError::Unreachable {
                host: host.to_string(),
                message: format!("reboot command failed: {}", out.stderr.trim()),
            })
        }
    }

    fn is_reachable(&self, host: &str, timeout: Duration) -> bool {
        self.ping(host, timeout)
    }
}
