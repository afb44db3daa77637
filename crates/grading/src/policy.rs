//! Converge outcome classification under a phase's failure policy.

use crate::context::ConvergeRecord;
use crate::error::{GradeError, Result};
use labspec::FailurePolicy;
use regex::RegexBuilder;
use serde::Serialize;

/// An accepted converge run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConvergeOutcome {
    Clean,
    /// Task failures the policy allows
    Tolerated { failed: u32 },
}

/// Decide whether a converge run lets the phase continue.
///
/// Timeouts and unreachable hosts are never covered by the policy. Task
/// failures are tolerated only when `allow_failures` is set, the count is
/// within `max_failures`, and (when patterns are declared) every captured
/// failure message matches one of them.
pub fn classify(record: &ConvergeRecord, policy: &FailurePolicy, timeout_secs: u64) -> Result<ConvergeOutcome> {
    if record.timed_out {
        return Err(GradeError::Timeout {
            operation: "converge".to_string(),
            seconds: timeout_secs,
        });
    }
    if record.is_clean() {
        return Ok(ConvergeOutcome::Clean);
    }

    if record.totals.unreachable > 0 {
        let hosts: Vec<&str> = record.unreachable_hosts().collect();
        let host = if hosts.is_empty() {
            "unknown".to_string()
        } else {
            hosts.join(", ")
        };
        return Err(GradeError::Unreachable {
            host,
            message: "unreachable during converge".to_string(),
        });
    }

    let failed = record.totals.failed;
    if failed == 0 {
        return Err(GradeError::Converge {
            message: match record.exit_code {
                Some(code) => format!("exited with status {code} without failed tasks"),
                None => "terminated by signal".to_string(),
            },
        });
    }

    if !policy.allow_failures {
        return Err(GradeError::Converge {
            message: format!("{failed} task failure(s) and failures are not allowed"),
        });
    }
    if let Some(max) = policy.max_failures
        && failed > max
    {
        return Err(GradeError::Converge {
            message: format!("{failed} task failure(s) exceed max_failures {max}"),
        });
    }

    if !policy.expected_patterns.is_empty() {
        if record.failure_messages.is_empty() {
            return Err(GradeError::Converge {
                message: "failures expected to match patterns but no failure messages were captured"
                    .to_string(),
            });
        }
        let patterns = policy
            .expected_patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| GradeError::Configuration(format!("failure pattern {p:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        if let Some(unexpected) = record
            .failure_messages
            .iter()
            .find(|m| !patterns.iter().any(|re| re.is_match(m)))
        {
            return Err(GradeError::Converge {
                message: format!("unexpected failure: {unexpected}"),
            });
        }
    }

    log::info!("Tolerating {failed} task failure(s) under the failure policy");
    Ok(ConvergeOutcome::Tolerated { failed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RecapCounters;
    use crate::error::FailureKind;

    fn failed_run(messages: &[&str]) -> ConvergeRecord {
        ConvergeRecord {
            exit_code: Some(2),
            totals: RecapCounters {
                ok: 10,
                failed: messages.len() as u32,
                ..Default::default()
            },
            failure_messages: messages.iter().map(|m| (*m).to_string()).collect(),
            ..Default::default()
        }
    }

    fn refused_policy() -> FailurePolicy {
        FailurePolicy {
            allow_failures: true,
            max_failures: Some(1),
            expected_patterns: vec!["refused".to_string()],
        }
    }

    #[test]
    fn test_one_matching_failure_is_tolerated() {
        let record = failed_run(&["fatal: [web1]: FAILED! => Connection REFUSED"]);
        let outcome = classify(&record, &refused_policy(), 600).unwrap();
        assert_eq!(outcome, ConvergeOutcome::Tolerated { failed: 1 });
    }

    #[test]
    fn test_two_failures_exceed_max() {
        let record = failed_run(&["connection refused", "connection refused"]);
        let err = classify(&record, &refused_policy(), 600).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Converge);
        assert!(err.to_string().contains("max_failures 1"));
    }

    #[test]
    fn test_non_matching_failure_aborts() {
        let record = failed_run(&["fatal: [web1]: FAILED! => permission denied"]);
        let err = classify(&record, &refused_policy(), 600).unwrap_err();
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn test_patterns_without_messages_rejected() {
        let mut record = failed_run(&["x"]);
        record.failure_messages.clear();
        assert!(classify(&record, &refused_policy(), 600).is_err());
    }

    #[test]
    fn test_no_patterns_accepts_any_failure_up_to_limit() {
        let policy = FailurePolicy {
            allow_failures: true,
            max_failures: None,
            expected_patterns: Vec::new(),
        };
        let record = failed_run(&["a", "b", "c"]);
        assert_eq!(
            classify(&record, &policy, 600).unwrap(),
            ConvergeOutcome::Tolerated { failed: 3 }
        );
    }

    #[test]
    fn test_default_policy_rejects_failures() {
        let record = failed_run(&["connection refused"]);
        assert!(classify(&record, &FailurePolicy::default(), 600).is_err());
    }

    #[test]
    fn test_unreachable_never_tolerated() {
        let mut record = failed_run(&["connection refused"]);
        record.totals.unreachable = 1;
        record.hosts.insert(
            "db1".to_string(),
            RecapCounters {
                unreachable: 1,
                ..Default::default()
            },
        );
        let err = classify(&record, &refused_policy(), 600).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Unreachable);
        assert!(err.to_string().contains("db1"));
    }

    #[test]
    fn test_timeout_distinct_from_failure() {
        let record = ConvergeRecord {
            timed_out: true,
            ..Default::default()
        };
        let err = classify(&record, &refused_policy(), 30).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Timeout);
    }

    #[test]
    fn test_nonzero_exit_without_failures_is_converge_error() {
        let record = ConvergeRecord {
            exit_code: Some(4),
            ..Default::default()
        };
        let err = classify(&record, &refused_policy(), 600).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Converge);
    }
}
