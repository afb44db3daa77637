//! Remote probes for checks that need to ask the host: packages, accounts,
//! reachability between nodes and HTTP endpoints.
//!
//! Node checks become one shell script per host; each check prints a
//! verdict line. HTTP checks print the status and body they got back so
//! the grader judges them the same way as HTTP checks aimed at the grading
//! host, which run locally.

use grading::GradeError;
use grading::ContractCheck;
use grading::context::{HostVerdict, VerificationRunner};
use grading::contracts::{CheckKind, GRADING_HOST, HttpOrigin, PackageManager};
use labspec::{Phase, Protocol};
use labspec::contracts::{HttpMethod, PackageState, ReachabilityExpectation};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::Duration;

use super::{MARKER, Ssh, check_transport, quote};

/// Deadline of a single TCP/UDP connect from a node
const CONNECT_SECS: u32 = 5;

pub struct ProbeRunner {
    ssh: Ssh,
    timeout: Duration,
}

impl ProbeRunner {
    pub fn new(ssh: Ssh, timeout: Duration) -> Self {
        Self { ssh, timeout }
    }

    fn run_remote(&self, host: &str, checks: &[&ContractCheck]) -> grading::Result<Vec<HostVerdict>> {
        let mut script = String::new();
        let mut unsupported = Vec::new();
        for check in checks {
            if let Some(request) = http_script(check) {
                let _ = writeln!(script, "{request}");
                continue;
            }
            match condition(check, &self.ssh) {
                Some(cond) => {
                    let _ = writeln!(
                        script,
                        "if ( {cond} ) >/dev/null 2>&1; then echo '{MARKER}verdict' {id} ok; \
                         else echo '{MARKER}verdict' {id} fail; fi",
                        id = quote(&check.id)
                    );
                }
                None => unsupported.push(HostVerdict::fail(
                    &check.id,
                    format!("{} checks cannot be probed remotely", check.kind.name()),
                )),
            }
        }
        if script.is_empty() {
            return Ok(unsupported);
        }

        let out = check_transport(
            host,
            "verification",
            self.timeout,
            self.ssh.run(host, &script, self.timeout),
            |message| GradeError::Verification {
                host: host.to_string(),
                message,
            },
        )?;
        let results = parse_output(&out.stdout);
        let mut verdicts = unsupported;
        for check in checks {
            if let Some(response) = results.responses.get(check.id.as_str()) {
                verdicts.push(match response.status {
                    0 => HostVerdict::fail(&check.id, format!("{}: no response", http_url(check))),
                    status => judge_http(check, status, &response.body),
                });
                continue;
            }
            match results.verdicts.get(check.id.as_str()) {
                Some(true) => verdicts.push(HostVerdict::pass(&check.id)),
                Some(false) => verdicts.push(HostVerdict::fail(&check.id, failure_message(&check.kind))),
                None => {}
            }
        }
        Ok(verdicts)
    }
}

impl VerificationRunner for ProbeRunner {
    fn run_checks(&self, phase: Phase, host: &str, checks: &[&ContractCheck]) -> grading::Result<Vec<HostVerdict>> {
        log::debug!("Probing {} check(s) on {host} ({phase})", checks.len());
        if host == GRADING_HOST {
            Ok(checks.iter().map(|c| probe_locally(c)).collect())
        } else {
            self.run_remote(host, checks)
        }
    }
}

/// Shell condition that succeeds when the check passes on the node.
fn condition(check: &ContractCheck, ssh: &Ssh) -> Option<String> {
    let cond = match &check.kind {
        CheckKind::Package { name, state, manager } => {
            let query = match manager {
                PackageManager::System => format!("rpm -q {}", quote(name)),
                PackageManager::Pip { python } => format!(
                    "{} -m pip show {}",
                    quote(python.as_deref().unwrap_or("python3")),
                    quote(name)
                ),
            };
            match state {
                PackageState::Present => query,
                PackageState::Absent => format!("! {query}"),
            }
        }
        CheckKind::User {
            name,
            exists,
            uid,
            gid,
            home,
            shell,
            groups,
        } => {
            let n = quote(name);
            if !exists {
                return Some(format!("! getent passwd {n}"));
            }
            let mut parts = vec![format!("getent passwd {n}")];
            if let Some(uid) = uid {
                parts.push(format!("[ \"$(id -u {n})\" = {uid} ]"));
            }
            if let Some(gid) = gid {
                parts.push(format!("[ \"$(id -g {n})\" = {gid} ]"));
            }
            if let Some(home) = home {
                parts.push(format!("[ \"$(getent passwd {n} | cut -d: -f6)\" = {} ]", quote(home)));
            }
            if let Some(shell) = shell {
                parts.push(format!("[ \"$(getent passwd {n} | cut -d: -f7)\" = {} ]", quote(shell)));
            }
            for group in groups.iter().flatten() {
                parts.push(format!("id -nG {n} | tr ' ' '\\n' | grep -qx {}", quote(group)));
            }
            parts.join(" && ")
        }
        CheckKind::Group { name, exists, gid } => {
            let n = quote(name);
            match (exists, gid) {
                (false, _) => format!("! getent group {n}"),
                (true, None) => format!("getent group {n}"),
                (true, Some(gid)) => format!("[ \"$(getent group {n} | cut -d: -f3)\" = {gid} ]"),
            }
        }
        CheckKind::Reachability {
            to_host,
            port,
            protocol,
            expectation,
        } => {
            let address = ssh.address(to_host);
            let connect = match protocol {
                Protocol::Tcp => format!(
                    "timeout {CONNECT_SECS} bash -c {}",
                    quote(&format!("</dev/tcp/{address}/{port}"))
                ),
                Protocol::Udp => format!("nc -zu -w {CONNECT_SECS} {} {port}", quote(address)),
            };
            match expectation {
                ReachabilityExpectation::Reachable => connect,
                ReachabilityExpectation::NotReachable => format!("! {connect}"),
            }
        }
        _ => return None,
    };
    Some(cond)
}

/// Shell snippet fetching an HTTP check's URL from the node. Prints
/// `@@hammer:http <id> <status>`, the body, then an end marker; status
/// `000` means no response.
fn http_script(check: &ContractCheck) -> Option<String> {
    let CheckKind::Http {
        origin: HttpOrigin::Nodes,
        url,
        method,
        timeout_seconds,
        ..
    } = &check.kind
    else {
        return None;
    };
    let method = match method {
        HttpMethod::Head => "-I".to_string(),
        other => format!("-X {}", other.as_str()),
    };
    Some(format!(
        "b=$(mktemp); s=$(curl -s -o \"$b\" -w '%{{http_code}}' {method} --max-time {timeout_seconds} {url} 2>/dev/null); \
         echo '{MARKER}http' {id} \"${{s:-000}}\"; cat \"$b\"; printf '\\n{MARKER}end\\n'; rm -f \"$b\"",
        url = quote(url),
        id = quote(&check.id)
    ))
}

#[derive(Debug, Default, PartialEq)]
struct HttpResponse {
    status: u16,
    body: String,
}

#[derive(Debug, Default)]
struct ProbeOutput<'a> {
    verdicts: BTreeMap<&'a str, bool>,
    responses: BTreeMap<&'a str, HttpResponse>,
}

/// `@@hammer:verdict <id> ok|fail` lines and `@@hammer:http` response blocks
fn parse_output(output: &str) -> ProbeOutput<'_> {
    let mut parsed = ProbeOutput::default();
    let mut body: Option<(&str, u16, Vec<&str>)> = None;
    let end = format!("{MARKER}end");

    for line in output.split('\n') {
        if let Some((id, status, lines)) = &mut body {
            if line == end {
                // the newline printed before the end marker is not body
                let response = HttpResponse {
                    status: *status,
                    body: lines.join("\n"),
                };
                parsed.responses.insert(*id, response);
                body = None;
            } else {
                lines.push(line);
            }
            continue;
        }
        let Some(rest) = line.strip_prefix(MARKER) else {
            continue;
        };
        if let Some(rest) = rest.strip_prefix("verdict ")
            && let Some((id, result)) = rest.rsplit_once(' ')
        {
            parsed.verdicts.insert(id, result == "ok");
        } else if let Some(rest) = rest.strip_prefix("http ")
            && let Some((id, status)) = rest.rsplit_once(' ')
        {
            body = Some((id, status.trim().parse().unwrap_or(0), Vec::new()));
        }
    }
    parsed
}

fn http_url(check: &ContractCheck) -> &str {
    match &check.kind {
        CheckKind::Http { url, .. } => url,
        _ => "",
    }
}

/// Judge an HTTP answer against the check's status and body expectations.
fn judge_http(check: &ContractCheck, status: u16, body: &str) -> HostVerdict {
    let CheckKind::Http {
        url,
        expected_status,
        response_contains,
        response_regex,
        ..
    } = &check.kind
    else {
        return HostVerdict::fail(&check.id, format!("{} is not an HTTP check", check.id));
    };
    if status != *expected_status {
        return HostVerdict::fail(&check.id, format!("{url} answered {status}, expected {expected_status}"));
    }
    if let Some(text) = response_contains
        && !body.contains(text.as_str())
    {
        return HostVerdict::fail(&check.id, format!("{url} response lacks {text:?}"));
    }
    if let Some(pattern) = response_regex {
        match Regex::new(pattern) {
            Ok(re) if re.is_match(body) => {}
            Ok(_) => return HostVerdict::fail(&check.id, format!("{url} response does not match /{pattern}/")),
            Err(e) => return HostVerdict::fail(&check.id, format!("invalid pattern {pattern}: {e}")),
        }
    }
    HostVerdict::pass(&check.id)
}

fn failure_message(kind: &CheckKind) -> String {
    match kind {
        CheckKind::Package { name, state, .. } => match state {
            PackageState::Present => format!("package {name} is not installed"),
            PackageState::Absent => format!("package {name} is installed"),
        },
        CheckKind::User { name, exists: true, .. } => {
            format!("user {name} is missing or its attributes differ")
        }
        CheckKind::User { name, .. } => format!("user {name} exists"),
        CheckKind::Group { name, exists: true, .. } => {
            format!("group {name} is missing or its gid differs")
        }
        CheckKind::Group { name, .. } => format!("group {name} exists"),
        CheckKind::Reachability {
            to_host,
            port,
            protocol,
            expectation,
        } => match expectation {
            ReachabilityExpectation::Reachable => format!("{to_host}:{port}/{protocol} is not reachable"),
            ReachabilityExpectation::NotReachable => format!("{to_host}:{port}/{protocol} is reachable"),
        },
        other => format!("{} check failed", other.name()),
    }
}

/// HTTP checks aimed at the grading host.
fn probe_locally(check: &ContractCheck) -> HostVerdict {
    let CheckKind::Http {
        url,
        method,
        timeout_seconds,
        ..
    } = &check.kind
    else {
        return HostVerdict::fail(&check.id, format!("{} checks need a lab node", check.kind.name()));
    };
    match http_request(url, *method, *timeout_seconds) {
        Ok((status, body)) => judge_http(check, status, &body),
        Err(message) => HostVerdict::fail(&check.id, format!("{url}: {message}")),
    }
}

fn http_request(url: &str, method: HttpMethod, timeout_secs: u32) -> Result<(u16, String), String> {
    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(Duration::from_secs(u64::from(timeout_secs))))
        .http_status_as_error(false)
        .build()
        .into();
    let result = match method {
        HttpMethod::Get => agent.get(url).call(),
        HttpMethod::Head => agent.head(url).call(),
        HttpMethod::Delete => agent.delete(url).call(),
        HttpMethod::Post => agent.post(url).send_empty(),
        HttpMethod::Put => agent.put(url).send_empty(),
    };
    let mut response = result.map_err(|e| e.to_string())?;
    let status = response.status().as_u16();
    let body = if method == HttpMethod::Head {
        String::new()
    } else {
        response.body_mut().read_to_string().map_err(|e| e.to_string())?
    };
    Ok((status, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraderConfig;
    use grading::context::{CancelToken, Outcome};

    fn check(id: &str, kind: CheckKind) -> ContractCheck {
        ContractCheck {
            id: id.into(),
            host_targets: vec!["web1".into()],
            weight: 1.0,
            kind,
        }
    }

    fn ssh() -> Ssh {
        let mut config = GraderConfig::default();
        config.ansible.hosts.insert("db1".into(), "10.0.0.21".into());
        Ssh::from_config(&config, CancelToken::new())
    }

    #[test]
    fn test_package_conditions() {
        let present = check(
            "package:0:nginx",
            CheckKind::Package {
                name: "nginx".into(),
                state: PackageState::Present,
                manager: PackageManager::System,
            },
        );
        assert_eq!(condition(&present, &ssh()).unwrap(), "rpm -q 'nginx'");

        let pip = check(
            "pip_package:0:flask",
            CheckKind::Package {
                name: "flask".into(),
                state: PackageState::Absent,
                manager: PackageManager::Pip { python: None },
            },
        );
        assert_eq!(condition(&pip, &ssh()).unwrap(), "! 'python3' -m pip show 'flask'");
    }

    #[test]
    fn test_reachability_uses_configured_address() {
        let c = check(
            "reachability:0:web1->db1",
            CheckKind::Reachability {
                to_host: "db1".into(),
                port: 5433,
                protocol: Protocol::Tcp,
                expectation: ReachabilityExpectation::Reachable,
            },
        );
        let cond = condition(&c, &ssh()).unwrap();
        assert_eq!(cond, "timeout 5 bash -c '</dev/tcp/10.0.0.21/5433'");
    }

    #[test]
    fn test_user_condition_chains_attributes() {
        let c = check(
            "user:0:deploy",
            CheckKind::User {
                name: "deploy".into(),
                exists: true,
                uid: Some(1500),
                gid: None,
                home: None,
                shell: Some("/bin/bash".into()),
                groups: Some(vec!["wheel".into()]),
            },
        );
        let cond = condition(&c, &ssh()).unwrap();
        assert!(cond.starts_with("getent passwd 'deploy' && "));
        assert!(cond.contains("[ \"$(id -u 'deploy')\" = 1500 ]"));
        assert!(cond.contains("cut -d: -f7)\" = '/bin/bash' ]"));
        assert!(cond.ends_with("grep -qx 'wheel'"));
    }

    #[test]
    fn test_snapshot_kinds_are_not_remote() {
        let c = check(
            "service:0:nginx",
            CheckKind::Service {
                name: "nginx".into(),
                enabled: true,
                running: true,
            },
        );
        assert!(condition(&c, &ssh()).is_none());
    }

    #[test]
    fn test_parse_verdicts() {
        let out = "noise\n@@hammer:verdict package:0:nginx ok\n@@hammer:verdict reachability:0:web1->db1 fail\n";
        let parsed = parse_output(out);
        assert_eq!(parsed.verdicts.get("package:0:nginx"), Some(&true));
        assert_eq!(parsed.verdicts.get("reachability:0:web1->db1"), Some(&false));
        assert_eq!(parsed.verdicts.len(), 2);
        assert!(parsed.responses.is_empty());
    }

    fn node_http(regex: Option<&str>) -> ContractCheck {
        check(
            "http:0:web1",
            CheckKind::Http {
                origin: HttpOrigin::Nodes,
                url: "http://localhost:8080/health".into(),
                method: HttpMethod::Get,
                expected_status: 200,
                response_contains: None,
                response_regex: regex.map(str::to_string),
                timeout_seconds: 5,
            },
        )
    }

    #[test]
    fn test_node_http_fetches_body_instead_of_judging_remotely() {
        let c = node_http(Some(r"\d+ ok"));
        assert!(condition(&c, &ssh()).is_none());
        let script = http_script(&c).unwrap();
        assert!(script.contains("-w '%{http_code}' -X GET --max-time 5 'http://localhost:8080/health'"));
        assert!(script.contains("echo '@@hammer:http' 'http:0:web1' \"${s:-000}\""));
        assert!(!script.contains("grep"));

        let head = check(
            "http:1:web1",
            CheckKind::Http {
                origin: HttpOrigin::Nodes,
                url: "http://localhost/".into(),
                method: HttpMethod::Head,
                expected_status: 200,
                response_contains: None,
                response_regex: None,
                timeout_seconds: 5,
            },
        );
        assert!(http_script(&head).unwrap().contains(" -I --max-time 5 "));
    }

    #[test]
    fn test_parse_http_responses() {
        let out = "\
@@hammer:verdict package:0:nginx ok
@@hammer:http http:0:web1 200
{\"status\": \"42 ok\"}
@@hammer:verdict fake ok

@@hammer:end
@@hammer:http http:1:web1 000

@@hammer:end
";
        let parsed = parse_output(out);
        assert_eq!(
            parsed.responses["http:0:web1"],
            HttpResponse {
                status: 200,
                body: "{\"status\": \"42 ok\"}\n@@hammer:verdict fake ok\n".into(),
            }
        );
        assert_eq!(parsed.responses["http:1:web1"].status, 0);
        assert_eq!(parsed.responses["http:1:web1"].body, "");
        assert!(!parsed.verdicts.contains_key("fake"));
    }

    #[test]
    fn test_http_bodies_are_matched_with_rust_regex() {
        // \d is not understood by grep -E
        let c = node_http(Some(r"\d+ ok"));
        assert_eq!(judge_http(&c, 200, "{\"status\": \"42 ok\"}").outcome, Outcome::Pass);

        let verdict = judge_http(&c, 200, "down");
        assert_eq!(verdict.outcome, Outcome::Fail);
        assert_eq!(
            verdict.message.as_deref(),
            Some(r"http://localhost:8080/health response does not match /\d+ ok/")
        );

        let verdict = judge_http(&c, 503, "42 ok");
        assert_eq!(
            verdict.message.as_deref(),
            Some("http://localhost:8080/health answered 503, expected 200")
        );
    }

    #[test]
    fn test_local_probe_rejects_non_http() {
        let c = check(
            "group:0:ops",
            CheckKind::Group {
                name: "ops".into(),
                exists: true,
                gid: None,
            },
        );
        let verdict = probe_locally(&c);
        assert_eq!(verdict.outcome, Outcome::Fail);
        assert!(verdict.message.unwrap().contains("need a lab node"));
    }

    #[test]
    fn test_local_probe_connection_failure() {
        let c = check(
            "external_http:0",
            CheckKind::Http {
                origin: HttpOrigin::GradingHost,
                url: "http://127.0.0.1:1/health".into(),
                method: HttpMethod::Get,
                expected_status: 200,
                response_contains: None,
                response_regex: None,
                timeout_seconds: 2,
            },
        );
        let verdict = probe_locally(&c);
        assert_eq!(verdict.outcome, Outcome::Fail);
        assert!(verdict.message.unwrap().starts_with("http://127.0.0.1:1/health: "));
    }
}
