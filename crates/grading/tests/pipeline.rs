//! End-to-end grading of the sample lab against a scripted submission that
//! hardcodes its listen port.

use grading::context::{
    AutomationRunner, CancelToken, ConvergeRecord, ConvergeRequest, FileState, HostSnapshot,
    HostVerdict, ListeningSocket, NoProgress, OpenPort, RebootAgent, RecapCounters, ServiceState,
    SnapshotCollector, SnapshotRequest, VerificationRunner,
};
use grading::poll::Clock;
use grading::{
    Collaborators, ContractCheck, Orchestrator, OrchestratorOptions, PhaseStatus, PhaseVariablePlan,
    PlanOptions, RunStatus,
};
use labspec::{LabSpec, Phase, Protocol};
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WEB_LAB: &str = include_str!("../../../demos/web_lab.yaml");

/// A playbook that always configures nginx on 8080 and restarts it on every run.
struct HardcodedPort {
    runs: Mutex<u32>,
    rebooting: Mutex<BTreeSet<String>>,
}

impl AutomationRunner for HardcodedPort {
    fn stage(&self, _phase: Phase, _vars: &PhaseVariablePlan) -> grading::Result<()> {
        Ok(())
    }

    fn converge(&self, _request: &ConvergeRequest) -> grading::Result<ConvergeRecord> {
        *self.runs.lock().unwrap() += 1;
        let mut record = ConvergeRecord {
            exit_code: Some(0),
            totals: RecapCounters {
                ok: 9,
                changed: 1,
                ..Default::default()
            },
            changed_tasks: vec!["Restart web server".to_string()],
            output: "TASK [Deploy application] ***\n".to_string(),
            ..Default::default()
        };
        record.handlers.insert(
            "restart nginx".to_string(),
            [("web1".to_string(), 1), ("web2".to_string(), 1)].into(),
        );
        Ok(record)
    }
}

impl RebootAgent for HardcodedPort {
    fn reboot(&self, host: &str) -> grading::Result<()> {
        self.rebooting.lock().unwrap().insert(host.to_string());
        Ok(())
    }

    /// Down on the first probe after a reboot, up afterwards.
    fn is_reachable(&self, host: &str, _timeout: Duration) -> bool {
        !self.rebooting.lock().unwrap().remove(host)
    }
}

impl SnapshotCollector for HardcodedPort {
    fn snapshot(&self, request: &SnapshotRequest) -> grading::Result<HostSnapshot> {
        let mut snap = HostSnapshot {
            host: request.host.clone(),
            ..Default::default()
        };
        let (port, process) = if request.host == "db1" { (5432, "postgres") } else { (8080, "nginx") };
        snap.listening.push(ListeningSocket {
            address: "0.0.0.0".to_string(),
            port,
            protocol: Protocol::Tcp,
            process: Some(process.to_string()),
        });
        snap.firewall.push(OpenPort {
            zone: Some("public".to_string()),
            port,
            protocol: Protocol::Tcp,
        });
        snap.services.insert(
            "nginx".to_string(),
            ServiceState {
                enabled: true,
                active: true,
            },
        );
        snap.files.insert(
            "/etc/nginx/conf.d/app.conf".to_string(),
            FileState {
                exists: true,
                mode: Some("0644".to_string()),
                owner: Some("root".to_string()),
                group: Some("root".to_string()),
                content: Some("listen 8080;".to_string()),
                ..Default::default()
            },
        );
        Ok(snap)
    }
}

impl VerificationRunner for HardcodedPort {
    fn run_checks(&self, _phase: Phase, _host: &str, checks: &[&ContractCheck]) -> grading::Result<Vec<HostVerdict>> {
        Ok(checks.iter().map(|c| HostVerdict::pass(&c.id)).collect())
    }
}

struct InstantClock(Mutex<Instant>);

impl Clock for InstantClock {
    fn now(&self) -> Instant {
        *self.0.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        *self.0.lock().unwrap() += duration;
    }
}

#[test]
fn test_hardcoded_port_loses_mutation_and_idempotence_credit() {
    let spec = LabSpec::from_yaml_str(WEB_LAB).unwrap();
    let lab = HardcodedPort {
        runs: Mutex::new(0),
        rebooting: Mutex::new(BTreeSet::new()),
    };
    let clock = InstantClock(Mutex::new(Instant::now()));
    let collab = Collaborators {
        runner: &lab,
        reboot: &lab,
        snapshots: &lab,
        verifier: &lab,
        clock: &clock,
    };
    let options = OrchestratorOptions {
        verify_jobs: 1,
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(collab, options, CancelToken::new()).unwrap();
    let report = grading::grade(&spec, &PlanOptions::default(), &orchestrator, &mut NoProgress);

    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.phases.iter().all(|p| p.status == PhaseStatus::Scored));
    assert_eq!(*lab.runs.lock().unwrap(), 3);

    // baseline expects 8080 everywhere
    let baseline = report.phase(Phase::Baseline).unwrap();
    assert_eq!(baseline.score.percentage, 100.0);

    // mutation expects 9090 on the web hosts and 5433 on db1
    let mutation = report.phase(Phase::Mutation).unwrap();
    let failed: Vec<&str> = mutation
        .checks
        .iter()
        .filter(|c| !c.passed())
        .map(|c| c.id.as_str())
        .collect();
    assert_eq!(
        failed,
        [
            "binding:http_port:0",
            "binding:http_port:1",
            "binding:http_port:2",
            "binding:db_port:0",
            "firewall:0",
        ]
    );

    // restarting on every run breaks idempotence and the handler expectation
    let idem = report.phase(Phase::Idempotence).unwrap();
    let idem_check = idem.checks.iter().find(|c| c.id == "idempotence").unwrap();
    assert!(!idem_check.passed());
    let handler = idem.checks.iter().find(|c| c.id == "handler:0").unwrap();
    assert!(!handler.passed());

    assert!(report.score.percentage < 100.0);
    assert!(!report.is_success());

    let dir = tempfile::tempdir().unwrap();
    report.write(dir.path()).unwrap();
    let summary = std::fs::read_to_string(dir.path().join("summary.txt")).unwrap();
    assert!(summary.contains("MUTATION:"));
    assert!(summary.contains("FAIL binding:http_port:0"));
    assert!(summary.contains("Overall: FAIL"));
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("report.json")).unwrap()).unwrap();
    assert_eq!(json["phases"].as_array().unwrap().len(), 3);
}
