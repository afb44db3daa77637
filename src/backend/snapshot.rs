//! Host state snapshots over ssh: file metadata and content, listening
//! sockets, service states and open firewall ports, collected with one
//! remote script per host.

use grading::GradeError;
use grading::context::{
    FileState, HostSnapshot, ListeningSocket, OpenPort, ServiceState, SnapshotCollector,
    SnapshotRequest,
};
use labspec::Protocol;
use std::fmt::Write;

use super::{MARKER, Ssh, check_transport, quote};

impl SnapshotCollector for Ssh {
    fn snapshot(&self, request: &SnapshotRequest) -> grading::Result<HostSnapshot> {
        let host = request.host.as_str();
        let script = snapshot_script(request);
        let out = check_transport(
            host,
            "snapshot",
            self.command_timeout,
            self.run(host, &script, self.command_timeout),
            |message| GradeError::Snapshot {
                host: host.to_string(),
                message,
            },
        )?;
        let snapshot = parse_snapshot(host, &out.stdout);
        log::debug!(
            "Snapshot of {host}: {} file(s), {} socket(s), {} service(s), {} open port(s)",
            snapshot.files.len(),
            snapshot.listening.len(),
            snapshot.services.len(),
            snapshot.firewall.len()
        );
        Ok(snapshot)
    }
}

/// Shell script printing marker-delimited sections for `parse_snapshot`.
pub(crate) fn snapshot_script(request: &SnapshotRequest) -> String {
    let mut s = String::new();
    for path in &request.paths {
        let q = quote(path);
        let _ = writeln!(s, "echo '{MARKER}file' {q}; stat -c '%F|%a|%U|%G' {q} 2>/dev/null || echo missing");
        if request.content_paths.contains(path) {
            let _ = writeln!(
                s,
                "if [ -f {q} ]; then echo '{MARKER}content' {q}; cat {q} 2>/dev/null; printf '\\n{MARKER}end\\n'; fi"
            );
        }
    }
    for service in &request.services {
        let q = quote(service);
        let _ = writeln!(
            s,
            "e=$(systemctl is-enabled {q} 2>/dev/null); a=$(systemctl is-active {q} 2>/dev/null); \
             echo '{MARKER}service' \"${{e:-unknown}}\" \"${{a:-unknown}}\" {q}"
        );
    }
    if request.listening {
        let _ = writeln!(s, "echo '{MARKER}listen'; ss -H -ltnup 2>/dev/null");
    }
    if request.firewall {
        let _ = writeln!(
            s,
            "if command -v firewall-cmd >/dev/null 2>&1; then \
             for z in $(firewall-cmd --get-active-zones 2>/dev/null | grep -v '^ '); do \
             echo '{MARKER}zone' \"$z\" $(firewall-cmd --zone=\"$z\" --list-ports 2>/dev/null); done; fi"
        );
        let _ = writeln!(s, "echo '{MARKER}iptables'; iptables -S INPUT 2>/dev/null");
    }
    s
}

enum Section {
    None,
    Stat(String),
    Content(String, Vec<String>),
    Listen,
    Iptables,
}

/// Parse the output of `snapshot_script`.
pub(crate) fn parse_snapshot(host: &str, output: &str) -> HostSnapshot {
    let mut snap = HostSnapshot {
        host: host.to_string(),
        ..Default::default()
    };
    let mut section = Section::None;

    for line in output.split('\n') {
        if let Section::Content(path, lines) = &mut section {
            if line == format!("{MARKER}end") {
                // the newline printed before the end marker is not content
                let content = lines.join("\n");
                if let Some(file) = snap.files.get_mut(path.as_str())
                    && file.exists
                {
                    file.content = Some(content);
                }
                section = Section::None;
            } else {
                lines.push(line.to_string());
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix(MARKER) {
            let (tag, arg) = rest.split_once(' ').unwrap_or((rest, ""));
            section = match tag {
                "file" => Section::Stat(arg.to_string()),
                "content" => Section::Content(arg.to_string(), Vec::new()),
                "listen" => Section::Listen,
                "iptables" => Section::Iptables,
                "service" => {
                    if let Some((name, state)) = parse_service(arg) {
                        snap.services.insert(name, state);
                    }
                    Section::None
                }
                "zone" => {
                    snap.firewall.extend(parse_zone_ports(arg));
                    Section::None
                }
                _ => Section::None,
            };
            continue;
        }

        match &section {
            Section::Stat(path) => {
                snap.files.insert(path.clone(), parse_stat(line));
                section = Section::None;
            }
            Section::Listen => snap.listening.extend(parse_ss_line(line)),
            Section::Iptables => snap.firewall.extend(parse_iptables_rule(line)),
            _ => {}
        }
    }
    snap
}

/// `regular file|644|root|root`, or `missing`
fn parse_stat(line: &str) -> FileState {
    let fields: Vec<&str> = line.trim().split('|').collect();
    if fields.len() != 4 {
        return FileState::default();
    }
    FileState {
        exists: true,
        is_directory: fields[0] == "directory",
        mode: Some(fields[1].to_string()),
        owner: Some(fields[2].to_string()),
        group: Some(fields[3].to_string()),
        content: None,
    }
}

/// `enabled active nginx`
fn parse_service(arg: &str) -> Option<(String, ServiceState)> {
    let mut parts = arg.split_whitespace();
    let enabled = parts.next()?;
    let active = parts.next()?;
    let name = parts.next()?;
    if enabled == "unknown" {
        return None;
    }
    Some((
        name.trim_matches('\'').to_string(),
        ServiceState {
            enabled: is_enabled_state(enabled),
            active: active == "active",
        },
    ))
}

/// `systemctl is-enabled` states under which the unit starts at boot.
/// `static` units have no install section and start through their
/// dependents; `alias` and `generated` resolve to a unit that does.
fn is_enabled_state(state: &str) -> bool {
    matches!(state, "enabled" | "enabled-runtime" | "static" | "alias" | "generated")
}

/// `public 8080/tcp 53/udp`
fn parse_zone_ports(arg: &str) -> Vec<OpenPort> {
    let mut parts = arg.split_whitespace();
    let Some(zone) = parts.next() else {
        return Vec::new();
    };
    parts
        .filter_map(|spec| {
            let (port, proto) = spec.split_once('/')?;
            Some(OpenPort {
                zone: Some(zone.to_string()),
                port: port.parse().ok()?,
                protocol: parse_protocol(proto)?,
            })
        })
        .collect()
}

/// `-A INPUT -p tcp -m tcp --dport 8080 -j ACCEPT`
fn parse_iptables_rule(line: &str) -> Option<OpenPort> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let after = |flag: &str| {
        tokens
            .iter()
            .position(|t| *t == flag)
            .and_then(|i| tokens.get(i + 1))
            .copied()
    };
    if after("-j")? != "ACCEPT" {
        return None;
    }
    Some(OpenPort {
        zone: None,
        port: after("--dport")?.parse().ok()?,
        protocol: parse_protocol(after("-p")?)?,
    })
}

/// One line of `ss -H -ltnup`:
/// `tcp LISTEN 0 511 0.0.0.0:8080 0.0.0.0:* users:(("nginx",pid=812,fd=6))`
fn parse_ss_line(line: &str) -> Option<ListeningSocket> {
    let cols: Vec<&str> = line.split_whitespace().collect();
    if cols.len() < 5 {
        return None;
    }
    let protocol = parse_protocol(cols[0])?;
    let (address, port) = cols[4].rsplit_once(':')?;
    let address = address
        .split('%')
        .next()
        .unwrap_or(address)
        .trim_start_matches('[')
        .trim_end_matches(']');
    let process = cols
        .get(6)
        .and_then(|p| p.split("((\"").nth(1))
        .and_then(|p| p.split('"').next())
        .map(str::to_string);
    Some(ListeningSocket {
        address: address.to_string(),
        port: port.parse().ok()?,
        protocol,
        process,
    })
}

fn parse_protocol(s: &str) -> Option<Protocol> {
    match s {
        "tcp" => Some(Protocol::Tcp),
        "udp" => Some(Protocol::Udp),
        _ => None,
    }
}
