//! Best-effort discovery of the process holding a host port.
//!
//! Used only for diagnostics on unrepaired collisions; failures to run the
//! lookup tools yield an empty list.

use serde::Serialize;
use std::collections::HashSet;
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub command: Option<String>,
}

/// Find every process listening on `port` (cross-platform, best effort).
pub fn find_processes_on_port(port: u16) -> Vec<ProcessInfo> {
    #[cfg(target_os = "linux")]
    {
        let mut processes = find_processes_ss(port);
        let seen: HashSet<u32> = processes.iter().map(|p| p.pid).collect();
        processes.extend(
            find_processes_lsof(port)
                .into_iter()
                .filter(|p| !seen.contains(&p.pid)),
        );
        processes
    }

    #[cfg(target_os = "macos")]
    {
        find_processes_lsof(port)
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        let _ = port;
        Vec::new()
    }
}

#[cfg(target_os = "linux")]
fn find_processes_ss(port: u16) -> Vec<ProcessInfo> {
    let output = match Command::new("ss")
        .args(["-tlnp", &format!("sport = :{}", port)])
        .output()
    {
        Ok(o) if o.status.success() => o,
        _ => return Vec::new(),
    };

    parse_ss_output(&String::from_utf8_lossy(&output.stdout))
        .into_iter()
        .map(|pid| {
            let name = std::fs::read_to_string(format!("/proc/{}/comm", pid))
                .ok()
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let command = std::fs::read_to_string(format!("/proc/{}/cmdline", pid))
                .ok()
                .map(|s| s.replace('\0', " ").trim().to_string());
            ProcessInfo { pid, name, command }
        })
        .collect()
}

/// Extract unique PIDs from `ss -tlnp` output (`users:(("x",pid=1,fd=3))`).
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_ss_output(stdout: &str) -> Vec<u32> {
    let mut pids = Vec::new();
    let mut seen = HashSet::new();

    for line in stdout.lines().skip(1) {
        let Some(users) = line.split_whitespace().last() else {
            continue;
        };
        for part in users.split(',') {
            let pid = part
                .strip_prefix("pid=")
                .map(|p| p.trim_end_matches(|c: char| !c.is_ascii_digit()))
                .and_then(|p| p.parse::<u32>().ok());
            if let Some(pid) = pid {
                if seen.insert(pid) {
                    pids.push(pid);
                }
            }
        }
    }

    pids
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn find_processes_lsof(port: u16) -> Vec<ProcessInfo> {
    let output = match Command::new("lsof")
        .args([
            "-iTCP",
            &format!(":{}", port),
            "-sTCP:LISTEN",
            "-P",
            "-n",
            "-F",
            "pc",
        ])
        .output()
    {
        Ok(o) if o.status.success() => o,
        _ => return Vec::new(),
    };

    parse_lsof_output(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `lsof -F pc` field output: each process block starts with a `p`
/// line followed by a `c` (command) line.
#[cfg_attr(not(any(target_os = "linux", target_os = "macos")), allow(dead_code))]
fn parse_lsof_output(stdout: &str) -> Vec<ProcessInfo> {
    let mut processes: Vec<ProcessInfo> = Vec::new();
    let mut seen = HashSet::new();
    let mut current_pid: Option<u32> = None;
    let mut current_command: Option<String> = None;

    let mut flush = |pid: Option<u32>, command: Option<String>, out: &mut Vec<ProcessInfo>| {
        if let Some(pid) = pid {
            if seen.insert(pid) {
                out.push(ProcessInfo {
                    pid,
                    name: command.clone().unwrap_or_else(|| "unknown".to_string()),
                    command,
                });
            }
        }
    };

    for line in stdout.lines() {
        if let Some(stripped) = line.strip_prefix('p') {
            flush(current_pid, current_command.take(), &mut processes);
            current_pid = stripped.parse::<u32>().ok();
        } else if let Some(stripped) = line.strip_prefix('c') {
            current_command = Some(stripped.to_string());
        }
    }
    flush(current_pid, current_command, &mut processes);

    processes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lsof_field_output() {
        let out = "p123\ncnginx\np456\ncpython3\np123\ncnginx\n";
        let procs = parse_lsof_output(out);
        assert_eq!(procs.len(), 2);
        assert_eq!(procs[0].pid, 123);
        assert_eq!(procs[0].name, "nginx");
        assert_eq!(procs[1].pid, 456);
        assert_eq!(procs[1].command.as_deref(), Some("python3"));
    }

    #[test]
    fn lsof_block_without_command_is_unknown() {
        let procs = parse_lsof_output("p77\n");
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].name, "unknown");
        assert!(procs[0].command.is_none());
    }

    #[test]
    fn parses_ss_users_column() {
        let out = "State Recv-Q Send-Q Local Peer Process\n\
                   LISTEN 0 128 0.0.0.0:8080 0.0.0.0:* users:((\"nginx\",pid=901,fd=6),(\"nginx\",pid=902,fd=6))\n";
        assert_eq!(parse_ss_output(out), vec![901, 902]);
    }
}
