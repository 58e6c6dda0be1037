// Allow unused_assignments at module level because thiserror's generated code
// for struct variants triggers false positive warnings - the fields ARE used
// in the Display impl but rustc's lint pass doesn't see this.
#![allow(unused_assignments)]

use crate::port::ProcessInfo;
use miette::Diagnostic;
use std::io;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    #[diagnostic(
        code(vmports::config::validation),
        help("Run `vmports validate` for detailed validation errors")
    )]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Filesystem error: {0}")]
    #[diagnostic(
        code(vmports::filesystem::error),
        help("Check permissions on the machine data directory")
    )]
    Filesystem(String),

    #[error("Port probe failed: {0}")]
    #[diagnostic(code(vmports::port::probe_failed))]
    Probe(String),

    #[error("Forwarded port collision: guest port {guest_port} -> host port {host_port} is already in use{}",
        .holder.as_ref()
            .map(|p| format!(" by process '{}' (PID {})", p.name, p.pid))
            .unwrap_or_default()
    )]
    #[diagnostic(
        code(vmports::port::collision),
        help("Set `auto_correct: true` on the rule, or change `host: {host_port}` to a free port")
    )]
    ForwardPortCollision {
        guest_port: u16,
        host_port: u16,
        holder: Option<ProcessInfo>,
    },

    #[error("Machine '{machine}': no free port left in the usable port range to repair guest port {guest_port} (host port {host_port})")]
    #[diagnostic(
        code(vmports::port::autolist_empty),
        help("Widen `usable_port_range` or stop machines holding ports in that range")
    )]
    ForwardPortAutolistEmpty {
        machine: String,
        guest_port: u16,
        host_port: u16,
    },

    #[error("Timed out acquiring lock '{label}' after {attempts} attempt(s)")]
    #[diagnostic(
        code(vmports::lock::timeout),
        help("Another vmports process is holding the lock. Wait for it to finish or raise `lock.max_attempts`")
    )]
    LockTimeout { label: String, attempts: u32 },

    #[error("Machine not found: {0}")]
    #[diagnostic(
        code(vmports::machine::not_found),
        help("List machines in the `machines:` section of vmports.yaml")
    )]
    MachineNotFound(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::ForwardPortCollision {
                host_port, holder, ..
            } => {
                let holder_hint = match holder {
                    Some(p) => format!("Stop '{}' (PID {}) to free it, or ", p.name, p.pid),
                    None => "Free the port, or ".to_string(),
                };
                Some(format!(
                    "Host port {} is taken. {}set `auto_correct: true` on the rule so a free port from `usable_port_range` is picked.",
                    host_port, holder_hint
                ))
            }
            Error::ForwardPortAutolistEmpty { machine, .. } => Some(format!(
                "Every candidate port for '{}' is in use or leased. Widen `usable_port_range` or wait a minute for stale leases to expire.",
                machine
            )),
            Error::LockTimeout { label, .. } => Some(format!(
                "Another pass holds the '{}' lock. If no vmports process is running, the lock is released automatically once its holder exits.",
                label
            )),
            Error::Filesystem(_) => Some(
                "Leases must be written reliably; fix the data directory permissions and retry."
                    .to_string(),
            ),
            Error::Config(msg) if msg.contains("Could not find") => None,
            Error::Config(_) | Error::Validation(_) => {
                Some("Validate your config with: vmports validate".to_string())
            }
            Error::MachineNotFound(name) => Some(format!(
                "Check the spelling of '{}' against the `machines:` section of your config.",
                name
            )),
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collision_message_names_both_ports() {
        let err = Error::ForwardPortCollision {
            guest_port: 22,
            host_port: 2222,
            holder: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("guest port 22"));
        assert!(msg.contains("host port 2222"));
        assert!(!msg.contains("PID"));
    }

    #[test]
    fn collision_message_includes_holder_when_known() {
        let err = Error::ForwardPortCollision {
            guest_port: 80,
            host_port: 8080,
            holder: Some(ProcessInfo {
                pid: 4242,
                name: "nginx".to_string(),
                command: None,
            }),
        };
        assert!(err.to_string().contains("by process 'nginx' (PID 4242)"));
        assert!(err.with_suggestion().contains("Stop 'nginx'"));
    }

    #[test]
    fn exhaustion_names_machine() {
        let err = Error::ForwardPortAutolistEmpty {
            machine: "web".to_string(),
            guest_port: 80,
            host_port: 8080,
        };
        assert!(err.to_string().contains("Machine 'web'"));
        assert!(err.suggestion().unwrap().contains("usable_port_range"));
    }
}
