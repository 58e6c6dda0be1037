use super::{parse_duration_string, Config, MachineConfig};
use crate::error::{Error, Result};
use crate::port::{HostIp, PortRange};
use std::collections::HashSet;

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_range("usable_port_range", &self.usable_port_range)?;

        if let Some(ref ttl) = self.lease_ttl {
            validate_duration("lease_ttl", ttl)?;
        }
        if let Some(ref backoff) = self.lock.backoff {
            validate_duration("lock.backoff", backoff)?;
        }
        if self.lock.max_attempts == Some(0) {
            return Err(Error::Validation(
                "lock.max_attempts must be at least 1 (omit it to retry forever)".to_string(),
            ));
        }

        for (port, owners) in &self.extra_in_use {
            if *port == 0 {
                return Err(Error::Validation(
                    "extra_in_use: port 0 is not a valid host port".to_string(),
                ));
            }
            for owner in owners {
                owner.parse::<HostIp>().map_err(|e| {
                    Error::Validation(format!("extra_in_use port {}: {}", port, e))
                })?;
            }
        }

        for (from, to) in &self.remap {
            if *from == 0 || *to == 0 {
                return Err(Error::Validation(format!(
                    "remap {} -> {}: port 0 is not a valid host port",
                    from, to
                )));
            }
        }

        let mut names = HashSet::new();
        for machine in &self.machines {
            if !names.insert(machine.name.as_str()) {
                return Err(Error::Validation(format!(
                    "Machine '{}' is defined more than once",
                    machine.name
                )));
            }
            validate_machine(machine)?;
        }

        Ok(())
    }
}

fn validate_machine(machine: &MachineConfig) -> Result<()> {
    let name = &machine.name;
    if name.trim().is_empty() {
        return Err(Error::Validation("Machine name cannot be empty".to_string()));
    }
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(Error::Validation(format!(
            "Machine name '{}' cannot contain path separators",
            name
        )));
    }

    if let Some(ref range) = machine.usable_port_range {
        validate_range(&format!("machine '{}' usable_port_range", name), range)?;
    }

    let mut ids = HashSet::new();
    let mut bindings = HashSet::new();
    for rule in &machine.forwarded_ports {
        if rule.guest_port == 0 || rule.host_port == 0 {
            return Err(Error::Validation(format!(
                "Machine '{}': forwarded port {} -> {} uses port 0",
                name, rule.guest_port, rule.host_port
            )));
        }

        let id = rule.effective_id();
        if !ids.insert(id.clone()) {
            return Err(Error::Validation(format!(
                "Machine '{}': forwarded port id '{}' is used more than once",
                name, id
            )));
        }

        if !rule.disabled && !bindings.insert((rule.host_ip, rule.host_port, rule.protocol)) {
            return Err(Error::Validation(format!(
                "Machine '{}': host port {}:{} ({}) is forwarded more than once",
                name, rule.host_ip, rule.host_port, rule.protocol
            )));
        }
    }

    Ok(())
}

fn validate_range(what: &str, range: &PortRange) -> Result<()> {
    if range.start == 0 {
        return Err(Error::Validation(format!(
            "{}: start must be at least 1",
            what
        )));
    }
    if range.is_empty() {
        return Err(Error::Validation(format!(
            "{}: start {} is greater than end {}",
            what, range.start, range.end
        )));
    }
    Ok(())
}

fn validate_duration(what: &str, value: &str) -> Result<()> {
    parse_duration_string(value).map(|_| ()).ok_or_else(|| {
        Error::Validation(format!(
            "{}: invalid duration '{}' (expected e.g. '500ms', '5s', '1m')",
            what, value
        ))
    })
}
