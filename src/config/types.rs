//! Core configuration types.
//!
//! This module contains the root [`Config`] struct and the per-machine
//! section of `vmports.yaml`.

use super::parse_duration_string;
use crate::error::{Error, Result};
use crate::lock::{RetryPolicy, DEFAULT_LOCK_BACKOFF};
use crate::orchestrator::{Machine, PassOptions};
use crate::port::{
    ExternalClaims, ForwardingRule, HostIp, PortRange, RemapTable, DEFAULT_LEASE_TTL,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default state directory, relative to the config file.
pub const DEFAULT_DATA_DIR: &str = ".vmports";

/// Root configuration structure for vmports.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// State directory (locks, leases, remembered ports). Relative paths are
    /// resolved against the config file's directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Allow repairing colliding ports at all. Rules still opt in with
    /// `auto_correct`.
    #[serde(default = "default_repair")]
    pub repair: bool,

    #[serde(default)]
    pub usable_port_range: PortRange,

    /// How long a lease survives without being released (e.g. "60s").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_ttl: Option<String>,

    #[serde(default)]
    pub lock: LockConfig,

    /// Ports held by things outside this config: port -> host IPs (`*` for
    /// every interface). An empty list registers the port with no owner.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_in_use: BTreeMap<u16, Vec<String>>,

    /// Forced host port replacements.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub remap: BTreeMap<u16, u16>,

    #[serde(default)]
    pub machines: Vec<MachineConfig>,
}

fn default_repair() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            repair: true,
            usable_port_range: PortRange::default(),
            lease_ttl: None,
            lock: LockConfig::default(),
            extra_in_use: BTreeMap::new(),
            remap: BTreeMap::new(),
            machines: Vec::new(),
        }
    }
}

/// Retry behaviour of the per-machine process lock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockConfig {
    /// Delay between attempts (default "1s").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<String>,

    /// Give up after this many attempts. Unset retries forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

/// One machine and its forwarded ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub name: String,

    /// Defaults to `<data_dir>/machines/<name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Overrides the root `usable_port_range` for this machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usable_port_range: Option<PortRange>,

    #[serde(default)]
    pub forwarded_ports: Vec<ForwardingRule>,
}

impl Config {
    /// Absolute state directory for a config living in `base`.
    pub fn data_dir(&self, base: &Path) -> PathBuf {
        let dir = self
            .data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        base.join(dir)
    }

    pub fn lease_ttl(&self) -> Result<Duration> {
        match &self.lease_ttl {
            Some(s) => parse_duration_string(s)
                .ok_or_else(|| Error::Config(format!("Invalid lease_ttl '{}'", s))),
            None => Ok(DEFAULT_LEASE_TTL),
        }
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        let backoff = match &self.lock.backoff {
            Some(s) => parse_duration_string(s)
                .ok_or_else(|| Error::Config(format!("Invalid lock.backoff '{}'", s)))?,
            None => DEFAULT_LOCK_BACKOFF,
        };
        Ok(RetryPolicy {
            backoff,
            max_attempts: self.lock.max_attempts,
        })
    }

    pub fn extra_in_use_claims(&self) -> Result<ExternalClaims> {
        let mut claims = ExternalClaims::new();
        for (port, owners) in &self.extra_in_use {
            if owners.is_empty() {
                claims.register_empty(*port);
            }
            for owner in owners {
                let host_ip: HostIp = owner.parse().map_err(|e| {
                    Error::Config(format!("extra_in_use port {}: {}", port, e))
                })?;
                claims.claim(*port, host_ip);
            }
        }
        Ok(claims)
    }

    pub fn remap_table(&self) -> RemapTable {
        self.remap.iter().map(|(from, to)| (*from, *to)).collect()
    }

    /// Pass options from the root settings.
    pub fn pass_options(&self) -> Result<PassOptions> {
        Ok(PassOptions {
            repair: self.repair,
            extra_in_use: self.extra_in_use_claims()?,
            remap: self.remap_table(),
        })
    }

    pub fn find_machine(&self, name: &str) -> Result<&MachineConfig> {
        self.machines
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| Error::MachineNotFound(name.to_string()))
    }

    /// Build the orchestrator's view of a machine.
    pub fn machine(&self, machine: &MachineConfig, base: &Path) -> Machine {
        let data_dir = match &machine.data_dir {
            Some(dir) => base.join(dir),
            None => self.data_dir(base).join("machines").join(&machine.name),
        };

        Machine::new(machine.name.clone(), data_dir)
            .with_rules(machine.forwarded_ports.iter().cloned())
            .with_usable_port_range(
                machine
                    .usable_port_range
                    .unwrap_or(self.usable_port_range),
            )
    }

    /// Machines selected by name, in config order. An empty selection means
    /// every machine.
    pub fn select_machines(&self, names: &[String], base: &Path) -> Result<Vec<Machine>> {
        for name in names {
            self.find_machine(name)?;
        }

        Ok(self
            .machines
            .iter()
            .filter(|m| names.is_empty() || names.contains(&m.name))
            .map(|m| self.machine(m, base))
            .collect())
    }
}
