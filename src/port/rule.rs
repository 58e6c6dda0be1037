//! Forwarding rule types.
//!
//! A [`ForwardingRule`] is one configured guest -> host mapping for a
//! machine. Rules are read-only during a pass: the outcome of resolution is
//! reported separately as a [`ResolvedRule`], so caller-owned configuration
//! is never rewritten.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Marker used for "all interfaces" in claims and output.
pub const WILDCARD: &str = "*";

/// Host address a rule binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum HostIp {
    /// No address configured: listen on every interface.
    #[default]
    Wildcard,
    Addr(IpAddr),
}

impl HostIp {
    /// Normalize an optional configured address. Empty, absent and `*` all
    /// mean wildcard.
    pub fn parse_optional(value: Option<&str>) -> Result<Self, String> {
        match value.map(str::trim) {
            None | Some("") | Some(WILDCARD) => Ok(HostIp::Wildcard),
            Some(s) => s
                .parse::<IpAddr>()
                .map(HostIp::Addr)
                .map_err(|e| format!("invalid host_ip '{}': {}", s, e)),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, HostIp::Wildcard)
    }

    /// Address to probe. The wildcard probes as `0.0.0.0`.
    pub fn probe_addr(&self) -> IpAddr {
        match self {
            HostIp::Wildcard => IpAddr::from([0, 0, 0, 0]),
            HostIp::Addr(ip) => *ip,
        }
    }
}

impl fmt::Display for HostIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostIp::Wildcard => f.write_str(WILDCARD),
            HostIp::Addr(ip) => write!(f, "{}", ip),
        }
    }
}

impl FromStr for HostIp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HostIp::parse_optional(Some(s))
    }
}

impl Serialize for HostIp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HostIp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        HostIp::parse_optional(raw.as_deref()).map_err(serde::de::Error::custom)
    }
}

/// Transport protocol of a rule. Only TCP takes part in arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// One configured port forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingRule {
    /// Stable name for the rule (e.g. `ssh`). Defaults to `<protocol><guest>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "guest")]
    pub guest_port: u16,

    #[serde(rename = "host")]
    pub host_port: u16,

    #[serde(default)]
    pub host_ip: HostIp,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_ip: Option<IpAddr>,

    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default)]
    pub disabled: bool,

    /// Opt-in to repair when the host port collides.
    #[serde(default)]
    pub auto_correct: bool,
}

impl ForwardingRule {
    pub fn tcp(guest_port: u16, host_port: u16) -> Self {
        Self {
            id: None,
            guest_port,
            host_port,
            host_ip: HostIp::Wildcard,
            guest_ip: None,
            protocol: Protocol::Tcp,
            disabled: false,
            auto_correct: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_host_ip(mut self, host_ip: HostIp) -> Self {
        self.host_ip = host_ip;
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn auto_correct(mut self, enabled: bool) -> Self {
        self.auto_correct = enabled;
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// The rule's id, falling back to `<protocol><guest port>`.
    pub fn effective_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}{}", self.protocol, self.guest_port))
    }

    /// Whether this rule takes part in collision arbitration.
    pub fn is_arbitrated(&self) -> bool {
        !self.disabled && self.protocol == Protocol::Tcp
    }
}

/// How a rule's final host port was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// The configured port was free.
    Unchanged,
    /// A remap table entry replaced the configured port before checking.
    Remapped { from: u16 },
    /// The port collided and was repaired from the usable pool.
    Repaired { from: u16 },
    /// Disabled or non-TCP: never arbitrated.
    Skipped,
}

/// Result of resolving one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedRule {
    pub rule: ForwardingRule,
    pub host_port: u16,
    pub outcome: Outcome,
}

impl ResolvedRule {
    pub fn id(&self) -> String {
        self.rule.effective_id()
    }

    /// The rule as it should be handed to the backend driver.
    pub fn applied(&self) -> ForwardingRule {
        ForwardingRule {
            host_port: self.host_port,
            ..self.rule.clone()
        }
    }
}

/// User-facing notice for a repaired collision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairNotice {
    pub guest_port: u16,
    pub old_port: u16,
    pub new_port: u16,
}

impl fmt::Display for RepairNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Fixed port collision for {} => {}. Now on port {}.",
            self.guest_port, self.old_port, self.new_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_star_normalize_to_wildcard() {
        assert_eq!(HostIp::parse_optional(None).unwrap(), HostIp::Wildcard);
        assert_eq!(HostIp::parse_optional(Some("")).unwrap(), HostIp::Wildcard);
        assert_eq!(HostIp::parse_optional(Some(" * ")).unwrap(), HostIp::Wildcard);
        assert_eq!(
            HostIp::parse_optional(Some("127.0.0.1")).unwrap(),
            HostIp::Addr("127.0.0.1".parse().unwrap())
        );
        assert!(HostIp::parse_optional(Some("not-an-ip")).is_err());
    }

    #[test]
    fn rule_deserializes_with_defaults() {
        let yaml = "guest: 22\nhost: 2222\nid: ssh\nauto_correct: true\n";
        let rule: ForwardingRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.guest_port, 22);
        assert_eq!(rule.host_port, 2222);
        assert_eq!(rule.host_ip, HostIp::Wildcard);
        assert_eq!(rule.protocol, Protocol::Tcp);
        assert!(rule.auto_correct);
        assert!(!rule.disabled);
        assert!(rule.is_arbitrated());
    }

    #[test]
    fn udp_and_disabled_rules_are_not_arbitrated() {
        assert!(!ForwardingRule::tcp(53, 5353)
            .with_protocol(Protocol::Udp)
            .is_arbitrated());
        assert!(!ForwardingRule::tcp(80, 8080).disabled(true).is_arbitrated());
    }

    #[test]
    fn effective_id_falls_back_to_protocol_and_guest() {
        assert_eq!(ForwardingRule::tcp(80, 8080).effective_id(), "tcp80");
        assert_eq!(
            ForwardingRule::tcp(22, 2222).with_id("ssh").effective_id(),
            "ssh"
        );
    }
}
