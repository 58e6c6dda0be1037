//! Caller-supplied claim tables: ports already taken by sibling machines in
//! the current run, and forced host-port remaps.

use super::rule::HostIp;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Host port -> set of host IPs (or the wildcard) claimed by machines
/// processed earlier in the same run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalClaims {
    claims: BTreeMap<u16, BTreeSet<HostIp>>,
}

impl ExternalClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a claim on `port` for `host_ip`.
    pub fn claim(&mut self, port: u16, host_ip: HostIp) {
        self.claims.entry(port).or_default().insert(host_ip);
    }

    /// Register `port` with no owners.
    ///
    /// The entry exists but carries no ownership: a wildcard request for
    /// this port is not considered claimed by it.
    pub fn register_empty(&mut self, port: u16) {
        self.claims.entry(port).or_default();
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.claims.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Whether a request for `host_ip:port` collides with an existing claim.
    ///
    /// - port not listed: free
    /// - listed with a wildcard owner: taken for every requested address
    /// - wildcard requested: taken iff the owner set is non-empty
    /// - otherwise: taken iff the requested address is an owner
    pub fn is_claimed(&self, port: u16, host_ip: HostIp) -> bool {
        let Some(owners) = self.claims.get(&port) else {
            return false;
        };

        if owners.contains(&HostIp::Wildcard) {
            return true;
        }

        if host_ip.is_wildcard() {
            return !owners.is_empty();
        }

        owners.contains(&host_ip)
    }

    /// Merge every claim from `other` into `self`.
    pub fn extend(&mut self, other: &ExternalClaims) {
        for (port, owners) in &other.claims {
            let entry = self.claims.entry(*port).or_default();
            entry.extend(owners.iter().copied());
        }
    }
}

/// Forced replacement of configured host ports, applied before collision
/// checking and regardless of `auto_correct`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemapTable {
    entries: HashMap<u16, u16>,
}

impl RemapTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, from: u16, to: u16) {
        self.entries.insert(from, to);
    }

    pub fn get(&self, from: u16) -> Option<u16> {
        self.entries.get(&from).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Merge `other` into `self`; entries in `other` win.
    pub fn extend(&mut self, other: &RemapTable) {
        self.entries.extend(other.entries.iter().map(|(k, v)| (*k, *v)));
    }
}

impl FromIterator<(u16, u16)> for RemapTable {
    fn from_iter<I: IntoIterator<Item = (u16, u16)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> HostIp {
        s.parse().unwrap()
    }

    #[test]
    fn unlisted_port_is_free() {
        let claims = ExternalClaims::new();
        assert!(!claims.is_claimed(9000, HostIp::Wildcard));
        assert!(!claims.is_claimed(9000, ip("10.0.0.1")));
    }

    #[test]
    fn wildcard_claim_collides_with_any_address() {
        let mut claims = ExternalClaims::new();
        claims.claim(9000, HostIp::Wildcard);
        assert!(claims.is_claimed(9000, ip("192.168.1.5")));
        assert!(claims.is_claimed(9000, HostIp::Wildcard));
    }

    #[test]
    fn specific_claim_only_collides_with_same_address() {
        let mut claims = ExternalClaims::new();
        claims.claim(9000, ip("192.168.1.5"));
        assert!(claims.is_claimed(9000, ip("192.168.1.5")));
        assert!(!claims.is_claimed(9000, ip("10.0.0.1")));
    }

    #[test]
    fn wildcard_request_collides_with_any_specific_claim() {
        let mut claims = ExternalClaims::new();
        claims.claim(9000, ip("192.168.1.5"));
        assert!(claims.is_claimed(9000, HostIp::Wildcard));
    }

    // Deliberately specified edge case: an entry that exists but has no
    // owners does not block a wildcard request.
    #[test]
    fn wildcard_request_against_empty_owner_set_is_free() {
        let mut claims = ExternalClaims::new();
        claims.register_empty(9000);
        assert!(!claims.is_claimed(9000, HostIp::Wildcard));
        assert!(!claims.is_claimed(9000, ip("10.0.0.1")));
        assert_eq!(claims.ports().collect::<Vec<_>>(), vec![9000]);
    }
}
