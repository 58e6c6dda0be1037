//! Usable port pool and the repair allocator.

use super::claims::ExternalClaims;
use super::detector::CollisionDetector;
use super::rule::{ForwardingRule, HostIp};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Inclusive range of host ports offered as repair candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::new(2200, 2250)
    }
}

/// Candidate ports for repair, consumed smallest-first.
///
/// A port taken from the pool is never offered again within the same pass,
/// whether or not it turned out to be usable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsablePortPool {
    ports: BTreeSet<u16>,
}

impl UsablePortPool {
    /// `range` minus externally claimed ports minus every host port
    /// configured on `rules` (disabled and non-TCP rules included).
    pub fn build(range: PortRange, claims: &ExternalClaims, rules: &[ForwardingRule]) -> Self {
        let mut ports: BTreeSet<u16> = if range.is_empty() {
            BTreeSet::new()
        } else {
            (range.start..=range.end).collect()
        };

        for port in claims.ports() {
            ports.remove(&port);
        }

        for rule in rules {
            ports.remove(&rule.host_port);
        }

        Self { ports }
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }

    /// Remove and return the smallest remaining candidate.
    pub fn take_smallest(&mut self) -> Option<u16> {
        self.ports.pop_first()
    }
}

impl FromIterator<u16> for UsablePortPool {
    fn from_iter<I: IntoIterator<Item = u16>>(iter: I) -> Self {
        Self {
            ports: iter.into_iter().collect(),
        }
    }
}

/// Pick a replacement host port for a colliding rule.
///
/// Candidates are taken smallest-first and re-checked with the detector
/// (which leases the winner). Returns `None` once the pool is exhausted.
pub fn repair(
    pool: &mut UsablePortPool,
    host_ip: HostIp,
    detector: &CollisionDetector<'_>,
) -> Result<Option<u16>> {
    while let Some(candidate) = pool.take_smallest() {
        if detector.is_in_use(host_ip, candidate)? {
            tracing::debug!("Repair candidate {} is in use, skipping", candidate);
            continue;
        }
        return Ok(Some(candidate));
    }
    Ok(None)
}

/// [`repair`], turning exhaustion into [`Error::ForwardPortAutolistEmpty`].
pub fn repair_or_exhausted(
    pool: &mut UsablePortPool,
    host_ip: HostIp,
    detector: &CollisionDetector<'_>,
    machine: &str,
    guest_port: u16,
    host_port: u16,
) -> Result<u16> {
    repair(pool, host_ip, detector)?.ok_or_else(|| Error::ForwardPortAutolistEmpty {
        machine: machine.to_string(),
        guest_port,
        host_port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::lease::LeaseStore;
    use crate::port::probe::StaticProber;
    use crate::port::rule::Protocol;

    #[test]
    fn build_subtracts_claims_and_every_configured_port() {
        let mut claims = ExternalClaims::new();
        claims.claim(2201, HostIp::Wildcard);
        claims.register_empty(2202);
        let rules = vec![
            ForwardingRule::tcp(22, 2203),
            ForwardingRule::tcp(80, 2204).disabled(true),
            ForwardingRule::tcp(53, 2205).with_protocol(Protocol::Udp),
        ];

        let pool = UsablePortPool::build(PortRange::new(2200, 2206), &claims, &rules);
        assert_eq!(pool.len(), 2);
        assert!(pool.contains(2200));
        assert!(pool.contains(2206));
    }

    #[test]
    fn inverted_range_is_empty() {
        let pool = UsablePortPool::build(PortRange::new(10, 5), &ExternalClaims::new(), &[]);
        assert!(pool.is_empty());
    }

    #[test]
    fn repair_picks_smallest_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let claims = ExternalClaims::new();
        let prober = StaticProber::new();
        let leases = LeaseStore::new(dir.path(), "pass-a");
        let detector = CollisionDetector::new(&claims, &prober, &leases);

        let mut pool: UsablePortPool = [8081, 8080, 8085].into_iter().collect();
        assert_eq!(
            repair(&mut pool, HostIp::Wildcard, &detector).unwrap(),
            Some(8080)
        );
        assert!(!pool.contains(8080));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn repair_skips_busy_candidates_and_consumes_them() {
        let dir = tempfile::tempdir().unwrap();
        let claims = ExternalClaims::new();
        let prober = StaticProber::new().open(8080);
        let leases = LeaseStore::new(dir.path(), "pass-a");
        let detector = CollisionDetector::new(&claims, &prober, &leases);

        let mut pool: UsablePortPool = [8080, 8081].into_iter().collect();
        assert_eq!(
            repair(&mut pool, HostIp::Wildcard, &detector).unwrap(),
            Some(8081)
        );
        assert!(pool.is_empty());
    }

    #[test]
    fn exhausted_pool_reports_machine_and_ports() {
        let dir = tempfile::tempdir().unwrap();
        let claims = ExternalClaims::new();
        let prober = StaticProber::new().open(8080);
        let leases = LeaseStore::new(dir.path(), "pass-a");
        let detector = CollisionDetector::new(&claims, &prober, &leases);

        let mut pool: UsablePortPool = [8080].into_iter().collect();
        let err = repair_or_exhausted(&mut pool, HostIp::Wildcard, &detector, "web", 80, 8000)
            .unwrap_err();
        match err {
            Error::ForwardPortAutolistEmpty {
                machine,
                guest_port,
                host_port,
            } => {
                assert_eq!(machine, "web");
                assert_eq!(guest_port, 80);
                assert_eq!(host_port, 8000);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
