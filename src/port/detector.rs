//! Per-rule collision detection.

use super::claims::ExternalClaims;
use super::lease::LeaseStore;
use super::probe::PortProber;
use super::rule::HostIp;
use crate::error::Result;

/// Which check found a port in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionSource {
    /// Claimed by a sibling machine earlier in this run.
    Sibling,
    /// Something on the host is already listening.
    Listening,
    /// Another pass holds a live lease.
    Leased,
}

/// Runs the three collision checks in order, short-circuiting on the first
/// hit. A port that passes all three is leased before returning, so
/// "found free" and "reserved" happen in the same step.
pub struct CollisionDetector<'a> {
    claims: &'a ExternalClaims,
    prober: &'a dyn PortProber,
    leases: &'a LeaseStore,
}

impl<'a> CollisionDetector<'a> {
    pub fn new(
        claims: &'a ExternalClaims,
        prober: &'a dyn PortProber,
        leases: &'a LeaseStore,
    ) -> Self {
        Self {
            claims,
            prober,
            leases,
        }
    }

    pub fn is_in_use(&self, host_ip: HostIp, port: u16) -> Result<bool> {
        Ok(self.check(host_ip, port)?.is_some())
    }

    /// Returns the source of the collision, or `None` if the port is free
    /// and now leased by this pass.
    pub fn check(&self, host_ip: HostIp, port: u16) -> Result<Option<CollisionSource>> {
        if self.claims.is_claimed(port, host_ip) {
            tracing::debug!("Port {}:{} claimed by a sibling machine", host_ip, port);
            return Ok(Some(CollisionSource::Sibling));
        }

        if self.prober.is_open(host_ip, port)? {
            tracing::debug!("Port {}:{} is accepting connections", host_ip, port);
            return Ok(Some(CollisionSource::Listening));
        }

        if self.leases.claim(host_ip, port)? {
            tracing::debug!("Port {}:{} is leased by another pass", host_ip, port);
            return Ok(Some(CollisionSource::Leased));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::probe::StaticProber;

    #[test]
    fn sibling_claim_short_circuits_probe_and_lease() {
        let dir = tempfile::tempdir().unwrap();
        let mut claims = ExternalClaims::new();
        claims.claim(9000, HostIp::Wildcard);
        let prober = StaticProber::new();
        let leases = LeaseStore::new(dir.path(), "pass-a");

        let detector = CollisionDetector::new(&claims, &prober, &leases);
        assert_eq!(
            detector.check(HostIp::Wildcard, 9000).unwrap(),
            Some(CollisionSource::Sibling)
        );
        assert!(prober.probes().is_empty());
        assert!(leases.owned_keys().is_empty());
    }

    #[test]
    fn listening_port_is_not_leased() {
        let dir = tempfile::tempdir().unwrap();
        let claims = ExternalClaims::new();
        let prober = StaticProber::new().open(8080);
        let leases = LeaseStore::new(dir.path(), "pass-a");

        let detector = CollisionDetector::new(&claims, &prober, &leases);
        assert_eq!(
            detector.check(HostIp::Wildcard, 8080).unwrap(),
            Some(CollisionSource::Listening)
        );
        assert!(leases.owned_keys().is_empty());
    }

    #[test]
    fn free_port_is_leased_by_the_check() {
        let dir = tempfile::tempdir().unwrap();
        let claims = ExternalClaims::new();
        let prober = StaticProber::new();
        let leases = LeaseStore::new(dir.path(), "pass-a");

        let detector = CollisionDetector::new(&claims, &prober, &leases);
        assert!(!detector.is_in_use(HostIp::Wildcard, 8081).unwrap());
        assert_eq!(leases.owned_keys(), vec!["8081".to_string()]);

        // A second pass now sees the lease
        let other = LeaseStore::new(dir.path(), "pass-b");
        let detector = CollisionDetector::new(&claims, &prober, &other);
        assert_eq!(
            detector.check(HostIp::Wildcard, 8081).unwrap(),
            Some(CollisionSource::Leased)
        );
    }

    #[test]
    fn probe_errors_propagate() {
        let dir = tempfile::tempdir().unwrap();
        let claims = ExternalClaims::new();
        let prober = StaticProber::new().failing(7000);
        let leases = LeaseStore::new(dir.path(), "pass-a");

        let detector = CollisionDetector::new(&claims, &prober, &leases);
        assert!(detector.check(HostIp::Wildcard, 7000).is_err());
        assert!(leases.owned_keys().is_empty());
    }
}
