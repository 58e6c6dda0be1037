pub mod claims;
pub mod conflict;
pub mod detector;
pub mod lease;
pub mod pool;
pub mod probe;
pub mod rule;
pub mod store;

pub use claims::{ExternalClaims, RemapTable};
pub use conflict::{find_processes_on_port, ProcessInfo};
pub use detector::{CollisionDetector, CollisionSource};
pub use lease::{
    lease_key, Clock, Lease, LeaseEntry, LeaseReleaser, LeaseStore, ReleaseRegistry, SystemClock,
    DEFAULT_LEASE_TTL, LEASE_DIR_NAME,
};
pub use pool::{repair, repair_or_exhausted, PortRange, UsablePortPool};
pub use probe::{PortProber, ProbeStrategy, StaticProber, SystemProber, PROBE_TIMEOUT};
pub use rule::{ForwardingRule, HostIp, Outcome, Protocol, RepairNotice, ResolvedRule, WILDCARD};
pub use store::{FileForwardStore, ForwardStore, NoopForwardStore, FORWARDS_FILE_NAME};
