use super::state::PassState;
use crate::error::{Error, Result};
use crate::lock::{self, Locker, ProcessLock, RetryPolicy, COLLISION_LOCK_LABEL};
use crate::port::{
    repair_or_exhausted, Clock, CollisionDetector, CollisionSource, ExternalClaims,
    FileForwardStore, ForwardStore, ForwardingRule, LeaseStore, Outcome, PortProber,
    PortRange, ReleaseRegistry, RemapTable, RepairNotice, ResolvedRule, SystemClock,
    SystemProber, UsablePortPool, DEFAULT_LEASE_TTL,
};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One machine's identity and forwarded ports, as the pass sees them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub name: String,
    /// Private state directory; holds the lock file and `fp-leases/`.
    pub data_dir: PathBuf,
    pub rules: Vec<ForwardingRule>,
    pub usable_port_range: PortRange,
}

impl Machine {
    pub fn new(name: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            data_dir: data_dir.into(),
            rules: Vec::new(),
            usable_port_range: PortRange::default(),
        }
    }

    pub fn with_rule(mut self, rule: ForwardingRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_rules(mut self, rules: impl IntoIterator<Item = ForwardingRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    pub fn with_usable_port_range(mut self, range: PortRange) -> Self {
        self.usable_port_range = range;
        self
    }
}

/// Per-invocation inputs to a pass.
#[derive(Debug, Clone)]
pub struct PassOptions {
    /// Global switch; when off, every collision is an error.
    pub repair: bool,
    /// Ports already claimed by sibling machines in this run.
    pub extra_in_use: ExternalClaims,
    /// Forced host port replacements, applied before checking.
    pub remap: RemapTable,
}

impl Default for PassOptions {
    fn default() -> Self {
        Self {
            repair: true,
            extra_in_use: ExternalClaims::new(),
            remap: RemapTable::new(),
        }
    }
}

impl PassOptions {
    pub fn repair(mut self, enabled: bool) -> Self {
        self.repair = enabled;
        self
    }

    pub fn with_extra_in_use(mut self, claims: ExternalClaims) -> Self {
        self.extra_in_use = claims;
        self
    }

    pub fn with_remap(mut self, remap: RemapTable) -> Self {
        self.remap = remap;
        self
    }
}

/// Outcome of a successful pass. The machine's configured rules are left
/// untouched; the chosen ports live here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub machine: String,
    pub pass_id: String,
    pub rules: Vec<ResolvedRule>,
    pub notices: Vec<RepairNotice>,
}

impl Resolution {
    /// Final host port for the rule with this id.
    pub fn host_port(&self, rule_id: &str) -> Option<u16> {
        self.rules
            .iter()
            .find(|r| r.id() == rule_id)
            .map(|r| r.host_port)
    }

    /// Rules with their final host ports, ready for a backend driver.
    pub fn applied_rules(&self) -> Vec<ForwardingRule> {
        self.rules.iter().map(ResolvedRule::applied).collect()
    }

    /// Arbitrated ports, as claims for machines resolved after this one.
    pub fn claims(&self) -> ExternalClaims {
        let mut claims = ExternalClaims::new();
        for resolved in self.rules.iter().filter(|r| r.rule.is_arbitrated()) {
            claims.claim(resolved.host_port, resolved.rule.host_ip);
        }
        claims
    }
}

/// Generate a pass id (`pass-` followed by 32 hex digits).
pub fn generate_pass_id() -> String {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let high: u64 = rng.gen();
    let low: u64 = rng.gen();

    format!("pass-{:016x}{:016x}", high, low)
}

/// Lease holder and state tracker for one pass. Releases its leases when
/// dropped if [`Pass::cleanup`] was never reached.
struct Pass {
    id: String,
    machine: String,
    leases: LeaseStore,
    registry: ReleaseRegistry,
    history: Vec<PassState>,
    released: bool,
}

impl Pass {
    fn new(id: String, machine: &Machine, leases: LeaseStore, registry: ReleaseRegistry) -> Self {
        registry.register(leases.releaser());
        Self {
            id,
            machine: machine.name.clone(),
            leases,
            registry,
            history: vec![PassState::Idle],
            released: false,
        }
    }

    fn state(&self) -> PassState {
        self.history.last().copied().unwrap_or(PassState::Idle)
    }

    fn transition(&mut self, next: PassState) {
        let current = self.state();
        debug_assert!(
            current.can_transition_to(next),
            "invalid pass transition {} -> {}",
            current,
            next
        );
        debug!("Pass {} ({}): {} -> {}", self.id, self.machine, current, next);
        self.history.push(next);
    }

    /// Release every lease this pass holds. Idempotent.
    fn cleanup(&mut self) -> Result<usize> {
        if self.released {
            return Ok(0);
        }
        let released = self.leases.release_all()?;
        self.registry.unregister(&self.id);
        self.released = true;
        Ok(released)
    }

    /// Clean up and settle on a terminal state, keeping the first error.
    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        if self.state() != PassState::Cleaning {
            self.transition(PassState::Cleaning);
        }
        let cleanup = self.cleanup();
        match (result, cleanup) {
            (Ok(value), Ok(_)) => {
                self.transition(PassState::Done);
                Ok(value)
            }
            (Ok(_), Err(e)) => {
                self.transition(PassState::Errored);
                Err(e)
            }
            (Err(e), cleanup) => {
                if let Err(cleanup_err) = cleanup {
                    warn!("Failed to release leases after error: {}", cleanup_err);
                }
                self.transition(PassState::Errored);
                Err(e)
            }
        }
    }
}

impl Drop for Pass {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.cleanup() {
                warn!("Failed to release leases for pass {}: {}", self.id, e);
            }
        }
    }
}

/// A resolved pass whose leases are still held.
///
/// Hand [`ActivePass::resolution`] to whatever starts the machine, then call
/// [`ActivePass::finish`]. Dropping it releases the leases too.
pub struct ActivePass {
    pass: Pass,
    resolution: Resolution,
    store: Option<FileForwardStore>,
}

impl ActivePass {
    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    pub fn pass_id(&self) -> &str {
        &self.pass.id
    }

    /// Lease keys currently held by this pass.
    pub fn held_leases(&self) -> Vec<String> {
        self.pass.leases.owned_keys()
    }

    /// States visited so far, starting with `Idle`.
    pub fn states(&self) -> &[PassState] {
        &self.pass.history
    }

    /// Release the leases. When `succeeded`, the resolved ports are also
    /// recorded for the next run (if assignments are remembered).
    pub fn finish(self, succeeded: bool) -> Result<Resolution> {
        let ActivePass {
            mut pass,
            resolution,
            store,
        } = self;

        let saved = match (&store, succeeded) {
            (Some(store), true) => store.save(&resolution.rules),
            _ => Ok(()),
        };

        pass.finish(saved.map(|_| resolution))
    }
}

/// Entry point of the forwarded-port subsystem: locks, scans, resolves and
/// cleans up one machine at a time.
///
/// # Example
///
/// ```no_run
/// use vm_ports::orchestrator::{Machine, Orchestrator, PassOptions};
/// use vm_ports::port::ForwardingRule;
///
/// # fn example() -> vm_ports::Result<()> {
/// let machine = Machine::new("web", ".vmports/machines/web")
///     .with_rule(ForwardingRule::tcp(22, 2222).with_id("ssh").auto_correct(true));
///
/// let orchestrator = Orchestrator::new();
/// let resolution = orchestrator.resolve(&machine, &PassOptions::default())?;
/// for notice in &resolution.notices {
///     println!("{}", notice);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Orchestrator {
    prober: Arc<dyn PortProber>,
    locker: Arc<dyn Locker>,
    retry: RetryPolicy,
    lease_ttl: Duration,
    clock: Arc<dyn Clock>,
    registry: ReleaseRegistry,
    remember_assignments: bool,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            prober: Arc::new(SystemProber::new()),
            locker: Arc::new(ProcessLock),
            retry: RetryPolicy::default(),
            lease_ttl: DEFAULT_LEASE_TTL,
            clock: Arc::new(SystemClock),
            registry: ReleaseRegistry::new(),
            remember_assignments: false,
        }
    }

    pub fn with_prober(mut self, prober: Arc<dyn PortProber>) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_locker(mut self, locker: Arc<dyn Locker>) -> Self {
        self.locker = locker;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share a registry with an interrupt handler.
    pub fn with_registry(mut self, registry: ReleaseRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Persist resolved ports in `forwarded_ports.json` and reuse them as
    /// remaps on the next pass.
    pub fn remember_assignments(mut self, enabled: bool) -> Self {
        self.remember_assignments = enabled;
        self
    }

    pub fn registry(&self) -> &ReleaseRegistry {
        &self.registry
    }

    pub fn prober(&self) -> &dyn PortProber {
        self.prober.as_ref()
    }

    /// Resolve and release immediately.
    pub fn resolve(&self, machine: &Machine, options: &PassOptions) -> Result<Resolution> {
        self.run(machine, options, |_| Ok(())).map(|(resolution, ())| resolution)
    }

    /// Resolve, run `consume` while the leases are still held, then release
    /// them whether or not `consume` succeeded.
    pub fn run<T>(
        &self,
        machine: &Machine,
        options: &PassOptions,
        consume: impl FnOnce(&Resolution) -> Result<T>,
    ) -> Result<(Resolution, T)> {
        let active = self.begin(machine, options)?;
        match consume(active.resolution()) {
            Ok(value) => {
                let resolution = active.finish(true)?;
                Ok((resolution, value))
            }
            Err(e) => {
                if let Err(cleanup_err) = active.finish(false) {
                    warn!("Failed to release leases after error: {}", cleanup_err);
                }
                Err(e)
            }
        }
    }

    /// Lock, scan and resolve. The returned pass keeps its leases until it is
    /// finished or dropped. On error every lease is already released.
    pub fn begin(&self, machine: &Machine, options: &PassOptions) -> Result<ActivePass> {
        let id = generate_pass_id();
        let leases = LeaseStore::for_machine(&machine.data_dir, id.clone())
            .with_ttl(self.lease_ttl)
            .with_clock(Arc::clone(&self.clock));
        let mut pass = Pass::new(id, machine, leases, self.registry.clone());

        pass.transition(PassState::Locking);
        let guard = match lock::acquire(
            self.locker.as_ref(),
            &machine.data_dir,
            COLLISION_LOCK_LABEL,
            self.retry,
        ) {
            Ok(guard) => guard,
            Err(e) => {
                pass.cleanup()?;
                pass.transition(PassState::Errored);
                return Err(e);
            }
        };

        let store = self
            .remember_assignments
            .then(|| FileForwardStore::for_machine(&machine.data_dir));

        let resolved = self.resolve_locked(&mut pass, machine, options, store.as_ref());
        drop(guard);

        match resolved {
            Ok((rules, notices)) => Ok(ActivePass {
                resolution: Resolution {
                    machine: machine.name.clone(),
                    pass_id: pass.id.clone(),
                    rules,
                    notices,
                },
                pass,
                store,
            }),
            Err(e) => pass.finish(Err(e)),
        }
    }

    fn resolve_locked(
        &self,
        pass: &mut Pass,
        machine: &Machine,
        options: &PassOptions,
        store: Option<&FileForwardStore>,
    ) -> Result<(Vec<ResolvedRule>, Vec<RepairNotice>)> {
        pass.transition(PassState::Scanning);
        let mut pool =
            UsablePortPool::build(machine.usable_port_range, &options.extra_in_use, &machine.rules);
        debug!(
            "Machine {}: {} usable repair candidates",
            machine.name,
            pool.len()
        );

        // Remembered ports, by rule id. The caller's remap wins over these.
        let remembered = match store {
            Some(store) => store.load()?,
            None => HashMap::new(),
        };

        pass.transition(PassState::Resolving);
        let detector = CollisionDetector::new(&options.extra_in_use, self.prober(), &pass.leases);

        let mut rules = Vec::with_capacity(machine.rules.len());
        let mut notices = Vec::new();

        for rule in &machine.rules {
            if !rule.is_arbitrated() {
                rules.push(ResolvedRule {
                    rule: rule.clone(),
                    host_port: rule.host_port,
                    outcome: Outcome::Skipped,
                });
                continue;
            }

            let target = options
                .remap
                .get(rule.host_port)
                .or_else(|| remembered.get(&rule.effective_id()).copied());
            let (mut host_port, mut outcome) = match target {
                Some(to) if to != rule.host_port => {
                    debug!("Remapping host port {} to {}", rule.host_port, to);
                    (to, Outcome::Remapped { from: rule.host_port })
                }
                _ => (rule.host_port, Outcome::Unchanged),
            };

            if let Some(source) = detector.check(rule.host_ip, host_port)? {
                if !options.repair || !rule.auto_correct {
                    return Err(self.collision(rule, host_port, source));
                }

                let new_port = repair_or_exhausted(
                    &mut pool,
                    rule.host_ip,
                    &detector,
                    &machine.name,
                    rule.guest_port,
                    host_port,
                )?;

                info!("Repaired FP collision: {} to {}", host_port, new_port);
                notices.push(RepairNotice {
                    guest_port: rule.guest_port,
                    old_port: host_port,
                    new_port,
                });
                outcome = Outcome::Repaired {
                    from: rule.host_port,
                };
                host_port = new_port;
            }

            rules.push(ResolvedRule {
                rule: rule.clone(),
                host_port,
                outcome,
            });
        }

        Ok((rules, notices))
    }

    fn collision(&self, rule: &ForwardingRule, host_port: u16, source: CollisionSource) -> Error {
        let holder = match source {
            CollisionSource::Listening => self.prober.holders(host_port).into_iter().next(),
            CollisionSource::Sibling | CollisionSource::Leased => None,
        };
        Error::ForwardPortCollision {
            guest_port: rule.guest_port,
            host_port,
            holder,
        }
    }
}
