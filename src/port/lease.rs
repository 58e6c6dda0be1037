//! Filesystem-backed port leases.
//!
//! A lease is a small JSON marker in `<machine data dir>/fp-leases/` named
//! by an encoded (host IP, host port) key. It records the pass that created
//! it and when. Any marker older than the time-to-live is purged lazily by
//! whoever scans the directory next; there is no background sweeper.
//!
//! At most one live marker exists per key: markers are created with
//! `create_new`, so a second creator observes a collision instead of
//! overwriting. A pass only ever deletes markers it owns.

use super::rule::HostIp;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Lease directory name under a machine's data directory.
pub const LEASE_DIR_NAME: &str = "fp-leases";

/// Default lease time-to-live.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

/// Time source for lease creation and expiry.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Contents of a lease marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub created_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(owner: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            owner: owner.into(),
            created_at,
        }
    }

    /// Whether the lease is older than `ttl` at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        is_older_than(self.created_at, now, ttl)
    }
}

fn is_older_than(created_at: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    match chrono::Duration::from_std(ttl) {
        Ok(ttl) => now.signed_duration_since(created_at) > ttl,
        Err(_) => false,
    }
}

/// Encode a (host IP, port) pair as a marker file name.
///
/// The wildcard omits the address component, so wildcard and specific
/// leases on the same port are distinct keys.
pub fn lease_key(host_ip: HostIp, port: u16) -> String {
    match host_ip {
        HostIp::Wildcard => port.to_string(),
        HostIp::Addr(ip) => {
            let sanitized: String = ip
                .to_string()
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect();
            format!("{}_{}", sanitized, port)
        }
    }
}

/// A marker observed on disk.
#[derive(Debug, Clone, Serialize)]
pub struct LeaseEntry {
    pub key: String,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expired: bool,
}

/// Lease directory scoped to one machine and owned by one pass.
pub struct LeaseStore {
    dir: PathBuf,
    owner: String,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    owned: Arc<Mutex<BTreeSet<String>>>,
}

impl LeaseStore {
    /// Store rooted at `dir`, creating leases on behalf of `owner`.
    pub fn new(dir: impl Into<PathBuf>, owner: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            owner: owner.into(),
            ttl: DEFAULT_LEASE_TTL,
            clock: Arc::new(SystemClock),
            owned: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Store at `<data_dir>/fp-leases`.
    pub fn for_machine(data_dir: &Path, owner: impl Into<String>) -> Self {
        Self::new(data_dir.join(LEASE_DIR_NAME), owner)
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Keys this store has acquired and not yet released.
    pub fn owned_keys(&self) -> Vec<String> {
        self.owned.lock().iter().cloned().collect()
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            Error::Filesystem(format!(
                "Failed to create lease directory {}: {}",
                self.dir.display(),
                e
            ))
        })
    }

    /// Whether a live lease exists for the key. Expired markers found while
    /// scanning are deleted.
    pub fn check(&self, host_ip: HostIp, port: u16) -> Result<bool> {
        let key = lease_key(host_ip, port);
        let live = self.scan()?;
        Ok(live.iter().any(|entry| entry.key == key))
    }

    /// Create a marker for the key. Returns `false` when a live marker
    /// already exists (another pass holds it).
    pub fn acquire(&self, host_ip: HostIp, port: u16) -> Result<bool> {
        self.ensure_dir()?;
        let key = lease_key(host_ip, port);
        let path = self.dir.join(&key);

        // Held until the key is recorded, so a concurrent release never
        // misses a marker that is already on disk.
        let mut owned = self.owned.lock();
        match self.write_marker(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if !self.purge_if_expired(&path)? {
                    tracing::debug!("Lease {} is held by another pass", key);
                    return Ok(false);
                }
                match self.write_marker(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
                    Err(e) => return Err(marker_error(&path, e)),
                }
            }
            Err(e) => return Err(marker_error(&path, e)),
        }

        tracing::debug!("Leased {} for {}", key, self.owner);
        owned.insert(key);
        Ok(true)
    }

    /// Check and, if free, acquire in one step. Returns `true` on collision.
    pub fn claim(&self, host_ip: HostIp, port: u16) -> Result<bool> {
        if self.check(host_ip, port)? {
            return Ok(true);
        }
        Ok(!self.acquire(host_ip, port)?)
    }

    /// Delete every marker this store created. Idempotent.
    pub fn release_all(&self) -> Result<usize> {
        self.releaser().release_all()
    }

    /// Handle that can release this store's leases from elsewhere (e.g. an
    /// interrupt handler).
    pub fn releaser(&self) -> LeaseReleaser {
        LeaseReleaser {
            dir: self.dir.clone(),
            owner: self.owner.clone(),
            owned: Arc::clone(&self.owned),
        }
    }

    /// All markers currently on disk, expired ones included.
    pub fn list(&self) -> Result<Vec<LeaseEntry>> {
        let now = self.clock.now();
        let mut entries = Vec::new();
        for path in self.marker_paths()? {
            if let Some(entry) = self.read_entry(&path, now)? {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    /// Delete expired markers. Returns how many were removed.
    pub fn prune(&self) -> Result<usize> {
        let before = self.marker_paths()?.len();
        let live = self.scan()?;
        Ok(before.saturating_sub(live.len()))
    }

    /// Read all markers, deleting expired ones; returns the live ones.
    fn scan(&self) -> Result<Vec<LeaseEntry>> {
        let now = self.clock.now();
        let mut live = Vec::new();

        for path in self.marker_paths()? {
            let Some(entry) = self.read_entry(&path, now)? else {
                continue;
            };
            if entry.expired {
                tracing::debug!("Deleting expired lease {}", entry.key);
                remove_marker(&path)?;
            } else {
                live.push(entry);
            }
        }

        Ok(live)
    }

    fn marker_paths(&self) -> Result<Vec<PathBuf>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::Filesystem(format!(
                    "Failed to read lease directory {}: {}",
                    self.dir.display(),
                    e
                )))
            }
        };

        let mut paths = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| {
                Error::Filesystem(format!("Failed to read lease entry: {}", e))
            })?;
            if entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                paths.push(entry.path());
            }
        }
        Ok(paths)
    }

    /// Parse one marker. `None` if it vanished meanwhile.
    fn read_entry(&self, path: &Path, now: DateTime<Utc>) -> Result<Option<LeaseEntry>> {
        let key = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let lease = match fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str::<Lease>(&contents).ok(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(_) => None,
        };

        let (owner, created_at) = match lease {
            Some(lease) => (Some(lease.owner), lease.created_at),
            // Marker being written or foreign format: age it by mtime.
            None => match fs::metadata(path).and_then(|m| m.modified()) {
                Ok(modified) => (None, DateTime::<Utc>::from(modified)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(marker_error(path, e)),
            },
        };

        Ok(Some(LeaseEntry {
            key,
            owner,
            created_at,
            expired: is_older_than(created_at, now, self.ttl),
        }))
    }

    fn purge_if_expired(&self, path: &Path) -> Result<bool> {
        match self.read_entry(path, self.clock.now())? {
            None => Ok(true),
            Some(entry) if entry.expired => {
                remove_marker(path)?;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    fn write_marker(&self, path: &Path) -> io::Result<()> {
        let lease = Lease::new(self.owner.clone(), self.clock.now());
        let contents = serde_json::to_string(&lease).map_err(io::Error::other)?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;

        let written = file
            .write_all(contents.as_bytes())
            .and_then(|_| file.sync_all());
        if let Err(e) = written {
            drop(file);
            let _ = fs::remove_file(path);
            // Not AlreadyExists: the caller must treat this as fatal.
            return Err(io::Error::new(io::ErrorKind::Other, e));
        }
        Ok(())
    }
}

fn marker_error(path: &Path, e: io::Error) -> Error {
    Error::Filesystem(format!("Lease marker {}: {}", path.display(), e))
}

fn remove_marker(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(marker_error(path, e)),
    }
}

/// Releases the leases of one pass. Cheap to clone.
#[derive(Clone)]
pub struct LeaseReleaser {
    dir: PathBuf,
    owner: String,
    owned: Arc<Mutex<BTreeSet<String>>>,
}

impl LeaseReleaser {
    /// Delete every marker the owning pass created and still owns.
    pub fn release_all(&self) -> Result<usize> {
        let mut owned = self.owned.lock();
        let mut released = 0;

        while let Some(key) = owned.pop_first() {
            let path = self.dir.join(&key);
            let foreign = fs::read_to_string(&path)
                .ok()
                .and_then(|c| serde_json::from_str::<Lease>(&c).ok())
                .is_some_and(|lease| lease.owner != self.owner);
            if foreign {
                // Ours expired and another pass re-leased the key.
                tracing::debug!("Lease {} now belongs to another pass, leaving it", key);
                continue;
            }

            if let Err(e) = remove_marker(&path) {
                owned.insert(key);
                return Err(e);
            }
            released += 1;
        }

        if released > 0 {
            tracing::debug!("Released {} lease(s) for {}", released, self.owner);
        }
        Ok(released)
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

/// Collects releasers of in-flight passes so an interrupt handler can free
/// their leases before the process exits.
#[derive(Clone, Default)]
pub struct ReleaseRegistry {
    releasers: Arc<Mutex<Vec<LeaseReleaser>>>,
}

impl ReleaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, releaser: LeaseReleaser) {
        self.releasers.lock().push(releaser);
    }

    /// Drop registrations for `owner` once its pass has cleaned up.
    pub fn unregister(&self, owner: &str) {
        self.releasers.lock().retain(|r| r.owner() != owner);
    }

    pub fn len(&self) -> usize {
        self.releasers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.releasers.lock().is_empty()
    }

    /// Release everything registered. Keeps going past failures and returns
    /// the first error.
    pub fn release_all(&self) -> Result<usize> {
        let releasers: Vec<LeaseReleaser> = self.releasers.lock().drain(..).collect();
        let mut released = 0;
        let mut first_err = None;
        for releaser in releasers {
            match releaser.release_all() {
                Ok(n) => released += n,
                Err(e) => {
                    tracing::warn!("Failed to release leases for {}: {}", releaser.owner(), e);
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(released),
        }
    }
}
