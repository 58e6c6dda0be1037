use super::rule::ResolvedRule;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the per-machine record of last resolved host ports.
pub const FORWARDS_FILE_NAME: &str = "forwarded_ports.json";

/// Storage for the host ports a machine ended up using, keyed by rule id.
///
/// The orchestrator reads this before a pass to build a remap table
/// (so a repaired port sticks across runs) and writes it after a pass
/// succeeds.
///
/// # Implementations
///
/// - [`FileForwardStore`]: `forwarded_ports.json` in the machine data dir
/// - [`NoopForwardStore`]: remembers nothing
pub trait ForwardStore: Send + Sync {
    /// Last resolved host port for each rule id.
    fn load(&self) -> Result<HashMap<String, u16>>;

    /// Replace the stored ports with the outcome of a pass.
    fn save(&self, rules: &[ResolvedRule]) -> Result<()>;
}

/// JSON file store, written atomically (temp file then rename).
pub struct FileForwardStore {
    path: PathBuf,
}

impl FileForwardStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<data_dir>/forwarded_ports.json`.
    pub fn for_machine(data_dir: &Path) -> Self {
        Self::new(data_dir.join(FORWARDS_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ForwardStore for FileForwardStore {
    fn load(&self) -> Result<HashMap<String, u16>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => {
                return Err(Error::Filesystem(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        match serde_json::from_str(&contents) {
            Ok(ports) => Ok(ports),
            Err(e) => {
                // A corrupt record only loses port stickiness.
                tracing::warn!(
                    "Ignoring unreadable forwarded port record {}: {}",
                    self.path.display(),
                    e
                );
                Ok(HashMap::new())
            }
        }
    }

    fn save(&self, rules: &[ResolvedRule]) -> Result<()> {
        let ports: std::collections::BTreeMap<String, u16> = rules
            .iter()
            .filter(|r| r.rule.is_arbitrated())
            .map(|r| (r.id(), r.host_port))
            .collect();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Filesystem(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let contents = serde_json::to_string_pretty(&ports)?;
        atomic_write(&self.path, &contents)
    }
}

fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    use std::io::Write;

    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)
        .map_err(|e| Error::Filesystem(format!("Failed to create temp file: {}", e)))?;

    file.write_all(contents.as_bytes())
        .map_err(|e| Error::Filesystem(format!("Failed to write temp file: {}", e)))?;

    file.sync_all()
        .map_err(|e| Error::Filesystem(format!("Failed to sync temp file: {}", e)))?;
    drop(file);

    fs::rename(&temp_path, path)
        .map_err(|e| Error::Filesystem(format!("Failed to rename temp file: {}", e)))?;

    Ok(())
}

/// Store that never remembers anything.
pub struct NoopForwardStore;

impl ForwardStore for NoopForwardStore {
    fn load(&self) -> Result<HashMap<String, u16>> {
        Ok(HashMap::new())
    }

    fn save(&self, _rules: &[ResolvedRule]) -> Result<()> {
        Ok(())
    }
}
