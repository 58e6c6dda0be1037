mod leases;
mod probe;
mod resolve;
mod validate;

pub use leases::run_leases;
pub use probe::run_probe;
pub use resolve::{run_resolve, ResolveArgs};
pub use validate::run_validate;

use anyhow::Context;
use std::path::{Path, PathBuf};
use vm_ports::{Config, Parser as ConfigParser};

/// A loaded config and the directory its relative paths resolve against.
pub struct Workspace {
    pub config: Config,
    pub config_path: PathBuf,
    pub base: PathBuf,
}

impl Workspace {
    pub fn load(config: Option<PathBuf>, workdir: Option<PathBuf>) -> anyhow::Result<Self> {
        let parser = ConfigParser::new();
        let config_path = match config {
            Some(path) => path,
            None => parser.find_config_file()?,
        };

        let config = parser
            .load_config(&config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?;
        config.validate()?;

        let base = resolve_work_dir(workdir, &config_path)?;
        Ok(Self {
            config,
            config_path,
            base,
        })
    }
}

fn resolve_work_dir(workdir: Option<PathBuf>, config_path: &Path) -> anyhow::Result<PathBuf> {
    if let Some(workdir) = workdir {
        return Ok(workdir);
    }
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(parent.to_path_buf()),
        _ => Ok(std::env::current_dir()?),
    }
}
