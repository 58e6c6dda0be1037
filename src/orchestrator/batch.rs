//! Resolving several machines in one run.
//!
//! Machines are resolved in order; every port a machine ends up with is
//! added to the sibling claims seen by the machines after it.

use super::core::{ActivePass, Machine, Orchestrator, PassOptions, Resolution};
use crate::error::Result;
use tracing::warn;

/// Passes for a batch of machines, all still holding their leases.
pub struct ActiveBatch {
    passes: Vec<ActivePass>,
}

impl ActiveBatch {
    pub fn resolutions(&self) -> impl Iterator<Item = &Resolution> {
        self.passes.iter().map(ActivePass::resolution)
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Finish every pass. All passes are released even if one fails; the
    /// first error is returned.
    pub fn finish(self, succeeded: bool) -> Result<Vec<Resolution>> {
        let mut resolutions = Vec::with_capacity(self.passes.len());
        let mut first_err = None;

        for pass in self.passes {
            match pass.finish(succeeded) {
                Ok(resolution) => resolutions.push(resolution),
                Err(e) => {
                    warn!("Failed to finish pass: {}", e);
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(resolutions),
        }
    }
}

/// Begin a pass for each machine in order, feeding earlier machines' ports
/// into later machines' sibling claims. If any machine fails, passes already
/// begun are released before the error is returned.
pub fn begin_batch(
    orchestrator: &Orchestrator,
    machines: &[Machine],
    options: &PassOptions,
) -> Result<ActiveBatch> {
    let mut claims = options.extra_in_use.clone();
    let mut passes = Vec::with_capacity(machines.len());

    for machine in machines {
        let machine_options = PassOptions {
            extra_in_use: claims.clone(),
            ..options.clone()
        };

        // Dropping `passes` on error releases the earlier leases.
        let pass = orchestrator.begin(machine, &machine_options)?;
        claims.extend(&pass.resolution().claims());
        passes.push(pass);
    }

    Ok(ActiveBatch { passes })
}

/// Resolve every machine and release all leases.
pub fn resolve_batch(
    orchestrator: &Orchestrator,
    machines: &[Machine],
    options: &PassOptions,
) -> Result<Vec<Resolution>> {
    begin_batch(orchestrator, machines, options)?.finish(true)
}
