//! # vm-ports
//!
//! Forwarded-port collision detection, leasing and repair for local
//! development VMs.
//!
//! Several independent invocations (one per machine, possibly in parallel)
//! compete for a finite set of host TCP ports. A pass for one machine:
//!
//! 1. takes a host-wide advisory lock scoped to the machine's data directory,
//! 2. builds the pool of repair candidates (the usable range minus every
//!    configured host port minus ports claimed by sibling machines),
//! 3. checks each enabled TCP rule in order against sibling claims, a live
//!    TCP probe and the lease directory, leasing ports found free,
//! 4. repairs collisions smallest-candidate-first when the rule opts in,
//! 5. releases its leases on every exit path.
//!
//! ## Quick Start
//!
//! ```no_run
//! use vm_ports::{Orchestrator, Parser};
//!
//! # fn example() -> Result<(), vm_ports::Error> {
//! let parser = Parser::new();
//! let config = parser.load_config("vmports.yaml")?;
//! config.validate()?;
//!
//! let base = std::path::Path::new(".");
//! let machines = config.select_machines(&[], base)?;
//! let orchestrator = Orchestrator::new().with_retry(config.retry_policy()?);
//!
//! let resolutions =
//!     vm_ports::orchestrator::resolve_batch(&orchestrator, &machines, &config.pass_options()?)?;
//! for resolution in &resolutions {
//!     for notice in &resolution.notices {
//!         println!("{}: {}", resolution.machine, notice);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod lock;
pub mod orchestrator;
pub mod port;

// Re-export commonly used types
pub use config::{Config, MachineConfig, Parser};
pub use error::{Error, Result};
pub use lock::{Locker, ProcessLock, RetryPolicy};
pub use orchestrator::{Machine, Orchestrator, PassOptions, Resolution};
pub use port::{ExternalClaims, ForwardingRule, HostIp, PortProber, RemapTable};
