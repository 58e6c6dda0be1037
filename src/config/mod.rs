//! Configuration parsing and types.
//!
//! - `types` - Root config (`Config`, `MachineConfig`, `LockConfig`)
//! - `duration` - Duration strings (`60s`, `500ms`)
//! - `parser` - YAML config discovery and parsing
//! - `validation` - Config validation

mod duration;
mod parser;
mod types;
mod validation;

pub use duration::*;
pub use parser::*;
pub use types::*;
