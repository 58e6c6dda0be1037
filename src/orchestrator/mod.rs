pub mod batch;
mod core;
mod state;

pub use batch::{begin_batch, resolve_batch, ActiveBatch};
pub use core::*;
pub use state::PassState;
