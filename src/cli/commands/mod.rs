//! CLI command implementations.

mod compact;
mod config;
mod start;

pub use compact::{run_compact, CompactArgs};
pub use config::{run_config, ConfigArgs};
pub use start::{init_tracing, run_start, StartArgs};
