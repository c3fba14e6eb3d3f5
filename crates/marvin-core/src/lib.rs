//! `marvin-core` — shared configuration and error types.
//!
//! Every marvin crate that needs service knobs pulls them from
//! [`config::MarvinConfig`], which layers a TOML file under `MARVIN_*`
//! environment overrides.

pub mod config;
pub mod error;

pub use config::{DefaultRunPolicy, MarvinConfig, SchedulerConfig};
pub use error::{MarvinError, Result};
