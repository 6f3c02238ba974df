//! Instance Host
//!
//! Command-line host for `script-instance`: loads `instance.toml`, runs a
//! frame loop against a pooled broker and a dry-run runtime context, and
//! logs every lifecycle event.

pub mod config;
pub mod driver;
pub mod dry_run;

pub use config::{ConfigError, HostConfig, HostSettings};
pub use driver::{HostComponent, HostOwner, RunReport, run};
pub use dry_run::{DryRunContext, DryRunFactory};
