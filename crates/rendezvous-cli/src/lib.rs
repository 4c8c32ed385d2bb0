//! Rendezvous CLI library
//!
//! Argument parsing, layered configuration and the command implementations
//! behind the `rendezvous` binary.

pub mod app;
pub mod cli;
pub mod config;
pub mod error;

pub use app::{run_demo, App, DemoOutcome};
pub use cli::{Cli, Commands};
pub use config::{AppConfig, ConfigError, Overrides};
pub use error::{CliError, Result};
