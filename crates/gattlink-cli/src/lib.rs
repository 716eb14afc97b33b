//! Gattlink CLI library
//!
//! Components behind the `gattlink` binary: argument parsing, configuration,
//! the application wrapper around the BLE service and the command handlers.

pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use app::GattlinkApp;
pub use cli::{Cli, Commands};
pub use config::AppConfig;
pub use error::{CliError, Result};
