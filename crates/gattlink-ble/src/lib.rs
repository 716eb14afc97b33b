//! Bluetooth Low Energy session for gattlink
//!
//! [`BtleplugSession`] implements [`gattlink_core::CentralSession`] on top of
//! `btleplug`, so the connection manager can drive a real adapter.
//!
//! ## Architecture
//!
//! - [`config`] - Adapter selection
//! - [`error`] - Driver errors and their mapping onto `SessionError`
//! - `peripheral` - Identifier encoding and GATT lookups
//! - `driver` - The task that owns the adapter and runs operations
//! - `session` - The non-blocking handle the state machine calls
//!
//! ## Usage
//!
//! ```rust,no_run
//! use gattlink_ble::{BleSessionConfig, BtleplugSession};
//! use gattlink_core::{BleService, CentralSession, FileStore, ServiceConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let service = BleService::spawn(
//!     ServiceConfig::default(),
//!     Box::new(FileStore::new("settings.json")),
//!     |events| {
//!         Box::new(BtleplugSession::start(BleSessionConfig::default(), events))
//!             as Box<dyn CentralSession>
//!     },
//! )?;
//! service.attach_peripheral(uuid::Uuid::from_u128(0xffe0), true)?;
//! # Ok(())
//! # }
//! ```
//!
//! Peripheral identifiers handed to the core are the JSON form of btleplug's
//! `PeripheralId`, which is what gets persisted for later retrieval.

pub mod config;
pub mod error;

mod driver;
mod peripheral;
mod session;

pub use config::BleSessionConfig;
pub use error::BleSessionError;
pub use session::BtleplugSession;
