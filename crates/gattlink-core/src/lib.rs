//! Gattlink Core
//!
//! Connection management for a single BLE peripheral. This crate holds the
//! pieces that do not depend on any particular Bluetooth stack: the
//! connection state machine, the serialized command queue with its watchdog,
//! the session boundary a driver implements, the status broadcast and the
//! persisted attachment record. Drivers live in separate crates and report
//! back through [`session::AdapterEventSender`].

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod command;
pub mod config;
pub mod error;
pub mod machine;
pub mod publisher;
pub mod queue;
pub mod service;
pub mod session;
pub mod store;
pub mod timer;

mod dispatch;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use command::Command;
pub use config::{MachineConfig, ServiceConfig};
pub use error::{LinkError, LinkResult, SessionError, StoreError};
pub use machine::{EventKind, State};
pub use publisher::{LinkStatus, Phase, PowerStatus, StatusEvent};
pub use queue::{CommandId, QueueConfig};
pub use service::{BleService, LinkSnapshot};
pub use session::{
    AdapterEvent, AdapterEventSender, CentralSession, CharacteristicHandle, PeripheralHandle,
    ServiceHandle,
};
pub use store::{FileStore, MemoryStore, SettingsStore};
