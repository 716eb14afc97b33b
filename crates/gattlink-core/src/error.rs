//! Error types for the gattlink core
//!
//! Each layer owns a narrow error enum; [`LinkError`] unifies them for callers
//! of the service API.

use thiserror::Error;

use crate::machine::{EventKind, State};

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Synchronous failures reported by a [`crate::session::CentralSession`]
///
/// Asynchronous outcomes never surface here; they come back as adapter events.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("BLE adapter not available")]
    AdapterUnavailable,

    #[error("Peripheral not known to the adapter: {peripheral_id}")]
    UnknownPeripheral { peripheral_id: String },

    #[error("BLE backend error: {0}")]
    Backend(String),
}

/// Settings persistence errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode settings value: {0}")]
    Encode(String),

    #[error("Failed to decode settings value: {0}")]
    Decode(String),
}

/// Failure raised by a single state-machine action
#[derive(Debug, Error)]
pub enum ActionError {
    /// A piece of the active session context the action depends on is absent
    #[error("Missing session context: {0}")]
    MissingContext(&'static str),

    #[error("Event {event} carries an unexpected payload (expected {expected})")]
    UnexpectedPayload {
        event: EventKind,
        expected: &'static str,
    },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by [`crate::machine::ConnectionMachine::handle_event`]
///
/// In every case the machine has already been returned to a valid state.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("Event {event} dispatched while another event was being handled")]
    Reentrant { event: EventKind },

    #[error("Event {event} is not valid in state {state}; fell back to {fallback}")]
    InvalidEvent {
        state: State,
        event: EventKind,
        fallback: State,
    },

    #[error("Action failed handling {event} in state {state}; fell back to {fallback}: {source}")]
    ActionFailed {
        state: State,
        event: EventKind,
        fallback: State,
        #[source]
        source: ActionError,
    },
}

/// Setup-time errors while building the error table
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("Fallback for state {0} registered twice")]
    DuplicateFallback(State),

    #[error("No fallback registered for state {0}")]
    MissingFallback(State),
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Umbrella error for the gattlink core
#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Machine(#[from] MachineError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error("BLE service task is no longer running")]
    ServiceStopped,
}

/// Result alias used across the public API
pub type LinkResult<T> = std::result::Result<T, LinkError>;
