//! Connection states

use std::fmt;

use serde::{Deserialize, Serialize};

/// The state of the single peripheral link
///
/// Exactly one state is current at any time. There is no terminal state:
/// the machine cycles between `Ready` and the transient work states for the
/// life of the service, and `OffLine` is a recoverable quiescent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    /// Adapter powered on, no peripheral being acquired
    OnLine,
    /// Adapter powered off or unavailable
    OffLine,
    /// Scanning for a peripheral advertising the target service
    Scanning,
    /// Reacquiring the last attached peripheral by its stored identifier
    Retrieving,
    /// Attached and idle; client commands are accepted
    Ready,
    /// Resolving GATT and performing a read, write or notify command
    ReadWriteNotify,
    /// Reading the link RSSI
    ReadRssi,
}

impl State {
    /// Optimistic default before the adapter reports its power state
    pub const INITIAL: State = State::OnLine;

    pub const ALL: [State; 7] = [
        State::OnLine,
        State::OffLine,
        State::Scanning,
        State::Retrieving,
        State::Ready,
        State::ReadWriteNotify,
        State::ReadRssi,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            State::OnLine => "OnLine",
            State::OffLine => "OffLine",
            State::Scanning => "Scanning",
            State::Retrieving => "Retrieving",
            State::Ready => "Ready",
            State::ReadWriteNotify => "ReadWriteNotify",
            State::ReadRssi => "ReadRssi",
        }
    }

    /// Whether a peripheral has completed attachment in this state
    pub fn is_attached(&self) -> bool {
        matches!(
            self,
            State::Ready | State::ReadWriteNotify | State::ReadRssi
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
