//! Status publisher
//!
//! Fan-out of link status to listeners that take no part in machine
//! correctness. Everything is published from the service task, so every
//! receiver observes events in the order the machine produced them.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// Adapter power status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerStatus {
    OnLine,
    OffLine,
}

/// Progress of attachment and command execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Scanning,
    Retrieving,
    /// First attachment completed; client commands are now accepted
    Ready,
    ScanSucceeded,
    RetrieveSucceeded,
    ScanTimedOut,
    /// The adapter refused to scan
    ScanFailed,
    ConnectTimedOut,
    OperationTimedOut,
    OperationFailed,
}

/// Peripheral link status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStatus {
    Connected {
        peripheral: String,
    },
    Disconnected {
        peripheral: Option<String>,
        error: Option<String>,
    },
}

/// Everything the service announces to listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StatusEvent {
    Adapter(PowerStatus),
    Phase(Phase),
    Link(LinkStatus),
    WriteConfirmed {
        service: Uuid,
        characteristic: Uuid,
        error: Option<String>,
    },
    NotifyStateChanged {
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    },
    ValueChanged {
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    RssiChanged(i16),
}

/// Multicast sender for [`StatusEvent`]s
#[derive(Debug, Clone)]
pub struct StatusPublisher {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish `event`; having no listeners is not an error
    pub fn publish(&self, event: StatusEvent) {
        match self.tx.send(event) {
            Ok(receivers) => trace!(receivers, "status published"),
            Err(_) => trace!("status published with no listeners"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
