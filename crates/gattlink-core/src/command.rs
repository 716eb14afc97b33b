//! Client-issued GATT commands

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::machine::EventKind;
use crate::queue::CommandId;

/// An operation a client asks the service to perform on the attached peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Read {
        service: Uuid,
        characteristic: Uuid,
    },
    Write {
        service: Uuid,
        characteristic: Uuid,
        data: Vec<u8>,
        requires_ack: bool,
    },
    SetNotify {
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    },
    ReadRssi,
}

impl Command {
    /// Machine event this command is dispatched as
    pub fn event_kind(&self) -> EventKind {
        match self {
            Command::Read { .. } => EventKind::Read,
            Command::Write { .. } => EventKind::Write,
            Command::SetNotify { .. } => EventKind::SetNotify,
            Command::ReadRssi => EventKind::ReadRssi,
        }
    }

    /// GATT target of the command, if it addresses a characteristic
    pub fn target(&self) -> Option<(Uuid, Uuid)> {
        match self {
            Command::Read {
                service,
                characteristic,
            }
            | Command::Write {
                service,
                characteristic,
                ..
            }
            | Command::SetNotify {
                service,
                characteristic,
                ..
            } => Some((*service, *characteristic)),
            Command::ReadRssi => None,
        }
    }
}

/// A command that has been dequeued and handed to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedCommand {
    pub id: CommandId,
    pub command: Command,
}
