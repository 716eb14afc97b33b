//! Machine events
//!
//! Table lookup only ever uses the [`EventKind`] tag. The data delivered with
//! an event travels alongside it as an [`EventPayload`]; the constructors on
//! [`Event`] keep the two in agreement.

use std::fmt;

use uuid::Uuid;

use crate::command::StagedCommand;
use crate::error::ActionError;
use crate::session::{CharacteristicHandle, PeripheralHandle, ServiceHandle};

// ----------------------------------------------------------------------------
// Event Kind
// ----------------------------------------------------------------------------

/// Lookup tag for the transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    OnLine,
    OffLine,
    Scan,
    Retrieve,
    Discovered,
    Retrieved,
    ScanSuccess,
    ScanTimeout,
    ScanFail,
    RetrieveFail,
    ConnectSuccess,
    ConnectFail,
    ConnectTimeout,
    Disconnected,
    DisconnectedWithError,
    DiscoverServicesSuccess,
    DiscoverServicesFail,
    DiscoverCharacteristicsSuccess,
    DiscoverCharacteristicsFail,
    Read,
    Write,
    SetNotify,
    ReadRssi,
    ReadRssiSuccess,
    ReadRssiFail,
    OperationTimeout,
}

impl EventKind {
    pub const ALL: [EventKind; 26] = [
        EventKind::OnLine,
        EventKind::OffLine,
        EventKind::Scan,
        EventKind::Retrieve,
        EventKind::Discovered,
        EventKind::Retrieved,
        EventKind::ScanSuccess,
        EventKind::ScanTimeout,
        EventKind::ScanFail,
        EventKind::RetrieveFail,
        EventKind::ConnectSuccess,
        EventKind::ConnectFail,
        EventKind::ConnectTimeout,
        EventKind::Disconnected,
        EventKind::DisconnectedWithError,
        EventKind::DiscoverServicesSuccess,
        EventKind::DiscoverServicesFail,
        EventKind::DiscoverCharacteristicsSuccess,
        EventKind::DiscoverCharacteristicsFail,
        EventKind::Read,
        EventKind::Write,
        EventKind::SetNotify,
        EventKind::ReadRssi,
        EventKind::ReadRssiSuccess,
        EventKind::ReadRssiFail,
        EventKind::OperationTimeout,
    ];

    /// Outcome of an earlier session request, or a follow-up posted by an
    /// action. These can arrive after the state that asked for them has
    /// already moved on.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            EventKind::Discovered
                | EventKind::Retrieved
                | EventKind::RetrieveFail
                | EventKind::ScanSuccess
                | EventKind::ScanFail
                | EventKind::ConnectSuccess
                | EventKind::ConnectFail
                | EventKind::DiscoverServicesSuccess
                | EventKind::DiscoverServicesFail
                | EventKind::DiscoverCharacteristicsSuccess
                | EventKind::DiscoverCharacteristicsFail
                | EventKind::ReadRssiSuccess
                | EventKind::ReadRssiFail
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ----------------------------------------------------------------------------
// Event Payload
// ----------------------------------------------------------------------------

/// Data carried with a dispatched event
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    None,
    /// Target service for an attach request
    Service(Uuid),
    Peripheral(PeripheralHandle),
    GattService(ServiceHandle),
    Characteristic(CharacteristicHandle),
    Command(StagedCommand),
    Rssi(i16),
    /// Human-readable reason attached to a failure event
    Reason(String),
}

impl EventPayload {
    fn label(&self) -> &'static str {
        match self {
            EventPayload::None => "none",
            EventPayload::Service(_) => "service uuid",
            EventPayload::Peripheral(_) => "peripheral",
            EventPayload::GattService(_) => "gatt service",
            EventPayload::Characteristic(_) => "characteristic",
            EventPayload::Command(_) => "command",
            EventPayload::Rssi(_) => "rssi",
            EventPayload::Reason(_) => "reason",
        }
    }
}

// ----------------------------------------------------------------------------
// Event
// ----------------------------------------------------------------------------

/// An input to the connection state machine
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    kind: EventKind,
    payload: EventPayload,
}

impl Event {
    fn bare(kind: EventKind) -> Self {
        Self {
            kind,
            payload: EventPayload::None,
        }
    }

    pub fn on_line() -> Self {
        Self::bare(EventKind::OnLine)
    }

    pub fn off_line() -> Self {
        Self::bare(EventKind::OffLine)
    }

    pub fn scan(service: Uuid) -> Self {
        Self {
            kind: EventKind::Scan,
            payload: EventPayload::Service(service),
        }
    }

    pub fn retrieve(service: Uuid) -> Self {
        Self {
            kind: EventKind::Retrieve,
            payload: EventPayload::Service(service),
        }
    }

    pub fn discovered(peripheral: PeripheralHandle) -> Self {
        Self {
            kind: EventKind::Discovered,
            payload: EventPayload::Peripheral(peripheral),
        }
    }

    pub fn retrieved(peripheral: PeripheralHandle) -> Self {
        Self {
            kind: EventKind::Retrieved,
            payload: EventPayload::Peripheral(peripheral),
        }
    }

    pub fn scan_success() -> Self {
        Self::bare(EventKind::ScanSuccess)
    }

    pub fn scan_timeout() -> Self {
        Self::bare(EventKind::ScanTimeout)
    }

    pub fn scan_fail(reason: impl Into<String>) -> Self {
        Self::failure(EventKind::ScanFail, reason)
    }

    pub fn retrieve_fail(reason: impl Into<String>) -> Self {
        Self::failure(EventKind::RetrieveFail, reason)
    }

    pub fn connect_success(peripheral: PeripheralHandle) -> Self {
        Self {
            kind: EventKind::ConnectSuccess,
            payload: EventPayload::Peripheral(peripheral),
        }
    }

    pub fn connect_fail(reason: impl Into<String>) -> Self {
        Self::failure(EventKind::ConnectFail, reason)
    }

    pub fn connect_timeout() -> Self {
        Self::bare(EventKind::ConnectTimeout)
    }

    pub fn disconnected(error: Option<String>) -> Self {
        match error {
            Some(reason) => Self::failure(EventKind::DisconnectedWithError, reason),
            None => Self::bare(EventKind::Disconnected),
        }
    }

    pub fn discover_services_success(service: ServiceHandle) -> Self {
        Self {
            kind: EventKind::DiscoverServicesSuccess,
            payload: EventPayload::GattService(service),
        }
    }

    pub fn discover_services_fail(reason: impl Into<String>) -> Self {
        Self::failure(EventKind::DiscoverServicesFail, reason)
    }

    pub fn discover_characteristics_success(characteristic: CharacteristicHandle) -> Self {
        Self {
            kind: EventKind::DiscoverCharacteristicsSuccess,
            payload: EventPayload::Characteristic(characteristic),
        }
    }

    pub fn discover_characteristics_fail(reason: impl Into<String>) -> Self {
        Self::failure(EventKind::DiscoverCharacteristicsFail, reason)
    }

    /// The event a dequeued command is fed to the machine as
    pub fn command(staged: StagedCommand) -> Self {
        Self {
            kind: staged.command.event_kind(),
            payload: EventPayload::Command(staged),
        }
    }

    pub fn read_rssi_success(rssi: i16) -> Self {
        Self {
            kind: EventKind::ReadRssiSuccess,
            payload: EventPayload::Rssi(rssi),
        }
    }

    pub fn read_rssi_fail(reason: impl Into<String>) -> Self {
        Self::failure(EventKind::ReadRssiFail, reason)
    }

    pub fn operation_timeout() -> Self {
        Self::bare(EventKind::OperationTimeout)
    }

    fn failure(kind: EventKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            payload: EventPayload::Reason(reason.into()),
        }
    }

    /// Event of any kind with no payload, for exercising the table
    #[cfg(test)]
    pub(crate) fn of_kind(kind: EventKind) -> Self {
        Self::bare(kind)
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub(crate) fn service_uuid(&self) -> Result<Uuid, ActionError> {
        match &self.payload {
            EventPayload::Service(uuid) => Ok(*uuid),
            _ => Err(self.unexpected("service uuid")),
        }
    }

    pub(crate) fn peripheral(&self) -> Result<&PeripheralHandle, ActionError> {
        match &self.payload {
            EventPayload::Peripheral(handle) => Ok(handle),
            _ => Err(self.unexpected("peripheral")),
        }
    }

    pub(crate) fn gatt_service(&self) -> Result<&ServiceHandle, ActionError> {
        match &self.payload {
            EventPayload::GattService(handle) => Ok(handle),
            _ => Err(self.unexpected("gatt service")),
        }
    }

    pub(crate) fn characteristic(&self) -> Result<&CharacteristicHandle, ActionError> {
        match &self.payload {
            EventPayload::Characteristic(handle) => Ok(handle),
            _ => Err(self.unexpected("characteristic")),
        }
    }

    pub(crate) fn staged_command(&self) -> Result<&StagedCommand, ActionError> {
        match &self.payload {
            EventPayload::Command(staged) => Ok(staged),
            _ => Err(self.unexpected("command")),
        }
    }

    pub(crate) fn rssi(&self) -> Result<i16, ActionError> {
        match &self.payload {
            EventPayload::Rssi(rssi) => Ok(*rssi),
            _ => Err(self.unexpected("rssi")),
        }
    }

    pub(crate) fn reason(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Reason(reason) => Some(reason),
            _ => None,
        }
    }

    fn unexpected(&self, expected: &'static str) -> ActionError {
        ActionError::UnexpectedPayload {
            event: self.kind,
            expected,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.payload.label())
    }
}
