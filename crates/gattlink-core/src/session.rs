//! Adapter/peripheral session boundary
//!
//! The state machine drives the BLE stack through [`CentralSession`]. Every
//! call returns immediately; its outcome arrives later as an [`AdapterEvent`]
//! that the driver posts through an [`AdapterEventSender`]. The sender
//! re-dispatches onto the service's single execution context, which is the
//! only place machine state is touched.
//!
//! Handles are plain data (identifiers and UUIDs). Drivers keep their own
//! mapping from handle to platform object.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::dispatch::Input;
use crate::error::SessionError;
use crate::machine::Event;
use crate::publisher::{LinkStatus, StatusEvent};

// ----------------------------------------------------------------------------
// Handles
// ----------------------------------------------------------------------------

/// A peripheral known to the driver
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeripheralHandle {
    /// Platform identifier, stable enough to persist for retrieval
    pub id: String,
    /// Advertised local name, when known
    pub name: Option<String>,
}

impl PeripheralHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => f.write_str(&self.id),
        }
    }
}

/// A resolved GATT service on a peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceHandle {
    pub peripheral: String,
    pub uuid: Uuid,
}

/// A resolved GATT characteristic on a peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicHandle {
    pub peripheral: String,
    pub service: Uuid,
    pub uuid: Uuid,
}

impl CharacteristicHandle {
    pub fn new(peripheral: impl Into<String>, service: Uuid, uuid: Uuid) -> Self {
        Self {
            peripheral: peripheral.into(),
            service,
            uuid,
        }
    }
}

// ----------------------------------------------------------------------------
// Session Trait
// ----------------------------------------------------------------------------

/// Non-blocking driver for the platform BLE central
///
/// An `Err` is reserved for synchronous precondition failures (no adapter,
/// unknown peripheral). Success means the operation was started; its result
/// is reported as an [`AdapterEvent`].
pub trait CentralSession: Send {
    /// Start scanning for peripherals advertising `service`
    ///
    /// Reports `PeripheralDiscovered` per match, or `ScanFailed`.
    fn scan(&mut self, service: Uuid) -> Result<(), SessionError>;

    fn stop_scan(&mut self) -> Result<(), SessionError>;

    /// Reacquire a previously attached peripheral by its persisted identifier
    ///
    /// Reports `PeripheralRetrieved` or `RetrieveFailed`.
    fn retrieve_peripheral(&mut self, peripheral_id: &str) -> Result<(), SessionError>;

    /// Reports `Connected` or `ConnectFailed`
    fn connect(&mut self, peripheral: &PeripheralHandle) -> Result<(), SessionError>;

    /// Abort a pending connect or drop an established link
    fn cancel_connection(&mut self, peripheral: &PeripheralHandle) -> Result<(), SessionError>;

    /// Reports `ServiceDiscovered` or `ServiceDiscoveryFailed`
    fn discover_service(
        &mut self,
        peripheral: &PeripheralHandle,
        service: Uuid,
    ) -> Result<(), SessionError>;

    /// Reports `CharacteristicDiscovered` or `CharacteristicDiscoveryFailed`
    fn discover_characteristic(
        &mut self,
        service: &ServiceHandle,
        characteristic: Uuid,
    ) -> Result<(), SessionError>;

    /// Reports `ValueUpdated`
    fn read_value(&mut self, characteristic: &CharacteristicHandle) -> Result<(), SessionError>;

    /// Reports `WriteConfirmed` when `with_response` is set
    fn write_value(
        &mut self,
        characteristic: &CharacteristicHandle,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), SessionError>;

    /// Reports `NotifyStateUpdated`
    fn set_notify(
        &mut self,
        characteristic: &CharacteristicHandle,
        enabled: bool,
    ) -> Result<(), SessionError>;

    /// Reports `RssiRead` or `RssiFailed`
    fn read_rssi(&mut self, peripheral: &PeripheralHandle) -> Result<(), SessionError>;
}

// ----------------------------------------------------------------------------
// Adapter Events
// ----------------------------------------------------------------------------

/// Raw asynchronous callback from the BLE driver
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    PoweredOn,
    PoweredOff,
    /// The adapter could not start the requested scan
    ScanFailed { reason: String },
    PeripheralDiscovered(PeripheralHandle),
    PeripheralRetrieved(PeripheralHandle),
    RetrieveFailed { reason: String },
    Connected(PeripheralHandle),
    ConnectFailed { reason: String },
    Disconnected {
        peripheral: PeripheralHandle,
        error: Option<String>,
    },
    ServiceDiscovered(ServiceHandle),
    ServiceDiscoveryFailed { reason: String },
    CharacteristicDiscovered(CharacteristicHandle),
    CharacteristicDiscoveryFailed { reason: String },
    ValueUpdated {
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
    },
    WriteConfirmed {
        characteristic: CharacteristicHandle,
        error: Option<String>,
    },
    NotifyStateUpdated {
        characteristic: CharacteristicHandle,
        enabled: bool,
    },
    RssiRead(i16),
    RssiFailed { reason: String },
}

/// Where a translated adapter event goes
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Feed to the state machine
    Machine(Event),
    /// Data callback that does not affect machine state
    Publish(StatusEvent),
}

impl AdapterEvent {
    /// Translate a raw callback 1:1 into a machine event or a status event
    pub fn route(self) -> Routed {
        match self {
            AdapterEvent::PoweredOn => Routed::Machine(Event::on_line()),
            AdapterEvent::PoweredOff => Routed::Machine(Event::off_line()),
            AdapterEvent::ScanFailed { reason } => Routed::Machine(Event::scan_fail(reason)),
            AdapterEvent::PeripheralDiscovered(peripheral) => {
                Routed::Machine(Event::discovered(peripheral))
            }
            AdapterEvent::PeripheralRetrieved(peripheral) => {
                Routed::Machine(Event::retrieved(peripheral))
            }
            AdapterEvent::RetrieveFailed { reason } => {
                Routed::Machine(Event::retrieve_fail(reason))
            }
            AdapterEvent::Connected(peripheral) => {
                Routed::Machine(Event::connect_success(peripheral))
            }
            AdapterEvent::ConnectFailed { reason } => Routed::Machine(Event::connect_fail(reason)),
            AdapterEvent::Disconnected { error, .. } => {
                Routed::Machine(Event::disconnected(error))
            }
            AdapterEvent::ServiceDiscovered(service) => {
                Routed::Machine(Event::discover_services_success(service))
            }
            AdapterEvent::ServiceDiscoveryFailed { reason } => {
                Routed::Machine(Event::discover_services_fail(reason))
            }
            AdapterEvent::CharacteristicDiscovered(characteristic) => {
                Routed::Machine(Event::discover_characteristics_success(characteristic))
            }
            AdapterEvent::CharacteristicDiscoveryFailed { reason } => {
                Routed::Machine(Event::discover_characteristics_fail(reason))
            }
            AdapterEvent::RssiRead(rssi) => Routed::Machine(Event::read_rssi_success(rssi)),
            AdapterEvent::RssiFailed { reason } => Routed::Machine(Event::read_rssi_fail(reason)),
            AdapterEvent::ValueUpdated {
                characteristic,
                value,
            } => Routed::Publish(StatusEvent::ValueChanged {
                service: characteristic.service,
                characteristic: characteristic.uuid,
                value,
            }),
            AdapterEvent::WriteConfirmed {
                characteristic,
                error,
            } => Routed::Publish(StatusEvent::WriteConfirmed {
                service: characteristic.service,
                characteristic: characteristic.uuid,
                error,
            }),
            AdapterEvent::NotifyStateUpdated {
                characteristic,
                enabled,
            } => Routed::Publish(StatusEvent::NotifyStateChanged {
                service: characteristic.service,
                characteristic: characteristic.uuid,
                enabled,
            }),
        }
    }
}

// ----------------------------------------------------------------------------
// Adapter Event Sender
// ----------------------------------------------------------------------------

/// Hands driver callbacks to the service's execution context
#[derive(Debug, Clone)]
pub struct AdapterEventSender {
    mailbox: mpsc::UnboundedSender<Input>,
}

impl AdapterEventSender {
    pub(crate) fn new(mailbox: mpsc::UnboundedSender<Input>) -> Self {
        Self { mailbox }
    }

    /// Post `event`; dropped quietly once the service has stopped
    pub fn send(&self, event: AdapterEvent) {
        if self.mailbox.send(Input::Adapter(event)).is_err() {
            debug!("BLE service stopped, dropping adapter event");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }
}

/// Status published when a link drop is observed
pub(crate) fn disconnect_status(
    peripheral: Option<&PeripheralHandle>,
    error: Option<&str>,
) -> StatusEvent {
    StatusEvent::Link(LinkStatus::Disconnected {
        peripheral: peripheral.map(|p| p.id.clone()),
        error: error.map(str::to_string),
    })
}
