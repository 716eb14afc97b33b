//! Test doubles and fixtures
//!
//! [`RecordingSession`] stands in for a BLE driver: it performs nothing and
//! reports every call on a [`SessionProbe`]. Tests play the driver's part by
//! sending [`crate::session::AdapterEvent`]s themselves.

use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::SessionError;
use crate::session::{CentralSession, CharacteristicHandle, PeripheralHandle, ServiceHandle};

// ----------------------------------------------------------------------------
// Fixtures
// ----------------------------------------------------------------------------

pub fn service_uuid() -> Uuid {
    Uuid::from_u128(0x0000_ffe0_0000_1000_8000_0080_5f9b_34fb)
}

pub fn characteristic_uuid() -> Uuid {
    Uuid::from_u128(0x0000_ffe1_0000_1000_8000_0080_5f9b_34fb)
}

pub fn peripheral() -> PeripheralHandle {
    PeripheralHandle::new("AA:BB:CC:DD:EE:01").with_name("LED Strip")
}

pub fn service_handle() -> ServiceHandle {
    ServiceHandle {
        peripheral: peripheral().id,
        uuid: service_uuid(),
    }
}

pub fn characteristic_handle() -> CharacteristicHandle {
    CharacteristicHandle::new(peripheral().id, service_uuid(), characteristic_uuid())
}

// ----------------------------------------------------------------------------
// Recording Session
// ----------------------------------------------------------------------------

/// A call made on a [`RecordingSession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    Scan(Uuid),
    StopScan,
    Retrieve(String),
    Connect(String),
    CancelConnection(String),
    DiscoverService {
        peripheral: String,
        service: Uuid,
    },
    DiscoverCharacteristic {
        service: Uuid,
        characteristic: Uuid,
    },
    Read(CharacteristicHandle),
    Write {
        characteristic: CharacteristicHandle,
        data: Vec<u8>,
        with_response: bool,
    },
    SetNotify {
        characteristic: CharacteristicHandle,
        enabled: bool,
    },
    ReadRssi(String),
}

/// Session double that records calls instead of touching hardware
#[derive(Debug)]
pub struct RecordingSession {
    probe: mpsc::UnboundedSender<SessionCall>,
    fail_connects: bool,
}

impl RecordingSession {
    pub fn new() -> (Self, SessionProbe) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                probe: tx,
                fail_connects: false,
            },
            SessionProbe { rx },
        )
    }

    /// Make every `connect` fail synchronously
    pub fn failing_connects(mut self) -> Self {
        self.fail_connects = true;
        self
    }

    fn record(&self, call: SessionCall) -> Result<(), SessionError> {
        let _ = self.probe.send(call);
        Ok(())
    }
}

impl CentralSession for RecordingSession {
    fn scan(&mut self, service: Uuid) -> Result<(), SessionError> {
        self.record(SessionCall::Scan(service))
    }

    fn stop_scan(&mut self) -> Result<(), SessionError> {
        self.record(SessionCall::StopScan)
    }

    fn retrieve_peripheral(&mut self, peripheral_id: &str) -> Result<(), SessionError> {
        self.record(SessionCall::Retrieve(peripheral_id.to_string()))
    }

    fn connect(&mut self, peripheral: &PeripheralHandle) -> Result<(), SessionError> {
        if self.fail_connects {
            return Err(SessionError::Backend("connect refused".into()));
        }
        self.record(SessionCall::Connect(peripheral.id.clone()))
    }

    fn cancel_connection(&mut self, peripheral: &PeripheralHandle) -> Result<(), SessionError> {
        self.record(SessionCall::CancelConnection(peripheral.id.clone()))
    }

    fn discover_service(
        &mut self,
        peripheral: &PeripheralHandle,
        service: Uuid,
    ) -> Result<(), SessionError> {
        self.record(SessionCall::DiscoverService {
            peripheral: peripheral.id.clone(),
            service,
        })
    }

    fn discover_characteristic(
        &mut self,
        service: &ServiceHandle,
        characteristic: Uuid,
    ) -> Result<(), SessionError> {
        self.record(SessionCall::DiscoverCharacteristic {
            service: service.uuid,
            characteristic,
        })
    }

    fn read_value(&mut self, characteristic: &CharacteristicHandle) -> Result<(), SessionError> {
        self.record(SessionCall::Read(characteristic.clone()))
    }

    fn write_value(
        &mut self,
        characteristic: &CharacteristicHandle,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), SessionError> {
        self.record(SessionCall::Write {
            characteristic: characteristic.clone(),
            data: data.to_vec(),
            with_response,
        })
    }

    fn set_notify(
        &mut self,
        characteristic: &CharacteristicHandle,
        enabled: bool,
    ) -> Result<(), SessionError> {
        self.record(SessionCall::SetNotify {
            characteristic: characteristic.clone(),
            enabled,
        })
    }

    fn read_rssi(&mut self, peripheral: &PeripheralHandle) -> Result<(), SessionError> {
        self.record(SessionCall::ReadRssi(peripheral.id.clone()))
    }
}

/// Receiving end of a [`RecordingSession`]
#[derive(Debug)]
pub struct SessionProbe {
    rx: mpsc::UnboundedReceiver<SessionCall>,
}

impl SessionProbe {
    /// Calls recorded so far, without waiting
    pub fn drain(&mut self) -> Vec<SessionCall> {
        let mut calls = Vec::new();
        while let Ok(call) = self.rx.try_recv() {
            calls.push(call);
        }
        calls
    }

    /// Wait for the next call, giving up after `limit`
    pub async fn next_within(&mut self, limit: Duration) -> Option<SessionCall> {
        tokio::time::timeout(limit, self.rx.recv()).await.ok().flatten()
    }

    /// Wait until a call matching `predicate` is recorded, skipping others
    pub async fn wait_for<F>(&mut self, limit: Duration, mut predicate: F) -> Option<SessionCall>
    where
        F: FnMut(&SessionCall) -> bool,
    {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let call = tokio::time::timeout_at(deadline, self.rx.recv())
                .await
                .ok()
                .flatten()?;
            if predicate(&call) {
                return Some(call);
            }
        }
    }
}
