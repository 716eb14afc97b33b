//! Conversions between btleplug types and gattlink handles

use std::collections::BTreeSet;

use btleplug::api::{
    CentralState, Characteristic, Peripheral as _, PeripheralProperties, WriteType,
};
use btleplug::platform::{Peripheral, PeripheralId};
use gattlink_core::{AdapterEvent, CharacteristicHandle, ServiceHandle};
use uuid::Uuid;

use crate::error::{BleSessionError, Result};

// ----------------------------------------------------------------------------
// Identifiers
// ----------------------------------------------------------------------------

/// Persistable form of a platform peripheral identifier
pub fn encode_id(id: &PeripheralId) -> Result<String> {
    serde_json::to_string(id).map_err(|e| BleSessionError::InvalidPeripheralId {
        peripheral_id: format!("{:?}", id),
        reason: e.to_string(),
    })
}

pub fn decode_id(encoded: &str) -> Result<PeripheralId> {
    serde_json::from_str(encoded).map_err(|e| BleSessionError::InvalidPeripheralId {
        peripheral_id: encoded.to_string(),
        reason: e.to_string(),
    })
}

// ----------------------------------------------------------------------------
// Advertisement and Power
// ----------------------------------------------------------------------------

/// Whether an advertisement names `service`
pub fn advertises(properties: &PeripheralProperties, service: Uuid) -> bool {
    properties.services.contains(&service) || properties.service_data.contains_key(&service)
}

/// Adapter event for a power change; `Unknown` carries no information
pub fn power_event(state: CentralState) -> Option<AdapterEvent> {
    match state {
        CentralState::PoweredOn => Some(AdapterEvent::PoweredOn),
        CentralState::PoweredOff => Some(AdapterEvent::PoweredOff),
        CentralState::Unknown => None,
    }
}

pub fn write_type(with_response: bool) -> WriteType {
    if with_response {
        WriteType::WithResponse
    } else {
        WriteType::WithoutResponse
    }
}

// ----------------------------------------------------------------------------
// GATT Resolution
// ----------------------------------------------------------------------------

fn cached_characteristic(peripheral: &Peripheral, service: Uuid, uuid: Uuid) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.service_uuid == service && c.uuid == uuid)
}

/// Find a characteristic, running service discovery when it is not cached
///
/// Handles may be built from UUIDs alone, without a discovery pass on the
/// current connection.
pub async fn resolve_characteristic(
    peripheral: &Peripheral,
    service: Uuid,
    uuid: Uuid,
) -> Result<Characteristic> {
    if let Some(characteristic) = cached_characteristic(peripheral, service, uuid) {
        return Ok(characteristic);
    }
    peripheral.discover_services().await?;
    cached_characteristic(peripheral, service, uuid)
        .ok_or(BleSessionError::CharacteristicNotFound { characteristic: uuid })
}

pub async fn discover_service(
    peripheral: &Peripheral,
    peripheral_id: String,
    service: Uuid,
) -> Result<ServiceHandle> {
    peripheral.discover_services().await?;
    if peripheral.services().iter().any(|s| s.uuid == service) {
        Ok(ServiceHandle {
            peripheral: peripheral_id,
            uuid: service,
        })
    } else {
        Err(BleSessionError::ServiceNotFound { service })
    }
}

pub async fn discover_characteristic(
    peripheral: &Peripheral,
    service: &ServiceHandle,
    uuid: Uuid,
) -> Result<CharacteristicHandle> {
    resolve_characteristic(peripheral, service.uuid, uuid).await?;
    Ok(CharacteristicHandle::new(
        service.peripheral.clone(),
        service.uuid,
        uuid,
    ))
}

/// Service a notified characteristic belongs to
///
/// `None` until service discovery has listed the characteristic on this
/// connection.
pub fn service_of(
    characteristics: &BTreeSet<Characteristic>,
    characteristic: Uuid,
) -> Option<Uuid> {
    characteristics
        .iter()
        .find(|c| c.uuid == characteristic)
        .map(|c| c.service_uuid)
}

pub async fn read_rssi(peripheral: &Peripheral) -> Result<i16> {
    peripheral
        .properties()
        .await?
        .and_then(|properties| properties.rssi)
        .ok_or(BleSessionError::RssiUnavailable)
}
