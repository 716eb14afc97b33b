//! [`CentralSession`] implementation over btleplug

use gattlink_core::{
    AdapterEventSender, CentralSession, CharacteristicHandle, PeripheralHandle, ServiceHandle,
    SessionError,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::BleSessionConfig;
use crate::driver::{Driver, Op};
use crate::error::BleSessionError;

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

/// Central session backed by the host's Bluetooth adapter
///
/// Calls only enqueue work for the driver task, so none of them block. The
/// driver reports the adapter's power state as soon as it is initialized; a
/// host without a usable adapter reports `PoweredOff`.
#[derive(Debug)]
pub struct BtleplugSession {
    ops: mpsc::UnboundedSender<Op>,
}

impl BtleplugSession {
    /// Spawn the driver task; must be called from within a tokio runtime
    pub fn start(config: BleSessionConfig, events: AdapterEventSender) -> Self {
        let (ops, rx) = mpsc::unbounded_channel();
        tokio::spawn(Driver::new(config, events, rx).run());
        Self { ops }
    }

    fn request(&self, op: Op) -> Result<(), SessionError> {
        self.ops
            .send(op)
            .map_err(|_| BleSessionError::DriverStopped.into())
    }
}

impl CentralSession for BtleplugSession {
    fn scan(&mut self, service: Uuid) -> Result<(), SessionError> {
        self.request(Op::Scan(service))
    }

    fn stop_scan(&mut self) -> Result<(), SessionError> {
        self.request(Op::StopScan)
    }

    fn retrieve_peripheral(&mut self, peripheral_id: &str) -> Result<(), SessionError> {
        self.request(Op::Retrieve(peripheral_id.to_string()))
    }

    fn connect(&mut self, peripheral: &PeripheralHandle) -> Result<(), SessionError> {
        self.request(Op::Connect(peripheral.clone()))
    }

    fn cancel_connection(&mut self, peripheral: &PeripheralHandle) -> Result<(), SessionError> {
        self.request(Op::CancelConnection(peripheral.clone()))
    }

    fn discover_service(
        &mut self,
        peripheral: &PeripheralHandle,
        service: Uuid,
    ) -> Result<(), SessionError> {
        self.request(Op::DiscoverService {
            peripheral: peripheral.clone(),
            service,
        })
    }

    fn discover_characteristic(
        &mut self,
        service: &ServiceHandle,
        characteristic: Uuid,
    ) -> Result<(), SessionError> {
        self.request(Op::DiscoverCharacteristic {
            service: service.clone(),
            characteristic,
        })
    }

    fn read_value(&mut self, characteristic: &CharacteristicHandle) -> Result<(), SessionError> {
        self.request(Op::Read(characteristic.clone()))
    }

    fn write_value(
        &mut self,
        characteristic: &CharacteristicHandle,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), SessionError> {
        self.request(Op::Write {
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
        self.request(Op::SetNotify {
            characteristic: characteristic.clone(),
            enabled,
        })
    }

    fn read_rssi(&mut self, peripheral: &PeripheralHandle) -> Result<(), SessionError> {
        self.request(Op::ReadRssi(peripheral.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn detached() -> (BtleplugSession, mpsc::UnboundedReceiver<Op>) {
        let (ops, rx) = mpsc::unbounded_channel();
        (BtleplugSession { ops }, rx)
    }

    #[test]
    fn test_calls_enqueue_driver_ops() {
        let (mut session, mut rx) = detached();
        let peripheral = PeripheralHandle::new("{\"address\":\"AA:BB:CC:DD:EE:FF\"}");

        assert_ok!(session.connect(&peripheral));
        assert_ok!(session.write_value(
            &CharacteristicHandle::new(peripheral.id.clone(), Uuid::nil(), Uuid::nil()),
            &[0x01, 0x02],
            true,
        ));

        assert!(matches!(rx.try_recv(), Ok(Op::Connect(handle)) if handle == peripheral));
        assert!(matches!(
            rx.try_recv(),
            Ok(Op::Write { data, with_response: true, .. }) if data == vec![0x01, 0x02]
        ));
    }

    #[test]
    fn test_calls_fail_once_driver_is_gone() {
        let (mut session, rx) = detached();
        drop(rx);

        assert_eq!(session.stop_scan(), Err(SessionError::AdapterUnavailable));
    }
}
