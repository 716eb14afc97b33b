//! Background task that owns the btleplug adapter
//!
//! Session calls arrive as [`Op`]s. Quick adapter calls (scan control,
//! lookups) run inline; anything that waits on the peripheral runs in its own
//! spawned task and reports a single adapter event when it finishes.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::{self, Stream, StreamExt};
use gattlink_core::{
    AdapterEvent, AdapterEventSender, CharacteristicHandle, PeripheralHandle, ServiceHandle,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::BleSessionConfig;
use crate::error::{BleSessionError, Result};
use crate::peripheral::{self as gatt, advertises, encode_id, power_event};

type CentralEvents = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

/// Work requested through the session
#[derive(Debug)]
pub(crate) enum Op {
    Scan(Uuid),
    StopScan,
    Retrieve(String),
    Connect(PeripheralHandle),
    CancelConnection(PeripheralHandle),
    DiscoverService {
        peripheral: PeripheralHandle,
        service: Uuid,
    },
    DiscoverCharacteristic {
        service: ServiceHandle,
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
    ReadRssi(PeripheralHandle),
}

struct Known {
    handle: PeripheralHandle,
    peripheral: Peripheral,
}

struct ActiveScan {
    service: Uuid,
    reported: HashSet<PeripheralId>,
}

// ----------------------------------------------------------------------------
// Driver
// ----------------------------------------------------------------------------

pub(crate) struct Driver {
    config: BleSessionConfig,
    events: AdapterEventSender,
    ops: mpsc::UnboundedReceiver<Op>,
    adapter: Option<Adapter>,
    known: HashMap<String, Known>,
    scan: Option<ActiveScan>,
    tracked: Option<PeripheralId>,
    connecting: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

impl Driver {
    pub(crate) fn new(
        config: BleSessionConfig,
        events: AdapterEventSender,
        ops: mpsc::UnboundedReceiver<Op>,
    ) -> Self {
        Self {
            config,
            events,
            ops,
            adapter: None,
            known: HashMap::new(),
            scan: None,
            tracked: None,
            connecting: None,
            pump: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut central: CentralEvents = match self.initialize().await {
            Ok(central) => central,
            Err(err) => {
                error!(error = %err, "BLE adapter initialization failed");
                self.events.send(AdapterEvent::PoweredOff);
                Box::pin(stream::pending())
            }
        };

        loop {
            tokio::select! {
                op = self.ops.recv() => match op {
                    Some(op) => self.handle_op(op).await,
                    None => break,
                },
                Some(event) = central.next() => self.handle_central(event).await,
            }
        }

        self.drop_link();
        debug!("BLE driver stopped");
    }

    async fn initialize(&mut self) -> Result<CentralEvents> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let available = adapters.len();
        let index = self.config.adapter_index;
        let adapter = adapters
            .into_iter()
            .nth(index)
            .ok_or(BleSessionError::NoSuchAdapter { index, available })?;

        let central = adapter.events().await?;
        let power = match adapter.adapter_state().await {
            Ok(state) => power_event(state),
            Err(err) => {
                debug!(error = %err, "adapter state unavailable, assuming powered on");
                None
            }
        };
        let info = adapter
            .adapter_info()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        info!(adapter = %info, "BLE adapter initialized");

        self.adapter = Some(adapter);
        self.events.send(power.unwrap_or(AdapterEvent::PoweredOn));
        Ok(central)
    }

    fn adapter(&self) -> Result<Adapter> {
        self.adapter
            .clone()
            .ok_or(BleSessionError::AdapterNotAvailable)
    }

    fn known(&self, handle: &PeripheralHandle) -> Result<Peripheral> {
        self.known
            .get(&handle.id)
            .map(|known| known.peripheral.clone())
            .ok_or_else(|| BleSessionError::PeripheralNotFound {
                peripheral_id: handle.id.clone(),
            })
    }

    fn remember(&mut self, peripheral: &Peripheral, name: Option<String>) -> Result<PeripheralHandle> {
        let handle = PeripheralHandle {
            id: encode_id(&peripheral.id())?,
            name,
        };
        self.known.insert(
            handle.id.clone(),
            Known {
                handle: handle.clone(),
                peripheral: peripheral.clone(),
            },
        );
        Ok(handle)
    }

    /// Run `report` on its own task and post the event it produces, if any
    fn spawn_report<F>(&self, report: F)
    where
        F: Future<Output = Option<AdapterEvent>> + Send + 'static,
    {
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Some(event) = report.await {
                events.send(event);
            }
        });
    }

    fn drop_link(&mut self) {
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        if let Some(task) = self.pump.take() {
            task.abort();
        }
    }

    // ------------------------------------------------------------------------
    // Session Operations
    // ------------------------------------------------------------------------

    async fn handle_op(&mut self, op: Op) {
        trace!(op = ?op, "session op");
        match op {
            Op::Scan(service) => self.start_scan(service).await,
            Op::StopScan => self.stop_scan().await,
            Op::Retrieve(id) => {
                let event = match self.retrieve(&id).await {
                    Ok(handle) => AdapterEvent::PeripheralRetrieved(handle),
                    Err(err) => AdapterEvent::RetrieveFailed {
                        reason: err.to_string(),
                    },
                };
                self.events.send(event);
            }
            Op::Connect(handle) => self.connect(handle),
            Op::CancelConnection(handle) => self.cancel_connection(&handle),
            Op::DiscoverService {
                peripheral,
                service,
            } => match self.known(&peripheral) {
                Ok(target) => self.spawn_report(async move {
                    Some(
                        match gatt::discover_service(&target, peripheral.id, service).await {
                            Ok(service) => AdapterEvent::ServiceDiscovered(service),
                            Err(err) => AdapterEvent::ServiceDiscoveryFailed {
                                reason: err.to_string(),
                            },
                        },
                    )
                }),
                Err(err) => self.events.send(AdapterEvent::ServiceDiscoveryFailed {
                    reason: err.to_string(),
                }),
            },
            Op::DiscoverCharacteristic {
                service,
                characteristic,
            } => match self.known(&PeripheralHandle::new(service.peripheral.clone())) {
                Ok(target) => self.spawn_report(async move {
                    Some(
                        match gatt::discover_characteristic(&target, &service, characteristic)
                            .await
                        {
                            Ok(characteristic) => {
                                AdapterEvent::CharacteristicDiscovered(characteristic)
                            }
                            Err(err) => AdapterEvent::CharacteristicDiscoveryFailed {
                                reason: err.to_string(),
                            },
                        },
                    )
                }),
                Err(err) => self.events.send(AdapterEvent::CharacteristicDiscoveryFailed {
                    reason: err.to_string(),
                }),
            },
            Op::Read(characteristic) => self.read(characteristic),
            Op::Write {
                characteristic,
                data,
                with_response,
            } => self.write(characteristic, data, with_response),
            Op::SetNotify {
                characteristic,
                enabled,
            } => self.set_notify(characteristic, enabled),
            Op::ReadRssi(handle) => match self.known(&handle) {
                Ok(target) => self.spawn_report(async move {
                    Some(match gatt::read_rssi(&target).await {
                        Ok(rssi) => AdapterEvent::RssiRead(rssi),
                        Err(err) => AdapterEvent::RssiFailed {
                            reason: err.to_string(),
                        },
                    })
                }),
                Err(err) => self.events.send(AdapterEvent::RssiFailed {
                    reason: err.to_string(),
                }),
            },
        }
    }

    async fn start_scan(&mut self, service: Uuid) {
        let result = match self.adapter() {
            Ok(adapter) => adapter
                .start_scan(ScanFilter {
                    services: vec![service],
                })
                .await
                .map_err(BleSessionError::from),
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                info!(service = %service, "started BLE scan");
                self.scan = Some(ActiveScan {
                    service,
                    reported: HashSet::new(),
                });
            }
            Err(err) => {
                warn!(error = %err, service = %service, "failed to start BLE scan");
                self.events.send(AdapterEvent::ScanFailed {
                    reason: err.to_string(),
                });
            }
        }
    }

    async fn stop_scan(&mut self) {
        if self.scan.take().is_none() {
            return;
        }
        if let Ok(adapter) = self.adapter() {
            if let Err(err) = adapter.stop_scan().await {
                warn!(error = %err, "failed to stop BLE scan");
            } else {
                debug!("stopped BLE scan");
            }
        }
    }

    async fn retrieve(&mut self, id: &str) -> Result<PeripheralHandle> {
        let adapter = self.adapter()?;
        let peripheral_id = gatt::decode_id(id)?;
        let peripheral = adapter.peripheral(&peripheral_id).await.map_err(|_| {
            BleSessionError::PeripheralNotFound {
                peripheral_id: id.to_string(),
            }
        })?;
        let name = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|properties| properties.local_name);
        let handle = self.remember(&peripheral, name)?;
        debug!(peripheral = %handle, "retrieved peripheral");
        Ok(handle)
    }

    fn connect(&mut self, handle: PeripheralHandle) {
        let peripheral = match self.known(&handle) {
            Ok(peripheral) => peripheral,
            Err(err) => {
                self.events.send(AdapterEvent::ConnectFailed {
                    reason: err.to_string(),
                });
                return;
            }
        };

        let id = peripheral.id();
        if self.tracked.as_ref() != Some(&id) {
            self.drop_link();
            self.tracked = Some(id);
        }
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        self.ensure_pump(&handle, &peripheral);

        let events = self.events.clone();
        self.connecting = Some(tokio::spawn(async move {
            let result = match peripheral.is_connected().await {
                Ok(true) => Ok(()),
                _ => peripheral.connect().await,
            };
            match result {
                Ok(()) => {
                    debug!(peripheral = %handle, "connected");
                    events.send(AdapterEvent::Connected(handle));
                }
                Err(err) => {
                    debug!(peripheral = %handle, error = %err, "connect failed");
                    events.send(AdapterEvent::ConnectFailed {
                        reason: err.to_string(),
                    });
                }
            }
        }));
    }

    /// Forward notifications for the tracked peripheral until the link drops
    fn ensure_pump(&mut self, handle: &PeripheralHandle, peripheral: &Peripheral) {
        if self.pump.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let events = self.events.clone();
        let peripheral = peripheral.clone();
        let id = handle.id.clone();
        self.pump = Some(tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(notifications) => notifications,
                Err(err) => {
                    warn!(peripheral = %id, error = %err, "notification stream unavailable");
                    return;
                }
            };
            while let Some(notification) = notifications.next().await {
                let Some(service) =
                    gatt::service_of(&peripheral.characteristics(), notification.uuid)
                else {
                    debug!(
                        peripheral = %id,
                        characteristic = %notification.uuid,
                        "notification from undiscovered characteristic dropped"
                    );
                    continue;
                };
                events.send(AdapterEvent::ValueUpdated {
                    characteristic: CharacteristicHandle::new(
                        id.clone(),
                        service,
                        notification.uuid,
                    ),
                    value: notification.value,
                });
            }
            debug!(peripheral = %id, "notification stream ended");
        }));
    }

    fn cancel_connection(&mut self, handle: &PeripheralHandle) {
        self.drop_link();
        match self.known(handle) {
            Ok(peripheral) => {
                let id = handle.id.clone();
                tokio::spawn(async move {
                    if let Err(err) = peripheral.disconnect().await {
                        debug!(peripheral = %id, error = %err, "disconnect failed");
                    }
                });
            }
            Err(err) => debug!(error = %err, "nothing to cancel"),
        }
    }

    fn read(&self, characteristic: CharacteristicHandle) {
        let peripheral = match self.known(&PeripheralHandle::new(characteristic.peripheral.clone())) {
            Ok(peripheral) => peripheral,
            Err(err) => {
                warn!(characteristic = %characteristic.uuid, error = %err, "read failed");
                return;
            }
        };
        self.spawn_report(async move {
            let result = async {
                let target = gatt::resolve_characteristic(
                    &peripheral,
                    characteristic.service,
                    characteristic.uuid,
                )
                .await?;
                Ok::<_, BleSessionError>(peripheral.read(&target).await?)
            }
            .await;
            match result {
                Ok(value) => Some(AdapterEvent::ValueUpdated {
                    characteristic,
                    value,
                }),
                Err(err) => {
                    warn!(characteristic = %characteristic.uuid, error = %err, "read failed");
                    None
                }
            }
        });
    }

    fn write(&self, characteristic: CharacteristicHandle, data: Vec<u8>, with_response: bool) {
        let peripheral = match self.known(&PeripheralHandle::new(characteristic.peripheral.clone())) {
            Ok(peripheral) => peripheral,
            Err(err) => {
                warn!(characteristic = %characteristic.uuid, error = %err, "write failed");
                return;
            }
        };
        self.spawn_report(async move {
            let result = async {
                let target = gatt::resolve_characteristic(
                    &peripheral,
                    characteristic.service,
                    characteristic.uuid,
                )
                .await?;
                peripheral
                    .write(&target, &data, gatt::write_type(with_response))
                    .await?;
                Ok::<_, BleSessionError>(())
            }
            .await;

            // Only acknowledged writes report back
            if with_response {
                return Some(AdapterEvent::WriteConfirmed {
                    characteristic,
                    error: result.err().map(|err| err.to_string()),
                });
            }
            if let Err(err) = result {
                warn!(characteristic = %characteristic.uuid, error = %err, "write failed");
            }
            None
        });
    }

    fn set_notify(&self, characteristic: CharacteristicHandle, enabled: bool) {
        let peripheral = match self.known(&PeripheralHandle::new(characteristic.peripheral.clone())) {
            Ok(peripheral) => peripheral,
            Err(err) => {
                warn!(characteristic = %characteristic.uuid, error = %err, "notify change failed");
                return;
            }
        };
        self.spawn_report(async move {
            let result = async {
                let target = gatt::resolve_characteristic(
                    &peripheral,
                    characteristic.service,
                    characteristic.uuid,
                )
                .await?;
                if enabled {
                    peripheral.subscribe(&target).await?;
                } else {
                    peripheral.unsubscribe(&target).await?;
                }
                Ok::<_, BleSessionError>(())
            }
            .await;
            match result {
                Ok(()) => Some(AdapterEvent::NotifyStateUpdated {
                    characteristic,
                    enabled,
                }),
                Err(err) => {
                    warn!(characteristic = %characteristic.uuid, error = %err, "notify change failed");
                    None
                }
            }
        });
    }

    // ------------------------------------------------------------------------
    // Central Events
    // ------------------------------------------------------------------------

    async fn handle_central(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::StateUpdate(state) => {
                if let Some(power) = power_event(state) {
                    info!(event = ?power, "adapter power changed");
                    if power == AdapterEvent::PoweredOff {
                        self.scan = None;
                        self.drop_link();
                    }
                    self.events.send(power);
                }
            }
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ServicesAdvertisement { id, .. } => self.consider(id).await,
            CentralEvent::DeviceDisconnected(id) => self.on_disconnected(&id),
            _ => {}
        }
    }

    /// Report a peripheral seen during a scan, once per scan
    async fn consider(&mut self, id: PeripheralId) {
        let service = match &self.scan {
            Some(scan) if !scan.reported.contains(&id) => scan.service,
            _ => return,
        };
        let Ok(adapter) = self.adapter() else {
            return;
        };
        let peripheral = match adapter.peripheral(&id).await {
            Ok(peripheral) => peripheral,
            Err(err) => {
                trace!(error = %err, "discovered peripheral vanished");
                return;
            }
        };
        let properties = match peripheral.properties().await {
            Ok(Some(properties)) => properties,
            _ => return,
        };
        if !advertises(&properties, service) {
            return;
        }

        match self.remember(&peripheral, properties.local_name) {
            Ok(handle) => {
                if let Some(scan) = self.scan.as_mut() {
                    scan.reported.insert(id);
                }
                info!(peripheral = %handle, rssi = ?properties.rssi, "discovered peripheral");
                self.events.send(AdapterEvent::PeripheralDiscovered(handle));
            }
            Err(err) => warn!(error = %err, "ignoring discovered peripheral"),
        }
    }

    fn on_disconnected(&mut self, id: &PeripheralId) {
        if self.tracked.as_ref() != Some(id) {
            return;
        }
        if let Some(task) = self.pump.take() {
            task.abort();
        }

        let handle = encode_id(id)
            .ok()
            .and_then(|key| self.known.get(&key).map(|known| known.handle.clone()));
        match handle {
            Some(peripheral) => {
                info!(peripheral = %peripheral, "peripheral disconnected");
                self.events.send(AdapterEvent::Disconnected {
                    peripheral,
                    error: None,
                });
            }
            None => debug!(peripheral = ?id, "untracked peripheral disconnected"),
        }
    }
}
