//! Gattlink application: the BLE service wired to a real adapter

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use gattlink_ble::BtleplugSession;
use gattlink_core::store::{AttachmentRecord, AttachmentStore};
use gattlink_core::{BleService, CentralSession, FileStore, LinkSnapshot, State, StatusEvent};

use crate::config::AppConfig;
use crate::error::{CliError, Result};

/// Running service plus the configuration it was built from
pub struct GattlinkApp {
    service: BleService,
    status: broadcast::Receiver<StatusEvent>,
    config: AppConfig,
}

impl GattlinkApp {
    /// Spawn the service over the host adapter; needs a tokio runtime
    pub fn start(config: AppConfig) -> Result<Self> {
        let settings = config.settings_path()?;
        debug!("Settings file: {}", settings.display());

        let ble = config.ble.clone();
        let service = BleService::spawn(
            config.service.clone(),
            Box::new(FileStore::new(settings)),
            move |events| Box::new(BtleplugSession::start(ble, events)) as Box<dyn CentralSession>,
        )?;
        let status = service.subscribe();

        Ok(Self {
            service,
            status,
            config,
        })
    }

    pub fn service(&self) -> &BleService {
        &self.service
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn wait_limit(&self) -> Duration {
        Duration::from_secs(self.config.cli.wait_timeout_secs)
    }

    /// Attach to a peripheral advertising `service` and wait for the link
    pub async fn attach(&mut self, service: Uuid, force_scan: bool) -> Result<LinkSnapshot> {
        info!("Attaching to a peripheral advertising {}", service);
        self.service.attach_peripheral(service, force_scan)?;

        let deadline = Instant::now() + self.wait_limit();
        loop {
            let snapshot = self.service.snapshot().await?;
            if snapshot.state == State::Ready && snapshot.attached {
                return Ok(snapshot);
            }
            // Any status event may mean the link moved; re-check on each one
            self.next_status(deadline, "the link to become ready").await?;
        }
    }

    /// Wait for the first status event matching `accept`, logging the rest
    pub async fn wait_for<F>(&mut self, what: &'static str, mut accept: F) -> Result<StatusEvent>
    where
        F: FnMut(&StatusEvent) -> bool,
    {
        let deadline = Instant::now() + self.wait_limit();
        loop {
            let event = self.next_status(deadline, what).await?;
            if accept(&event) {
                return Ok(event);
            }
        }
    }

    /// Next status event, or `None` once `until` passes
    pub async fn status_until(&mut self, until: Instant) -> Option<StatusEvent> {
        loop {
            match time::timeout_at(until, self.status.recv()).await {
                Ok(Ok(event)) => {
                    debug!("Status: {:?}", event);
                    return Some(event);
                }
                Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                    warn!("Missed {} status events", missed);
                }
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
            }
        }
    }

    async fn next_status(&mut self, deadline: Instant, what: &'static str) -> Result<StatusEvent> {
        self.status_until(deadline)
            .await
            .ok_or(CliError::Timeout {
                what,
                secs: self.config.cli.wait_timeout_secs,
            })
    }

    /// Wait until every queued command has run
    pub async fn drain(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.wait_limit();
        while self.service.snapshot().await?.queued_commands > 0 {
            if Instant::now() >= deadline {
                return Err(CliError::Timeout {
                    what: "queued commands to finish",
                    secs: self.config.cli.wait_timeout_secs,
                });
            }
            time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    /// Peripheral remembered from an earlier attachment
    pub fn remembered(&self) -> Result<Option<AttachmentRecord>> {
        let store = AttachmentStore::with_key(
            Box::new(FileStore::new(self.config.settings_path()?)),
            self.config.service.settings_key.clone(),
        );
        Ok(store.load()?)
    }

    pub async fn stop(self) -> Result<()> {
        self.service.shutdown().await?;
        info!("BLE service stopped");
        Ok(())
    }
}
