//! Service configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::QueueConfig;
use crate::store::LAST_ATTACHED_PERIPHERAL_KEY;

// ----------------------------------------------------------------------------
// Machine Configuration
// ----------------------------------------------------------------------------

/// Timeouts and assertion policy for the connection state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Maximum time to scan before giving up
    pub scan_timeout: Duration,
    /// Maximum time for a connect or retrieve attempt
    pub connect_timeout: Duration,
    /// Maximum time for GATT discovery and RSSI reads after connecting
    pub operation_timeout: Duration,
    /// Panic on invalid events and missing context instead of logging
    pub strict_assertions: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(5),
            strict_assertions: cfg!(debug_assertions),
        }
    }
}

impl MachineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_strict_assertions(mut self, strict: bool) -> Self {
        self.strict_assertions = strict;
        self
    }
}

// ----------------------------------------------------------------------------
// Service Configuration
// ----------------------------------------------------------------------------

/// Configuration for [`crate::service::BleService`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub machine: MachineConfig,
    pub queue: QueueConfig,
    /// Buffered status events per listener before the slowest one lags
    pub status_capacity: usize,
    /// Re-issue the last attach request when the adapter comes back online
    pub auto_reattach: bool,
    /// Settings key for the last attached peripheral
    pub settings_key: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            machine: MachineConfig::default(),
            queue: QueueConfig::default(),
            status_capacity: 64,
            auto_reattach: true,
            settings_key: LAST_ATTACHED_PERIPHERAL_KEY.to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_machine(mut self, machine: MachineConfig) -> Self {
        self.machine = machine;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_status_capacity(mut self, capacity: usize) -> Self {
        self.status_capacity = capacity;
        self
    }

    pub fn with_auto_reattach(mut self, enabled: bool) -> Self {
        self.auto_reattach = enabled;
        self
    }

    pub fn with_settings_key(mut self, key: impl Into<String>) -> Self {
        self.settings_key = key.into();
        self
    }
}
