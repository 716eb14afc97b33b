//! BLE session configuration

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the btleplug session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleSessionConfig {
    /// Which of the host's adapters to drive
    pub adapter_index: usize,
}

impl Default for BleSessionConfig {
    fn default() -> Self {
        Self { adapter_index: 0 }
    }
}

impl BleSessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the adapter by its position in the manager's adapter list
    pub fn with_adapter_index(mut self, index: usize) -> Self {
        self.adapter_index = index;
        self
    }
}
