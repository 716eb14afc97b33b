//! Active session context owned by the connection machine

use std::collections::{BTreeSet, HashMap};

use uuid::Uuid;

use crate::command::StagedCommand;
use crate::error::ActionError;
use crate::session::{CharacteristicHandle, PeripheralHandle, ServiceHandle};

/// What the machine is currently acquiring or using
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionContext {
    /// Peripheral being acquired or attached
    pub peripheral: Option<PeripheralHandle>,
    /// Service UUID the client attached under
    pub service: Option<Uuid>,
    /// Command currently being carried out
    pub command: Option<StagedCommand>,
    /// GATT service resolved for the current command
    pub gatt_service: Option<ServiceHandle>,
    /// Characteristic resolved for the current command
    pub characteristic: Option<CharacteristicHandle>,
    /// Set once the peripheral has completed first-time attachment
    pub attached: bool,
    /// Whether the link is believed to be up
    pub connected: bool,
}

impl SessionContext {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn require_peripheral(&self) -> Result<&PeripheralHandle, ActionError> {
        self.peripheral
            .as_ref()
            .ok_or(ActionError::MissingContext("peripheral"))
    }

    pub(crate) fn require_service(&self) -> Result<Uuid, ActionError> {
        self.service.ok_or(ActionError::MissingContext("service"))
    }

    pub(crate) fn require_command(&self) -> Result<&StagedCommand, ActionError> {
        self.command
            .as_ref()
            .ok_or(ActionError::MissingContext("command"))
    }

    /// Drop the per-command GATT resolution, returning the finished command
    pub(crate) fn finish_command(&mut self) -> Option<StagedCommand> {
        self.gatt_service = None;
        self.characteristic = None;
        self.command.take()
    }
}

/// Characteristics the client wants kept subscribed, by service
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActiveNotifications {
    by_service: HashMap<Uuid, BTreeSet<Uuid>>,
}

impl ActiveNotifications {
    pub fn apply(&mut self, service: Uuid, characteristic: Uuid, enabled: bool) {
        if enabled {
            self.by_service
                .entry(service)
                .or_default()
                .insert(characteristic);
        } else if let Some(characteristics) = self.by_service.get_mut(&service) {
            characteristics.remove(&characteristic);
            if characteristics.is_empty() {
                self.by_service.remove(&service);
            }
        }
    }

    pub fn contains(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.by_service
            .get(&service)
            .is_some_and(|set| set.contains(&characteristic))
    }

    /// Every `(service, characteristic)` pair
    pub fn iter(&self) -> impl Iterator<Item = (Uuid, Uuid)> + '_ {
        self.by_service
            .iter()
            .flat_map(|(service, set)| set.iter().map(move |c| (*service, *c)))
    }

    pub fn len(&self) -> usize {
        self.by_service.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_service.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_service.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_set_tracks_enable_and_disable() {
        let service = Uuid::from_u128(0x10);
        let (a, b) = (Uuid::from_u128(0x11), Uuid::from_u128(0x12));
        let mut active = ActiveNotifications::default();

        active.apply(service, a, true);
        active.apply(service, b, true);
        active.apply(service, a, true);
        assert_eq!(active.len(), 2);

        active.apply(service, a, false);
        assert!(!active.contains(service, a));
        assert!(active.contains(service, b));

        active.apply(service, b, false);
        assert!(active.is_empty());
    }

    #[test]
    fn test_missing_context_names_the_piece() {
        let context = SessionContext::default();
        assert!(matches!(
            context.require_peripheral(),
            Err(ActionError::MissingContext("peripheral"))
        ));
        assert!(matches!(
            context.require_command(),
            Err(ActionError::MissingContext("command"))
        ));
    }
}
