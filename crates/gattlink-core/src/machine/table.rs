//! Transition table, entry/exit actions and the error table
//!
//! A missing `(State, EventKind)` pair means the event is invalid in that
//! state. A transition with `Next::Stay` accepts the event without running
//! entry or exit actions; an empty action list is an accepted no-op.
//!
//! Replies to session requests are raced by timers and by power changes, so
//! a reply that arrives after its state has moved on is accepted and dropped.
//! Only requests, timeouts and power events can be invalid.

use std::collections::HashMap;

use crate::error::TableError;
use crate::machine::event::EventKind;
use crate::machine::state::State;
use crate::publisher::{Phase, PowerStatus};

// ----------------------------------------------------------------------------
// Actions
// ----------------------------------------------------------------------------

/// Side effect run by the machine on behalf of a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    /// Record the service UUID of an attach request
    SetTarget,
    /// Scan for the target service and arm the scan deadline
    StartScan,
    StopScan,
    /// Scan again after a failed connect; the scan deadline is left running
    RestartScan,
    CancelScanDeadline,
    /// Capture the first discovered peripheral and connect to it
    AcceptDiscovery,
    /// Post `ScanSuccess` once the discovered peripheral is connected
    ConfirmScan,
    ForgetPeripheral,
    CapturePeripheral,
    /// Connect to the captured peripheral and arm the connect timer
    Connect,
    CancelTimer,
    CancelConnection,
    MarkConnected,
    MarkDisconnected,
    PublishDisconnect,
    StageCommand,
    /// A connect completed on behalf of a command; the command must exist
    ExpectCommand,
    /// Re-enable active notifications after the link dropped
    Resubscribe,
    DiscoverService,
    DiscoverCharacteristic,
    PerformCommand,
    ReadRssi,
    PublishRssi,
    /// Load the attachment record and retrieve the peripheral it names
    BeginRetrieve,
    /// First-attachment bookkeeping, or retire the finished command
    SettleReady,
    RetireCommand,
    ResetContext,
    FlushCommands,
    PublishPhase(Phase),
    PublishAdapter(PowerStatus),
    /// Drop a reply whose request is no longer outstanding
    IgnoreLate,
}

use Action::*;

// ----------------------------------------------------------------------------
// Transitions
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Next {
    Stay,
    To(State),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub actions: &'static [Action],
    pub next: Next,
}

const fn stay(actions: &'static [Action]) -> Transition {
    Transition {
        actions,
        next: Next::Stay,
    }
}

const fn to(next: State, actions: &'static [Action]) -> Transition {
    Transition {
        actions,
        next: Next::To(next),
    }
}

const OPERATION_FAILED: &[Action] = &[PublishPhase(Phase::OperationFailed)];
const LINK_DROPPED: &[Action] = &[MarkDisconnected, PublishDisconnect];
const CONNECT_TIMED_OUT: &[Action] = &[
    CancelConnection,
    MarkDisconnected,
    PublishPhase(Phase::ConnectTimedOut),
];

/// Look up the transition for `event` in `state`
pub(crate) fn transition_for(state: State, event: EventKind) -> Option<Transition> {
    use EventKind as E;
    use State as S;

    let transition = match (state, event) {
        (S::OffLine, E::OffLine) => stay(&[]),
        (_, E::OffLine) => to(
            S::OffLine,
            &[ResetContext, FlushCommands, PublishAdapter(PowerStatus::OffLine)],
        ),

        (S::OnLine, E::OnLine) => stay(&[PublishAdapter(PowerStatus::OnLine)]),
        (S::OnLine, E::Scan) => to(S::Scanning, &[SetTarget]),
        (S::OnLine, E::Retrieve) => to(S::Retrieving, &[SetTarget]),
        (S::OnLine, E::Disconnected | E::DisconnectedWithError) => stay(&[]),

        (S::OffLine, E::OnLine) => to(S::OnLine, &[PublishAdapter(PowerStatus::OnLine)]),
        (S::OffLine, E::Disconnected | E::DisconnectedWithError) => stay(&[]),

        (S::Scanning, E::Discovered) => stay(&[AcceptDiscovery]),
        (S::Scanning, E::ConnectSuccess) => stay(&[
            CancelTimer,
            CancelScanDeadline,
            MarkConnected,
            ConfirmScan,
        ]),
        (S::Scanning, E::ScanSuccess) => to(S::Ready, &[PublishPhase(Phase::ScanSucceeded)]),
        (S::Scanning, E::ScanTimeout) => to(
            S::OnLine,
            &[
                CancelConnection,
                ForgetPeripheral,
                PublishPhase(Phase::ScanTimedOut),
            ],
        ),
        (S::Scanning, E::ScanFail) => to(
            S::OnLine,
            &[
                CancelConnection,
                ForgetPeripheral,
                PublishPhase(Phase::ScanFailed),
            ],
        ),
        (S::Scanning, E::ConnectFail | E::Disconnected | E::DisconnectedWithError) => {
            stay(&[ForgetPeripheral, RestartScan])
        }
        (S::Scanning, E::ConnectTimeout) => {
            stay(&[CancelConnection, ForgetPeripheral, RestartScan])
        }

        (S::Retrieving, E::Retrieved) => stay(&[CapturePeripheral, Connect]),
        (S::Retrieving, E::RetrieveFail) => to(S::Scanning, &[]),
        (S::Retrieving, E::ConnectSuccess) => to(
            S::Ready,
            &[MarkConnected, PublishPhase(Phase::RetrieveSucceeded)],
        ),
        (S::Retrieving, E::ConnectFail | E::Disconnected | E::DisconnectedWithError) => {
            to(S::Scanning, &[ForgetPeripheral])
        }
        (S::Retrieving, E::ConnectTimeout) => to(
            S::Scanning,
            &[
                CancelConnection,
                ForgetPeripheral,
                PublishPhase(Phase::ConnectTimedOut),
            ],
        ),

        (S::Ready, E::Read | E::Write | E::SetNotify) => to(S::ReadWriteNotify, &[StageCommand]),
        (S::Ready, E::ReadRssi) => to(S::ReadRssi, &[StageCommand]),
        (S::Ready, E::Disconnected | E::DisconnectedWithError) => stay(LINK_DROPPED),
        (S::Ready, E::ReadRssiSuccess) => stay(&[PublishRssi]),

        (S::ReadWriteNotify, E::ConnectSuccess) => stay(&[
            ExpectCommand,
            Resubscribe,
            MarkConnected,
            DiscoverService,
        ]),
        (S::ReadWriteNotify, E::DiscoverServicesSuccess) => stay(&[DiscoverCharacteristic]),
        (S::ReadWriteNotify, E::DiscoverCharacteristicsSuccess) => to(S::Ready, &[PerformCommand]),
        (
            S::ReadWriteNotify,
            E::ConnectFail | E::DiscoverServicesFail | E::DiscoverCharacteristicsFail,
        ) => to(S::Ready, OPERATION_FAILED),

        (S::ReadRssi, E::ConnectSuccess) => stay(&[ExpectCommand, MarkConnected, ReadRssi]),
        (S::ReadRssi, E::ReadRssiSuccess) => to(S::Ready, &[PublishRssi]),
        (S::ReadRssi, E::ConnectFail | E::ReadRssiFail) => to(S::Ready, OPERATION_FAILED),

        (S::ReadWriteNotify | S::ReadRssi, E::Disconnected | E::DisconnectedWithError) => {
            to(S::Ready, LINK_DROPPED)
        }
        (S::ReadWriteNotify | S::ReadRssi, E::ConnectTimeout) => to(S::Ready, CONNECT_TIMED_OUT),
        (S::ReadWriteNotify | S::ReadRssi, E::OperationTimeout) => {
            to(S::Ready, &[PublishPhase(Phase::OperationTimedOut)])
        }

        (_, kind) if kind.is_reply() => stay(&[IgnoreLate]),

        _ => return None,
    };
    Some(transition)
}

/// Actions run when the machine arrives in `state`
pub(crate) fn on_entry(state: State) -> &'static [Action] {
    match state {
        State::Scanning => &[StartScan],
        State::Retrieving => &[BeginRetrieve],
        State::Ready => &[SettleReady],
        State::ReadWriteNotify | State::ReadRssi => &[Connect],
        State::OnLine | State::OffLine => &[],
    }
}

/// Actions run before the machine leaves `state`
pub(crate) fn on_exit(state: State) -> &'static [Action] {
    match state {
        State::Scanning => &[CancelTimer, CancelScanDeadline, StopScan],
        State::Retrieving | State::ReadWriteNotify | State::ReadRssi => &[CancelTimer],
        State::OnLine | State::OffLine | State::Ready => &[],
    }
}

// ----------------------------------------------------------------------------
// Error Table
// ----------------------------------------------------------------------------

/// Safe landing for a state whose event was invalid or whose action failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fallback {
    pub actions: &'static [Action],
    pub next: State,
}

/// Per-state fallback, complete for every [`State`]
#[derive(Debug, Clone)]
pub(crate) struct ErrorTable {
    entries: HashMap<State, Fallback>,
}

impl ErrorTable {
    pub(crate) fn builder() -> ErrorTableBuilder {
        ErrorTableBuilder::default()
    }

    /// The fallbacks the connection machine runs with
    pub(crate) fn standard() -> Result<Self, TableError> {
        Self::builder()
            .register(State::OnLine, State::OnLine, &[])?
            .register(State::OffLine, State::OffLine, &[])?
            .register(
                State::Scanning,
                State::OnLine,
                &[
                    CancelTimer,
                    CancelScanDeadline,
                    StopScan,
                    CancelConnection,
                    ForgetPeripheral,
                ],
            )?
            .register(
                State::Retrieving,
                State::OnLine,
                &[CancelTimer, CancelConnection, ForgetPeripheral],
            )?
            .register(State::Ready, State::Ready, &[])?
            .register(
                State::ReadWriteNotify,
                State::Ready,
                &[CancelTimer, RetireCommand],
            )?
            .register(State::ReadRssi, State::Ready, &[CancelTimer, RetireCommand])?
            .build()
    }

    pub(crate) fn fallback(&self, state: State) -> Fallback {
        // `build` guarantees coverage; the baseline is only reachable through a bug here
        self.entries.get(&state).copied().unwrap_or(Fallback {
            actions: &[],
            next: State::INITIAL,
        })
    }
}

#[derive(Debug, Default)]
pub(crate) struct ErrorTableBuilder {
    entries: HashMap<State, Fallback>,
}

impl ErrorTableBuilder {
    /// Register the fallback for `state`; a second registration is rejected
    pub(crate) fn register(
        mut self,
        state: State,
        next: State,
        actions: &'static [Action],
    ) -> Result<Self, TableError> {
        if self.entries.contains_key(&state) {
            return Err(TableError::DuplicateFallback(state));
        }
        self.entries.insert(state, Fallback { actions, next });
        Ok(self)
    }

    pub(crate) fn build(self) -> Result<ErrorTable, TableError> {
        if let Some(missing) = State::ALL
            .iter()
            .find(|state| !self.entries.contains_key(*state))
        {
            return Err(TableError::MissingFallback(*missing));
        }
        Ok(ErrorTable {
            entries: self.entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_accepted_everywhere() {
        for state in State::ALL {
            let transition = transition_for(state, EventKind::OffLine).unwrap();
            if state == State::OffLine {
                assert_eq!(transition.next, Next::Stay);
            } else {
                assert_eq!(transition.next, Next::To(State::OffLine));
                assert!(transition.actions.contains(&FlushCommands));
            }
        }
    }

    #[test]
    fn test_stay_and_no_op_are_distinct_from_missing() {
        assert_eq!(
            transition_for(State::OnLine, EventKind::Disconnected),
            Some(stay(&[]))
        );
        assert_eq!(transition_for(State::OnLine, EventKind::Read), None);
        assert_eq!(transition_for(State::Ready, EventKind::ScanTimeout), None);
    }

    #[test]
    fn test_replies_are_accepted_in_every_state() {
        for state in State::ALL {
            for kind in EventKind::ALL.into_iter().filter(EventKind::is_reply) {
                let transition = transition_for(state, kind);
                assert!(transition.is_some(), "{} in {}", kind, state);
            }
        }
        assert_eq!(
            transition_for(State::Ready, EventKind::ConnectSuccess),
            Some(stay(&[IgnoreLate]))
        );
        assert_eq!(
            transition_for(State::OnLine, EventKind::DiscoverServicesFail),
            Some(stay(&[IgnoreLate]))
        );
        // A late RSSI reading is still worth publishing
        assert_eq!(
            transition_for(State::Ready, EventKind::ReadRssiSuccess),
            Some(stay(&[PublishRssi]))
        );
    }

    #[test]
    fn test_restart_scan_leaves_deadline_alone() {
        let transition = transition_for(State::Scanning, EventKind::ConnectFail).unwrap();
        assert!(transition.actions.contains(&RestartScan));
        assert!(!transition.actions.contains(&CancelScanDeadline));
        assert!(on_exit(State::Scanning).contains(&CancelScanDeadline));
    }

    #[test]
    fn test_commands_only_accepted_in_ready() {
        for state in State::ALL {
            let accepted = transition_for(state, EventKind::Write).is_some();
            assert_eq!(accepted, state == State::Ready, "state {}", state);
        }
    }

    #[test]
    fn test_standard_error_table_covers_every_state() {
        let table = ErrorTable::standard().unwrap();
        assert_eq!(table.fallback(State::Scanning).next, State::OnLine);
        assert_eq!(table.fallback(State::ReadRssi).next, State::Ready);
        assert!(table
            .fallback(State::ReadWriteNotify)
            .actions
            .contains(&RetireCommand));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let result = ErrorTable::builder()
            .register(State::Ready, State::Ready, &[])
            .and_then(|b| b.register(State::Ready, State::OnLine, &[]));
        assert_eq!(
            result.unwrap_err(),
            TableError::DuplicateFallback(State::Ready)
        );
    }

    #[test]
    fn test_incomplete_table_rejected() {
        let result = ErrorTable::builder()
            .register(State::OnLine, State::OnLine, &[])
            .and_then(ErrorTableBuilder::build);
        assert_eq!(
            result.unwrap_err(),
            TableError::MissingFallback(State::OffLine)
        );
    }
}
