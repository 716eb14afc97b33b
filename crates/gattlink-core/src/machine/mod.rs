//! Connection state machine
//!
//! [`ConnectionMachine::handle_event`] is the only way the machine changes.
//! Each call:
//!
//! 1. takes the current state out of its slot (an empty slot means another
//!    dispatch is in flight and the event is rejected),
//! 2. looks the `(state, event)` pair up in the transition table, routing a
//!    miss through the error table,
//! 3. for a real transition runs exit actions of the old state, then the
//!    transition's actions, then entry actions of the new state,
//! 4. for a stay transition runs only the transition's actions,
//! 5. on any action failure stops and applies the error-table fallback.
//!
//! Every path puts a state back in the slot before returning. Actions never
//! feed events back in directly; they post to the mailbox, so follow-up
//! events are handled after the current one completes.

mod context;
mod event;
mod state;
pub(crate) mod table;

#[cfg(test)]
mod tests;

pub use context::{ActiveNotifications, SessionContext};
pub use event::{Event, EventKind, EventPayload};
pub use state::State;

use std::fmt;
use std::time::Duration;

use smallvec::SmallVec;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::command::Command;
use crate::config::MachineConfig;
use crate::dispatch::Mailbox;
use crate::error::{ActionError, MachineError, StoreError, TableError};
use crate::publisher::{LinkStatus, Phase, StatusEvent, StatusPublisher};
use crate::queue::CommandId;
use crate::session::{disconnect_status, CentralSession, CharacteristicHandle};
use crate::store::{AttachmentRecord, AttachmentStore};
use crate::timer::{EventTimer, TimerTicket};
use table::{Action, ErrorTable, Next};

// ----------------------------------------------------------------------------
// Outcomes and Directives
// ----------------------------------------------------------------------------

/// Result of a successfully handled event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Entered { from: State, to: State },
    Stayed(State),
}

/// Request from the machine to the command queue that owns it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// The command has finished or been abandoned
    RetireCommand(CommandId),
    /// Drop every queued command
    FlushCommands,
}

// ----------------------------------------------------------------------------
// Connection Machine
// ----------------------------------------------------------------------------

/// Finite-state machine for the single peripheral link
pub struct ConnectionMachine {
    current: Option<State>,
    context: SessionContext,
    notifications: ActiveNotifications,
    session: Box<dyn CentralSession>,
    store: AttachmentStore,
    publisher: StatusPublisher,
    /// Connect, retrieve and GATT operation deadlines
    timer: EventTimer,
    /// Bounds a whole scan, across any failed connect attempts within it
    scan_deadline: EventTimer,
    mailbox: Mailbox,
    errors: ErrorTable,
    config: MachineConfig,
    directives: SmallVec<[Directive; 2]>,
    #[cfg(test)]
    executed: Vec<Action>,
}

impl ConnectionMachine {
    pub(crate) fn new(
        config: MachineConfig,
        session: Box<dyn CentralSession>,
        store: AttachmentStore,
        publisher: StatusPublisher,
        mailbox: Mailbox,
    ) -> Result<Self, TableError> {
        Ok(Self {
            current: Some(State::INITIAL),
            context: SessionContext::default(),
            notifications: ActiveNotifications::default(),
            session,
            store,
            publisher,
            timer: EventTimer::new(),
            scan_deadline: EventTimer::new(),
            mailbox,
            errors: ErrorTable::standard()?,
            config,
            directives: SmallVec::new(),
            #[cfg(test)]
            executed: Vec::new(),
        })
    }

    pub fn state(&self) -> State {
        self.current.unwrap_or(State::INITIAL)
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn notifications(&self) -> &ActiveNotifications {
        &self.notifications
    }

    /// Accept a timer fire; false for a fire that lost a race with cancel
    pub fn claim_timer(&mut self, ticket: TimerTicket) -> bool {
        if self.scan_deadline.holds(ticket) {
            return self.scan_deadline.claim(ticket);
        }
        self.timer.claim(ticket)
    }

    /// Directives raised since the last call
    pub fn take_directives(&mut self) -> SmallVec<[Directive; 2]> {
        std::mem::take(&mut self.directives)
    }

    /// Forget the persisted peripheral and every active notification
    pub fn forget(&mut self) -> Result<(), StoreError> {
        self.notifications.clear();
        self.store.clear()
    }

    /// Give up on a command the queue watchdog has force-retired
    ///
    /// If the machine is still working on it, the work state's error-table
    /// fallback is applied so the machine returns to a state that accepts the
    /// next command.
    pub fn abandon_command(&mut self, id: CommandId) -> Option<State> {
        let staged = self.context.command.as_ref()?;
        if staged.id != id {
            return None;
        }
        let state = self.current?;
        warn!(command = %id, state = %state, "abandoning stalled command");
        let event = Event::operation_timeout();
        Some(self.fall_back(state, &event))
    }

    /// Feed one event to the machine
    pub fn handle_event(&mut self, event: Event) -> Result<Outcome, MachineError> {
        let kind = event.kind();
        let Some(saved) = self.current.take() else {
            error!(event = %kind, "event dispatched while another was being handled");
            return Err(MachineError::Reentrant { event: kind });
        };

        let Some(transition) = table::transition_for(saved, kind) else {
            let fallback = self.fall_back(saved, &event);
            self.assertion_failure(format!(
                "event {} is not valid in state {} (fell back to {})",
                kind, saved, fallback
            ));
            return Err(MachineError::InvalidEvent {
                state: saved,
                event: kind,
                fallback,
            });
        };

        let next = match transition.next {
            Next::Stay => {
                if let Err(source) = self.run_all(transition.actions, &event) {
                    return Err(self.action_failed(saved, &event, source));
                }
                trace!(state = %saved, event = %kind, "event handled in place");
                self.current = Some(saved);
                return Ok(Outcome::Stayed(saved));
            }
            Next::To(next) => next,
        };

        if let Err(source) = self.run_all(table::on_exit(saved), &event) {
            return Err(self.action_failed(saved, &event, source));
        }
        if let Err(source) = self.run_all(transition.actions, &event) {
            return Err(self.action_failed(saved, &event, source));
        }
        if let Err(source) = self.run_all(table::on_entry(next), &event) {
            return Err(self.action_failed(next, &event, source));
        }

        debug!(from = %saved, to = %next, event = %kind, "state transition");
        self.current = Some(next);
        Ok(Outcome::Entered {
            from: saved,
            to: next,
        })
    }

    // ------------------------------------------------------------------------
    // Failure handling
    // ------------------------------------------------------------------------

    /// Apply the error-table entry for `state` and fill the state slot
    fn fall_back(&mut self, state: State, event: &Event) -> State {
        let fallback = self.errors.fallback(state);
        for action in fallback.actions {
            if let Err(err) = self.run(*action, event) {
                warn!(state = %state, action = ?action, error = %err, "fallback action failed");
            }
        }
        self.current = Some(fallback.next);
        fallback.next
    }

    fn action_failed(&mut self, state: State, event: &Event, source: ActionError) -> MachineError {
        error!(state = %state, event = %event, error = %source, "action failed");
        let fallback = self.fall_back(state, event);
        if matches!(
            source,
            ActionError::MissingContext(_) | ActionError::UnexpectedPayload { .. }
        ) {
            self.assertion_failure(format!(
                "{} while handling {} in state {}",
                source, event, state
            ));
        }
        MachineError::ActionFailed {
            state,
            event: event.kind(),
            fallback,
            source,
        }
    }

    /// Loud in strict builds, a warning otherwise; the state slot is already filled
    fn assertion_failure(&self, message: String) {
        if self.config.strict_assertions {
            panic!("{}", message);
        }
        warn!("{}", message);
    }

    // ------------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------------

    fn run_all(&mut self, actions: &[Action], event: &Event) -> Result<(), ActionError> {
        for action in actions {
            self.run(*action, event)?;
        }
        Ok(())
    }

    fn run(&mut self, action: Action, event: &Event) -> Result<(), ActionError> {
        #[cfg(test)]
        self.executed.push(action);

        match action {
            Action::SetTarget => {
                self.context.service = Some(event.service_uuid()?);
            }
            Action::StartScan => self.start_scan()?,
            Action::RestartScan => {
                self.timer.cancel();
                let service = self.context.require_service()?;
                debug!(%service, "connect attempt failed, scanning again");
                self.session.scan(service)?;
            }
            Action::StopScan => self.session.stop_scan()?,
            Action::CancelScanDeadline => self.scan_deadline.cancel(),
            Action::AcceptDiscovery => {
                let discovered = event.peripheral()?;
                if let Some(captured) = &self.context.peripheral {
                    trace!(captured = %captured, discovered = %discovered, "duplicate discovery ignored");
                    return Ok(());
                }
                info!(peripheral = %discovered, "peripheral discovered");
                self.context.peripheral = Some(discovered.clone());
                self.session.stop_scan()?;
                self.connect()?;
            }
            Action::ConfirmScan => self.mailbox.post(Event::scan_success()),
            Action::ForgetPeripheral => {
                self.context.peripheral = None;
                self.context.connected = false;
            }
            Action::CapturePeripheral => {
                self.context.peripheral = Some(event.peripheral()?.clone());
            }
            Action::Connect => self.connect()?,
            Action::CancelTimer => self.timer.cancel(),
            Action::CancelConnection => {
                if let Some(peripheral) = &self.context.peripheral {
                    self.session.cancel_connection(peripheral)?;
                }
            }
            Action::MarkConnected => {
                let peripheral = event.peripheral()?;
                if !self.context.connected {
                    self.context.connected = true;
                    self.publisher.publish(StatusEvent::Link(LinkStatus::Connected {
                        peripheral: peripheral.id.clone(),
                    }));
                }
            }
            Action::MarkDisconnected => self.context.connected = false,
            Action::PublishDisconnect => {
                info!(reason = event.reason().unwrap_or("none"), "peripheral disconnected");
                self.publisher.publish(disconnect_status(
                    self.context.peripheral.as_ref(),
                    event.reason(),
                ));
            }
            Action::StageCommand => {
                let staged = event.staged_command()?;
                if let Command::SetNotify {
                    service,
                    characteristic,
                    enabled,
                } = staged.command
                {
                    self.notifications.apply(service, characteristic, enabled);
                }
                debug!(command = %staged.id, "command staged");
                self.context.command = Some(staged.clone());
            }
            Action::ExpectCommand => {
                self.context.require_command()?;
            }
            Action::Resubscribe => self.resubscribe()?,
            Action::DiscoverService => {
                let (service, _) = self.command_target()?;
                let peripheral = self.context.require_peripheral()?;
                self.session.discover_service(peripheral, service)?;
                self.arm(self.config.operation_timeout, Event::operation_timeout());
            }
            Action::DiscoverCharacteristic => {
                let gatt_service = event.gatt_service()?;
                let (_, characteristic) = self.command_target()?;
                self.session
                    .discover_characteristic(gatt_service, characteristic)?;
                self.context.gatt_service = Some(gatt_service.clone());
                self.arm(self.config.operation_timeout, Event::operation_timeout());
            }
            Action::PerformCommand => {
                let characteristic = event.characteristic()?;
                let staged = self.context.require_command()?;
                match &staged.command {
                    Command::Read { .. } => self.session.read_value(characteristic)?,
                    Command::Write {
                        data, requires_ack, ..
                    } => self
                        .session
                        .write_value(characteristic, data, *requires_ack)?,
                    Command::SetNotify { enabled, .. } => {
                        self.session.set_notify(characteristic, *enabled)?
                    }
                    Command::ReadRssi => return Err(ActionError::MissingContext("gatt command")),
                }
                self.context.characteristic = Some(characteristic.clone());
            }
            Action::ReadRssi => {
                let peripheral = self.context.require_peripheral()?;
                self.session.read_rssi(peripheral)?;
                self.arm(self.config.operation_timeout, Event::operation_timeout());
            }
            Action::PublishRssi => {
                self.publisher
                    .publish(StatusEvent::RssiChanged(event.rssi()?));
            }
            Action::BeginRetrieve => self.begin_retrieve()?,
            Action::SettleReady => self.settle_ready()?,
            Action::RetireCommand => self.retire_command(),
            Action::ResetContext => {
                self.timer.cancel();
                self.scan_deadline.cancel();
                self.context.reset();
            }
            Action::FlushCommands => self.directives.push(Directive::FlushCommands),
            Action::PublishPhase(phase) => self.publisher.publish(StatusEvent::Phase(phase)),
            Action::PublishAdapter(status) => {
                info!(status = ?status, "adapter power status");
                self.publisher.publish(StatusEvent::Adapter(status));
            }
            Action::IgnoreLate => trace!(event = %event, "late reply dropped"),
        }
        Ok(())
    }

    fn arm(&mut self, delay: Duration, event: Event) {
        let mailbox = self.mailbox.clone();
        self.timer
            .schedule(delay, move |ticket| mailbox.post_timeout(ticket, event));
    }

    fn start_scan(&mut self) -> Result<(), ActionError> {
        let service = self.context.require_service()?;
        self.session.scan(service)?;
        self.publisher.publish(StatusEvent::Phase(Phase::Scanning));
        let mailbox = self.mailbox.clone();
        self.scan_deadline.schedule(self.config.scan_timeout, move |ticket| {
            mailbox.post_timeout(ticket, Event::scan_timeout())
        });
        Ok(())
    }

    fn connect(&mut self) -> Result<(), ActionError> {
        let peripheral = self.context.require_peripheral()?;
        self.session.connect(peripheral)?;
        self.arm(self.config.connect_timeout, Event::connect_timeout());
        Ok(())
    }

    fn command_target(&self) -> Result<(Uuid, Uuid), ActionError> {
        self.context
            .require_command()?
            .command
            .target()
            .ok_or(ActionError::MissingContext("characteristic target"))
    }

    fn resubscribe(&mut self) -> Result<(), ActionError> {
        if self.context.connected || self.notifications.is_empty() {
            return Ok(());
        }
        let peripheral = self.context.require_peripheral()?.id.clone();
        let own = self
            .context
            .command
            .as_ref()
            .and_then(|staged| staged.command.target());

        for (service, characteristic) in self.notifications.iter() {
            if own == Some((service, characteristic)) {
                continue;
            }
            debug!(%service, %characteristic, "re-enabling notification after reconnect");
            let handle = CharacteristicHandle::new(peripheral.clone(), service, characteristic);
            self.session.set_notify(&handle, true)?;
        }
        Ok(())
    }

    fn begin_retrieve(&mut self) -> Result<(), ActionError> {
        self.publisher.publish(StatusEvent::Phase(Phase::Retrieving));
        let service = self.context.require_service()?;
        let record = self.store.load().unwrap_or_else(|err| {
            warn!(error = %err, "unreadable attachment record, scanning instead");
            None
        });

        match record {
            Some(record) if record.service == service => {
                debug!(peripheral = %record.peripheral_id, %service, "retrieving last attached peripheral");
                self.session.retrieve_peripheral(&record.peripheral_id)?;
                self.arm(self.config.connect_timeout, Event::connect_timeout());
            }
            _ => self
                .mailbox
                .post(Event::retrieve_fail("no peripheral attached under this service")),
        }
        Ok(())
    }

    fn settle_ready(&mut self) -> Result<(), ActionError> {
        if self.context.attached {
            self.retire_command();
            return Ok(());
        }

        self.context.attached = true;
        self.publisher.publish(StatusEvent::Phase(Phase::Ready));

        let record = AttachmentRecord {
            peripheral_id: self.context.require_peripheral()?.id.clone(),
            service: self.context.require_service()?,
        };
        let stored = self.store.load().ok().flatten();
        if stored.as_ref() != Some(&record) {
            self.store.save(&record)?;
        }
        info!(peripheral = %record.peripheral_id, service = %record.service, "peripheral attached");
        Ok(())
    }

    fn retire_command(&mut self) {
        if let Some(staged) = self.context.finish_command() {
            debug!(command = %staged.id, "command finished");
            self.directives.push(Directive::RetireCommand(staged.id));
        }
    }
}

impl fmt::Debug for ConnectionMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionMachine")
            .field("state", &self.current)
            .field("context", &self.context)
            .field("notifications", &self.notifications)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
