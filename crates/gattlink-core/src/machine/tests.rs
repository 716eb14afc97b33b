use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Instant};

use super::*;
use crate::command::StagedCommand;
use crate::dispatch::Input;
use crate::queue::{CommandQueue, QueueConfig};
use crate::store::MemoryStore;
use crate::testing::{
    characteristic_handle, characteristic_uuid, peripheral, service_handle, service_uuid,
    RecordingSession, SessionCall, SessionProbe,
};

struct Harness {
    machine: ConnectionMachine,
    probe: SessionProbe,
    inbox: mpsc::UnboundedReceiver<Input>,
    status: broadcast::Receiver<StatusEvent>,
    ids: CommandQueue<Command>,
}

fn lenient() -> MachineConfig {
    MachineConfig::default().with_strict_assertions(false)
}

/// Default configuration as a debug build runs it
fn strict() -> MachineConfig {
    MachineConfig::default().with_strict_assertions(true)
}

fn harness() -> Harness {
    harness_with(strict())
}

fn harness_with(config: MachineConfig) -> Harness {
    let (session, probe) = RecordingSession::new();
    build(config, session, probe, MemoryStore::new())
}

fn build(
    config: MachineConfig,
    session: RecordingSession,
    probe: SessionProbe,
    store: MemoryStore,
) -> Harness {
    let (mailbox, inbox) = Mailbox::channel();
    let publisher = StatusPublisher::new(64);
    let status = publisher.subscribe();
    let machine = ConnectionMachine::new(
        config,
        Box::new(session),
        AttachmentStore::new(Box::new(store)),
        publisher,
        mailbox,
    )
    .unwrap();
    Harness {
        machine,
        probe,
        inbox,
        status,
        ids: CommandQueue::new(&QueueConfig::default()),
    }
}

fn read_command() -> Command {
    Command::Read {
        service: service_uuid(),
        characteristic: characteristic_uuid(),
    }
}

impl Harness {
    fn feed(&mut self, event: Event) -> Result<Outcome, MachineError> {
        self.machine.handle_event(event)
    }

    fn stage(&mut self, command: Command) -> StagedCommand {
        let (id, _) = self.ids.submit(command.clone());
        StagedCommand { id, command }
    }

    /// Events posted by actions, in order
    fn posted(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(input) = self.inbox.try_recv() {
            if let Input::Event(event) = input {
                events.push(event);
            }
        }
        events
    }

    fn statuses(&mut self) -> Vec<StatusEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.status.try_recv() {
            events.push(event);
        }
        events
    }

    fn executed(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.machine.executed)
    }

    /// Let fired timers post, then feed every fire that is still claimed
    async fn settle_timers(&mut self) {
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        while let Ok(input) = self.inbox.try_recv() {
            if let Input::Timeout { ticket, event } = input {
                if self.machine.claim_timer(ticket) {
                    self.feed(event).unwrap();
                }
            }
        }
    }

    fn force(&mut self, state: State) {
        self.machine.current = Some(state);
    }

    /// Scan, discover, connect and settle in `Ready`
    fn attach_by_scan(&mut self) {
        self.feed(Event::scan(service_uuid())).unwrap();
        self.feed(Event::discovered(peripheral())).unwrap();
        self.feed(Event::connect_success(peripheral())).unwrap();
        for event in self.posted() {
            self.feed(event).unwrap();
        }
        assert_eq!(self.machine.state(), State::Ready);
        self.probe.drain();
        self.statuses();
        self.executed();
    }

    /// Ready with an attached peripheral, without going through a scan
    fn ready(&mut self) {
        self.machine.context.peripheral = Some(peripheral());
        self.machine.context.service = Some(service_uuid());
        self.machine.context.attached = true;
        self.machine.context.connected = true;
        self.force(State::Ready);
    }
}

// ----------------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_scan_starts_scanning_and_arms_timer() {
    let mut h = harness();

    let outcome = h.feed(Event::scan(service_uuid())).unwrap();

    assert_eq!(
        outcome,
        Outcome::Entered {
            from: State::OnLine,
            to: State::Scanning
        }
    );
    assert_eq!(h.probe.drain(), vec![SessionCall::Scan(service_uuid())]);
    assert!(h.machine.scan_deadline.is_armed());
    assert!(!h.machine.timer.is_armed());
    assert_eq!(h.statuses(), vec![StatusEvent::Phase(Phase::Scanning)]);
}

#[tokio::test(start_paused = true)]
async fn test_scan_timeout_stops_scan_and_returns_online() {
    let mut h = harness();
    h.feed(Event::scan(service_uuid())).unwrap();
    h.probe.drain();
    h.statuses();

    let Some(Input::Timeout { ticket, event }) = h.inbox.recv().await else {
        panic!("scan deadline should fire");
    };
    assert_eq!(event.kind(), EventKind::ScanTimeout);
    assert!(h.machine.claim_timer(ticket));

    let outcome = h.feed(event).unwrap();
    assert_eq!(
        outcome,
        Outcome::Entered {
            from: State::Scanning,
            to: State::OnLine
        }
    );
    assert_eq!(h.probe.drain(), vec![SessionCall::StopScan]);
    assert_eq!(h.statuses(), vec![StatusEvent::Phase(Phase::ScanTimedOut)]);
}

#[tokio::test(start_paused = true)]
async fn test_read_runs_gatt_sequence_and_retires_command() {
    let mut h = harness();
    h.attach_by_scan();
    let read = h.stage(read_command());

    let outcome = h.feed(Event::command(read.clone())).unwrap();
    assert_eq!(
        outcome,
        Outcome::Entered {
            from: State::Ready,
            to: State::ReadWriteNotify
        }
    );
    assert_eq!(h.probe.drain(), vec![SessionCall::Connect(peripheral().id)]);

    assert_eq!(
        h.feed(Event::connect_success(peripheral())).unwrap(),
        Outcome::Stayed(State::ReadWriteNotify)
    );
    assert_eq!(
        h.probe.drain(),
        vec![SessionCall::DiscoverService {
            peripheral: peripheral().id,
            service: service_uuid()
        }]
    );

    h.feed(Event::discover_services_success(service_handle()))
        .unwrap();
    assert_eq!(
        h.probe.drain(),
        vec![SessionCall::DiscoverCharacteristic {
            service: service_uuid(),
            characteristic: characteristic_uuid()
        }]
    );

    let outcome = h
        .feed(Event::discover_characteristics_success(characteristic_handle()))
        .unwrap();
    assert_eq!(
        outcome,
        Outcome::Entered {
            from: State::ReadWriteNotify,
            to: State::Ready
        }
    );
    assert_eq!(h.probe.drain(), vec![SessionCall::Read(characteristic_handle())]);
    assert_eq!(
        h.machine.take_directives().as_slice(),
        &[Directive::RetireCommand(read.id)]
    );
    assert!(h.machine.context().command.is_none());
    assert!(!h.machine.timer.is_armed());
}

#[tokio::test(start_paused = true)]
async fn test_offline_resets_from_every_state() {
    for state in State::ALL {
        let mut h = harness();
        h.ready();
        let staged = h.stage(read_command());
        h.machine.context.command = Some(staged);
        h.force(state);

        h.feed(Event::off_line()).unwrap();

        assert_eq!(h.machine.state(), State::OffLine, "from {}", state);
        if state == State::OffLine {
            continue;
        }
        assert_eq!(h.machine.context(), &SessionContext::default(), "from {}", state);
        assert!(h
            .machine
            .take_directives()
            .contains(&Directive::FlushCommands));
        assert!(h
            .statuses()
            .contains(&StatusEvent::Adapter(crate::publisher::PowerStatus::OffLine)));
    }
}

// ----------------------------------------------------------------------------
// Dispatch algorithm
// ----------------------------------------------------------------------------

#[test]
fn test_every_unlisted_pair_falls_back() {
    let table = ErrorTable::standard().unwrap();
    for state in State::ALL {
        for kind in EventKind::ALL {
            if table::transition_for(state, kind).is_some() {
                continue;
            }
            let mut h = harness_with(lenient());
            h.force(state);

            let result = h.feed(Event::of_kind(kind));

            let expected = table.fallback(state).next;
            match result {
                Err(MachineError::InvalidEvent { fallback, .. }) => {
                    assert_eq!(fallback, expected, "{} in {}", kind, state)
                }
                other => panic!("{} in {}: unexpected {:?}", kind, state, other),
            }
            assert_eq!(h.machine.current, Some(expected), "{} in {}", kind, state);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_transition_runs_exit_then_actions_then_entry() {
    let mut h = harness();
    h.feed(Event::scan(service_uuid())).unwrap();
    h.executed();

    let Some(Input::Timeout { ticket, event }) = h.inbox.recv().await else {
        panic!("scan deadline should fire");
    };
    assert!(h.machine.claim_timer(ticket));
    h.feed(event).unwrap();
    assert_eq!(
        h.executed(),
        vec![
            Action::CancelTimer,
            Action::CancelScanDeadline,
            Action::StopScan,
            Action::CancelConnection,
            Action::ForgetPeripheral,
            Action::PublishPhase(Phase::ScanTimedOut)
        ]
    );

    h.ready();
    let read = h.stage(read_command());
    h.feed(Event::command(read)).unwrap();
    assert_eq!(h.executed(), vec![Action::StageCommand, Action::Connect]);

    h.feed(Event::connect_timeout()).unwrap();
    assert_eq!(
        h.executed(),
        vec![
            Action::CancelTimer,
            Action::CancelConnection,
            Action::MarkDisconnected,
            Action::PublishPhase(Phase::ConnectTimedOut),
            Action::SettleReady
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stay_runs_neither_entry_nor_exit() {
    let mut h = harness();
    h.ready();

    let outcome = h.feed(Event::disconnected(Some("link loss".into()))).unwrap();

    assert_eq!(outcome, Outcome::Stayed(State::Ready));
    assert_eq!(
        h.executed(),
        vec![Action::MarkDisconnected, Action::PublishDisconnect]
    );
    assert!(!h.machine.context().connected);
    assert_eq!(
        h.statuses(),
        vec![StatusEvent::Link(LinkStatus::Disconnected {
            peripheral: Some(peripheral().id),
            error: Some("link loss".into())
        })]
    );
}

#[test]
fn test_reentrant_dispatch_is_rejected() {
    let mut h = harness();
    // An outer dispatch holds the state
    let held = h.machine.current.take();

    let err = h.feed(Event::on_line()).unwrap_err();

    assert!(matches!(
        err,
        MachineError::Reentrant {
            event: EventKind::OnLine
        }
    ));
    assert!(h.machine.current.is_none());
    assert!(h.executed().is_empty());

    h.machine.current = held;
    assert!(h.feed(Event::on_line()).is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_events_raised_by_actions_are_queued_not_nested() {
    let mut h = harness();
    h.feed(Event::scan(service_uuid())).unwrap();
    h.feed(Event::discovered(peripheral())).unwrap();

    let outcome = h.feed(Event::connect_success(peripheral())).unwrap();

    assert_eq!(outcome, Outcome::Stayed(State::Scanning));
    let posted = h.posted();
    assert_eq!(posted, vec![Event::scan_success()]);

    h.feed(Event::scan_success()).unwrap();
    assert_eq!(h.machine.state(), State::Ready);
}

#[test]
#[should_panic(expected = "is not valid in state")]
fn test_strict_mode_asserts_on_invalid_event() {
    let (session, probe) = RecordingSession::new();
    let mut h = build(
        MachineConfig::default().with_strict_assertions(true),
        session,
        probe,
        MemoryStore::new(),
    );
    let _ = h.feed(Event::of_kind(EventKind::Read));
}

#[tokio::test(start_paused = true)]
async fn test_entry_failure_falls_back_through_entered_state() {
    let (session, probe) = RecordingSession::new();
    let mut h = build(
        lenient().with_strict_assertions(true),
        session.failing_connects(),
        probe,
        MemoryStore::new(),
    );
    h.ready();
    let read = h.stage(read_command());

    let err = h.feed(Event::command(read.clone())).unwrap_err();

    match err {
        MachineError::ActionFailed {
            state,
            fallback,
            source: ActionError::Session(_),
            ..
        } => {
            assert_eq!(state, State::ReadWriteNotify);
            assert_eq!(fallback, State::Ready);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(h.machine.state(), State::Ready);
    assert_eq!(
        h.machine.take_directives().as_slice(),
        &[Directive::RetireCommand(read.id)]
    );
}

// ----------------------------------------------------------------------------
// Edge policies
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_first_discovery_wins() {
    let mut h = harness();
    h.feed(Event::scan(service_uuid())).unwrap();
    h.probe.drain();

    h.feed(Event::discovered(peripheral())).unwrap();
    h.feed(Event::discovered(crate::session::PeripheralHandle::new("other")))
        .unwrap();

    assert_eq!(
        h.probe.drain(),
        vec![
            SessionCall::StopScan,
            SessionCall::Connect(peripheral().id)
        ]
    );
    assert_eq!(h.machine.context().peripheral, Some(peripheral()));
}

#[tokio::test(start_paused = true)]
async fn test_failed_connect_while_scanning_rescans() {
    let mut h = harness();
    h.feed(Event::scan(service_uuid())).unwrap();
    h.feed(Event::discovered(peripheral())).unwrap();
    h.probe.drain();

    h.feed(Event::connect_fail("refused")).unwrap();

    assert_eq!(h.machine.state(), State::Scanning);
    assert!(h.machine.context().peripheral.is_none());
    assert_eq!(h.probe.drain(), vec![SessionCall::Scan(service_uuid())]);
}

#[tokio::test(start_paused = true)]
async fn test_connect_success_without_command_is_protocol_error() {
    let mut h = harness_with(lenient());
    h.ready();
    h.force(State::ReadWriteNotify);

    let err = h.feed(Event::connect_success(peripheral())).unwrap_err();

    assert!(matches!(
        err,
        MachineError::ActionFailed {
            source: ActionError::MissingContext("command"),
            fallback: State::Ready,
            ..
        }
    ));
    assert_eq!(h.machine.state(), State::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_retrieve_without_record_falls_back_to_scan() {
    let mut h = harness();

    h.feed(Event::retrieve(service_uuid())).unwrap();
    assert_eq!(h.machine.state(), State::Retrieving);
    let posted = h.posted();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].kind(), EventKind::RetrieveFail);

    h.feed(posted[0].clone()).unwrap();
    assert_eq!(h.machine.state(), State::Scanning);
    assert_eq!(h.probe.drain(), vec![SessionCall::Scan(service_uuid())]);
}

#[tokio::test(start_paused = true)]
async fn test_attach_persists_record_and_retrieve_reuses_it() {
    let mut h = harness();
    h.attach_by_scan();

    let stored = h.machine.store.load().unwrap().unwrap();
    assert_eq!(stored.service, service_uuid());
    assert_eq!(stored.peripheral_id, peripheral().id);

    // Power cycle, then reacquire without scanning
    h.feed(Event::off_line()).unwrap();
    h.feed(Event::on_line()).unwrap();
    h.probe.drain();
    h.executed();

    h.feed(Event::retrieve(service_uuid())).unwrap();
    assert_eq!(h.probe.drain(), vec![SessionCall::Retrieve(peripheral().id)]);
    assert!(h.posted().is_empty());

    h.feed(Event::retrieved(peripheral())).unwrap();
    h.feed(Event::connect_success(peripheral())).unwrap();
    assert_eq!(h.machine.state(), State::Ready);
    assert!(h.machine.context().attached);
    assert!(h
        .statuses()
        .contains(&StatusEvent::Phase(Phase::RetrieveSucceeded)));
}

#[tokio::test(start_paused = true)]
async fn test_retrieve_timeout_cancels_and_scans() {
    let mut h = harness();
    h.attach_by_scan();
    h.feed(Event::off_line()).unwrap();
    h.feed(Event::on_line()).unwrap();
    h.feed(Event::retrieve(service_uuid())).unwrap();
    h.feed(Event::retrieved(peripheral())).unwrap();
    h.probe.drain();

    let timeout = loop {
        match h.inbox.recv().await {
            Some(Input::Timeout { ticket, event }) if h.machine.claim_timer(ticket) => break event,
            Some(_) => continue,
            None => panic!("mailbox closed"),
        }
    };
    assert_eq!(timeout.kind(), EventKind::ConnectTimeout);

    h.feed(timeout).unwrap();
    assert_eq!(h.machine.state(), State::Scanning);
    assert_eq!(
        h.probe.drain(),
        vec![
            SessionCall::CancelConnection(peripheral().id),
            SessionCall::Scan(service_uuid())
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_set_notify_updates_active_set() {
    let mut h = harness();
    h.attach_by_scan();
    let subscribe = h.stage(Command::SetNotify {
        service: service_uuid(),
        characteristic: characteristic_uuid(),
        enabled: true,
    });

    h.feed(Event::command(subscribe)).unwrap();

    assert!(h
        .machine
        .notifications()
        .contains(service_uuid(), characteristic_uuid()));
}

#[tokio::test(start_paused = true)]
async fn test_resubscribes_after_link_drop() {
    let mut h = harness();
    h.attach_by_scan();
    let other = uuid::Uuid::from_u128(0xbeef);
    h.machine.notifications.apply(service_uuid(), other, true);
    h.machine
        .notifications
        .apply(service_uuid(), characteristic_uuid(), true);

    h.feed(Event::disconnected(None)).unwrap();
    let read = h.stage(read_command());
    h.feed(Event::command(read)).unwrap();
    h.probe.drain();

    h.feed(Event::connect_success(peripheral())).unwrap();

    assert_eq!(
        h.probe.drain(),
        vec![
            SessionCall::SetNotify {
                characteristic: CharacteristicHandle::new(peripheral().id, service_uuid(), other),
                enabled: true
            },
            SessionCall::DiscoverService {
                peripheral: peripheral().id,
                service: service_uuid()
            }
        ]
    );
    assert!(h.machine.context().connected);
}

#[tokio::test(start_paused = true)]
async fn test_rssi_read_publishes_value() {
    let mut h = harness();
    h.attach_by_scan();
    let rssi = h.stage(Command::ReadRssi);

    h.feed(Event::command(rssi.clone())).unwrap();
    assert_eq!(h.machine.state(), State::ReadRssi);
    h.feed(Event::connect_success(peripheral())).unwrap();
    assert_eq!(
        h.probe.drain(),
        vec![
            SessionCall::Connect(peripheral().id),
            SessionCall::ReadRssi(peripheral().id)
        ]
    );

    h.feed(Event::read_rssi_success(-58)).unwrap();

    assert_eq!(h.machine.state(), State::Ready);
    assert_eq!(h.statuses(), vec![StatusEvent::RssiChanged(-58)]);
    assert_eq!(
        h.machine.take_directives().as_slice(),
        &[Directive::RetireCommand(rssi.id)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_operation_timeout_returns_to_ready() {
    let mut h = harness();
    h.attach_by_scan();
    let read = h.stage(read_command());
    h.feed(Event::command(read.clone())).unwrap();
    h.feed(Event::connect_success(peripheral())).unwrap();

    let Some(Input::Timeout { ticket, event }) = h.inbox.recv().await else {
        panic!("operation timer should fire");
    };
    assert_eq!(event.kind(), EventKind::OperationTimeout);
    assert!(h.machine.claim_timer(ticket));
    h.feed(event).unwrap();

    assert_eq!(h.machine.state(), State::Ready);
    assert!(h
        .statuses()
        .contains(&StatusEvent::Phase(Phase::OperationTimedOut)));
    assert_eq!(
        h.machine.take_directives().as_slice(),
        &[Directive::RetireCommand(read.id)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_command_returns_machine_to_ready() {
    let mut h = harness();
    h.attach_by_scan();
    let read = h.stage(read_command());
    let unrelated = h.stage(Command::ReadRssi);
    h.feed(Event::command(read.clone())).unwrap();

    assert_eq!(h.machine.abandon_command(unrelated.id), None);
    assert_eq!(h.machine.state(), State::ReadWriteNotify);

    assert_eq!(h.machine.abandon_command(read.id), Some(State::Ready));
    assert_eq!(h.machine.state(), State::Ready);
    assert!(!h.machine.timer.is_armed());
    assert_eq!(
        h.machine.take_directives().as_slice(),
        &[Directive::RetireCommand(read.id)]
    );
}

// ----------------------------------------------------------------------------
// Late replies and the scan deadline
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_connect_reply_after_connect_timeout_is_dropped() {
    let mut h = harness();
    h.ready();
    let read = h.stage(read_command());
    h.feed(Event::command(read.clone())).unwrap();
    h.feed(Event::connect_timeout()).unwrap();
    assert_eq!(h.machine.state(), State::Ready);
    assert_eq!(
        h.machine.take_directives().as_slice(),
        &[Directive::RetireCommand(read.id)]
    );
    h.probe.drain();
    h.statuses();

    for late in [
        Event::connect_success(peripheral()),
        Event::connect_fail("refused"),
    ] {
        assert_eq!(h.feed(late).unwrap(), Outcome::Stayed(State::Ready));
    }

    assert!(h.probe.drain().is_empty());
    assert!(h.statuses().is_empty());
    assert!(h.machine.take_directives().is_empty());
    assert!(!h.machine.context().connected);
}

#[tokio::test(start_paused = true)]
async fn test_gatt_replies_after_operation_timeout_are_dropped() {
    let mut h = harness();
    h.attach_by_scan();
    let read = h.stage(read_command());
    h.feed(Event::command(read)).unwrap();
    h.feed(Event::connect_success(peripheral())).unwrap();

    let Some(Input::Timeout { ticket, event }) = h.inbox.recv().await else {
        panic!("operation timer should fire");
    };
    assert!(h.machine.claim_timer(ticket));
    h.feed(event).unwrap();
    assert_eq!(h.machine.state(), State::Ready);
    h.probe.drain();
    h.machine.take_directives();

    for late in [
        Event::discover_services_success(service_handle()),
        Event::discover_services_fail("gatt error"),
        Event::discover_characteristics_success(characteristic_handle()),
        Event::discover_characteristics_fail("gatt error"),
        Event::read_rssi_fail("not connected"),
    ] {
        assert_eq!(h.feed(late).unwrap(), Outcome::Stayed(State::Ready));
    }

    assert!(h.probe.drain().is_empty());
    assert!(h.machine.take_directives().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_connect_reply_after_abandon_is_dropped() {
    let mut h = harness();
    h.attach_by_scan();
    let read = h.stage(read_command());
    h.feed(Event::command(read.clone())).unwrap();
    assert_eq!(h.machine.abandon_command(read.id), Some(State::Ready));
    h.probe.drain();

    let outcome = h.feed(Event::connect_success(peripheral())).unwrap();

    assert_eq!(outcome, Outcome::Stayed(State::Ready));
    assert!(h.machine.context().command.is_none());
    assert!(h.probe.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_replies_after_power_loss_are_dropped() {
    let mut h = harness();
    h.feed(Event::scan(service_uuid())).unwrap();
    h.feed(Event::discovered(peripheral())).unwrap();
    h.feed(Event::off_line()).unwrap();
    h.probe.drain();

    assert_eq!(
        h.feed(Event::connect_success(peripheral())).unwrap(),
        Outcome::Stayed(State::OffLine)
    );
    assert_eq!(
        h.feed(Event::scan_success()).unwrap(),
        Outcome::Stayed(State::OffLine)
    );
    assert!(h.probe.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_scan_deadline_survives_failed_connects() {
    let mut h = harness();
    let scan_timeout = MachineConfig::default().scan_timeout;
    let started = Instant::now();
    h.feed(Event::scan(service_uuid())).unwrap();

    let mut gave_up_at = None;
    for _ in 0..10 {
        time::advance(Duration::from_secs(3)).await;
        h.settle_timers().await;
        h.feed(Event::discovered(peripheral())).unwrap();

        time::advance(Duration::from_secs(3)).await;
        h.settle_timers().await;
        h.feed(Event::connect_fail("refused")).unwrap();

        if gave_up_at.is_none() && h.machine.state() == State::OnLine {
            gave_up_at = Some(started.elapsed());
        }
    }

    let gave_up_at = gave_up_at.expect("scan should give up");
    assert!(gave_up_at <= scan_timeout + Duration::from_secs(3));
    assert_eq!(h.machine.state(), State::OnLine);
    let timed_out = h
        .statuses()
        .into_iter()
        .filter(|status| status == &StatusEvent::Phase(Phase::ScanTimedOut))
        .count();
    assert_eq!(timed_out, 1);
}

#[tokio::test(start_paused = true)]
async fn test_scan_timeout_cancels_pending_connect() {
    let mut h = harness();
    let half = MachineConfig::default().scan_timeout / 2;
    h.feed(Event::scan(service_uuid())).unwrap();
    time::advance(half).await;
    h.feed(Event::discovered(peripheral())).unwrap();
    h.probe.drain();

    // The scan deadline passes while the connect attempt is still within its own
    time::advance(half).await;
    h.settle_timers().await;

    assert_eq!(h.machine.state(), State::OnLine);
    assert_eq!(
        h.probe.drain(),
        vec![
            SessionCall::StopScan,
            SessionCall::CancelConnection(peripheral().id)
        ]
    );
    assert!(h.machine.context().peripheral.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_scan_failure_returns_online() {
    let mut h = harness();
    h.feed(Event::scan(service_uuid())).unwrap();
    h.probe.drain();
    h.statuses();

    h.feed(Event::scan_fail("adapter busy")).unwrap();

    assert_eq!(h.machine.state(), State::OnLine);
    assert!(!h.machine.scan_deadline.is_armed());
    assert_eq!(h.probe.drain(), vec![SessionCall::StopScan]);
    assert_eq!(h.statuses(), vec![StatusEvent::Phase(Phase::ScanFailed)]);
}
