//! BLE service
//!
//! [`BleService`] is a cheap handle onto a single task that owns the
//! connection machine and the command queue. Client requests, driver
//! callbacks, events raised by actions and timer fires all arrive on that
//! task and are handled one at a time, so the machine is never touched
//! concurrently.


use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::command::{Command, StagedCommand};
use crate::config::ServiceConfig;
use crate::dispatch::{Input, Mailbox, Request};
use crate::error::{LinkError, LinkResult};
use crate::machine::{ConnectionMachine, Directive, Event, State};
use crate::publisher::{StatusEvent, StatusPublisher};
use crate::queue::{CommandQueue, QueuedCommand, WatchdogVerdict};
use crate::session::{AdapterEventSender, CentralSession, PeripheralHandle, Routed};
use crate::store::{AttachmentStore, SettingsStore};

/// Point-in-time view of the link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkSnapshot {
    pub state: State,
    pub peripheral: Option<PeripheralHandle>,
    pub service: Option<Uuid>,
    pub attached: bool,
    pub connected: bool,
    pub queued_commands: usize,
    pub active_notifications: usize,
}

// ----------------------------------------------------------------------------
// Service Handle
// ----------------------------------------------------------------------------

/// Client handle for the BLE service task
#[derive(Debug, Clone)]
pub struct BleService {
    requests: mpsc::UnboundedSender<Request>,
    publisher: StatusPublisher,
}

impl BleService {
    /// Build the machine around the session returned by `make_session` and
    /// start the service task
    ///
    /// `make_session` receives the sender the driver must report its
    /// callbacks through. Must be called from within a tokio runtime.
    pub fn spawn<F>(
        config: ServiceConfig,
        store: Box<dyn SettingsStore>,
        make_session: F,
    ) -> LinkResult<Self>
    where
        F: FnOnce(AdapterEventSender) -> Box<dyn CentralSession>,
    {
        let (mailbox, inbox) = Mailbox::channel();
        let (requests, request_rx) = mpsc::unbounded_channel();
        let publisher = StatusPublisher::new(config.status_capacity);

        let session = make_session(mailbox.adapter_sender());
        let machine = ConnectionMachine::new(
            config.machine.clone(),
            session,
            AttachmentStore::with_key(store, config.settings_key.clone()),
            publisher.clone(),
            mailbox,
        )?;

        let task = ServiceTask {
            machine,
            queue: CommandQueue::new(&config.queue),
            inbox,
            requests: request_rx,
            publisher: publisher.clone(),
            auto_reattach: config.auto_reattach,
            remembered: None,
            pending: None,
        };
        tokio::spawn(task.run());
        info!("BLE service started");

        Ok(Self {
            requests,
            publisher,
        })
    }

    /// Attach to a peripheral advertising `service`
    ///
    /// With `force_scan` unset the last attached peripheral is reacquired by
    /// its stored identifier before falling back to a scan. The request is
    /// held until the adapter is online.
    pub fn attach_peripheral(&self, service: Uuid, force_scan: bool) -> LinkResult<()> {
        self.send(Request::Attach {
            service,
            force_scan,
        })
    }

    pub fn read(&self, service: Uuid, characteristic: Uuid) -> LinkResult<()> {
        self.submit(Command::Read {
            service,
            characteristic,
        })
    }

    pub fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        data: impl Into<Vec<u8>>,
        requires_ack: bool,
    ) -> LinkResult<()> {
        self.submit(Command::Write {
            service,
            characteristic,
            data: data.into(),
            requires_ack,
        })
    }

    pub fn set_notify(&self, service: Uuid, characteristic: Uuid, enabled: bool) -> LinkResult<()> {
        self.submit(Command::SetNotify {
            service,
            characteristic,
            enabled,
        })
    }

    pub fn read_rssi(&self) -> LinkResult<()> {
        self.submit(Command::ReadRssi)
    }

    /// Forget the stored peripheral, its active notifications and the
    /// remembered attach request
    pub fn forget_peripheral(&self) -> LinkResult<()> {
        self.send(Request::Forget)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.publisher.subscribe()
    }

    pub async fn snapshot(&self) -> LinkResult<LinkSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Snapshot(tx))?;
        rx.await.map_err(|_| LinkError::ServiceStopped)
    }

    pub async fn state(&self) -> LinkResult<State> {
        Ok(self.snapshot().await?.state)
    }

    /// Stop the service task; later requests fail with `ServiceStopped`
    pub async fn shutdown(&self) -> LinkResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Shutdown(tx))?;
        rx.await.map_err(|_| LinkError::ServiceStopped)
    }

    /// Queue a command; it is dropped at dispatch time unless the link is ready
    fn submit(&self, command: Command) -> LinkResult<()> {
        self.send(Request::Submit(command))
    }

    fn send(&self, request: Request) -> LinkResult<()> {
        self.requests
            .send(request)
            .map_err(|_| LinkError::ServiceStopped)
    }
}

// ----------------------------------------------------------------------------
// Service Task
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AttachRequest {
    service: Uuid,
    force_scan: bool,
}

impl AttachRequest {
    fn event(&self) -> Event {
        if self.force_scan {
            Event::scan(self.service)
        } else {
            Event::retrieve(self.service)
        }
    }
}

struct ServiceTask {
    machine: ConnectionMachine,
    queue: CommandQueue<Command>,
    inbox: mpsc::UnboundedReceiver<Input>,
    requests: mpsc::UnboundedReceiver<Request>,
    publisher: StatusPublisher,
    auto_reattach: bool,
    /// Last attach request, re-issued when power returns
    remembered: Option<AttachRequest>,
    /// Attach request waiting for the machine to be `OnLine`
    pending: Option<AttachRequest>,
}

impl ServiceTask {
    async fn run(mut self) {
        let period = self.queue.tick_period();
        let mut watchdog = time::interval_at(Instant::now() + period, period);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Internal inputs drain before the next client request is looked at
            tokio::select! {
                biased;

                Some(input) = self.inbox.recv() => self.handle_input(input),
                request = self.requests.recv() => match request {
                    Some(request) => {
                        if !self.handle_request(request) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = watchdog.tick() => self.on_watchdog(),
            }
        }

        let dropped = self.queue.clear();
        info!(dropped, "BLE service stopped");
    }

    fn handle_request(&mut self, request: Request) -> bool {
        match request {
            Request::Attach {
                service,
                force_scan,
            } => {
                let request = AttachRequest {
                    service,
                    force_scan,
                };
                self.remembered = Some(request);
                self.pending = Some(request);
                self.try_attach();
            }
            Request::Submit(command) => {
                let (id, start) = self.queue.submit(command);
                trace!(command = %id, "command queued");
                self.start(start);
            }
            Request::Forget => {
                self.remembered = None;
                self.pending = None;
                if let Err(err) = self.machine.forget() {
                    warn!(error = %err, "failed to forget attached peripheral");
                }
            }
            Request::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Request::Shutdown(ack) => {
                self.requests.close();
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    fn handle_input(&mut self, input: Input) {
        match input {
            Input::Adapter(event) => match event.route() {
                Routed::Machine(event) => self.dispatch(event),
                Routed::Publish(status) => self.publisher.publish(status),
            },
            Input::Event(event) => self.dispatch(event),
            Input::Timeout { ticket, event } => {
                if self.machine.claim_timer(ticket) {
                    debug!(event = %event, "timeout fired");
                    self.dispatch(event);
                }
            }
        }
    }

    fn dispatch(&mut self, event: Event) {
        let before = self.machine.state();
        if let Err(err) = self.machine.handle_event(event) {
            debug!(error = %err, "event resolved through fallback");
        }
        self.apply_directives();

        let after = self.machine.state();
        if before != after {
            self.on_state_change(before, after);
        }
    }

    fn apply_directives(&mut self) {
        loop {
            let directives = self.machine.take_directives();
            if directives.is_empty() {
                break;
            }
            for directive in directives {
                match directive {
                    Directive::RetireCommand(id) => {
                        let next = self.queue.complete(id);
                        self.start(next);
                    }
                    Directive::FlushCommands => {
                        let dropped = self.queue.clear();
                        if dropped > 0 {
                            debug!(dropped, "queued commands flushed");
                        }
                    }
                }
            }
        }
    }

    /// Hand dequeued commands to the machine, dropping any whose turn comes
    /// while the link is not ready
    fn start(&mut self, mut next: Option<QueuedCommand<Command>>) {
        while let Some(item) = next.take() {
            let state = self.machine.state();
            if state != State::Ready {
                debug!(command = %item.id, state = %state, "dropping command, link not ready");
                next = self.queue.complete(item.id);
                continue;
            }
            self.dispatch(Event::command(StagedCommand {
                id: item.id,
                command: item.work,
            }));
        }
    }

    fn on_state_change(&mut self, from: State, to: State) {
        if to != State::OnLine {
            return;
        }
        if from == State::OffLine && self.auto_reattach && self.pending.is_none() {
            if let Some(remembered) = self.remembered {
                info!(service = %remembered.service, "adapter back online, re-attaching");
                self.pending = Some(AttachRequest {
                    force_scan: false,
                    ..remembered
                });
            }
        }
        self.try_attach();
    }

    fn try_attach(&mut self) {
        let state = self.machine.state();
        if state != State::OnLine {
            if self.pending.is_some() {
                debug!(state = %state, "attach deferred until the adapter is online");
            }
            return;
        }
        if let Some(request) = self.pending.take() {
            self.dispatch(request.event());
        }
    }

    fn on_watchdog(&mut self) {
        match self.queue.watchdog_tick() {
            WatchdogVerdict::Idle => {}
            WatchdogVerdict::Watching { id, checks } => {
                trace!(command = %id, checks, "command still in flight");
            }
            WatchdogVerdict::Retired { retired, next } => {
                if let Some(state) = self.machine.abandon_command(retired) {
                    debug!(command = %retired, state = %state, "machine released stalled command");
                }
                self.apply_directives();
                self.start(next);
            }
        }
    }

    fn snapshot(&self) -> LinkSnapshot {
        let context = self.machine.context();
        LinkSnapshot {
            state: self.machine.state(),
            peripheral: context.peripheral.clone(),
            service: context.service,
            attached: context.attached,
            connected: context.connected,
            queued_commands: self.queue.len(),
            active_notifications: self.machine.notifications().len(),
        }
    }
}
