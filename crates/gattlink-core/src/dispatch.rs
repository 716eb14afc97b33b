//! Inputs funnelled onto the service's single execution context

use tokio::sync::{mpsc, oneshot};
use tracing::trace;
use uuid::Uuid;

use crate::command::Command;
use crate::machine::Event;
use crate::service::LinkSnapshot;
use crate::session::{AdapterEvent, AdapterEventSender};
use crate::timer::TimerTicket;

/// Internal input processed by the service task in arrival order
#[derive(Debug)]
pub(crate) enum Input {
    /// Raw callback from the session driver
    Adapter(AdapterEvent),
    /// Event raised by a machine action
    Event(Event),
    /// A timer fired; honoured only if the ticket is still armed
    Timeout { ticket: TimerTicket, event: Event },
}

/// Client request sent by a [`crate::service::BleService`] handle
#[derive(Debug)]
pub(crate) enum Request {
    Attach { service: Uuid, force_scan: bool },
    Submit(Command),
    Forget,
    Snapshot(oneshot::Sender<LinkSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Sending half of the internal input channel
#[derive(Debug, Clone)]
pub(crate) struct Mailbox {
    tx: mpsc::UnboundedSender<Input>,
}

impl Mailbox {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Input>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue `event` behind everything already waiting
    pub(crate) fn post(&self, event: Event) {
        trace!(event = %event, "event posted");
        if self.tx.send(Input::Event(event)).is_err() {
            trace!("mailbox closed, posted event dropped");
        }
    }

    pub(crate) fn post_timeout(&self, ticket: TimerTicket, event: Event) {
        if self.tx.send(Input::Timeout { ticket, event }).is_err() {
            trace!("mailbox closed, timer fire dropped");
        }
    }

    pub(crate) fn adapter_sender(&self) -> AdapterEventSender {
        AdapterEventSender::new(self.tx.clone())
    }
}
