//! One-shot timeout timer
//!
//! An [`EventTimer`] arms a single deadline at a time. Each arm spawns a fresh
//! sleep task; re-arming or cancelling aborts the previous task rather than
//! reusing it. Because the fire callback usually just posts a message onto the
//! execution context, a fire can still be in flight after a cancel. The owner
//! therefore checks every fire with [`EventTimer::claim`], which accepts the
//! currently armed ticket exactly once.
//!
//! Tickets are unique across every timer in the process, so an owner holding
//! several timers can route a fire to the one that armed it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

// ----------------------------------------------------------------------------
// Timer Ticket
// ----------------------------------------------------------------------------

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Identifies one arm of an [`EventTimer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerTicket(u64);

impl TimerTicket {
    pub fn generation(&self) -> u64 {
        self.0
    }
}

// ----------------------------------------------------------------------------
// Event Timer
// ----------------------------------------------------------------------------

/// Deadline-based one-shot timer
#[derive(Debug, Default)]
pub struct EventTimer {
    armed: Option<TimerTicket>,
    task: Option<JoinHandle<()>>,
}

impl EventTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer, replacing any pending deadline and handler
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&mut self, delay: Duration, on_timeout: F) -> TimerTicket
    where
        F: FnOnce(TimerTicket) + Send + 'static,
    {
        self.abort_task();
        let ticket = TimerTicket(NEXT_GENERATION.fetch_add(1, Ordering::Relaxed));
        self.armed = Some(ticket);
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_timeout(ticket);
        }));
        trace!(generation = ticket.0, ?delay, "timer armed");
        ticket
    }

    /// Suppress a pending fire; no effect if already fired or cancelled
    pub fn cancel(&mut self) {
        self.abort_task();
        if let Some(ticket) = self.armed.take() {
            trace!(generation = ticket.0, "timer cancelled");
        }
    }

    /// Accept a fire for `ticket`
    ///
    /// Returns true only for the currently armed ticket and disarms the timer,
    /// so a late or duplicate fire is rejected.
    pub fn claim(&mut self, ticket: TimerTicket) -> bool {
        if self.armed == Some(ticket) {
            self.armed = None;
            self.task = None;
            true
        } else {
            trace!(generation = ticket.0, "stale timer fire ignored");
            false
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Whether `ticket` is the arm currently pending on this timer
    pub fn holds(&self, ticket: TimerTicket) -> bool {
        self.armed == Some(ticket)
    }

    fn abort_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for EventTimer {
    fn drop(&mut self) {
        self.abort_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn fire_channel() -> (
        mpsc::UnboundedSender<TimerTicket>,
        mpsc::UnboundedReceiver<TimerTicket>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_delay() {
        let (tx, mut rx) = fire_channel();
        let mut timer = EventTimer::new();

        let ticket = timer.schedule(Duration::from_millis(100), move |t| {
            let _ = tx.send(t);
        });
        assert!(timer.is_armed());

        let fired = rx.recv().await.expect("timer should fire");
        assert_eq!(fired, ticket);
        assert!(timer.claim(fired));
        assert!(!timer.is_armed());

        // The callback has been consumed; nothing else arrives
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending_deadline() {
        let (tx, mut rx) = fire_channel();
        let first_tx = tx.clone();
        let mut timer = EventTimer::new();

        timer.schedule(Duration::from_millis(100), move |t| {
            let _ = first_tx.send(t);
        });
        let second = timer.schedule(Duration::from_millis(300), move |t| {
            let _ = tx.send(t);
        });

        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
        let fired = rx.recv().await.expect("second arm should fire");
        assert_eq!(fired, second);
        assert!(timer.claim(fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_suppresses_fire() {
        let (tx, mut rx) = fire_channel();
        let mut timer = EventTimer::new();

        timer.schedule(Duration::from_millis(50), move |t| {
            let _ = tx.send(t);
        });
        timer.cancel();

        assert!(!timer.is_armed());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent_after_fire() {
        let (tx, mut rx) = fire_channel();
        let mut timer = EventTimer::new();

        timer.schedule(Duration::from_millis(10), move |t| {
            let _ = tx.send(t);
        });
        let fired = rx.recv().await.expect("timer should fire");
        assert!(timer.claim(fired));

        timer.cancel();
        timer.cancel();
        assert!(!timer.is_armed());
        assert!(!timer.claim(fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_racing_cancel_is_rejected() {
        let (tx, mut rx) = fire_channel();
        let mut timer = EventTimer::new();

        timer.schedule(Duration::from_millis(10), move |t| {
            let _ = tx.send(t);
        });
        // The fire message is already queued when the owner cancels
        let fired = rx.recv().await.expect("timer should fire");
        timer.cancel();

        assert!(!timer.claim(fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_after_cancel() {
        let (tx, mut rx) = fire_channel();
        let mut timer = EventTimer::new();

        let first_tx = tx.clone();
        let first = timer.schedule(Duration::from_millis(10), move |t| {
            let _ = first_tx.send(t);
        });
        timer.cancel();

        let second = timer.schedule(Duration::from_millis(10), move |t| {
            let _ = tx.send(t);
        });
        assert_ne!(first, second);
        assert!(!timer.holds(first));
        assert!(timer.holds(second));

        let fired = rx.recv().await.expect("re-armed timer should fire");
        assert_eq!(fired, second);
        assert!(timer.claim(fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tickets_differ_between_timers() {
        let mut scan = EventTimer::new();
        let mut connect = EventTimer::new();

        let a = scan.schedule(Duration::from_secs(10), |_| {});
        let b = connect.schedule(Duration::from_secs(10), |_| {});

        assert_ne!(a, b);
        assert!(scan.holds(a) && !scan.holds(b));
        assert!(!connect.claim(a));
        assert!(scan.claim(a));
    }
}
