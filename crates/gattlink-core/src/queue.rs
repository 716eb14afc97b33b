//! Serialized command queue with a stall watchdog
//!
//! At most one queued command is in flight. The head of the queue is the
//! command currently executing; everything behind it waits in submission
//! order. The owner drives the watchdog by calling
//! [`CommandQueue::watchdog_tick`] every [`CommandQueue::tick_period`]; a head
//! that stays in flight across a full cycle of checks is force-retired so one
//! wedged BLE operation cannot starve every later command.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Floor applied to the configured command timeout
pub const MIN_COMMAND_TIMEOUT: Duration = Duration::from_secs(35);

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Watchdog configuration for the command queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Time a command may stay in flight before it is force-retired
    pub command_timeout: Duration,
    /// Number of watchdog checks the timeout is split into
    pub watchdog_checks: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            command_timeout: MIN_COMMAND_TIMEOUT,
            watchdog_checks: 3,
        }
    }
}

impl QueueConfig {
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_watchdog_checks(mut self, checks: u32) -> Self {
        self.watchdog_checks = checks;
        self
    }

    /// Interval between watchdog checks
    pub fn tick_period(&self) -> Duration {
        let timeout = self.command_timeout.max(MIN_COMMAND_TIMEOUT);
        timeout / self.watchdog_checks.max(1)
    }
}

// ----------------------------------------------------------------------------
// Queue Items
// ----------------------------------------------------------------------------

/// Identifier assigned to every submitted command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(u64);

impl CommandId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A unit of deferred work together with its queue identifier
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCommand<T> {
    pub id: CommandId,
    pub work: T,
}

/// Result of one watchdog check
#[derive(Debug, Clone, PartialEq)]
pub enum WatchdogVerdict<T> {
    /// Nothing is in flight
    Idle,
    /// The head is in flight and has been observed for `checks` ticks
    Watching { id: CommandId, checks: u32 },
    /// The head was force-retired; `next` is the command to start, if any
    Retired {
        retired: CommandId,
        next: Option<QueuedCommand<T>>,
    },
}

// ----------------------------------------------------------------------------
// Command Queue
// ----------------------------------------------------------------------------

/// FIFO of client commands with maxConcurrency = 1
#[derive(Debug)]
pub struct CommandQueue<T> {
    items: VecDeque<QueuedCommand<T>>,
    executing: bool,
    next_id: u64,
    checks_per_cycle: u32,
    tick_period: Duration,
    observed: Option<CommandId>,
    missed_checks: u32,
}

impl<T: Clone> CommandQueue<T> {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            items: VecDeque::new(),
            executing: false,
            next_id: 0,
            checks_per_cycle: config.watchdog_checks.max(1),
            tick_period: config.tick_period(),
            observed: None,
            missed_checks: 0,
        }
    }

    /// Enqueue `work`
    ///
    /// Returns the command to start now when nothing was in flight.
    pub fn submit(&mut self, work: T) -> (CommandId, Option<QueuedCommand<T>>) {
        self.next_id += 1;
        let id = CommandId(self.next_id);
        self.items.push_back(QueuedCommand { id, work });
        debug!(command = %id, queued = self.items.len(), "command submitted");
        (id, self.start_head())
    }

    /// Mark `id` finished and return the next command to start
    ///
    /// Completions for anything other than the in-flight head are stale (the
    /// watchdog or a flush got there first) and are ignored.
    pub fn complete(&mut self, id: CommandId) -> Option<QueuedCommand<T>> {
        match self.current_id() {
            Some(current) if current == id => {
                self.retire_head();
                self.start_head()
            }
            _ => {
                debug!(command = %id, "ignoring completion of a command that is not in flight");
                None
            }
        }
    }

    /// Force-retire every queued command, returning how many were dropped
    pub fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        self.executing = false;
        self.observed = None;
        self.missed_checks = 0;
        dropped
    }

    /// Run one watchdog check
    pub fn watchdog_tick(&mut self) -> WatchdogVerdict<T> {
        let Some(head) = self.current_id() else {
            self.observed = None;
            self.missed_checks = 0;
            return WatchdogVerdict::Idle;
        };

        if self.observed != Some(head) {
            self.observed = Some(head);
            self.missed_checks = 0;
            return WatchdogVerdict::Watching {
                id: head,
                checks: 0,
            };
        }

        self.missed_checks += 1;
        if self.missed_checks < self.checks_per_cycle {
            return WatchdogVerdict::Watching {
                id: head,
                checks: self.missed_checks,
            };
        }

        warn!(
            command = %head,
            stalled_for = ?self.tick_period * self.missed_checks,
            "removing stalled command from the queue"
        );
        self.retire_head();
        WatchdogVerdict::Retired {
            retired: head,
            next: self.start_head(),
        }
    }

    /// Identifier of the command in flight
    pub fn current_id(&self) -> Option<CommandId> {
        if self.executing {
            self.items.front().map(|item| item.id)
        } else {
            None
        }
    }

    pub fn tick_period(&self) -> Duration {
        self.tick_period
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn retire_head(&mut self) {
        self.items.pop_front();
        self.executing = false;
        self.observed = None;
        self.missed_checks = 0;
    }

    fn start_head(&mut self) -> Option<QueuedCommand<T>> {
        if self.executing {
            return None;
        }
        let head = self.items.front()?.clone();
        self.executing = true;
        Some(head)
    }
}
