// Command bus - bounded FIFO between network sessions and the device-control task

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use heapless::Deque;
use thiserror::Error;

use crate::command::Command;

/// Number of commands the bus holds before producers have to wait.
pub const BUS_CAPACITY: usize = 8;

/// Timeout meaning "block until the operation can complete".
pub const FOREVER: Duration = Duration::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("command bus full, {0} not queued")]
    Full(Command),
    #[error("no command arrived before the timeout")]
    Empty,
}

/// Multi-producer, single-consumer command queue with blocking timeouts.
///
/// Strict FIFO across all producers and no coalescing: two `LedOn` sends take
/// two slots. A timeout is a normal outcome reported through [`BusError`].
pub struct CommandBus {
    queue: Mutex<Deque<Command, BUS_CAPACITY>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl CommandBus {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Deque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Enqueue `cmd`, waiting up to `timeout` for a free slot.
    pub fn send(&self, cmd: Command, timeout: Duration) -> Result<(), BusError> {
        let deadline = Deadline::after(timeout);
        let mut queue = self.lock();

        loop {
            if queue.push_back(cmd).is_ok() {
                drop(queue);
                self.not_empty.notify_one();
                return Ok(());
            }

            queue = match deadline.remaining() {
                Wait::Expired => return Err(BusError::Full(cmd)),
                Wait::Unbounded => self
                    .not_full
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner),
                Wait::For(left) => {
                    self.not_full
                        .wait_timeout(queue, left)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Dequeue the oldest command, waiting up to `timeout` for one to arrive.
    pub fn receive(&self, timeout: Duration) -> Result<Command, BusError> {
        let deadline = Deadline::after(timeout);
        let mut queue = self.lock();

        loop {
            if let Some(cmd) = queue.pop_front() {
                drop(queue);
                self.not_full.notify_one();
                return Ok(cmd);
            }

            queue = match deadline.remaining() {
                Wait::Expired => return Err(BusError::Empty),
                Wait::Unbounded => self
                    .not_empty
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner),
                Wait::For(left) => {
                    self.not_empty
                        .wait_timeout(queue, left)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        BUS_CAPACITY
    }

    // Deque operations never leave the queue half-updated, so a poisoned lock
    // still guards a consistent queue.
    fn lock(&self) -> MutexGuard<'_, Deque<Command, BUS_CAPACITY>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}

enum Deadline {
    Never,
    At(Instant),
}

enum Wait {
    Expired,
    Unbounded,
    For(Duration),
}

impl Deadline {
    fn after(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(at) => Deadline::At(at),
            None => Deadline::Never,
        }
    }

    fn remaining(&self) -> Wait {
        match self {
            Deadline::Never => Wait::Unbounded,
            Deadline::At(at) => {
                let left = at.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    Wait::Expired
                } else {
                    Wait::For(left)
                }
            }
        }
    }
}
