use crate::dispatcher::Dispatcher;
use crate::event::WakeupEvent;

/// A pluggable kernel-polling task driven by the dispatcher.
///
/// The dispatcher schedules the task through a sentinel queue entry, so at
/// most one worker is inside `run` at a time. Implementations deliver
/// completions by posting handlers (or deferred operation completions) to
/// the dispatcher passed in.
pub trait PollTask: Send + Sync {
    /// Drive one poll cycle.
    ///
    /// When `block` is true the task may sleep until a completion is
    /// available or `interrupt` is called; when false it must return
    /// promptly after draining ready completions.
    fn run(&self, block: bool, dispatcher: &Dispatcher);

    /// Unblock a currently blocking `run`. Idempotent; safe from any thread.
    fn interrupt(&self);
}

/// Polling task that performs no I/O. A blocking cycle simply parks until
/// interrupted, which keeps a pure executor's wakeup protocol identical to
/// the I/O-backed one.
pub struct NullTask {
    unblock: WakeupEvent,
}

impl NullTask {
    pub fn new() -> Self {
        NullTask {
            unblock: WakeupEvent::new(),
        }
    }
}

impl Default for NullTask {
    fn default() -> Self {
        Self::new()
    }
}

impl PollTask for NullTask {
    fn run(&self, block: bool, _dispatcher: &Dispatcher) {
        if block {
            self.unblock.wait();
            self.unblock.clear();
        }
    }

    fn interrupt(&self) {
        self.unblock.signal();
    }
}
