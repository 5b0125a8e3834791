use parking_lot::{Condvar, Mutex};

/// One-shot signalable event used to park an idle worker.
///
/// A signal is sticky until the owner calls `clear`. The owner clears the
/// event before releasing the dispatcher mutex and waits after; a signal
/// delivered in between is therefore never lost.
pub(crate) struct WakeupEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl WakeupEvent {
    pub(crate) fn new() -> Self {
        WakeupEvent {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Signal the event. Safe from any thread; idempotent until cleared.
    pub(crate) fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_one();
    }

    /// Reset the event to the unsignaled state.
    pub(crate) fn clear(&self) {
        *self.signaled.lock() = false;
    }

    /// Block until the event is signaled. Does not clear the signal.
    pub(crate) fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
    }
}
