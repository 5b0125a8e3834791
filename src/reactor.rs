//! Readiness-driven polling task built on mio.
//!
//! Pending operations park in a slab keyed by their poll token. A readiness
//! report retries the operation's platform primitive; finished operations
//! are handed to the dispatcher as deferred completions. The waker makes a
//! blocking cycle interruptible from any thread.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::op::{PendingOp, PerformOutcome};
use crate::task::PollTask;

const WAKER: Token = Token(usize::MAX);

struct Pending {
    fd: RawFd,
    op: PendingOp,
}

struct PendingTable {
    ops: Slab<Pending>,
    /// Operations whose registration failed; their completions are delivered
    /// on the next poll cycle.
    failed: Vec<(PendingOp, i32)>,
}

struct PollState {
    poll: Poll,
    events: Events,
}

/// Polling task that parks operations until their descriptors are ready.
pub struct Reactor {
    registry: Registry,
    waker: Waker,
    poll: Mutex<PollState>,
    pending: Mutex<PendingTable>,
}

impl Reactor {
    pub fn new() -> Result<Reactor, Error> {
        let poll = Poll::new().map_err(|e| Error::ReactorSetup(format!("poll: {e}")))?;
        let registry = poll
            .registry()
            .try_clone()
            .map_err(|e| Error::ReactorSetup(format!("registry: {e}")))?;
        let waker =
            Waker::new(poll.registry(), WAKER).map_err(|e| Error::ReactorSetup(format!("waker: {e}")))?;
        Ok(Reactor {
            registry,
            waker,
            poll: Mutex::new(PollState {
                poll,
                events: Events::with_capacity(256),
            }),
            pending: Mutex::new(PendingTable {
                ops: Slab::new(),
                failed: Vec::new(),
            }),
        })
    }

    /// Park an operation until `fd` reports readable. Safe to call from any
    /// thread, including while another worker is blocked in a poll cycle.
    pub(crate) fn register_pending(&self, fd: RawFd, op: PendingOp) {
        let mut table = self.pending.lock();
        let key = table.ops.vacant_entry().key();
        let token = Token(key);
        let registered = match self.registry.register(&mut SourceFd(&fd), token, Interest::READABLE)
        {
            Ok(()) => Ok(()),
            // Another operation already watches this descriptor; point the
            // registration at the newest one. The displaced operation is
            // re-armed when this one completes.
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                self.registry
                    .reregister(&mut SourceFd(&fd), token, Interest::READABLE)
            }
            Err(e) => Err(e),
        };
        match registered {
            Ok(()) => {
                table.ops.insert(Pending { fd, op });
                debug!(fd, token = key, "operation parked");
            }
            Err(e) => {
                warn!(fd, error = %e, "registration failed");
                let code = e.raw_os_error().unwrap_or(libc::EINVAL);
                table.failed.push((op, code));
                drop(table);
                // Unblock the poller so the failure is delivered promptly.
                let _ = self.waker.wake();
            }
        }
    }

    fn drive_ready(&self, key: usize, dispatcher: &Dispatcher) {
        let mut table = self.pending.lock();
        let outcome = match table.ops.get_mut(key) {
            Some(pending) => pending.op.perform(),
            None => return,
        };
        match outcome {
            PerformOutcome::Complete { err, bytes } => {
                let pending = table.ops.remove(key);
                let _ = self.registry.deregister(&mut SourceFd(&pending.fd));
                // Hand the descriptor to the next parked operation, if any.
                let next = table
                    .ops
                    .iter()
                    .find(|(_, other)| other.fd == pending.fd)
                    .map(|(next_key, _)| next_key);
                if let Some(next_key) = next {
                    let _ = self.registry.register(
                        &mut SourceFd(&pending.fd),
                        Token(next_key),
                        Interest::READABLE,
                    );
                }
                drop(table);
                dispatcher.post_completion(pending.op, err, bytes);
            }
            PerformOutcome::Again => {
                let fd = table.ops[key].fd;
                let _ = self
                    .registry
                    .reregister(&mut SourceFd(&fd), Token(key), Interest::READABLE);
            }
        }
    }
}

impl PollTask for Reactor {
    fn run(&self, block: bool, dispatcher: &Dispatcher) {
        // Deliver completions for registrations that failed.
        let failed: Vec<_> = std::mem::take(&mut self.pending.lock().failed);
        for (op, code) in failed {
            dispatcher.post_completion(op, code, 0);
        }

        let mut state = self.poll.lock();
        let timeout = if block { None } else { Some(Duration::ZERO) };
        let PollState { poll, events } = &mut *state;
        if let Err(e) = poll.poll(events, timeout) {
            if e.kind() != io::ErrorKind::Interrupted {
                warn!(error = %e, "poll failed");
            }
            return;
        }
        let ready: Vec<usize> = events
            .iter()
            .filter(|event| event.token() != WAKER)
            .map(|event| event.token().0)
            .collect();
        drop(state);

        for key in ready {
            self.drive_ready(key, dispatcher);
        }
    }

    fn interrupt(&self) {
        let _ = self.waker.wake();
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        // Free parked operations without making upcalls.
        let table = self.pending.get_mut();
        for pending in table.ops.drain() {
            pending.op.complete(None, 0, 0);
        }
        for (op, _) in table.failed.drain(..) {
            op.complete(None, 0, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_reactor_nonblocking_cycle_is_prompt() {
        let reactor = Reactor::new().unwrap();
        let dispatcher = Dispatcher::new();
        reactor.run(false, &dispatcher);
    }

    #[test]
    fn test_interrupt_unblocks_blocking_cycle() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let interruptor = reactor.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            interruptor.interrupt();
        });
        let dispatcher = Dispatcher::new();
        reactor.run(true, &dispatcher);
        handle.join().unwrap();
    }
}
