//! dispio — a multi-threaded, handler-dispatching event loop coupled to a
//! pluggable I/O polling task.
//!
//! Handlers posted from any thread run on threads that call
//! [`Dispatcher::run`]. The dispatcher tracks outstanding asynchronous
//! operations, schedules a [`PollTask`] through a sentinel queue entry, and
//! terminates cleanly when work is exhausted or it is interrupted. The
//! completion operation protocol ([`op`], [`accept`]) defines how kernel
//! requests are posted, completed, transparently retried, and finally
//! upcalled.

pub mod accept;
pub mod alloc;
mod call_stack;
pub mod config;
pub mod dispatcher;
pub mod error;
mod event;
mod handler;
pub mod op;
pub mod pool;
pub mod reactor;
pub mod socket;
pub mod task;

// Public API re-exports
pub use accept::{ACCEPT_ADDR_LEN, AcceptOutput, AcceptSockets, AcceptStart, SysAccept, start_accept};
pub use alloc::{CachedSlab, OpAlloc};
pub use config::{Config, WorkerConfig};
pub use dispatcher::Dispatcher;
pub use error::Error;
pub use op::{CompleteFn, OpBox, Operation, PendingOp, PerformFn, PerformOutcome};
pub use pool::{Pool, PoolBuilder, launch};
pub use reactor::Reactor;
pub use socket::{Endpoint, EndpointSlot, OwnedSocket, PeerSlot};
pub use task::{NullTask, PollTask};
