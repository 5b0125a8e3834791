//! The reference completion operation: asynchronous accept.
//!
//! The operation owns a pre-opened socket for the incoming connection, the
//! platform's address output buffer, and the user handler. Transient aborts
//! are retried transparently unless the caller opted into seeing them, and
//! a failed attempt never reuses its socket: the platform forbids accepting
//! into a socket a failed accept already touched.

use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::op::{OpBox, Operation, PendingOp, PerformOutcome, upcall_fence};
use crate::reactor::Reactor;
use crate::socket::{self, Endpoint, EndpointSlot, OwnedSocket, PeerSlot};

/// Room reserved per address in the accept output buffer.
pub const ACCEPT_ADDR_LEN: usize = mem::size_of::<libc::sockaddr_storage>() + 16;

/// Output buffer an accept primitive writes addresses into: local half first,
/// peer half second, with the peer length reported by the platform.
pub struct AcceptOutput {
    buf: [u8; 2 * ACCEPT_ADDR_LEN],
    peer_len: usize,
}

impl AcceptOutput {
    pub fn new() -> AcceptOutput {
        AcceptOutput {
            buf: [0u8; 2 * ACCEPT_ADDR_LEN],
            peer_len: 0,
        }
    }

    pub fn reset(&mut self) {
        self.peer_len = 0;
    }

    /// Record the peer address, as the platform's accept primitive does.
    pub fn set_peer(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(ACCEPT_ADDR_LEN);
        self.buf[ACCEPT_ADDR_LEN..ACCEPT_ADDR_LEN + len].copy_from_slice(&bytes[..len]);
        self.peer_len = bytes.len();
    }

    /// Override the reported peer length without touching the bytes.
    pub fn set_peer_len(&mut self, len: usize) {
        self.peer_len = len;
    }

    /// Peer address length as reported by the platform. May exceed what the
    /// buffer can actually hold; consumers must bounds-check.
    pub fn peer_len(&self) -> usize {
        self.peer_len
    }

    pub fn peer_bytes(&self) -> &[u8] {
        let len = self.peer_len.min(ACCEPT_ADDR_LEN);
        &self.buf[ACCEPT_ADDR_LEN..ACCEPT_ADDR_LEN + len]
    }
}

impl Default for AcceptOutput {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of issuing the platform accept primitive.
pub enum AcceptStart {
    /// The primitive finished synchronously with this code (0 = success).
    Complete(i32),
    /// The primitive was queued; a completion will be delivered later.
    Pending,
}

/// Platform primitives behind the accept operation.
///
/// Implementations speak raw platform codes at this boundary; the operation
/// canonicalizes them before the upcall.
pub trait AcceptSockets: Clone + Send + Sync + 'static {
    /// Code the platform reports when the network name behind a queued
    /// accept disappears. Rewritten to the canonical aborted error.
    const NETNAME_DELETED: i32;
    /// Code for a connection aborted before the accept could deliver it.
    const CONNECTION_ABORTED: i32;

    /// Open a fresh socket suitable for accepting the next connection.
    fn open_socket(&self) -> Result<OwnedSocket, i32>;

    /// Issue the accept primitive for `listener`, accepting into
    /// `new_socket` and writing the peer address into `out`.
    fn start_accept(
        &self,
        listener: RawFd,
        new_socket: &mut Option<OwnedSocket>,
        out: &mut AcceptOutput,
    ) -> AcceptStart;

    /// Apply the option that makes name queries work on the accepted socket.
    fn update_accept_context(&self, listener: RawFd, accepted: &OwnedSocket) -> Result<(), i32>;

    /// Hold a queued operation until the platform reports it ready.
    fn register_pending(&self, listener: RawFd, op: PendingOp);

    /// Canonicalize a nonzero platform code.
    fn map_error(code: i32) -> Error {
        if code == Self::CONNECTION_ABORTED {
            Error::ConnectionAborted
        } else if code == libc::EINVAL {
            Error::InvalidArgument
        } else {
            Error::Io(io::Error::from_raw_os_error(code))
        }
    }
}

#[repr(C)]
struct AcceptOp<P: AcceptSockets, F> {
    base: Operation,
    sockets: P,
    listener: RawFd,
    new_socket: Option<OwnedSocket>,
    output: AcceptOutput,
    peer: PeerSlot,
    peer_endpoint: Option<EndpointSlot>,
    enable_connection_aborted: bool,
    handler: F,
}

impl<P, F> AcceptOp<P, F>
where
    P: AcceptSockets,
    F: FnOnce(Result<(), Error>) + Send + 'static,
{
    unsafe fn do_complete(
        owner: Option<&Dispatcher>,
        base: *mut Operation,
        err: i32,
        _bytes: usize,
    ) {
        // Take ownership of the operation storage.
        let mut op = unsafe { OpBox::from_raw(base as *mut AcceptOp<P, F>) };
        let mut err = err;
        let mut error: Option<Error> = None;
        let mut peer_endpoint = Endpoint::new();

        if let Some(dispatcher) = owner {
            // The platform reports a deleted network name for connections
            // torn down while queued; canonically that is an abort.
            if err == P::NETNAME_DELETED {
                err = P::CONNECTION_ABORTED;
            }

            // Restart the accept if the connection was aborted and the
            // caller did not ask to see aborts.
            if err == P::CONNECTION_ABORTED && !op.enable_connection_aborted {
                op.base.overlapped.reset();

                // A failed accept poisons its socket; open a fresh one for
                // the next connection.
                op.new_socket = None;
                match op.sockets.open_socket() {
                    Ok(socket) => {
                        op.new_socket = Some(socket);
                        let outcome = {
                            let AcceptOp {
                                sockets,
                                listener,
                                new_socket,
                                output,
                                ..
                            } = &mut *op;
                            sockets.start_accept(*listener, new_socket, output)
                        };
                        match outcome {
                            AcceptStart::Complete(code)
                                if code == P::NETNAME_DELETED
                                    || code == P::CONNECTION_ABORTED =>
                            {
                                // Transient again: requeue so the decision
                                // table runs against the fresh completion.
                                dispatcher.work_started();
                                let pending = unsafe {
                                    PendingOp::from_raw(op.release() as *mut Operation)
                                };
                                dispatcher.post_completion(pending, code, 0);
                                return;
                            }
                            AcceptStart::Complete(code) => {
                                // Finished synchronously; finalize with the
                                // new outcome.
                                err = code;
                            }
                            AcceptStart::Pending => {
                                dispatcher.work_started();
                                let sockets = op.sockets.clone();
                                let listener = op.listener;
                                let pending = unsafe {
                                    PendingOp::from_raw(op.release() as *mut Operation)
                                };
                                sockets.register_pending(listener, pending);
                                return;
                            }
                        }
                    }
                    Err(code) => {
                        err = code;
                    }
                }
            }

            error = if err == 0 { None } else { Some(P::map_error(err)) };

            // Pull the peer address out of the output buffer.
            if error.is_none() {
                if op.output.peer_len() > Endpoint::capacity() {
                    error = Some(Error::InvalidArgument);
                } else {
                    peer_endpoint.assign(op.output.peer_bytes());
                }
            }

            // Make name queries work on the accepted socket.
            if error.is_none() {
                let AcceptOp {
                    sockets,
                    listener,
                    new_socket,
                    ..
                } = &mut *op;
                if let Some(socket) = new_socket.as_ref()
                    && let Err(code) = sockets.update_accept_context(*listener, socket)
                {
                    error = Some(P::map_error(code));
                }
            }

            // Transfer the connected socket into the peer slot.
            if error.is_none()
                && let Some(socket) = op.new_socket.take()
            {
                *op.peer.lock() = Some(socket);
            }

            // Pass the endpoint back to the caller if asked for.
            if let Some(slot) = &op.peer_endpoint {
                *slot.lock() = Some(peer_endpoint.clone());
            }
        }

        // Move the handler out and free the operation storage before the
        // upcall; the handler may start another operation from the same
        // allocation class. Resources owned by the operation are released
        // before the upcall too.
        let AcceptOp {
            sockets,
            new_socket,
            peer,
            peer_endpoint,
            handler,
            ..
        } = op.take();
        drop((sockets, new_socket, peer, peer_endpoint));
        upcall_fence();

        if owner.is_some() {
            handler(match error {
                None => Ok(()),
                Some(e) => Err(e),
            });
        }
    }

    unsafe fn do_perform(base: *mut Operation) -> PerformOutcome {
        let op = unsafe { &mut *(base as *mut AcceptOp<P, F>) };
        let AcceptOp {
            sockets,
            listener,
            new_socket,
            output,
            ..
        } = op;
        match sockets.start_accept(*listener, new_socket, output) {
            AcceptStart::Complete(code) => PerformOutcome::Complete { err: code, bytes: 0 },
            AcceptStart::Pending => PerformOutcome::Again,
        }
    }
}

/// Begin an asynchronous accept on `listener`.
///
/// On completion the accepted socket is transferred into `peer`, the peer
/// address is copied into `peer_endpoint` if provided, and `handler` is
/// upcalled exactly once with the canonical outcome. With
/// `enable_connection_aborted` false, aborted connections are retried
/// transparently and the handler never observes them.
pub fn start_accept<P, F>(
    dispatcher: &Dispatcher,
    sockets: P,
    listener: RawFd,
    peer: PeerSlot,
    peer_endpoint: Option<EndpointSlot>,
    enable_connection_aborted: bool,
    handler: F,
) -> Result<(), Error>
where
    P: AcceptSockets,
    F: FnOnce(Result<(), Error>) + Send + 'static,
{
    let socket = sockets.open_socket().map_err(P::map_error)?;

    let mut op = OpBox::new(AcceptOp {
        base: Operation::new(
            AcceptOp::<P, F>::do_complete,
            Some(AcceptOp::<P, F>::do_perform),
        ),
        sockets,
        listener,
        new_socket: Some(socket),
        output: AcceptOutput::new(),
        peer,
        peer_endpoint,
        enable_connection_aborted,
        handler,
    });

    dispatcher.work_started();

    let outcome = {
        let AcceptOp {
            sockets,
            listener,
            new_socket,
            output,
            ..
        } = &mut *op;
        sockets.start_accept(*listener, new_socket, output)
    };
    match outcome {
        AcceptStart::Complete(code) => {
            // Deliver through the queue so the completion runs on a worker.
            let pending = unsafe { PendingOp::from_raw(op.release() as *mut Operation) };
            dispatcher.post_completion(pending, code, 0);
        }
        AcceptStart::Pending => {
            let sockets = op.sockets.clone();
            let listener = op.listener;
            let pending = unsafe { PendingOp::from_raw(op.release() as *mut Operation) };
            sockets.register_pending(listener, pending);
        }
    }
    Ok(())
}

/// Accept primitives over non-blocking `accept4`, pending operations parked
/// on a [`Reactor`].
///
/// The start primitive completes synchronously when a connection is already
/// queued and reports would-complete-asynchronously otherwise. An aborted
/// in-queue connection surfaces as `ECONNABORTED`; a reset of the underlying
/// network maps to the name-deleted code.
#[derive(Clone)]
pub struct SysAccept {
    // Weak: parked operations own a SysAccept, and the reactor's pending
    // table owns the operations. A strong reference here would cycle.
    reactor: Weak<Reactor>,
    family: libc::c_int,
}

impl SysAccept {
    pub fn new(reactor: Arc<Reactor>, listener: RawFd) -> Result<SysAccept, Error> {
        Ok(SysAccept {
            reactor: Arc::downgrade(&reactor),
            family: socket::socket_family(listener)?,
        })
    }
}

impl AcceptSockets for SysAccept {
    const NETNAME_DELETED: i32 = libc::ENETRESET;
    const CONNECTION_ABORTED: i32 = libc::ECONNABORTED;

    fn open_socket(&self) -> Result<OwnedSocket, i32> {
        socket::stream_socket(self.family).map_err(|e| match e {
            Error::Io(io) => io.raw_os_error().unwrap_or(libc::EINVAL),
            _ => libc::EINVAL,
        })
    }

    fn start_accept(
        &self,
        listener: RawFd,
        new_socket: &mut Option<OwnedSocket>,
        out: &mut AcceptOutput,
    ) -> AcceptStart {
        out.reset();
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                listener,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd >= 0 {
            // The accepted descriptor replaces the pre-opened socket.
            *new_socket = Some(unsafe { OwnedSocket::from_raw(fd) });
            let bytes = unsafe {
                std::slice::from_raw_parts(&storage as *const _ as *const u8, len as usize)
            };
            out.set_peer(bytes);
            AcceptStart::Complete(0)
        } else {
            let code = io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EINVAL);
            if code == libc::EAGAIN {
                AcceptStart::Pending
            } else {
                AcceptStart::Complete(code)
            }
        }
    }

    fn update_accept_context(&self, _listener: RawFd, _accepted: &OwnedSocket) -> Result<(), i32> {
        // accept4 sockets answer name queries without further setup.
        Ok(())
    }

    fn register_pending(&self, listener: RawFd, op: PendingOp) {
        match self.reactor.upgrade() {
            Some(reactor) => reactor.register_pending(listener, op),
            // Reactor already torn down; dropping the operation releases
            // its storage without an upcall.
            None => drop(op),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_records_peer() {
        let mut out = AcceptOutput::new();
        out.set_peer(&[1, 2, 3, 4]);
        assert_eq!(out.peer_len(), 4);
        assert_eq!(out.peer_bytes(), &[1u8, 2, 3, 4][..]);
        out.reset();
        assert_eq!(out.peer_len(), 0);
        assert!(out.peer_bytes().is_empty());
    }

    #[test]
    fn test_output_clamps_oversized_reads() {
        let mut out = AcceptOutput::new();
        out.set_peer(&[7u8; 8]);
        out.set_peer_len(usize::MAX);
        assert_eq!(out.peer_len(), usize::MAX);
        // Reported length is the platform's claim; reads stay in bounds.
        assert_eq!(out.peer_bytes().len(), ACCEPT_ADDR_LEN);
    }

    #[test]
    fn test_output_exceeds_endpoint_capacity_detectable() {
        let mut out = AcceptOutput::new();
        out.set_peer(&[0u8; 4]);
        out.set_peer_len(Endpoint::capacity() + 1);
        assert!(out.peer_len() > Endpoint::capacity());
    }
}
