//! Accept-loop demo: park accepts on the reactor, greet each peer, chain
//! the next accept from inside the completion handler.
//!
//! Run with `cargo run --example acceptor`, then connect with
//! `nc 127.0.0.1 9090`.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info};

use dispio::{
    Config, Dispatcher, EndpointSlot, PeerSlot, Reactor, SysAccept, socket, start_accept,
};

fn accept_loop(dispatcher: &Arc<Dispatcher>, reactor: &Arc<Reactor>, listener_fd: i32) {
    let sockets = match SysAccept::new(reactor.clone(), listener_fd) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "accept setup failed");
            return;
        }
    };
    let peer: PeerSlot = Arc::new(Mutex::new(None));
    let endpoint: EndpointSlot = Arc::new(Mutex::new(None));

    let dispatcher2 = dispatcher.clone();
    let reactor2 = reactor.clone();
    let peer2 = peer.clone();
    let endpoint2 = endpoint.clone();
    let result = start_accept(
        dispatcher,
        sockets,
        listener_fd,
        peer,
        Some(endpoint),
        false,
        move |result| {
            match result {
                Ok(()) => {
                    let addr = endpoint2.lock().as_ref().and_then(|e| e.to_socket_addr());
                    info!(peer = ?addr, "accepted");
                    if let Some(socket) = peer2.lock().take() {
                        let greeting = b"hello from dispio\n";
                        unsafe {
                            libc::write(
                                socket.as_raw(),
                                greeting.as_ptr() as *const libc::c_void,
                                greeting.len(),
                            );
                        }
                    }
                }
                Err(e) => error!(error = %e, "accept failed"),
            }
            accept_loop(&dispatcher2, &reactor2, listener_fd);
        },
    );
    if let Err(e) = result {
        error!(error = %e, "accept initiation failed");
    }
}

fn main() -> Result<(), dispio::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let reactor = Arc::new(Reactor::new()?);
    let dispatcher = Arc::new(Dispatcher::with_task(reactor.clone()));

    let listener = socket::create_listener("127.0.0.1:9090", 1024)?;
    info!(addr = %socket::local_addr(listener.as_raw())?, "listening");

    accept_loop(&dispatcher, &reactor, listener.as_raw());

    let pool = dispio::launch(Config::default(), dispatcher.clone())?;
    pool.join()?;
    Ok(())
}
