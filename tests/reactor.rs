//! End-to-end: a real listener, a reactor-driven accept, a worker pool.

use std::net::TcpStream;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use dispio::{
    Config, Dispatcher, EndpointSlot, PeerSlot, Reactor, SysAccept, WorkerConfig, socket,
    start_accept,
};

fn pool_config(threads: usize) -> Config {
    Config {
        worker: WorkerConfig {
            threads,
            ..Default::default()
        },
    }
}

#[test]
fn accept_completes_against_live_listener() {
    let reactor = Arc::new(Reactor::new().unwrap());
    let dispatcher = Arc::new(Dispatcher::with_task(reactor.clone()));

    let listener = socket::create_listener("127.0.0.1:0", 128).unwrap();
    let addr = socket::local_addr(listener.as_raw()).unwrap();
    let sockets = SysAccept::new(reactor.clone(), listener.as_raw()).unwrap();

    let peer: PeerSlot = Arc::new(Mutex::new(None));
    let endpoint: EndpointSlot = Arc::new(Mutex::new(None));
    let (tx, rx) = mpsc::channel();

    start_accept(
        &dispatcher,
        sockets,
        listener.as_raw(),
        peer.clone(),
        Some(endpoint.clone()),
        false,
        move |result| {
            tx.send(result.map_err(|e| e.to_string())).unwrap();
        },
    )
    .unwrap();

    let pool = dispio::launch(pool_config(2), dispatcher.clone()).unwrap();

    // Connect after the workers are polling.
    let client = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        TcpStream::connect(addr).unwrap()
    });

    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(outcome, Ok(()));

    let accepted = peer.lock().take().expect("peer socket transferred");
    assert!(accepted.as_raw() >= 0);

    let stream = client.join().unwrap();
    let client_addr = stream.local_addr().unwrap();
    let reported = endpoint.lock().as_ref().unwrap().to_socket_addr().unwrap();
    assert_eq!(reported, client_addr);

    // The accept was the only outstanding work, so the pool drains on its own.
    pool.join().unwrap();
}

#[test]
fn chained_accepts_reuse_the_listener() {
    const CONNECTIONS: usize = 3;

    let reactor = Arc::new(Reactor::new().unwrap());
    let dispatcher = Arc::new(Dispatcher::with_task(reactor.clone()));

    let listener = socket::create_listener("127.0.0.1:0", 128).unwrap();
    let addr = socket::local_addr(listener.as_raw()).unwrap();
    let listener_fd = listener.as_raw();

    let (tx, rx) = mpsc::channel();

    // Each completion chains the next accept until enough have landed.
    fn accept_next(
        dispatcher: &Arc<Dispatcher>,
        reactor: &Arc<Reactor>,
        listener_fd: i32,
        remaining: usize,
        tx: mpsc::Sender<()>,
    ) {
        let sockets = SysAccept::new(reactor.clone(), listener_fd).unwrap();
        let peer: PeerSlot = Arc::new(Mutex::new(None));
        let dispatcher2 = dispatcher.clone();
        let reactor2 = reactor.clone();
        start_accept(
            dispatcher,
            sockets,
            listener_fd,
            peer,
            None,
            false,
            move |result| {
                result.unwrap();
                tx.send(()).unwrap();
                if remaining > 1 {
                    accept_next(&dispatcher2, &reactor2, listener_fd, remaining - 1, tx);
                }
            },
        )
        .unwrap();
    }

    accept_next(&dispatcher, &reactor, listener_fd, CONNECTIONS, tx);

    let pool = dispio::launch(pool_config(2), dispatcher.clone()).unwrap();

    let clients = thread::spawn(move || {
        let mut streams = Vec::new();
        for _ in 0..CONNECTIONS {
            streams.push(TcpStream::connect(addr).unwrap());
            thread::sleep(Duration::from_millis(10));
        }
        streams
    });

    for _ in 0..CONNECTIONS {
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
    drop(clients.join().unwrap());
    pool.join().unwrap();
}

#[test]
fn interrupt_tears_down_idle_pool() {
    let reactor = Arc::new(Reactor::new().unwrap());
    let dispatcher = Arc::new(Dispatcher::with_task(reactor.clone()));

    // Keep the pool alive with no I/O at all.
    dispatcher.work_started();
    let pool = dispio::launch(pool_config(2), dispatcher.clone()).unwrap();
    thread::sleep(Duration::from_millis(50));
    pool.interrupt();
    pool.join().unwrap();
}
