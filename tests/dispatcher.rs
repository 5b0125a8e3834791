//! Dispatcher loop behavior: delivery, ordering, interruption, recovery.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use dispio::Dispatcher;

#[test]
fn single_post_runs_once_and_returns() {
    let dispatcher = Dispatcher::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();
    dispatcher.post(move || {
        calls2.fetch_add(1, Ordering::SeqCst);
    });
    let handlers_run = dispatcher.run();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(handlers_run, 1);
}

#[test]
fn three_posts_deliver_in_fifo_order() {
    let dispatcher = Dispatcher::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    for name in ["a", "b", "c"] {
        let log = log.clone();
        dispatcher.post(move || log.lock().push(name));
    }
    dispatcher.run();
    assert_eq!(*log.lock(), vec!["a", "b", "c"]);
}

#[test]
fn dispatch_inside_handler_runs_synchronously_before_posts() {
    let dispatcher = Arc::new(Dispatcher::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let d = dispatcher.clone();
    let outer_log = log.clone();
    dispatcher.post(move || {
        outer_log.lock().push("a");
        let x_log = outer_log.clone();
        d.dispatch(move || x_log.lock().push("x"));
        // The synchronous dispatch already ran on this thread.
        assert_eq!(outer_log.lock().last(), Some(&"x"));
        let y_log = outer_log.clone();
        d.post(move || y_log.lock().push("y"));
    });

    dispatcher.run();
    assert_eq!(*log.lock(), vec!["a", "x", "y"]);
}

#[test]
fn interrupt_wakes_parked_worker_and_reset_resumes() {
    let dispatcher = Arc::new(Dispatcher::new());
    // Anchor keeps the worker parked rather than exiting on empty work.
    dispatcher.work_started();

    let worker = {
        let dispatcher = dispatcher.clone();
        thread::spawn(move || dispatcher.run())
    };
    thread::sleep(Duration::from_millis(50));
    dispatcher.interrupt();
    assert_eq!(worker.join().unwrap(), 0);

    // After reset, delivery resumes normally.
    dispatcher.reset();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();
    dispatcher.post(move || {
        calls2.fetch_add(1, Ordering::SeqCst);
    });
    dispatcher.work_finished();
    assert_eq!(dispatcher.run(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn interrupt_then_run_returns_without_delivering() {
    let dispatcher = Dispatcher::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();
    dispatcher.post(move || {
        calls2.fetch_add(1, Ordering::SeqCst);
    });
    dispatcher.interrupt();
    assert_eq!(dispatcher.run(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    dispatcher.reset();
    assert_eq!(dispatcher.run(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn interrupt_wakes_every_parked_worker() {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.work_started();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || dispatcher.run())
        })
        .collect();
    thread::sleep(Duration::from_millis(100));
    dispatcher.interrupt();
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn concurrent_posts_deliver_exactly_once_across_workers() {
    const POSTERS: usize = 3;
    const PER_POSTER: usize = 50;

    let dispatcher = Arc::new(Dispatcher::new());
    let delivered: Arc<Vec<AtomicUsize>> = Arc::new(
        (0..POSTERS * PER_POSTER)
            .map(|_| AtomicUsize::new(0))
            .collect(),
    );

    // Anchor so workers outlive the posting phase.
    dispatcher.work_started();
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || dispatcher.run())
        })
        .collect();

    let posters: Vec<_> = (0..POSTERS)
        .map(|p| {
            let dispatcher = dispatcher.clone();
            let delivered = delivered.clone();
            thread::spawn(move || {
                for i in 0..PER_POSTER {
                    let delivered = delivered.clone();
                    let index = p * PER_POSTER + i;
                    dispatcher.post(move || {
                        delivered[index].fetch_add(1, Ordering::SeqCst);
                    });
                }
            })
        })
        .collect();
    for poster in posters {
        poster.join().unwrap();
    }

    dispatcher.work_finished();
    let total: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();

    assert_eq!(total, POSTERS * PER_POSTER);
    for slot in delivered.iter() {
        assert_eq!(slot.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn handler_posted_from_handler_is_delivered() {
    let dispatcher = Arc::new(Dispatcher::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let d = dispatcher.clone();
    let outer_log = log.clone();
    dispatcher.post(move || {
        outer_log.lock().push("outer");
        let inner_log = outer_log.clone();
        d.post(move || inner_log.lock().push("inner"));
    });

    assert_eq!(dispatcher.run(), 2);
    assert_eq!(*log.lock(), vec!["outer", "inner"]);
}

#[test]
fn panic_in_handler_propagates_and_loop_recovers() {
    let dispatcher = Dispatcher::new();
    let calls = Arc::new(AtomicUsize::new(0));

    dispatcher.post(|| panic!("handler failure"));
    let calls2 = calls.clone();
    dispatcher.post(move || {
        calls2.fetch_add(1, Ordering::SeqCst);
    });

    let result = catch_unwind(AssertUnwindSafe(|| dispatcher.run()));
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Queue and counter invariants survived; a fresh run drains the rest.
    assert_eq!(dispatcher.run(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn work_anchor_keeps_run_alive_until_finished() {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.work_started();

    let worker = {
        let dispatcher = dispatcher.clone();
        thread::spawn(move || dispatcher.run())
    };

    let calls = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let calls = calls.clone();
        dispatcher.post(move || {
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }
    // Give the worker time to drain, then release the anchor.
    thread::sleep(Duration::from_millis(50));
    dispatcher.work_finished();
    assert_eq!(worker.join().unwrap(), 8);
    assert_eq!(calls.load(Ordering::SeqCst), 8);
}
