//! The dispatcher core: a mutex-guarded handler FIFO, a ring of parked
//! workers, an outstanding-work counter, and a polling task scheduled
//! through a sentinel queue entry.
//!
//! Every shared field lives behind one mutex. Handlers run with the mutex
//! released; drop guards restore the queue and counter invariants on every
//! exit path, including panics, so a subsequent `run` on the same
//! dispatcher is always well-defined.

use std::ptr::{self, NonNull};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::call_stack;
use crate::event::WakeupEvent;
use crate::handler::{self, HandlerHeader};
use crate::op::PendingOp;
use crate::task::{NullTask, PollTask};

/// Per-worker parking record. Lives on the worker's stack for the duration
/// of `run`; linked into the idle ring only while the worker is parked.
struct IdleWorker {
    wakeup: WakeupEvent,
    prev: *mut IdleWorker,
    next: *mut IdleWorker,
}

struct Inner {
    /// Head of the handler FIFO. Null iff the queue is empty.
    queue_head: *mut HandlerHeader,
    /// Tail of the handler FIFO. Null iff the queue is empty.
    queue_tail: *mut HandlerHeader,
    /// Undelivered handlers plus externally anchored in-flight operations.
    outstanding_work: usize,
    /// Sticky until `reset`.
    interrupted: bool,
    /// Some member of the circular idle-worker ring, or null.
    first_idle: *mut IdleWorker,
}

// Queue nodes and ring nodes are only touched under the dispatcher mutex;
// the node payloads themselves are Send closures.
unsafe impl Send for Inner {}

/// Work queue and thread pool coordinator.
///
/// Accepts ready-to-run handlers from any thread and runs them on threads
/// that call [`run`](Dispatcher::run). Tracks outstanding asynchronous
/// operations, drives a pluggable [`PollTask`], and terminates when work is
/// exhausted or [`interrupt`](Dispatcher::interrupt) is called.
pub struct Dispatcher {
    inner: Mutex<Inner>,
    task: Arc<dyn PollTask>,
    /// Queue entry representing the polling task's position. A bare header
    /// with a null invoker, identified by address; in the queue at most once.
    sentinel: NonNull<HandlerHeader>,
}

unsafe impl Send for Dispatcher {}
unsafe impl Sync for Dispatcher {}

impl Dispatcher {
    /// Create a dispatcher backed by a [`NullTask`]: a pure executor.
    pub fn new() -> Dispatcher {
        Self::with_task(Arc::new(NullTask::new()))
    }

    /// Create a dispatcher driving the given polling task.
    pub fn with_task(task: Arc<dyn PollTask>) -> Dispatcher {
        let sentinel = Box::into_raw(Box::new(HandlerHeader {
            next: ptr::null_mut(),
            invoke: None,
        }));
        Dispatcher {
            inner: Mutex::new(Inner {
                // The queue starts with the sentinel linked so the first
                // worker in drives the polling task.
                queue_head: sentinel,
                queue_tail: sentinel,
                outstanding_work: 0,
                interrupted: false,
                first_idle: ptr::null_mut(),
            }),
            task,
            sentinel: NonNull::new(sentinel).unwrap(),
        }
    }

    /// Identity used by the thread-local re-entry marker.
    fn id(&self) -> usize {
        self.sentinel.as_ptr() as usize
    }

    /// Enqueue `f` at the tail and wake exactly one consumer. Never blocks.
    pub fn post<F: FnOnce() + Send + 'static>(&self, f: F) {
        let node = handler::alloc_handler(f);
        self.enqueue(node, true);
    }

    /// Run `f` synchronously if the calling thread is already inside this
    /// dispatcher's `run`; otherwise behave as [`post`](Dispatcher::post).
    ///
    /// The synchronous path bypasses the queue, so ordering relative to
    /// other posted handlers is lost by design.
    pub fn dispatch<F: FnOnce() + Send + 'static>(&self, f: F) {
        if call_stack::contains(self.id()) {
            f();
        } else {
            self.post(f);
        }
    }

    /// Enqueue a completed operation whose outstanding-work contribution was
    /// already counted by [`work_started`](Dispatcher::work_started). Wakes
    /// one consumer like `post` but does not touch the counter: the queue
    /// slot inherits the operation's count and invocation consumes it.
    pub fn post_completion(&self, op: PendingOp, err: i32, bytes: usize) {
        let node = op.into_queued(err, bytes);
        self.enqueue(node, false);
    }

    fn enqueue(&self, node: *mut HandlerHeader, count_work: bool) {
        let mut inner = self.inner.lock();
        unsafe {
            (*node).next = ptr::null_mut();
        }
        Self::push_back(&mut inner, node);
        if count_work {
            inner.outstanding_work += 1;
        }
        // Wake exactly one consumer: an idle worker if any, otherwise the
        // polling task if a worker is currently off running it.
        if !Self::wake_one_idle(&mut inner) && !self.task_in_queue(&inner) {
            self.task.interrupt();
        }
    }

    fn push_back(inner: &mut Inner, node: *mut HandlerHeader) {
        unsafe {
            if inner.queue_tail.is_null() {
                inner.queue_head = node;
                inner.queue_tail = node;
            } else {
                (*inner.queue_tail).next = node;
                inner.queue_tail = node;
            }
        }
    }

    /// Whether the sentinel is currently linked into the queue. When it is
    /// not, some worker is inside the polling task.
    fn task_in_queue(&self, inner: &Inner) -> bool {
        let sentinel = self.sentinel.as_ptr();
        unsafe { !(*sentinel).next.is_null() || inner.queue_tail == sentinel }
    }

    fn wake_one_idle(inner: &mut Inner) -> bool {
        if inner.first_idle.is_null() {
            return false;
        }
        unsafe {
            (*inner.first_idle).wakeup.signal();
            inner.first_idle = (*inner.first_idle).next;
        }
        true
    }

    fn wake_all_idle(inner: &mut Inner) {
        if inner.first_idle.is_null() {
            return;
        }
        unsafe {
            (*inner.first_idle).wakeup.signal();
            let mut current = (*inner.first_idle).next;
            while current != inner.first_idle {
                (*current).wakeup.signal();
                current = (*current).next;
            }
        }
    }

    fn interrupt_all(&self, inner: &mut Inner) {
        inner.interrupted = true;
        Self::wake_all_idle(inner);
        if !self.task_in_queue(inner) {
            self.task.interrupt();
        }
    }

    /// Interrupt the event processing loop: wake every parked worker and
    /// unblock the polling task. Idempotent; callable from inside a handler.
    pub fn interrupt(&self) {
        let mut inner = self.inner.lock();
        self.interrupt_all(&mut inner);
    }

    /// Clear the interrupted flag in preparation for a subsequent `run`.
    /// Must not be called while any worker is inside `run`.
    pub fn reset(&self) {
        self.inner.lock().interrupted = false;
    }

    /// Account for an asynchronous operation that has begun.
    pub fn work_started(&self) {
        self.inner.lock().outstanding_work += 1;
    }

    /// Account for an asynchronous operation that will never complete.
    /// Dropping the count to zero triggers the interruption cascade.
    pub fn work_finished(&self) {
        let mut inner = self.inner.lock();
        inner.outstanding_work -= 1;
        if inner.outstanding_work == 0 {
            self.interrupt_all(&mut inner);
        }
    }

    /// Drive the loop on the calling thread until the dispatcher is
    /// interrupted or runs out of work. Returns the number of handlers this
    /// worker executed.
    ///
    /// A panicking handler or polling task propagates out of `run` with the
    /// queue and counter invariants already restored; the caller decides
    /// whether to re-enter.
    pub fn run(&self) -> usize {
        let _frame = call_stack::push(self.id());

        let mut idle = IdleWorker {
            wakeup: WakeupEvent::new(),
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        };
        let idle_ptr: *mut IdleWorker = &mut idle;
        unsafe {
            (*idle_ptr).prev = idle_ptr;
            (*idle_ptr).next = idle_ptr;
        }

        let mut handlers_run = 0usize;
        let mut inner = self.inner.lock();
        loop {
            if inner.interrupted || inner.outstanding_work == 0 {
                break;
            }
            if !inner.queue_head.is_null() {
                // Detach the head.
                let head = inner.queue_head;
                unsafe {
                    inner.queue_head = (*head).next;
                    if inner.queue_head.is_null() {
                        inner.queue_tail = ptr::null_mut();
                    }
                }
                if head == self.sentinel.as_ptr() {
                    let more_handlers = !inner.queue_head.is_null();
                    drop(inner);
                    // Reinsert the sentinel at the tail on every exit path,
                    // panics included.
                    let _requeue = RequeueSentinel { dispatcher: self };
                    // Only block if there is nothing else to run.
                    self.task.run(!more_handlers, self);
                } else {
                    drop(inner);
                    // The queue slot's work contribution is consumed by this
                    // invocation, on every exit path.
                    let _work = ConsumeWork { dispatcher: self };
                    unsafe {
                        match (*head).invoke {
                            Some(invoke) => invoke(head, Some(self)),
                            None => unreachable!("sentinel handled above"),
                        }
                    }
                    handlers_run += 1;
                }
                inner = self.inner.lock();
            } else {
                // Nothing to run: park on this worker's event.
                unsafe {
                    link_idle(&mut inner, idle_ptr);
                    (*idle_ptr).wakeup.clear();
                }
                drop(inner);
                unsafe { (*idle_ptr).wakeup.wait() };
                inner = self.inner.lock();
                unsafe { unlink_idle(&mut inner, idle_ptr) };
            }
        }

        if !inner.interrupted {
            // Out of work: wake the peers so they observe termination too.
            self.interrupt_all(&mut inner);
        }
        handlers_run
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Drain undelivered entries: release storage without making upcalls.
        let inner = self.inner.get_mut();
        let mut current = inner.queue_head;
        while !current.is_null() {
            let next = unsafe { (*current).next };
            if let Some(invoke) = unsafe { (*current).invoke } {
                unsafe { invoke(current, None) };
            }
            current = next;
        }
        inner.queue_head = ptr::null_mut();
        inner.queue_tail = ptr::null_mut();
        unsafe { drop(Box::from_raw(self.sentinel.as_ptr())) };
    }
}

/// Reinserts the task sentinel at the queue tail when a polling cycle ends.
struct RequeueSentinel<'a> {
    dispatcher: &'a Dispatcher,
}

impl Drop for RequeueSentinel<'_> {
    fn drop(&mut self) {
        let mut inner = self.dispatcher.inner.lock();
        let sentinel = self.dispatcher.sentinel.as_ptr();
        unsafe {
            (*sentinel).next = ptr::null_mut();
        }
        Dispatcher::push_back(&mut inner, sentinel);
    }
}

/// Decrements the outstanding-work counter when a dequeued handler's
/// invocation ends. The loop-exit path handles the zero-work cascade.
struct ConsumeWork<'a> {
    dispatcher: &'a Dispatcher,
}

impl Drop for ConsumeWork<'_> {
    fn drop(&mut self) {
        self.dispatcher.inner.lock().outstanding_work -= 1;
    }
}

/// Link `idle` into the ring ahead of the current first member and make it
/// the wake preference.
unsafe fn link_idle(inner: &mut Inner, idle: *mut IdleWorker) {
    unsafe {
        if !inner.first_idle.is_null() {
            (*idle).next = inner.first_idle;
            (*idle).prev = (*inner.first_idle).prev;
            (*(*inner.first_idle).prev).next = idle;
            (*inner.first_idle).prev = idle;
        }
    }
    inner.first_idle = idle;
}

unsafe fn unlink_idle(inner: &mut Inner, idle: *mut IdleWorker) {
    unsafe {
        if (*idle).next == idle {
            inner.first_idle = ptr::null_mut();
        } else {
            if inner.first_idle == idle {
                inner.first_idle = (*idle).next;
            }
            (*(*idle).next).prev = (*idle).prev;
            (*(*idle).prev).next = (*idle).next;
            (*idle).next = idle;
            (*idle).prev = idle;
        }
    }
}
