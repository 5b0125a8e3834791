//! The completion operation protocol.
//!
//! An operation is one heap-owned record tracking a single in-flight
//! asynchronous kernel request. It begins with the same header every queued
//! handler carries, so a completed operation can ride the dispatcher queue
//! as a deferred completion, followed by a kernel-level header and the
//! completion dispatch function pointer.
//!
//! The dispatch function owns the record when invoked: it frees the storage
//! before making the user upcall, and with a null owner (shutdown drain) it
//! frees without upcalling.

use std::alloc::Layout;
use std::ptr::{self, NonNull};
use std::sync::atomic::{self, Ordering};

use crate::alloc;
use crate::dispatcher::Dispatcher;
use crate::handler::HandlerHeader;

/// Completion dispatch routine carried by every operation.
///
/// `owner` is the dispatcher for normal completions and `None` when the
/// operation is being freed during teardown; in the latter case the user
/// handler must not be invoked.
pub type CompleteFn = unsafe fn(Option<&Dispatcher>, *mut Operation, i32, usize);

/// Readiness-driven resume routine. Retries the platform primitive after the
/// poller reports the underlying descriptor ready.
pub type PerformFn = unsafe fn(*mut Operation) -> PerformOutcome;

/// Result of a [`PerformFn`] attempt.
pub enum PerformOutcome {
    /// The platform primitive finished with this code and transfer count.
    Complete { err: i32, bytes: usize },
    /// Still not ready; re-arm and wait for the next readiness report.
    Again,
}

/// Kernel-level request header, reset before an operation is reissued.
/// Its address is stable from the platform start call until completion
/// dispatch; the allocator never moves live storage.
#[repr(C)]
#[derive(Default)]
pub struct OverlappedHeader {
    status: usize,
    transferred: usize,
}

impl OverlappedHeader {
    pub fn reset(&mut self) {
        self.status = 0;
        self.transferred = 0;
    }
}

/// Common prefix of every concrete operation type. Concrete operations are
/// `#[repr(C)]` structs whose first field is an `Operation`, so a pointer to
/// either views the same record.
#[repr(C)]
pub struct Operation {
    header: HandlerHeader,
    pub overlapped: OverlappedHeader,
    complete: CompleteFn,
    perform: Option<PerformFn>,
    /// Completion result staged while the operation sits in the queue.
    result_err: i32,
    result_bytes: usize,
}

impl Operation {
    pub fn new(complete: CompleteFn, perform: Option<PerformFn>) -> Operation {
        Operation {
            header: HandlerHeader {
                next: ptr::null_mut(),
                invoke: Some(invoke_operation),
            },
            overlapped: OverlappedHeader::default(),
            complete,
            perform,
            result_err: 0,
            result_bytes: 0,
        }
    }
}

/// Queue invoker for operations: routes the staged result to the completion
/// dispatch function. The dispatch function takes ownership of the storage.
unsafe fn invoke_operation(base: *mut HandlerHeader, owner: Option<&Dispatcher>) {
    let op = base as *mut Operation;
    unsafe {
        let err = (*op).result_err;
        let bytes = (*op).result_bytes;
        ((*op).complete)(owner, op, err, bytes);
    }
}

/// Scoped owning pointer over allocator-backed operation storage.
///
/// Dropping the box destroys the value and releases the storage. `release`
/// hands the raw record to the kernel or the queue without running either;
/// `take` moves the value out and frees the heap slot, which is how
/// completion paths free storage before the upcall.
pub struct OpBox<T> {
    ptr: NonNull<T>,
}

impl<T> OpBox<T> {
    pub fn new(value: T) -> OpBox<T> {
        let raw = alloc::alloc(Layout::new::<T>()) as *mut T;
        unsafe { raw.write(value) };
        OpBox {
            // alloc never returns null.
            ptr: unsafe { NonNull::new_unchecked(raw) },
        }
    }

    /// Rebuild the box from a pointer previously produced by `release`.
    ///
    /// # Safety
    /// `raw` must point at a live record produced by `OpBox::<T>::release`
    /// (possibly viewed through its `Operation` prefix) that no other owner
    /// still references.
    pub unsafe fn from_raw(raw: *mut T) -> OpBox<T> {
        OpBox {
            ptr: unsafe { NonNull::new_unchecked(raw) },
        }
    }

    /// Give up ownership without destroying the value.
    pub fn release(self) -> *mut T {
        let raw = self.ptr.as_ptr();
        std::mem::forget(self);
        raw
    }

    /// Move the value out and free the heap storage. The caller holds the
    /// value on its own stack afterwards; the allocator slot is already
    /// available for reuse.
    pub fn take(self) -> T {
        let raw = self.ptr.as_ptr();
        std::mem::forget(self);
        let value = unsafe { ptr::read(raw) };
        unsafe { alloc::dealloc(raw as *mut u8, Layout::new::<T>()) };
        value
    }
}

impl<T> std::ops::Deref for OpBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> std::ops::DerefMut for OpBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for OpBox<T> {
    fn drop(&mut self) {
        unsafe {
            ptr::drop_in_place(self.ptr.as_ptr());
            alloc::dealloc(self.ptr.as_ptr() as *mut u8, Layout::new::<T>());
        }
    }
}

/// Type-erased owned operation, as handed to a poller's pending table or to
/// the dispatcher queue.
pub struct PendingOp {
    op: NonNull<Operation>,
}

unsafe impl Send for PendingOp {}

impl PendingOp {
    /// Take ownership of a released operation record through its prefix.
    ///
    /// # Safety
    /// `op` must point at the `Operation` prefix of a record released from
    /// an `OpBox`, with no other owner.
    pub unsafe fn from_raw(op: *mut Operation) -> PendingOp {
        PendingOp {
            op: unsafe { NonNull::new_unchecked(op) },
        }
    }

    pub fn into_raw(self) -> *mut Operation {
        let raw = self.op.as_ptr();
        std::mem::forget(self);
        raw
    }

    /// Retry the platform primitive after a readiness report.
    pub(crate) fn perform(&mut self) -> PerformOutcome {
        let raw = self.op.as_ptr();
        unsafe {
            match (*raw).perform {
                Some(perform) => perform(raw),
                None => PerformOutcome::Complete { err: 0, bytes: 0 },
            }
        }
    }

    /// Stage the completion result and convert into a queue entry.
    pub(crate) fn into_queued(self, err: i32, bytes: usize) -> *mut HandlerHeader {
        let raw = self.into_raw();
        unsafe {
            (*raw).result_err = err;
            (*raw).result_bytes = bytes;
            (*raw).header.next = ptr::null_mut();
        }
        raw as *mut HandlerHeader
    }

    /// Invoke the completion dispatch function directly.
    ///
    /// Normal completions go through [`Dispatcher::post_completion`]; this
    /// entry exists for teardown (`owner == None`), which frees the record
    /// without invoking the user handler.
    pub fn complete(self, owner: Option<&Dispatcher>, err: i32, bytes: usize) {
        let raw = self.into_raw();
        unsafe { ((*raw).complete)(owner, raw, err, bytes) };
    }
}

impl Drop for PendingOp {
    fn drop(&mut self) {
        // An owner that never delivered the operation still releases its
        // storage; the user handler is not invoked.
        let raw = self.op.as_ptr();
        unsafe {
            let err = (*raw).result_err;
            let bytes = (*raw).result_bytes;
            ((*raw).complete)(None, raw, err, bytes);
        }
    }
}

/// Visibility barrier between freeing operation storage and the upcall:
/// writes performed by the kernel and the polling thread become visible to
/// the user handler.
pub(crate) fn upcall_fence() {
    atomic::fence(Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[repr(C)]
    struct ProbeOp {
        base: Operation,
        payload: Payload,
    }

    struct Payload(Arc<AtomicUsize>);

    impl Drop for Payload {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    unsafe fn probe_complete(
        owner: Option<&Dispatcher>,
        op: *mut Operation,
        _err: i32,
        _bytes: usize,
    ) {
        let probe = unsafe { OpBox::from_raw(op as *mut ProbeOp) };
        let value = probe.take();
        drop(value);
        let _ = owner;
    }

    fn probe(drops: &Arc<AtomicUsize>) -> OpBox<ProbeOp> {
        OpBox::new(ProbeOp {
            base: Operation::new(probe_complete, None),
            payload: Payload(drops.clone()),
        })
    }

    #[test]
    fn test_opbox_drop_destroys_value() {
        let drops = Arc::new(AtomicUsize::new(0));
        drop(probe(&drops));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_then_teardown_completion_frees_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let raw = probe(&drops).release();
        let pending = unsafe { PendingOp::from_raw(raw as *mut Operation) };
        pending.complete(None, 0, 0);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_queued_operation_carries_staged_result() {
        let drops = Arc::new(AtomicUsize::new(0));
        let raw = probe(&drops).release();
        let pending = unsafe { PendingOp::from_raw(raw as *mut Operation) };
        let header = pending.into_queued(7, 42);
        unsafe {
            assert_eq!((*(header as *mut Operation)).result_err, 7);
            assert_eq!((*(header as *mut Operation)).result_bytes, 42);
            // Free through the queue invoker's teardown path.
            let invoke = (*header).invoke.unwrap();
            invoke(header, None);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_overlapped_reset() {
        let mut header = OverlappedHeader {
            status: 3,
            transferred: 9,
        };
        header.reset();
        assert_eq!(header.status, 0);
        assert_eq!(header.transferred, 0);
    }
}
