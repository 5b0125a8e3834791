//! Type-erased handler records.
//!
//! A queued handler is one allocation: a header carrying the queue link and
//! an invoker function pointer, with the user closure stored contiguously
//! behind it. The function pointer replaces a vtable, so dispatch is a single
//! indirect call and the closure sits next to its metadata.

use std::alloc::Layout;
use std::ptr;

use crate::alloc;
use crate::dispatcher::Dispatcher;

/// Invoker for a queued record.
///
/// The invoker owns the record: it must free the storage before making the
/// upcall so the invocation can post new work without reentering the
/// allocator through the record's own state. With `owner == None` the record
/// is being drained during shutdown: storage is released and the closure is
/// dropped without being called.
pub(crate) type InvokeFn = unsafe fn(*mut HandlerHeader, Option<&Dispatcher>);

/// Header common to every queue entry. The task sentinel is a bare header
/// with a null invoker, identified by address.
#[repr(C)]
pub(crate) struct HandlerHeader {
    pub(crate) next: *mut HandlerHeader,
    pub(crate) invoke: Option<InvokeFn>,
}

#[repr(C)]
struct HandlerNode<F> {
    header: HandlerHeader,
    closure: F,
}

/// Allocate a handler record wrapping `f`. Ownership of the returned pointer
/// passes to the queue; exactly one invoker call consumes it.
pub(crate) fn alloc_handler<F: FnOnce() + Send>(f: F) -> *mut HandlerHeader {
    let layout = Layout::new::<HandlerNode<F>>();
    let node = alloc::alloc(layout) as *mut HandlerNode<F>;
    unsafe {
        node.write(HandlerNode {
            header: HandlerHeader {
                next: ptr::null_mut(),
                invoke: Some(invoke_closure::<F>),
            },
            closure: f,
        });
    }
    node as *mut HandlerHeader
}

unsafe fn invoke_closure<F: FnOnce() + Send>(base: *mut HandlerHeader, owner: Option<&Dispatcher>) {
    let node = base as *mut HandlerNode<F>;
    let layout = Layout::new::<HandlerNode<F>>();
    // Move the closure out and free the storage before the upcall.
    let closure = unsafe { ptr::read(&raw const (*node).closure) };
    unsafe { alloc::dealloc(base as *mut u8, layout) };
    if owner.is_some() {
        closure();
    }
}
