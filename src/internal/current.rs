//! The calling thread's registration, reachable from an asynchronous signal handler.
//!
//! Both cells are const initialized and have no destructor, so reading them never allocates, never
//! registers a thread local destructor, and stays valid during thread teardown.

use crate::handshake::{record::MutatorRecord, Shared};
use std::{cell::Cell, ptr};

thread_local! {
    static SHARED: Cell<*const Shared> = const { Cell::new(ptr::null()) };
    static RECORD: Cell<*const MutatorRecord> = const { Cell::new(ptr::null()) };
}

/// Publishes the calling thread's registration.
///
/// `shared` and `record` must stay valid until `clear` is called with the same record.
#[inline]
pub(crate) unsafe fn set(shared: *const Shared, record: *const MutatorRecord) {
    // RECORD is the gate checked by `with`, so it is written last.
    SHARED.with(|s| s.set(shared));
    RECORD.with(|r| r.set(record));
}

/// Forgets the calling thread's registration, if `record` is the registered one.
#[inline]
pub(crate) fn clear(record: *const MutatorRecord) {
    RECORD.with(|r| {
        if ptr::eq(r.get(), record) {
            r.set(ptr::null());
            SHARED.with(|s| s.set(ptr::null()));
        }
    })
}

/// Returns true if `record` belongs to the calling thread.
#[inline]
pub(crate) fn is(record: &MutatorRecord) -> bool {
    RECORD.with(|r| ptr::eq(r.get(), record))
}

/// Returns true if the calling thread has a registration.
#[inline]
pub(crate) fn is_registered() -> bool {
    RECORD.with(|r| !r.get().is_null())
}

/// Runs `f` with the calling thread's registration, if any.
#[inline]
pub(crate) fn with<F: FnOnce(&Shared, &MutatorRecord) -> O, O>(f: F) -> Option<O> {
    let record = RECORD.with(Cell::get);
    if unlikely!(record.is_null()) {
        return None;
    }
    let shared = SHARED.with(Cell::get);
    debug_assert!(
        !shared.is_null(),
        "registered record without a handshake context"
    );
    // `set` requires both pointers to outlive the registration.
    unsafe { Some(f(&*shared, &*record)) }
}
