//! Thread local mutator handles.
//!
//! A [`Mutator`] is acquired with [`Handshake::mutator`](crate::handshake::Handshake::mutator). The
//! first call on a thread creates and registers the thread's [`MutatorRecord`]; later calls
//! return clones of the cached handle. When the last clone is dropped (normally by the thread
//! local destructor at thread exit) the record is marked dead, and every handshake from then on
//! skips it.
//!
//! If a thread asks for a handle after its thread locals were destroyed, a temporary handle with
//! its own record is registered, and retired again when the handle is dropped.

use crate::{
    cas,
    error::Error,
    handshake::{dispatch, Handshake, LocalState, MutatorRecord, Shared, Signum, WeakSignal},
    internal::current,
    stats,
};
use core::{
    fmt::{self, Debug, Formatter},
    ptr::NonNull,
};
use std::{
    cell::RefCell,
    rc::Rc,
    sync::{
        atomic::{self, Ordering::SeqCst},
        Arc,
    },
    thread,
};
use tracing::{debug, warn};

thread_local! {
    static HANDLE: RefCell<Option<Mutator>> = RefCell::new(None);
}

struct MutatorInner {
    shared: Arc<Shared>,
    record: NonNull<MutatorRecord>,
}

impl MutatorInner {
    #[inline(never)]
    #[cold]
    fn register(shared: &Arc<Shared>) -> Self {
        let id = shared.next_id.fetch_add(1, SeqCst);
        let record = Box::new(MutatorRecord::new(
            id,
            &shared.config.handoff,
            shared.bitmap.load(SeqCst),
        ));
        let record = NonNull::from(Box::leak(record));
        unsafe {
            // published before insertion, so a phase that arrives mid registration is handled
            current::set(Arc::as_ptr(shared), record.as_ptr());
            shared.registry.insert(record);
        }

        // pairs with the fence in `Handshake::post`: either the post sees this record, or this
        // load sees the posted phase
        atomic::fence(SeqCst);
        let record_ref = unsafe { record.as_ref() };
        let posted = shared.posted.load().primary();
        let _ = cas::change(&record_ref.status, Signum::Init, posted);

        stats::records_registered();
        debug!(
            id,
            thread = ?record_ref.thread_name(),
            status = ?record_ref.status(),
            "mutator registered"
        );
        MutatorInner {
            shared: shared.clone(),
            record,
        }
    }

    #[inline]
    fn record(&self) -> &MutatorRecord {
        // records are only freed once dead and detached, and `self` keeps it attached
        unsafe { self.record.as_ref() }
    }
}

impl Drop for MutatorInner {
    fn drop(&mut self) {
        let record = self.record();
        current::clear(record);
        record.mark_dead();
        record.quiesce();
        record.detach();
        stats::records_retired();
        debug!(id = record.id(), "mutator retired");
    }
}

/// A handle to the calling thread's registration with a [`Handshake`].
///
/// Handles are reference counted, and can't leave the thread that created them.
#[derive(Clone)]
pub struct Mutator {
    inner: Rc<MutatorInner>,
}

impl Debug for Mutator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutator")
            .field("record", self.record())
            .finish()
    }
}

/// Returns the calling thread's handle for `shared`, registering the thread if needed.
pub(crate) fn current(shared: &Arc<Shared>) -> Result<Mutator, Error> {
    let cached = HANDLE.try_with(|handle| {
        let mut handle = handle.borrow_mut();
        match &*handle {
            Some(mutator) if Arc::ptr_eq(&mutator.inner.shared, shared) => Ok(mutator.clone()),
            Some(_) => Err(Error::AlreadyRegistered),
            None => {
                let mutator = Mutator::new(MutatorInner::register(shared));
                *handle = Some(mutator.clone());
                Ok(mutator)
            }
        }
    });
    match cached {
        Ok(result) => result,
        Err(_) => {
            // thread locals are being torn down
            if current::is_registered() {
                Err(Error::AlreadyRegistered)
            } else {
                Ok(Mutator::new(MutatorInner::register(shared)))
            }
        }
    }
}

/// Drops the calling thread's cached handle, if any.
pub(crate) fn unregister_current_thread() {
    let handle = HANDLE
        .try_with(|handle| handle.borrow_mut().take())
        .ok()
        .flatten();
    // dropped outside of the borrow
    drop(handle)
}

impl Mutator {
    #[inline]
    fn new(inner: MutatorInner) -> Self {
        Mutator {
            inner: Rc::new(inner),
        }
    }

    #[inline]
    pub fn record(&self) -> &MutatorRecord {
        self.inner.record()
    }

    /// The handshake this mutator is registered with.
    #[inline]
    pub fn handshake(&self) -> Handshake {
        Handshake::from_shared(self.inner.shared.clone())
    }

    /// The last phase this thread acknowledged.
    #[inline]
    pub fn status(&self) -> Signum {
        self.record().status()
    }

    /// Handles a posted phase, if there is one this thread has not acknowledged.
    ///
    /// With polled delivery this is the only place mutators pick up phases, so it must be called
    /// regularly. With signal delivery it does nothing.
    #[inline]
    pub fn safepoint(&self) {
        let shared = &*self.inner.shared;
        if !shared.delivery.is_asynchronous() {
            dispatch::deliver(shared, self.record())
        }
    }

    /// Declares that this thread holds no references the collector needs to scan. Phases are
    /// acknowledged without running the phase action until [`leave_barrier`] or a veto.
    ///
    /// Has no effect while a veto from a weak handshake is pending.
    ///
    /// [`leave_barrier`]: Mutator::leave_barrier
    #[inline]
    pub fn enter_barrier(&self) {
        let _ = cas::change(
            &self.record().weak_signal,
            WeakSignal::Working,
            WeakSignal::InBarrier,
        );
    }

    /// Resumes normal execution. Phases run the phase action again.
    #[inline]
    pub fn leave_barrier(&self) {
        self.record().weak_signal.store(WeakSignal::Working)
    }

    /// Defers mark phases until [`enable_mark_signal`](Mutator::enable_mark_signal).
    #[inline]
    pub fn disable_mark_signal(&self) {
        let _ = self.record().set_mark_signal_disabled(true);
    }

    /// Re-enables mark phases, and handles a mark phase that arrived in the meantime.
    pub fn enable_mark_signal(&self) {
        let record = self.record();
        let _ = record.set_mark_signal_disabled(false);
        if record.mark_signal_requested.swap(Signum::Init) != Signum::Init {
            self.do_deferred_async_signal()
        }
    }

    /// Defers sweep phases until [`enable_sweep_signal`](Mutator::enable_sweep_signal).
    #[inline]
    pub fn disable_sweep_signal(&self) {
        let _ = self.record().set_sweep_signal_disabled(true);
    }

    /// Re-enables sweep phases, and handles a sweep phase that arrived in the meantime.
    pub fn enable_sweep_signal(&self) {
        let record = self.record();
        let _ = record.set_sweep_signal_disabled(false);
        if record.sweep_signal_requested.swap(false, SeqCst) {
            self.do_deferred_sweep_signal()
        }
    }

    /// Runs `f` with mark and sweep phases deferred, then handles whatever arrived.
    ///
    /// Nests: only the outermost call re-enables the signals.
    pub fn with_signals_deferred<F: FnOnce() -> O, O>(&self, f: F) -> O {
        struct Restore<'a> {
            mutator: &'a Mutator,
            mark:    bool,
            sweep:   bool,
        }
        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                if !self.sweep {
                    self.mutator.enable_sweep_signal()
                }
                if !self.mark {
                    self.mutator.enable_mark_signal()
                }
            }
        }

        let record = self.record();
        let _restore = Restore {
            mutator: self,
            mark:    record.set_mark_signal_disabled(true),
            sweep:   record.set_sweep_signal_disabled(true),
        };
        f()
    }

    /// Redelivers a deferred mark phase to this thread, and waits until it was handled.
    pub fn do_deferred_async_signal(&self) {
        self.redeliver(Signum::DeferredAsync)
    }

    /// Redelivers a deferred sweep phase to this thread, and waits until it was handled.
    pub fn do_deferred_sweep_signal(&self) {
        self.redeliver(Signum::DeferredSweep)
    }

    fn redeliver(&self, deferred: Signum) {
        let shared = &*self.inner.shared;
        let record = self.record();
        let target = deferred.primary();
        stats::deferred_signals();
        record.mailbox.store(deferred);

        let asynchronous = shared.delivery.is_asynchronous();
        if asynchronous {
            if let Err(error) = shared.delivery.notify(record) {
                // the phase is still handled, only without a signal frame
                warn!(id = record.id(), %error, "failed to redeliver phase to self");
                dispatch::deliver(shared, record);
            }
        }
        while record.status() != target && !record.is_dead() {
            if !asynchronous {
                dispatch::deliver(shared, record);
                continue;
            }
            thread::yield_now();
        }
    }

    /// Runs `f` with this thread's allocator state.
    ///
    /// Returns None if the local state is already in use further up this thread's stack.
    #[inline]
    pub fn with_local<F: FnOnce(&mut LocalState) -> O, O>(&self, f: F) -> Option<O> {
        self.record().with_local(f)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{Config, DeliveryMode};

    fn polled() -> Handshake {
        Handshake::builder()
            .config(Config {
                delivery: DeliveryMode::Poll,
                ..Default::default()
            })
            .build()
            .unwrap()
    }

    #[test]
    fn cached_per_thread() {
        let handshake = polled();
        thread::spawn(move || {
            let a = handshake.mutator().unwrap();
            let b = handshake.mutator().unwrap();
            assert_eq!(a.record().id(), b.record().id());
            assert_eq!(handshake.live_count(), 1);
            assert!(current::is(a.record()));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn retired_on_thread_exit() {
        let handshake = polled();
        let h = handshake.clone();
        thread::spawn(move || {
            let _ = h.mutator().unwrap();
        })
        .join()
        .unwrap();
        assert_eq!(handshake.live_count(), 0);
        let record = handshake.records().next().unwrap();
        assert!(record.is_dead());
        assert!(!record.is_attached());
        assert!(record.mark_signal_disabled());
        assert_eq!(unsafe { handshake.purge_dead() }, 1);
        assert_eq!(handshake.records().count(), 0);
    }

    #[test]
    fn unregister_early() {
        let handshake = polled();
        thread::spawn(move || {
            let first = handshake.mutator().unwrap().record().id();
            Handshake::unregister_current_thread();
            assert!(!current::is_registered());
            let second = handshake.mutator().unwrap();
            assert_ne!(second.record().id(), first);
            assert_eq!(handshake.live_count(), 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn one_handshake_per_thread() {
        let a = polled();
        let b = polled();
        thread::spawn(move || {
            let _m = a.mutator().unwrap();
            assert!(matches!(b.mutator(), Err(Error::AlreadyRegistered)));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn starts_at_posted_phase() {
        let handshake = polled();
        handshake.post(Signum::Sync2, false);
        thread::spawn(move || {
            let m = handshake.mutator().unwrap();
            assert_eq!(m.status(), Signum::Sync2);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn local_state() {
        let handshake = polled();
        thread::spawn(move || {
            let m = handshake.mutator().unwrap();
            assert_eq!(m.with_local(|l| l.free_list.push(0x1000)), Some(()));
            // nested use is refused
            let nested = m.with_local(|_| m.with_local(|_| ()));
            assert_eq!(nested, Some(None));
            m.record().request_local_clear();
            assert_eq!(m.with_local(|l| l.free_list.len()), Some(0));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn deferred_mark_phase() {
        let handshake = polled();
        thread::spawn(move || {
            let m = handshake.mutator().unwrap();
            m.disable_mark_signal();
            handshake.post(Signum::Async, false);
            m.safepoint();
            assert_eq!(m.status(), Signum::Init);
            assert_eq!(m.record().mark_signal_requested(), Some(Signum::Async));
            m.enable_mark_signal();
            assert_eq!(m.status(), Signum::Async);
            assert_eq!(m.record().mark_signal_requested(), None);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn signals_deferred_scope() {
        let handshake = polled();
        thread::spawn(move || {
            let m = handshake.mutator().unwrap();
            handshake.post(Signum::Sweep, false);
            let status = m.with_signals_deferred(|| {
                m.with_signals_deferred(|| m.safepoint());
                assert!(m.record().sweep_signal_disabled());
                m.status()
            });
            assert_eq!(status, Signum::Init);
            assert!(!m.record().sweep_signal_disabled());
            assert_eq!(m.status(), Signum::Sweep);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn barrier_respects_veto() {
        let handshake = polled();
        thread::spawn(move || {
            let m = handshake.mutator().unwrap();
            m.enter_barrier();
            assert_eq!(m.record().weak_signal(), WeakSignal::InBarrier);
            handshake.post(Signum::Sync1, true);
            assert_eq!(m.record().weak_signal(), WeakSignal::DoHandshake);
            // can't re-enter the barrier to dodge the veto
            m.enter_barrier();
            assert_eq!(m.record().weak_signal(), WeakSignal::DoHandshake);
            m.safepoint();
            assert_eq!(m.record().weak_signal(), WeakSignal::InBarrier);
            m.leave_barrier();
            assert_eq!(m.record().weak_signal(), WeakSignal::Working);
        })
        .join()
        .unwrap();
    }
}
