use crate::{
    config::StackConfig,
    handshake::phase::{AtomicSignum, AtomicWeakSignal, Signum, WeakSignal},
    internal::current,
    stack::LfStack,
};
use core::{
    cell::UnsafeCell,
    fmt::{self, Debug, Formatter},
    ptr::{self, NonNull},
};
use crossbeam_utils::Backoff;
use rand::{rngs::SmallRng, SeedableRng};
use std::{
    sync::{
        atomic::{
            AtomicBool, AtomicPtr, AtomicUsize,
            Ordering::{Acquire, Relaxed, Release, SeqCst},
        },
        Arc,
    },
    thread::{self, ThreadId},
};

/// The part of a mutator's state that other threads may keep using after the mutator exits.
///
/// Collector threads push work for a mutator (or take over work it left behind) through the
/// hand-off stack. The state outlives its record for as long as someone holds the `Arc`.
pub struct MutatorPersist {
    handoff: LfStack<usize>,
    live:    AtomicBool,
}

impl Debug for MutatorPersist {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutatorPersist")
            .field("handoff", &self.handoff)
            .field("live", &self.is_live())
            .finish()
    }
}

impl MutatorPersist {
    fn new(handoff: &StackConfig) -> Self {
        MutatorPersist {
            handoff: LfStack::with_config(handoff),
            live:    AtomicBool::new(true),
        }
    }

    /// Words handed between the mutator and collector threads.
    #[inline]
    pub fn handoff(&self) -> &LfStack<usize> {
        &self.handoff
    }

    /// Returns false once the owning record has been released.
    #[inline]
    pub fn is_live(&self) -> bool {
        self.live.load(Acquire)
    }

    fn mark_dead(&self) {
        self.live.store(false, Release)
    }
}

/// State that only the owning thread ever touches.
#[derive(Debug)]
pub struct LocalState {
    /// Addresses of free blocks cached by the allocator on this thread.
    pub free_list: Vec<usize>,
    pub rng:       SmallRng,
}

/// Everything the handshake protocol knows about one mutator thread.
///
/// Records are created by [`Handshake::mutator`](crate::handshake::Handshake::mutator) and live
/// in the registry until purged, which can only happen after the owning thread has dropped its
/// handle and the record was marked dead.
pub struct MutatorRecord {
    id:          u64,
    thread:      ThreadId,
    name:        Option<String>,
    #[cfg(unix)]
    pthread:     libc::pthread_t,
    stack_end:   Option<NonNull<u8>>,
    persist:     Arc<MutatorPersist>,
    bitmap:      AtomicPtr<()>,

    local:      UnsafeCell<LocalState>,
    local_busy: AtomicBool,

    pub(crate) status:      AtomicSignum,
    pub(crate) weak_signal: AtomicWeakSignal,
    /// The last phase posted to this record. Read by the phase handler.
    pub(crate) mailbox:     AtomicSignum,

    live:                              AtomicBool,
    /// Collectors currently notifying the owning thread.
    notifying:                         AtomicUsize,
    attached:                          AtomicBool,
    mark_signal_disabled:              AtomicBool,
    pub(crate) mark_signal_requested:  AtomicSignum,
    sweep_signal_disabled:             AtomicBool,
    pub(crate) sweep_signal_requested: AtomicBool,
    clear_local_allocator:             AtomicBool,

    pub(super) next: AtomicPtr<MutatorRecord>,
}

// The raw pointers are addresses owned by the allocator and the collector. `local` is only
// accessed by the owning thread, guarded by `local_busy`.
unsafe impl Send for MutatorRecord {}
unsafe impl Sync for MutatorRecord {}

impl Debug for MutatorRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutatorRecord")
            .field("id", &self.id)
            .field("thread", &self.thread)
            .field("name", &self.name)
            .field("status", &self.status())
            .field("weak_signal", &self.weak_signal())
            .field("dead", &self.is_dead())
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl MutatorRecord {
    /// Creates the record of the calling thread.
    pub(crate) fn new(id: u64, handoff: &StackConfig, bitmap: *mut ()) -> Self {
        let current = thread::current();
        MutatorRecord {
            id,
            thread: current.id(),
            name: current.name().map(String::from),
            #[cfg(unix)]
            pthread: unsafe { libc::pthread_self() },
            stack_end: stack_end(),
            persist: Arc::new(MutatorPersist::new(handoff)),
            bitmap: AtomicPtr::new(bitmap),
            local: UnsafeCell::new(LocalState {
                free_list: Vec::new(),
                rng:       SmallRng::seed_from_u64(id),
            }),
            local_busy: AtomicBool::new(false),
            status: AtomicSignum::new(Signum::Init),
            weak_signal: AtomicWeakSignal::new(WeakSignal::Working),
            mailbox: AtomicSignum::new(Signum::Init),
            live: AtomicBool::new(true),
            notifying: AtomicUsize::new(0),
            attached: AtomicBool::new(true),
            mark_signal_disabled: AtomicBool::new(false),
            mark_signal_requested: AtomicSignum::new(Signum::Init),
            sweep_signal_disabled: AtomicBool::new(false),
            sweep_signal_requested: AtomicBool::new(false),
            clear_local_allocator: AtomicBool::new(false),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Unique (per handshake) id, in registration order.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    #[inline]
    pub fn thread_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[cfg(unix)]
    #[inline]
    pub fn pthread(&self) -> libc::pthread_t {
        self.pthread
    }

    /// One past the highest address of the owning thread's stack, if the platform reports it.
    ///
    /// Computed once at registration.
    #[inline]
    pub fn stack_end(&self) -> Option<NonNull<u8>> {
        self.stack_end
    }

    #[inline]
    pub fn persist(&self) -> &Arc<MutatorPersist> {
        &self.persist
    }

    /// The mark bitmap in use when the record was created, or the latest one set through
    /// [`Handshake::set_bitmap`](crate::handshake::Handshake::set_bitmap).
    #[inline]
    pub fn bitmap(&self) -> *mut () {
        self.bitmap.load(Acquire)
    }

    #[inline]
    pub(crate) fn set_bitmap(&self, bitmap: *mut ()) {
        self.bitmap.store(bitmap, Release)
    }

    /// The last phase the owning thread acknowledged.
    #[inline]
    pub fn status(&self) -> Signum {
        self.status.load()
    }

    #[inline]
    pub fn weak_signal(&self) -> WeakSignal {
        self.weak_signal.load()
    }

    /// Returns true if the owning thread has acknowledged `phase`, without a pending veto when
    /// `weak` is requested.
    #[inline]
    pub fn has_acknowledged(&self, phase: Signum, weak: bool) -> bool {
        self.status() == phase && !(weak && self.weak_signal() == WeakSignal::DoHandshake)
    }

    /// Retires the record. Handshakes skip dead records from now on.
    ///
    /// The mark and sweep signals are disabled before the record is flagged dead, so a round in
    /// flight never observes a dead record that still has phase side effects enabled.
    pub fn mark_dead(&self) {
        self.mark_signal_disabled.store(true, SeqCst);
        self.sweep_signal_disabled.store(true, SeqCst);
        self.live.store(false, SeqCst);
    }

    /// Pins the owning thread for a notification, or returns None if the record is dead.
    ///
    /// A thread retiring its record waits in [`quiesce`](MutatorRecord::quiesce) until every
    /// guard is dropped, so its `pthread_t` stays valid while the guard lives.
    #[inline]
    pub(crate) fn begin_notify(&self) -> Option<NotifyGuard<'_>> {
        let _ = self.notifying.fetch_add(1, SeqCst);
        let guard = NotifyGuard(&self.notifying);
        if self.is_dead() {
            None
        } else {
            Some(guard)
        }
    }

    /// Waits until no collector is notifying the owning thread. Called after `mark_dead`.
    pub(crate) fn quiesce(&self) {
        let backoff = Backoff::new();
        while self.notifying.load(SeqCst) != 0 {
            backoff.snooze();
        }
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        !self.live.load(SeqCst)
    }

    /// Returns true while the owning thread still holds a handle to the record.
    #[inline]
    pub fn is_attached(&self) -> bool {
        self.attached.load(Acquire)
    }

    #[inline]
    pub(crate) fn detach(&self) {
        self.attached.store(false, Release)
    }

    #[inline]
    pub fn mark_signal_disabled(&self) -> bool {
        self.mark_signal_disabled.load(SeqCst)
    }

    #[inline]
    pub(crate) fn set_mark_signal_disabled(&self, disabled: bool) -> bool {
        self.mark_signal_disabled.swap(disabled, SeqCst)
    }

    #[inline]
    pub fn sweep_signal_disabled(&self) -> bool {
        self.sweep_signal_disabled.load(SeqCst)
    }

    #[inline]
    pub(crate) fn set_sweep_signal_disabled(&self, disabled: bool) -> bool {
        self.sweep_signal_disabled.swap(disabled, SeqCst)
    }

    /// The mark phase that arrived while the mark signal was disabled, if any.
    #[inline]
    pub fn mark_signal_requested(&self) -> Option<Signum> {
        match self.mark_signal_requested.load() {
            Signum::Init => None,
            phase => Some(phase),
        }
    }

    /// Returns true if a sweep phase arrived while the sweep signal was disabled.
    #[inline]
    pub fn sweep_signal_requested(&self) -> bool {
        self.sweep_signal_requested.load(SeqCst)
    }

    /// Asks the owning thread to drop its cached free blocks the next time it uses its local
    /// state.
    #[inline]
    pub fn request_local_clear(&self) {
        self.clear_local_allocator.store(true, Release)
    }

    /// Runs `f` with the owning thread's local state.
    ///
    /// Returns None if called from any thread but the owner, or if the local state is already in
    /// use further up the owner's stack (a phase action interrupting `with_local`).
    pub fn with_local<F: FnOnce(&mut LocalState) -> O, O>(&self, f: F) -> Option<O> {
        if !current::is(self) || self.local_busy.swap(true, Acquire) {
            return None;
        }
        struct Unborrow<'a>(&'a AtomicBool);
        impl Drop for Unborrow<'_> {
            fn drop(&mut self) {
                self.0.store(false, Release)
            }
        }
        let _unborrow = Unborrow(&self.local_busy);

        // only the owning thread gets here, and `local_busy` excludes reentry from its handler
        let local = unsafe { &mut *self.local.get() };
        if self.clear_local_allocator.swap(false, Relaxed) {
            local.free_list.clear();
        }
        Some(f(local))
    }
}

/// Returned by [`MutatorRecord::begin_notify`].
pub(crate) struct NotifyGuard<'a>(&'a AtomicUsize);

impl Drop for NotifyGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, SeqCst);
    }
}

impl Drop for MutatorRecord {
    fn drop(&mut self) {
        self.persist.mark_dead()
    }
}

#[cfg(target_os = "linux")]
fn stack_end() -> Option<NonNull<u8>> {
    use core::mem::MaybeUninit;
    unsafe {
        let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
        if libc::pthread_getattr_np(libc::pthread_self(), attr.as_mut_ptr()) != 0 {
            return None;
        }
        let mut attr = attr.assume_init();
        let mut addr = ptr::null_mut();
        let mut size = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        let _ = libc::pthread_attr_destroy(&mut attr);
        if rc != 0 {
            return None;
        }
        NonNull::new((addr as *mut u8).wrapping_add(size))
    }
}

#[cfg(not(target_os = "linux"))]
fn stack_end() -> Option<NonNull<u8>> {
    None
}
