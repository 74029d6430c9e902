//! The handshake protocol: driving every live mutator thread to acknowledge a collection phase.
//!
//! A [`Handshake`] owns the registry of [`MutatorRecord`]s. Mutator threads join it through
//! [`Handshake::mutator`], and leave it when their [`Mutator`] handle is dropped (at the latest
//! during thread teardown). A collector thread calls [`Handshake::handshake`] for each phase of a
//! collection:
//!
//! 1. [`post`](Handshake::post) publishes the phase behind a sequentially consistent fence, vetoes
//!    the weak fast path of mutators sitting in a barrier (if requested), stores the phase in each
//!    live record's mailbox and notifies the owning thread.
//! 2. [`wait`](Handshake::wait) busy-waits on each record until it acknowledged the phase or died,
//!    or until termination is requested.
//!
//! # Examples
//!
//! ```
//! use gcsync::{
//!     config::{Config, DeliveryMode},
//!     handshake::{Handshake, Round, Signum},
//! };
//! use std::{
//!     sync::{
//!         atomic::{AtomicBool, Ordering},
//!         Arc,
//!     },
//!     thread,
//! };
//!
//! let handshake = Handshake::builder()
//!     .config(Config {
//!         delivery: DeliveryMode::Poll,
//!         ..Default::default()
//!     })
//!     .build()
//!     .unwrap();
//!
//! let done = Arc::new(AtomicBool::new(false));
//! let (ready_tx, ready_rx) = std::sync::mpsc::channel();
//! let worker = {
//!     let handshake = handshake.clone();
//!     let done = done.clone();
//!     thread::spawn(move || {
//!         let mutator = handshake.mutator().unwrap();
//!         ready_tx.send(()).unwrap();
//!         while !done.load(Ordering::Acquire) {
//!             mutator.safepoint();
//!         }
//!     })
//! };
//!
//! ready_rx.recv().unwrap();
//! assert_eq!(handshake.run_cycle(false), Round::Converged);
//! done.store(true, Ordering::Release);
//! worker.join().unwrap();
//! ```

pub mod delivery;
pub(crate) mod dispatch;
mod phase;
pub(crate) mod record;
mod registry;

#[cfg(unix)]
pub use self::delivery::SignalDelivery;
pub use self::{
    delivery::{Delivery, PollDelivery},
    dispatch::{NoAction, PhaseAction},
    phase::{AtomicSignum, AtomicWeakSignal, Signum, WeakSignal},
    record::{LocalState, MutatorPersist, MutatorRecord},
    registry::{Iter, Registry},
};

use crate::{
    cas,
    config::{Config, DeliveryMode},
    error::Error,
    internal::current,
    mutator::{self, Mutator},
    stats,
};
use core::fmt::{self, Debug, Formatter};
use crossbeam_utils::Backoff;
use std::sync::{
    atomic::{
        self, AtomicBool, AtomicPtr, AtomicU64,
        Ordering::{Acquire, Release, SeqCst},
    },
    Arc,
};
use tracing::{debug, trace, warn};

/// The process wide termination request, owned by higher level lifecycle logic.
///
/// Raising it makes every wait in progress (and every future one) return
/// [`Round::Abandoned`].
#[derive(Clone, Debug, Default)]
pub struct Termination(Arc<AtomicBool>);

impl Termination {
    #[inline]
    pub fn new() -> Self {
        Termination::default()
    }

    #[inline]
    pub fn request(&self) {
        self.0.store(true, Release)
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.0.load(Acquire)
    }
}

/// How a handshake round ended.
#[must_use]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Round {
    /// Every record that is still live acknowledged the phase.
    Converged,
    /// Termination was requested before every live record acknowledged the phase. Nothing may be
    /// assumed about which records did.
    Abandoned,
}

impl Round {
    #[inline]
    pub fn is_converged(self) -> bool {
        self == Round::Converged
    }
}

/// State shared by a handshake, its mutator handles, and the phase handler.
pub(crate) struct Shared {
    pub(crate) registry:    Registry,
    pub(crate) config:      Config,
    pub(crate) delivery:    Box<dyn Delivery>,
    pub(crate) action:      Box<dyn PhaseAction>,
    pub(crate) termination: Termination,
    pub(crate) bitmap:      AtomicPtr<()>,
    /// The most recently posted phase. New records start there.
    pub(crate) posted:      AtomicSignum,
    pub(crate) next_id:     AtomicU64,
}

impl Shared {
    pub(crate) fn new(
        config: Config,
        delivery: Box<dyn Delivery>,
        action: Box<dyn PhaseAction>,
        termination: Termination,
        bitmap: *mut (),
    ) -> Self {
        Shared {
            registry: Registry::new(),
            config,
            delivery,
            action,
            termination,
            bitmap: AtomicPtr::new(bitmap),
            posted: AtomicSignum::new(Signum::Init),
            next_id: AtomicU64::new(0),
        }
    }

    /// Returns true if a waiting collector has to run `record`'s phase handler itself.
    #[inline]
    pub(crate) fn serviced_inline(&self, record: &MutatorRecord) -> bool {
        !self.delivery.is_asynchronous() && current::is(record)
    }
}

/// Builder for a [`Handshake`].
pub struct Builder {
    config:      Config,
    action:      Box<dyn PhaseAction>,
    termination: Termination,
    bitmap:      *mut (),
}

impl Debug for Builder {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("config", &self.config)
            .field("termination", &self.termination)
            .field("bitmap", &self.bitmap)
            .finish()
    }
}

impl Builder {
    #[inline]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// The per-phase work mutators perform. Defaults to [`NoAction`].
    #[inline]
    pub fn action<A: PhaseAction>(mut self, action: A) -> Self {
        self.action = Box::new(action);
        self
    }

    /// Shares an existing termination flag. Defaults to a fresh one.
    #[inline]
    pub fn termination(mut self, termination: Termination) -> Self {
        self.termination = termination;
        self
    }

    /// The initial mark bitmap handed to every record. Defaults to null.
    #[inline]
    pub fn bitmap(mut self, bitmap: *mut ()) -> Self {
        self.bitmap = bitmap;
        self
    }

    /// Validates the configuration and, for signal delivery, installs the phase handler.
    pub fn build(self) -> Result<Handshake, Error> {
        self.config.validate()?;
        let delivery: Box<dyn Delivery> = match self.config.delivery {
            DeliveryMode::Poll => Box::new(PollDelivery),
            #[cfg(unix)]
            DeliveryMode::Signal => {
                let signo = delivery::phase_signal(self.config.signal_offset)?;
                Box::new(SignalDelivery::install(signo)?)
            }
            #[cfg(not(unix))]
            DeliveryMode::Signal => return Err(crate::error::SignalError::Unsupported.into()),
        };
        debug!(config = ?self.config, "handshake created");
        Ok(Handshake {
            shared: Arc::new(Shared::new(
                self.config,
                delivery,
                self.action,
                self.termination,
                self.bitmap,
            )),
        })
    }
}

/// A handshake context: one registry of mutators, one delivery mechanism, one phase action.
///
/// Cloning is cheap and yields a handle to the same context.
#[derive(Clone)]
pub struct Handshake {
    shared: Arc<Shared>,
}

impl Debug for Handshake {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("config", &self.shared.config)
            .field("delivery", &self.shared.delivery)
            .field("posted", &self.posted())
            .field("termination", &self.shared.termination)
            .finish()
    }
}

impl Handshake {
    #[inline]
    pub fn builder() -> Builder {
        Builder {
            config:      Config::default(),
            action:      Box::new(NoAction),
            termination: Termination::new(),
            bitmap:      core::ptr::null_mut(),
        }
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// The most recently posted phase.
    #[inline]
    pub fn posted(&self) -> Signum {
        self.shared.posted.load()
    }

    /// Sends `phase` to every live mutator. With `weak`, mutators currently in a barrier lose
    /// their fast path for this round.
    pub fn post(&self, phase: Signum, weak: bool) {
        let shared = &*self.shared;
        shared.posted.store(phase);
        // the phase, and whatever collector state goes with it, must be visible before any
        // mutator can observe it in its mailbox
        atomic::fence(SeqCst);
        stats::handshakes_posted();

        for record in shared.registry.live() {
            if weak {
                let _ = cas::change(
                    &record.weak_signal,
                    WeakSignal::InBarrier,
                    WeakSignal::DoHandshake,
                );
            }
            record.mailbox.store(phase);
            trace!(record = record.id(), ?phase, "phase posted");
            // the owner can't finish retiring its record while the guard is held
            let _guard = match record.begin_notify() {
                Some(guard) => guard,
                None => continue,
            };
            if let Err(error) = shared.delivery.notify(record) {
                // only threads that exit without retiring their record get here
                if error.thread_gone() {
                    warn!(record = record.id(), "mutator thread vanished, marking it dead");
                    record.mark_dead();
                    stats::records_retired();
                } else {
                    warn!(record = record.id(), %error, "failed to deliver phase");
                }
            }
        }
    }

    /// Waits until every live mutator acknowledged `phase` (without a pending veto when `weak`).
    ///
    /// Records that die while being waited on are skipped. Returns [`Round::Abandoned`] as soon as
    /// termination is requested.
    pub fn wait(&self, phase: Signum, weak: bool) -> Round {
        let shared = &*self.shared;
        for record in shared.registry.iter() {
            let backoff = Backoff::new();
            let mut spins = 0;
            while !record.is_dead() && !record.has_acknowledged(phase, weak) {
                if unlikely!(shared.termination.is_requested()) {
                    stats::rounds_abandoned();
                    warn!(?phase, record = record.id(), "handshake abandoned on termination");
                    return Round::Abandoned;
                }
                if shared.serviced_inline(record) {
                    dispatch::deliver(shared, record);
                    continue;
                }
                backoff.snooze();
                spins += 1;
            }
            stats::wait_spins(spins);
        }
        debug!(?phase, weak, "handshake converged");
        Round::Converged
    }

    /// [`post`](Handshake::post) followed by [`wait`](Handshake::wait).
    #[inline]
    pub fn handshake(&self, phase: Signum, weak: bool) -> Round {
        self.post(phase, weak);
        self.wait(phase, weak)
    }

    /// Runs one handshake per phase of [`Signum::CYCLE`], stopping at the first abandoned round.
    pub fn run_cycle(&self, weak: bool) -> Round {
        for &phase in Signum::CYCLE.iter() {
            if self.handshake(phase, weak) == Round::Abandoned {
                return Round::Abandoned;
            }
        }
        Round::Converged
    }

    /// Raises the termination flag shared with this handshake.
    #[inline]
    pub fn request_termination(&self) {
        self.shared.termination.request()
    }

    #[inline]
    pub fn termination(&self) -> &Termination {
        &self.shared.termination
    }

    /// Replaces the mark bitmap handed to mutators.
    ///
    /// Must happen before the post of the phase that uses it; the post's fence publishes it.
    pub fn set_bitmap(&self, bitmap: *mut ()) {
        self.shared.bitmap.store(bitmap, Release);
        for record in self.shared.registry.iter() {
            record.set_bitmap(bitmap);
        }
    }

    /// Every record, live or dead, newest first.
    #[inline]
    pub fn records(&self) -> Iter<'_> {
        self.shared.registry.iter()
    }

    /// Every record not marked dead.
    #[inline]
    pub fn live_records(&self) -> impl Iterator<Item = &MutatorRecord> {
        self.shared.registry.live()
    }

    #[inline]
    pub fn live_count(&self) -> usize {
        self.live_records().count()
    }

    /// Frees the records of threads that are gone. Returns the number of records freed.
    ///
    /// # Safety
    ///
    /// No other thread may post, wait, register, or otherwise traverse the records of this
    /// handshake for the duration of the call, and no reference to a purged record may be used
    /// afterwards.
    pub unsafe fn purge_dead(&self) -> usize {
        let purged = self.shared.registry.purge_dead();
        debug!(purged, "dead mutator records purged");
        purged
    }

    /// The calling thread's mutator handle, registering the thread on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRegistered`] if the thread is registered with another handshake.
    #[inline]
    pub fn mutator(&self) -> Result<Mutator, Error> {
        mutator::current(&self.shared)
    }

    /// Drops the calling thread's cached handle. The record is retired once every clone of the
    /// handle is gone.
    #[inline]
    pub fn unregister_current_thread() {
        mutator::unregister_current_thread()
    }

    /// Returns a handshake sharing `shared`.
    #[inline]
    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Handshake { shared }
    }
}
