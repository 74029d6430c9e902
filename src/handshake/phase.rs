use crate::cas::Atom;
use core::fmt::{self, Debug, Formatter};
use std::sync::atomic::{
    AtomicU8,
    Ordering::{Acquire, Release, SeqCst},
};

/// A collection phase. Phases are totally ordered in the order they are declared.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Signum {
    /// No phase has been acknowledged yet.
    Init = 0,
    Sync1,
    Sync2,
    /// Mark: the handler scans the mutator's stack and registers.
    Async,
    /// `Async`, redelivered by a mutator to itself after re-enabling the mark signal.
    DeferredAsync,
    Sweep,
    /// `Sweep`, redelivered by a mutator to itself after re-enabling the sweep signal.
    DeferredSweep,
}

impl Signum {
    /// The phases of one collection, in posting order.
    pub const CYCLE: [Signum; 4] = [Signum::Sync1, Signum::Sync2, Signum::Async, Signum::Sweep];

    /// The phase a delivery of `self` is acknowledged as.
    #[inline]
    pub fn primary(self) -> Signum {
        match self {
            Signum::DeferredAsync => Signum::Async,
            Signum::DeferredSweep => Signum::Sweep,
            other => other,
        }
    }

    /// The deferred variant of a phase that can be deferred.
    #[inline]
    pub fn deferred(self) -> Option<Signum> {
        match self {
            Signum::Async | Signum::DeferredAsync => Some(Signum::DeferredAsync),
            Signum::Sweep | Signum::DeferredSweep => Some(Signum::DeferredSweep),
            _ => None,
        }
    }

    #[inline]
    pub fn is_deferred(self) -> bool {
        self != self.primary()
    }

    /// The next primary phase of the collection cycle. `Sweep` wraps around to `Sync1`.
    #[inline]
    pub fn successor(self) -> Signum {
        match self.primary() {
            Signum::Init => Signum::Sync1,
            Signum::Sync1 => Signum::Sync2,
            Signum::Sync2 => Signum::Async,
            Signum::Async => Signum::Sweep,
            _ => Signum::Sync1,
        }
    }

    #[inline]
    fn from_raw(raw: u8) -> Signum {
        match raw {
            0 => Signum::Init,
            1 => Signum::Sync1,
            2 => Signum::Sync2,
            3 => Signum::Async,
            4 => Signum::DeferredAsync,
            5 => Signum::Sweep,
            6 => Signum::DeferredSweep,
            _ => unreachable!("corrupt phase value {}", raw),
        }
    }
}

/// Whether a mutator may skip the work of the next handshake.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum WeakSignal {
    /// The mutator holds no references that need scanning, and acknowledges phases without
    /// running the phase action.
    InBarrier = 0,
    /// The collector vetoed the fast path for the current round.
    DoHandshake,
    /// Normal execution.
    Working,
}

impl WeakSignal {
    #[inline]
    fn from_raw(raw: u8) -> WeakSignal {
        match raw {
            0 => WeakSignal::InBarrier,
            1 => WeakSignal::DoHandshake,
            2 => WeakSignal::Working,
            _ => unreachable!("corrupt weak signal value {}", raw),
        }
    }
}

macro_rules! atomic_enum {
    ($(#[$attr:meta])* $atomic:ident($enum:ident)) => {
        $(#[$attr])*
        pub struct $atomic(AtomicU8);

        impl Debug for $atomic {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($atomic)).field(&self.load()).finish()
            }
        }

        impl $atomic {
            #[inline]
            pub const fn new(value: $enum) -> Self {
                $atomic(AtomicU8::new(value as u8))
            }

            #[inline]
            pub fn load(&self) -> $enum {
                $enum::from_raw(self.0.load(Acquire))
            }

            #[inline]
            pub fn store(&self, value: $enum) {
                self.0.store(value as u8, Release)
            }

            #[inline]
            pub fn swap(&self, value: $enum) -> $enum {
                $enum::from_raw(self.0.swap(value as u8, SeqCst))
            }
        }

        impl Atom for $atomic {
            type Value = $enum;

            #[inline]
            fn current(&self) -> $enum {
                self.load()
            }

            #[inline]
            fn cas(&self, expected: $enum, new: $enum) -> Result<$enum, $enum> {
                self.0
                    .compare_exchange(expected as u8, new as u8, SeqCst, Acquire)
                    .map($enum::from_raw)
                    .map_err($enum::from_raw)
            }
        }
    };
}

atomic_enum! {
    /// An atomic [`Signum`].
    AtomicSignum(Signum)
}

atomic_enum! {
    /// An atomic [`WeakSignal`].
    AtomicWeakSignal(WeakSignal)
}
