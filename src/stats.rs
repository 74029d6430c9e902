//! Statistics collection. Enabled with `--features stats`.
//!
//! Counters are process wide and lock-free, so they can be bumped from inside the phase signal
//! handler. Without the feature every recording function compiles to nothing.

use core::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

#[doc(hidden)]
pub trait Counter {
    type Snapshot: Clone + Default + Debug;

    fn snapshot(&self) -> Self::Snapshot;
}

/// Summary of a recorded distribution.
#[derive(Copy, Clone, Default)]
pub struct SizeSummary {
    pub count: u64,
    pub min:   Option<u64>,
    pub max:   Option<u64>,
    pub total: u64,
}

impl Debug for SizeSummary {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Size")
            .field("count", &self.count)
            .field("min", &self.min)
            .field("max", &self.max)
            .field("total", &self.total)
            .field(
                "avg",
                &if self.count > 0 {
                    Some(self.total as f64 / self.count as f64)
                } else {
                    None
                },
            )
            .finish()
    }
}

#[doc(hidden)]
#[derive(Debug)]
pub struct Size {
    count: AtomicU64,
    total: AtomicU64,
    min:   AtomicU64,
    max:   AtomicU64,
}

impl Size {
    const fn new() -> Self {
        Size {
            count: AtomicU64::new(0),
            total: AtomicU64::new(0),
            min:   AtomicU64::new(u64::MAX),
            max:   AtomicU64::new(0),
        }
    }

    // the retry loops record into this, so it can't be built on them
    fn record(&self, size: u64) {
        let _ = self.count.fetch_add(1, Relaxed);
        let _ = self.total.fetch_add(size, Relaxed);
        let _ = self.min.fetch_min(size, Relaxed);
        let _ = self.max.fetch_max(size, Relaxed);
    }
}

impl Counter for Size {
    type Snapshot = SizeSummary;

    fn snapshot(&self) -> SizeSummary {
        let count = self.count.load(Relaxed);
        let nonempty = |v| if count > 0 { Some(v) } else { None };
        SizeSummary {
            count,
            min: nonempty(self.min.load(Relaxed)),
            max: nonempty(self.max.load(Relaxed)),
            total: self.total.load(Relaxed),
        }
    }
}

#[doc(hidden)]
#[derive(Debug)]
pub struct Event {
    count: AtomicU64,
}

impl Event {
    const fn new() -> Self {
        Event {
            count: AtomicU64::new(0),
        }
    }

    fn happened(&self) {
        let _ = self.count.fetch_add(1, Relaxed);
    }
}

impl Counter for Event {
    type Snapshot = u64;

    fn snapshot(&self) -> u64 {
        self.count.load(Relaxed)
    }
}

macro_rules! stats_func {
    ($(#[$attr:meta])* $name:ident: Event) => {
        #[inline]
        $(#[$attr])*
        pub(crate) fn $name() {
            if cfg!(feature = "stats") {
                COUNTERS.$name.happened()
            }
        }
    };
    ($(#[$attr:meta])* $name:ident: Size) => {
        #[inline]
        $(#[$attr])*
        pub(crate) fn $name(size: usize) {
            if cfg!(feature = "stats") {
                COUNTERS.$name.record(size as u64)
            }
        }
    };
}

macro_rules! stats {
    ($($(#[$attr:meta])* $names:ident: $kinds:ident),* $(,)*) => {
        struct Counters {
            $($names: $kinds),*
        }

        static COUNTERS: Counters = Counters {
            $($names: $kinds::new()),*
        };

        /// A copy of the gcsync statistics at some point in time.
        #[derive(Clone, Default, Debug)]
        pub struct Stats {
            $($(#[$attr])* pub $names: <$kinds as Counter>::Snapshot),*
        }

        /// Returns the statistics collected so far. All zeros unless the `stats` feature is
        /// enabled.
        pub fn snapshot() -> Stats {
            Stats {
                $($names: COUNTERS.$names.snapshot()),*
            }
        }

        $(stats_func!{$(#[$attr])* $names: $kinds})*
    };
}

stats! {
    /// Number of compare-and-swap attempts per retry loop.
    cas_attempts:       Size,

    /// Number of successful pushes (single entries and chains) onto any stack.
    stack_push:         Event,

    /// Number of successful pops from any stack.
    stack_pop:          Event,

    /// Number of phases posted to the registry.
    handshakes_posted:  Event,

    /// Number of handshake rounds cut short by the termination flag.
    rounds_abandoned:   Event,

    /// Number of phase deliveries that were deferred by a disabled mark or sweep signal.
    deferred_signals:   Event,

    /// Number of mutator records created.
    records_registered: Event,

    /// Number of mutator records marked dead.
    records_retired:    Event,

    /// Number of backoff iterations spent waiting for a single record to acknowledge a phase.
    wait_spins:         Size,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn size_summary() {
        let size = Size::new();
        assert_eq!(size.snapshot().count, 0);
        assert_eq!(size.snapshot().min, None);
        size.record(4);
        size.record(1);
        size.record(10);
        let s = size.snapshot();
        assert_eq!(s.count, 3);
        assert_eq!(s.min, Some(1));
        assert_eq!(s.max, Some(10));
        assert_eq!(s.total, 15);
    }

    #[test]
    fn snapshot_is_debug() {
        stack_push();
        let stats = snapshot();
        let text = format!("{:?}", stats);
        assert!(text.contains("stack_push"));
        if cfg!(feature = "stats") {
            assert!(stats.stack_push >= 1);
        } else {
            assert_eq!(stats.stack_push, 0);
        }
    }
}
