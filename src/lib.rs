//! Synchronization core of a concurrent, multi-threaded garbage collector.
//!
//! `gcsync` provides the pieces a mostly-concurrent collector needs to coordinate with the
//! application threads it collects for, without ever holding a lock that a signal handler could
//! need:
//!
//! * [`cas`], retry loops over compare-and-swap. Everything else is built on them.
//! * [`stack::LfStack`], a lock-free stack with a versioned head and its own entry allocator.
//! * [`handshake::Handshake`], which drives every registered mutator thread through the phases of a
//!   collection, delivering each phase with a signal (or at safepoints) and waiting until every
//!   live thread has acknowledged it.
//!
//! # Examples
//!
//! Moving work between threads with a lock-free stack:
//! ```
//! use gcsync::stack::LfStack;
//!
//! let stack = LfStack::new();
//! crossbeam_utils::thread::scope(|s| {
//!     for i in 0..4 {
//!         let stack = &stack;
//!         s.spawn(move |_| stack.push_value(i).unwrap());
//!     }
//! })
//! .unwrap();
//!
//! let mut popped: Vec<_> = std::iter::from_fn(|| stack.pop_value()).collect();
//! popped.sort();
//! assert_eq!(popped, vec![0, 1, 2, 3]);
//! ```
//!
//! Running a collection cycle over a polled mutator:
//! ```
//! use gcsync::{
//!     config::{Config, DeliveryMode},
//!     handshake::{Handshake, MutatorRecord, Round, Signum},
//! };
//!
//! let handshake = Handshake::builder()
//!     .config(Config {
//!         delivery: DeliveryMode::Poll,
//!         ..Default::default()
//!     })
//!     .action(|_: &MutatorRecord, phase: Signum| assert!(!phase.is_deferred()))
//!     .build()
//!     .unwrap();
//!
//! // the collector itself is a mutator, serviced while it waits
//! let mutator = handshake.mutator().unwrap();
//! assert_eq!(handshake.run_cycle(false), Round::Converged);
//! assert_eq!(mutator.status(), Signum::Sweep);
//! ```
//!
//! # Features
//!
//! * Busy waiting and atomics only. No mutex or condition variable is taken anywhere, so a thread
//!   interrupted at an arbitrary instruction never blocks a handshake.
//! * Threads that exit (or vanish) are marked dead and skipped; a handshake never waits on them.
//! * A process wide [`Termination`](handshake::Termination) flag abandons rounds in progress.
//! * Mutators can defer the mark and sweep phases around non-reentrant code, and can skip the
//!   per-phase work while in a barrier unless the collector vetoes it.
//! * `stats` feature: lock-free counters, see [`stats`].

#![cfg_attr(feature = "nightly", feature(core_intrinsics))]
#![cfg_attr(feature = "nightly", allow(internal_features))]
#![warn(macro_use_extern_crate)]
#![warn(missing_debug_implementations)]
#![warn(unused_lifetimes)]
#![cfg_attr(not(test), warn(unused_results))]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rust_2018_compatibility)]
#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]

#[macro_use]
mod internal;

pub mod cas;
pub mod config;
pub mod error;
pub mod handshake;
pub mod mutator;
pub mod stack;
pub mod stats;
pub mod versioned;

pub use error::Error;


#[cfg(test)]
mod panic {
    use crate::{
        config::{Config, DeliveryMode},
        handshake::{Handshake, Signum},
        stack::LfStack,
    };
    use std::{
        panic::{self, AssertUnwindSafe},
        thread,
    };

    #[test]
    fn chain_released_on_unwind() {
        let stack = LfStack::with_config(&crate::config::StackConfig {
            capacity:  4,
            chunk_len: 4,
        });
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut chain = stack.chain();
            for i in 0..4 {
                chain.push(stack.allocate(i).unwrap());
            }
            panic!("test panic")
        }));
        assert!(result.is_err());
        // every slot came back
        let mut chain = stack.chain();
        for i in 0..4 {
            chain.push(stack.allocate(i).unwrap());
        }
        stack.push_chain(chain);
        assert_eq!(stack.pop_value(), Some(3));
    }

    #[test]
    fn deferred_scope_restored_on_unwind() {
        let handshake = Handshake::builder()
            .config(Config {
                delivery: DeliveryMode::Poll,
                ..Default::default()
            })
            .build()
            .unwrap();
        thread::spawn(move || {
            let m = handshake.mutator().unwrap();
            handshake.post(Signum::Sync1, false);
            handshake.post(Signum::Sync2, false);
            handshake.post(Signum::Async, false);
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                m.with_signals_deferred(|| {
                    m.safepoint();
                    panic!("test panic")
                })
            }));
            assert!(result.is_err());
            assert!(!m.record().mark_signal_disabled());
            assert_eq!(m.status(), Signum::Async);
        })
        .join()
        .unwrap();
    }
}
