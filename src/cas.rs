//! Retry loops over compare-and-swap.
//!
//! Every concurrent structure in `gcsync` is built from the functions in this module; none of them
//! call `compare_exchange` directly. Each operation reads the current value, asks a `proceed`
//! predicate whether an update still makes sense, computes the next value with `update`, and
//! attempts to publish it. The outcome is always reported as a [`CasResult`].
//!
//! # Examples
//!
//! ```
//! use gcsync::cas;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let high_water = AtomicUsize::new(3);
//! let result = cas::increment_to_at_least(&high_water, 10);
//! assert!(result.succeeded);
//! assert_eq!(result.prior, 3);
//! assert_eq!(high_water.load(Ordering::Relaxed), 10);
//!
//! // never lowers the value
//! assert!(!cas::increment_to_at_least(&high_water, 5).succeeded);
//! ```

use crate::stats;
use std::sync::atomic::{
    AtomicBool, AtomicI16, AtomicI32, AtomicI64, AtomicI8, AtomicIsize, AtomicPtr, AtomicU16,
    AtomicU32, AtomicU64, AtomicU8, AtomicUsize,
    Ordering::{Acquire, SeqCst},
};

/// An atomic cell that the retry loops can operate on.
pub trait Atom {
    /// The plain value stored in the cell.
    type Value: Copy + PartialEq;

    /// Loads the current value.
    fn current(&self) -> Self::Value;

    /// Stores `new` if the cell still holds `expected`. Returns the value observed by the
    /// attempt, wrapped in `Ok` on success and `Err` on failure.
    fn cas(&self, expected: Self::Value, new: Self::Value) -> Result<Self::Value, Self::Value>;
}

macro_rules! impl_atom {
    ($($atomic:ty => $value:ty),* $(,)*) => {
        $(
            impl Atom for $atomic {
                type Value = $value;

                #[inline]
                fn current(&self) -> $value {
                    self.load(Acquire)
                }

                #[inline]
                fn cas(&self, expected: $value, new: $value) -> Result<$value, $value> {
                    self.compare_exchange(expected, new, SeqCst, Acquire)
                }
            }
        )*
    };
}

impl_atom! {
    AtomicBool => bool,
    AtomicI8 => i8,
    AtomicI16 => i16,
    AtomicI32 => i32,
    AtomicI64 => i64,
    AtomicIsize => isize,
    AtomicU8 => u8,
    AtomicU16 => u16,
    AtomicU32 => u32,
    AtomicU64 => u64,
    AtomicUsize => usize,
}

impl<T> Atom for AtomicPtr<T> {
    type Value = *mut T;

    #[inline]
    fn current(&self) -> *mut T {
        self.load(Acquire)
    }

    #[inline]
    fn cas(&self, expected: *mut T, new: *mut T) -> Result<*mut T, *mut T> {
        self.compare_exchange(expected, new, SeqCst, Acquire)
    }
}

/// The outcome of a retry operation.
///
/// `prior` is the value the operation last observed: the value that was replaced on success, the
/// losing read after a failed compare-and-swap, or the value the predicate declined. `new` is the
/// value left behind by this operation, which equals `prior` unless `succeeded` is true.
#[must_use]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CasResult<T> {
    pub succeeded: bool,
    pub prior:     T,
    pub new:       T,
}

impl<T: Copy> CasResult<T> {
    #[inline]
    fn swapped(prior: T, new: T) -> Self {
        CasResult {
            succeeded: true,
            prior,
            new,
        }
    }

    #[inline]
    fn unchanged(observed: T) -> Self {
        CasResult {
            succeeded: false,
            prior:     observed,
            new:       observed,
        }
    }

    /// The value of the atom as last seen by the operation.
    #[inline]
    pub fn resulting_value(&self) -> T {
        self.new
    }
}

#[inline]
fn attempt<A, P, U>(
    atom: &A,
    observed: A::Value,
    proceed: &mut P,
    update: &mut U,
) -> Attempt<A::Value>
where
    A: Atom + ?Sized,
    P: FnMut(&A::Value) -> bool,
    U: FnMut(A::Value) -> A::Value,
{
    if !proceed(&observed) {
        return Attempt::Declined(observed);
    }
    let new = update(observed);
    match atom.cas(observed, new) {
        Ok(_) => Attempt::Swapped(observed, new),
        Err(actual) => Attempt::Lost(actual),
    }
}

enum Attempt<T> {
    Swapped(T, T),
    Declined(T),
    Lost(T),
}

/// Makes a single attempt at replacing the current value with `update(current)`.
///
/// If `proceed` rejects the current value nothing is written.
#[inline]
pub fn try_once<A, P, U>(atom: &A, mut proceed: P, mut update: U) -> CasResult<A::Value>
where
    A: Atom + ?Sized,
    P: FnMut(&A::Value) -> bool,
    U: FnMut(A::Value) -> A::Value,
{
    match attempt(atom, atom.current(), &mut proceed, &mut update) {
        Attempt::Swapped(prior, new) => CasResult::swapped(prior, new),
        Attempt::Declined(observed) | Attempt::Lost(observed) => CasResult::unchanged(observed),
    }
}

/// Retries until `update(current)` is published, or until `proceed` rejects a freshly observed
/// value.
///
/// `update` may run many times, and must be prepared to see a different value each time.
#[inline]
pub fn try_loop<A, P, U>(atom: &A, mut proceed: P, mut update: U) -> CasResult<A::Value>
where
    A: Atom + ?Sized,
    P: FnMut(&A::Value) -> bool,
    U: FnMut(A::Value) -> A::Value,
{
    let mut observed = atom.current();
    let mut attempts = 1;
    let result = loop {
        match attempt(atom, observed, &mut proceed, &mut update) {
            Attempt::Swapped(prior, new) => break CasResult::swapped(prior, new),
            Attempt::Declined(observed) => break CasResult::unchanged(observed),
            Attempt::Lost(actual) => {
                observed = actual;
                attempts += 1;
            }
        }
    };
    stats::cas_attempts(attempts);
    result
}

/// Like [`try_loop`], but gives up after `max_tries` attempts, reporting the last observed value.
#[inline]
pub fn try_loop_bounded<A, P, U>(
    atom: &A,
    max_tries: usize,
    mut proceed: P,
    update: U,
) -> CasResult<A::Value>
where
    A: Atom + ?Sized,
    P: FnMut(&A::Value) -> bool,
    U: FnMut(A::Value) -> A::Value,
{
    let mut remaining = max_tries;
    try_loop(
        atom,
        |current| {
            if remaining == 0 {
                false
            } else {
                remaining -= 1;
                proceed(current)
            }
        },
        update,
    )
}

/// Retries `update` unconditionally until it is published.
#[inline]
pub fn update<A, U>(atom: &A, update: U) -> CasResult<A::Value>
where
    A: Atom + ?Sized,
    U: FnMut(A::Value) -> A::Value,
{
    try_loop(atom, |_| true, update)
}

/// Retries `update` unconditionally, giving up after `max_tries` attempts.
#[inline]
pub fn update_bounded<A, U>(atom: &A, max_tries: usize, update: U) -> CasResult<A::Value>
where
    A: Atom + ?Sized,
    U: FnMut(A::Value) -> A::Value,
{
    try_loop_bounded(atom, max_tries, |_| true, update)
}

/// A single compare-and-swap from `from` to `to`.
#[inline]
pub fn change<A>(atom: &A, from: A::Value, to: A::Value) -> CasResult<A::Value>
where
    A: Atom + ?Sized,
{
    match atom.cas(from, to) {
        Ok(_) => CasResult::swapped(from, to),
        Err(actual) => CasResult::unchanged(actual),
    }
}

/// Raises the atom to `target` unless it already holds something at least as large.
///
/// On return the atom holds a value `>= target`.
#[inline]
pub fn increment_to_at_least<A>(atom: &A, target: A::Value) -> CasResult<A::Value>
where
    A: Atom + ?Sized,
    A::Value: PartialOrd,
{
    try_loop(atom, |current| *current < target, |_| target)
}

/// Lowers the atom to `target` unless it already holds something at least as small.
#[inline]
pub fn decrement_to_at_most<A>(atom: &A, target: A::Value) -> CasResult<A::Value>
where
    A: Atom + ?Sized,
    A::Value: PartialOrd,
{
    try_loop(atom, |current| *current > target, |_| target)
}

/// Delivers each element of `items` to exactly one of the callers sharing `cursor`.
///
/// Any number of threads may call this concurrently with the same cursor and slice. An element is
/// claimed by advancing the cursor past it, and only the claiming caller runs `f` on it. The
/// cursor must start at 0 (or at the index of the first element still to be processed).
pub fn process_onceish<T, F>(cursor: &AtomicUsize, items: &[T], mut f: F)
where
    F: FnMut(&T),
{
    let mut next = cursor.current();
    while let Some(item) = items.get(next) {
        let claim = change(cursor, next, next + 1);
        if claim.succeeded {
            f(item);
        }
        next = claim.resulting_value();
    }
}

/// Forward-only variant of [`process_onceish`].
///
/// Elements can't be skipped to by offset, so each caller walks the whole sequence keeping a local
/// position, and only competes for the elements at or past the shared cursor.
pub fn process_onceish_iter<I, F>(cursor: &AtomicUsize, items: I, mut f: F)
where
    I: IntoIterator,
    F: FnMut(I::Item),
{
    let mut next = cursor.current();
    for (position, item) in items.into_iter().enumerate() {
        if position < next {
            continue;
        }
        debug_assert_eq!(position, next, "shared cursor moved backwards");
        let claim = change(cursor, position, position + 1);
        if claim.succeeded {
            f(item);
        }
        next = claim.resulting_value();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam_utils::thread;
    use std::sync::atomic::Ordering::Relaxed;

    #[test]
    fn once_declined_does_not_write() {
        let a = AtomicU32::new(7);
        let r = try_once(&a, |&v| v > 10, |v| v + 1);
        assert!(!r.succeeded);
        assert_eq!(r.prior, 7);
        assert_eq!(r.new, 7);
        assert_eq!(a.load(Relaxed), 7);
    }

    #[test]
    fn once_success() {
        let a = AtomicU32::new(7);
        let r = try_once(&a, |_| true, |v| v * 2);
        assert_eq!(
            r,
            CasResult {
                succeeded: true,
                prior:     7,
                new:       14,
            }
        );
        assert_eq!(a.load(Relaxed), 14);
    }

    #[test]
    fn once_reports_losing_read() {
        let a = AtomicU32::new(1);
        let r = try_once(
            &a,
            |_| true,
            |v| {
                // a competing writer sneaks in between the read and the swap
                a.store(5, Relaxed);
                v + 1
            },
        );
        assert!(!r.succeeded);
        assert_eq!(r.prior, 5);
        assert_eq!(r.resulting_value(), 5);
        assert_eq!(a.load(Relaxed), 5);
    }

    #[test]
    fn loop_retries_until_success() {
        let a = AtomicU32::new(0);
        let mut interference = 3;
        let r = try_loop(
            &a,
            |_| true,
            |v| {
                if interference > 0 {
                    interference -= 1;
                    a.fetch_add(100, Relaxed);
                }
                v + 1
            },
        );
        assert!(r.succeeded);
        assert_eq!(r.prior, 300);
        assert_eq!(a.load(Relaxed), 301);
    }

    #[test]
    fn loop_stops_when_predicate_fails() {
        let a = AtomicU32::new(0);
        let r = try_loop(
            &a,
            |&v| v < 100,
            |v| {
                a.store(100, Relaxed);
                v + 1
            },
        );
        assert!(!r.succeeded);
        assert_eq!(r.prior, 100);
        assert_eq!(a.load(Relaxed), 100);
    }

    #[test]
    fn bounded_gives_up() {
        let a = AtomicU32::new(0);
        let mut calls = 0;
        let r = update_bounded(&a, 4, |v| {
            calls += 1;
            a.fetch_add(1, Relaxed);
            v + 10
        });
        assert!(!r.succeeded);
        assert_eq!(calls, 4);
        assert_eq!(a.load(Relaxed), 4);

        let r = update_bounded(&a, 0, |v| v + 1);
        assert!(!r.succeeded);
        assert_eq!(r.prior, 4);
    }

    #[test]
    fn bounded_with_predicate() {
        let a = AtomicU32::new(3);
        let r = try_loop_bounded(&a, 2, |&v| v % 2 == 1, |v| v + 2);
        assert!(r.succeeded);
        assert_eq!(a.load(Relaxed), 5);
        let r = try_loop_bounded(&a, 2, |&v| v % 2 == 0, |v| v + 2);
        assert!(!r.succeeded);
    }

    #[test]
    fn change_is_a_single_attempt() {
        let a = AtomicUsize::new(1);
        assert!(change(&a, 1, 2).succeeded);
        let r = change(&a, 1, 3);
        assert!(!r.succeeded);
        assert_eq!(r.prior, 2);
        assert_eq!(a.load(Relaxed), 2);
    }

    #[test]
    fn change_on_pointers() {
        let mut x = 0u8;
        let p = AtomicPtr::new(std::ptr::null_mut());
        assert!(change(&p, std::ptr::null_mut(), &mut x as *mut u8).succeeded);
        assert!(!change(&p, std::ptr::null_mut(), std::ptr::null_mut()).succeeded);
    }

    #[test]
    fn increment_never_decreases() {
        let a = AtomicU64::new(50);
        let r = increment_to_at_least(&a, 10);
        assert!(!r.succeeded);
        assert_eq!(a.load(Relaxed), 50);
        let r = increment_to_at_least(&a, 80);
        assert!(r.succeeded);
        assert_eq!((r.prior, r.new), (50, 80));
        assert!(!decrement_to_at_most(&a, 90).succeeded);
        assert!(decrement_to_at_most(&a, 20).succeeded);
        assert_eq!(a.load(Relaxed), 20);
    }

    #[test]
    fn increment_concurrent() {
        const THREAD_COUNT: u64 = 8;
        const ITER_COUNT: u64 = 10_000;
        let a = AtomicU64::new(0);
        thread::scope(|s| {
            for t in 0..THREAD_COUNT {
                let a = &a;
                s.spawn(move |_| {
                    for i in 0..ITER_COUNT {
                        let target = i * THREAD_COUNT + t;
                        let before = a.load(Relaxed);
                        let _ = increment_to_at_least(a, target);
                        let after = a.load(Relaxed);
                        assert!(after >= before);
                        assert!(after >= target);
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(a.load(Relaxed), (ITER_COUNT - 1) * THREAD_COUNT + THREAD_COUNT - 1);
    }

    fn exactly_once(len: usize, callers: usize, forward_only: bool) {
        let items: Vec<usize> = (0..len).collect();
        let seen: Vec<AtomicUsize> = (0..len).map(|_| AtomicUsize::new(0)).collect();
        let cursor = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..callers {
                s.spawn(|_| {
                    let record = |i: &usize| {
                        seen[*i].fetch_add(1, Relaxed);
                    };
                    if forward_only {
                        process_onceish_iter(&cursor, items.iter(), record)
                    } else {
                        process_onceish(&cursor, &items, record)
                    }
                });
            }
        })
        .unwrap();
        for (i, count) in seen.iter().enumerate() {
            assert_eq!(count.load(Relaxed), 1, "element {} not delivered exactly once", i);
        }
        assert_eq!(cursor.load(Relaxed), len);
    }

    #[test]
    fn onceish_random_access() {
        exactly_once(0, 1, false);
        exactly_once(1, 1, false);
        exactly_once(1, 8, false);
        exactly_once(10_000, 1, false);
        exactly_once(10_000, 8, false);
    }

    #[test]
    fn onceish_forward_only() {
        exactly_once(0, 3, true);
        exactly_once(1, 8, true);
        exactly_once(5_000, 1, true);
        exactly_once(5_000, 8, true);
    }

    #[test]
    fn onceish_resumes_from_cursor() {
        let items = [10, 20, 30, 40];
        let cursor = AtomicUsize::new(2);
        let mut out = Vec::new();
        process_onceish(&cursor, &items, |&v| out.push(v));
        assert_eq!(out, vec![30, 40]);

        let cursor = AtomicUsize::new(3);
        let mut out = Vec::new();
        process_onceish_iter(&cursor, items.iter().copied(), |v| out.push(v));
        assert_eq!(out, vec![40]);
    }
}
