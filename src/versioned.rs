//! A slot index bundled with a generation counter, updated together in one atomic word.
//!
//! The generation changes on every successful update, so a thread holding a stale
//! `(index, generation)` pair can never win a compare-and-swap against a head that was popped and
//! pushed back with the same index in the meantime.

use crate::cas::Atom;
use core::fmt::{self, Debug, Formatter};
use std::sync::atomic::{
    AtomicU64,
    Ordering::{Acquire, SeqCst},
};

type Storage = u64;

/// Index used to represent the null link.
pub const NIL: u32 = u32::MAX;

const INDEX_BITS: Storage = 32;
const INDEX_MASK: Storage = (1 << INDEX_BITS) - 1;

#[inline]
const fn pack(index: u32, generation: u32) -> Storage {
    (generation as Storage) << INDEX_BITS | index as Storage
}

#[inline]
const fn index_of(raw: Storage) -> u32 {
    (raw & INDEX_MASK) as u32
}

#[inline]
const fn generation_of(raw: Storage) -> u32 {
    (raw >> INDEX_BITS) as u32
}

/// A snapshot of a versioned link.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Versioned(Storage);

impl Debug for Versioned {
    #[inline(never)]
    #[cold]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Versioned")
            .field("index", &self.index())
            .field("generation", &self.generation())
            .finish()
    }
}

impl Versioned {
    /// The null link at generation 0.
    #[inline]
    pub const fn null() -> Self {
        Versioned(pack(NIL, 0))
    }

    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Versioned(pack(index, generation))
    }

    #[inline]
    pub fn is_null(self) -> bool {
        index_of(self.0) == NIL
    }

    /// The linked index, or None for the null link.
    #[inline]
    pub fn index(self) -> Option<u32> {
        let index = index_of(self.0);
        if index == NIL {
            None
        } else {
            Some(index)
        }
    }

    /// The raw index, `NIL` for the null link.
    #[inline]
    pub fn raw_index(self) -> u32 {
        index_of(self.0)
    }

    #[inline]
    pub fn generation(self) -> u32 {
        generation_of(self.0)
    }

    /// Points at `index` (which may be `NIL`) one generation later.
    ///
    /// The generation wraps after 2^32 updates.
    #[inline]
    pub fn advance(self, index: u32) -> Self {
        Versioned(pack(index, self.generation().wrapping_add(1)))
    }
}

/// An atomic [`Versioned`].
pub struct AtomicVersioned(AtomicU64);

impl Debug for AtomicVersioned {
    #[inline(never)]
    #[cold]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicVersioned").field(&self.load()).finish()
    }
}

impl Default for AtomicVersioned {
    #[inline]
    fn default() -> Self {
        AtomicVersioned::null()
    }
}

impl AtomicVersioned {
    #[inline]
    pub const fn null() -> Self {
        AtomicVersioned(AtomicU64::new(pack(NIL, 0)))
    }

    #[inline]
    pub fn load(&self) -> Versioned {
        Versioned(self.0.load(Acquire))
    }
}

impl Atom for AtomicVersioned {
    type Value = Versioned;

    #[inline]
    fn current(&self) -> Versioned {
        self.load()
    }

    #[inline]
    fn cas(&self, expected: Versioned, new: Versioned) -> Result<Versioned, Versioned> {
        debug_assert!(
            new.generation() != expected.generation() || new == expected,
            "versioned link updated without advancing its generation"
        );
        self.0
            .compare_exchange(expected.0, new.0, SeqCst, Acquire)
            .map(Versioned)
            .map_err(Versioned)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cas;

    #[test]
    fn packing() {
        let v = Versioned::new(17, 3);
        assert_eq!(v.index(), Some(17));
        assert_eq!(v.raw_index(), 17);
        assert_eq!(v.generation(), 3);
        assert!(!v.is_null());

        let null = Versioned::null();
        assert!(null.is_null());
        assert_eq!(null.index(), None);
        assert_eq!(null.generation(), 0);
    }

    #[test]
    fn advance_bumps_generation() {
        let v = Versioned::null().advance(4);
        assert_eq!((v.index(), v.generation()), (Some(4), 1));
        let v = v.advance(NIL);
        assert_eq!((v.index(), v.generation()), (None, 2));
        let wrapped = Versioned::new(0, u32::MAX).advance(0);
        assert_eq!(wrapped.generation(), 0);
    }

    #[test]
    fn stale_pair_loses() {
        let head = AtomicVersioned::null();
        let stale = head.load();
        assert!(cas::change(&head, stale, stale.advance(1)).succeeded);
        let popped = head.load();
        assert!(cas::change(&head, popped, popped.advance(NIL)).succeeded);
        // same index pattern as `stale`, but two generations later
        assert_eq!(head.load().raw_index(), stale.raw_index());
        assert!(!cas::change(&head, stale, stale.advance(7)).succeeded);
    }
}
