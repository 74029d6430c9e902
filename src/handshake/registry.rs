use crate::{cas, handshake::record::MutatorRecord};
use core::{
    fmt::{self, Debug, Formatter},
    ptr::{self, NonNull},
};
use std::sync::atomic::{
    AtomicPtr,
    Ordering::{Acquire, Relaxed},
};

/// The list of every mutator record of a handshake.
///
/// Records are inserted at the head and never unlinked while other threads may be traversing or
/// inserting, so a traversal needs no synchronization beyond the acquire loads of the links.
pub struct Registry {
    head: AtomicPtr<MutatorRecord>,
}

unsafe impl Send for Registry {}
unsafe impl Sync for Registry {}

impl Debug for Registry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl Default for Registry {
    #[inline]
    fn default() -> Self {
        Registry::new()
    }
}

impl Registry {
    #[inline]
    pub const fn new() -> Self {
        Registry {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Links `record` at the head.
    ///
    /// `record` must come from `Box::into_raw` and must not be in any registry. The registry
    /// takes ownership.
    pub(crate) unsafe fn insert(&self, record: NonNull<MutatorRecord>) {
        let raw = record.as_ptr();
        let _ = cas::update(&self.head, |head| {
            record.as_ref().next.store(head, Relaxed);
            raw
        });
    }

    /// The most recently inserted record.
    #[inline]
    pub fn head(&self) -> Option<&MutatorRecord> {
        unsafe { self.head.load(Acquire).as_ref() }
    }

    /// The record inserted before `record`.
    #[inline]
    pub fn next(&self, record: &MutatorRecord) -> Option<&MutatorRecord> {
        unsafe { record.next.load(Acquire).as_ref() }
    }

    /// Every record, live or dead, newest first.
    #[inline]
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            registry: self,
            next:     self.head(),
        }
    }

    /// Every record not marked dead at the time it is reached.
    #[inline]
    pub fn live(&self) -> impl Iterator<Item = &MutatorRecord> {
        self.iter().filter(|record| !record.is_dead())
    }

    /// Unlinks and frees every record that is dead and no longer attached to a thread. Returns
    /// the number of records freed.
    ///
    /// # Safety
    ///
    /// No other thread may traverse or insert into the registry for the duration of the call,
    /// and no reference to a purged record may be used afterwards.
    pub unsafe fn purge_dead(&self) -> usize {
        let mut purged = 0;
        let mut link = &self.head;
        loop {
            let current = link.load(Acquire);
            let record = match current.as_ref() {
                Some(record) => record,
                None => break,
            };
            if record.is_dead() && !record.is_attached() {
                link.store(record.next.load(Acquire), Relaxed);
                drop(Box::from_raw(current));
                purged += 1;
            } else {
                link = &record.next;
            }
        }
        purged
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let mut current = *self.head.get_mut();
        while !current.is_null() {
            let record = unsafe { Box::from_raw(current) };
            current = record.next.load(Relaxed);
        }
    }
}

/// Iterator over the records of a [`Registry`].
pub struct Iter<'a> {
    registry: &'a Registry,
    next:     Option<&'a MutatorRecord>,
}

impl<'a> Debug for Iter<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter")
            .field("next", &self.next.map(MutatorRecord::id))
            .finish()
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a MutatorRecord;

    #[inline]
    fn next(&mut self) -> Option<&'a MutatorRecord> {
        let record = self.next?;
        self.next = self.registry.next(record);
        Some(record)
    }
}
