//! A lock-free LIFO pool of entries.
//!
//! [`LfStack`] is an intrusive singly linked stack whose head is a [`Versioned`] link. Entries live
//! in a chunked arena owned by the stack. Chunks are never released before the stack itself is
//! dropped, so a thread that read a stale head can always load that node's `next` link; the
//! generation in the head makes sure such a thread can never publish anything based on it.
//!
//! Vacant slots are kept on the arena's own free list, which uses the exact same versioned-head
//! algorithm as the stack.
//!
//! # Examples
//!
//! ```
//! use gcsync::stack::LfStack;
//!
//! let stack = LfStack::new();
//! stack.push_value("segment a").unwrap();
//!
//! let mut chain = stack.chain();
//! chain.push(stack.allocate("segment b").unwrap());
//! chain.push(stack.allocate("segment c").unwrap());
//! stack.push_chain(chain);
//!
//! assert_eq!(stack.pop_value(), Some("segment c"));
//! assert_eq!(stack.pop_value(), Some("segment b"));
//! assert_eq!(stack.pop_value(), Some("segment a"));
//! assert_eq!(stack.pop_value(), None);
//! ```

use crate::{
    cas,
    config::StackConfig,
    error::{AllocError, ConfigError},
    stats,
    versioned::{AtomicVersioned, Versioned, NIL},
};
use core::{
    cell::UnsafeCell,
    fmt::{self, Debug, Formatter},
    marker::PhantomData,
    mem::{self, ManuallyDrop, MaybeUninit},
    ops::{Deref, DerefMut},
    ptr,
};
use crossbeam_utils::CachePadded;
use std::sync::atomic::{
    AtomicPtr, AtomicU32,
    Ordering::{Acquire, Relaxed},
};

struct Node<T> {
    next:  AtomicU32,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Node<T> {
    #[inline]
    fn vacant() -> Self {
        Node {
            next:  AtomicU32::new(NIL),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Backing storage for the entries of one stack.
///
/// Chunk `k` holds `first_len << k` entries (the last one is cut short at `capacity`), so the
/// chunk table has at most one slot per bit of a link index however large the capacity.
struct Arena<T> {
    chunks:    Box<[AtomicPtr<Node<T>>]>,
    first_len: usize,
    capacity:  u32,
    /// Number of slots ever handed out. Slots below this mark are either linked somewhere or on
    /// the free list.
    bump:      AtomicU32,
    free:      CachePadded<AtomicVersioned>,
}

/// Index of the first slot of chunk `chunk`, and the chunk's length.
#[inline]
fn chunk_span(first_len: usize, capacity: usize, chunk: usize) -> (usize, usize) {
    let start = first_len.saturating_mul((1 << chunk) - 1);
    let len = first_len.saturating_mul(1 << chunk);
    (start, len.min(capacity.saturating_sub(start)))
}

/// The chunk holding slot `index`, and the slot's offset in it.
#[inline]
fn locate(first_len: usize, index: usize) -> (usize, usize) {
    let q = index / first_len + 1;
    let chunk = mem::size_of::<usize>() * 8 - 1 - q.leading_zeros() as usize;
    (chunk, index - first_len * ((1 << chunk) - 1))
}

impl<T> Arena<T> {
    fn new(config: &StackConfig) -> Self {
        let capacity = config.capacity;
        let first_len = config.chunk_len;
        let max_chunks = mem::size_of::<usize>() * 8;
        let mut chunk_count = 0;
        while chunk_count < max_chunks && chunk_span(first_len, capacity, chunk_count).1 != 0 {
            chunk_count += 1;
        }
        Arena {
            chunks: (0..chunk_count)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
            first_len,
            capacity: capacity as u32,
            bump: AtomicU32::new(0),
            free: CachePadded::new(AtomicVersioned::null()),
        }
    }

    #[inline]
    fn chunk_len(&self, chunk: usize) -> usize {
        chunk_span(self.first_len, self.capacity as usize, chunk).1
    }

    /// Returns the node at `index`.
    ///
    /// `index` must have been returned by `claim` on this arena.
    #[inline]
    fn node(&self, index: u32) -> &Node<T> {
        let (chunk, offset) = locate(self.first_len, index as usize);
        let chunk = self.chunks[chunk].load(Acquire);
        debug_assert!(!chunk.is_null(), "node lookup in a chunk that was never installed");
        // installed chunks are never released before the arena is dropped
        unsafe { &*chunk.add(offset) }
    }

    #[inline(never)]
    #[cold]
    fn install_chunk(&self, chunk: usize) {
        let slot = &self.chunks[chunk];
        if !slot.load(Acquire).is_null() {
            return;
        }
        let len = self.chunk_len(chunk);
        let fresh: Box<[Node<T>]> = (0..len).map(|_| Node::vacant()).collect();
        let raw = Box::into_raw(fresh) as *mut Node<T>;
        if !cas::change(slot, ptr::null_mut(), raw).succeeded {
            // another thread installed the chunk first
            unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(raw, len))) }
        }
    }

    /// Takes a vacant slot, reusing freed slots before carving new ones.
    fn claim(&self) -> Result<u32, AllocError> {
        if let Some(index) = self.pop_index(&self.free) {
            return Ok(index);
        }
        let capacity = self.capacity;
        let bumped = cas::try_loop(&self.bump, |&used| used < capacity, |used| used + 1);
        if unlikely!(!bumped.succeeded) {
            // a slot may have been freed while we were racing for the bump
            return self.pop_index(&self.free).ok_or(AllocError::Exhausted {
                capacity: capacity as usize,
            });
        }
        let index = bumped.prior;
        let chunk = locate(self.first_len, index as usize).0;
        if self.chunks[chunk].load(Acquire).is_null() {
            self.install_chunk(chunk);
        }
        Ok(index)
    }

    /// Returns a slot whose value has already been dropped or moved out.
    #[inline]
    fn release(&self, index: u32) {
        self.push_run(&self.free, index, index)
    }

    /// Links the run `first ..= last` (already chained through `next`) in front of `head`.
    #[inline]
    fn push_run(&self, head: &AtomicVersioned, first: u32, last: u32) {
        let last = self.node(last);
        let _ = cas::update(head, |observed| {
            last.next.store(observed.raw_index(), Relaxed);
            observed.advance(first)
        });
    }

    /// Unlinks the node at the front of `head`.
    #[inline]
    fn pop_index(&self, head: &AtomicVersioned) -> Option<u32> {
        let popped = cas::try_loop(
            head,
            |observed| !observed.is_null(),
            |observed| {
                let next = self.node(observed.raw_index()).next.load(Relaxed);
                observed.advance(next)
            },
        );
        if popped.succeeded {
            popped.prior.index()
        } else {
            None
        }
    }

    #[inline]
    unsafe fn value_ptr(&self, index: u32) -> *mut T {
        (*self.node(index).value.get()).as_mut_ptr()
    }
}

impl<T> Drop for Arena<T> {
    fn drop(&mut self) {
        let (first_len, capacity) = (self.first_len, self.capacity as usize);
        for (k, chunk) in self.chunks.iter_mut().enumerate() {
            let raw = *chunk.get_mut();
            if !raw.is_null() {
                let len = chunk_span(first_len, capacity, k).1;
                // values were dropped by the owning stack, nodes only hold MaybeUninit
                unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(raw, len))) }
            }
        }
    }
}

/// A lock-free stack of `T`s with its own entry allocator.
///
/// All operations except [`clear`](LfStack::clear) may be called concurrently from any number of
/// threads. Contention only costs retries; nothing here ever blocks.
pub struct LfStack<T> {
    head:  CachePadded<AtomicVersioned>,
    arena: Arena<T>,
}

unsafe impl<T: Send> Send for LfStack<T> {}
unsafe impl<T: Send> Sync for LfStack<T> {}

impl<T> Debug for LfStack<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LfStack")
            .field("head", &self.version())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl<T> Default for LfStack<T> {
    #[inline]
    fn default() -> Self {
        LfStack::new()
    }
}

impl<T> LfStack<T> {
    /// Creates an empty stack using the default [`StackConfig`].
    #[inline]
    pub fn new() -> Self {
        LfStack::with_config(&StackConfig::default())
    }

    /// Creates an empty stack. No slots are allocated until the first `allocate`.
    ///
    /// # Panics
    ///
    /// Panics if `config` is invalid, see [`try_with_config`](LfStack::try_with_config).
    pub fn with_config(config: &StackConfig) -> Self {
        match LfStack::try_with_config(config) {
            Ok(stack) => stack,
            Err(e) => panic!("invalid `StackConfig`: {}", e),
        }
    }

    /// Creates an empty stack, or reports why `config` is invalid.
    pub fn try_with_config(config: &StackConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(LfStack {
            head:  CachePadded::new(AtomicVersioned::null()),
            arena: Arena::new(config),
        })
    }

    /// The maximum number of entries that can be allocated at once.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.arena.capacity as usize
    }

    /// Returns true if the stack was empty at the time of the call.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load().is_null()
    }

    /// A snapshot of the versioned head, for diagnostics.
    #[inline]
    pub fn version(&self) -> Versioned {
        self.head.load()
    }

    /// Allocates an unlinked entry holding `value`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::Exhausted`] if `capacity` entries are already allocated.
    #[inline]
    pub fn allocate(&self, value: T) -> Result<Entry<'_, T>, AllocError> {
        let index = self.arena.claim()?;
        unsafe {
            self.arena.value_ptr(index).write(value);
        }
        self.arena.node(index).next.store(NIL, Relaxed);
        Ok(Entry {
            stack: self,
            index,
            phantom: PhantomData,
        })
    }

    /// Drops the entry's value and returns its slot to the allocator.
    #[inline]
    pub fn deallocate(&self, entry: Entry<'_, T>) {
        assert!(entry.belongs_to(self), "entry deallocated into a foreign stack");
        drop(entry)
    }

    /// Pushes a single entry.
    ///
    /// # Panics
    ///
    /// Panics if `entry` was allocated by a different stack.
    #[inline]
    pub fn push(&self, entry: Entry<'_, T>) {
        assert!(entry.belongs_to(self), "entry pushed onto a foreign stack");
        let index = entry.into_index();
        self.arena.push_run(&self.head, index, index);
        stats::stack_push();
    }

    /// Splices a pre-linked run of entries in with a single head update.
    ///
    /// The last entry pushed onto `chain` ends up on top of the stack.
    #[inline]
    pub fn push_chain(&self, chain: Chain<'_, T>) {
        assert!(
            ptr::eq(chain.stack, self),
            "chain pushed onto a foreign stack"
        );
        if let Some((first, last)) = chain.into_run() {
            self.arena.push_run(&self.head, first, last);
            stats::stack_push();
        }
    }

    /// Pops the most recently pushed entry, or returns None if the stack is empty.
    #[inline]
    pub fn pop(&self) -> Option<Entry<'_, T>> {
        let index = self.arena.pop_index(&self.head)?;
        stats::stack_pop();
        self.arena.node(index).next.store(NIL, Relaxed);
        Some(Entry {
            stack: self,
            index,
            phantom: PhantomData,
        })
    }

    /// Allocates and pushes `value`.
    #[inline]
    pub fn push_value(&self, value: T) -> Result<(), AllocError> {
        self.push(self.allocate(value)?);
        Ok(())
    }

    /// Pops and deallocates the top entry, returning its value.
    #[inline]
    pub fn pop_value(&self) -> Option<T> {
        self.pop().map(Entry::into_inner)
    }

    /// Starts an empty chain of entries belonging to this stack.
    #[inline]
    pub fn chain(&self) -> Chain<'_, T> {
        Chain {
            stack: self,
            run:   None,
            len:   0,
        }
    }

    /// The entry on top of the stack at the time of the call.
    ///
    /// Traversal with `head`/`next` never blocks writers, and writers may invalidate it at any
    /// time: the returned slots are positions, not ownership.
    #[inline]
    pub fn head(&self) -> Option<Slot> {
        self.head.load().index().map(Slot)
    }

    /// The entry linked after `slot`.
    #[inline]
    pub fn next(&self, slot: Slot) -> Option<Slot> {
        debug_assert!(slot.0 < self.arena.bump.load(Relaxed), "slot out of bounds");
        let next = self.arena.node(slot.0).next.load(Acquire);
        if next == NIL {
            None
        } else {
            Some(Slot(next))
        }
    }

    /// Reads the value in `slot`.
    ///
    /// # Safety
    ///
    /// The entry at `slot` must still be linked into the stack, and must stay linked for the
    /// lifetime of the returned reference, i.e. no other thread may pop it.
    #[inline]
    pub unsafe fn peek(&self, slot: Slot) -> &T {
        &*self.arena.value_ptr(slot.0)
    }

    /// Iterates over the values from top to bottom. `&mut self` guarantees nothing is popped while
    /// iterating.
    #[inline]
    pub fn iter(&mut self) -> Iter<'_, T> {
        Iter {
            next:  self.head(),
            stack: self,
        }
    }

    /// Pops and deallocates every entry.
    ///
    /// Requires exclusive access: this is the teardown path and may not race with other users of
    /// the stack.
    pub fn clear(&mut self) {
        while let Some(entry) = self.pop() {
            drop(entry)
        }
    }
}

impl<T> Drop for LfStack<T> {
    fn drop(&mut self) {
        self.clear()
    }
}

/// The position of an entry observed during traversal.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Slot(u32);

impl Slot {
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Iterator returned by [`LfStack::iter`].
pub struct Iter<'a, T> {
    stack: &'a LfStack<T>,
    next:  Option<Slot>,
}

impl<'a, T> Debug for Iter<'a, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter").field("next", &self.next).finish()
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    #[inline]
    fn next(&mut self) -> Option<&'a T> {
        let slot = self.next?;
        self.next = self.stack.next(slot);
        // `iter` borrows the stack mutably, so every linked entry stays linked
        Some(unsafe { self.stack.peek(slot) })
    }
}

/// Sole ownership of an allocated entry that is not linked into the stack.
///
/// Dropping the entry drops its value and returns the slot to the stack's allocator.
pub struct Entry<'a, T> {
    stack:   &'a LfStack<T>,
    index:   u32,
    phantom: PhantomData<T>,
}

impl<'a, T: Debug> Debug for Entry<'a, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("index", &self.index)
            .field("value", &**self)
            .finish()
    }
}

impl<'a, T> Entry<'a, T> {
    #[inline]
    fn belongs_to(&self, stack: &LfStack<T>) -> bool {
        ptr::eq(self.stack, stack)
    }

    #[inline]
    fn into_index(self) -> u32 {
        let index = self.index;
        mem::forget(self);
        index
    }

    /// Moves the value out and deallocates the entry.
    #[inline]
    pub fn into_inner(self) -> T {
        let this = ManuallyDrop::new(self);
        let value = unsafe { this.stack.arena.value_ptr(this.index).read() };
        this.stack.arena.release(this.index);
        value
    }
}

impl<'a, T> Deref for Entry<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // an unlinked entry is only reachable through its owner
        unsafe { &*self.stack.arena.value_ptr(self.index) }
    }
}

impl<'a, T> DerefMut for Entry<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.stack.arena.value_ptr(self.index) }
    }
}

impl<'a, T> Drop for Entry<'a, T> {
    #[inline]
    fn drop(&mut self) {
        unsafe { ptr::drop_in_place(self.stack.arena.value_ptr(self.index)) }
        self.stack.arena.release(self.index)
    }
}

/// A run of entries linked together ahead of a single [`LfStack::push_chain`].
pub struct Chain<'a, T> {
    stack: &'a LfStack<T>,
    /// (top, bottom) of the run
    run:   Option<(u32, u32)>,
    len:   usize,
}

impl<'a, T> Debug for Chain<'a, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain").field("len", &self.len).finish()
    }
}

impl<'a, T> Chain<'a, T> {
    /// Links `entry` on top of the run.
    ///
    /// # Panics
    ///
    /// Panics if `entry` was allocated by a different stack.
    #[inline]
    pub fn push(&mut self, entry: Entry<'a, T>) -> &mut Self {
        assert!(
            entry.belongs_to(self.stack),
            "entry added to a chain of a foreign stack"
        );
        let index = entry.into_index();
        let node = self.stack.arena.node(index);
        self.run = match self.run {
            None => {
                node.next.store(NIL, Relaxed);
                Some((index, index))
            }
            Some((top, bottom)) => {
                node.next.store(top, Relaxed);
                Some((index, bottom))
            }
        };
        self.len += 1;
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn into_run(self) -> Option<(u32, u32)> {
        let run = self.run;
        mem::forget(self);
        run
    }
}

impl<'a, T> Drop for Chain<'a, T> {
    fn drop(&mut self) {
        let arena = &self.stack.arena;
        let mut cursor = self.run.map(|(top, _)| top).unwrap_or(NIL);
        while cursor != NIL {
            let next = arena.node(cursor).next.load(Relaxed);
            unsafe { ptr::drop_in_place(arena.value_ptr(cursor)) }
            arena.release(cursor);
            cursor = next;
        }
    }
}
