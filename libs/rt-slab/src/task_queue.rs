use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr::NonNull;

use static_assertions::const_assert;
use tracing::trace;

use crate::page::{PageAllocator, MAX_RECORD_SIZE};
use crate::paged_slab::{PagedSlab, SlabIter};
use crate::Error;

/// A [`PagedSlab`] specialized to store one fixed-size record type `T` per
/// slot, tracking a live element count and supporting the two operations
/// that make the paged slab suitable as a task bucket: O(1)
/// remove-from-middle via swap-with-last ([`TaskQueue::remove_by_swap`])
/// and free-list-driven bulk compaction ([`TaskQueue::compact`]).
///
/// `T` is stored by bitwise value, not behind a pointer: a `TaskQueue`
/// never allocates per element, only per page (the "no heap allocation per
/// task" property the runner depends on).
pub struct TaskQueue<T, A> {
    slab: PagedSlab<A>,
    count: usize,
    _marker: PhantomData<T>,
}

impl<T, A: PageAllocator> TaskQueue<T, A> {
    const RECORD_SIZE: usize = size_of::<T>();

    #[must_use]
    pub const fn new(allocator: A) -> Self {
        // NB: `const_assert!` can't reference a generic's associated const
        // directly without an intervening `const` item; the runtime check
        // in every entry point below enforces the same bound.
        Self {
            slab: PagedSlab::new(allocator),
            count: 0,
            _marker: PhantomData,
        }
    }

    fn check_size() -> Result<(), Error> {
        if Self::RECORD_SIZE == 0 || Self::RECORD_SIZE > MAX_RECORD_SIZE {
            return Err(Error::Invalid);
        }
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn page_count(&self) -> usize {
        self.slab.page_count()
    }

    /// Appends `value` at the tail, returning its (stable until the next
    /// structural edit) address.
    pub fn insert(&mut self, value: T) -> Result<NonNull<T>, Error> {
        Self::check_size()?;
        let addr = self.slab.push_last(Self::RECORD_SIZE)?;
        let ptr = addr.cast::<T>();
        // Safety: `addr` was freshly carved out of a page for exactly
        // `size_of::<T>()` bytes and is not aliased.
        unsafe { ptr.as_ptr().write(value) };
        self.count += 1;
        trace!(count = self.count, "TaskQueue::insert");
        Ok(ptr)
    }

    /// Removes the record at `elem`, returning its value. If `elem` is not
    /// currently the last record, the queue's current last record is
    /// relocated into `elem`'s slot first; `on_move(dest, src)` is called
    /// *after* the relocating bitwise copy, so it can fix up any
    /// intrusive back-links the moved record holds by reading them at
    /// their new (already-copied) location, the same convention
    /// `rt_dlist::Dlist::relink` and `rt_dlist::DualLink::relink` use.
    ///
    /// # Safety
    /// `elem` must be the address of a record currently live in this
    /// queue.
    pub unsafe fn remove_by_swap(
        &mut self,
        elem: NonNull<T>,
        mut on_move: impl FnMut(NonNull<T>, NonNull<T>),
    ) -> T {
        // Safety: the queue is non-empty (`elem` lives in it).
        let last = unsafe {
            self.slab
                .last_record_ptr(Self::RECORD_SIZE)
                .expect("queue is non-empty")
                .cast::<T>()
        };

        // Safety: `elem` is live per caller contract.
        let removed = unsafe { elem.as_ptr().read() };
        if last != elem {
            // Safety: `last` and `elem` are distinct, live, non-overlapping
            // records of the same size.
            unsafe { core::ptr::copy_nonoverlapping(last.as_ptr(), elem.as_ptr(), 1) };
            on_move(elem, last);
        }
        self.slab
            .pop_last(Self::RECORD_SIZE)
            .expect("the record just vacated or swapped out is the current tail");
        self.count -= 1;
        trace!(count = self.count, "TaskQueue::remove_by_swap");
        removed
    }

    /// Removes every record whose address appears in `holes` (given in
    /// ascending queue order, earliest first), compacting survivors
    /// towards the front. Each survivor is shifted into the earliest
    /// freed slot that precedes it, so survivors keep their original
    /// relative order. `on_move(dest, src)` is invoked, after each
    /// relocating copy, for every record actually moved (survivors
    /// already sitting in their final slot are left untouched and do not
    /// trigger a callback).
    ///
    /// # Safety
    /// Every address in `holes` must name a record currently live in this
    /// queue, each appearing exactly once, in queue order.
    pub unsafe fn compact(
        &mut self,
        holes: &[NonNull<T>],
        mut on_move: impl FnMut(NonNull<T>, NonNull<T>),
    ) {
        if holes.is_empty() {
            return;
        }

        let mut hole_idx = 0usize;
        // `write` walks every slot front-to-back, one call per survivor;
        // it always trails `read_addr` by exactly the number of holes
        // already consumed, so it never runs dry before a survivor needs
        // a slot.
        let mut write = self.slab.iter(Self::RECORD_SIZE);
        for read_addr in self.slab.iter(Self::RECORD_SIZE) {
            if hole_idx < holes.len() && read_addr == holes[hole_idx].cast() {
                hole_idx += 1;
                continue;
            }
            let dest = write
                .next()
                .expect("write cursor exhausted before every survivor claimed a slot");
            if dest != read_addr {
                // Safety: `dest` and `read_addr` are distinct, live,
                // non-overlapping records of the same size.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        read_addr.as_ptr(),
                        dest.as_ptr(),
                        Self::RECORD_SIZE,
                    );
                }
                on_move(dest.cast(), read_addr.cast());
            }
        }

        for _ in 0..holes.len() {
            self.slab
                .pop_last(Self::RECORD_SIZE)
                .expect("hole count does not exceed queue length");
        }
        self.count -= holes.len();
        trace!(count = self.count, "TaskQueue::compact");
    }

    /// Iterates live records from first to last.
    pub fn iter(&self) -> TaskIter<'_, T, A> {
        TaskIter {
            inner: self.slab.iter(Self::RECORD_SIZE),
            _marker: PhantomData,
        }
    }

    /// Releases every page back to the allocator, aggregating and
    /// returning the last error encountered while attempting all of them.
    /// Does not run `T`'s destructor on any still-live record: callers
    /// must have already extracted or are intentionally discarding
    /// whatever state those records held.
    pub fn free(&mut self) -> Result<(), Error> {
        self.count = 0;
        self.slab.free()
    }
}

pub struct TaskIter<'a, T, A> {
    inner: SlabIter<'a, A>,
    _marker: PhantomData<fn() -> (&'a (), T)>,
}

impl<'a, T, A: PageAllocator> Iterator for TaskIter<'a, T, A> {
    type Item = NonNull<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(NonNull::cast)
    }
}

const _: () = {
    const_assert!(size_of::<u8>() <= MAX_RECORD_SIZE);
};
