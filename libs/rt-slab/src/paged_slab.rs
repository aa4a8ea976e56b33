use core::ptr::NonNull;

use rt_dlist::Dlist;
use tracing::{trace, warn};

use crate::page::{PageAllocator, PageHeader, HEADER_SIZE, MAX_RECORD_SIZE, PAGE_SIZE};
use crate::Error;

/// A FIFO/LIFO of variably-sized records stored in a ring of 4 KiB pages.
///
/// Pushing/popping at either end is O(1) amortized; `queue_from_address`
/// is O(1) via page-alignment masking. No record may exceed
/// [`MAX_RECORD_SIZE`], and no record spans a page boundary.
pub struct PagedSlab<A> {
    pages: Dlist<PageHeader>,
    allocator: A,
}

impl<A: PageAllocator> PagedSlab<A> {
    #[must_use]
    pub const fn new(allocator: A) -> Self {
        Self {
            pages: Dlist::new(),
            allocator,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// A stable address identifying this queue for `queue_from_address`
    /// lookups. Requires `&self` to be pinned for the queue's lifetime.
    fn identity(&self) -> NonNull<()> {
        NonNull::from(&self.pages).cast()
    }

    fn alloc_page(&mut self, start: usize, end: usize) -> Result<NonNull<PageHeader>, Error> {
        let block = self.allocator.acquire_page().inspect_err(|_| {
            warn!(kind = "OutOfMemory", "page allocator exhausted");
        })?;
        let header_ptr = block.cast::<PageHeader>();
        PageHeader::init(header_ptr, self.identity(), start as u16, end as u16);
        Ok(header_ptr)
    }

    fn release_page(&mut self, page: NonNull<PageHeader>) -> Result<(), Error> {
        self.allocator.release_page(page.cast())
    }

    /// Appends a record of `size` bytes at the tail, allocating a new tail
    /// page if the current one has no room. Returns the record's address.
    pub fn push_last(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        if size == 0 || size > MAX_RECORD_SIZE {
            return Err(Error::Invalid);
        }
        if let Some(tail) = self.pages.last_ptr() {
            // Safety: `tail` is a live page of this ring.
            let header = unsafe { tail.as_ref() };
            let end = header.end();
            if end + size <= PAGE_SIZE {
                header.set_end(end + size);
                trace!(page = ?tail, size, "push_last in place");
                return Ok(PageHeader::data_ptr(tail, end));
            }
        }
        let page = self.alloc_page(HEADER_SIZE, HEADER_SIZE)?;
        self.pages.insert_last(page);
        // Safety: just inserted, live.
        let header = unsafe { page.as_ref() };
        debug_assert!(HEADER_SIZE + size <= PAGE_SIZE, "record exceeds page capacity");
        header.set_end(HEADER_SIZE + size);
        trace!(page = ?page, size, "push_last on fresh page");
        Ok(PageHeader::data_ptr(page, HEADER_SIZE))
    }

    /// Prepends a record of `size` bytes at the head, allocating a new
    /// head page if the current one has no room. Returns the record's
    /// address.
    pub fn push_first(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        if size == 0 || size > MAX_RECORD_SIZE {
            return Err(Error::Invalid);
        }
        if let Some(head) = self.pages.first_ptr() {
            // Safety: `head` is a live page of this ring.
            let header = unsafe { head.as_ref() };
            let start = header.start();
            if start >= HEADER_SIZE + size {
                header.set_start(start - size);
                trace!(page = ?head, size, "push_first in place");
                return Ok(PageHeader::data_ptr(head, start - size));
            }
        }
        let page = self.alloc_page(PAGE_SIZE, PAGE_SIZE)?;
        self.pages.insert_first(page);
        // Safety: just inserted, live.
        let header = unsafe { page.as_ref() };
        debug_assert!(PAGE_SIZE >= HEADER_SIZE + size, "record exceeds page capacity");
        header.set_start(PAGE_SIZE - size);
        trace!(page = ?page, size, "push_first on fresh page");
        Ok(PageHeader::data_ptr(page, PAGE_SIZE - size))
    }

    /// Address of the record currently at the tail, without popping it.
    pub fn last_record_ptr(&self, size: usize) -> Result<NonNull<u8>, Error> {
        let tail = self.pages.last_ptr().ok_or(Error::NoData)?;
        // Safety: live page.
        let header = unsafe { tail.as_ref() };
        let end = header.end();
        if end < header.start() + size {
            return Err(Error::Overflow);
        }
        Ok(PageHeader::data_ptr(tail, end - size))
    }

    /// Address of the record currently at the head, without popping it.
    pub fn first_record_ptr(&self, size: usize) -> Result<NonNull<u8>, Error> {
        let head = self.pages.first_ptr().ok_or(Error::NoData)?;
        // Safety: live page.
        let header = unsafe { head.as_ref() };
        let start = header.start();
        if header.end() < start + size {
            return Err(Error::Overflow);
        }
        Ok(PageHeader::data_ptr(head, start))
    }

    /// Removes the last `size` bytes. Releases the tail page if it is now
    /// empty.
    pub fn pop_last(&mut self, size: usize) -> Result<(), Error> {
        let tail = self.pages.last_ptr().ok_or(Error::NoData)?;
        // Safety: live page.
        let header = unsafe { tail.as_ref() };
        let end = header.end();
        if end < header.start() + size {
            warn!(kind = "Overflow", "pop_last exceeds live bytes");
            return Err(Error::Overflow);
        }
        header.set_end(end - size);
        if header.start() == header.end() {
            // Safety: `tail` is linked into `self.pages`.
            unsafe { self.pages.remove(tail) };
            self.release_page(tail)?;
            trace!(page = ?tail, "released empty tail page");
        }
        Ok(())
    }

    /// Removes the first `size` bytes. Releases the head page if it is
    /// now empty.
    pub fn pop_first(&mut self, size: usize) -> Result<(), Error> {
        let head = self.pages.first_ptr().ok_or(Error::NoData)?;
        // Safety: live page.
        let header = unsafe { head.as_ref() };
        let start = header.start();
        if header.end() < start + size {
            warn!(kind = "Overflow", "pop_first exceeds live bytes");
            return Err(Error::Overflow);
        }
        header.set_start(start + size);
        if header.start() == header.end() {
            // Safety: `head` is linked into `self.pages`.
            unsafe { self.pages.remove(head) };
            self.release_page(head)?;
            trace!(page = ?head, "released empty head page");
        }
        Ok(())
    }

    /// Shrinks the last record from `old` to `new` bytes in place when
    /// possible; otherwise relocates it (to a reset current page, or a
    /// freshly allocated one), copying the first `min(old, new)` bytes.
    /// Returns the (possibly new) address of the record.
    pub fn resize_last(&mut self, old: usize, new: usize) -> Result<NonNull<u8>, Error> {
        if new > MAX_RECORD_SIZE {
            return Err(Error::Invalid);
        }
        let tail = self.pages.last_ptr().ok_or(Error::NoData)?;
        // Safety: live page.
        let header = unsafe { tail.as_ref() };
        let end = header.end();
        let vacated = end.checked_sub(old).ok_or(Error::Overflow)?;
        if vacated < header.start() {
            return Err(Error::Overflow);
        }
        header.set_end(vacated);

        if vacated + new <= PAGE_SIZE {
            header.set_end(vacated + new);
            return Ok(PageHeader::data_ptr(tail, vacated));
        }

        let copy_len = old.min(new);
        let src = PageHeader::data_ptr(tail, vacated);

        if vacated == header.start() {
            // The record being resized was the only one left; reset the
            // page and grow back in place. `vacated` only coincides with
            // `HEADER_SIZE` for a tail-pushed record; one pushed via
            // `push_first` starts further into the page, so the
            // preserved prefix still has to move.
            header.set_start(HEADER_SIZE);
            header.set_end(HEADER_SIZE + new);
            let dst = PageHeader::data_ptr(tail, HEADER_SIZE);
            if dst != src {
                // Safety: both regions lie within this page's live
                // bytes; `copy` tolerates the overlap between them.
                unsafe { core::ptr::copy(src.as_ptr(), dst.as_ptr(), copy_len) };
            }
            return Ok(dst);
        }

        let new_page = self.alloc_page(HEADER_SIZE, HEADER_SIZE + new)?;
        self.pages.insert_last(new_page);
        let dst = PageHeader::data_ptr(new_page, HEADER_SIZE);
        // Safety: `src`/`dst` are disjoint, non-overlapping regions of
        // live pages, each with at least `copy_len` bytes available.
        unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), copy_len) };
        trace!(from = ?tail, to = ?new_page, copy_len, "resize_last relocated");
        Ok(dst)
    }

    /// Iterates records of a fixed `stride` from first to last. Pushes
    /// onto the tail page mid-iteration are visible iff they land on the
    /// page the cursor currently occupies; pushes that allocate a new
    /// page are not.
    pub fn iter(&self, stride: usize) -> SlabIter<'_, A> {
        SlabIter {
            slab: self,
            page: self.pages.first_ptr(),
            offset: self.pages.first_ptr().map(|p| unsafe { p.as_ref() }.start()).unwrap_or(0),
            stride,
        }
    }

    /// Releases every page back to the allocator, aggregating and
    /// returning the last error encountered while attempting all of them.
    pub fn free(&mut self) -> Result<(), Error> {
        let allocator = &mut self.allocator;
        self.pages.drain_with(|page| allocator.release_page(page.cast()))
    }
}

pub struct SlabIter<'a, A> {
    slab: &'a PagedSlab<A>,
    page: Option<NonNull<PageHeader>>,
    offset: usize,
    stride: usize,
}

impl<'a, A: PageAllocator> Iterator for SlabIter<'a, A> {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let page = self.page?;
            // Safety: `page` is live for as long as `self.slab` is.
            let header = unsafe { page.as_ref() };
            if self.offset + self.stride > header.end() {
                if Some(page) == self.slab.pages.last_ptr() {
                    self.page = None;
                    return None;
                }
                // Safety: `page` is linked into `self.slab.pages`.
                let next = unsafe { self.slab.pages.next_ptr(page) };
                self.page = Some(next);
                // Safety: `next` is a live page.
                self.offset = unsafe { next.as_ref() }.start();
                continue;
            }
            let addr = PageHeader::data_ptr(page, self.offset);
            self.offset += self.stride;
            return Some(addr);
        }
    }
}
