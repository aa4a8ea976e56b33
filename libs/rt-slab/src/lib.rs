//! Paged slab queue: a FIFO/LIFO of variably-sized records backed by a
//! ring of fixed-size 4 KiB pages, plus [`TaskQueue`], the typed
//! specialization that stores one kind of fixed-size record per queue and
//! adds swap-based O(1) removal from the middle.
//!
//! This crate owns the external boundary to the page allocator
//! ([`PageAllocator`]) that the core data model treats as an external
//! collaborator.
#![no_std]

extern crate alloc;

mod error;
mod page;
mod paged_slab;
mod task_queue;

pub use error::Error;
pub use page::{AllocPageAllocator, PageAllocator, MAX_RECORD_SIZE, PAGE_SIZE};
pub use paged_slab::{PagedSlab, SlabIter};
pub use task_queue::TaskQueue;
