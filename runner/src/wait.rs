//! The two wait primitives task bodies park on: a single-waiter exit
//! event embedded in every task record, and a many-waiter wait
//! condition/list an application builds its own synchronization on top
//! of.

use core::ptr::NonNull;

use rt_dlist::{DualLink, Dlist};
use rt_slab::PageAllocator;

use crate::task::{record_from_wait_link, Reason, TaskRecord};

/// A single-waiter exit-notification slot, embedded in every spawned
/// task's record. Created implicitly at spawn; at most one other task
/// may be waiting on it at a time.
pub(crate) struct ExitEvent {
    pub(crate) waiter: DualLink,
}

impl ExitEvent {
    pub(crate) const fn new() -> Self {
        Self {
            waiter: DualLink::new(),
        }
    }

    pub(crate) fn is_linked(&self) -> bool {
        self.waiter.is_linked()
    }

    /// The task currently waiting on this event, if any.
    pub(crate) fn waiter_task<A: PageAllocator>(&self) -> Option<NonNull<TaskRecord<A>>> {
        // Safety: `other_ptr`, if present, always points at some live
        // task's `wait_link` field (the only thing ever paired with an
        // `ExitEvent`'s `waiter`).
        self.waiter
            .other_ptr()
            .map(|link| unsafe { record_from_wait_link(link) })
    }
}

/// A FIFO of blocked tasks, self-headed: an empty list and a detached
/// node both read as "not linked", matching [`Dlist`]'s own sentinel
/// convention.
pub struct WaitList<A: PageAllocator> {
    pub(crate) ring: Dlist<TaskRecord<A>>,
}

impl<A: PageAllocator> Default for WaitList<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: PageAllocator> WaitList<A> {
    #[must_use]
    pub const fn new() -> Self {
        Self { ring: Dlist::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Appends `task` at the tail. O(1).
    pub fn add(&mut self, task: NonNull<TaskRecord<A>>) {
        self.ring.insert_last(task);
    }

    /// Removes and returns the head waiter, if any. O(1).
    pub fn pop_first(&mut self) -> Option<NonNull<TaskRecord<A>>> {
        self.ring.remove_first()
    }

    /// Hands over the whole ring, resetting `self` to empty. O(1).
    pub fn pop_all(&mut self) -> Dlist<TaskRecord<A>> {
        core::mem::take(&mut self.ring)
    }

    /// Concatenates `other` onto the end of `self`, leaving `other` empty. O(1).
    pub fn splice(&mut self, other: &mut Self) {
        self.ring.splice(&mut other.ring);
    }
}

/// A holder tasks park on until woken. Supports any number of
/// simultaneous waiters, served FIFO by [`crate::Runner::wake_one`] /
/// [`crate::Runner::wake_all`].
///
/// The original variable-layout design distinguishes a "direct" first
/// waiter from a chain of additional waiters linked through the first
/// waiter's own links, to avoid a separate ring head allocation. Since
/// every waiter here is already a fixed-size [`TaskRecord`] with its own
/// `ring` field, that distinction collapses to a single [`Dlist`] with
/// no behavioral difference (see `DESIGN.md`).
pub struct WaitCondition<A: PageAllocator> {
    pub(crate) waiters: WaitList<A>,
}

impl<A: PageAllocator> Default for WaitCondition<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: PageAllocator> WaitCondition<A> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            waiters: WaitList::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }
}

/// The reason code threaded through a plain `wait`/wake pair, distinct
/// from an exit code only in naming: both are carried in
/// [`crate::task::TaskParam::reason`].
pub type WakeReason = Reason;
