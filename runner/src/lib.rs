//! A cooperative, single-threaded task scheduler: tasks are plain
//! function pointers dispatched through a small integer "resume offset"
//! rather than native stacks, stored in a paged-slab arena rather than
//! heap-allocated one at a time.
//!
//! See [`Runner`] for the scheduling loop, [`TaskParam`] for the
//! continuation API task bodies use to describe their own suspension
//! points, and [`wait`] for the synchronization primitives tasks park
//! on.
#![no_std]

extern crate alloc;

mod runner;
mod task;
mod wait;

pub use rt_slab::{AllocPageAllocator, Error, PageAllocator};

pub use runner::{Runner, RunnerConfig};
pub use task::{Command, Reason, TaskFn, TaskId, TaskParam};
pub use wait::{WaitCondition, WaitList};
