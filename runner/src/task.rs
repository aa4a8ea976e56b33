//! Task identity, the fixed-size task record, and the continuation API
//! (`start`/`yield_now`/`wait`/`wait_exit`/`exit`) task bodies use to
//! describe their own suspension points.

use core::cell::Cell;
use core::marker::PhantomData;
use core::mem::offset_of;
use core::ptr::NonNull;

use rt_dlist::{DualLink, Linked, Links};
use rt_slab::PageAllocator;

use crate::runner::Runner;
use crate::wait::{ExitEvent, WaitCondition};

/// Monotonically increasing task identity, assigned at spawn time.
///
/// Single-threaded: backed by a plain counter, not an atomic one, since a
/// [`Runner`] never hands tasks to more than one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl core::fmt::Display for TaskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) struct IdSource {
    next: Cell<u64>,
}

impl IdSource {
    pub(crate) const fn new() -> Self {
        Self { next: Cell::new(1) }
    }

    pub(crate) fn next(&self) -> TaskId {
        let id = self.next.get();
        self.next.set(id + 1);
        TaskId(id)
    }
}

/// The four invocation signals fixed by this scheduler's wire contract,
/// plus `Abort`, used only during [`Runner::abort_all`] teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Run = 0,
    Continue = 1,
    Exit = 2,
    Wait = 3,
    Abort = 4,
}

/// The value a task reports when it exits, or that a waiter reads back
/// after being woken: an opaque signed code, meaning is entirely up to
/// the application (commonly 0 for success).
pub type Reason = i32;

pub type TaskFn<A> = fn(&mut TaskParam<'_, A>, Command) -> Command;

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    Admission,
    Runnable,
    Waiting,
}

/// What a task is waiting on, set by [`TaskParam::wait`] /
/// [`TaskParam::wait_exit`] and read back by the runner after the task
/// body returns [`Command::Wait`].
pub(crate) enum WaitTarget<A: PageAllocator> {
    Condition(NonNull<WaitCondition<A>>),
    Exit(NonNull<TaskRecord<A>>),
}

/// One fixed-size record per spawned task: the superset of every
/// optional field the original variable-layout design would carve out
/// per flag combination. See `DESIGN.md` for why a single shape was
/// chosen over per-flag-combination sizing.
pub(crate) struct TaskRecord<A: PageAllocator> {
    /// Ring membership: at any moment, a record is linked into at most
    /// one of: the admission bucket, the runnable bucket, the wake-up
    /// bucket, or some [`WaitCondition`]'s waiter ring. Never more than
    /// one at a time (invariant: a task lives in exactly one bucket).
    pub(crate) ring: Links<TaskRecord<A>>,
    /// Which [`rt_dlist::Dlist`] currently owns `ring`, if any — needed
    /// so a paged-slab compaction swap can call `relink` on the right
    /// ring after relocating this record's bytes elsewhere in the
    /// arena. Requires whichever `Dlist` this points at to stay at a
    /// pinned address for as long as any task it holds is live (the
    /// same requirement `PagedSlab::identity` documents for its own
    /// pointer).
    pub(crate) owning_ring: Cell<Option<NonNull<rt_dlist::Dlist<TaskRecord<A>>>>>,
    /// Set when this task is waiting on another task's exit event;
    /// pairs with that task's `exit_event.waiter`.
    pub(crate) wait_link: DualLink,
    /// This task's own exit-notification slot: at most one other task
    /// may be waiting on it at a time.
    pub(crate) exit_event: ExitEvent,

    pub(crate) id: TaskId,
    main_fn: TaskFn<A>,
    state_ptr: Cell<*mut ()>,
    resume_offset: Cell<u16>,
    pub(crate) task_state: Cell<TaskState>,
    /// Reason code delivered to a resumed waiter (the exited task's code,
    /// or an application-defined wake reason for condition waits).
    wait_result: Cell<Reason>,
}

// Safety: a `TaskRecord` is only ever touched by the single thread that
// owns its `Runner`.
unsafe impl<A: PageAllocator> Send for TaskRecord<A> {}

impl<A: PageAllocator> TaskRecord<A> {
    pub(crate) fn new(id: TaskId, main_fn: TaskFn<A>, state_ptr: *mut ()) -> Self {
        Self {
            ring: Links::new(),
            owning_ring: Cell::new(None),
            wait_link: DualLink::new(),
            exit_event: ExitEvent::new(),
            id,
            main_fn,
            state_ptr: Cell::new(state_ptr),
            resume_offset: Cell::new(0),
            task_state: Cell::new(TaskState::Admission),
            wait_result: Cell::new(0),
        }
    }

    pub(crate) fn call(&self, param: &mut TaskParam<'_, A>, command: Command) -> Command {
        (self.main_fn)(param, command)
    }

    pub(crate) fn resume_offset(&self) -> u16 {
        self.resume_offset.get()
    }

    pub(crate) fn set_resume_offset(&self, offset: u16) {
        self.resume_offset.set(offset);
    }

    pub(crate) fn wait_result(&self) -> Reason {
        self.wait_result.get()
    }

    pub(crate) fn set_wait_result(&self, reason: Reason) {
        self.wait_result.set(reason);
    }

    /// Re-fixes up this record's back-link fields (the ring it
    /// currently belongs to, its own exit-waiter pairing, and the
    /// pairing of whoever waits on its exit) after its bytes have been
    /// relocated elsewhere in the arena by a paged-slab swap or
    /// compaction.
    ///
    /// # Safety
    /// `dest` must be the already-relocated copy; the record at `src`'s
    /// former address must not be accessed again.
    pub(crate) unsafe fn relink(dest: NonNull<TaskRecord<A>>, src: NonNull<TaskRecord<A>>) {
        // Safety: `dest` is the freshly-copied, live record.
        let rec = unsafe { dest.as_ref() };
        if let Some(mut ring_ptr) = rec.owning_ring.get() {
            // Safety: `ring_ptr` is the `Dlist` that owned `src` before
            // the move; its neighbours still point at `src`.
            unsafe { ring_ptr.as_mut().relink(src, dest) };
        }
        rec.wait_link.relink();
        rec.exit_event.waiter.relink();
    }
}

unsafe impl<A: PageAllocator> Linked for TaskRecord<A> {
    type Handle = NonNull<TaskRecord<A>>;

    fn into_ptr(handle: Self::Handle) -> NonNull<Self> {
        handle
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<Links<Self>> {
        ptr.map_addr(|addr| addr.checked_add(offset_of!(Self, ring)).unwrap())
            .cast()
    }
}

/// Recovers the owning `TaskRecord` from a pointer to its embedded
/// `wait_link`, the way [`Linked::links`] recovers a `Links` field from
/// its owner in reverse.
///
/// # Safety
/// `link` must point at the `wait_link` field of a live `TaskRecord<A>`.
pub(crate) unsafe fn record_from_wait_link<A: PageAllocator>(
    link: NonNull<DualLink>,
) -> NonNull<TaskRecord<A>> {
    link.map_addr(|addr| addr.checked_sub(offset_of!(TaskRecord<A>, wait_link)).unwrap())
        .cast()
}

/// The block passed to every task invocation: the runner back-pointer
/// (for `spawn`/`wake_one`/`wake_all` called from inside a task body),
/// the invoked task's own record, whatever it decides to wait on, and
/// the reason code carried in either direction.
pub struct TaskParam<'r, A: PageAllocator> {
    pub(crate) runner: &'r Runner<A>,
    pub(crate) task: NonNull<TaskRecord<A>>,
    pub(crate) wait_target: Cell<Option<WaitTarget<A>>>,
    pub(crate) reason: Cell<Reason>,
    pub(crate) last_spawned: Cell<Option<NonNull<TaskRecord<A>>>>,
    pub(crate) _marker: PhantomData<&'r ()>,
}

impl<'r, A: PageAllocator> TaskParam<'r, A> {
    pub fn id(&self) -> TaskId {
        // Safety: `self.task` is live for the duration of the invocation.
        unsafe { self.task.as_ref() }.id
    }

    /// The opaque per-task state pointer: initially whatever was passed
    /// to `spawn`, thereafter whatever the task last stored here.
    pub fn state(&self) -> *mut () {
        // Safety: see above.
        unsafe { self.task.as_ref() }.state_ptr.get()
    }

    pub fn set_state(&self, state: *mut ()) {
        // Safety: see above.
        unsafe { self.task.as_ref() }.state_ptr.set(state);
    }

    /// The reason code delivered on resume: the exited task's reported
    /// code after `wait_exit`, or whatever the waker supplied after a
    /// plain `wait`.
    pub fn reason(&self) -> Reason {
        self.reason.get()
    }

    /// Entry point for a task body: dispatches on `command`. `EXIT`
    /// proceeds straight into `on_exit` (cleanup only, no resume-offset
    /// dispatch); every other value — including `RUN`, `CONTINUE`, and
    /// `ABORT` — proceeds into `on_run`, which is expected to switch on
    /// [`TaskParam`]'s resume offset (via whatever state machine the
    /// task's own logic encodes) to pick up where a prior `yield_now`,
    /// `wait`, or `wait_exit` left off. A resume offset of zero means
    /// "start from the top", i.e. behaves as `RUN`.
    pub fn start(
        &mut self,
        command: Command,
        on_run: impl FnOnce(&mut Self, Command) -> Command,
        on_exit: impl FnOnce(&mut Self) -> Command,
    ) -> Command {
        match command {
            Command::Exit => on_exit(self),
            other => on_run(self, other),
        }
    }

    /// The resume offset saved by the most recent `yield_now`/`wait`/
    /// `wait_exit` (zero if this task has never suspended). `on_run`
    /// reads this to dispatch to the right point in the task body's own
    /// state machine, the way a computed-goto would jump to a saved
    /// label address.
    pub fn resume_offset(&self) -> u16 {
        // Safety: see above.
        unsafe { self.task.as_ref() }.resume_offset()
    }

    fn set_resume_offset(&self, offset: u16) {
        // Safety: see above.
        unsafe { self.task.as_ref() }.set_resume_offset(offset);
    }

    /// Yields control back to the runner, to be resumed with `CONTINUE`
    /// at `next_offset` on the next pass.
    pub fn yield_now(&mut self, next_offset: u16) -> Command {
        self.set_resume_offset(next_offset);
        Command::Continue
    }

    /// Waits on `condition`, resuming at `next_offset` once woken.
    pub fn wait(&mut self, condition: &mut WaitCondition<A>, next_offset: u16) -> Command {
        self.wait_target
            .set(Some(WaitTarget::Condition(NonNull::from(condition))));
        self.set_resume_offset(next_offset);
        Command::Wait
    }

    /// Waits on the exit event of the task most recently spawned by this
    /// same invocation, resuming at `next_offset` once it exits. Reads
    /// back the exited task's reported code via [`TaskParam::reason`].
    ///
    /// # Panics
    /// Panics if no task was spawned earlier in this same invocation.
    pub fn wait_exit(&mut self, next_offset: u16) -> Command {
        let child = self
            .last_spawned
            .get()
            .expect("wait_exit called without a prior spawn this invocation");
        self.wait_target.set(Some(WaitTarget::Exit(child)));
        self.set_resume_offset(next_offset);
        Command::Wait
    }

    /// Spawns a new task, admitted on the next pass. Records the new
    /// task as the target of a subsequent same-invocation `wait_exit`.
    pub fn spawn(&self, main_fn: TaskFn<A>, state: *mut ()) -> Result<TaskId, rt_slab::Error> {
        let (id, ptr) = self.runner.spawn_record(main_fn, state)?;
        self.last_spawned.set(Some(ptr));
        Ok(id)
    }

    pub fn wake_one(&self, condition: &mut WaitCondition<A>) -> Result<(), rt_slab::Error> {
        self.runner.wake_one(condition)
    }

    pub fn wake_all(&self, condition: &mut WaitCondition<A>) {
        self.runner.wake_all(condition);
    }

    /// Exits with `code`, to be picked up by anyone waiting on this
    /// task's exit event.
    pub fn exit(&mut self, code: Reason) -> Command {
        self.reason.set(code);
        Command::Exit
    }
}

const _: () = {
    // No record may span a page boundary and the maximum single-record
    // size is 512 bytes. A collapsed single-shape `TaskRecord` must still
    // respect that bound for every allocator it is monomorphized over;
    // `AllocPageAllocator` is zero-sized, so this is the representative
    // (and worst, since any stateful allocator the caller plugs in only
    // adds bytes) instantiation to check.
    static_assertions::const_assert!(
        core::mem::size_of::<TaskRecord<rt_slab::AllocPageAllocator>>() <= rt_slab::MAX_RECORD_SIZE
    );
};

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;
    use rt_slab::AllocPageAllocator;

    #[test]
    fn task_id_display() {
        let ids = IdSource::new();
        assert_eq!(format!("{}", ids.next()), "#1");
        assert_eq!(format!("{}", ids.next()), "#2");
    }

    #[test]
    fn id_source_is_monotonic() {
        let ids = IdSource::new();
        let a = ids.next();
        let b = ids.next();
        assert!(a < b);
    }

    fn noop(_: &mut TaskParam<'_, AllocPageAllocator>, cmd: Command) -> Command {
        cmd
    }

    #[test]
    fn new_record_starts_in_admission_with_zeroed_fields() {
        let ids = IdSource::new();
        let rec: TaskRecord<AllocPageAllocator> = TaskRecord::new(ids.next(), noop, core::ptr::null_mut());
        assert_eq!(rec.resume_offset(), 0);
        assert_eq!(rec.wait_result(), 0);
        assert!(rec.task_state.get() == TaskState::Admission);
        assert!(!rec.ring.is_linked());
        assert!(!rec.wait_link.is_linked());
        assert!(!rec.exit_event.is_linked());
    }

    #[test]
    fn resume_offset_round_trips() {
        let ids = IdSource::new();
        let rec: TaskRecord<AllocPageAllocator> = TaskRecord::new(ids.next(), noop, core::ptr::null_mut());
        rec.set_resume_offset(7);
        assert_eq!(rec.resume_offset(), 7);
    }
}
