//! The runner: a single bulk-processing pass (`run_all`) over an
//! admission queue, a runnable queue, and a wake-up scratch bucket, plus
//! `abort_all` teardown.

use core::cell::{Cell, RefCell};
use core::ptr::NonNull;

use alloc::vec::Vec;
use rt_dlist::Dlist;
use rt_slab::{AllocPageAllocator, Error, PageAllocator, TaskQueue};
use tracing::{debug, trace, warn};

use crate::task::{Command, IdSource, TaskFn, TaskId, TaskParam, TaskRecord, TaskState, WaitTarget};
use crate::wait::WaitCondition;

/// Builds a [`Runner`], the one place a non-default [`PageAllocator`] is
/// plugged in (mirroring `TaskBuilder`'s role of gathering construction
/// options before handing back a usable value).
pub struct RunnerConfig<A: PageAllocator = AllocPageAllocator> {
    allocator: A,
}

impl Default for RunnerConfig<AllocPageAllocator> {
    fn default() -> Self {
        Self::new()
    }
}

impl RunnerConfig<AllocPageAllocator> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocator: AllocPageAllocator::new(),
        }
    }
}

impl<A: PageAllocator> RunnerConfig<A> {
    /// Supplies a non-default page allocator (an arena, a fault-injecting
    /// wrapper for tests, ...).
    #[must_use]
    pub fn with_page_allocator<B: PageAllocator>(self, allocator: B) -> RunnerConfig<B> {
        RunnerConfig { allocator }
    }

    #[must_use]
    pub fn build(self) -> Runner<A> {
        Runner {
            arena: RefCell::new(TaskQueue::new(self.allocator)),
            admission: RefCell::new(Dlist::new()),
            runnable: RefCell::new(Dlist::new()),
            wakeup: RefCell::new(Dlist::new()),
            ids: IdSource::new(),
            in_pass: Cell::new(false),
        }
    }
}

/// Outcome of invoking a single task, before the caller decides where
/// (if anywhere) the record goes next.
enum Outcome {
    StillRunnable,
    Waiting,
    Exited(crate::task::Reason),
}

/// A cooperative, single-threaded task scheduler. Must not be moved once
/// any task has been spawned: task records hold raw pointers back into
/// this runner's own ring fields (see [`TaskRecord::owning_ring`]),
/// the same pinned-address requirement `PagedSlab::identity` documents.
pub struct Runner<A: PageAllocator = AllocPageAllocator> {
    arena: RefCell<TaskQueue<TaskRecord<A>, A>>,
    admission: RefCell<Dlist<TaskRecord<A>>>,
    runnable: RefCell<Dlist<TaskRecord<A>>>,
    wakeup: RefCell<Dlist<TaskRecord<A>>>,
    ids: IdSource,
    in_pass: Cell<bool>,
}

impl Runner<AllocPageAllocator> {
    #[must_use]
    pub fn new() -> Self {
        RunnerConfig::new().build()
    }
}

impl Default for Runner<AllocPageAllocator> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: PageAllocator> Runner<A> {
    /// Number of live task records (admitted, runnable, or waiting).
    pub fn len(&self) -> usize {
        self.arena.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.borrow().is_empty()
    }

    pub fn admission_len(&self) -> usize {
        self.admission.borrow().len()
    }

    /// Spawns a new task, admitted on the next `run_all` pass.
    pub fn spawn(&self, main_fn: TaskFn<A>, state: *mut ()) -> Result<TaskId, Error> {
        self.spawn_record(main_fn, state).map(|(id, _)| id)
    }

    pub(crate) fn spawn_record(
        &self,
        main_fn: TaskFn<A>,
        state: *mut (),
    ) -> Result<(TaskId, NonNull<TaskRecord<A>>), Error> {
        let id = self.ids.next();
        let record = TaskRecord::new(id, main_fn, state);
        let ptr = self.arena.borrow_mut().insert(record)?;
        let mut admission = self.admission.borrow_mut();
        Self::ring_insert_last(&mut admission, ptr);
        debug!(task = %id, "spawned");
        Ok((id, ptr))
    }

    pub fn wake_one(&self, condition: &mut WaitCondition<A>) -> Result<(), Error> {
        let task = condition.waiters.pop_first().ok_or(Error::NoData)?;
        // Safety: `task` was just unlinked from `condition`.
        unsafe { task.as_ref() }.owning_ring.set(None);
        let mut wakeup = self.wakeup.borrow_mut();
        Self::ring_insert_last(&mut wakeup, task);
        trace!(task = %unsafe { task.as_ref() }.id, "wake_one");
        Ok(())
    }

    pub fn wake_all(&self, condition: &mut WaitCondition<A>) {
        let mut wakeup = self.wakeup.borrow_mut();
        let wakeup_ptr = NonNull::from(&mut *wakeup);
        let mut taken = condition.waiters.pop_all();
        for rec in taken.iter() {
            rec.owning_ring.set(Some(wakeup_ptr));
        }
        let moved = taken.len();
        wakeup.splice(&mut taken);
        trace!(moved, "wake_all");
    }

    fn ring_insert_last(ring: &mut Dlist<TaskRecord<A>>, task: NonNull<TaskRecord<A>>) {
        let ring_ptr = NonNull::from(&mut *ring);
        // Safety: `task` is a live, currently-unlinked record.
        unsafe { task.as_ref() }.owning_ring.set(Some(ring_ptr));
        ring.insert_last(task);
    }

    fn ring_remove_first(ring: &mut Dlist<TaskRecord<A>>) -> Option<NonNull<TaskRecord<A>>> {
        let task = ring.remove_first()?;
        // Safety: `task` was just unlinked.
        unsafe { task.as_ref() }.owning_ring.set(None);
        Some(task)
    }

    /// Invokes `task` with `command`, classifying the result and, for a
    /// `Wait` outcome, linking it into whatever it asked to wait on.
    /// Does not touch ring/arena membership for `StillRunnable` or
    /// `Exited` — callers handle those.
    fn invoke(&self, task: NonNull<TaskRecord<A>>, command: Command) -> Outcome {
        // Safety: `task` is live for the duration of this call.
        let rec = unsafe { task.as_ref() };
        let mut param = TaskParam {
            runner: self,
            task,
            wait_target: Cell::new(None),
            reason: Cell::new(rec.wait_result()),
            last_spawned: Cell::new(None),
        };
        let result = rec.call(&mut param, command);
        match result {
            Command::Exit => Outcome::Exited(param.reason.get()),
            Command::Wait => {
                let target = param
                    .wait_target
                    .take()
                    .expect("a task returning Wait must call wait()/wait_exit() first");
                self.link_wait(task, target);
                Outcome::Waiting
            }
            Command::Run | Command::Continue => Outcome::StillRunnable,
            Command::Abort => {
                warn!(task = %rec.id, "task returned Abort from its own body; treating as still runnable");
                Outcome::StillRunnable
            }
        }
    }

    fn link_wait(&self, task: NonNull<TaskRecord<A>>, target: WaitTarget<A>) {
        // Safety: `task` is live.
        let rec = unsafe { task.as_ref() };
        rec.task_state.set(TaskState::Waiting);
        match target {
            WaitTarget::Condition(mut condition) => {
                // Safety: the caller-owned `WaitCondition` is live for at
                // least as long as `task` waits on it.
                let condition = unsafe { condition.as_mut() };
                Self::ring_insert_last(&mut condition.waiters.ring, task);
            }
            WaitTarget::Exit(exiter) => {
                // Safety: `exiter` is live (the task that was just
                // spawned, or otherwise still present in the arena).
                let exiter_rec = unsafe { exiter.as_ref() };
                rt_dlist::DualLink::init(&rec.wait_link, &exiter_rec.exit_event.waiter);
            }
        }
    }

    /// Removes `task` from the arena, relocating the arena's current
    /// tail into its slot if it wasn't already the tail, and fixing up
    /// whatever ring/wait-link membership the relocated record held.
    fn free_record(&self, task: NonNull<TaskRecord<A>>) {
        let mut arena = self.arena.borrow_mut();
        // Safety: `task` is a live record in this arena; `TaskRecord`'s
        // relink fixes up the relocated record's back-links.
        let removed = unsafe {
            arena.remove_by_swap(task, |dest, src| {
                // Safety: `dest` holds the just-copied bytes of `src`,
                // which is about to be popped as the vacated tail.
                unsafe { TaskRecord::relink(dest, src) }
            })
        };
        core::mem::forget(removed);
    }

    /// Runs the task that just exited's cleanup: wakes up whoever is
    /// waiting on its exit event immediately (the "exit chain" fast
    /// path), iteratively rather than recursively so an arbitrarily long
    /// chain of exit-triggered exits doesn't grow the call stack.
    fn do_exit(&self, task: NonNull<TaskRecord<A>>, code: crate::task::Reason) {
        let mut pending = Vec::new();
        pending.push((task, code));

        while let Some((exiting, exit_code)) = pending.pop() {
            // Safety: `exiting` is live until `free_record` below.
            let exiting_rec = unsafe { exiting.as_ref() };
            let exiting_id = exiting_rec.id;
            let waiter = if exiting_rec.exit_event.is_linked() {
                let w = exiting_rec.exit_event.waiter_task();
                exiting_rec.exit_event.waiter.free();
                w
            } else {
                None
            };

            self.free_record(exiting);
            debug!(task = %exiting_id, code = exit_code, "exited");

            let Some(waiter_ptr) = waiter else { continue };
            // Safety: `waiter_ptr` is live (it was waiting, hence still
            // in the arena).
            let waiter_rec = unsafe { waiter_ptr.as_ref() };
            waiter_rec.wait_link.free();
            waiter_rec.set_wait_result(exit_code);
            waiter_rec.task_state.set(TaskState::Runnable);

            match self.invoke(waiter_ptr, Command::Continue) {
                Outcome::Exited(code2) => pending.push((waiter_ptr, code2)),
                Outcome::Waiting => {}
                Outcome::StillRunnable => {
                    let mut runnable = self.runnable.borrow_mut();
                    Self::ring_insert_last(&mut runnable, waiter_ptr);
                }
            }
        }
    }

    /// Runs every currently-runnable task to quiescence: repeatedly
    /// processes (a) the runnable bucket, (b) the admission bucket, and
    /// (c) the wake-up bucket, looping back to (a) only while (b) or (c)
    /// produced new runnable entries.
    ///
    /// Returns `Err(Error::Busy)` if called while a pass is already in
    /// progress (possible only through re-entrant application code, e.g.
    /// a `PageAllocator` callback that calls back into `run_all`).
    pub fn run_all(&self) -> Result<(), Error> {
        if self.in_pass.replace(true) {
            return Err(Error::Busy);
        }
        let result = self.run_all_inner();
        self.in_pass.set(false);
        result
    }

    fn run_all_inner(&self) -> Result<(), Error> {
        loop {
            let mut produced_new_runnable = false;

            // (a) the runnable bucket: process exactly the entries
            // present at the start of this pass.
            let mut this_pass = {
                let mut runnable = self.runnable.borrow_mut();
                core::mem::take(&mut *runnable)
            };
            while let Some(task) = Self::ring_remove_first(&mut this_pass) {
                self.dispatch(task, Command::Continue, &mut produced_new_runnable);
            }

            // (b) admission: invoke each once with RUN, then drop it
            // from the admission bucket regardless of outcome.
            loop {
                let task = {
                    let mut admission = self.admission.borrow_mut();
                    Self::ring_remove_first(&mut admission)
                };
                let Some(task) = task else { break };
                self.dispatch(task, Command::Run, &mut produced_new_runnable);
            }

            // (c) wake-up: snapshot-and-clear, then drain the scratch
            // copy so the live bucket can accept newly-woken entries
            // triggered by this same drain without being mutated mid-walk.
            let mut scratch = {
                let mut wakeup = self.wakeup.borrow_mut();
                core::mem::take(&mut *wakeup)
            };
            while let Some(task) = Self::ring_remove_first(&mut scratch) {
                // Safety: `task` is live.
                unsafe { task.as_ref() }.task_state.set(TaskState::Runnable);
                self.dispatch(task, Command::Continue, &mut produced_new_runnable);
            }

            if !produced_new_runnable {
                return Ok(());
            }
        }
    }

    /// Invokes `task`, then routes the result: still-runnable entries
    /// go to the tail of the runnable bucket (and mark `new_runnable`,
    /// since the caller's enclosing pass hasn't already accounted for
    /// them), waiting entries are already linked by `invoke`, and exited
    /// entries free their record and chain any waiter synchronously.
    fn dispatch(&self, task: NonNull<TaskRecord<A>>, command: Command, new_runnable: &mut bool) {
        // Safety: `task` is live.
        unsafe { task.as_ref() }.task_state.set(TaskState::Runnable);
        match self.invoke(task, command) {
            Outcome::StillRunnable => {
                let mut runnable = self.runnable.borrow_mut();
                Self::ring_insert_last(&mut runnable, task);
                *new_runnable = true;
            }
            Outcome::Waiting => {}
            Outcome::Exited(code) => {
                *new_runnable = true;
                self.do_exit(task, code);
            }
        }
    }

    /// Tears the runner down: clears every waiting task's linkage,
    /// invokes every started (non-admission) task once with `Abort` so it
    /// can release its own resources — detaching it from whichever ring
    /// (runnable, waiting-on-condition, or wake-up) currently owns it
    /// along the way, uniformly via `owning_ring` — then discards
    /// admission-only records and releases every page. Returns the last
    /// error seen along the way, if any.
    ///
    /// A task sitting in the wake-up bucket (moved there by a `wake_one`/
    /// `wake_all` call with no intervening `run_all`) is handled by this
    /// same per-task loop rather than drained separately beforehand: its
    /// `owning_ring` still points at the live wake-up bucket, so the loop's
    /// `owning_ring.take()` + `remove` detaches it correctly. Draining the
    /// wake-up bucket ahead of the loop would unlink those tasks' `Links`
    /// without clearing their `owning_ring`, leaving it dangling and
    /// making the loop's own `remove` call panic on an already-unlinked
    /// node.
    pub fn abort_all(&self) -> Result<(), Error> {
        let live: Vec<NonNull<TaskRecord<A>>> = self.arena.borrow().iter().collect();
        let mut last_err = Ok(());

        for task in live {
            // Safety: `task` is live (just enumerated from the arena).
            let rec = unsafe { task.as_ref() };
            if rec.task_state.get() == TaskState::Admission {
                continue;
            }
            rec.wait_link.free();
            rec.exit_event.waiter.free();
            if let Some(mut ring_ptr) = rec.owning_ring.take() {
                // Safety: `ring_ptr` is whatever ring currently owns
                // `task`'s membership — a runner-owned bucket or a
                // caller-owned `WaitCondition` — and outlives this call.
                // Detaching here keeps that ring from retaining a
                // dangling pointer once the arena below is freed.
                unsafe { ring_ptr.as_mut().remove(task) };
            }

            match self.invoke(task, Command::Abort) {
                Outcome::Exited(_) => {}
                Outcome::StillRunnable | Outcome::Waiting => {
                    warn!(task = %rec.id, "task failed to clean up on Abort");
                    last_err = Err(Error::Abort);
                }
            }
        }

        self.admission.borrow_mut().drain_with(|_: NonNull<TaskRecord<A>>| Ok::<(), Error>(())).ok();
        self.runnable.borrow_mut().drain_with(|_: NonNull<TaskRecord<A>>| Ok::<(), Error>(())).ok();

        if let Err(e) = self.arena.borrow_mut().free() {
            last_err = Err(e);
        }

        last_err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::WaitCondition;
    use rt_slab::AllocPageAllocator;

    fn exit_with_state(param: &mut TaskParam<'_, AllocPageAllocator>, cmd: Command) -> Command {
        param.start(
            cmd,
            |p, _inner| {
                let code = p.state() as isize as i32;
                p.exit(code)
            },
            |p| p.exit(p.reason()),
        )
    }

    #[test]
    fn spawn_admits_and_run_all_drains_it() {
        let runner: Runner<AllocPageAllocator> = Runner::new();
        runner.spawn(exit_with_state, 42isize as *mut ()).unwrap();
        assert_eq!(runner.admission_len(), 1);
        assert_eq!(runner.len(), 1);

        runner.run_all().unwrap();
        assert_eq!(runner.admission_len(), 0);
        assert_eq!(runner.len(), 0);
    }

    struct Observed {
        code: Cell<i32>,
    }

    fn child_task(param: &mut TaskParam<'_, AllocPageAllocator>, cmd: Command) -> Command {
        param.start(
            cmd,
            |p, _inner| {
                let code = p.state() as isize as i32;
                p.exit(code)
            },
            |p| p.exit(p.reason()),
        )
    }

    fn parent_task(param: &mut TaskParam<'_, AllocPageAllocator>, cmd: Command) -> Command {
        param.start(
            cmd,
            |p, inner| match inner {
                Command::Run => {
                    p.spawn(child_task, 9isize as *mut ()).unwrap();
                    p.wait_exit(1)
                }
                Command::Continue => {
                    // Safety: `state` was set to a live `&Observed` at spawn time.
                    let observed = unsafe { &*(p.state() as *const Observed) };
                    observed.code.set(p.reason());
                    p.exit(0)
                }
                other => unreachable!("unexpected command {other:?}"),
            },
            |p| p.exit(p.reason()),
        )
    }

    #[test]
    fn spawn_exit_join_observes_child_exit_code() {
        let runner: Runner<AllocPageAllocator> = Runner::new();
        let observed = Observed { code: Cell::new(-1) };
        runner
            .spawn(parent_task, &observed as *const Observed as *mut ())
            .unwrap();

        runner.run_all().unwrap();

        assert_eq!(observed.code.get(), 9);
        assert_eq!(runner.len(), 0);
    }

    fn wait_on_condition(param: &mut TaskParam<'_, AllocPageAllocator>, cmd: Command) -> Command {
        param.start(
            cmd,
            |p, inner| match inner {
                Command::Run => {
                    let cond = p.state() as *mut WaitCondition<AllocPageAllocator>;
                    // Safety: `state` was set to a live `&mut WaitCondition`
                    // at spawn time, outliving every task parked on it.
                    let cond = unsafe { &mut *cond };
                    p.wait(cond, 1)
                }
                Command::Continue => p.exit(p.reason()),
                other => unreachable!("unexpected command {other:?}"),
            },
            |p| p.exit(p.reason()),
        )
    }

    #[test]
    fn wake_all_wakes_every_waiter_and_empties_condition() {
        let runner: Runner<AllocPageAllocator> = Runner::new();
        let mut cond: WaitCondition<AllocPageAllocator> = WaitCondition::new();
        for _ in 0..5 {
            runner
                .spawn(wait_on_condition, &mut cond as *mut _ as *mut ())
                .unwrap();
        }

        // Admits and parks every task on `cond`.
        runner.run_all().unwrap();
        assert_eq!(cond.len(), 5);
        assert_eq!(runner.len(), 5);

        runner.wake_all(&mut cond);
        runner.run_all().unwrap();

        assert!(cond.is_empty());
        assert_eq!(runner.len(), 0);
    }

    #[test]
    fn wake_one_wakes_a_single_waiter_fifo() {
        let runner: Runner<AllocPageAllocator> = Runner::new();
        let mut cond: WaitCondition<AllocPageAllocator> = WaitCondition::new();
        for _ in 0..3 {
            runner
                .spawn(wait_on_condition, &mut cond as *mut _ as *mut ())
                .unwrap();
        }
        runner.run_all().unwrap();
        assert_eq!(cond.len(), 3);

        runner.wake_one(&mut cond).unwrap();
        runner.run_all().unwrap();

        assert_eq!(cond.len(), 2);
        assert_eq!(runner.len(), 2);
    }

    #[test]
    fn run_all_rejects_reentry() {
        let runner: Runner<AllocPageAllocator> = Runner::new();
        runner.in_pass.set(true);
        assert_eq!(runner.run_all(), Err(Error::Busy));
        runner.in_pass.set(false);
    }

    fn never_exits(param: &mut TaskParam<'_, AllocPageAllocator>, cmd: Command) -> Command {
        param.start(
            cmd,
            |p, inner| match inner {
                Command::Run => p.yield_now(1),
                Command::Continue => p.yield_now(1),
                Command::Abort => p.exit(-1),
                other => unreachable!("unexpected command {other:?}"),
            },
            |p| p.exit(p.reason()),
        )
    }

    #[test]
    fn abort_all_invokes_every_live_task_and_empties_the_runner() {
        let runner: Runner<AllocPageAllocator> = Runner::new();
        for _ in 0..10 {
            runner.spawn(never_exits, core::ptr::null_mut()).unwrap();
        }
        runner.run_all().unwrap();
        assert_eq!(runner.len(), 10);

        runner.abort_all().unwrap();
        assert_eq!(runner.len(), 0);
        assert_eq!(runner.admission_len(), 0);
    }
}
