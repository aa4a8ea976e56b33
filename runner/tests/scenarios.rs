//! End-to-end scenarios exercising the runner (and, where the behavior
//! under test lives a layer down, the paged slab it is built on) at the
//! scale real embedders would actually hit.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::rc::Rc;

use test_log::test;

use task_runner::{AllocPageAllocator, Command, Error, PageAllocator, Runner, RunnerConfig, TaskParam};

fn exits_with_state(param: &mut TaskParam<'_, AllocPageAllocator>, cmd: Command) -> Command {
    param.start(
        cmd,
        |p, _inner| {
            let code = p.state() as isize as i32;
            p.exit(code)
        },
        |p| p.exit(p.reason()),
    )
}

/// Scenario 1: spawn-exit-join. Task A spawns task B with init-arg 7,
/// waits on its exit; B exits with code 9.
#[test]
fn spawn_exit_join() {
    struct Joined {
        code: Cell<i32>,
    }

    fn child(param: &mut TaskParam<'_, AllocPageAllocator>, cmd: Command) -> Command {
        exits_with_state(param, cmd)
    }

    fn parent(param: &mut TaskParam<'_, AllocPageAllocator>, cmd: Command) -> Command {
        param.start(
            cmd,
            |p, inner| match inner {
                Command::Run => {
                    p.spawn(child, 9isize as *mut ()).unwrap();
                    p.wait_exit(1)
                }
                Command::Continue => {
                    // Safety: `state` was set to a live `&Joined` at spawn time.
                    let joined = unsafe { &*(p.state() as *const Joined) };
                    joined.code.set(p.reason());
                    p.exit(0)
                }
                other => unreachable!("unexpected command {other:?}"),
            },
            |p| p.exit(p.reason()),
        )
    }

    let runner: Runner<AllocPageAllocator> = Runner::new();
    let joined = Joined { code: Cell::new(-1) };
    runner
        .spawn(parent, &joined as *const Joined as *mut ())
        .unwrap();

    runner.run_all().unwrap();

    assert_eq!(joined.code.get(), 9);
    assert_eq!(runner.len(), 0, "both task records must be gone");
    assert_eq!(runner.admission_len(), 0);
}

/// Scenario 2: wait-list broadcast. 100 tasks each `wait` on the same
/// condition; a single `wake_all` moves every one of them back to
/// runnable in original FIFO order.
#[test]
fn wait_list_broadcast() {
    fn waiter(param: &mut TaskParam<'_, AllocPageAllocator>, cmd: Command) -> Command {
        param.start(
            cmd,
            |p, inner| match inner {
                Command::Run => {
                    let cond = p.state() as *mut task_runner::WaitCondition<AllocPageAllocator>;
                    // Safety: `state` points at a `WaitCondition` that
                    // outlives every task parked on it (stack-local to
                    // the test, dropped only after `runner` is).
                    let cond = unsafe { &mut *cond };
                    p.wait(cond, 1)
                }
                Command::Continue => p.exit(p.reason()),
                other => unreachable!("unexpected command {other:?}"),
            },
            |p| p.exit(p.reason()),
        )
    }

    let runner: Runner<AllocPageAllocator> = Runner::new();
    let mut cond: task_runner::WaitCondition<AllocPageAllocator> = task_runner::WaitCondition::new();

    let ids: Vec<_> = (0..100)
        .map(|_| {
            runner
                .spawn(waiter, &mut cond as *mut _ as *mut ())
                .unwrap()
        })
        .collect();

    // Admits and parks all 100 on `cond`.
    runner.run_all().unwrap();
    assert_eq!(cond.len(), 100);
    assert_eq!(runner.len(), 100);

    runner.wake_all(&mut cond);
    assert!(cond.is_empty());

    runner.run_all().unwrap();
    assert_eq!(runner.len(), 0);
    assert_eq!(ids.len(), 100);
}

/// Scenario 3: an exit chain of length 10 000. Task `n` spawns task
/// `n-1` and `wait_exit`s on it; task 0 exits with code 0; task `n`
/// exits with code `n`. The fast-path in `Runner::do_exit` walks the
/// whole chain iteratively, so this must not blow any call stack.
#[test]
fn exit_chain_of_length_ten_thousand() {
    const DEPTH: i32 = 10_000;

    struct Tail {
        observed: Cell<i32>,
    }

    fn link(param: &mut TaskParam<'_, AllocPageAllocator>, cmd: Command) -> Command {
        param.start(
            cmd,
            |p, inner| match inner {
                Command::Run => {
                    let n = p.state() as isize as i32;
                    if n == 0 {
                        return p.exit(0);
                    }
                    p.spawn(link, (n - 1) as isize as *mut ()).unwrap();
                    p.wait_exit(1)
                }
                // Each link reports its own index as its exit code,
                // independent of what its child reported — `n` is still
                // recoverable from `state`, which `wait_exit` never
                // touches.
                Command::Continue => {
                    let n = p.state() as isize as i32;
                    p.exit(n)
                }
                other => unreachable!("unexpected command {other:?}"),
            },
            |p| p.exit(p.reason()),
        )
    }

    fn root(param: &mut TaskParam<'_, AllocPageAllocator>, cmd: Command) -> Command {
        param.start(
            cmd,
            |p, inner| match inner {
                Command::Run => {
                    p.spawn(link, (DEPTH - 1) as isize as *mut ()).unwrap();
                    p.wait_exit(1)
                }
                Command::Continue => {
                    // Safety: `state` points at a live `Tail` for the test's duration.
                    let tail = unsafe { &*(p.state() as *const Tail) };
                    tail.observed.set(p.reason());
                    p.exit(0)
                }
                other => unreachable!("unexpected command {other:?}"),
            },
            |p| p.exit(p.reason()),
        )
    }

    let runner: Runner<AllocPageAllocator> = Runner::new();
    let tail = Tail { observed: Cell::new(-1) };
    runner.spawn(root, &tail as *const Tail as *mut ()).unwrap();

    // First pass admits `root` and the whole chain it spawns
    // transitively as each link's RUN invocation spawns the next and
    // immediately asks to wait on it.
    runner.run_all().unwrap();
    // Second pass is a no-op once the fast exit-chain path in the first
    // pass has already unwound every `wait_exit` synchronously; kept to
    // match the two-call shape of the underlying property.
    runner.run_all().unwrap();

    assert_eq!(tail.observed.get(), DEPTH - 1);
    assert_eq!(runner.len(), 0);
}

/// Scenario 4: compaction after middle removal, at the paged-slab layer
/// the runner's arena is built from. Insert 10 000 records, mark every
/// even-indexed one a hole, compact; 5 000 survive in original order.
#[test]
fn compact_after_middle_removal() {
    #[derive(Clone, Copy)]
    struct Rec(u32);

    let mut q: rt_slab::TaskQueue<Rec, rt_slab::AllocPageAllocator> =
        rt_slab::TaskQueue::new(rt_slab::AllocPageAllocator::new());

    let ptrs: Vec<NonNull<Rec>> = (0..10_000u32).map(|i| q.insert(Rec(i)).unwrap()).collect();
    let holes: Vec<NonNull<Rec>> = ptrs.iter().step_by(2).copied().collect();

    // Safety: `holes` names live records in queue order, each exactly once.
    unsafe { q.compact(&holes, |_dest, _src| {}) };

    assert_eq!(q.len(), 5_000);
    // Safety: every remaining record is live.
    let survivors: Vec<u32> = q.iter().map(|p| unsafe { p.as_ref() }.0).collect();
    let expected: Vec<u32> = (0..10_000u32).filter(|i| i % 2 == 1).collect();
    assert_eq!(survivors, expected);

    q.free().unwrap();
}

/// A `PageAllocator` that fails its `n`-th call to `acquire_page`
/// (1-indexed), otherwise delegating to a real `AllocPageAllocator`.
/// The failure point is shared through an `Rc` so a test can flip it
/// after observing how many records a real page actually holds.
#[derive(Clone)]
struct FaultAllocator {
    inner: Rc<RefCell<AllocPageAllocator>>,
    calls: Rc<Cell<usize>>,
    fail_on: Rc<Cell<Option<usize>>>,
}

impl FaultAllocator {
    fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(AllocPageAllocator::new())),
            calls: Rc::new(Cell::new(0)),
            fail_on: Rc::new(Cell::new(None)),
        }
    }
}

impl PageAllocator for FaultAllocator {
    fn acquire_page(&mut self) -> Result<NonNull<u8>, Error> {
        let call_no = self.calls.get() + 1;
        self.calls.set(call_no);
        if self.fail_on.get() == Some(call_no) {
            return Err(Error::OutOfMemory);
        }
        self.inner.borrow_mut().acquire_page()
    }

    fn release_page(&mut self, page: NonNull<u8>) -> Result<(), Error> {
        self.inner.borrow_mut().release_page(page)
    }
}

fn never_runs(_: &mut TaskParam<'_, FaultAllocator>, cmd: Command) -> Command {
    cmd
}

/// Scenario 5: allocation fault during a spawn batch. The original
/// scenario injects the fault on the fifth of twelve spawns; here the
/// exact index depends on how many fixed-size `TaskRecord`s actually
/// fit on one 4 KiB page (discovered by a throwaway probe run), but the
/// shape of the property is identical: some spawns succeed on the first
/// page, the spawn that would need a second page fails with
/// `OUT_OF_MEMORY`, and once the fault is lifted later spawns succeed
/// again by acquiring that second page.
#[test]
fn allocation_fault_during_spawn_batch() {
    // Probe: how many spawns land on page 1 before a second
    // `acquire_page` call is made?
    let probe_alloc = FaultAllocator::new();
    let probe: Runner<FaultAllocator> = RunnerConfig::new()
        .with_page_allocator(probe_alloc.clone())
        .build();
    let mut page1_capacity = 0usize;
    loop {
        probe.spawn(never_runs, std::ptr::null_mut()).unwrap();
        page1_capacity += 1;
        if probe_alloc.calls.get() >= 2 {
            break;
        }
        assert!(page1_capacity < 10_000, "page never filled; probe is broken");
    }
    page1_capacity -= 1; // the spawn that triggered the 2nd acquire_page doesn't count
    probe.abort_all().unwrap();

    let alloc = FaultAllocator::new();
    let runner: Runner<FaultAllocator> = RunnerConfig::new()
        .with_page_allocator(alloc.clone())
        .build();
    alloc.fail_on.set(Some(2));

    for _ in 0..page1_capacity {
        runner.spawn(never_runs, std::ptr::null_mut()).unwrap();
    }
    assert_eq!(runner.admission_len(), page1_capacity);

    let err = runner
        .spawn(never_runs, std::ptr::null_mut())
        .unwrap_err();
    assert_eq!(err, Error::OutOfMemory);
    assert_eq!(
        runner.admission_len(),
        page1_capacity,
        "a failed spawn must not be admitted"
    );

    alloc.fail_on.set(None);
    for _ in 0..7 {
        runner.spawn(never_runs, std::ptr::null_mut()).unwrap();
    }
    assert_eq!(runner.admission_len(), page1_capacity + 7);

    runner.abort_all().unwrap();
}

/// Scenario 6: abort-all during waiting. 50 tasks each `wait` on a
/// distinct condition; `abort_all` invokes every one of them exactly
/// once with `ABORT`, and every queue ends empty.
#[test]
fn abort_all_during_waiting() {
    struct WaiterState {
        cond: *mut task_runner::WaitCondition<AllocPageAllocator>,
        aborts: *const Cell<u32>,
    }

    fn waiter(param: &mut TaskParam<'_, AllocPageAllocator>, cmd: Command) -> Command {
        param.start(
            cmd,
            |p, inner| match inner {
                Command::Run => {
                    let state = p.state() as *const WaiterState;
                    // Safety: `state` points at a live `WaiterState` owned
                    // by the test for the whole run.
                    let state = unsafe { &*state };
                    // Safety: `cond` outlives every task parked on it.
                    let cond = unsafe { &mut *state.cond };
                    p.wait(cond, 1)
                }
                Command::Abort => {
                    let state = p.state() as *const WaiterState;
                    // Safety: see above.
                    let state = unsafe { &*state };
                    // Safety: `aborts` outlives the run.
                    let aborts = unsafe { &*state.aborts };
                    aborts.set(aborts.get() + 1);
                    p.exit(-1)
                }
                other => unreachable!("unexpected command {other:?}"),
            },
            |p| p.exit(p.reason()),
        )
    }

    let runner: Runner<AllocPageAllocator> = Runner::new();
    let mut conditions: Vec<Box<task_runner::WaitCondition<AllocPageAllocator>>> =
        (0..50).map(|_| Box::new(task_runner::WaitCondition::new())).collect();
    let aborts = Cell::new(0u32);
    let states: Vec<Box<WaiterState>> = conditions
        .iter_mut()
        .map(|cond| {
            Box::new(WaiterState {
                cond: &mut **cond,
                aborts: &aborts,
            })
        })
        .collect();

    for state in &states {
        let ptr: *const WaiterState = &**state;
        runner.spawn(waiter, ptr as *mut ()).unwrap();
    }

    runner.run_all().unwrap();
    assert_eq!(runner.len(), 50);
    for cond in &conditions {
        assert_eq!(cond.len(), 1);
    }

    runner.abort_all().unwrap();

    assert_eq!(aborts.get(), 50, "every waiting task must be ABORTed exactly once");
    assert_eq!(runner.len(), 0);
    assert_eq!(runner.admission_len(), 0);
}
