//! Cooperative fiber scheduler
//!
//! A pool of worker threads drains a shared FIFO of tasks; each worker
//! drives fibers from its own scheduling fiber and falls back to an idle
//! fiber when nothing is eligible. The overridable surface (`tickle`,
//! `idle`, `stopping`) is the `Schedule` trait; `IoManager` implements it
//! with an epoll-backed idle loop, the base `Scheduler` with a plain
//! yield loop.
//!
//! A fiber that yields is not re-queued by the worker loop: the worker
//! drops its handle and the fiber lives on through whatever wakeup it
//! registered for itself (a timer callback, an armed fd direction, or an
//! explicit re-schedule). Resuming therefore always goes through the task
//! queue, whose mutex orders the wakeup after the yield's context save.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use weft_core::constants::ANY_THREAD;
use weft_core::{wdebug, winfo, SchedError, SchedResult};

use crate::fiber::{Fiber, FiberFn};
use crate::iomanager::IoManager;
use crate::thread::{gettid, Thread};

/// A scheduled callable
pub type TaskFn = FiberFn;

thread_local! {
    static CURRENT_SCHED: RefCell<Option<Weak<dyn Schedule>>> = const { RefCell::new(None) };
}

pub(crate) fn set_current_scheduler(s: &Arc<dyn Schedule>) {
    CURRENT_SCHED.with(|c| *c.borrow_mut() = Some(Arc::downgrade(s)));
}

pub(crate) fn current_scheduler() -> Option<Arc<dyn Schedule>> {
    CURRENT_SCHED.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
}

/// One queued unit of work: an existing fiber or a callable, optionally
/// pinned to a worker thread id (`ANY_THREAD` = any)
pub struct ScheduleTask {
    pub(crate) fiber: Option<Arc<Fiber>>,
    pub(crate) cb: Option<TaskFn>,
    pub(crate) thread: libc::pid_t,
}

impl ScheduleTask {
    /// Task that resumes an existing fiber
    pub fn from_fiber(fiber: Arc<Fiber>, thread: libc::pid_t) -> Self {
        Self {
            fiber: Some(fiber),
            cb: None,
            thread,
        }
    }

    /// Task that runs a callable on a transient fiber
    pub fn from_fn<F>(f: F, thread: libc::pid_t) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            fiber: None,
            cb: Some(Box::new(f)),
            thread,
        }
    }

    fn is_valid(&self) -> bool {
        self.fiber.is_some() || self.cb.is_some()
    }

    #[inline]
    fn eligible(&self, tid: libc::pid_t) -> bool {
        self.thread == ANY_THREAD || self.thread == tid
    }
}

/// State shared by every scheduler flavour
pub struct SchedulerCore {
    name: String,
    tasks: Mutex<VecDeque<ScheduleTask>>,
    threads: Mutex<Vec<Thread>>,
    thread_ids: Mutex<Vec<libc::pid_t>>,
    /// Worker threads to spawn (excludes the caller when `use_caller`)
    spawn_count: usize,
    active: AtomicUsize,
    idle: AtomicUsize,
    stopping: AtomicBool,
    started: AtomicBool,
    use_caller: bool,
    /// Caller's tid when `use_caller`, else -1
    root_thread: AtomicI32,
    /// The caller-hosted scheduling fiber when `use_caller`
    scheduler_fiber: Mutex<Option<Arc<Fiber>>>,
}

impl SchedulerCore {
    pub(crate) fn new(threads: usize, use_caller: bool, name: &str) -> Self {
        assert!(threads > 0, "scheduler needs at least one thread");
        Self {
            name: name.to_string(),
            tasks: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(Vec::new()),
            spawn_count: threads - usize::from(use_caller),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            started: AtomicBool::new(false),
            use_caller,
            root_thread: AtomicI32::new(ANY_THREAD),
            scheduler_fiber: Mutex::new(None),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Any worker currently parked in idle?
    #[inline]
    pub fn has_idle_threads(&self) -> bool {
        self.idle.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Queue a task; `Ok(true)` means the queue went empty -> non-empty
    /// and the caller must tickle after releasing its locks
    fn push_task(&self, task: ScheduleTask) -> SchedResult<bool> {
        if !task.is_valid() {
            return Err(SchedError::InvalidTask);
        }
        if task.thread != ANY_THREAD && self.started.load(Ordering::Acquire) {
            let known = self.root_thread.load(Ordering::Acquire) == task.thread
                || self.thread_ids.lock().unwrap().contains(&task.thread);
            if !known {
                return Err(SchedError::NoSuchThread(task.thread));
            }
        }

        let mut q = self.tasks.lock().unwrap();
        let need_tickle = q.is_empty();
        q.push_back(task);
        Ok(need_tickle)
    }

    pub(crate) fn base_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
            && self.active.load(Ordering::Acquire) == 0
            && self.tasks.lock().unwrap().is_empty()
    }
}

/// The scheduler's overridable surface
///
/// Object-safe so worker threads, timer callbacks and event contexts can
/// hold `Arc<dyn Schedule>` / `Weak<dyn Schedule>` without knowing the
/// concrete flavour.
pub trait Schedule: Send + Sync + 'static {
    fn core(&self) -> &SchedulerCore;

    /// Wake an idle worker; no-op in the base scheduler
    fn tickle(&self) {}

    /// Runs inside each worker's idle fiber when no task is eligible
    fn idle(&self) {
        while !self.stopping() {
            Fiber::yield_current();
        }
    }

    /// May the workers shut down?
    fn stopping(&self) -> bool {
        self.core().base_stopping()
    }

    /// Downcast hook for `IoManager::current()`
    fn io_manager(self: Arc<Self>) -> Option<Arc<IoManager>> {
        None
    }

    /// Queue a task, waking an idle worker if the queue was empty
    fn schedule_task(&self, task: ScheduleTask) -> SchedResult<()> {
        let need_tickle = self.core().push_task(task)?;
        if need_tickle {
            self.tickle();
        }
        Ok(())
    }
}

impl dyn Schedule {
    /// Queue a callable for any worker
    pub fn schedule<F>(&self, f: F) -> SchedResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(ScheduleTask::from_fn(f, ANY_THREAD))
    }

    /// Queue an existing fiber
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>, thread: libc::pid_t) -> SchedResult<()> {
        self.schedule_task(ScheduleTask::from_fiber(fiber, thread))
    }
}

/// Caller-thread setup for `use_caller`: thread root, dedicated
/// scheduling fiber bound to the worker loop, root tid
pub(crate) fn init_use_caller(sched: &Arc<dyn Schedule>) {
    let core = sched.core();
    Fiber::current();

    let weak = Arc::downgrade(sched);
    let scheduler_fiber = Fiber::new(
        Box::new(move || {
            if let Some(s) = weak.upgrade() {
                run_worker(s);
            }
        }),
        0,
        false,
    )
    .expect("scheduling fiber allocation failed");

    Fiber::set_scheduler_fiber(&scheduler_fiber);
    core.root_thread.store(gettid(), Ordering::Release);
    *core.scheduler_fiber.lock().unwrap() = Some(scheduler_fiber);
}

/// Spawn the worker pool
pub(crate) fn start_scheduler(sched: &Arc<dyn Schedule>) -> SchedResult<()> {
    let core = sched.core();
    debug_assert!(!core.stopping.load(Ordering::Acquire), "start while stopping");
    if core.started.swap(true, Ordering::SeqCst) {
        return Err(SchedError::AlreadyStarted);
    }

    let mut threads = core.threads.lock().unwrap();
    let mut ids = core.thread_ids.lock().unwrap();
    for i in 0..core.spawn_count {
        let s = sched.clone();
        let t = Thread::new(move || run_worker(s), &format!("{}_{}", core.name, i))?;
        ids.push(t.id());
        threads.push(t);
    }
    winfo!("{}: started {} worker thread(s)", core.name, core.spawn_count);
    Ok(())
}

/// Drain and shut down
///
/// Waits for every queued task, armed timer and pending event to finish.
/// With `use_caller` this must run on the constructing thread, which
/// participates in the drain through its scheduling fiber.
pub(crate) fn stop_scheduler(sched: &Arc<dyn Schedule>) {
    let core = sched.core();
    core.stopping.store(true, Ordering::SeqCst);

    // One wakeup per worker so every idle wait observes the flag
    let workers = core.spawn_count + usize::from(core.use_caller);
    for _ in 0..workers {
        sched.tickle();
    }

    let scheduler_fiber = core.scheduler_fiber.lock().unwrap().clone();
    if let Some(fiber) = scheduler_fiber {
        assert_eq!(
            gettid(),
            core.root_thread.load(Ordering::Acquire),
            "{}: stop must run on the thread that constructed a use_caller scheduler",
            core.name
        );
        if fiber.state().is_ready() {
            fiber.resume();
        }
    }

    let threads: Vec<Thread> = core.threads.lock().unwrap().drain(..).collect();
    for t in threads {
        t.join();
    }
    winfo!("{}: stopped", core.name);
}

/// The worker loop every scheduling fiber runs
pub(crate) fn run_worker(sched: Arc<dyn Schedule>) {
    set_current_scheduler(&sched);
    if let Some(io) = sched.clone().io_manager() {
        crate::iomanager::set_current_io(&io);
    }

    let core = sched.core();
    let tid = gettid();
    wdebug!("{}: worker {} enters run loop", core.name, tid);

    if tid != core.root_thread.load(Ordering::Acquire) {
        // Spawned worker: its thread root doubles as the scheduling fiber
        Fiber::current();
    }

    let idle_sched = sched.clone();
    let idle_fiber = Fiber::new(Box::new(move || idle_sched.idle()), 0, true)
        .expect("idle fiber allocation failed");
    // Reused across callable tasks once it reaches TERM
    let mut cb_fiber: Option<Arc<Fiber>> = None;

    loop {
        let mut task: Option<ScheduleTask> = None;
        let mut tickle_me = false;
        {
            let mut q = core.tasks.lock().unwrap();
            if let Some(pos) = q.iter().position(|t| t.eligible(tid)) {
                task = q.remove(pos);
                tickle_me = !q.is_empty();
            }
        }
        if tickle_me {
            sched.tickle();
        }

        if let Some(task) = task {
            core.active.fetch_add(1, Ordering::SeqCst);

            if let Some(fiber) = task.fiber {
                if fiber.state().is_ready() {
                    fiber.resume();
                }
                // Handle dropped here. TERM fibers die with it; a
                // suspended fiber is kept alive by the wakeup it armed
                // before yielding.
            } else if let Some(cb) = task.cb {
                let fiber = match cb_fiber.take() {
                    Some(f) if f.state().is_term() => {
                        f.reset(cb);
                        f
                    }
                    _ => Fiber::new(cb, 0, true).expect("task fiber allocation failed"),
                };
                fiber.resume();
                if fiber.state().is_term() {
                    cb_fiber = Some(fiber);
                }
            }

            core.active.fetch_sub(1, Ordering::SeqCst);
        } else {
            if idle_fiber.state().is_term() {
                wdebug!("{}: worker {} exits run loop", core.name, tid);
                break;
            }
            core.idle.fetch_add(1, Ordering::SeqCst);
            idle_fiber.resume();
            core.idle.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// The base scheduler: FIFO task pool with no event integration
pub struct Scheduler {
    core: SchedulerCore,
}

impl Schedule for Scheduler {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }
}

impl Scheduler {
    /// Create a scheduler over `threads` workers
    ///
    /// With `use_caller` the constructing thread counts as one worker and
    /// drains tasks when `stop` runs.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        let sched = Arc::new(Scheduler {
            core: SchedulerCore::new(threads, use_caller, name),
        });
        if use_caller {
            let as_dyn: Arc<dyn Schedule> = sched.clone();
            init_use_caller(&as_dyn);
        }
        sched
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// The scheduler driving the calling thread, if any
    pub fn current() -> Option<Arc<dyn Schedule>> {
        current_scheduler()
    }

    /// Spawn the worker pool
    pub fn start(self: &Arc<Self>) -> SchedResult<()> {
        let as_dyn: Arc<dyn Schedule> = self.clone();
        start_scheduler(&as_dyn)
    }

    /// Drain all tasks and join the workers
    pub fn stop(self: &Arc<Self>) {
        let as_dyn: Arc<dyn Schedule> = self.clone();
        stop_scheduler(&as_dyn)
    }

    /// Queue a callable
    pub fn schedule<F>(&self, f: F) -> SchedResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(ScheduleTask::from_fn(f, ANY_THREAD))
    }

    /// Queue a callable pinned to a worker thread id
    pub fn schedule_on<F>(&self, f: F, thread: libc::pid_t) -> SchedResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(ScheduleTask::from_fn(f, thread))
    }

    /// Queue an existing fiber
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>, thread: libc::pid_t) -> SchedResult<()> {
        self.schedule_task(ScheduleTask::from_fiber(fiber, thread))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use weft_core::FiberState;

    #[test]
    fn test_tasks_all_run() {
        let sched = Scheduler::new(2, false, "test-pool");
        sched.start().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let c = counter.clone();
            sched
                .schedule(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        sched.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_fifo_on_single_worker() {
        let sched = Scheduler::new(1, false, "test-fifo");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let o = order.clone();
            sched
                .schedule(move || {
                    o.lock().unwrap().push(i);
                })
                .unwrap();
        }
        sched.start().unwrap();
        sched.stop();
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_use_caller_drains_on_stop() {
        let sched = Scheduler::new(1, true, "test-caller");
        sched.start().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let c = counter.clone();
            sched
                .schedule(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        // No spawned workers; everything runs while stop drains
        sched.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_yielded_fiber_resumes_when_rescheduled() {
        let sched = Scheduler::new(1, false, "test-requeue");
        sched.start().unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let fiber = Fiber::new(
            Box::new(move || {
                l.lock().unwrap().push("first");
                Fiber::yield_current();
                l.lock().unwrap().push("second");
            }),
            0,
            true,
        )
        .unwrap();

        sched
            .schedule_fiber(fiber.clone(), weft_core::constants::ANY_THREAD)
            .unwrap();

        // The worker drops its handle at the yield; the fiber stays
        // suspended until somebody re-schedules it
        for _ in 0..500 {
            if fiber.state() == FiberState::Ready && log.lock().unwrap().len() == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(*log.lock().unwrap(), vec!["first"]);

        sched
            .schedule_fiber(fiber.clone(), weft_core::constants::ANY_THREAD)
            .unwrap();
        sched.stop();

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_pin_to_unknown_thread_rejected() {
        let sched = Scheduler::new(1, false, "test-pin");
        sched.start().unwrap();

        let err = sched.schedule_on(|| {}, 1).unwrap_err();
        assert_eq!(err, SchedError::NoSuchThread(1));

        sched.stop();
    }

    #[test]
    fn test_pin_to_real_worker_runs_there() {
        let sched = Scheduler::new(2, false, "test-pin-real");
        sched.start().unwrap();

        let worker = sched.core().thread_ids.lock().unwrap()[0];
        let seen = Arc::new(AtomicI32::new(-1));
        let s = seen.clone();
        sched
            .schedule_on(
                move || {
                    s.store(gettid(), Ordering::SeqCst);
                },
                worker,
            )
            .unwrap();

        // Bounded wait for the pinned task
        for _ in 0..200 {
            if seen.load(Ordering::SeqCst) != -1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        sched.stop();
        assert_eq!(seen.load(Ordering::SeqCst), worker);
    }
}
