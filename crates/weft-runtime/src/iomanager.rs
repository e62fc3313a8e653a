//! Event-driven I/O scheduler
//!
//! `IoManager` is a `Scheduler` whose idle fiber blocks in `epoll_wait`
//! instead of spinning, and a timer host whose head deadline bounds that
//! wait. Registration flow: a fiber (or callback) arms a direction on an
//! fd, the idle fiber observes readiness and hands the stored
//! continuation back to the scheduler, the worker loop resumes it.
//!
//! A non-blocking self-pipe breaks the idle wait when work arrives from
//! outside the epoll set: a task enqueue, a new head timer, or shutdown.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use bitflags::bitflags;
use weft_core::constants::ANY_THREAD;
use weft_core::{wdebug, werror, winfo, FiberState, SchedError, SchedResult};

use crate::config::config;
use crate::fiber::Fiber;
use crate::scheduler::{
    current_scheduler, init_use_caller, start_scheduler, stop_scheduler, Schedule, ScheduleTask,
    SchedulerCore, TaskFn,
};
use crate::timer::{Timer, TimerCallback, TimerManager};

bitflags! {
    /// Readiness directions, numerically aligned with EPOLLIN/EPOLLOUT
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Event: u32 {
        const NONE  = 0x0;
        const READ  = 0x1;
        const WRITE = 0x4;
    }
}

#[inline]
fn event_bits(ev: Event) -> u32 {
    let mut bits = 0;
    if ev.contains(Event::READ) {
        bits |= libc::EPOLLIN as u32;
    }
    if ev.contains(Event::WRITE) {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

#[inline]
fn events_from_bits(bits: u32) -> Event {
    let mut ev = Event::empty();
    if bits & libc::EPOLLIN as u32 != 0 {
        ev |= Event::READ;
    }
    if bits & libc::EPOLLOUT as u32 != 0 {
        ev |= Event::WRITE;
    }
    ev
}

/// Continuation stored for one armed direction
///
/// Exactly one of `fiber`/`cb` is populated while armed.
#[derive(Default)]
struct EventContext {
    scheduler: Option<Weak<dyn Schedule>>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<TaskFn>,
}

impl EventContext {
    fn is_clean(&self) -> bool {
        self.scheduler.is_none() && self.fiber.is_none() && self.cb.is_none()
    }

    fn clear(&mut self) {
        self.scheduler = None;
        self.fiber = None;
        self.cb = None;
    }
}

struct FdInner {
    events: Event,
    read: EventContext,
    write: EventContext,
}

/// Per-fd registration record
pub struct FdContext {
    fd: RawFd,
    inner: Mutex<FdInner>,
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            inner: Mutex::new(FdInner {
                events: Event::empty(),
                read: EventContext::default(),
                write: EventContext::default(),
            }),
        }
    }
}

thread_local! {
    static CURRENT_IO: RefCell<Option<Weak<IoManager>>> = const { RefCell::new(None) };
}

pub(crate) fn set_current_io(io: &Arc<IoManager>) {
    CURRENT_IO.with(|c| *c.borrow_mut() = Some(Arc::downgrade(io)));
}

/// Scheduler + timer host + epoll reactor
pub struct IoManager {
    core: SchedulerCore,
    timers: TimerManager,
    epfd: RawFd,
    /// Self-pipe: [read end, write end]
    tickle_fds: [RawFd; 2],
    /// Number of armed (fd, direction) slots
    pending: AtomicUsize,
    contexts: RwLock<Vec<Arc<FdContext>>>,
}

impl IoManager {
    /// Build the reactor and start its worker pool
    pub fn new(threads: usize, use_caller: bool, name: &str) -> SchedResult<Arc<IoManager>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(SchedError::last_os("epoll_create1"));
        }

        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            let err = SchedError::last_os("pipe");
            unsafe { libc::close(epfd) };
            return Err(err);
        }
        for fd in fds {
            if unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) } != 0 {
                let err = SchedError::last_os("fcntl");
                unsafe {
                    libc::close(epfd);
                    libc::close(fds[0]);
                    libc::close(fds[1]);
                }
                return Err(err);
            }
        }

        // Edge-triggered read interest on the wakeup pipe
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: fds[0] as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fds[0], &mut ev) } != 0 {
            let err = SchedError::last_os("epoll_ctl");
            unsafe {
                libc::close(epfd);
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(err);
        }

        let io = Arc::new(IoManager {
            core: SchedulerCore::new(threads, use_caller, name),
            timers: TimerManager::new(),
            epfd,
            tickle_fds: fds,
            pending: AtomicUsize::new(0),
            contexts: RwLock::new(Vec::new()),
        });
        io.grow_contexts(config().initial_fd_slots);

        // A new head timer must shorten an in-flight idle wait
        let weak = Arc::downgrade(&io);
        io.timers.set_front_hook(Box::new(move || {
            if let Some(io) = weak.upgrade() {
                io.tickle();
            }
        }));

        let as_dyn: Arc<dyn Schedule> = io.clone();
        if use_caller {
            init_use_caller(&as_dyn);
        }
        start_scheduler(&as_dyn)?;
        winfo!("{}: reactor ready", name);
        Ok(io)
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// The reactor driving the calling thread, if any
    pub fn current() -> Option<Arc<IoManager>> {
        CURRENT_IO.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
    }

    /// Drain every task, timer and pending event, then join the workers
    pub fn stop(self: &Arc<Self>) {
        let as_dyn: Arc<dyn Schedule> = self.clone();
        stop_scheduler(&as_dyn);
    }

    /// Queue a callable
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

    /// Schedule `cb` to fire in `ms` milliseconds
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, cb, recurring)
    }

    /// Timer whose firing is skipped once `cond` is gone
    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, cond: Weak<T>, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        self.timers.add_condition_timer(ms, cb, cond, recurring)
    }

    /// Any timers outstanding?
    pub fn has_timer(&self) -> bool {
        self.timers.has_timer()
    }

    /// Number of armed (fd, direction) slots
    pub fn pending_event_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn grow_contexts(&self, len: usize) {
        let mut table = self.contexts.write().unwrap();
        while table.len() < len {
            let next_fd = table.len() as RawFd;
            table.push(Arc::new(FdContext::new(next_fd)));
        }
    }

    /// Slot for `fd`, growing the table by 1.5x when it falls outside
    fn context_for(&self, fd: RawFd) -> Arc<FdContext> {
        assert!(fd >= 0, "negative fd");
        {
            let table = self.contexts.read().unwrap();
            if let Some(ctx) = table.get(fd as usize) {
                return ctx.clone();
            }
        }
        self.grow_contexts((fd as usize + 1) * 3 / 2);
        self.contexts.read().unwrap()[fd as usize].clone()
    }

    /// Arm one direction on `fd`
    ///
    /// With a callback, readiness schedules the callback; without one, the
    /// calling fiber is captured and resumed on readiness. Arming an
    /// already-armed direction fails with `DuplicateEvent`; replace by
    /// `del_event` + `add_event`.
    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<TaskFn>) -> SchedResult<()> {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "add_event takes exactly one direction"
        );
        let ctx = self.context_for(fd);
        let mut inner = ctx.inner.lock().unwrap();

        if inner.events.contains(event) {
            werror!(
                "{}: add_event: fd {} already armed for {:?}",
                self.name(),
                fd,
                event
            );
            return Err(SchedError::DuplicateEvent);
        }

        let op = if inner.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ep = libc::epoll_event {
            events: libc::EPOLLET as u32 | event_bits(inner.events | event),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep) } != 0 {
            let err = SchedError::last_os("epoll_ctl");
            werror!("{}: add_event: {} (fd {})", self.name(), err, fd);
            return Err(err);
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        inner.events |= event;

        let slot = if event == Event::READ {
            &mut inner.read
        } else {
            &mut inner.write
        };
        debug_assert!(slot.is_clean());
        slot.scheduler = current_scheduler().map(|s| Arc::downgrade(&s));
        match cb {
            Some(cb) => slot.cb = Some(cb),
            None => {
                let fiber = Fiber::current();
                assert_eq!(
                    fiber.state(),
                    FiberState::Running,
                    "add_event without a callback must run inside a fiber"
                );
                slot.fiber = Some(fiber);
            }
        }
        Ok(())
    }

    /// Disarm one direction without running its continuation
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let ctx = {
            let table = self.contexts.read().unwrap();
            match table.get(fd as usize) {
                Some(c) => c.clone(),
                None => return false,
            }
        };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.events.contains(event) {
            return false;
        }

        let left = inner.events & !event;
        if !self.rearm(fd, left) {
            return false;
        }

        self.pending.fetch_sub(1, Ordering::SeqCst);
        inner.events = left;
        let slot = if event == Event::READ {
            &mut inner.read
        } else {
            &mut inner.write
        };
        slot.clear();
        true
    }

    /// Disarm one direction and run its continuation now
    ///
    /// The continuation observes an ordinary completion; there is no flag
    /// distinguishing cancellation from readiness, so waiters that care
    /// must inspect their own state.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let ctx = {
            let table = self.contexts.read().unwrap();
            match table.get(fd as usize) {
                Some(c) => c.clone(),
                None => return false,
            }
        };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.events.contains(event) {
            return false;
        }

        let left = inner.events & !event;
        if !self.rearm(fd, left) {
            return false;
        }

        self.trigger_event(fd, &mut inner, event);
        true
    }

    /// Disarm both directions, running their continuations
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let ctx = {
            let table = self.contexts.read().unwrap();
            match table.get(fd as usize) {
                Some(c) => c.clone(),
                None => return false,
            }
        };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events.is_empty() {
            return false;
        }

        if !self.rearm(fd, Event::empty()) {
            return false;
        }

        if inner.events.contains(Event::READ) {
            self.trigger_event(fd, &mut inner, Event::READ);
        }
        if inner.events.contains(Event::WRITE) {
            self.trigger_event(fd, &mut inner, Event::WRITE);
        }
        debug_assert!(inner.events.is_empty());
        true
    }

    /// Point epoll's interest for `fd` at `left` (DEL when empty)
    fn rearm(&self, fd: RawFd, left: Event) -> bool {
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ep = libc::epoll_event {
            events: libc::EPOLLET as u32 | event_bits(left),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep) };
        if rc != 0 {
            werror!(
                "{}: epoll_ctl({}) on fd {} failed: errno {}",
                self.name(),
                if left.is_empty() { "DEL" } else { "MOD" },
                fd,
                std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
            );
            return false;
        }
        true
    }

    /// Hand one armed direction's continuation to its scheduler
    ///
    /// Caller holds the context lock and has already adjusted the epoll
    /// interest; this clears the direction bit and the slot, and drops the
    /// pending count.
    fn trigger_event(&self, fd: RawFd, inner: &mut FdInner, event: Event) {
        debug_assert!(inner.events.contains(event));
        inner.events &= !event;

        let slot = if event == Event::READ {
            &mut inner.read
        } else {
            &mut inner.write
        };
        let sched = slot.scheduler.take().and_then(|w| w.upgrade());
        let fiber = slot.fiber.take();
        let cb = slot.cb.take();
        slot.clear();
        self.pending.fetch_sub(1, Ordering::SeqCst);

        let task = if let Some(fiber) = fiber {
            ScheduleTask::from_fiber(fiber, ANY_THREAD)
        } else if let Some(cb) = cb {
            ScheduleTask {
                fiber: None,
                cb: Some(cb),
                thread: ANY_THREAD,
            }
        } else {
            werror!("{}: fd {} armed {:?} with empty slot", self.name(), fd, event);
            return;
        };

        match sched {
            Some(s) => {
                let _ = s.schedule_task(task);
            }
            // Registered outside any worker: run it here
            None => {
                let _ = self.schedule_task(task);
            }
        }
    }

    /// Drain every byte queued on the wakeup pipe
    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.tickle_fds[0],
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Schedule for IoManager {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }

    /// Break an idle wait, if anyone is actually waiting
    fn tickle(&self) {
        if !self.core.has_idle_threads() {
            return;
        }
        let n = unsafe {
            libc::write(
                self.tickle_fds[1],
                b"T".as_ptr() as *const libc::c_void,
                1,
            )
        };
        // A full pipe already holds a wakeup; nothing to do
        let _ = n;
    }

    fn stopping(&self) -> bool {
        self.core.base_stopping()
            && !self.timers.has_timer()
            && self.pending.load(Ordering::Acquire) == 0
    }

    fn io_manager(self: Arc<Self>) -> Option<Arc<IoManager>> {
        Some(self)
    }

    /// The reactor loop each worker's idle fiber runs
    fn idle(&self) {
        let cfg = config();
        let capacity = cfg.epoll_event_capacity;
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; capacity];
        let mut expired: Vec<TimerCallback> = Vec::new();

        loop {
            if self.stopping() {
                wdebug!("{}: idle fiber exits", self.name());
                // Pass the shutdown signal to the next parked worker
                self.tickle();
                return;
            }

            let timeout = self
                .timers
                .next_timer_ms()
                .min(cfg.max_epoll_timeout_ms)
                .min(i32::MAX as u64) as i32;
            let n = loop {
                let rc = unsafe {
                    libc::epoll_wait(self.epfd, events.as_mut_ptr(), capacity as i32, timeout)
                };
                if rc >= 0 {
                    break rc as usize;
                }
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                if errno == libc::EINTR {
                    continue;
                }
                werror!("{}: epoll_wait failed: errno {}", self.name(), errno);
                break 0;
            };

            // Timer batch goes to the scheduler before any fd work
            expired.clear();
            self.timers.collect_expired(&mut expired);
            for cb in expired.drain(..) {
                let _ = self.schedule(move || cb());
            }

            for i in 0..n {
                let ep = events[i];
                let fd = ep.u64 as RawFd;

                if fd == self.tickle_fds[0] {
                    self.drain_tickle_pipe();
                    continue;
                }

                let ctx = {
                    let table = self.contexts.read().unwrap();
                    match table.get(fd as usize) {
                        Some(c) => c.clone(),
                        None => continue,
                    }
                };
                let mut inner = ctx.inner.lock().unwrap();

                if inner.events.is_empty() {
                    // Stale: everything was disarmed while this event was
                    // in flight
                    unsafe {
                        libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
                    };
                    continue;
                }

                let mut bits = ep.events;
                if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    // Error/hangup wakes every armed direction so waiters
                    // can observe the failure from their own syscall
                    bits |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & event_bits(inner.events);
                }

                let real = events_from_bits(bits) & inner.events;
                if real.is_empty() {
                    continue;
                }

                let left = inner.events & !real;
                if !self.rearm(ctx.fd, left) {
                    continue;
                }

                if real.contains(Event::READ) {
                    self.trigger_event(fd, &mut inner, Event::READ);
                }
                if real.contains(Event::WRITE) {
                    self.trigger_event(fd, &mut inner, Event::WRITE);
                }
            }

            // Let the freshly queued tasks run, then poll again
            Fiber::yield_current();
        }
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.pending.load(Ordering::Acquire),
            0,
            "IoManager dropped with armed events"
        );
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize};
    use std::time::{Duration, Instant};

    fn wait_until<F: Fn() -> bool>(cond: F, ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(ms);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    fn make_pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    /// A fiber parks itself on a timer and is resumed after it fires
    #[test]
    fn test_single_sleep() {
        let io = IoManager::new(1, false, "io-sleep").unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let started = Instant::now();

        let d = done.clone();
        io.schedule(move || {
            let io = IoManager::current().unwrap();
            let me = Fiber::current();
            let weak = Arc::downgrade(&io);
            let target = me.clone();
            io.add_timer(
                50,
                move || {
                    if let Some(io) = weak.upgrade() {
                        let _ = io.schedule_fiber(target.clone(), ANY_THREAD);
                    }
                },
                false,
            );
            Fiber::yield_current();
            d.store(true, Ordering::SeqCst);
        })
        .unwrap();

        assert!(wait_until(|| done.load(Ordering::SeqCst), 8000));
        assert!(started.elapsed() >= Duration::from_millis(40));

        io.stop();
        assert!(!io.has_timer());
        assert_eq!(io.pending_event_count(), 0);
    }

    /// A fiber blocks on pipe readability; a timer produces the byte
    #[test]
    fn test_pipe_readiness() {
        let io = IoManager::new(2, false, "io-pipe").unwrap();
        let (r, w) = make_pipe();
        let got = Arc::new(AtomicI32::new(-1));

        let g = got.clone();
        io.schedule(move || {
            let io = IoManager::current().unwrap();
            io.add_event(r, Event::READ, None).unwrap();
            Fiber::yield_current();
            // Resumed by readiness
            let mut byte = [0u8; 1];
            let n = unsafe { libc::read(r, byte.as_mut_ptr() as *mut libc::c_void, 1) };
            assert_eq!(n, 1);
            g.store(byte[0] as i32, Ordering::SeqCst);
        })
        .unwrap();

        io.add_timer(
            20,
            move || {
                let n = unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };
                assert_eq!(n, 1);
            },
            false,
        );

        assert!(wait_until(|| got.load(Ordering::SeqCst) != -1, 8000));
        assert_eq!(got.load(Ordering::SeqCst), b'x' as i32);

        io.stop();
        assert_eq!(io.pending_event_count(), 0);
        close(r);
        close(w);
    }

    /// cancel_event fires the stored callback exactly once; later data
    /// does not re-trigger it
    #[test]
    fn test_cancel_event_fires_once() {
        let io = IoManager::new(1, false, "io-cancel").unwrap();
        let (r, w) = make_pipe();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        io.add_event(
            r,
            Event::READ,
            Some(Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        assert_eq!(io.pending_event_count(), 1);

        assert!(io.cancel_event(r, Event::READ));
        assert_eq!(io.pending_event_count(), 0);
        assert!(wait_until(|| fired.load(Ordering::SeqCst) == 1, 8000));

        // Data arriving after cancellation must not invoke it again
        unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        assert!(!io.cancel_event(r, Event::READ));
        io.stop();
        close(r);
        close(w);
    }

    /// add_event then del_event returns the system to its prior state
    #[test]
    fn test_add_then_del_round_trip() {
        let io = IoManager::new(1, false, "io-del").unwrap();
        let (r, w) = make_pipe();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        io.add_event(
            r,
            Event::READ,
            Some(Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        assert_eq!(io.pending_event_count(), 1);

        assert!(io.del_event(r, Event::READ));
        assert_eq!(io.pending_event_count(), 0);
        assert!(!io.del_event(r, Event::READ));

        // del does not trigger, and the interest really is gone
        unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        io.stop();
        close(r);
        close(w);
    }

    #[test]
    fn test_duplicate_add_event_rejected() {
        let io = IoManager::new(1, false, "io-dup").unwrap();
        let (r, w) = make_pipe();

        io.add_event(r, Event::READ, Some(Box::new(|| {}))).unwrap();
        let err = io
            .add_event(r, Event::READ, Some(Box::new(|| {})))
            .unwrap_err();
        assert_eq!(err, SchedError::DuplicateEvent);

        assert!(io.del_event(r, Event::READ));
        io.stop();
        close(r);
        close(w);
    }

    /// Registering an fd past the table end grows it without losing
    /// existing registrations
    #[test]
    fn test_large_fd_grows_table() {
        let io = IoManager::new(1, false, "io-grow").unwrap();
        let (r, w) = make_pipe();
        let (r2, w2) = make_pipe();

        io.add_event(r, Event::READ, Some(Box::new(|| {}))).unwrap();

        let big = unsafe { libc::fcntl(r2, libc::F_DUPFD, 300) };
        assert!(big >= 300);
        io.add_event(big, Event::READ, Some(Box::new(|| {}))).unwrap();
        assert_eq!(io.pending_event_count(), 2);

        // The early registration survived the resize
        assert!(io.del_event(r, Event::READ));
        assert!(io.del_event(big, Event::READ));
        assert_eq!(io.pending_event_count(), 0);

        io.stop();
        close(r);
        close(w);
        close(r2);
        close(w2);
        close(big);
    }

    /// cancel_all covers both armed directions of one fd at once
    #[test]
    fn test_cancel_all_both_directions() {
        let io = IoManager::new(1, false, "io-all").unwrap();
        // A pipe read end is never writable, so neither direction fires
        // on its own
        let (r, w) = make_pipe();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        io.add_event(
            r,
            Event::READ,
            Some(Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        let f = fired.clone();
        io.add_event(
            r,
            Event::WRITE,
            Some(Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        assert_eq!(io.pending_event_count(), 2);

        assert!(io.cancel_all(r));
        assert!(!io.cancel_all(r));
        assert!(wait_until(|| fired.load(Ordering::SeqCst) == 2, 8000));
        assert_eq!(io.pending_event_count(), 0);

        io.stop();
        close(r);
        close(w);
    }

    /// stop() only returns once every sleeper has finished
    #[test]
    fn test_shutdown_drains_sleepers() {
        let io = IoManager::new(4, false, "io-drain").unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let d = done.clone();
            io.schedule(move || {
                let io = IoManager::current().unwrap();
                let me = Fiber::current();
                let weak = Arc::downgrade(&io);
                let target = me.clone();
                io.add_timer(
                    10,
                    move || {
                        if let Some(io) = weak.upgrade() {
                            let _ = io.schedule_fiber(target.clone(), ANY_THREAD);
                        }
                    },
                    false,
                );
                Fiber::yield_current();
                d.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        io.stop();
        assert_eq!(done.load(Ordering::SeqCst), 100);
        assert!(!io.has_timer());
        assert_eq!(io.pending_event_count(), 0);
    }

    /// A conditional timer acts as an I/O timeout: whichever side loses
    /// cancels the other
    #[test]
    fn test_timeout_cancels_io_wait() {
        let io = IoManager::new(1, false, "io-timeout").unwrap();
        let (r, w) = make_pipe();
        let resumed = Arc::new(AtomicBool::new(false));

        let res = resumed.clone();
        let io2 = io.clone();
        io.schedule(move || {
            let io = IoManager::current().unwrap();
            io.add_event(r, Event::READ, None).unwrap();
            // Nobody ever writes; the timeout synthesizes completion
            io2.add_timer(
                30,
                move || {
                    if let Some(io) = IoManager::current() {
                        io.cancel_event(r, Event::READ);
                    }
                },
                false,
            );
            Fiber::yield_current();
            res.store(true, Ordering::SeqCst);
        })
        .unwrap();

        assert!(wait_until(|| resumed.load(Ordering::SeqCst), 8000));
        io.stop();
        assert_eq!(io.pending_event_count(), 0);
        close(r);
        close(w);
    }

    /// use_caller: the constructing thread participates in the drain
    #[test]
    fn test_use_caller_reactor() {
        let io = IoManager::new(1, true, "io-caller").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let c = count.clone();
            io.schedule(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        io.stop();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
