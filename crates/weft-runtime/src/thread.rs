//! Worker thread wrapper
//!
//! A thin shell over `std::thread` that publishes the kernel tid to the
//! constructor before the callable starts, so the scheduler can record
//! worker ids synchronously at spawn time. Dropping without `join`
//! detaches.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use weft_core::{SchedError, SchedResult};

/// Kernel thread id of the calling thread (cached per thread)
pub fn gettid() -> libc::pid_t {
    thread_local! {
        static TID: Cell<libc::pid_t> = const { Cell::new(0) };
    }
    TID.with(|c| {
        let mut tid = c.get();
        if tid == 0 {
            tid = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };
            c.set(tid);
        }
        tid
    })
}

thread_local! {
    static THREAD_NAME: RefCell<String> = RefCell::new(String::from("UNKNOWN"));
}

/// Counting semaphore for the startup handshake
pub struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cv: Condvar::new(),
        }
    }

    /// P: block until a permit is available, then take it
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cv.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// V: release one permit
    pub fn signal(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cv.notify_one();
    }
}

/// A named OS thread with its kernel tid known at construction
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    id: libc::pid_t,
    name: String,
}

impl Thread {
    /// Spawn `cb` on a new named thread
    ///
    /// Returns only after the child has published its kernel tid, so
    /// `id()` is valid immediately; `cb` starts no earlier than that.
    pub fn new<F>(cb: F, name: &str) -> SchedResult<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let sem = Arc::new(Semaphore::new(0));
        let tid = Arc::new(AtomicI32::new(-1));

        let child_sem = sem.clone();
        let child_tid = tid.clone();
        let child_name = name.to_string();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                child_tid.store(gettid(), Ordering::Release);
                THREAD_NAME.with(|n| *n.borrow_mut() = child_name);
                child_sem.signal();
                cb();
            })
            .map_err(|_| SchedError::SpawnFailed)?;

        sem.wait();

        Ok(Thread {
            handle: Some(handle),
            id: tid.load(Ordering::Acquire),
            name: name.to_string(),
        })
    }

    /// Kernel tid of the spawned thread
    #[inline]
    pub fn id(&self) -> libc::pid_t {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread to finish
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Name of the calling thread, as set by `Thread::new`
    pub fn current_name() -> String {
        THREAD_NAME.with(|n| n.borrow().clone())
    }

    /// Override the calling thread's name
    pub fn set_current_name(name: &str) {
        THREAD_NAME.with(|n| *n.borrow_mut() = name.to_string());
    }
}

// Dropping an unjoined Thread detaches it; std does exactly that when the
// JoinHandle is dropped.
