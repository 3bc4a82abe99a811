//! An owned worker thread draining a delay-ordered task queue.

use std::{
    any::Any,
    collections::BTreeMap,
    io,
    panic::{self, resume_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::future::Task;

/// Called on the worker thread with `(worker_name, description)` whenever a
/// task panics. The worker itself keeps running.
pub type PanicHandler = Box<dyn Fn(&str, &str) + Send>;

/// Extracts a printable message from a panic payload.
pub(crate) fn describe_panic(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

/// A builder object that can be used to configure and spawn a [`Worker`].
pub struct WorkerBuilder {
    name: Option<String>,
    capacity: usize,
    panic_handler: Option<PanicHandler>,
}

impl WorkerBuilder {
    /// Sets the name of the [`Worker`] thread.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets how many tasks may be queued at once.
    ///
    /// By default, up to 16 tasks can be pending. When the queue is full,
    /// [`Worker::schedule`] blocks until the worker has drained a task.
    #[inline]
    pub fn capacity(self, capacity: usize) -> Self {
        assert_ne!(capacity, 0, "capacity must be at least 1");
        Self { capacity, ..self }
    }

    /// Sets the handler invoked when a task panics.
    ///
    /// The handler receives the worker's name and a description of the panic.
    /// The default handler logs the panic via [`log::error!`].
    pub fn panic_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&str, &str) + Send + 'static,
    {
        Self {
            panic_handler: Some(Box::new(handler)),
            ..self
        }
    }

    /// Spawns a [`Worker`] thread draining the task queue.
    pub fn spawn(self) -> io::Result<Worker> {
        let inner = Arc::new(Inner {
            queue: Mutex::new(TaskQueue {
                tasks: BTreeMap::new(),
                seq: 0,
            }),
            filled: Condvar::new(),
            emptied: Condvar::new(),
            stop: AtomicBool::new(false),
            capacity: self.capacity,
        });

        let name = self.name.unwrap_or_default();
        let handler = self.panic_handler.unwrap_or_else(|| {
            Box::new(|worker, what| log::error!("worker '{worker}' task panicked: {what}"))
        });

        let mut builder = thread::Builder::new();
        if !name.is_empty() {
            builder = builder.name(name.clone());
        }
        let thread_inner = inner.clone();
        let handle = builder.spawn(move || {
            log::trace!("worker '{name}' starting");
            run(&thread_inner, &name, &handler);
            log::trace!("worker '{name}' exiting");
        })?;

        Ok(Worker {
            inner,
            handle: Some(handle),
        })
    }
}

struct TaskQueue {
    /// Pending tasks keyed by fire time; the sequence number keeps insertion
    /// order among tasks due at the same instant.
    tasks: BTreeMap<(Instant, u64), Task>,
    seq: u64,
}

struct Inner {
    queue: Mutex<TaskQueue>,
    filled: Condvar,
    emptied: Condvar,
    stop: AtomicBool,
    capacity: usize,
}

fn run(inner: &Inner, name: &str, handler: &PanicHandler) {
    while !inner.stop.load(Ordering::Relaxed) {
        let task = next_task(inner);
        inner.emptied.notify_one();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            handler(name, describe_panic(payload.as_ref()));
        }
    }
}

/// Blocks until the earliest queued task is due, and dequeues it.
fn next_task(inner: &Inner) -> Task {
    let mut queue = inner.queue.lock().unwrap();
    loop {
        queue = inner
            .filled
            .wait_while(queue, |queue| queue.tasks.is_empty())
            .unwrap();
        // An earlier task may be scheduled while we wait, so re-read the head
        // after every wakeup.
        let head = *queue.tasks.keys().next().unwrap();
        let now = Instant::now();
        if head.0 <= now {
            return queue.tasks.remove(&head).unwrap();
        }
        (queue, _) = inner.filled.wait_timeout(queue, head.0 - now).unwrap();
    }
}

/// A handle to a worker thread that runs scheduled tasks in fire-time order.
///
/// Tasks can be scheduled for immediate execution or after a delay; tasks due
/// at the same time run in scheduling order. A panicking task is reported to
/// the configured panic handler and the worker carries on.
///
/// When the [`Worker`] is dropped, the thread is signaled to stop and joined.
/// Pending tasks that have not started by then are discarded.
pub struct Worker {
    inner: Arc<Inner>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Returns a builder that can be used to configure and spawn a
    /// [`Worker`].
    #[inline]
    pub fn builder() -> WorkerBuilder {
        WorkerBuilder {
            name: None,
            capacity: 16,
            panic_handler: None,
        }
    }

    /// Schedules a task for immediate execution.
    ///
    /// Blocks while the queue is at capacity.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_in(Duration::ZERO, f);
    }

    /// Schedules a task to run no earlier than `delay` from now.
    ///
    /// Blocks while the queue is at capacity.
    pub fn schedule_in<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let fire_at = Instant::now() + delay;
        {
            let queue = self.inner.queue.lock().unwrap();
            let mut queue = self
                .inner
                .emptied
                .wait_while(queue, |queue| queue.tasks.len() >= self.inner.capacity)
                .unwrap();
            let seq = queue.seq;
            queue.seq += 1;
            queue.tasks.insert((fire_at, seq), Box::new(f));
        }
        self.inner.filled.notify_one();
    }

    /// Like [`Worker::schedule`], but returns `false` instead of blocking
    /// when the queue is at capacity.
    pub fn try_schedule<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.try_schedule_in(Duration::ZERO, f)
    }

    /// Like [`Worker::schedule_in`], but returns `false` instead of blocking
    /// when the queue is at capacity.
    pub fn try_schedule_in<F>(&self, delay: Duration, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let fire_at = Instant::now() + delay;
        {
            let mut queue = self.inner.queue.lock().unwrap();
            if queue.tasks.len() >= self.inner.capacity {
                return false;
            }
            let seq = queue.seq;
            queue.seq += 1;
            queue.tasks.insert((fire_at, seq), Box::new(f));
        }
        self.inner.filled.notify_one();
        true
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let inner = self.inner.clone();
        self.schedule(move || inner.stop.store(true, Ordering::Relaxed));

        // Wait for the thread to exit and propagate its panic if it panicked.
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(()) => {}
                Err(payload) => {
                    if !thread::panicking() {
                        resume_unwind(payload);
                    }
                }
            }
        }
    }
}
