//! An elastic pool of worker threads with support for delayed execution.
//!
//! The pool keeps a mandatory set of workers alive for its whole lifetime and
//! grows on demand up to a maximum; workers beyond the mandatory set retire
//! on their own after an idle linger period. Delayed tasks are parked in a
//! dedicated timer thread whose clock can be injected for tests.

use std::{
    collections::BTreeMap,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};

use crate::{future::Task, worker::describe_panic};

/// Receives diagnostic lines from the pool, most notably reports of panicking
/// tasks.
pub type Logger = Arc<dyn Fn(String) + Send + Sync>;

/// Time source used by the pool's timer thread. Injectable for tests.
pub type Clock = Arc<dyn Fn() -> Instant + Send + Sync>;

/// Tuning knobs for a [`WorkerPool`].
#[derive(Clone)]
pub struct PoolConfig {
    /// Number of mandatory workers, started at construction and kept alive
    /// until the pool is dropped.
    pub min_size: usize,
    /// Upper bound on the total number of workers.
    pub max_size: usize,
    /// How long an on-demand worker waits for a task before retiring.
    pub max_linger: Duration,
    /// Granularity of the timer thread driving delayed tasks.
    pub timer_resolution: Duration,
    /// Whether dropping the pool waits for all worker threads to exit.
    ///
    /// Disabling this lets workers outlive the pool, which is not recommended:
    /// a task capturing state that dies with the pool's owner may then run
    /// after that state is gone.
    pub join_threads: bool,
    /// Whether task panics are caught and reported through the logger. When
    /// disabled, a panicking task unwinds (and kills) its worker thread.
    pub catch_panics: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_size: 2,
            max_size: 5,
            max_linger: Duration::from_secs(180),
            timer_resolution: Duration::from_millis(100),
            join_threads: true,
            catch_panics: true,
        }
    }
}

struct WorkerCtx {
    sender: Sender<Task>,
    receiver: Receiver<Task>,
    stopped: AtomicBool,
    worker_count: AtomicU32,
    busy_count: AtomicU32,
    logger: Logger,
    max_linger: Duration,
    catch_panics: bool,
}

impl WorkerCtx {
    /// Body of a mandatory worker: blocks on the queue until the pool stops.
    fn run_mandatory(self: Arc<Self>) {
        self.worker_count.fetch_add(1, Ordering::AcqRel);
        log::trace!("pool worker starting");
        while !self.stopped.load(Ordering::Relaxed) {
            match self.receiver.recv() {
                Ok(task) => self.invoke_guarded(task),
                Err(_) => break,
            }
        }
        self.worker_count.fetch_sub(1, Ordering::AcqRel);
        log::trace!("pool worker exiting");
    }

    /// Body of an on-demand worker: retires once no task arrives within the
    /// linger period.
    fn run_optional(self: Arc<Self>) {
        self.worker_count.fetch_add(1, Ordering::AcqRel);
        log::trace!("optional pool worker starting");
        while !self.stopped.load(Ordering::Relaxed) {
            match self.receiver.recv_timeout(self.max_linger) {
                Ok(task) => self.invoke_guarded(task),
                Err(_) => break,
            }
        }
        self.worker_count.fetch_sub(1, Ordering::AcqRel);
        log::trace!("optional pool worker exiting");
    }

    fn invoke_guarded(&self, task: Task) {
        self.busy_count.fetch_add(1, Ordering::AcqRel);
        if self.catch_panics {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                (self.logger)(format!(
                    "Uncaught panic in thread {:?}: {}",
                    thread::current().id(),
                    describe_panic(payload.as_ref()),
                ));
            }
        } else {
            task();
        }
        self.busy_count.fetch_sub(1, Ordering::AcqRel);
    }
}

struct TimerCtx {
    pending: Mutex<PendingTasks>,
    now: Clock,
    stopped: AtomicBool,
    resolution: Duration,
}

struct PendingTasks {
    /// Delayed tasks keyed by fire time; the sequence number keeps insertion
    /// order among tasks due at the same instant.
    tasks: BTreeMap<(Instant, u64), Task>,
    seq: u64,
}

impl TimerCtx {
    fn schedule(&self, when: Instant, task: Task) {
        let mut pending = self.pending.lock().unwrap();
        let seq = pending.seq;
        pending.seq += 1;
        pending.tasks.insert((when, seq), task);
    }

    /// Body of the timer thread: wakes up every resolution step and releases
    /// every task whose fire time has passed.
    fn run(self: Arc<Self>) {
        log::trace!("pool timer starting");
        let mut due = Vec::new();
        while !self.stopped.load(Ordering::Relaxed) {
            thread::sleep(self.resolution);
            {
                let mut pending = self.pending.lock().unwrap();
                if pending.tasks.is_empty() {
                    continue;
                }
                let now = (self.now)();
                while let Some(entry) = pending.tasks.first_entry() {
                    if entry.key().0 > now {
                        break;
                    }
                    due.push(entry.remove());
                }
            }
            // The lock is released before the batch runs, so released tasks
            // can schedule further delayed tasks without deadlocking.
            for task in due.drain(..) {
                task();
            }
        }
        log::trace!("pool timer exiting");
    }
}

/// A task executor backed by an elastic set of worker threads.
///
/// `min_size` mandatory workers are spawned up front. Whenever a task is
/// submitted while every worker is busy, and the pool has not reached
/// `max_size`, one on-demand worker is added; on-demand workers retire after
/// `max_linger` without work. The growth policy is advisory: a racy over-count
/// spawns a worker that simply retires again.
///
/// Dropping the pool stops all threads. No task that has not been dequeued by
/// then is guaranteed to run.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use taskweave::{PoolConfig, WorkerPool};
///
/// let pool = WorkerPool::new(PoolConfig::default(), Arc::new(|line: String| {
///     eprintln!("{line}");
/// }))
/// .unwrap();
/// pool.execute(|| println!("running on a pool thread"));
/// ```
pub struct WorkerPool {
    config: PoolConfig,
    timer: Arc<TimerCtx>,
    ctx: Arc<WorkerCtx>,
}

impl WorkerPool {
    /// Creates a pool using the real monotonic clock.
    pub fn new(config: PoolConfig, logger: Logger) -> io::Result<Self> {
        Self::with_clock(config, logger, Arc::new(Instant::now))
    }

    /// Creates a pool whose timer consults `now` instead of the system
    /// clock.
    ///
    /// # Panics
    ///
    /// Panics if `min_size` is 0 or `max_size < min_size`.
    pub fn with_clock(config: PoolConfig, logger: Logger, now: Clock) -> io::Result<Self> {
        assert!(config.min_size > 0, "pool needs at least one worker");
        assert!(
            config.max_size >= config.min_size,
            "max_size must be at least min_size",
        );

        let (sender, receiver) = crossbeam_channel::unbounded();
        let ctx = Arc::new(WorkerCtx {
            sender,
            receiver,
            stopped: AtomicBool::new(false),
            worker_count: AtomicU32::new(0),
            busy_count: AtomicU32::new(0),
            logger,
            max_linger: config.max_linger,
            catch_panics: config.catch_panics,
        });
        let timer = Arc::new(TimerCtx {
            pending: Mutex::new(PendingTasks {
                tasks: BTreeMap::new(),
                seq: 0,
            }),
            now,
            stopped: AtomicBool::new(false),
            resolution: config.timer_resolution,
        });

        for i in 0..config.min_size {
            let ctx = ctx.clone();
            thread::Builder::new()
                .name(format!("pool-worker-{i}"))
                .spawn(move || ctx.run_mandatory())?;
        }
        let timer2 = timer.clone();
        thread::Builder::new()
            .name("pool-timer".into())
            .spawn(move || timer2.run())?;

        Ok(WorkerPool { config, timer, ctx })
    }

    /// Submits a task for execution on some worker thread.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute_task(Box::new(f));
    }

    /// Submits a task to run once `delay` has elapsed on the pool's clock.
    ///
    /// The task starts no earlier than the target time and no later than the
    /// target time plus the timer resolution plus queueing delay.
    pub fn execute_in<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute_at((self.timer.now)() + delay, f);
    }

    /// Submits a task to run once the pool's clock reaches `when`.
    pub fn execute_at<F>(&self, when: Instant, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let ctx = self.ctx.clone();
        let task: Task = Box::new(f);
        self.timer.schedule(
            when,
            Box::new(move || {
                ctx.sender.send(task).ok();
            }),
        );
    }

    /// Returns the current number of live worker threads.
    pub fn worker_count(&self) -> usize {
        self.ctx.worker_count.load(Ordering::Acquire) as usize
    }

    fn execute_task(&self, task: Task) {
        self.ctx.sender.send(task).ok();

        let worker_count = self.ctx.worker_count.load(Ordering::Acquire) as usize;
        if worker_count < self.config.max_size
            && worker_count == self.ctx.busy_count.load(Ordering::Acquire) as usize
        {
            let ctx = self.ctx.clone();
            if let Err(err) = thread::Builder::new()
                .name("pool-worker-opt".into())
                .spawn(move || ctx.run_optional())
            {
                log::warn!("failed to grow worker pool: {err}");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.timer.stopped.store(true, Ordering::Relaxed);
        self.ctx.stopped.store(true, Ordering::Relaxed);

        // Workers parked in a blocking dequeue only notice the stop flag once
        // they receive a task, so feed each of them a trivial one. The short
        // sleep keeps a single worker from swallowing several wake-ups.
        for _ in 0..self.ctx.worker_count.load(Ordering::Acquire) {
            self.ctx
                .sender
                .send(Box::new(|| thread::sleep(Duration::from_millis(100))))
                .ok();
        }

        if self.config.join_threads {
            while self.ctx.worker_count.load(Ordering::Acquire) != 0 {
                thread::yield_now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::atomic::AtomicUsize,
        thread::ThreadId,
    };

    use super::*;

    fn assert_send<T: Send>() {}

    fn test_config() -> PoolConfig {
        PoolConfig {
            min_size: 2,
            max_size: 4,
            max_linger: Duration::from_millis(500),
            timer_resolution: Duration::from_millis(1),
            join_threads: true,
            catch_panics: true,
        }
    }

    fn collecting_logger() -> (Logger, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let l = lines.clone();
        let logger: Logger = Arc::new(move |line| l.lock().unwrap().push(line));
        (logger, lines)
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            thread::yield_now();
        }
        check()
    }

    #[test]
    fn executes_in_parallel_on_different_threads() {
        let (logger, _) = collecting_logger();
        let pool = WorkerPool::new(test_config(), logger).unwrap();
        assert!(wait_until(Duration::from_secs(1), || pool.worker_count() == 2));

        let can_proceed = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicUsize::new(0));
        let ids = Arc::new(Mutex::new(HashSet::<ThreadId>::new()));

        for _ in 0..2 {
            let can_proceed = can_proceed.clone();
            let started = started.clone();
            let ids = ids.clone();
            pool.execute(move || {
                ids.lock().unwrap().insert(thread::current().id());
                started.fetch_add(1, Ordering::Relaxed);
                while !can_proceed.load(Ordering::Relaxed) {
                    thread::yield_now();
                }
            });
        }

        assert!(wait_until(Duration::from_secs(5), || {
            started.load(Ordering::Relaxed) == 2
        }));
        assert_eq!(ids.lock().unwrap().len(), 2);
        can_proceed.store(true, Ordering::Relaxed);
    }

    #[test]
    fn grows_until_max_size_and_shrinks_after_linger() {
        let (logger, _) = collecting_logger();
        let config = test_config();
        let pool = WorkerPool::new(config.clone(), logger).unwrap();
        assert!(wait_until(Duration::from_secs(1), || pool.worker_count() == 2));

        let can_proceed = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let ids = Arc::new(Mutex::new(HashSet::<ThreadId>::new()));

        // One more task than the pool can run at once: the last one has to
        // wait for a slot.
        for _ in 0..config.max_size + 1 {
            let can_proceed = can_proceed.clone();
            let started = started.clone();
            let stopped = stopped.clone();
            let ids = ids.clone();
            pool.execute(move || {
                ids.lock().unwrap().insert(thread::current().id());
                started.fetch_add(1, Ordering::Relaxed);
                while !can_proceed.load(Ordering::Relaxed) {
                    thread::yield_now();
                }
                stopped.fetch_add(1, Ordering::Relaxed);
            });
            thread::sleep(Duration::from_millis(100));
        }

        assert!(wait_until(Duration::from_secs(5), || {
            started.load(Ordering::Relaxed) == config.max_size
        }));
        assert_eq!(pool.worker_count(), config.max_size);

        can_proceed.store(true, Ordering::Relaxed);
        assert!(wait_until(Duration::from_secs(5), || {
            stopped.load(Ordering::Relaxed) == config.max_size + 1
        }));
        assert_eq!(ids.lock().unwrap().len(), config.max_size);

        // On-demand workers retire after the linger period.
        thread::sleep(config.max_linger);
        assert!(wait_until(Duration::from_secs(5), || {
            pool.worker_count() == config.min_size
        }));
    }

    #[test]
    fn delayed_task_fires_on_the_injected_clock() {
        let (logger, _) = collecting_logger();
        let now = Arc::new(Mutex::new(Instant::now()));
        let now2 = now.clone();
        let clock: Clock = Arc::new(move || *now2.lock().unwrap());
        let pool = WorkerPool::with_clock(test_config(), logger, clock).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        pool.execute_in(Duration::from_millis(10_000), move || {
            done2.store(true, Ordering::Relaxed);
        });

        *now.lock().unwrap() += Duration::from_millis(9_999);
        thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::Relaxed));

        *now.lock().unwrap() += Duration::from_millis(1);
        assert!(wait_until(Duration::from_secs(5), || {
            done.load(Ordering::Relaxed)
        }));
    }

    #[test]
    fn execute_at_fires_once_the_clock_reaches_the_target() {
        let (logger, _) = collecting_logger();
        let now = Arc::new(Mutex::new(Instant::now()));
        let now2 = now.clone();
        let clock: Clock = Arc::new(move || *now2.lock().unwrap());
        let pool = WorkerPool::with_clock(test_config(), logger, clock).unwrap();

        let base = *now.lock().unwrap();

        // Already due: fires on the next timer tick.
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        pool.execute_at(base, move || done2.store(true, Ordering::Relaxed));
        assert!(wait_until(Duration::from_secs(5), || {
            done.load(Ordering::Relaxed)
        }));

        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        pool.execute_at(base + Duration::from_millis(10_000), move || {
            done2.store(true, Ordering::Relaxed);
        });
        *now.lock().unwrap() = base + Duration::from_millis(9_999);
        thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::Relaxed));

        *now.lock().unwrap() = base + Duration::from_millis(10_000);
        assert!(wait_until(Duration::from_secs(5), || {
            done.load(Ordering::Relaxed)
        }));
    }

    #[test]
    fn panicking_task_is_reported_through_the_logger() {
        let (logger, lines) = collecting_logger();
        let pool = WorkerPool::new(test_config(), logger).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        pool.execute(move || {
            done2.store(true, Ordering::Relaxed);
            std::panic::resume_unwind(Box::new("pool panic".to_string()));
        });

        assert!(wait_until(Duration::from_secs(5), || {
            done.load(Ordering::Relaxed)
        }));
        assert!(wait_until(Duration::from_secs(5), || {
            !lines.lock().unwrap().is_empty()
        }));

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("Uncaught panic in thread"));
        assert!(lines[0].ends_with("pool panic"));
    }

    #[test]
    fn dropping_the_pool_joins_all_workers() {
        let (logger, _) = collecting_logger();
        let pool = WorkerPool::new(test_config(), logger).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        pool.execute(move || done2.store(true, Ordering::Relaxed));
        assert!(wait_until(Duration::from_secs(5), || {
            done.load(Ordering::Relaxed)
        }));
        drop(pool);
    }

    #[test]
    fn pool_is_send() {
        assert_send::<WorkerPool>();
    }
}
