//! One-shot promise/future pairs with executor-controlled callback delivery.
//!
//! Unlike a blocking promise, completion here is delivered by posting a closure
//! to an injected [`Executor`], so the consumer decides which thread observes
//! the result. A [`Future`] can be cancelled at any point; cancellation is
//! silent and turns any in-flight delivery into a no-op.

use std::{
    error::Error,
    fmt,
    ops::{BitAnd, BitOr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

/// An owned, run-once unit of work.
pub type Task = Box<dyn FnOnce() + Send>;

/// Posts a closure onto a thread of the executor's choosing.
///
/// [`Promise`] uses this to deliver the [`Future::then`] callback. An executor
/// that runs tasks inline, appends them to a queue, or hands them to a
/// [`WorkerPool`][crate::WorkerPool] are all valid choices.
pub type Executor = Arc<dyn Fn(Task) + Send + Sync>;

type Delivery<R> = Box<dyn FnOnce(Option<R>) + Send>;
type CancelHook = Box<dyn FnOnce() + Send>;

struct Shared<R> {
    /// Cleared when the promise completes or dies.
    active: AtomicBool,
    /// Cleared when the future is cancelled or dropped.
    has_future: AtomicBool,
    on_finished: Mutex<Option<Delivery<R>>>,
}

impl<R> Shared<R> {
    fn new(active: bool) -> Arc<Self> {
        Arc::new(Shared {
            active: AtomicBool::new(active),
            has_future: AtomicBool::new(false),
            on_finished: Mutex::new(None),
        })
    }

    fn take_callback(&self) -> Option<Delivery<R>> {
        self.on_finished.lock().unwrap().take()
    }

    fn set_callback_if_empty(&self, cb: Delivery<R>) -> bool {
        let mut slot = self.on_finished.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(cb);
        true
    }
}

/// An error raised by [`Promise`] and [`Future`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncError {
    /// The promise or future no longer owns its shared state.
    NoState,
    /// [`Promise::finished`] was called on an already completed promise.
    AlreadyFinished,
    /// [`Future::then`] was called twice on the same future.
    CallbackAlreadySet,
    /// [`Promise::get_future`] was called twice on the same promise.
    FutureExists,
}

impl fmt::Display for AsyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AsyncError::NoState => "promise or future has no state",
            AsyncError::AlreadyFinished => "async task already finished",
            AsyncError::CallbackAlreadySet => "async callback already set",
            AsyncError::FutureExists => "future already exists",
        })
    }
}

impl Error for AsyncError {}

/// The producer endpoint of a one-shot result channel.
///
/// A [`Promise`] is completed exactly once with [`Promise::finished`], which
/// delivers the value to the paired [`Future`]'s callback via the executor the
/// promise was constructed with. Dropping an uncompleted promise delivers
/// [`None`] instead, so the consumer always learns the outcome.
pub struct Promise<R: 'static> {
    executor: Executor,
    state: Option<Arc<Shared<R>>>,
}

impl<R: Send + 'static> Promise<R> {
    /// Creates a new promise whose callback delivery is posted to `executor`.
    pub fn new(executor: Executor) -> Self {
        Promise {
            executor,
            state: Some(Shared::new(true)),
        }
    }

    /// Returns the [`Future`] paired with this promise.
    ///
    /// May be called at most once; a second call fails with
    /// [`AsyncError::FutureExists`].
    pub fn get_future(&mut self) -> Result<Future<R>, AsyncError> {
        self.make_future(None)
    }

    /// Like [`Promise::get_future`], but additionally registers a hook that
    /// [`Future::cancel`] will run exactly once.
    ///
    /// The hook gives producers a way to abort the underlying operation (stop
    /// a download, close a handle) when the consumer loses interest.
    pub fn get_future_with_canceller<F>(&mut self, hook: F) -> Result<Future<R>, AsyncError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.make_future(Some(Box::new(hook)))
    }

    fn make_future(&mut self, hook: Option<CancelHook>) -> Result<Future<R>, AsyncError> {
        let state = self.state.as_ref().ok_or(AsyncError::NoState)?;
        if state.has_future.load(Ordering::Acquire) {
            return Err(AsyncError::FutureExists);
        }
        state.has_future.store(true, Ordering::Release);
        Ok(Future {
            state: Some(state.clone()),
            cancel_hook: hook,
        })
    }

    /// Completes the promise with `value`.
    ///
    /// If a live future has installed a callback, a delivery closure is posted
    /// to the executor. The closure re-checks that the future still exists
    /// immediately before invoking, so a future dropped after scheduling but
    /// before delivery turns the delivery into a no-op.
    pub fn finished(&mut self, value: R) -> Result<(), AsyncError> {
        let state = self.state.as_ref().ok_or(AsyncError::NoState)?;
        if !state.active.swap(false, Ordering::AcqRel) {
            return Err(AsyncError::AlreadyFinished);
        }
        if state.has_future.load(Ordering::Acquire) {
            if let Some(cb) = state.take_callback() {
                let state = state.clone();
                (self.executor)(Box::new(move || {
                    if state.has_future.load(Ordering::Acquire) {
                        cb(Some(value));
                    }
                }));
            }
        }
        Ok(())
    }

    /// Returns whether the paired future has been cancelled or dropped.
    ///
    /// Producers should check this before starting expensive work; a cancelled
    /// promise has no observer left and its result would be discarded.
    pub fn is_cancelled(&self) -> bool {
        match &self.state {
            Some(state) => !state.has_future.load(Ordering::Acquire),
            None => true,
        }
    }

    /// Wraps this promise and a work function into a single task.
    ///
    /// When the task runs it first checks [`Promise::is_cancelled`]: a
    /// cancelled promise skips `f` entirely, so the work has no observable
    /// side effects once the consumer has walked away. Otherwise the result
    /// of `f` is fed into [`Promise::finished`].
    pub fn into_task<F>(self, f: F) -> impl FnOnce() + Send
    where
        F: FnOnce() -> R + Send + 'static,
    {
        let mut promise = self;
        move || {
            if !promise.is_cancelled() {
                promise.finished(f()).ok();
            }
        }
    }
}

impl<R> fmt::Debug for Promise<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("cancelled", &self.state.as_ref().map(|s| !s.has_future.load(Ordering::Acquire)))
            .finish_non_exhaustive()
    }
}

impl<R: 'static> Drop for Promise<R> {
    fn drop(&mut self) {
        // A dropped, still-active promise delivers `None` so the future's
        // callback learns that no result will ever arrive.
        let Some(state) = self.state.take() else {
            return;
        };
        if state.active.swap(false, Ordering::AcqRel) && state.has_future.load(Ordering::Acquire) {
            if let Some(cb) = state.take_callback() {
                let state = state.clone();
                (self.executor)(Box::new(move || {
                    if state.has_future.load(Ordering::Acquire) {
                        cb(None);
                    }
                }));
            }
        }
    }
}

/// The consumer endpoint of a one-shot result channel.
///
/// The future resolves to `Some(value)` when the promise completes, or `None`
/// when the promise dies prematurely. Both outcomes reach the callback passed
/// to [`Future::then`], on whichever thread the promise's executor chooses.
///
/// Dropping a future cancels it.
pub struct Future<R> {
    state: Option<Arc<Shared<R>>>,
    cancel_hook: Option<CancelHook>,
}

impl<R> Future<R> {
    /// Returns whether the operation behind this future is still in flight.
    pub fn is_active(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|state| state.active.load(Ordering::Acquire))
    }

    /// Cancels the future.
    ///
    /// Any later (or already scheduled) delivery is silently dropped, and the
    /// canceller hook registered via [`Promise::get_future_with_canceller`]
    /// runs once. Cancelling twice is a no-op.
    pub fn cancel(&mut self) {
        if let Some(state) = self.state.take() {
            state.has_future.store(false, Ordering::Release);
        }
        if let Some(hook) = self.cancel_hook.take() {
            hook();
        }
    }
}

impl<R: Send + 'static> Future<R> {
    /// Installs the delivery callback, consuming and returning the future for
    /// fluent chaining.
    ///
    /// Fails with [`AsyncError::CallbackAlreadySet`] if a callback was already
    /// installed, or [`AsyncError::NoState`] on a cancelled future. On error
    /// the future is dropped.
    pub fn then<F>(self, cb: F) -> Result<Future<R>, AsyncError>
    where
        F: FnOnce(Option<R>) + Send + 'static,
    {
        let state = self.state.as_ref().ok_or(AsyncError::NoState)?;
        if !state.set_callback_if_empty(Box::new(cb)) {
            return Err(AsyncError::CallbackAlreadySet);
        }
        Ok(self)
    }

    /// Combines two futures into one that completes when *both* have
    /// completed.
    ///
    /// Callbacks already installed on the inputs still fire in their own
    /// executors; the combined callback runs in the executor of whichever
    /// promise delivers second. Cancelling the combined future cancels both
    /// inputs and runs their canceller hooks.
    ///
    /// A future that already finished before combining contributes an
    /// immediately-satisfied half: combining two finished futures yields an
    /// inactive combined future that never delivers.
    ///
    /// # Panics
    ///
    /// Panics if either input has been cancelled.
    pub fn and<R2: Send + 'static>(mut self, mut rhs: Future<R2>) -> Future<()> {
        let lhs_state = self.state.take().expect("combining a cancelled future");
        let lhs_hook = self.cancel_hook.take();
        let rhs_state = rhs.state.take().expect("combining a cancelled future");
        let rhs_hook = rhs.cancel_hook.take();

        let combined = Shared::<()>::new(
            lhs_state.active.load(Ordering::Acquire) && rhs_state.active.load(Ordering::Acquire),
        );
        combined.has_future.store(true, Ordering::Release);

        chain_delivery(&lhs_state, &rhs_state, &combined, false);
        chain_delivery(&rhs_state, &lhs_state, &combined, false);

        Future {
            state: Some(combined),
            cancel_hook: Some(cancel_both(lhs_state, rhs_state, lhs_hook, rhs_hook)),
        }
    }

    /// Combines two futures into one that completes when *either* has
    /// completed; the first completion cancels the other input.
    ///
    /// The loser's task body and delivery are suppressed. The combined
    /// callback runs once, in the winner's executor.
    ///
    /// # Panics
    ///
    /// Panics if either input has been cancelled.
    pub fn or<R2: Send + 'static>(mut self, mut rhs: Future<R2>) -> Future<()> {
        let lhs_state = self.state.take().expect("combining a cancelled future");
        let lhs_hook = self.cancel_hook.take();
        let rhs_state = rhs.state.take().expect("combining a cancelled future");
        let rhs_hook = rhs.cancel_hook.take();

        let combined = Shared::<()>::new(
            lhs_state.active.load(Ordering::Acquire) && rhs_state.active.load(Ordering::Acquire),
        );
        combined.has_future.store(true, Ordering::Release);

        chain_delivery(&lhs_state, &rhs_state, &combined, true);
        chain_delivery(&rhs_state, &lhs_state, &combined, true);

        Future {
            state: Some(combined),
            cancel_hook: Some(cancel_both(lhs_state, rhs_state, lhs_hook, rhs_hook)),
        }
    }
}

/// Rewires `state`'s delivery so that, after the previously installed callback
/// (if any) has run, the combined future is completed according to the
/// combinator's rule.
///
/// With `exclusive` set (the any-of rule), the completing side first revokes
/// `other`'s future and always delivers the combined callback. Without it (the
/// all-of rule), the combined callback fires only once `other` is inactive
/// too.
fn chain_delivery<R1: 'static, R2: 'static>(
    state: &Arc<Shared<R1>>,
    other: &Arc<Shared<R2>>,
    combined: &Arc<Shared<()>>,
    exclusive: bool,
) {
    let mut slot = state.on_finished.lock().unwrap();
    let prev = slot.take();
    let other = other.clone();
    let combined = combined.clone();
    *slot = Some(Box::new(move |r: Option<R1>| {
        if exclusive {
            other.has_future.store(false, Ordering::Release);
        }
        if let Some(prev) = prev {
            prev(r);
        }
        if exclusive || !other.active.load(Ordering::Acquire) {
            combined.active.store(false, Ordering::Release);
            if combined.has_future.load(Ordering::Acquire) {
                if let Some(cb) = combined.take_callback() {
                    cb(Some(()));
                }
            }
        }
    }));
}

fn cancel_both<R1: 'static, R2: 'static>(
    lhs: Arc<Shared<R1>>,
    rhs: Arc<Shared<R2>>,
    lhs_hook: Option<CancelHook>,
    rhs_hook: Option<CancelHook>,
) -> CancelHook {
    Box::new(move || {
        lhs.has_future.store(false, Ordering::Release);
        rhs.has_future.store(false, Ordering::Release);
        if let Some(hook) = lhs_hook {
            hook();
        }
        if let Some(hook) = rhs_hook {
            hook();
        }
    })
}

impl<R> fmt::Debug for Future<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl<R> Drop for Future<R> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<R1: Send + 'static, R2: Send + 'static> BitAnd<Future<R2>> for Future<R1> {
    type Output = Future<()>;

    /// Shorthand for [`Future::and`]: `f1 & f2`.
    fn bitand(self, rhs: Future<R2>) -> Future<()> {
        self.and(rhs)
    }
}

impl<R1: Send + 'static, R2: Send + 'static> BitOr<Future<R2>> for Future<R1> {
    type Output = Future<()>;

    /// Shorthand for [`Future::or`]: `f1 | f2`.
    fn bitor(self, rhs: Future<R2>) -> Future<()> {
        self.or(rhs)
    }
}
