//! Cancellation-aware callbacks owned by a [`Canceller`].
//!
//! A [`Canceller`] hands out [`Callback`]s that silently stop running once the
//! canceller is dropped, and can additionally be cancelled one by one through
//! an opaque [`CallbackId`]. The whole subsystem is single-threaded: handles
//! are `!Send`, which makes "all callbacks run on the canceller's thread" a
//! compile-time fact instead of a usage rule.
//!
//! Per-callback cancellation state lives in a fixed array of one-byte flag
//! cells inside the canceller's token. The cell layout is
//!
//! ```text
//!  7 6 5     0
//! +-+-+-------+
//! |A|C| ID=6  |
//! +-+-+-------+
//! ```
//!
//! `A` — alive, a callback object currently holds this cell. `C` — cancelled.
//! `ID` — operation id, incremented each time the cell is claimed for a new
//! callback, so a stale [`CallbackId`] can be recognized after its cell has
//! been reused. The id wraps around after 64 reuses; to mitigate clashes, the
//! canceller clears the caller's stored id as soon as it observes the callback
//! to be inactive or cancelled.

use std::{
    cell::Cell,
    error::Error,
    fmt,
    rc::{Rc, Weak},
};

const MASK_ALIVE: u8 = 1 << 7;
const MASK_CANCELLED: u8 = 1 << 6;
const ID_BITS: u32 = 6;
const MASK_ID: u8 = (1 << ID_BITS) - 1;

/// Flag-cell indices must fit in the 26 bits of a [`CallbackId`] that are not
/// occupied by the operation id.
const MAX_CAPACITY: usize = 1 << (32 - ID_BITS);

/// An owned, run-once unit of work without a `Send` requirement.
///
/// This is what [`schedule`] posts to its executor; callbacks are
/// single-threaded, so the executor must run on the current thread.
pub type LocalTask = Box<dyn FnOnce()>;

/// Liveness witness shared between a [`Canceller`] and its callbacks.
///
/// Callbacks hold weak references; once the canceller (the only strong
/// reference) is gone, upgrading fails and every invocation turns into a
/// no-op.
struct Token {
    cells: Box<[Cell<u8>]>,
}

impl Token {
    fn new(capacity: usize) -> Rc<Self> {
        Rc::new(Token {
            cells: vec![Cell::new(0); capacity].into_boxed_slice(),
        })
    }
}

#[derive(Clone, Copy)]
struct FlagRef<'a>(&'a Cell<u8>);

impl FlagRef<'_> {
    fn is_alive(self) -> bool {
        self.0.get() & MASK_ALIVE != 0
    }

    fn is_cancelled(self) -> bool {
        self.0.get() & MASK_CANCELLED != 0
    }

    fn id(self) -> u8 {
        self.0.get() & MASK_ID
    }

    /// Claims the cell for a new operation: bumps the id, sets `A`, clears
    /// `C`.
    fn activate(self) {
        let id = (self.id() + 1) & MASK_ID;
        self.0.set(id | MASK_ALIVE);
    }

    fn deactivate(self) {
        self.0.set(self.0.get() & !MASK_ALIVE);
    }

    fn cancel(self) {
        self.0.set(self.0.get() | MASK_CANCELLED);
    }
}

/// An opaque handle identifying one registered callback.
///
/// The id can outlive the callback object; [`Canceller::is_active`] and
/// [`Canceller::cancel_callback`] recognize stale ids after the underlying
/// flag cell has been reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u32);

impl CallbackId {
    fn new(operation_id: u8, index: usize) -> Self {
        CallbackId(((index as u32) << ID_BITS) | u32::from(operation_id))
    }

    fn index(self) -> usize {
        (self.0 >> ID_BITS) as usize
    }

    fn operation_id(self) -> u8 {
        (self.0 & u32::from(MASK_ID)) as u8
    }
}

/// The number of concurrently alive id-carrying callbacks exceeded the
/// canceller's capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityExceeded;

impl fmt::Display for CapacityExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("number of live callbacks exceeds the canceller capacity")
    }
}

impl Error for CapacityExceeded {}

std::thread_local! {
    /// Token for [`Canceller::detached_cb`] callbacks. Owned by the thread
    /// itself, so these callbacks keep running after every canceller is gone.
    static DETACHED_TOKEN: Rc<Token> = Token::new(0);
}

/// A fixed-capacity registry of cancellation-aware callback slots.
///
/// Dropping the canceller disarms every callback created from it (except
/// [`detached`][Canceller::detached_cb] ones). Individual callbacks registered
/// with [`Canceller::make_cb_with_id`] can also be cancelled early through
/// their [`CallbackId`].
///
/// # Examples
///
/// ```
/// use taskweave::Canceller;
///
/// let canceller = Canceller::new();
/// let cb = canceller.make_cb(|n: i32| println!("got {n}"));
/// cb.invoke(1);
/// drop(canceller);
/// cb.invoke(2); // silently dropped
/// ```
pub struct Canceller {
    token: Rc<Token>,
    /// Rotating claim cursor; scanning starts after the most recently claimed
    /// cell.
    cursor: Cell<usize>,
}

impl Canceller {
    /// Creates a canceller with the default capacity of 128 simultaneous
    /// id-carrying callbacks.
    pub fn new() -> Self {
        Self::with_capacity(128)
    }

    /// Creates a canceller with room for `capacity` simultaneously alive
    /// id-carrying callbacks.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0 or does not fit in a [`CallbackId`] index.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity > 0 && capacity <= MAX_CAPACITY,
            "canceller capacity must be between 1 and {MAX_CAPACITY}",
        );
        Canceller {
            token: Token::new(capacity),
            cursor: Cell::new(0),
        }
    }

    /// Returns the number of flag cells, i.e. the maximum number of
    /// simultaneously alive callbacks created via
    /// [`Canceller::make_cb_with_id`].
    pub fn capacity(&self) -> usize {
        self.token.cells.len()
    }

    /// Creates a callback that runs `f` only while this canceller is alive.
    ///
    /// The callback does not occupy a flag cell and cannot be cancelled
    /// individually; use [`Canceller::make_cb_with_id`] for that.
    pub fn make_cb<A, F>(&self, f: F) -> Callback<A>
    where
        F: Fn(A) + 'static,
    {
        Callback {
            token: Rc::downgrade(&self.token),
            func: Some(Rc::new(f)),
            cell: None,
        }
    }

    /// Creates a callback occupying a flag cell, returning it together with
    /// the [`CallbackId`] that can later be passed to
    /// [`Canceller::cancel_callback`] and [`Canceller::is_active`].
    ///
    /// Fails with [`CapacityExceeded`] when all cells are taken by alive
    /// callbacks.
    pub fn make_cb_with_id<A, F>(&self, f: F) -> Result<(Callback<A>, CallbackId), CapacityExceeded>
    where
        F: Fn(A) + 'static,
    {
        let (cell, id) = self.claim_cell()?;
        Ok((
            Callback {
                token: Rc::downgrade(&self.token),
                func: Some(Rc::new(f)),
                cell: Some(cell),
            },
            id,
        ))
    }

    /// Creates a function-less callback occupying a flag cell.
    ///
    /// Invoking it does nothing, but its [`CallbackId`] tracks the callback
    /// object's lifetime through [`Canceller::is_active`], which makes it a
    /// pure liveness marker for an operation.
    pub fn make_idle_cb_with_id(&self) -> Result<(Callback<()>, CallbackId), CapacityExceeded> {
        let (cell, id) = self.claim_cell()?;
        Ok((
            Callback {
                token: Rc::downgrade(&self.token),
                func: None,
                cell: Some(cell),
            },
            id,
        ))
    }

    /// Cancels the callback identified by `id` and clears the stored id.
    ///
    /// If the flag cell has already been reused for a newer callback the call
    /// is a no-op. The id is cleared either way, to keep a stale handle from
    /// matching a future operation once the 6-bit operation id wraps around.
    pub fn cancel_callback(&self, id: &mut Option<CallbackId>) {
        let Some(cb_id) = id.take() else {
            return;
        };
        if let Some(cell) = self.token.cells.get(cb_id.index()) {
            let flag = FlagRef(cell);
            if flag.id() == cb_id.operation_id() {
                flag.cancel();
            }
        }
    }

    /// Returns whether the callback identified by `id` still exists and has
    /// not been cancelled.
    ///
    /// Clears the stored id when the answer is `false` (wrap-around
    /// mitigation, see the module docs).
    pub fn is_active(&self, id: &mut Option<CallbackId>) -> bool {
        let Some(cb_id) = *id else {
            return false;
        };
        let active = self.token.cells.get(cb_id.index()).is_some_and(|cell| {
            let flag = FlagRef(cell);
            flag.id() == cb_id.operation_id() && flag.is_alive() && !flag.is_cancelled()
        });
        if !active {
            *id = None;
        }
        active
    }

    /// Wraps `f` into a plain closure that runs only while this canceller is
    /// alive.
    ///
    /// Unlike [`Canceller::make_cb`] the result is an ordinary `Fn`, handy for
    /// APIs that take closures rather than [`Callback`]s. No flag cell is
    /// consumed.
    pub fn wrap<A, F>(&self, f: F) -> impl Fn(A)
    where
        F: Fn(A) + 'static,
    {
        let token = Rc::downgrade(&self.token);
        move |arg| {
            if token.upgrade().is_some() {
                f(arg);
            }
        }
    }

    /// Creates a callback that is *not* tied to this canceller's lifetime: it
    /// keeps running after the canceller (and every other canceller) is gone.
    pub fn detached_cb<A, F>(&self, f: F) -> Callback<A>
    where
        F: Fn(A) + 'static,
    {
        Callback {
            token: DETACHED_TOKEN.with(Rc::downgrade),
            func: Some(Rc::new(f)),
            cell: None,
        }
    }

    /// Creates an inert callback that never runs.
    pub fn no_cb(&self) -> Callback<()> {
        Callback {
            token: Weak::new(),
            func: None,
            cell: None,
        }
    }

    /// Disarms every callback created so far, as if the canceller had been
    /// dropped and recreated. All flag cells are recycled.
    pub fn invalidate_callbacks(&mut self) {
        self.token = Token::new(self.token.cells.len());
        self.cursor.set(0);
    }

    fn claim_cell(&self) -> Result<(usize, CallbackId), CapacityExceeded> {
        let cells = &self.token.cells;
        let mut at = self.cursor.get();
        for _ in 0..cells.len() {
            at = (at + 1) % cells.len();
            let flag = FlagRef(&cells[at]);
            if !flag.is_alive() {
                self.cursor.set(at);
                flag.activate();
                return Ok((at, CallbackId::new(flag.id(), at)));
            }
        }
        Err(CapacityExceeded)
    }
}

impl Default for Canceller {
    fn default() -> Self {
        Canceller::new()
    }
}

/// A cancellation-aware invocable handle created by a [`Canceller`].
///
/// Invocations are dropped silently once the owning canceller has died or the
/// callback has been cancelled; otherwise the wrapped function runs. Callbacks
/// are not one-shot: they can be invoked any number of times while alive (but
/// see [`Callback::invoke_once`]).
pub struct Callback<A = ()> {
    token: Weak<Token>,
    pub(crate) func: Option<Rc<dyn Fn(A)>>,
    cell: Option<usize>,
}

impl<A> Callback<A> {
    /// Returns whether invoking this callback would be a no-op because the
    /// canceller died or the callback was cancelled.
    pub fn cancelled(&self) -> bool {
        match self.token.upgrade() {
            Some(token) => self.flag(&token).is_some_and(FlagRef::is_cancelled),
            None => true,
        }
    }

    /// Invokes the wrapped function, unless cancelled.
    pub fn invoke(&self, arg: A) {
        let Some(func) = &self.func else {
            return;
        };
        let Some(token) = self.token.upgrade() else {
            return;
        };
        if !self.flag(&token).is_some_and(FlagRef::is_cancelled) {
            func(arg);
        }
    }

    /// Invokes the wrapped function, unless cancelled, and drops it so that
    /// any further invocation does nothing.
    pub fn invoke_once(&mut self, arg: A) {
        self.invoke(arg);
        self.func = None;
    }

    fn flag<'t>(&self, token: &'t Token) -> Option<FlagRef<'t>> {
        self.cell.map(|index| FlagRef(&token.cells[index]))
    }
}

impl<A> fmt::Debug for Callback<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("cancelled", &self.cancelled())
            .finish_non_exhaustive()
    }
}

impl<A> Drop for Callback<A> {
    fn drop(&mut self) {
        // Release the flag cell, making it claimable again. Skipped when the
        // canceller is already gone (the cell no longer exists).
        if let Some(token) = self.token.upgrade() {
            if let Some(flag) = self.flag(&token) {
                flag.deactivate();
            }
        }
    }
}

/// Posts `cb.invoke(arg)` to `executor` for deferred execution.
///
/// Cancellation is checked twice: a callback already cancelled at schedule
/// time is dropped without touching the executor, and the posted closure
/// re-checks when it eventually runs.
pub fn schedule<A, E>(executor: E, cb: Callback<A>, arg: A)
where
    E: FnOnce(LocalTask),
    A: 'static,
{
    if cb.cancelled() {
        return;
    }
    executor(Box::new(move || cb.invoke(arg)));
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    /// Executor that parks the posted task for manual execution.
    fn slot_executor() -> (impl Fn(LocalTask), Rc<RefCell<Option<LocalTask>>>) {
        let slot: Rc<RefCell<Option<LocalTask>>> = Rc::new(RefCell::new(None));
        let s = slot.clone();
        (move |task| *s.borrow_mut() = Some(task), slot)
    }

    #[test]
    fn callback_runs_while_canceller_is_alive() {
        let canceller = Canceller::new();
        let count = Rc::new(Cell::new(0));
        let count2 = count.clone();
        let cb = canceller.make_cb(move |()| count2.set(count2.get() + 1));

        assert!(!cb.cancelled());
        cb.invoke(());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn callback_does_not_run_if_invalidated() {
        let mut canceller = Canceller::new();
        let count = Rc::new(Cell::new(0));
        let count2 = count.clone();
        let cb = canceller.make_cb(move |()| count2.set(count2.get() + 1));

        canceller.invalidate_callbacks();
        assert!(cb.cancelled());
        cb.invoke(());
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn callback_does_not_run_if_canceller_is_dead() {
        let count = Rc::new(Cell::new(0));
        let count2 = count.clone();
        let cb = {
            let canceller = Canceller::new();
            canceller.make_cb(move |()| count2.set(count2.get() + 1))
        };
        assert!(cb.cancelled());
        cb.invoke(());
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn detached_callback_runs_if_canceller_is_dead() {
        let count = Rc::new(Cell::new(0));
        let count2 = count.clone();
        let cb = {
            let canceller = Canceller::new();
            canceller.detached_cb(move |()| count2.set(count2.get() + 1))
        };
        assert!(!cb.cancelled());
        cb.invoke(());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn is_active_shows_correct_state() {
        let canceller = Canceller::new();
        let (cb, id) = canceller.make_cb_with_id(|()| {}).unwrap();
        let mut id = Some(id);

        assert!(canceller.is_active(&mut id));
        cb.invoke(());
        assert!(canceller.is_active(&mut id));

        drop(cb);
        assert!(!canceller.is_active(&mut id));
        assert_eq!(id, None);
    }

    #[test]
    fn callback_can_be_cancelled_individually() {
        let canceller = Canceller::new();
        let count1 = Rc::new(Cell::new(0));
        let count1c = count1.clone();
        let count2 = Rc::new(Cell::new(0));
        let count2c = count2.clone();

        let (cb1, id1) = canceller
            .make_cb_with_id(move |()| count1c.set(count1c.get() + 1))
            .unwrap();
        let (cb2, id2) = canceller
            .make_cb_with_id(move |i: i32| count2c.set(count2c.get() + i))
            .unwrap();
        let mut id1 = Some(id1);
        let mut id2 = Some(id2);

        canceller.cancel_callback(&mut id1);

        cb1.invoke(());
        cb2.invoke(42);

        assert!(!canceller.is_active(&mut id1));
        assert!(canceller.is_active(&mut id2));

        assert_eq!(count1.get(), 0);
        assert_eq!(count2.get(), 42);
    }

    #[test]
    fn idle_callback_tracks_liveness() {
        let canceller = Canceller::new();
        let (cb, id) = canceller.make_idle_cb_with_id().unwrap();
        let mut id = Some(id);

        assert!(canceller.is_active(&mut id));
        cb.invoke(());
        assert!(canceller.is_active(&mut id));

        drop(cb);
        assert!(!canceller.is_active(&mut id));
    }

    #[test]
    fn no_cb_never_runs() {
        let canceller = Canceller::new();
        let cb = canceller.no_cb();
        assert!(cb.cancelled());
        cb.invoke(());
    }

    #[test]
    fn wrapped_closure_respects_canceller() {
        let mut canceller = Canceller::new();
        let count = Rc::new(Cell::new(0));
        let count2 = count.clone();
        let f = canceller.wrap(move |i: i32| count2.set(count2.get() + i));

        f(42);
        assert_eq!(count.get(), 42);

        canceller.invalidate_callbacks();
        f(3);
        assert_eq!(count.get(), 42);
    }

    #[test]
    fn invoke_once_drops_the_function() {
        let canceller = Canceller::new();
        let count = Rc::new(Cell::new(0));
        let count2 = count.clone();
        let mut cb = canceller.make_cb(move |()| count2.set(count2.get() + 1));

        cb.invoke_once(());
        assert_eq!(count.get(), 1);
        cb.invoke(());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn exceeding_capacity_fails_until_a_cell_is_released() {
        let canceller = Canceller::new();
        let mut cbs = Vec::new();
        let mut prev = None;
        for _ in 0..canceller.capacity() {
            let (cb, id) = canceller.make_cb_with_id(|()| {}).unwrap();
            assert_ne!(prev, Some(id));
            prev = Some(id);
            let mut id = Some(id);
            assert!(canceller.is_active(&mut id));
            cbs.push(cb);
        }

        assert_eq!(
            canceller.make_cb_with_id(|()| {}).unwrap_err(),
            CapacityExceeded
        );

        cbs.pop();
        assert!(canceller.make_cb_with_id(|()| {}).is_ok());
    }

    #[test]
    fn a_scheduled_callback_is_executed_lazily() {
        let canceller = Canceller::new();
        let (executor, slot) = slot_executor();

        let number = Rc::new(Cell::new(0));
        let number2 = number.clone();
        let (cb, id) = canceller
            .make_cb_with_id(move |i: i32| number2.set(number2.get() + i))
            .unwrap();
        let mut id = Some(id);

        assert!(slot.borrow().is_none());
        schedule(executor, cb, 42);
        assert!(slot.borrow().is_some());
        assert_eq!(number.get(), 0);
        assert!(canceller.is_active(&mut id));

        let task = slot.borrow_mut().take().unwrap();
        task();
        assert!(!canceller.is_active(&mut id));
        assert_eq!(number.get(), 42);
    }

    #[test]
    fn lazy_execution_of_callback_can_be_cancelled() {
        let mut canceller = Canceller::new();
        let (executor, slot) = slot_executor();

        let number = Rc::new(Cell::new(0));
        let number2 = number.clone();
        let (cb, id) = canceller
            .make_cb_with_id(move |i: i32| number2.set(number2.get() + i))
            .unwrap();
        let mut id = Some(id);

        schedule(executor, cb, 42);
        assert_eq!(number.get(), 0);
        assert!(canceller.is_active(&mut id));

        canceller.invalidate_callbacks();
        let task = slot.borrow_mut().take().unwrap();
        task();
        assert_eq!(number.get(), 0);
    }

    #[test]
    fn cancelled_callback_is_not_scheduled_at_all() {
        let canceller = Canceller::new();
        let (executor, slot) = slot_executor();

        let (cb, id) = canceller.make_cb_with_id(|()| {}).unwrap();
        let mut id = Some(id);
        canceller.cancel_callback(&mut id);

        schedule(executor, cb, ());
        assert!(slot.borrow().is_none());
    }

    #[test]
    fn released_cell_is_reused_with_a_fresh_id() {
        let canceller = Canceller::with_capacity(1);
        let (cb, first) = canceller.make_cb_with_id(|()| {}).unwrap();
        drop(cb);

        let (_cb, second) = canceller.make_cb_with_id(|()| {}).unwrap();
        assert_ne!(first, second);

        // The stale id no longer matches the reused cell.
        let mut stale = Some(first);
        assert!(!canceller.is_active(&mut stale));
        let mut fresh = Some(second);
        assert!(canceller.is_active(&mut fresh));
    }

    #[test]
    fn no_panic_when_destroying_canceller_from_callback() {
        let canceller = Rc::new(RefCell::new(Some(Canceller::new())));
        let canceller2 = canceller.clone();
        let cb = canceller
            .borrow()
            .as_ref()
            .unwrap()
            .make_cb(move |()| *canceller2.borrow_mut() = None);
        cb.invoke(());
        assert!(canceller.borrow().is_none());
    }
}
