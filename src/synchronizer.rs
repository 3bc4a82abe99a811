//! Quorum guards over tracked callbacks.
//!
//! [`OnAllCompleted`] and [`OnAnyCompleted`] wrap a set of [`Callback`]s so
//! that a listener fires exactly once, after the declared quorum of callbacks
//! has run *and* the guard itself has been dropped (whichever happens last).
//!
//! The bookkeeping is intentionally not thread-safe: like the rest of the
//! callback subsystem it is `!Send`, and all tracked callbacks must run on the
//! same thread. The "guard still alive" condition is folded into the tracked
//! count as a bias of 10,000, so each quorum check is a single comparison.

use std::{
    cell::{Cell, RefCell},
    error::Error,
    fmt,
    rc::Rc,
};

use crate::callback::Callback;

/// Added to the tracked count while the guard is alive, subtracted on detach.
/// Also the maximum number of callbacks one synchronizer can track.
const GUARD_BIAS: u32 = 10_000;

struct SyncState {
    tracked: Cell<u32>,
    fired: Cell<u32>,
    listener: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl SyncState {
    fn new(listener: impl FnOnce() + 'static) -> Rc<Self> {
        Rc::new(SyncState {
            tracked: Cell::new(GUARD_BIAS),
            fired: Cell::new(0),
            listener: RefCell::new(Some(Box::new(listener))),
        })
    }

    /// Runs the listener. Taking it out of the slot makes a second firing
    /// structurally impossible.
    fn fire(&self) {
        // The borrow must end before the listener runs, in case the listener
        // touches the synchronizer again.
        let listener = self.listener.borrow_mut().take();
        if let Some(listener) = listener {
            listener();
        }
    }
}

/// The synchronizer was detached (or dropped) and can no longer track
/// callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detached;

impl fmt::Display for Detached {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("synchronizer was detached and can no longer track callbacks")
    }
}

impl Error for Detached {}

/// Rewires `cb` so that, after its own function, it performs `bookkeep` on
/// `state` exactly once, no matter how many times the callback is invoked.
fn wrap_tracked<A: 'static>(
    mut cb: Callback<A>,
    state: Rc<SyncState>,
    bookkeep: fn(&SyncState),
) -> Callback<A> {
    let prev = cb.func.take();
    let slot = Cell::new(Some(state));
    cb.func = Some(Rc::new(move |arg: A| {
        if let Some(prev) = &prev {
            prev(arg);
        }
        if let Some(state) = slot.take() {
            bookkeep(&state);
        }
    }));
    cb
}

/// Fires a listener once every tracked callback has run and the guard has
/// been dropped.
///
/// # Examples
///
/// ```
/// use std::{cell::Cell, rc::Rc};
/// use taskweave::{Canceller, OnAllCompleted};
///
/// let canceller = Canceller::new();
/// let all_done = Rc::new(Cell::new(false));
/// let done = all_done.clone();
///
/// let sync = OnAllCompleted::new(move || done.set(true));
/// let cb1 = sync.track(canceller.make_cb(|()| {})).unwrap();
/// let cb2 = sync.track(canceller.make_cb(|()| {})).unwrap();
/// drop(sync);
///
/// cb1.invoke(());
/// assert!(!all_done.get());
/// cb2.invoke(());
/// assert!(all_done.get());
/// ```
pub struct OnAllCompleted {
    state: Option<Rc<SyncState>>,
}

impl OnAllCompleted {
    /// Creates a guard that will run `listener` once all tracked callbacks
    /// have fired and the guard is gone.
    pub fn new(listener: impl FnOnce() + 'static) -> Self {
        OnAllCompleted {
            state: Some(SyncState::new(listener)),
        }
    }

    /// Adds `cb` to the tracked set, returning it with the bookkeeping wired
    /// in.
    pub fn track<A: 'static>(&self, cb: Callback<A>) -> Result<Callback<A>, Detached> {
        let state = self.state.as_ref().ok_or(Detached)?;
        state.tracked.set(state.tracked.get() + 1);
        Ok(wrap_tracked(cb, state.clone(), |state| {
            state.fired.set(state.fired.get() + 1);
            if state.fired.get() == state.tracked.get() {
                state.fire();
            }
        }))
    }

    /// Detaches the guard: the listener becomes eligible to fire as soon as
    /// every tracked callback has run (or fires right here if they already
    /// have). Called automatically on drop.
    pub fn detach(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        debug_assert!(state.tracked.get() >= GUARD_BIAS);
        state.tracked.set(state.tracked.get() - GUARD_BIAS);
        if state.fired.get() == state.tracked.get() {
            state.fire();
        }
    }
}

impl Drop for OnAllCompleted {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Fires a listener once any one tracked callback has run and the guard has
/// been dropped.
pub struct OnAnyCompleted {
    state: Option<Rc<SyncState>>,
}

impl OnAnyCompleted {
    /// Creates a guard that will run `listener` once any tracked callback has
    /// fired and the guard is gone.
    pub fn new(listener: impl FnOnce() + 'static) -> Self {
        OnAnyCompleted {
            state: Some(SyncState::new(listener)),
        }
    }

    /// Adds `cb` to the tracked set, returning it with the bookkeeping wired
    /// in.
    pub fn track<A: 'static>(&self, cb: Callback<A>) -> Result<Callback<A>, Detached> {
        let state = self.state.as_ref().ok_or(Detached)?;
        state.tracked.set(state.tracked.get() + 1);
        Ok(wrap_tracked(cb, state.clone(), |state| {
            state.fired.set(state.fired.get() + 1);
            if state.fired.get() == 1 && state.tracked.get() < GUARD_BIAS {
                state.fire();
            }
        }))
    }

    /// Detaches the guard: the listener fires right here if a tracked
    /// callback already ran, or on the first one that does. Called
    /// automatically on drop.
    pub fn detach(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        debug_assert!(state.tracked.get() >= GUARD_BIAS);
        state.tracked.set(state.tracked.get() - GUARD_BIAS);
        if state.fired.get() > 0 {
            state.fire();
        }
    }
}

impl Drop for OnAnyCompleted {
    fn drop(&mut self) {
        self.detach();
    }
}
