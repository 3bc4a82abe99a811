//! Primitives for composing cancellable asynchronous work on plain OS threads.
//!
//! (if you're looking for cooperative `async`/`await` concurrency, you're
//! probably better served by an `async` runtime; this library is for programs
//! that run a moderate number of blocking or compute-heavy tasks on real
//! threads and need precise control over cancellation)
//!
//! # Overview
//!
//! This library features four tightly related subsystems:
//!
//! - [`Promise`] and [`Future`], a one-shot result channel whose completion
//!   callback is delivered through an injected [`Executor`], with explicit
//!   cancellation and all-of/any-of combinators ([`Future::and`],
//!   [`Future::or`]).
//! - [`Canceller`] and [`Callback`], lightweight cancellation-aware callback
//!   handles: invocations are silently dropped once the canceller is gone,
//!   and individual callbacks can be revoked through an opaque
//!   [`CallbackId`].
//! - [`Worker`], a single owned thread draining a delay-ordered task queue,
//!   and [`WorkerPool`], an elastic executor that grows under load and
//!   shrinks when idle, with timer-driven delayed execution.
//! - [`OnAllCompleted`] and [`OnAnyCompleted`], quorum guards that fire a
//!   listener once a tracked set of callbacks has completed.
//!
//! # Promises and cancellation
//!
//! A producer creates a [`Promise`] bound to an executor and hands the paired
//! [`Future`] to the consumer. [`Promise::into_task`] packages the promise
//! together with the work itself, so that cancelling the future before the
//! task has run skips the work entirely:
//!
//! ```
//! use std::sync::Arc;
//! use taskweave::{Executor, Promise};
//!
//! // An executor decides where delivery callbacks run; this one runs them
//! // inline.
//! let executor: Executor = Arc::new(|task| task());
//!
//! let mut promise = Promise::new(executor);
//! let future = promise.get_future().unwrap();
//! let _future = future.then(|result| assert_eq!(result, Some(42))).unwrap();
//! promise.finished(42).unwrap();
//! ```
//!
//! # Running work on a pool
//!
//! A [`WorkerPool`] doubles as a promise executor, so the whole pipeline of
//! "run the task somewhere, deliver the result somewhere" stays on pool
//! threads:
//!
//! ```
//! use std::sync::Arc;
//! use taskweave::{Executor, PoolConfig, Promise, WorkerPool};
//!
//! let logger = Arc::new(|line: String| eprintln!("{line}"));
//! let pool = Arc::new(WorkerPool::new(PoolConfig::default(), logger).unwrap());
//!
//! let executor: Executor = {
//!     let pool = pool.clone();
//!     Arc::new(move |task| pool.execute(task))
//! };
//!
//! let mut promise = Promise::new(executor);
//! let future = promise.get_future().unwrap();
//!
//! let (tx, rx) = crossbeam_channel::bounded(1);
//! let _future = future.then(move |r| tx.send(r).unwrap()).unwrap();
//!
//! pool.execute(promise.into_task(|| 6 * 7));
//! assert_eq!(rx.recv().unwrap(), Some(42));
//! ```
//!
//! # Cancellable callbacks
//!
//! [`Canceller`] ties a set of callbacks to the lifetime of their owner,
//! which makes "this object registered callbacks all over the place and then
//! died" a non-event instead of a use-after-free:
//!
//! ```
//! use taskweave::Canceller;
//!
//! let canceller = Canceller::new();
//! let cb = canceller.make_cb(|n: u32| println!("progress: {n}%"));
//! cb.invoke(50);
//! drop(canceller);
//! cb.invoke(100); // silently dropped
//! ```
//!
//! Callback handles are single-threaded by design (`!Send`); futures and the
//! worker pool are thread-safe.

mod callback;
mod future;
mod pool;
mod synchronizer;
mod worker;

pub use callback::*;
pub use future::*;
pub use pool::*;
pub use synchronizer::*;
pub use worker::*;
