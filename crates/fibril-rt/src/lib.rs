// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fibril runtime: a single-worker cooperative fiber scheduler.
//!
//! A [`Worker`] multiplexes stackful fibers onto one thread. Fibers give
//! up control only at explicit points, and the scheduler picks the next
//! one uniformly at random from the ready set, so client code can't rely
//! on an interleaving by accident.
//!
//! Components:
//! - context: stackful execution context (create, switch into, suspend)
//! - fiber: fiber record with state, dep_count, reverse_deps, outcome
//! - ready: per-worker ready set with random pick
//! - worker: scheduler state and core (spawn, yield_now, run)
//! - deps: wait / wait_for / wait_map
//! - preempt: periodic interrupt for one designated worker
//! - config: time slice, switch logging, preemption ownership
//!
//! ```no_run
//! use fibril_rt::Worker;
//!
//! let worker = Worker::new();
//! let w = worker.clone();
//! let producer = worker.spawn(|| println!("produce")).unwrap();
//! worker
//!     .spawn(move || {
//!         w.wait(&[producer]).unwrap();
//!         println!("consume");
//!     })
//!     .unwrap();
//! worker.run();
//! ```
//!
//! Not provided: parallelism inside a worker, cancellation, fairness or
//! priorities, deadlock detection. A fiber waiting on something that
//! never finishes stays `Waiting`, and it keeps its stack (and any worker
//! clone it captured) alive.

mod context;
mod deps;
mod fiber;
mod preempt;
mod ready;
mod worker;

pub mod config;
pub mod error;

pub use config::SchedConfig;
pub use context::DEFAULT_STACK_SIZE;
pub use error::SchedError;
pub use fiber::{FiberHandle, FiberId, FiberOutcome, FiberState};
pub use worker::{Worker, WorkerBuilder, WorkerId, WorkerStats};
