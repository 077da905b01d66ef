// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler errors.
//!
//! Only API misuse and resource failures surface here. Bookkeeping
//! no-ops (removing a fiber that isn't in the ready set) are swallowed,
//! and a panicking fiber body is recorded on the fiber, not returned.

use crate::fiber::FiberHandle;
use crate::worker::WorkerId;

/// Errors returned by [`Worker`](crate::Worker) operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    #[error("{handle} belongs to {owner}, not {worker}; fibers cannot move between workers")]
    ForeignFiber {
        handle: FiberHandle,
        owner: WorkerId,
        worker: WorkerId,
    },

    #[error("{0} already finished and cannot wait on anything")]
    WaiterFinished(FiberHandle),

    #[error("{0} was reclaimed by a later spawn; its outcome is no longer kept")]
    Reclaimed(FiberHandle),

    #[error("failed to allocate a {size}-byte fiber stack: {source}")]
    StackAlloc {
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("preemption is held by {owner}; disable it there before enabling it on {requested}")]
    PreemptionHeld {
        owner: WorkerId,
        requested: WorkerId,
    },

    #[error("failed to start the preemption timer thread: {0}")]
    TimerSpawn(#[source] std::io::Error),
}
