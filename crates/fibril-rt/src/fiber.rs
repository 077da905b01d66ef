// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber representation.
//!
//! A fiber is an execution context plus the bookkeeping the scheduler
//! and dependency tracker need: lifecycle state, how many fibers it is
//! still waiting on, and who is waiting on it.

use std::fmt;
use std::panic::Location;

use crate::context::{ExecContext, SuspendHandle};
use crate::worker::WorkerId;

/// Fiber lifecycle states.
///
/// `Ready → Running → Ready` on yield, `Running → Waiting` on wait,
/// `Waiting → Ready` once every dependency finished, and
/// `Running → Finished` when the body returns. Nothing leaves `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Eligible for selection.
    Ready,
    /// Executing on its worker. At most one per worker.
    Running,
    /// Blocked until `dep_count` drops to zero.
    Waiting,
    /// Body completed (normally or by panic).
    Finished,
}

/// How a finished fiber's body ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiberOutcome {
    Completed,
    /// Body panicked; carries the panic message.
    Panicked(String),
}

/// Identity of a fiber inside its worker: the slot holding its record
/// plus a spawn serial, so a handle outlives the reuse of its slot.
/// Serial 0 is the worker's root context (its native stack), which is
/// never spawned and never finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId {
    slot: usize,
    serial: u64,
}

impl FiberId {
    pub const ROOT: FiberId = FiberId { slot: 0, serial: 0 };

    pub(crate) fn new(slot: usize, serial: u64) -> Self {
        Self { slot, serial }
    }

    pub(crate) fn slot(self) -> usize {
        self.slot
    }

    /// Spawn order on this worker, starting at 1.
    pub fn serial(self) -> u64 {
        self.serial
    }

    pub fn is_root(self) -> bool {
        self.serial == 0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "root")
        } else {
            write!(f, "fiber#{}", self.serial)
        }
    }
}

/// Handle returned by `spawn`, usable as a `wait` target or waiter.
///
/// Cheap to copy. Only meaningful on the worker that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberHandle {
    pub(crate) worker: WorkerId,
    pub(crate) id: FiberId,
}

impl FiberHandle {
    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn is_root(&self) -> bool {
        self.id.is_root()
    }
}

impl fmt::Display for FiberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.worker, self.id)
    }
}

/// Scheduler-side record of one fiber.
#[derive(Debug)]
pub(crate) struct Fiber {
    /// Serial of the fiber occupying this slot.
    pub serial: u64,
    /// `None` for the root, while the context is being resumed, and
    /// after it finished (the stack is reclaimed then).
    pub context: Option<ExecContext>,
    /// Bound when the context first runs.
    pub suspender: Option<SuspendHandle>,
    pub state: FiberState,
    /// Unfinished fibers this one still waits on.
    pub dep_count: usize,
    /// Fibers waiting on this one. Only grows until finish drains it.
    pub reverse_deps: Vec<FiberId>,
    pub outcome: Option<FiberOutcome>,
    pub spawned_at: Option<&'static Location<'static>>,
}

impl Fiber {
    /// The worker's own stack, running from the start.
    pub fn root() -> Self {
        Self {
            serial: FiberId::ROOT.serial,
            context: None,
            suspender: None,
            state: FiberState::Running,
            dep_count: 0,
            reverse_deps: Vec::new(),
            outcome: None,
            spawned_at: None,
        }
    }

    pub fn spawned(
        serial: u64,
        context: ExecContext,
        spawned_at: &'static Location<'static>,
    ) -> Self {
        Self {
            serial,
            context: Some(context),
            suspender: None,
            state: FiberState::Ready,
            dep_count: 0,
            reverse_deps: Vec::new(),
            outcome: None,
            spawned_at: Some(spawned_at),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == FiberState::Finished
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
