// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Worker scheduler state and the scheduling core.
//!
//! A `Worker` multiplexes fibers onto the thread that created it. Only
//! one context runs at a time: either a spawned fiber or the worker's
//! root (the thread's own stack). Switches happen only when the running
//! context calls into the worker (`yield_now`, `wait`, a preemption
//! safe point) or when a fiber body returns.
//!
//! Fiber-to-fiber switches are trampolined: the running fiber suspends
//! naming its successor and the root resumes it. If nothing is ready
//! when a fiber finishes or blocks, control falls back to the root.
//!
//! The worker is `!Send`. Fiber bodies reach it by capturing a clone.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe, Location};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::SeedableRng;
use slab::Slab;

use crate::config::SchedConfig;
use crate::context::{ExecContext, Resumed, SuspendHandle, Transfer, DEFAULT_STACK_SIZE};
use crate::error::SchedError;
use crate::fiber::{panic_message, Fiber, FiberHandle, FiberId, FiberOutcome, FiberState};
use crate::preempt::PreemptTimer;
use crate::ready::ReadySet;

/// Process-unique worker identity, used in handles and switch logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Counters for one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub spawned: u64,
    pub finished: u64,
    /// Actual context switches, including falls back to the root.
    pub switches: u64,
    /// `wait` calls whose waiter wasn't in the ready set.
    pub absent_removals: u64,
}

thread_local! {
    /// Fiber whose stack this thread is executing on, if any.
    static ON_STACK: Cell<Option<(WorkerId, FiberId)>> = const { Cell::new(None) };
}

/// Builder for [`Worker`].
#[derive(Debug, Clone)]
pub struct WorkerBuilder {
    config: Option<Arc<SchedConfig>>,
    seed: Option<u64>,
    stack_size: usize,
}

impl WorkerBuilder {
    /// Share `config` instead of the process-wide one.
    pub fn config(mut self, config: Arc<SchedConfig>) -> Self {
        self.config = Some(config);
        self
    }

    /// Fix the selection sequence. Unseeded workers draw from entropy.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn build(self) -> Worker {
        let rng = match self.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        let mut fibers = Slab::new();
        fibers.insert(Fiber::root());
        let inner = WorkerInner {
            id: WorkerId::next(),
            thread_name: std::thread::current().name().map(str::to_owned),
            config: self.config.unwrap_or_else(SchedConfig::global),
            stack_size: self.stack_size,
            state: RefCell::new(WorkerState {
                fibers,
                retired: Vec::new(),
                ready: ReadySet::new(),
                current: FiberId::ROOT,
                last_switch: None,
                rng,
                stats: WorkerStats::default(),
            }),
            interrupt: Arc::new(AtomicBool::new(false)),
            preempt: RefCell::new(None),
        };
        Worker {
            inner: Rc::new(inner),
        }
    }
}

/// Handle to one worker's scheduler state. Clones share the state.
#[derive(Clone)]
pub struct Worker {
    pub(crate) inner: Rc<WorkerInner>,
}

pub(crate) struct WorkerInner {
    pub id: WorkerId,
    pub thread_name: Option<String>,
    pub config: Arc<SchedConfig>,
    pub stack_size: usize,
    pub state: RefCell<WorkerState>,
    /// Raised by the preemption timer, consumed at safe points.
    pub interrupt: Arc<AtomicBool>,
    pub preempt: RefCell<Option<PreemptTimer>>,
}

impl Drop for WorkerInner {
    fn drop(&mut self) {
        if self.preempt.get_mut().take().is_some() {
            let _ = self.config.release_preemption(self.id);
        }
    }
}

pub(crate) struct WorkerState {
    /// Keyed by `FiberId::slot`. Slot 0 is the root.
    pub fibers: Slab<Fiber>,
    /// Finished fibers whose slots are freed on the next spawn. Until
    /// then their outcome stays readable.
    pub retired: Vec<FiberId>,
    pub ready: ReadySet,
    pub current: FiberId,
    pub last_switch: Option<Instant>,
    pub rng: SmallRng,
    pub stats: WorkerStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Switch {
    from: FiberId,
    to: FiberId,
}

impl WorkerState {
    /// Record of a fiber known to be live: the current one, a ready-set
    /// member, or a waiter still counting dependencies.
    pub fn fiber(&self, id: FiberId) -> &Fiber {
        debug_assert_eq!(self.fibers[id.slot()].serial, id.serial(), "stale {}", id);
        &self.fibers[id.slot()]
    }

    pub fn fiber_mut(&mut self, id: FiberId) -> &mut Fiber {
        debug_assert_eq!(self.fibers[id.slot()].serial, id.serial(), "stale {}", id);
        &mut self.fibers[id.slot()]
    }

    /// `None` once the fiber's slot was reclaimed.
    pub fn lookup(&self, id: FiberId) -> Option<&Fiber> {
        self.fibers.get(id.slot()).filter(|f| f.serial == id.serial())
    }

    pub fn lookup_mut(&mut self, id: FiberId) -> Option<&mut Fiber> {
        self.fibers.get_mut(id.slot()).filter(|f| f.serial == id.serial())
    }

    /// Free the slots of fibers retired since the last spawn.
    fn reclaim(&mut self) {
        for id in self.retired.drain(..) {
            if self.fibers.get(id.slot()).is_some_and(|f| f.serial == id.serial()) {
                self.fibers.remove(id.slot());
            }
        }
    }

    fn within_slice(&self, slice: Duration) -> bool {
        self.last_switch.is_some_and(|at| at.elapsed() < slice)
    }

    /// Finish protocol: leave the ready set for good and release every
    /// waiter registered on `id`.
    fn retire(&mut self, id: FiberId) {
        self.ready.remove(id);
        let fiber = self.fiber_mut(id);
        debug_assert!(!fiber.is_finished(), "{} finished twice", id);
        fiber.state = FiberState::Finished;
        fiber.suspender = None;
        let waiters = std::mem::take(&mut fiber.reverse_deps);
        self.stats.finished += 1;
        self.retired.push(id);

        for waiter in waiters {
            let Some(w) = self.lookup_mut(waiter) else {
                continue;
            };
            if w.is_finished() || w.dep_count == 0 {
                continue;
            }
            w.dep_count -= 1;
            if w.dep_count == 0 {
                if w.state == FiberState::Waiting {
                    w.state = FiberState::Ready;
                }
                self.ready.insert(waiter);
            }
        }
    }

    /// Pick the next context. `None` means the current one keeps
    /// running.
    fn choose(&mut self) -> Option<Switch> {
        let from = self.current;
        let to = match self.ready.pick(&mut self.rng) {
            Some(to) if to == from => return None,
            Some(to) => to,
            None if from.is_root() || self.fiber(from).state == FiberState::Running => {
                return None
            }
            // A finished or blocked fiber can't continue; the root can.
            None => FiberId::ROOT,
        };
        Some(Switch { from, to })
    }

    fn begin_switch(&mut self, switch: Switch) {
        let from = self.fiber_mut(switch.from);
        if from.state == FiberState::Running {
            from.state = FiberState::Ready;
        }
        let to = self.fiber_mut(switch.to);
        // A root resumed by the fallback while waiting keeps `Waiting`
        // until its dependencies finish.
        if to.state != FiberState::Waiting {
            to.state = FiberState::Running;
        }
        self.current = switch.to;
        self.last_switch = Some(Instant::now());
        self.stats.switches += 1;
    }
}

impl Worker {
    /// Worker on the current thread using the process-wide config.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> WorkerBuilder {
        WorkerBuilder {
            config: None,
            seed: None,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.inner.id
    }

    pub fn config(&self) -> &Arc<SchedConfig> {
        &self.inner.config
    }

    /// Create a fiber running `body` and make it ready.
    ///
    /// The fiber always runs its finish protocol when `body` ends, even
    /// by panic, so anything waiting on it is released. A panic is
    /// recorded as [`FiberOutcome::Panicked`] and does not propagate.
    #[track_caller]
    pub fn spawn<F>(&self, body: F) -> Result<FiberHandle, SchedError>
    where
        F: FnOnce() + 'static,
    {
        let spawned_at = Location::caller();
        let id = {
            let mut state = self.inner.state.borrow_mut();
            state.reclaim();
            FiberId::new(state.fibers.vacant_key(), state.stats.spawned + 1)
        };
        let worker = Rc::downgrade(&self.inner);
        let stack_size = self.inner.stack_size;

        let context = ExecContext::new(stack_size, move |suspender| {
            fiber_main(worker, id, suspender, body)
        })
        .map_err(|source| SchedError::StackAlloc {
            size: stack_size,
            source,
        })?;

        {
            let mut state = self.inner.state.borrow_mut();
            let slot = state.fibers.insert(Fiber::spawned(id.serial(), context, spawned_at));
            debug_assert_eq!(slot, id.slot());
            state.ready.insert(id);
            state.stats.spawned += 1;
        }
        tracing::trace!(worker = %self.inner.id, fiber = %id, at = %spawned_at, "spawned");
        Ok(self.handle(id))
    }

    /// Offer to switch to a random ready fiber.
    ///
    /// Unforced calls are ignored until a time slice has passed since
    /// the last switch on this worker.
    pub fn yield_now(&self, force: bool) {
        self.inner.interrupt.store(false, Ordering::Relaxed);
        self.schedule(force);
    }

    /// Keep yielding until no context other than the caller is ready.
    /// Called from the root, this drives every runnable fiber.
    pub fn run(&self) {
        loop {
            let runnable = {
                let state = self.inner.state.borrow();
                state.ready.has_other_than(state.current)
            };
            if !runnable {
                break;
            }
            self.yield_now(true);
        }
    }

    pub(crate) fn schedule(&self, force: bool) {
        self.check_on_current_stack();
        if let Some(switch) = self.select(force, None) {
            self.transfer(switch);
        }
    }

    /// Throttle, pick, record. On `Some`, the bookkeeping for the switch
    /// is already done and the caller must perform it.
    fn select(&self, force: bool, finishing: Option<FiberId>) -> Option<Switch> {
        let switch = {
            let mut state = self.inner.state.borrow_mut();
            if let Some(id) = finishing {
                state.retire(id);
            } else if !force && state.within_slice(self.inner.config.time_slice()) {
                return None;
            }
            let switch = state.choose()?;
            state.begin_switch(switch);
            switch
        };
        if self.inner.config.log_enabled() {
            tracing::debug!(
                target: "fibril_rt::switch",
                worker = %self.inner.id,
                thread = self.inner.thread_name.as_deref().unwrap_or("<unnamed>"),
                from = %switch.from,
                to = %switch.to,
                "switch"
            );
        }
        Some(switch)
    }

    fn transfer(&self, switch: Switch) {
        if switch.from.is_root() {
            self.drive(switch.to);
            return;
        }
        let suspender = self.inner.state.borrow().fiber(switch.from).suspender;
        let Some(suspender) = suspender else {
            unreachable!("running {} has no suspender bound", switch.from);
        };
        // SAFETY: `check_on_current_stack` established that this thread
        // is executing on `switch.from`'s stack.
        unsafe { suspender.suspend(Transfer::from(switch.to)) };
    }

    /// Root-side trampoline: resume fibers until one hands control back
    /// to the root.
    fn drive(&self, first: FiberId) {
        let mut next = Transfer::Fiber(first);
        while let Transfer::Fiber(id) = next {
            let context = self.inner.state.borrow_mut().fiber_mut(id).context.take();
            let Some(mut context) = context else {
                unreachable!("{} selected without a resumable context", id);
            };

            let outer = ON_STACK.replace(Some((self.inner.id, id)));
            let resumed = context.switch_into();
            ON_STACK.set(outer);

            next = match resumed {
                Resumed::Suspended(to) => {
                    self.inner.state.borrow_mut().fiber_mut(id).context = Some(context);
                    to
                }
                Resumed::Returned(to) => {
                    drop(context);
                    to
                }
            };
        }
    }

    /// Suspending from any stack other than the running fiber's would
    /// resume the wrong coroutine.
    fn check_on_current_stack(&self) {
        let current = self.inner.state.borrow().current;
        if !current.is_root() && ON_STACK.get() != Some((self.inner.id, current)) {
            panic!(
                "{} scheduled from outside its running fiber {}; \
                 call the worker only from its own fibers or root",
                self.inner.id, current
            );
        }
    }

    /// Runs on the finishing fiber's stack after its body returned.
    fn finish(&self, id: FiberId, outcome: FiberOutcome) -> Transfer {
        if let FiberOutcome::Panicked(msg) = &outcome {
            let spawned_at = self.inner.state.borrow().fiber(id).spawned_at;
            tracing::error!(
                worker = %self.inner.id,
                fiber = %id,
                spawned_at = ?spawned_at,
                panic = %msg,
                "fiber panicked; releasing its waiters"
            );
        } else {
            tracing::trace!(worker = %self.inner.id, fiber = %id, "finished");
        }
        self.inner.state.borrow_mut().fiber_mut(id).outcome = Some(outcome);
        match self.select(false, Some(id)) {
            Some(switch) => Transfer::from(switch.to),
            None => Transfer::Root,
        }
    }

    pub(crate) fn handle(&self, id: FiberId) -> FiberHandle {
        FiberHandle {
            worker: self.inner.id,
            id,
        }
    }

    pub(crate) fn resolve(&self, handle: FiberHandle) -> Result<FiberId, SchedError> {
        if handle.worker != self.inner.id {
            return Err(SchedError::ForeignFiber {
                handle,
                owner: handle.worker,
                worker: self.inner.id,
            });
        }
        Ok(handle.id)
    }

    /// The context that is running right now.
    pub fn current(&self) -> FiberHandle {
        self.handle(self.inner.state.borrow().current)
    }

    /// This worker's native stack, as a waiter.
    pub fn root(&self) -> FiberHandle {
        self.handle(FiberId::ROOT)
    }

    /// Lifecycle state. A root that was switched away from without
    /// waiting reports `Ready` even though it isn't in the ready set.
    /// Reclaimed fibers report `Finished`.
    pub fn state(&self, fiber: FiberHandle) -> Result<FiberState, SchedError> {
        let id = self.resolve(fiber)?;
        let state = self.inner.state.borrow();
        Ok(state.lookup(id).map_or(FiberState::Finished, |f| f.state))
    }

    pub fn dep_count(&self, fiber: FiberHandle) -> Result<usize, SchedError> {
        let id = self.resolve(fiber)?;
        let state = self.inner.state.borrow();
        Ok(state.lookup(id).map_or(0, |f| f.dep_count))
    }

    /// `None` until the fiber finished. The outcome is kept until the
    /// next `spawn` on this worker reclaims the fiber's slot; after that
    /// this returns [`SchedError::Reclaimed`].
    pub fn outcome(&self, fiber: FiberHandle) -> Result<Option<FiberOutcome>, SchedError> {
        let id = self.resolve(fiber)?;
        let state = self.inner.state.borrow();
        match state.lookup(id) {
            Some(f) => Ok(f.outcome.clone()),
            None => Err(SchedError::Reclaimed(fiber)),
        }
    }

    pub fn is_finished(&self, fiber: FiberHandle) -> Result<bool, SchedError> {
        Ok(self.state(fiber)? == FiberState::Finished)
    }

    /// Ready-set membership (the running fiber counts as a member).
    pub fn is_ready(&self, fiber: FiberHandle) -> Result<bool, SchedError> {
        let id = self.resolve(fiber)?;
        Ok(self.inner.state.borrow().ready.contains(id))
    }

    pub fn ready_len(&self) -> usize {
        self.inner.state.borrow().ready.len()
    }

    pub fn stats(&self) -> WorkerStats {
        self.inner.state.borrow().stats
    }

    pub fn last_switch(&self) -> Option<Instant> {
        self.inner.state.borrow().last_switch
    }

    pub fn time_slice(&self) -> Duration {
        self.inner.config.time_slice()
    }

    /// Shorthand for `config().set_time_slice`; affects every worker
    /// sharing the config.
    pub fn set_time_slice(&self, slice: Duration) {
        self.inner.config.set_time_slice(slice);
    }

    /// Shorthand for `config().set_logging`.
    pub fn set_logging(&self, enabled: bool) {
        self.inner.config.set_logging(enabled);
    }
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Worker")
            .field("id", &self.inner.id)
            .field("current", &state.current)
            .field("ready", &state.ready.len())
            .field("fibers", &state.fibers.len())
            .field("stats", &state.stats)
            .finish()
    }
}

/// Body of every fiber context: bind the suspender, run the user body,
/// then the finish protocol, whatever the body did.
fn fiber_main<F>(
    worker: Weak<WorkerInner>,
    id: FiberId,
    suspender: SuspendHandle,
    body: F,
) -> Transfer
where
    F: FnOnce(),
{
    match worker.upgrade() {
        Some(inner) => {
            inner.state.borrow_mut().fiber_mut(id).suspender = Some(suspender);
        }
        None => return Transfer::Root,
    }

    let outcome = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(()) => FiberOutcome::Completed,
        Err(payload) => {
            // Worker gone: this is the coroutine being unwound on drop.
            if worker.strong_count() == 0 {
                panic::resume_unwind(payload);
            }
            FiberOutcome::Panicked(panic_message(&*payload))
        }
    };

    match worker.upgrade() {
        Some(inner) => Worker { inner }.finish(id, outcome),
        None => Transfer::Root,
    }
}
