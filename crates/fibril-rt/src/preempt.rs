// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Preemption controller.
//!
//! A timer thread raises the designated worker's interrupt flag once per
//! period. The flag is taken at safe points (`preempt_point`, `yield_now`,
//! `wait`), where it acts like an unforced yield. Code that never reaches
//! a safe point is never preempted.
//!
//! Only one worker per config may own the timer. Other workers
//! reschedule voluntarily only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::SchedError;
use crate::worker::{Worker, WorkerId};

/// Periodic interrupt source. Stops and joins its thread on drop.
#[derive(Debug)]
pub(crate) struct PreemptTimer {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PreemptTimer {
    pub fn start(
        interval: Duration,
        interrupt: Arc<AtomicBool>,
        worker: WorkerId,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let thread = thread::Builder::new()
            .name(format!("fibril-preempt-{}", worker.as_raw()))
            .spawn(move || tick_loop(interval, &interrupt, &stop_flag))?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for PreemptTimer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                tracing::warn!("preemption timer thread panicked");
            }
        }
    }
}

fn tick_loop(interval: Duration, interrupt: &AtomicBool, stop: &AtomicBool) {
    // `None`: the next tick is past what `Instant` can hold, so it never fires.
    let mut deadline = Instant::now().checked_add(interval);
    while !stop.load(Ordering::Acquire) {
        let now = Instant::now();
        match deadline {
            None => thread::park(),
            // Parks may end early (unpark on drop, or spuriously).
            Some(at) if now < at => thread::park_timeout(at - now),
            Some(at) => {
                interrupt.store(true, Ordering::Release);
                deadline = match at.checked_add(interval) {
                    // Fell behind; don't fire a burst to catch up.
                    Some(next) if next < now => now.checked_add(interval),
                    next => next,
                };
            }
        }
    }
}

impl Worker {
    /// Enable (`interval > 0`) or disable (`interval == 0`) timer
    /// preemption for this worker.
    ///
    /// Enabling also sets the time slice to `interval`. Disabling leaves
    /// the time slice alone. Fails with `PreemptionHeld` while another
    /// worker sharing the config owns the timer.
    pub fn set_preemptive(&self, interval: Duration) -> Result<(), SchedError> {
        let config = &self.inner.config;
        if interval.is_zero() {
            config.release_preemption(self.id())?;
            self.inner.preempt.borrow_mut().take();
            self.inner.interrupt.store(false, Ordering::Relaxed);
            return Ok(());
        }

        config.claim_preemption(self.id())?;
        config.set_time_slice(interval);
        let timer = match PreemptTimer::start(interval, self.inner.interrupt.clone(), self.id()) {
            Ok(timer) => timer,
            Err(e) => {
                // Keep the claim only if an earlier timer is still running.
                if !self.is_preemptive() {
                    let _ = config.release_preemption(self.id());
                }
                return Err(SchedError::TimerSpawn(e));
            }
        };
        // Replacing an earlier timer stops it.
        let previous = self.inner.preempt.borrow_mut().replace(timer);
        drop(previous);
        tracing::debug!(worker = %self.id(), ?interval, "preemption enabled");
        Ok(())
    }

    /// Whether this worker currently owns a preemption timer.
    pub fn is_preemptive(&self) -> bool {
        self.inner.preempt.borrow().is_some()
    }

    /// Safe point for timer preemption. Costs one atomic load unless an
    /// interrupt is pending, in which case it runs an unforced yield.
    ///
    /// Long-running fiber code should call this in its loops; it is the
    /// only place a busy fiber can be preempted.
    #[inline]
    pub fn preempt_point(&self) {
        if self.inner.interrupt.load(Ordering::Relaxed)
            && self.inner.interrupt.swap(false, Ordering::Acquire)
        {
            self.schedule(false);
        }
    }
}
