// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Dependency tracker: `wait`, `wait_for`, `wait_map`.
//!
//! A waiter counts the unfinished fibers it waits on (`dep_count`) and is
//! appended to each target's `reverse_deps`. The finish protocol walks
//! `reverse_deps` and re-admits a waiter to the ready set when its count
//! hits zero. Nothing here detects cycles or unreachable targets.

use std::rc::Rc;

use crate::error::SchedError;
use crate::fiber::{FiberHandle, FiberState};
use crate::worker::Worker;

impl Worker {
    /// Block the running context until every fiber in `targets` has
    /// finished.
    ///
    /// Called from the root, this returns early if nothing can run before
    /// the targets finish; the root's `dep_count` then stays above zero.
    pub fn wait(&self, targets: &[FiberHandle]) -> Result<(), SchedError> {
        self.wait_for(self.current(), targets)
    }

    /// Make `waiter` wait for `targets`.
    ///
    /// Only blocks the caller when `waiter` is the running context;
    /// otherwise it just takes `waiter` out of the ready set. Targets that
    /// already finished (or were reclaimed) are skipped, and a call with
    /// nothing left to wait on changes nothing. Repeating a target
    /// registers it again.
    pub fn wait_for(&self, waiter: FiberHandle, targets: &[FiberHandle]) -> Result<(), SchedError> {
        let waiter_id = self.resolve(waiter)?;
        let target_ids = targets
            .iter()
            .map(|t| self.resolve(*t))
            .collect::<Result<Vec<_>, _>>()?;

        let blocks_caller = {
            let mut state = self.inner.state.borrow_mut();
            if state.lookup(waiter_id).map_or(true, |w| w.is_finished()) {
                return Err(SchedError::WaiterFinished(waiter));
            }

            let mut added = 0;
            for target in target_ids {
                // Reclaimed targets finished long ago.
                let Some(target) = state.lookup_mut(target) else {
                    continue;
                };
                if target.is_finished() {
                    continue;
                }
                target.reverse_deps.push(waiter_id);
                added += 1;
            }
            if added == 0 {
                return Ok(());
            }

            let w = state.fiber_mut(waiter_id);
            w.dep_count += added;
            w.state = FiberState::Waiting;
            if !state.ready.remove(waiter_id) {
                // The running root, or a fiber already waiting. Kept as a
                // no-op; counted so repeated waits show up in stats.
                state.stats.absent_removals += 1;
                tracing::trace!(
                    worker = %self.id(),
                    waiter = %waiter_id,
                    "waiter was not in the ready set"
                );
            }
            state.current == waiter_id
        };

        if blocks_caller {
            self.yield_now(true);
        }
        Ok(())
    }

    /// Spawn one fiber per element of `args`, each running `body(arg)`,
    /// then wait for all of them. Returns their handles, in `args` order.
    ///
    /// If a spawn fails, fibers already spawned stay scheduled and the
    /// error is returned without waiting.
    #[track_caller]
    pub fn wait_map<A, F, I>(&self, body: F, args: I) -> Result<Vec<FiberHandle>, SchedError>
    where
        A: 'static,
        F: Fn(A) + 'static,
        I: IntoIterator<Item = A>,
    {
        let body = Rc::new(body);
        let handles = args
            .into_iter()
            .map(|arg| {
                let body = Rc::clone(&body);
                self.spawn(move || (*body)(arg))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.wait(&handles)?;
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::sync::Arc;

    use crate::config::SchedConfig;
    use crate::error::SchedError;
    use crate::fiber::{FiberOutcome, FiberState};
    use crate::worker::Worker;

    fn worker(seed: u64) -> Worker {
        Worker::builder()
            .config(Arc::new(SchedConfig::new()))
            .seed(seed)
            .build()
    }

    #[test]
    fn waiter_runs_after_its_dependency() {
        for seed in 0..16 {
            let w = worker(seed);
            let order = Rc::new(RefCell::new(Vec::new()));

            let o = order.clone();
            let b = w.spawn(move || o.borrow_mut().push("b")).unwrap();
            let (w2, o) = (w.clone(), order.clone());
            let a = w
                .spawn(move || {
                    w2.wait(&[b]).unwrap();
                    o.borrow_mut().push("a");
                })
                .unwrap();

            w.run();
            assert_eq!(*order.borrow(), vec!["b", "a"], "seed {}", seed);
            assert_eq!(w.state(a).unwrap(), FiberState::Finished);
        }
    }

    #[test]
    fn dep_count_drops_per_finished_target() {
        let w = worker(3);
        let seen = Rc::new(Cell::new(None));

        let a = w.spawn(|| {}).unwrap();
        let b = w.spawn(|| {}).unwrap();
        let (w2, s) = (w.clone(), seen.clone());
        let c = w
            .spawn(move || s.set(Some((w2.dep_count(a).unwrap(), w2.state(a).unwrap()))))
            .unwrap();

        w.wait_for(a, &[b, c]).unwrap();
        assert_eq!(w.dep_count(a).unwrap(), 2);
        assert_eq!(w.state(a).unwrap(), FiberState::Waiting);
        assert!(!w.is_ready(a).unwrap());

        // c waits on b as well, so b is the only fiber that can run first.
        w.wait_for(c, &[b]).unwrap();
        assert_eq!(w.ready_len(), 1);

        w.run();
        assert_eq!(seen.get(), Some((1, FiberState::Waiting)));
        assert_eq!(w.dep_count(a).unwrap(), 0);
        assert_eq!(w.state(a).unwrap(), FiberState::Finished);
    }

    #[test]
    fn wait_for_other_fiber_does_not_switch() {
        let w = worker(1);
        let a = w.spawn(|| {}).unwrap();
        let b = w.spawn(|| {}).unwrap();

        w.wait_for(a, &[b]).unwrap();
        assert_eq!(w.stats().switches, 0);
        assert_eq!(w.current(), w.root());
        w.run();
        assert!(w.is_finished(a).unwrap());
    }

    #[test]
    fn duplicate_targets_each_count() {
        let w = worker(5);
        let a = w.spawn(|| {}).unwrap();
        let b = w.spawn(|| {}).unwrap();
        w.wait_for(a, &[b, b]).unwrap();
        w.wait_for(a, &[b]).unwrap();
        assert_eq!(w.dep_count(a).unwrap(), 3);
        // Second registration found `a` already out of the ready set.
        assert_eq!(w.stats().absent_removals, 1);

        w.run();
        assert_eq!(w.dep_count(a).unwrap(), 0);
        assert!(w.is_finished(a).unwrap());
    }

    #[test]
    fn finished_targets_are_skipped() {
        let w = worker(2);
        let b = w.spawn(|| {}).unwrap();
        w.run();
        assert!(w.is_finished(b).unwrap());

        let switches = w.stats().switches;
        w.wait(&[b]).unwrap();
        assert_eq!(w.dep_count(w.root()).unwrap(), 0);
        assert_eq!(w.state(w.root()).unwrap(), FiberState::Running);
        assert_eq!(w.stats().switches, switches);
    }

    #[test]
    fn finished_waiter_is_an_error() {
        let w = worker(4);
        let a = w.spawn(|| {}).unwrap();
        let b = w.spawn(|| {}).unwrap();
        w.run();
        match w.wait_for(a, &[b]) {
            Err(SchedError::WaiterFinished(h)) => assert_eq!(h, a),
            other => panic!("expected WaiterFinished, got {:?}", other),
        }
    }

    #[test]
    fn root_wait_blocks_until_targets_finish() {
        let w = worker(9);
        let done = Rc::new(Cell::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (w2, d) = (w.clone(), done.clone());
                w.spawn(move || {
                    w2.yield_now(true);
                    d.set(d.get() + 1);
                })
                .unwrap()
            })
            .collect();

        w.wait(&handles).unwrap();
        assert_eq!(done.get(), 4);
        assert_eq!(w.dep_count(w.root()).unwrap(), 0);
        assert_eq!(w.current(), w.root());
    }

    #[test]
    fn panicking_target_still_releases_waiter() {
        let w = worker(11);
        let boom = w.spawn(|| panic!("target failed")).unwrap();
        w.wait(&[boom]).unwrap();
        assert_eq!(w.dep_count(w.root()).unwrap(), 0);
        assert!(matches!(
            w.outcome(boom).unwrap(),
            Some(FiberOutcome::Panicked(_))
        ));
    }

    #[test]
    fn blocked_fiber_with_nothing_ready_falls_back_to_root() {
        let w = worker(6);
        let root = w.root();
        let w2 = w.clone();
        let stuck = w.spawn(move || w2.wait(&[root]).unwrap()).unwrap();

        w.run();
        assert_eq!(w.current(), w.root());
        assert_eq!(w.state(stuck).unwrap(), FiberState::Waiting);
        assert_eq!(w.dep_count(stuck).unwrap(), 1);
        assert_eq!(w.ready_len(), 0);
    }

    #[test]
    fn root_resumed_by_fallback_stays_waiting() {
        let w = worker(12);
        let root = w.root();
        let w2 = w.clone();
        let a = w.spawn(move || w2.wait(&[root]).unwrap()).unwrap();

        // root waits on a, a waits on root: nothing can ever run.
        w.wait(&[a]).unwrap();
        assert_eq!(w.current(), root);
        assert_eq!(w.dep_count(root).unwrap(), 1);
        assert_eq!(w.state(root).unwrap(), FiberState::Waiting);
        assert_eq!(w.dep_count(a).unwrap(), 1);
        assert_eq!(w.state(a).unwrap(), FiberState::Waiting);
        assert_eq!(w.stats().switches, 2);
    }

    #[test]
    fn root_wait_with_nothing_ready_stays_waiting() {
        let w = worker(13);
        let root = w.root();
        let a = w.spawn(|| {}).unwrap();
        w.wait_for(a, &[root]).unwrap();
        assert_eq!(w.ready_len(), 0);

        w.wait(&[a]).unwrap();
        assert_eq!(w.stats().switches, 0);
        assert_eq!(w.dep_count(root).unwrap(), 1);
        assert_eq!(w.state(root).unwrap(), FiberState::Waiting);
    }

    #[test]
    fn reclaimed_targets_and_waiters() {
        let w = worker(14);
        let done = w.spawn(|| {}).unwrap();
        w.run();
        // Reclaims `done`'s slot.
        let next = w.spawn(|| {}).unwrap();

        w.wait(&[done]).unwrap();
        assert_eq!(w.dep_count(w.root()).unwrap(), 0);
        assert!(matches!(
            w.wait_for(done, &[next]),
            Err(SchedError::WaiterFinished(h)) if h == done
        ));
        w.run();
    }

    #[test]
    fn wait_map_spawns_one_fiber_per_arg() {
        let w = worker(8);
        let sum = Rc::new(Cell::new(0));
        let s = sum.clone();
        let w2 = w.clone();
        let handles = w
            .wait_map(
                move |n: u32| {
                    w2.yield_now(true);
                    s.set(s.get() + n);
                },
                1..=10,
            )
            .unwrap();

        assert_eq!(handles.len(), 10);
        assert_eq!(w.stats().spawned, 10);
        assert_eq!(sum.get(), 55);
        for h in handles {
            assert!(w.is_finished(h).unwrap());
        }
    }

    #[test]
    fn wait_map_with_no_args_returns_immediately() {
        let w = worker(10);
        let handles = w.wait_map(|_: u8| {}, Vec::new()).unwrap();
        assert!(handles.is_empty());
        assert_eq!(w.stats().switches, 0);
    }
}
