// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-worker ready set.
//!
//! Unordered; selection is uniformly random so client code can't come
//! to depend on an interleaving. IndexSet gives O(1) insert, remove and
//! pick-by-position.

use indexmap::IndexSet;
use rand::Rng;

use crate::fiber::FiberId;

#[derive(Debug, Default)]
pub(crate) struct ReadySet {
    fibers: IndexSet<FiberId>,
}

impl ReadySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if already present.
    pub fn insert(&mut self, id: FiberId) -> bool {
        self.fibers.insert(id)
    }

    /// Returns false if `id` wasn't a member. Callers treat that as a
    /// no-op.
    pub fn remove(&mut self, id: FiberId) -> bool {
        self.fibers.swap_remove(&id)
    }

    pub fn contains(&self, id: FiberId) -> bool {
        self.fibers.contains(&id)
    }

    /// Uniform random member, or `None` when empty.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<FiberId> {
        if self.is_empty() {
            return None;
        }
        let at = rng.gen_range(0..self.fibers.len());
        self.fibers.get_index(at).copied()
    }

    /// Any member other than `id`?
    pub fn has_other_than(&self, id: FiberId) -> bool {
        self.fibers.len() > usize::from(self.contains(id))
    }

    pub fn len(&self) -> usize {
        self.fibers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fibers.is_empty()
    }
}
