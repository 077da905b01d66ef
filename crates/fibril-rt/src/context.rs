// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Execution context primitive.
//!
//! A suspendable unit of execution with its own stack: create it from a
//! body, switch into it, and get control back when it suspends or
//! returns. Backed by corosensei stackful coroutines. The scheduler
//! relies on nothing beyond "switching in resumes where it last
//! suspended".
//!
//! Coroutines are asymmetric, so fiber-to-fiber switches go through the
//! worker's root context: a fiber suspends naming the next context
//! ([`Transfer`]) and the root resumes it.

use std::ptr::NonNull;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::fiber::FiberId;

/// Default fiber stack size. Pages are committed lazily by the OS.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Where control goes when a context suspends or returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transfer {
    /// Back to the worker's native stack.
    Root,
    /// Into another fiber's context.
    Fiber(FiberId),
}

impl From<FiberId> for Transfer {
    fn from(id: FiberId) -> Self {
        if id.is_root() {
            Transfer::Root
        } else {
            Transfer::Fiber(id)
        }
    }
}

/// Outcome of one `switch_into`.
#[derive(Debug)]
pub(crate) enum Resumed {
    /// Suspended and asked for a transfer. Context stays resumable.
    Suspended(Transfer),
    /// Body returned. Context is spent.
    Returned(Transfer),
}

type Suspender = Yielder<(), Transfer>;

pub(crate) struct ExecContext {
    coroutine: Coroutine<(), Transfer, Transfer, DefaultStack>,
}

impl ExecContext {
    /// Allocate a stack and wrap `body`. Nothing runs until the first
    /// [`switch_into`](Self::switch_into).
    pub fn new<F>(stack_size: usize, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(SuspendHandle) -> Transfer + 'static,
    {
        let stack = DefaultStack::new(stack_size)?;
        let coroutine = Coroutine::with_stack(stack, move |suspender: &Suspender, ()| {
            body(SuspendHandle::new(suspender))
        });
        Ok(Self { coroutine })
    }

    /// Run the context until it suspends or returns.
    pub fn switch_into(&mut self) -> Resumed {
        match self.coroutine.resume(()) {
            CoroutineResult::Yield(to) => Resumed::Suspended(to),
            CoroutineResult::Return(to) => Resumed::Returned(to),
        }
    }
}

impl std::fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecContext")
            .field("started", &self.coroutine.started())
            .field("done", &self.coroutine.done())
            .finish()
    }
}

/// Suspend capability of one context, stored on its fiber so the
/// scheduler can switch away from whichever fiber is running.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SuspendHandle(NonNull<Suspender>);

impl SuspendHandle {
    fn new(suspender: &Suspender) -> Self {
        Self(NonNull::from(suspender))
    }

    /// Hand control to the root, asking it to continue with `to`.
    /// Returns when something switches back into this context.
    ///
    /// # Safety
    ///
    /// Must be called from inside the context this handle came from,
    /// while that context is running. The suspender lives on that
    /// context's stack frame, which is only guaranteed alive then.
    pub unsafe fn suspend(self, to: Transfer) {
        // SAFETY: per the contract above we are on the owning stack, so
        // the pointee is live and not aliased mutably.
        unsafe { self.0.as_ref() }.suspend(to);
    }
}
