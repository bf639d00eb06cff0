/*
 *   Copyright (c) 2024 The weave-rt Authors
 *
 *   Licensed under the Apache License, Version 2.0 (the "License");
 *   you may not use this file except in compliance with the License.
 *   You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 *   Unless required by applicable law or agreed to in writing, software
 *   distributed under the License is distributed on an "AS IS" BASIS,
 *   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *   See the License for the specific language governing permissions and
 *   limitations under the License.
 */

//! Cancellable Promise.
//!
//! A chain built from a cancellable promise shares one [`CancelState`] cell across
//! every link instead of walking a parent pointer at cancel time: `then`/`and_then`
//! on a [`CancellablePromise`] clone the same `Rc<CancelState>` into the downstream
//! link. Cancelling any link therefore cancels the same state the root producer
//! holds, which *is* the "locate the earliest cancellable ancestor" rule, just
//! resolved once at chain-construction time instead of re-walked on every
//! `cancel()` call.

use std::{cell::RefCell, future::IntoFuture, rc::Rc};

use tracing::debug;

use crate::{
    error::{Rejection, RuntimeError},
    promise::{Awaiter, Promise},
};

struct CancelState {
    handler: Option<Box<dyn FnOnce()>>,
    reject_root: Option<Box<dyn FnOnce(Rejection)>>,
    cancelled: bool,
}

/// A promise plus a single cancel hook shared with every promise derived from it via
/// `then`/`and_then`.
pub struct CancellablePromise<T: 'static> {
    promise: Promise<T>,
    state: Rc<RefCell<CancelState>>,
}

impl<T: 'static> Clone for CancellablePromise<T> {
    fn clone(&self) -> Self { CancellablePromise { promise: self.promise.clone(), state: self.state.clone() } }
}

impl<T: 'static> CancellablePromise<T> {
    /// Wraps `promise` with a fresh (root) cancel state. `handler` runs at most once,
    /// the first time `cancel()` succeeds. The root promise itself is force-rejected
    /// on cancel, regardless of which derived link `cancel()` was actually called on.
    pub fn new(promise: Promise<T>, handler: impl FnOnce() + 'static) -> Self {
        let root = promise.clone();
        let reject_root: Box<dyn FnOnce(Rejection)> = Box::new(move |reason| root.force_reject(reason));
        CancellablePromise {
            promise,
            state: Rc::new(RefCell::new(CancelState {
                handler: Some(Box::new(handler)),
                reject_root: Some(reject_root),
                cancelled: false,
            })),
        }
    }

    fn derived(promise: Promise<T>, state: Rc<RefCell<CancelState>>) -> Self {
        CancellablePromise { promise, state }
    }

    pub fn promise(&self) -> &Promise<T> { &self.promise }

    pub fn is_cancelled(&self) -> bool { self.state.borrow().cancelled }

    /// Idempotent: cancelling an already-settled or already-cancelled promise is a
    /// no-op. Rejects the *root* promise of the chain, not just the link `cancel()`
    /// was called on — every derived link settles as a consequence of that, the same
    /// way any other rejection propagates downstream.
    pub fn cancel(&self) {
        if self.promise.is_settled() {
            return;
        }
        let (handler, reject_root) = {
            let mut state = self.state.borrow_mut();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            (state.handler.take(), state.reject_root.take())
        };
        debug!("cancelling promise");
        if let Some(handler) = handler {
            handler();
        }
        if let Some(reject_root) = reject_root {
            reject_root(RuntimeError::Cancellation.into());
        }
    }

    pub fn then<U, F>(&self, on_fulfilled: F) -> CancellablePromise<U>
    where
        U: 'static,
        F: FnOnce(Rc<T>) -> U + 'static,
    {
        CancellablePromise::derived(self.promise.then(on_fulfilled), self.state.clone())
    }

    pub fn and_then<U, F>(&self, on_fulfilled: F) -> CancellablePromise<U>
    where
        U: 'static,
        F: FnOnce(Rc<T>) -> Promise<U> + 'static,
    {
        CancellablePromise::derived(self.promise.and_then(on_fulfilled), self.state.clone())
    }
}

impl<T: 'static> IntoFuture for CancellablePromise<T> {
    type Output = Result<Rc<T>, Rejection>;
    type IntoFuture = Awaiter<T>;

    fn into_future(self) -> Self::IntoFuture { self.promise.into_future() }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell as Cell;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::event_loop::EventLoop;

    fn drain(loop_handle: &EventLoop) {
        while !loop_handle.is_idle() {
            loop_handle.tick();
        }
    }

    #[test]
    fn cancel_is_idempotent_and_runs_handler_once() {
        let loop_handle = EventLoop::new();
        let _guard = loop_handle.enter();

        let runs = Rc::new(Cell::new(0));
        let runs2 = runs.clone();
        let p = CancellablePromise::new(Promise::<i32>::pending(), move || *runs2.borrow_mut() += 1);

        p.cancel();
        p.cancel();
        drain(&loop_handle);

        assert_eq!(*runs.borrow(), 1);
        assert!(p.is_cancelled());
        assert!(p.promise().is_settled());
    }

    #[test]
    fn cancelling_a_downstream_link_cancels_the_shared_root_state() {
        let loop_handle = EventLoop::new();
        let _guard = loop_handle.enter();

        let runs = Rc::new(Cell::new(false));
        let runs2 = runs.clone();
        let root = CancellablePromise::new(Promise::<i32>::pending(), move || *runs2.borrow_mut() = true);
        let downstream = root.then(|v| *v + 1);

        downstream.cancel();
        drain(&loop_handle);

        assert!(*runs.borrow());
        assert!(root.is_cancelled());
        assert!(root.promise().is_settled(), "the root promise itself must be rejected, not just the shared flag");
        assert!(downstream.promise().is_settled());
    }

    #[test]
    fn cancel_after_settlement_is_a_noop() {
        let loop_handle = EventLoop::new();
        let _guard = loop_handle.enter();

        let runs = Rc::new(Cell::new(0));
        let runs2 = runs.clone();
        let inner = Promise::resolved(1);
        let p = CancellablePromise::new(inner, move || *runs2.borrow_mut() += 1);
        drain(&loop_handle);

        p.cancel();
        assert_eq!(*runs.borrow(), 0);
        assert!(!p.is_cancelled());
    }
}
