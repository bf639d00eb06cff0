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

//! Promise Core — state machine, chaining, and the resolution pipeline
//!.
//!
//! The dynamic-language contract is `then(on_fulfilled, on_rejected)` where
//! `on_fulfilled` may itself return either a plain value or another promise (adopted
//! transparently). A statically typed promise can't dispatch on that at runtime, so
//! the call is split in two, named the way `Result`/`Option` name their own
//! combinators: [`Promise::then`] maps to a plain value, [`Promise::and_then`] maps to
//! another promise and is adopted. The rejection-side split is `catch`/`or_else`.

use std::{
    future::IntoFuture,
    pin::Pin,
    rc::Rc,
    cell::RefCell,
    task::{Context, Poll, Waker},
};

use tracing::{trace, warn};

use crate::error::{Rejection, RuntimeError, Settled};
use crate::event_loop::EventLoop;

enum PromiseState<T> {
    Pending,
    Fulfilled(Rc<T>),
    Rejected(Rejection),
}

type FulfillCb<T> = Box<dyn FnOnce(Rc<T>)>;
type RejectCb = Box<dyn FnOnce(Rejection)>;

struct Inner<T> {
    state: PromiseState<T>,
    /// FIFO handler records: each `then`/`catch`/...
    /// call registers one `(on_fulfilled, on_rejected)` pair; exactly one side fires.
    handlers: Vec<(FulfillCb<T>, RejectCb)>,
    handler_ever_registered: bool,
    waker: Option<Waker>,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if !self.handler_ever_registered {
            if let PromiseState::Rejected(reason) = &self.state {
                warn!(%reason, "unhandled promise rejection");
            }
        }
    }
}

/// A single-valued future with reference (not move) semantics: cloning a `Promise`
/// clones the handle, not the eventual value — every clone observes the same
/// settlement.
pub struct Promise<T>(Rc<RefCell<Inner<T>>>);

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self { Promise(self.0.clone()) }
}

/// What a `then_raw` handler produces for its downstream promise.
enum Outcome<U> {
    /// A freshly computed value.
    Value(U),
    /// The same shared value forwarded unchanged (used when the caller mirrors the
    /// source branch instead of mapping it, e.g. `catch`'s fulfilled side).
    Shared(Rc<U>),
    Reject(Rejection),
    /// Adopt another promise: the downstream stays pending until it settles, then
    /// mirrors it.
    Adopt(Promise<U>),
}

impl<T: 'static> Promise<T> {
    fn new_inner(state: PromiseState<T>) -> Self {
        Promise(Rc::new(RefCell::new(Inner {
            state,
            handlers: Vec::new(),
            handler_ever_registered: false,
            waker: None,
        })))
    }

    pub fn pending() -> Self { Self::new_inner(PromiseState::Pending) }

    pub fn resolved(value: T) -> Self { Self::new_inner(PromiseState::Fulfilled(Rc::new(value))) }

    pub fn from_fulfilled_rc(value: Rc<T>) -> Self { Self::new_inner(PromiseState::Fulfilled(value)) }

    pub fn rejected(reason: impl Into<Rejection>) -> Self {
        Self::new_inner(PromiseState::Rejected(reason.into()))
    }

    /// `new(executor(resolve, reject))`: runs synchronously; an `Err`
    /// returned by `executor` auto-rejects, mirroring "exceptions from it auto-reject".
    pub fn new<F>(executor: F) -> Self
    where
        F: FnOnce(Resolver<T>, Rejecter<T>) -> Result<(), Rejection>,
    {
        let promise = Self::pending();
        let resolver = Resolver { promise: promise.clone() };
        let rejecter = Rejecter { promise: promise.clone() };
        if let Err(reason) = executor(resolver, rejecter) {
            promise.settle_rejected(reason);
        }
        promise
    }

    pub fn is_settled(&self) -> bool { !matches!(self.0.borrow().state, PromiseState::Pending) }

    /// Snapshots the current settlement without registering a handler. Used by the
    /// `run` family to read the root promise's outcome once the loop has gone idle.
    pub fn peek(&self) -> Option<Settled<T>> {
        match &self.0.borrow().state {
            PromiseState::Pending => None,
            PromiseState::Fulfilled(v) => Some(Ok(v.clone())),
            PromiseState::Rejected(r) => Some(Err(r.clone())),
        }
    }

    fn register_handler(&self, on_fulfilled: FulfillCb<T>, on_rejected: RejectCb) {
        let mut inner = self.0.borrow_mut();
        inner.handler_ever_registered = true;
        match &inner.state {
            PromiseState::Pending => inner.handlers.push((on_fulfilled, on_rejected)),
            PromiseState::Fulfilled(v) => {
                let v = v.clone();
                drop(inner);
                EventLoop::current().schedule_microtask(Box::new(move || on_fulfilled(v)));
            }
            PromiseState::Rejected(r) => {
                let r = r.clone();
                drop(inner);
                EventLoop::current().schedule_microtask(Box::new(move || on_rejected(r)));
            }
        }
    }

    fn settle_fulfilled(&self, value: Rc<T>) {
        let (handlers, waker) = {
            let mut inner = self.0.borrow_mut();
            if !matches!(inner.state, PromiseState::Pending) {
                return;
            }
            inner.state = PromiseState::Fulfilled(value.clone());
            (std::mem::take(&mut inner.handlers), inner.waker.take())
        };
        trace!("promise fulfilled");
        if let Some(w) = waker {
            w.wake();
        }
        let loop_handle = EventLoop::current();
        for (on_fulfilled, _) in handlers {
            let v = value.clone();
            loop_handle.schedule_microtask(Box::new(move || on_fulfilled(v)));
        }
    }

    fn settle_rejected(&self, reason: Rejection) {
        let (handlers, waker) = {
            let mut inner = self.0.borrow_mut();
            if !matches!(inner.state, PromiseState::Pending) {
                return;
            }
            inner.state = PromiseState::Rejected(reason.clone());
            (std::mem::take(&mut inner.handlers), inner.waker.take())
        };
        trace!(%reason, "promise rejected");
        if let Some(w) = waker {
            w.wake();
        }
        let loop_handle = EventLoop::current();
        for (_, on_rejected) in handlers {
            let r = reason.clone();
            loop_handle.schedule_microtask(Box::new(move || on_rejected(r)));
        }
    }

    /// Resolves `self` with another promise of the same type. Self-adoption (`p`
    /// resolved with `p` itself) rejects with [`RuntimeError::ChainingCycle`] instead
    /// of deadlocking.
    pub fn resolve_with(&self, other: Promise<T>) {
        if Rc::ptr_eq(&self.0, &other.0) {
            self.settle_rejected(RuntimeError::ChainingCycle.into());
            return;
        }
        let ok = self.clone();
        let err = self.clone();
        other.register_handler(Box::new(move |v| ok.settle_fulfilled(v)), Box::new(move |r| err.settle_rejected(r)));
    }

    fn apply_outcome(&self, outcome: Outcome<T>) {
        match outcome {
            Outcome::Value(v) => self.settle_fulfilled(Rc::new(v)),
            Outcome::Shared(v) => self.settle_fulfilled(v),
            Outcome::Reject(r) => self.settle_rejected(r),
            Outcome::Adopt(other) => self.resolve_with(other),
        }
    }

    fn then_raw<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U>
    where
        U: 'static,
        F: FnOnce(Rc<T>) -> Outcome<U> + 'static,
        R: FnOnce(Rejection) -> Outcome<U> + 'static,
    {
        let downstream = Promise::<U>::pending();

        let downstream_ok = downstream.clone();
        let fulfilled_cb: FulfillCb<T> = Box::new(move |v| downstream_ok.apply_outcome(on_fulfilled(v)));

        let downstream_err = downstream.clone();
        let rejected_cb: RejectCb = Box::new(move |r| downstream_err.apply_outcome(on_rejected(r)));

        self.register_handler(fulfilled_cb, rejected_cb);
        downstream
    }

    /// Maps a fulfilled value to a plain value; rejection passes through unchanged.
    pub fn then<U, F>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: 'static,
        F: FnOnce(Rc<T>) -> U + 'static,
    {
        self.then_raw(move |v| Outcome::Value(on_fulfilled(v)), Outcome::Reject)
    }

    /// Maps a fulfilled value to another promise, which is adopted.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: 'static,
        F: FnOnce(Rc<T>) -> Promise<U> + 'static,
    {
        self.then_raw(move |v| Outcome::Adopt(on_fulfilled(v)), Outcome::Reject)
    }

    /// `catch(on_rejected)` &equiv; `then(None, on_rejected)`, recovering
    /// to a plain value of the same type.
    pub fn catch<F>(&self, on_rejected: F) -> Promise<T>
    where
        F: FnOnce(Rejection) -> T + 'static,
    {
        self.then_raw(Outcome::Shared, move |r| Outcome::Value(on_rejected(r)))
    }

    /// Recovers to another promise, which is adopted.
    pub fn or_else<F>(&self, on_rejected: F) -> Promise<T>
    where
        F: FnOnce(Rejection) -> Promise<T> + 'static,
    {
        self.then_raw(Outcome::Shared, move |r| Outcome::Adopt(on_rejected(r)))
    }

    /// Runs `on_settled` regardless of outcome; its return value is discarded and the
    /// source outcome mirrors through unchanged. Use [`Promise::finally_with`] to await a guard promise.
    pub fn finally<F>(&self, on_settled: F) -> Promise<T>
    where
        F: FnOnce() + 'static,
    {
        let shared = Rc::new(RefCell::new(Some(Box::new(on_settled) as Box<dyn FnOnce()>)));
        let shared_ok = shared.clone();
        let shared_err = shared;
        self.then_raw(
            move |v| {
                if let Some(f) = shared_ok.borrow_mut().take() {
                    f();
                }
                Outcome::Shared(v)
            },
            move |r| {
                if let Some(f) = shared_err.borrow_mut().take() {
                    f();
                }
                Outcome::Reject(r)
            },
        )
    }

    /// `finally` variant whose guard itself returns a promise: the downstream waits
    /// for the guard, then mirrors the source outcome on guard success; a guard
    /// rejection supersedes the source outcome.
    pub fn finally_with<F>(&self, on_settled: F) -> Promise<T>
    where
        F: FnOnce() -> Promise<()> + 'static,
    {
        let shared = Rc::new(RefCell::new(Some(Box::new(on_settled) as Box<dyn FnOnce() -> Promise<()>>)));
        let shared_ok = shared.clone();
        let shared_err = shared;
        self.then_raw(
            move |v| {
                let guard = (shared_ok.borrow_mut().take().expect("finally_with handler runs once"))();
                Outcome::Adopt(guard.and_then(move |_unit| Promise::from_fulfilled_rc(v)))
            },
            move |r| {
                let guard = (shared_err.borrow_mut().take().expect("finally_with handler runs once"))();
                Outcome::Adopt(guard.and_then(move |_unit| Promise::<T>::rejected(r)))
            },
        )
    }

    /// Internal seam used by [`crate::cancellable::CancellablePromise::cancel`] to
    /// settle the wrapped promise once the cancel handler has run.
    pub(crate) fn force_reject(&self, reason: Rejection) { self.settle_rejected(reason); }

    /// Internal seam used by [`crate::coroutine::spawn_async`] to settle a task's
    /// promise with its coroutine body's return value.
    pub(crate) fn force_resolve(&self, value: T) { self.settle_fulfilled(Rc::new(value)); }

    /// As [`Promise::force_resolve`], but for callers (`race`/`any`) that already
    /// hold the winning value as a shared `Rc`, e.g. forwarded from another promise.
    pub(crate) fn force_resolve_shared(&self, value: Rc<T>) { self.settle_fulfilled(value); }

    /// Internal seam used by the combinators and governor: registers a handler pair
    /// without building a chained downstream promise, for combinators that settle
    /// their own independent output promise from the side rather than mapping
    /// one-to-one.
    pub(crate) fn on_settle<F, R>(&self, on_fulfilled: F, on_rejected: R)
    where
        F: FnOnce(Rc<T>) + 'static,
        R: FnOnce(Rejection) + 'static,
    {
        self.register_handler(Box::new(on_fulfilled), Box::new(on_rejected));
    }

    /// Internal seam used by the coroutine bridge and combinators: registers
    /// a one-shot waker-notifying handler without building a chained promise.
    pub(crate) fn awaiter(&self) -> Awaiter<T> {
        Awaiter { promise: self.clone(), registered: false, result: Rc::new(RefCell::new(None)) }
    }
}

/// Passed to [`Promise::new`]'s executor; the dynamic "resolve" half split into a
/// direct value and an adopting-another-promise variant, per this module's
/// `then`/`and_then` naming convention.
pub struct Resolver<T: 'static> {
    promise: Promise<T>,
}

impl<T: 'static> Resolver<T> {
    pub fn resolve(&self, value: T) { self.promise.settle_fulfilled(Rc::new(value)); }

    pub fn resolve_with(&self, other: Promise<T>) { self.promise.resolve_with(other); }
}

pub struct Rejecter<T: 'static> {
    promise: Promise<T>,
}

impl<T: 'static> Rejecter<T> {
    pub fn reject(&self, reason: impl Into<Rejection>) { self.promise.settle_rejected(reason.into()); }
}

/// The coroutine bridge's `await` seam: registers a handler (delivered on the
/// micro-task queue, never synchronously) that stores the outcome and wakes the
/// polling task.
pub struct Awaiter<T: 'static> {
    promise: Promise<T>,
    registered: bool,
    result: Rc<RefCell<Option<Settled<T>>>>,
}

impl<T: 'static> std::future::Future for Awaiter<T> {
    type Output = Settled<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(settled) = self.result.borrow_mut().take() {
            return Poll::Ready(settled);
        }
        if !self.registered {
            self.registered = true;
            let waker_ok = cx.waker().clone();
            let waker_err = waker_ok.clone();
            let result_ok = self.result.clone();
            let result_err = self.result.clone();
            self.promise.register_handler(
                Box::new(move |v| {
                    *result_ok.borrow_mut() = Some(Ok(v));
                    waker_ok.wake();
                }),
                Box::new(move |r| {
                    *result_err.borrow_mut() = Some(Err(r));
                    waker_err.wake();
                }),
            );
        }
        Poll::Pending
    }
}

/// Lets `promise.await` work directly inside `async` blocks: Rust calls
/// `IntoFuture::into_future` before polling anything written to the right of `.await`.
impl<T: 'static> IntoFuture for Promise<T> {
    type Output = Settled<T>;
    type IntoFuture = Awaiter<T>;

    fn into_future(self) -> Self::IntoFuture { self.awaiter() }
}
