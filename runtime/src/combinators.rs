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

//! Combinators — `all`, `all_settled`, `race`, `any`, `delay`, `timeout`
//!.
//!
//! Inputs are a `Vec<(K, Task<T>)>` rather than a duck-typed "keyed mapping":
//! callers pick `K = usize` for a positional sequence or `K = String` for a keyed
//! mapping, and the combinator preserves whatever order they were given in — the same
//! "the result's keys match the input's keys" guarantee, without a runtime
//! is-this-an-array check. Each input is either an already-running [`Promise`] or a
//! zero-argument thunk, adopted as `spawn_async(fn)` at the combinator's entry point.

use std::{
    cell::{Cell, RefCell},
    future::Future,
    pin::Pin,
    rc::Rc,
    time::Duration,
};

use crate::{
    cancellable::CancellablePromise,
    coroutine::spawn_async,
    error::{Rejection, RuntimeError},
    event_loop::EventLoop,
    promise::Promise,
};

/// The outcome of one input to [`all_settled`]: never a rejection of the combinator
/// itself, just a record of what that particular input did.
#[derive(Clone)]
pub enum Outcome<T> {
    Fulfilled(Rc<T>),
    Rejected(Rejection),
}

/// A combinator input: either an already-running promise, or a thunk spawned as a
/// coroutine the moment it is adopted into a combinator's input vector. Mirrors
/// [`RaceEntry`]'s `Plain`/`Cancellable` split, but along the promise-vs-callable axis.
pub enum Task<T: 'static> {
    Promise(Promise<T>),
    Fn(Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<T, Rejection>>>>>),
}

impl<T: 'static> Task<T> {
    fn into_promise(self) -> Promise<T> {
        match self {
            Task::Promise(p) => p,
            Task::Fn(f) => spawn_async(f),
        }
    }
}

impl<T: 'static> From<Promise<T>> for Task<T> {
    fn from(p: Promise<T>) -> Self { Task::Promise(p) }
}

impl<T, F, Fut> From<F> for Task<T>
where
    T: 'static,
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = Result<T, Rejection>> + 'static,
{
    fn from(f: F) -> Self { Task::Fn(Box::new(move || Box::pin(f()) as Pin<Box<dyn Future<Output = Result<T, Rejection>>>>)) }
}

/// `all(T)`: resolves once every input resolves, in input order;
/// rejects immediately on the first rejection, discarding the rest. Empty input
/// resolves with an empty vector.
pub fn all<K, T>(inputs: Vec<(K, Task<T>)>) -> Promise<Vec<(K, Rc<T>)>>
where
    K: 'static,
    T: 'static,
{
    if inputs.is_empty() {
        return Promise::resolved(Vec::new());
    }

    let total = inputs.len();
    let downstream = Promise::<Vec<(K, Rc<T>)>>::pending();
    let results = Rc::new(RefCell::new((0..total).map(|_| None).collect::<Vec<Option<(K, Rc<T>)>>>()));
    let remaining = Rc::new(Cell::new(total));
    let settled = Rc::new(Cell::new(false));

    for (idx, (key, task)) in inputs.into_iter().enumerate() {
        let promise = task.into_promise();
        let results_ok = results.clone();
        let remaining_ok = remaining.clone();
        let settled_ok = settled.clone();
        let downstream_ok = downstream.clone();
        let settled_err = settled.clone();
        let downstream_err = downstream.clone();

        promise.on_settle(
            move |v| {
                if settled_ok.get() {
                    return;
                }
                results_ok.borrow_mut()[idx] = Some((key, v));
                remaining_ok.set(remaining_ok.get() - 1);
                if remaining_ok.get() == 0 {
                    settled_ok.set(true);
                    let final_vec =
                        results_ok.borrow_mut().iter_mut().map(|slot| slot.take().expect("all slots filled")).collect();
                    downstream_ok.force_resolve(final_vec);
                }
            },
            move |r| {
                if settled_err.replace(true) {
                    return;
                }
                downstream_err.force_reject(r);
            },
        );
    }
    downstream
}

/// `all_settled(T)`: never rejects, resolves once every input has
/// settled with a per-key fulfilled/rejected record.
pub fn all_settled<K, T>(inputs: Vec<(K, Task<T>)>) -> Promise<Vec<(K, Outcome<T>)>>
where
    K: 'static,
    T: 'static,
{
    if inputs.is_empty() {
        return Promise::resolved(Vec::new());
    }

    let total = inputs.len();
    let downstream = Promise::<Vec<(K, Outcome<T>)>>::pending();
    let results = Rc::new(RefCell::new((0..total).map(|_| None).collect::<Vec<Option<(K, Outcome<T>)>>>()));
    let remaining = Rc::new(Cell::new(total));

    for (idx, (key, task)) in inputs.into_iter().enumerate() {
        let promise = task.into_promise();
        let results_ok = results.clone();
        let remaining_ok = remaining.clone();
        let downstream_ok = downstream.clone();
        let results_err = results.clone();
        let remaining_err = remaining.clone();
        let downstream_err = downstream.clone();

        promise.on_settle(
            move |v| {
                results_ok.borrow_mut()[idx] = Some((key, Outcome::Fulfilled(v)));
                remaining_ok.set(remaining_ok.get() - 1);
                if remaining_ok.get() == 0 {
                    let final_vec =
                        results_ok.borrow_mut().iter_mut().map(|slot| slot.take().expect("slots filled")).collect();
                    downstream_ok.force_resolve(final_vec);
                }
            },
            move |r| {
                results_err.borrow_mut()[idx] = Some((key, Outcome::Rejected(r)));
                remaining_err.set(remaining_err.get() - 1);
                if remaining_err.get() == 0 {
                    let final_vec =
                        results_err.borrow_mut().iter_mut().map(|slot| slot.take().expect("slots filled")).collect();
                    downstream_err.force_resolve(final_vec);
                }
            },
        );
    }
    downstream
}

/// A combinator input that may or may not carry a cancel hook. `race`/`timeout`
/// cancel every losing entry that is [`RaceEntry::Cancellable`]; a plain entry is left alone.
pub enum RaceEntry<T: 'static> {
    Plain(Promise<T>),
    Cancellable(CancellablePromise<T>),
}

impl<T: 'static> RaceEntry<T> {
    fn promise(&self) -> Promise<T> {
        match self {
            RaceEntry::Plain(p) => p.clone(),
            RaceEntry::Cancellable(c) => c.promise().clone(),
        }
    }

    fn cancel_if_cancellable(&self) {
        if let RaceEntry::Cancellable(c) = self {
            c.cancel();
        }
    }
}

impl<T: 'static> From<Promise<T>> for RaceEntry<T> {
    fn from(p: Promise<T>) -> Self { RaceEntry::Plain(p) }
}

impl<T: 'static> From<CancellablePromise<T>> for RaceEntry<T> {
    fn from(c: CancellablePromise<T>) -> Self { RaceEntry::Cancellable(c) }
}

/// A zero-argument thunk is adopted as `spawn_async(fn)` the moment it is wrapped
/// into a `RaceEntry`, i.e. at the combinator's entry point, same as [`Task`].
impl<T, F, Fut> From<F> for RaceEntry<T>
where
    T: 'static,
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = Result<T, Rejection>> + 'static,
{
    fn from(f: F) -> Self { RaceEntry::Plain(spawn_async(f)) }
}

/// `race(T)`: settles with whichever input settles first, fulfilled or
/// rejected. Empty input rejects with [`RuntimeError::NoPromises`].
pub fn race<K, T>(inputs: Vec<(K, RaceEntry<T>)>) -> Promise<T>
where
    K: 'static,
    T: 'static,
{
    if inputs.is_empty() {
        return Promise::rejected(RuntimeError::NoPromises);
    }

    let downstream = Promise::<T>::pending();
    let entries: Rc<Vec<RaceEntry<T>>> = Rc::new(inputs.into_iter().map(|(_, e)| e).collect());
    let settled = Rc::new(Cell::new(false));

    for (idx, entry) in entries.iter().enumerate() {
        let promise = entry.promise();
        let entries_ok = entries.clone();
        let settled_ok = settled.clone();
        let downstream_ok = downstream.clone();
        let entries_err = entries.clone();
        let settled_err = settled.clone();
        let downstream_err = downstream.clone();

        promise.on_settle(
            move |v| {
                if settled_ok.replace(true) {
                    return;
                }
                cancel_losers(&entries_ok, idx);
                downstream_ok.force_resolve_shared(v);
            },
            move |r| {
                if settled_err.replace(true) {
                    return;
                }
                cancel_losers(&entries_err, idx);
                downstream_err.force_reject(r);
            },
        );
    }
    downstream
}

fn cancel_losers<T: 'static>(entries: &[RaceEntry<T>], winner_idx: usize) {
    for (i, entry) in entries.iter().enumerate() {
        if i != winner_idx {
            entry.cancel_if_cancellable();
        }
    }
}

/// `any(T)`: resolves with the first fulfillment; if every input
/// rejects, rejects with [`RuntimeError::Aggregate`] carrying every reason in input
/// order. Empty input rejects with [`RuntimeError::NoPromises`].
pub fn any<K, T>(inputs: Vec<(K, Task<T>)>) -> Promise<T>
where
    K: 'static,
    T: 'static,
{
    if inputs.is_empty() {
        return Promise::rejected(RuntimeError::NoPromises);
    }

    let total = inputs.len();
    let downstream = Promise::<T>::pending();
    let reasons = Rc::new(RefCell::new((0..total).map(|_| None).collect::<Vec<Option<Rejection>>>()));
    let remaining = Rc::new(Cell::new(total));
    let settled = Rc::new(Cell::new(false));

    for (idx, (_key, task)) in inputs.into_iter().enumerate() {
        let promise = task.into_promise();
        let settled_ok = settled.clone();
        let downstream_ok = downstream.clone();
        let reasons_err = reasons.clone();
        let remaining_err = remaining.clone();
        let settled_err = settled.clone();
        let downstream_err = downstream.clone();

        promise.on_settle(
            move |v| {
                if settled_ok.replace(true) {
                    return;
                }
                downstream_ok.force_resolve_shared(v);
            },
            move |r| {
                if settled_err.get() {
                    return;
                }
                reasons_err.borrow_mut()[idx] = Some(r);
                remaining_err.set(remaining_err.get() - 1);
                if remaining_err.get() == 0 {
                    settled_err.set(true);
                    let all_reasons =
                        reasons_err.borrow_mut().iter_mut().map(|slot| slot.take().expect("slots filled")).collect();
                    downstream_err.force_reject(RuntimeError::aggregate(all_reasons));
                }
            },
        );
    }
    downstream
}

/// `delay(seconds) -> CancellablePromise`: resolves with `()` after
/// `duration`. Cancelling it also cancels the underlying timer.
pub fn delay(duration: Duration) -> CancellablePromise<()> {
    let promise = Promise::<()>::pending();
    let loop_handle = EventLoop::current();

    let timer_slot = Rc::new(Cell::new(None));
    let timer_slot_for_fire = timer_slot.clone();
    let promise_for_fire = promise.clone();
    let id = loop_handle.add_timer(
        duration,
        Box::new(move || {
            timer_slot_for_fire.set(None);
            promise_for_fire.force_resolve(());
        }),
    );
    timer_slot.set(Some(id));

    let loop_for_cancel = loop_handle;
    CancellablePromise::new(promise, move || {
        if let Some(id) = timer_slot.get() {
            loop_for_cancel.cancel_timer(id);
        }
    })
}

/// `timeout(op, seconds)`: races `op` against [`delay`]; the timer side
/// rejects with [`RuntimeError::Timeout`] if it wins. Rejects immediately with
/// [`RuntimeError::InvalidArgument`] if `duration` is zero.
pub fn timeout<T, F, Fut>(op: F, duration: Duration) -> Promise<T>
where
    T: 'static,
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = Result<T, Rejection>> + 'static,
{
    if duration.is_zero() {
        return Promise::rejected(RuntimeError::InvalidArgument("timeout duration must be > 0".to_string()));
    }

    let op_promise = spawn_async(op);
    let timer: CancellablePromise<T> =
        delay(duration).and_then(move |_unit| Promise::<T>::rejected(RuntimeError::Timeout(duration)));

    race(vec![("op", RaceEntry::from(op_promise)), ("timeout", RaceEntry::from(timer))])
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::RuntimeError;

    fn drain(loop_handle: &EventLoop) {
        while !loop_handle.is_idle() {
            loop_handle.tick();
        }
    }

    #[test]
    fn all_preserves_keys_and_resolves_in_order() {
        let loop_handle = EventLoop::new();
        let _guard = loop_handle.enter();

        let inputs: Vec<(usize, Task<&str>)> = vec![
            (0, Promise::resolved("c").into()),
            (1, Promise::resolved("a").into()),
            (2, Promise::resolved("b").into()),
        ];
        let p = all(inputs);
        drain(&loop_handle);

        let observed = Rc::new(RefCell::new(None));
        let observed2 = observed.clone();
        p.then(move |v| {
            *observed2.borrow_mut() = Some(v.iter().map(|(k, val)| (*k, **val)).collect::<Vec<_>>())
        });
        drain(&loop_handle);
        assert_eq!(*observed.borrow(), Some(vec![(0, "c"), (1, "a"), (2, "b")]));
    }

    #[test]
    fn all_empty_input_resolves_with_empty_vec() {
        let loop_handle = EventLoop::new();
        let _guard = loop_handle.enter();
        let p: Promise<Vec<(usize, Rc<i32>)>> = all(Vec::new());
        assert!(p.is_settled());
        drain(&loop_handle);
    }

    #[test]
    fn all_rejects_on_first_failure_ignoring_the_rest() {
        let loop_handle = EventLoop::new();
        let _guard = loop_handle.enter();

        let inputs: Vec<(usize, Task<i32>)> = vec![
            (0, Promise::resolved(1).into()),
            (1, Promise::rejected(RuntimeError::Cancellation).into()),
            (2, Promise::resolved(3).into()),
        ];
        let p = all(inputs);
        drain(&loop_handle);

        let rejected = Rc::new(Cell::new(false));
        let rejected2 = rejected.clone();
        p.catch(move |_| {
            rejected2.set(true);
            Vec::new()
        });
        drain(&loop_handle);
        assert!(rejected.get());
    }

    #[test]
    fn all_accepts_a_zero_argument_thunk_alongside_promises() {
        let loop_handle = EventLoop::new();
        let _guard = loop_handle.enter();

        let inputs: Vec<(usize, Task<i32>)> =
            vec![(0, Promise::resolved(1).into()), (1, Task::from(|| async { Ok::<_, Rejection>(2) }))];
        let p = all(inputs);
        drain(&loop_handle);

        let observed = Rc::new(RefCell::new(None));
        let observed2 = observed.clone();
        p.then(move |v| *observed2.borrow_mut() = Some(v.iter().map(|(k, val)| (*k, **val)).collect::<Vec<_>>()));
        drain(&loop_handle);
        assert_eq!(*observed.borrow(), Some(vec![(0, 1), (1, 2)]));
    }

    #[test]
    fn race_resolves_with_first_settler_and_cancels_the_loser() {
        let loop_handle = EventLoop::new();
        let _guard = loop_handle.enter();

        let fast = delay(Duration::from_millis(1)).and_then(|_| Promise::resolved("fast"));
        let slow = delay(Duration::from_secs(10)).and_then(|_| Promise::resolved("slow"));
        let slow_clone = slow.clone();

        let p = race(vec![("fast", RaceEntry::from(fast)), ("slow", RaceEntry::from(slow))]);
        drain(&loop_handle);

        let observed = Rc::new(RefCell::new(None));
        let observed2 = observed.clone();
        p.then(move |v| *observed2.borrow_mut() = Some(**v));
        drain(&loop_handle);

        assert_eq!(*observed.borrow(), Some("fast"));
        assert!(slow_clone.is_cancelled());
    }

    #[test]
    fn race_accepts_a_zero_argument_thunk_as_an_entry() {
        let loop_handle = EventLoop::new();
        let _guard = loop_handle.enter();

        let p = race(vec![
            ("slow", RaceEntry::from(delay(Duration::from_secs(10)).and_then(|_| Promise::resolved("slow")))),
            ("fast", RaceEntry::from(|| async { Ok::<_, Rejection>("fast") })),
        ]);
        drain(&loop_handle);

        let observed = Rc::new(RefCell::new(None));
        let observed2 = observed.clone();
        p.then(move |v| *observed2.borrow_mut() = Some(**v));
        drain(&loop_handle);
        assert_eq!(*observed.borrow(), Some("fast"));
    }

    #[test]
    fn any_rejects_with_aggregate_when_all_inputs_reject() {
        let loop_handle = EventLoop::new();
        let _guard = loop_handle.enter();

        let inputs: Vec<(usize, Task<i32>)> = vec![
            (0, Promise::rejected(RuntimeError::Cancellation).into()),
            (1, Promise::rejected(RuntimeError::InvalidArgument("bad".into())).into()),
        ];
        let p = any(inputs);
        drain(&loop_handle);

        let message = Rc::new(RefCell::new(String::new()));
        let message2 = message.clone();
        p.catch(move |r| {
            *message2.borrow_mut() = r.message();
            0
        });
        drain(&loop_handle);
        assert!(message.borrow().contains("2 promise(s) rejected"));
    }

    #[test]
    fn any_accepts_a_zero_argument_thunk_and_resolves_on_first_success() {
        let loop_handle = EventLoop::new();
        let _guard = loop_handle.enter();

        let inputs: Vec<(usize, Task<i32>)> = vec![
            (0, Promise::rejected(RuntimeError::Cancellation).into()),
            (1, Task::from(|| async { Ok::<_, Rejection>(7) })),
        ];
        let p = any(inputs);
        drain(&loop_handle);

        let observed = Rc::new(RefCell::new(None));
        let observed2 = observed.clone();
        p.then(move |v| *observed2.borrow_mut() = Some(**v));
        drain(&loop_handle);
        assert_eq!(*observed.borrow(), Some(7));
    }

    #[test]
    fn timeout_rejects_with_timeout_error_when_op_is_too_slow() {
        let loop_handle = EventLoop::new();
        let _guard = loop_handle.enter();

        // An op that awaits a promise which never settles within the timeout window.
        let p = timeout(|| async { Promise::<i32>::pending().await }, Duration::from_millis(1));
        for _ in 0..1000 {
            if p.is_settled() {
                break;
            }
            loop_handle.tick();
        }
        assert!(p.is_settled());

        let message = Rc::new(RefCell::new(String::new()));
        let message2 = message.clone();
        p.catch(move |r| {
            *message2.borrow_mut() = r.message();
            0
        });
        drain(&loop_handle);
        assert!(message.borrow().contains("timed out"));
    }

    #[test]
    fn timeout_rejects_invalid_argument_for_zero_duration() {
        let loop_handle = EventLoop::new();
        let _guard = loop_handle.enter();
        let p = timeout(|| async { Ok::<_, Rejection>(1) }, Duration::ZERO);
        assert!(p.is_settled());
    }
}
