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

//! Concurrency Governor.
//!
//! Tasks are passed as factories, not already-running promises: `concurrent` must
//! hold the bulk of them back until a slot frees up, so it needs to control *when*
//! each one starts, not just watch one that already has.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    future::Future,
    pin::Pin,
    rc::Rc,
};

use crate::{
    combinators::Outcome,
    coroutine::spawn_async,
    error::{Rejection, RuntimeError, RunResult},
    event_loop::EventLoop,
    promise::Promise,
};

/// A not-yet-started unit of work for the governor: built lazily so `concurrent` can
/// cap how many are under way at once.
pub type TaskFactory<T> = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<T, Rejection>>>>>;

/// `concurrent(tasks, limit)`: fail-fast by default. The first
/// rejection rejects the aggregate immediately and no further tasks are launched;
/// tasks already in flight run to completion with their outcome discarded.
pub fn concurrent<K, T>(tasks: Vec<(K, TaskFactory<T>)>, limit: usize) -> Promise<Vec<(K, Rc<T>)>>
where
    K: 'static,
    T: 'static,
{
    if limit == 0 {
        return Promise::rejected(RuntimeError::InvalidArgument("concurrency limit must be >= 1".to_string()));
    }
    if tasks.is_empty() {
        return Promise::resolved(Vec::new());
    }

    let total = tasks.len();
    let downstream = Promise::<Vec<(K, Rc<T>)>>::pending();
    let results = Rc::new(RefCell::new((0..total).map(|_| None).collect::<Vec<Option<(K, Rc<T>)>>>()));
    let remaining = Rc::new(Cell::new(total));
    let rejected = Rc::new(Cell::new(false));
    let pending = Rc::new(RefCell::new(
        tasks.into_iter().enumerate().map(|(i, (k, f))| (i, k, f)).collect::<VecDeque<_>>(),
    ));

    fn launch<K: 'static, T: 'static>(
        pending: Rc<RefCell<VecDeque<(usize, K, TaskFactory<T>)>>>,
        results: Rc<RefCell<Vec<Option<(K, Rc<T>)>>>>,
        remaining: Rc<Cell<usize>>,
        rejected: Rc<Cell<bool>>,
        downstream: Promise<Vec<(K, Rc<T>)>>,
    ) {
        if rejected.get() {
            return;
        }
        let Some((idx, key, factory)) = pending.borrow_mut().pop_front() else { return };
        let task_promise = spawn_async(move || factory());

        let results_ok = results.clone();
        let remaining_ok = remaining.clone();
        let rejected_ok = rejected.clone();
        let downstream_ok = downstream.clone();
        let pending_ok = pending;

        let rejected_err = rejected_ok.clone();
        let downstream_err = downstream_ok.clone();

        task_promise.on_settle(
            move |v| {
                if rejected_ok.get() {
                    return;
                }
                results_ok.borrow_mut()[idx] = Some((key, v));
                remaining_ok.set(remaining_ok.get() - 1);
                if remaining_ok.get() == 0 {
                    let final_vec =
                        results_ok.borrow_mut().iter_mut().map(|slot| slot.take().expect("slots filled")).collect();
                    downstream_ok.force_resolve(final_vec);
                } else {
                    EventLoop::current().schedule_microtask(Box::new(move || {
                        launch(pending_ok, results_ok, remaining_ok, rejected_ok, downstream_ok);
                    }));
                }
            },
            move |r| {
                if rejected_err.replace(true) {
                    return;
                }
                downstream_err.force_reject(r);
            },
        );
    }

    for _ in 0..limit.min(total) {
        launch(pending.clone(), results.clone(), remaining.clone(), rejected.clone(), downstream.clone());
    }
    downstream
}

/// Collect-everything sibling of [`concurrent`]: never rejects,
/// always runs every task to completion under the same bounded concurrency.
pub fn concurrent_settled<K, T>(tasks: Vec<(K, TaskFactory<T>)>, limit: usize) -> Promise<Vec<(K, Outcome<T>)>>
where
    K: 'static,
    T: 'static,
{
    if limit == 0 {
        return Promise::rejected(RuntimeError::InvalidArgument("concurrency limit must be >= 1".to_string()));
    }
    if tasks.is_empty() {
        return Promise::resolved(Vec::new());
    }

    let total = tasks.len();
    let downstream = Promise::<Vec<(K, Outcome<T>)>>::pending();
    let results = Rc::new(RefCell::new((0..total).map(|_| None).collect::<Vec<Option<(K, Outcome<T>)>>>()));
    let remaining = Rc::new(Cell::new(total));
    let pending = Rc::new(RefCell::new(
        tasks.into_iter().enumerate().map(|(i, (k, f))| (i, k, f)).collect::<VecDeque<_>>(),
    ));

    fn launch<K: 'static, T: 'static>(
        pending: Rc<RefCell<VecDeque<(usize, K, TaskFactory<T>)>>>,
        results: Rc<RefCell<Vec<Option<(K, Outcome<T>)>>>>,
        remaining: Rc<Cell<usize>>,
        downstream: Promise<Vec<(K, Outcome<T>)>>,
    ) {
        let Some((idx, key, factory)) = pending.borrow_mut().pop_front() else { return };
        let task_promise = spawn_async(move || factory());

        let results_ok = results.clone();
        let remaining_ok = remaining.clone();
        let downstream_ok = downstream.clone();
        let pending_ok = pending;

        let results_err = results_ok.clone();
        let remaining_err = remaining_ok.clone();
        let downstream_err = downstream_ok.clone();
        let pending_err = pending_ok.clone();

        // Shared because either the fulfilled or the rejected branch needs to move
        // `key` into the results slot, but exactly one of the two ever runs.
        let key_cell = Rc::new(RefCell::new(Some(key)));
        let key_cell_ok = key_cell.clone();

        task_promise.on_settle(
            move |v| {
                let key = key_cell_ok.borrow_mut().take().expect("settle fires exactly once");
                results_ok.borrow_mut()[idx] = Some((key, Outcome::Fulfilled(v)));
                finish_or_continue(pending_ok, results_ok, remaining_ok, downstream_ok);
            },
            move |r| {
                let key = key_cell.borrow_mut().take().expect("settle fires exactly once");
                results_err.borrow_mut()[idx] = Some((key, Outcome::Rejected(r)));
                finish_or_continue(pending_err, results_err, remaining_err, downstream_err);
            },
        );
    }

    fn finish_or_continue<K: 'static, T: 'static>(
        pending: Rc<RefCell<VecDeque<(usize, K, TaskFactory<T>)>>>,
        results: Rc<RefCell<Vec<Option<(K, Outcome<T>)>>>>,
        remaining: Rc<Cell<usize>>,
        downstream: Promise<Vec<(K, Outcome<T>)>>,
    ) {
        remaining.set(remaining.get() - 1);
        if remaining.get() == 0 {
            let final_vec = results.borrow_mut().iter_mut().map(|slot| slot.take().expect("slots filled")).collect();
            downstream.force_resolve(final_vec);
        } else {
            EventLoop::current().schedule_microtask(Box::new(move || {
                launch(pending, results, remaining, downstream);
            }));
        }
    }

    for _ in 0..limit.min(total) {
        launch(pending.clone(), results.clone(), remaining.clone(), downstream.clone());
    }
    downstream
}

/// `batch(tasks, batch_size, inner_limit)`: sequential batches of
/// `concurrent`, each of size `batch_size`; the next batch starts only once the
/// previous one settles, and any batch rejection rejects the aggregate immediately.
pub fn batch<K, T>(tasks: Vec<(K, TaskFactory<T>)>, batch_size: usize, inner_limit: usize) -> Promise<Vec<(K, Rc<T>)>>
where
    K: Clone + 'static,
    T: 'static,
{
    if batch_size == 0 {
        return Promise::rejected(RuntimeError::InvalidArgument("batch size must be >= 1".to_string()));
    }

    spawn_async(move || async move {
        let mut combined = Vec::with_capacity(tasks.len());
        let mut remaining = tasks;
        while !remaining.is_empty() {
            let chunk_len = batch_size.min(remaining.len());
            let chunk: Vec<_> = remaining.drain(..chunk_len).collect();
            let settled: Rc<Vec<(K, Rc<T>)>> = concurrent(chunk, inner_limit).await?;
            combined.extend(settled.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok::<_, Rejection>(combined)
    })
}

/// Convenience alias matching the entry points' naming; `run_concurrent` builds its
/// `RunResult` directly from [`concurrent`], so this type exists purely to document
/// the contract.
pub type GovernorResult<K, T> = RunResult<Rc<Vec<(K, Rc<T>)>>>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::event_loop::EventLoop;

    fn drain(loop_handle: &EventLoop) {
        while !loop_handle.is_idle() {
            loop_handle.tick();
        }
    }

    fn ok_factory<T: 'static + Clone>(value: T) -> TaskFactory<T> {
        Box::new(move || Box::pin(async move { Ok(value) }) as Pin<Box<dyn Future<Output = Result<T, Rejection>>>>)
    }

    fn failing_factory<T: 'static>(reason: RuntimeError) -> TaskFactory<T> {
        Box::new(move || {
            Box::pin(async move { Err(Rejection::from(reason)) }) as Pin<Box<dyn Future<Output = Result<T, Rejection>>>>
        })
    }

    #[test]
    fn concurrent_respects_the_limit_and_preserves_keys() {
        let loop_handle = EventLoop::new();
        let _guard = loop_handle.enter();

        let in_flight = Rc::new(Cell::new(0usize));
        let max_observed = Rc::new(Cell::new(0usize));

        let tasks: Vec<(usize, TaskFactory<i32>)> = (0..6)
            .map(|i| {
                let in_flight = in_flight.clone();
                let max_observed = max_observed.clone();
                let factory: TaskFactory<i32> = Box::new(move || {
                    Box::pin(async move {
                        in_flight.set(in_flight.get() + 1);
                        max_observed.set(max_observed.get().max(in_flight.get()));
                        let _ = crate::combinators::delay(Duration::from_millis(1)).await;
                        in_flight.set(in_flight.get() - 1);
                        Ok(i)
                    }) as Pin<Box<dyn Future<Output = Result<i32, Rejection>>>>
                });
                (i, factory)
            })
            .collect();

        let p = concurrent(tasks, 2);
        drain(&loop_handle);

        let observed = Rc::new(RefCell::new(None));
        let observed2 = observed.clone();
        p.then(move |v| *observed2.borrow_mut() = Some(v.iter().map(|(k, val)| (*k, **val)).collect::<Vec<_>>()));
        drain(&loop_handle);

        assert_eq!(*observed.borrow(), Some((0..6).map(|i| (i, i)).collect::<Vec<_>>()));
        assert!(max_observed.get() <= 2);
    }

    #[test]
    fn concurrent_is_fail_fast_and_rejects_with_the_failing_reason() {
        let loop_handle = EventLoop::new();
        let _guard = loop_handle.enter();

        let tasks: Vec<(usize, TaskFactory<i32>)> =
            vec![(0, ok_factory(1)), (1, failing_factory(RuntimeError::Cancellation)), (2, ok_factory(3))];
        let p = concurrent(tasks, 3);
        drain(&loop_handle);

        let message = Rc::new(RefCell::new(String::new()));
        let message2 = message.clone();
        p.catch(move |r| {
            *message2.borrow_mut() = r.message();
            Vec::new()
        });
        drain(&loop_handle);
        assert_eq!(*message.borrow(), "operation was cancelled");
    }

    #[test]
    fn zero_limit_rejects_with_invalid_argument() {
        let loop_handle = EventLoop::new();
        let _guard = loop_handle.enter();
        let p: Promise<Vec<(usize, Rc<i32>)>> = concurrent(vec![(0, ok_factory(1))], 0);
        assert!(p.is_settled());
    }

    #[test]
    fn batch_runs_sequentially_and_accumulates_all_results() {
        let loop_handle = EventLoop::new();
        let _guard = loop_handle.enter();

        let tasks: Vec<(usize, TaskFactory<i32>)> = (0..5).map(|i| (i, ok_factory(i))).collect();
        let p = batch(tasks, 2, 2);
        drain(&loop_handle);

        let observed = Rc::new(RefCell::new(None));
        let observed2 = observed.clone();
        p.then(move |v| *observed2.borrow_mut() = Some(v.iter().map(|(k, val)| (*k, **val)).collect::<Vec<_>>()));
        drain(&loop_handle);
        assert_eq!(*observed.borrow(), Some((0..5).map(|i| (i, i)).collect::<Vec<_>>()));
    }
}
