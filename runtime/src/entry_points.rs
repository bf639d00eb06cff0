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

//! Public Entry Points — the only functions most embedders ever
//! call directly; everything else in this crate exists to make these four correct.

use std::{future::Future, rc::Rc, time::Duration};

use crate::{
    combinators::{all, timeout, Task},
    coroutine::spawn_async,
    error::{Rejection, RunResult, RuntimeError},
    event_loop::EventLoop,
    governor::{concurrent, TaskFactory},
    promise::Promise,
};

/// Drives [`EventLoop::current`] until `promise` is both settled and the loop is
/// idle, then returns its outcome.
fn drive_to_settlement<T: 'static>(promise: Promise<T>) -> RunResult<Rc<T>> {
    let loop_handle = EventLoop::current();
    loop {
        match promise.peek() {
            Some(settled) if loop_handle.is_idle() => return settled.map_err(RuntimeError::Rejected),
            None if loop_handle.is_idle() => panic!(
                "event loop went idle before run()'s root promise settled — a promise \
                 was likely constructed and never resolved, rejected, or cancelled"
            ),
            _ => loop_handle.tick(),
        }
    }
}

/// `run(fn_or_promise)`: wraps `make_future` as a coroutine and drives
/// the loop until its promise settles, returning the resolved value or surfacing the
/// rejection as a [`RuntimeError`].
pub fn run<T, F, Fut>(make_future: F) -> RunResult<Rc<T>>
where
    T: 'static,
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = Result<T, Rejection>> + 'static,
{
    drive_to_settlement(spawn_async(make_future))
}

/// `run_all(tasks) = run(() => all(tasks))`.
pub fn run_all<K, T>(tasks: Vec<(K, Promise<T>)>) -> RunResult<Rc<Vec<(K, Rc<T>)>>>
where
    K: 'static,
    T: 'static,
{
    drive_to_settlement(all(tasks.into_iter().map(|(k, p)| (k, Task::from(p))).collect()))
}

/// `run_concurrent(tasks, limit) = run(() => concurrent(tasks, limit))`.
pub fn run_concurrent<K, T>(tasks: Vec<(K, TaskFactory<T>)>, limit: usize) -> RunResult<Rc<Vec<(K, Rc<T>)>>>
where
    K: 'static,
    T: 'static,
{
    drive_to_settlement(concurrent(tasks, limit))
}

/// `run_with_timeout(fn, seconds) = run(() => timeout(fn, seconds))`.
pub fn run_with_timeout<T, F, Fut>(op: F, duration: Duration) -> RunResult<Rc<T>>
where
    T: 'static,
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = Result<T, Rejection>> + 'static,
{
    drive_to_settlement(timeout(op, duration))
}
