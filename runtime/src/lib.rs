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

//! `weave_rt`: a single-threaded, cooperative promise and coroutine runtime.
//!
//! The event loop ticks a micro-task queue, a ready-task queue, a timer heap, and
//! an I/O poller in a fixed order every turn. On top of it sits a JS-flavoured
//! promise, cancellation, and coroutine bridge so ordinary `async fn` code can be
//! written and composed with `.then`/`.catch`, plus a set of concurrency
//! combinators and a bounded-concurrency governor. [`entry_points`] is the small
//! surface most embedders actually call.
//!
//! Nothing here is `Send`/`Sync`; the whole runtime is meant to live on one
//! thread, with an [`EventLoop`](event_loop::EventLoop) either entered explicitly
//! (scoped, for tests and nested runtimes) or reached implicitly through
//! [`EventLoop::current`](event_loop::EventLoop::current) (a lazily-initialised
//! thread-local default).
//!
//! Diagnostics go through the `tracing` facade only — this crate never picks a
//! subscriber. Wire one up yourself, or use the sibling `weave_log` crate.

#![cfg_attr(not(test), deny(clippy::unwrap_in_result))]

pub mod cancellable;
pub mod clock;
pub mod combinators;
pub mod coroutine;
pub mod entry_points;
pub mod error;
pub mod event_loop;
pub mod governor;
pub mod io_poller;
pub mod promise;

pub use cancellable::CancellablePromise;
pub use combinators::{all, all_settled, any, delay, race, timeout, Outcome, RaceEntry, Task};
pub use coroutine::spawn_async;
pub use entry_points::{run, run_all, run_concurrent, run_with_timeout};
pub use error::{Rejection, RunResult, RuntimeError, Settled};
pub use event_loop::{EnterGuard, EventLoop, LoopConfig};
pub use governor::{batch, concurrent, concurrent_settled, GovernorResult, TaskFactory};
pub use promise::{Promise, Rejecter, Resolver};
