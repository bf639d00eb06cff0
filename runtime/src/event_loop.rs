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

//! Task queues and the event loop that drives them.
//!
//! The loop is a process-wide singleton by default (lazily created on first touch,
//! cheap to create and tear down) but is never captured at module load
//! — every seam resolves [`EventLoop::current`] per call, so [`EventLoop::reset_global`]
//! actually takes effect for the next call. Scoped, non-singleton loops are supported
//! via [`EventLoop::new`] plus [`EventLoop::enter`], entirely analogous to the
//! teacher's pattern of installing a thread-local tracing subscriber for the duration
//! of a test instead of mutating a process global.

use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::{Rc, Weak},
    time::{Duration, Instant},
};

use tracing::trace;

use crate::{clock::TimerWheel, coroutine::TaskHandle, io_poller::IoPoller};

pub use crate::clock::TimerId;
pub use crate::io_poller::{IoInterest, IoReadiness, IoToken};

/// Tunables for one loop instance.
#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    /// Upper bound on ready-task resumptions drained per iteration.
    pub task_budget_per_tick: usize,
    /// Safety-valve clamp on how long one `poll` call may block, even with no timers
    /// or I/O registered, so a reactor thread never sits forever inside a blocking
    /// read.
    pub max_poll_wait: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self { task_budget_per_tick: 1024, max_poll_wait: Duration::from_secs(1) }
    }
}

struct Inner {
    ready: VecDeque<Rc<TaskHandle>>,
    microtasks: VecDeque<Box<dyn FnOnce()>>,
    timers: TimerWheel,
    io: IoPoller,
    external_pending: usize,
    config: LoopConfig,
}

/// A cheap, clonable handle to a loop instance. Every free function in this crate that
/// needs "the loop" takes one of these (or resolves [`EventLoop::current`] itself) —
/// never a bare reference captured once at construction time.
#[derive(Clone)]
pub struct EventLoop(Rc<RefCell<Inner>>);

/// A non-owning handle, held by tasks so that waking one doesn't keep its loop alive
/// past the last strong reference.
#[derive(Clone)]
pub struct EventLoopWeak(Weak<RefCell<Inner>>);

impl EventLoopWeak {
    pub fn upgrade(&self) -> Option<EventLoop> { self.0.upgrade().map(EventLoop) }
}

thread_local! {
    static GLOBAL: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
    static ACTIVE: RefCell<Vec<EventLoop>> = const { RefCell::new(Vec::new()) };
}

/// Pops the entered loop off the active stack on drop, restoring whatever scope was
/// active before. Returned by [`EventLoop::enter`].
#[must_use = "the scoped loop is only active while this guard is held"]
pub struct EnterGuard {
    _private: (),
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        ACTIVE.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(Inner {
            ready: VecDeque::new(),
            microtasks: VecDeque::new(),
            timers: TimerWheel::new(),
            io: IoPoller::new().expect("failed to initialize OS I/O poller"),
            external_pending: 0,
            config: LoopConfig::default(),
        })))
    }

    pub fn with_config(config: LoopConfig) -> Self {
        let this = Self::new();
        this.0.borrow_mut().config = config;
        this
    }

    /// The process-wide singleton, created lazily on first call.
    pub fn global() -> Self {
        GLOBAL.with(|slot| slot.borrow_mut().get_or_insert_with(EventLoop::new).clone())
    }

    /// Tears down the global singleton. Test-only: the next `global()`/`current()`
    /// call builds a brand new loop with no leftover timers, tasks, or registrations.
    pub fn reset_global() {
        GLOBAL.with(|slot| *slot.borrow_mut() = None);
    }

    /// The loop every seam resolves against: the innermost [`EventLoop::enter`]
    /// scope, or the global singleton if none is active.
    pub fn current() -> Self {
        ACTIVE.with(|stack| stack.borrow().last().cloned()).unwrap_or_else(EventLoop::global)
    }

    /// Makes `self` the result of [`EventLoop::current`] until the guard drops.
    /// Scoped loops are entered this way instead of mutating the process-wide
    /// singleton, the same pattern as installing a thread-local tracing subscriber
    /// guard for a test's duration.
    pub fn enter(&self) -> EnterGuard {
        ACTIVE.with(|stack| stack.borrow_mut().push(self.clone()));
        EnterGuard { _private: () }
    }

    pub fn downgrade(&self) -> EventLoopWeak { EventLoopWeak(Rc::downgrade(&self.0)) }

    pub fn schedule_microtask(&self, callback: Box<dyn FnOnce()>) {
        self.0.borrow_mut().microtasks.push_back(callback);
    }

    pub fn schedule_ready(&self, task: Rc<TaskHandle>) {
        self.0.borrow_mut().ready.push_back(task);
    }

    pub fn add_timer(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId {
        self.0.borrow_mut().timers.add_timer(Instant::now(), delay, callback)
    }

    pub fn cancel_timer(&self, id: TimerId) -> bool { self.0.borrow_mut().timers.cancel_timer(id) }

    pub fn register_io(
        &self,
        fd: std::os::fd::RawFd,
        interest: IoInterest,
        one_shot: bool,
        callback: crate::io_poller::IoCallback,
    ) -> std::io::Result<IoToken> {
        self.0.borrow_mut().io.register(fd, interest, one_shot, callback)
    }

    pub fn unregister_io(&self, token: IoToken) -> std::io::Result<()> {
        self.0.borrow_mut().io.unregister(token)
    }

    /// Seam 3: collaborators call this when dispatching native
    /// work so the loop doesn't idle out from under them.
    pub fn external_pending_inc(&self) { self.0.borrow_mut().external_pending += 1; }

    /// Counterpart to `external_pending_inc`; `callback` is enqueued as a micro-task
    /// once the decrement lands, matching how timer/IO callbacks are delivered.
    pub fn external_pending_dec(&self, callback: Box<dyn FnOnce()>) {
        {
            let mut inner = self.0.borrow_mut();
            inner.external_pending = inner.external_pending.saturating_sub(1);
        }
        self.schedule_microtask(callback);
    }

    pub fn task_budget_per_tick(&self) -> usize { self.0.borrow().config.task_budget_per_tick }

    /// Idle ≡ no ready task, no micro-task, no pending timer, no I/O registration, and
    /// no outstanding external work.
    pub fn is_idle(&self) -> bool {
        let inner = self.0.borrow();
        inner.ready.is_empty()
            && inner.microtasks.is_empty()
            && inner.timers.is_empty()
            && inner.io.is_empty()
            && inner.external_pending == 0
    }

    /// One turn of the loop: drain micro-tasks, resume ready tasks up to budget,
    /// poll I/O within a computed bound, then drain expired timers. Callers (the
    /// `run` family) loop this until settled-and-idle.
    pub fn tick(&self) {
        self.drain_microtasks();
        self.resume_ready_tasks();

        let max_wait = self.compute_max_wait();
        trace!(?max_wait, "polling io");
        match self.0.borrow_mut().io.poll(max_wait) {
            Ok(callbacks) => {
                for cb in callbacks {
                    self.schedule_microtask(cb);
                }
            }
            Err(error) => tracing::warn!(%error, "io poll failed"),
        }

        let expired = self.0.borrow_mut().timers.drain_expired(Instant::now());
        for cb in expired {
            self.schedule_microtask(cb);
        }
    }

    fn drain_microtasks(&self) {
        loop {
            let next = self.0.borrow_mut().microtasks.pop_front();
            let Some(callback) = next else { break };
            callback();
        }
    }

    fn resume_ready_tasks(&self) {
        let budget = self.task_budget_per_tick();
        for _ in 0..budget {
            let next = self.0.borrow_mut().ready.pop_front();
            let Some(task) = next else { break };
            task.resume();
        }
    }

    fn compute_max_wait(&self) -> Option<Duration> {
        let mut inner = self.0.borrow_mut();
        if inner.external_pending > 0 {
            return Some(Duration::ZERO);
        }
        let now = Instant::now();
        let deadline = inner.timers.next_deadline(now);
        let valve = inner.config.max_poll_wait;
        Some(deadline.map_or(valve, |d| d.min(valve)))
    }
}

impl Default for EventLoop {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell as Cell, rc::Rc as RcAlias};

    use pretty_assertions::assert_eq;
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn global_is_lazily_created_and_reset_drops_state() {
        EventLoop::reset_global();
        let a = EventLoop::global();
        a.schedule_microtask(Box::new(|| {}));
        assert!(!a.is_idle());
        EventLoop::reset_global();
        let b = EventLoop::global();
        assert!(b.is_idle());
    }

    #[test]
    fn enter_shadows_the_global_for_current() {
        let scoped = EventLoop::new();
        scoped.schedule_microtask(Box::new(|| {}));
        let _guard = scoped.enter();
        assert!(!EventLoop::current().is_idle());
    }

    #[test]
    fn microtasks_added_during_drain_are_also_drained() {
        let loop_handle = EventLoop::new();
        let log = RcAlias::new(Cell::new(Vec::new()));

        let log2 = log.clone();
        let loop_for_inner = loop_handle.clone();
        loop_handle.schedule_microtask(Box::new(move || {
            log2.borrow_mut().push(1);
            let log3 = log2.clone();
            loop_for_inner.schedule_microtask(Box::new(move || log3.borrow_mut().push(2)));
        }));

        loop_handle.tick();
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn external_pending_keeps_loop_non_idle_until_decremented() {
        let loop_handle = EventLoop::new();
        loop_handle.external_pending_inc();
        assert!(!loop_handle.is_idle());
        loop_handle.external_pending_dec(Box::new(|| {}));
        loop_handle.tick();
        assert!(loop_handle.is_idle());
    }
}
