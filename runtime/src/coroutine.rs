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

//! Coroutine Bridge.
//!
//! A coroutine here is a boxed, pinned, non-`Send` `Future<Output = ()>` — the
//! compiler-generated stackless state machine, used in place of a stackful fiber.
//! `await` is Rust's own `.await` operator (see [`crate::promise::Awaiter`]), which
//! makes an out-of-coroutine await a compile error rather than a runtime check: the
//! operator only parses inside an `async fn`/`async` block to begin with.

use std::{
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, RawWaker, RawWakerVTable, Waker},
};

use tracing::trace;

use crate::{
    error::Rejection,
    event_loop::{EventLoop, EventLoopWeak},
    promise::Promise,
};

/// One spawned coroutine. Holds its own body and a weak link back to the loop it was
/// spawned on, so waking it never keeps that loop alive.
pub struct TaskHandle {
    body: std::cell::RefCell<Option<Pin<Box<dyn Future<Output = ()>>>>>,
    loop_weak: EventLoopWeak,
}

impl TaskHandle {
    fn raw_waker(self: &Rc<Self>) -> RawWaker {
        let ptr = Rc::into_raw(self.clone()) as *const ();
        RawWaker::new(ptr, &VTABLE)
    }

    fn waker(self: &Rc<Self>) -> Waker { unsafe { Waker::from_raw(self.raw_waker()) } }

    fn schedule_self(self: &Rc<Self>) {
        if let Some(loop_handle) = self.loop_weak.upgrade() {
            loop_handle.schedule_ready(self.clone());
        }
    }

    /// Polls the coroutine's body once. Called by the event loop when this task is
    /// popped off the ready queue.
    pub fn resume(self: &Rc<Self>) {
        let Some(mut body) = self.body.borrow_mut().take() else {
            // Already terminated, or concurrently scheduled twice; a terminated
            // task's body is gone, so a duplicate wake is simply a no-op.
            return;
        };
        let waker = self.waker();
        let mut cx = Context::from_waker(&waker);
        match body.as_mut().poll(&mut cx) {
            Poll::Ready(()) => trace!("coroutine terminated"),
            Poll::Pending => *self.body.borrow_mut() = Some(body),
        }
    }
}

unsafe fn clone_waker(data: *const ()) -> RawWaker {
    let handle = unsafe { Rc::from_raw(data as *const TaskHandle) };
    let cloned = handle.clone();
    std::mem::forget(handle);
    let ptr = Rc::into_raw(cloned) as *const ();
    RawWaker::new(ptr, &VTABLE)
}

unsafe fn wake(data: *const ()) {
    let handle = unsafe { Rc::from_raw(data as *const TaskHandle) };
    handle.schedule_self();
}

unsafe fn wake_by_ref(data: *const ()) {
    let handle = unsafe { Rc::from_raw(data as *const TaskHandle) };
    handle.schedule_self();
    std::mem::forget(handle);
}

unsafe fn drop_waker(data: *const ()) {
    drop(unsafe { Rc::from_raw(data as *const TaskHandle) });
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone_waker, wake, wake_by_ref, drop_waker);

/// `async(fn) -> (args -> Promise)`, specialised to the zero-argument
/// case used throughout this crate's combinators and entry points: wraps a future
/// factory into a coroutine whose body resolves or rejects the returned promise, then
/// schedules it on [`EventLoop::current`].
pub fn spawn_async<F, Fut, T>(make_future: F) -> Promise<T>
where
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = Result<T, Rejection>> + 'static,
    T: 'static,
{
    let promise = Promise::<T>::pending();
    let promise_for_body = promise.clone();
    let loop_handle = EventLoop::current();

    let body: Pin<Box<dyn Future<Output = ()>>> = Box::pin(async move {
        match make_future().await {
            Ok(value) => promise_for_body.force_resolve(value),
            Err(reason) => promise_for_body.force_reject(reason),
        }
    });

    let task = Rc::new(TaskHandle { body: std::cell::RefCell::new(Some(body)), loop_weak: loop_handle.downgrade() });
    loop_handle.schedule_ready(task);
    promise
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
    fn spawned_coroutine_resolves_the_returned_promise() {
        let loop_handle = EventLoop::new();
        let _guard = loop_handle.enter();

        let p = spawn_async(|| async { Ok::<_, Rejection>(42) });
        drain(&loop_handle);

        let observed = Rc::new(std::cell::RefCell::new(None));
        let observed2 = observed.clone();
        p.then(move |v| *observed2.borrow_mut() = Some(*v));
        drain(&loop_handle);
        assert_eq!(*observed.borrow(), Some(42));
    }

    #[test]
    fn await_inside_a_coroutine_suspends_until_the_awaited_promise_settles() {
        let loop_handle = EventLoop::new();
        let _guard = loop_handle.enter();

        let (inner, resolver, _rejecter) = pending_with_resolver::<i32>();
        let inner_for_body = inner.clone();
        let p = spawn_async(move || async move {
            let v = inner_for_body.await?;
            Ok::<_, Rejection>(*v + 1)
        });

        loop_handle.tick();
        assert!(!p.is_settled(), "coroutine should be suspended awaiting `inner`");

        resolver.resolve(41);
        drain(&loop_handle);

        let observed = Rc::new(std::cell::RefCell::new(None));
        let observed2 = observed.clone();
        p.then(move |v| *observed2.borrow_mut() = Some(*v));
        drain(&loop_handle);
        assert_eq!(*observed.borrow(), Some(42));
    }

    fn pending_with_resolver<T: 'static>() -> (Promise<T>, crate::promise::Resolver<T>, crate::promise::Rejecter<T>) {
        let mut slot = None;
        let promise = Promise::new(|resolver, rejecter| {
            slot = Some((resolver, rejecter));
            Ok(())
        });
        let (resolver, rejecter) = slot.expect("executor runs synchronously");
        (promise, resolver, rejecter)
    }

    #[test]
    fn rejection_propagates_as_an_error_from_await() {
        let loop_handle = EventLoop::new();
        let _guard = loop_handle.enter();

        let p = spawn_async(|| async { Promise::<i32>::rejected(RuntimeError::Cancellation).await.map(|v| *v) });
        drain(&loop_handle);

        let observed = Rc::new(std::cell::RefCell::new(None));
        let observed2 = observed.clone();
        p.catch(move |r| {
            *observed2.borrow_mut() = Some(r.message());
            0
        });
        drain(&loop_handle);
        assert_eq!(observed.borrow().as_deref(), Some("operation was cancelled"));
    }
}
