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

//! Clock & Timer Wheel — a monotonic time source plus an ordered set of pending
//! timers, lazily removed on cancellation.

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    time::{Duration, Instant},
};

/// Process-unique, monotonically increasing timer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

struct Entry {
    id: TimerId,
    fire_at: Instant,
    callback: Box<dyn FnOnce()>,
}

/// Heap key: ordered by `fire_at`, ties broken by insertion order (`id`), ascending.
/// Wrapped in `Reverse` because `BinaryHeap` is a max-heap and we want the earliest
/// deadline at the top.
struct HeapKey {
    fire_at: Instant,
    id: TimerId,
}

impl PartialEq for HeapKey {
    fn eq(&self, other: &Self) -> bool { self.fire_at == other.fire_at && self.id == other.id }
}
impl Eq for HeapKey {}
impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fire_at.cmp(&other.fire_at).then_with(|| self.id.cmp(&other.id))
    }
}

/// A min-heap of pending timers plus the entries they point to. Cancellation just
/// removes the entry; the heap key is left in place and skipped lazily when it
/// reaches the root.
#[derive(Default)]
pub struct TimerWheel {
    heap: BinaryHeap<Reverse<HeapKey>>,
    entries: std::collections::HashMap<TimerId, Entry>,
    next_id: u64,
}

impl TimerWheel {
    pub fn new() -> Self { Self::default() }

    /// Inserts a timer firing `delay` from `now`. A zero or negative delay fires on
    /// the next `drain_expired` call, since `now + delay` clamps to `now`.
    pub fn add_timer(&mut self, now: Instant, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let fire_at = now + delay;
        self.heap.push(Reverse(HeapKey { fire_at, id }));
        self.entries.insert(id, Entry { id, fire_at, callback });
        id
    }

    /// Removes the timer's callback so it never fires. Returns `false` if the timer
    /// already fired or never existed. Idempotent.
    pub fn cancel_timer(&mut self, id: TimerId) -> bool { self.entries.remove(&id).is_some() }

    /// Time until the earliest pending timer, clamped to non-negative. `None` if no
    /// timers are pending.
    pub fn next_deadline(&mut self, now: Instant) -> Option<Duration> {
        self.drop_cancelled_heap_top();
        self.heap.peek().map(|Reverse(key)| key.fire_at.saturating_duration_since(now))
    }

    /// Pops every timer whose deadline has passed, in `fire_at` order (ties broken by
    /// insertion order), skipping any that were cancelled in the meantime.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<Box<dyn FnOnce()>> {
        let mut callbacks = Vec::new();
        loop {
            let Some(Reverse(key)) = self.heap.peek() else { break };
            if key.fire_at > now {
                break;
            }
            let Reverse(key) = self.heap.pop().expect("peeked entry must pop");
            if let Some(entry) = self.entries.remove(&key.id) {
                callbacks.push(entry.callback);
            }
        }
        callbacks
    }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn len(&self) -> usize { self.entries.len() }

    fn drop_cancelled_heap_top(&mut self) {
        while let Some(Reverse(key)) = self.heap.peek() {
            if self.entries.contains_key(&key.id) {
                break;
            }
            self.heap.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn fires_in_fire_at_order_ties_broken_by_insertion() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        let log = Rc::new(RefCell::new(Vec::new()));

        let push = |log: Rc<RefCell<Vec<&'static str>>>, label: &'static str| {
            Box::new(move || log.borrow_mut().push(label)) as Box<dyn FnOnce()>
        };

        wheel.add_timer(now, Duration::from_millis(20), push(log.clone(), "b"));
        wheel.add_timer(now, Duration::from_millis(10), push(log.clone(), "a"));
        wheel.add_timer(now, Duration::from_millis(10), push(log.clone(), "a2"));

        let later = now + Duration::from_millis(30);
        for cb in wheel.drain_expired(later) {
            cb();
        }
        assert_eq!(*log.borrow(), vec!["a", "a2", "b"]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn cancel_is_idempotent_and_skips_firing() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();

        let id = wheel.add_timer(now, Duration::from_millis(1), Box::new(move || *fired2.borrow_mut() = true));
        assert!(wheel.cancel_timer(id));
        assert!(!wheel.cancel_timer(id));

        let callbacks = wheel.drain_expired(now + Duration::from_millis(5));
        assert!(callbacks.is_empty());
        assert!(!*fired.borrow());
    }

    #[test]
    fn next_deadline_clamps_to_zero_for_past_timers() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        wheel.add_timer(now, Duration::from_millis(0), Box::new(|| {}));
        assert_eq!(wheel.next_deadline(now), Some(Duration::ZERO));
    }

    #[test]
    fn next_deadline_skips_cancelled_root() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        let a = wheel.add_timer(now, Duration::from_millis(5), Box::new(|| {}));
        wheel.add_timer(now, Duration::from_millis(50), Box::new(|| {}));
        wheel.cancel_timer(a);
        assert_eq!(wheel.next_deadline(now), Some(Duration::from_millis(50)));
    }
}
