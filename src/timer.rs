// Copyright 2020 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A small cancellable one-shot timer service, running on its own thread,
//! independent of the blocking receive loop. Timers must be cancellable,
//! and a cancellation racing with the timer firing must be tolerated
//! without double-invoking or panicking. Built on `std::thread` + `Mutex`
//! + `Condvar` rather than an async runtime, in the same idiom the rest of
//! the engine uses for its rendezvous points.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce() + Send>;

struct ScheduledTimer {
    deadline: Instant,
    id: u64,
    callback: Callback,
}

// Ordered by deadline only; `BinaryHeap` is a max-heap, so we invert the
// comparison to get a min-heap ordered by the soonest deadline.
impl PartialEq for ScheduledTimer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for ScheduledTimer {}
impl PartialOrd for ScheduledTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledTimer {
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline).then(other.id.cmp(&self.id))
    }
}

struct State {
    heap: BinaryHeap<ScheduledTimer>,
    cancelled: HashSet<u64>,
    shutting_down: bool,
}

/// Runs cancellable deadline callbacks on a dedicated background thread.
pub struct TimerService {
    state: Arc<(Mutex<State>, Condvar)>,
    next_id: AtomicU64,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// A handle to a scheduled timer. Dropping it does not cancel the timer;
/// call [`TimerHandle::cancel`] explicitly.
pub struct TimerHandle {
    id: u64,
    state: Arc<(Mutex<State>, Condvar)>,
}

impl TimerHandle {
    /// Marks the timer cancelled. A no-op if it already fired. A timer
    /// cancelled before it fires simply never invokes its callback.
    pub fn cancel(&self) {
        let (lock, _) = &*self.state;
        let mut state = lock.lock().unwrap();
        state.cancelled.insert(self.id);
    }
}

impl TimerService {
    pub fn new() -> Arc<Self> {
        let state = Arc::new((
            Mutex::new(State {
                heap: BinaryHeap::new(),
                cancelled: HashSet::new(),
                shutting_down: false,
            }),
            Condvar::new(),
        ));

        let worker_state = Arc::clone(&state);
        let worker = std::thread::spawn(move || Self::run(worker_state));

        Arc::new(Self {
            state,
            next_id: AtomicU64::new(0),
            worker: Mutex::new(Some(worker)),
        })
    }

    fn run(state: Arc<(Mutex<State>, Condvar)>) {
        let (lock, condvar) = &*state;
        loop {
            let mut guard = lock.lock().unwrap();
            loop {
                if guard.shutting_down {
                    return;
                }
                match guard.heap.peek() {
                    None => {
                        guard = condvar.wait(guard).unwrap();
                    }
                    Some(next) => {
                        let now = Instant::now();
                        if next.deadline <= now {
                            break;
                        }
                        let (g, _) = condvar.wait_timeout(guard, next.deadline - now).unwrap();
                        guard = g;
                    }
                }
            }
            let timer = guard.heap.pop().unwrap();
            let cancelled = guard.cancelled.remove(&timer.id);
            drop(guard);
            if !cancelled {
                (timer.callback)();
            }
        }
    }

    /// Arms a one-shot timer firing `callback` after `delay`, unless
    /// cancelled first.
    pub fn schedule<F>(self: &Arc<Self>, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let (lock, condvar) = &*self.state;
        {
            let mut guard = lock.lock().unwrap();
            guard.heap.push(ScheduledTimer {
                deadline: Instant::now() + delay,
                id,
                callback: Box::new(callback),
            });
        }
        condvar.notify_all();
        TimerHandle {
            id,
            state: Arc::clone(&self.state),
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        {
            let (lock, condvar) = &*self.state;
            let mut guard = lock.lock().unwrap();
            guard.shutting_down = true;
            condvar.notify_all();
        }
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_after_delay() {
        let timers = TimerService::new();
        let (tx, rx) = mpsc::channel();
        let _handle = timers.schedule(Duration::from_millis(20), move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(2))
            .expect("timer should have fired");
    }

    #[test]
    fn cancel_before_firing_suppresses_callback() {
        let timers = TimerService::new();
        let (tx, rx) = mpsc::channel();
        let handle = timers.schedule(Duration::from_millis(200), move || {
            tx.send(()).unwrap();
        });
        handle.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
    }

    #[test]
    fn cancel_after_firing_is_a_harmless_no_op() {
        let timers = TimerService::new();
        let (tx, rx) = mpsc::channel();
        let handle = timers.schedule(Duration::from_millis(10), move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        handle.cancel();
    }
}
