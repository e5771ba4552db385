/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// Counts messages between "sent to queue" and "handler returned".
///
/// The host owns exactly one counter and shares it by `Arc` with every
/// send path and dispatcher. A coordinator uses [`wait_until_empty`]
/// as the barrier for clean shutdown: every enqueued message is paired
/// with exactly one [`decrease`], whether the handler returned, failed,
/// or the dispatcher dropped the message.
///
/// [`wait_until_empty`]: InFlightCounter::wait_until_empty
/// [`decrease`]: InFlightCounter::decrease
#[derive(Debug, Default)]
pub struct InFlightCounter {
    size: Mutex<i64>,
    signal: Condvar,
    increase_was_called: AtomicBool,
}

impl InFlightCounter {
    /// Creates a counter at zero with the first-increment latch unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically increments the count.
    ///
    /// The 0→1 transition signals "non-empty"; the first increment ever
    /// latches and signals "first increment" for [`wait_until_first`].
    ///
    /// [`wait_until_first`]: InFlightCounter::wait_until_first
    pub fn increase(&self) {
        let mut size = self.size.lock();
        *size += 1;
        if *size == 1 {
            self.increase_was_called.store(true, Ordering::SeqCst);
            trace!("in-flight counter became non-empty, notifying");
            self.signal.notify_all();
        }
    }

    /// Atomically decrements the count, signalling "empty" on the
    /// transition to zero.
    pub fn decrease(&self) {
        let mut size = self.size.lock();
        *size -= 1;
        if *size == 0 {
            trace!("in-flight counter returned to zero, notifying");
            self.signal.notify_all();
        }
    }

    /// Snapshot of the current count.
    pub fn size(&self) -> i64 {
        *self.size.lock()
    }

    /// Blocks until at least one [`increase`](InFlightCounter::increase)
    /// has ever happened.
    pub fn wait_until_first(&self) {
        let mut size = self.size.lock();
        while !self.increase_was_called.load(Ordering::SeqCst) {
            self.signal.wait(&mut size);
        }
    }

    /// Blocks until the count is zero.
    ///
    /// Returns immediately if nothing is in flight. A handler that
    /// wedges keeps its message counted and this call blocked.
    pub fn wait_until_empty(&self) {
        let mut size = self.size.lock();
        while *size > 0 {
            self.signal.wait(&mut size);
        }
    }
}

/// Guarantees exactly one `decrease` for a message taken off a queue.
///
/// Dispatchers create one of these before invoking a handler so the
/// pairing invariant holds on success, on handler failure, and on
/// panic unwinding.
pub struct CounterGuard {
    counter: Arc<InFlightCounter>,
}

impl CounterGuard {
    /// Arms the guard for one decrement.
    pub fn new(counter: Arc<InFlightCounter>) -> Self {
        Self { counter }
    }
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.counter.decrease();
    }
}
