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

//! Per-receiver message queues and their consumer threads.
//!
//! Every receiver id owns a slot with a main FIFO queue and, in
//! per-sub-queue mode, a lane per `queue` value. Each `add_handler`
//! call spawns one dedicated consumer thread; calling it again for a
//! live id adds another consumer draining the same queue, which is how
//! replicated workers participate. Senders never block: queues are
//! unbounded and `send_message` returns after enqueueing.
//!
//! Ordering guarantees: within a single sub-queue (or the whole queue
//! in FIFO mode with one consumer) handlers run in send order; across
//! sub-queues and across receivers there is none. Multiple consumers
//! on one queue trade away the per-receiver ordering.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{error, instrument, trace};

use crate::common::error::AgentError;
use crate::message::Message;

/// How a receiver's queue is drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
    /// One logical queue; send order equals handling order while a
    /// single consumer serves the receiver. Additional consumers
    /// (replicas) weaken this to best effort.
    Fifo,
    /// One independently ordered lane per `queue` value, each with its
    /// own consumer; lanes run in parallel with no cross-lane order.
    PerSubQueue,
}

/// Handler invoked by consumer threads for each dequeued message.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Optional per-receiver logging callback `(receiver, message,
/// sending)`; invoked with `sending = true` on the sender's thread and
/// `sending = false` on the consumer's thread.
pub type MessageLogger = Arc<dyn Fn(usize, &Message, bool) + Send + Sync>;

#[derive(Default)]
struct SubQueue {
    queue: VecDeque<Message>,
    has_consumer: bool,
}

#[derive(Default)]
struct SlotState {
    main: VecDeque<Message>,
    subs: BTreeMap<i64, SubQueue>,
    disposed: bool,
}

struct ReceiverSlot {
    id: usize,
    ordering: Ordering,
    state: Mutex<SlotState>,
    ready: Condvar,
    logger: Mutex<Option<MessageLogger>>,
    handler: Mutex<Option<MessageHandler>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_name: Mutex<String>,
}

impl ReceiverSlot {
    fn log(&self, message: &Message, sending: bool) {
        if let Some(logger) = self.logger.lock().clone() {
            logger(self.id, message, sending);
        }
    }

    fn deliver(&self, handler: &MessageHandler, message: Message) {
        self.log(&message, false);
        let name = message.name.clone();
        if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
            error!(receiver = self.id, message = %name, "handler panicked; dispatcher continues");
        }
    }
}

/// Owns every receiver slot and the consumer threads that drain them.
///
/// Dropping the manager disposes all remaining receivers: each is
/// unregistered, drained through its handler, and its consumers are
/// joined.
pub struct MessageManager {
    slots: DashMap<usize, Arc<ReceiverSlot>>,
}

impl Default for MessageManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageManager {
    /// Creates a manager with no receivers.
    pub fn new() -> Self {
        Self { slots: DashMap::new() }
    }

    /// Installs `handler` for `receiver` and launches a consumer
    /// thread named `thread_name`.
    ///
    /// For a receiver that is already registered the call adds another
    /// consumer on the same queue and `ordering` is ignored. `seed` is
    /// handled by the new consumer before it joins the shared queue;
    /// this is the direct first delivery used when a scripted worker
    /// replicates.
    #[instrument(skip(self, handler, seed))]
    pub fn add_handler(
        &self,
        receiver: usize,
        handler: MessageHandler,
        thread_name: &str,
        ordering: Ordering,
        seed: Option<Message>,
    ) -> Result<(), AgentError> {
        let slot = self
            .slots
            .entry(receiver)
            .or_insert_with(|| {
                Arc::new(ReceiverSlot {
                    id: receiver,
                    ordering,
                    state: Mutex::new(SlotState::default()),
                    ready: Condvar::new(),
                    logger: Mutex::new(None),
                    handler: Mutex::new(None),
                    threads: Mutex::new(Vec::new()),
                    thread_name: Mutex::new(thread_name.to_string()),
                })
            })
            .value()
            .clone();

        *slot.handler.lock() = Some(handler.clone());
        *slot.thread_name.lock() = thread_name.to_string();

        match slot.ordering {
            Ordering::Fifo => spawn_fifo_consumer(&slot, handler, seed, thread_name)?,
            Ordering::PerSubQueue => {
                // Lane consumers start lazily at the first send to each
                // lane; a seed would bypass lane ordering.
                debug_assert!(seed.is_none(), "seed delivery requires FIFO ordering");
            }
        }
        trace!(receiver, ordering = ?slot.ordering, "handler installed");
        Ok(())
    }

    /// Enqueues `message` for `receiver` on the sub-queue selected by
    /// `sub_queue` (ignored in FIFO mode).
    ///
    /// Fails only with [`AgentError::NoSuchReceiver`] when the receiver
    /// is unknown or has been disposed.
    pub fn send_message(
        &self,
        receiver: usize,
        message: Message,
        sub_queue: i64,
    ) -> Result<(), AgentError> {
        let Some(slot) = self.slots.get(&receiver).map(|entry| entry.value().clone()) else {
            return Err(AgentError::NoSuchReceiver(receiver));
        };

        slot.log(&message, true);

        let mut spawn_lane = None;
        {
            let mut state = slot.state.lock();
            if state.disposed {
                return Err(AgentError::NoSuchReceiver(receiver));
            }
            match slot.ordering {
                Ordering::Fifo => state.main.push_back(message),
                Ordering::PerSubQueue => {
                    let lane = state.subs.entry(sub_queue).or_default();
                    lane.queue.push_back(message);
                    if !lane.has_consumer {
                        lane.has_consumer = true;
                        spawn_lane = Some(sub_queue);
                    }
                }
            }
        }
        if let Some(key) = spawn_lane {
            spawn_lane_consumer(&slot, key)?;
        }
        slot.ready.notify_all();
        Ok(())
    }

    /// Installs a logging callback for `receiver`.
    pub fn set_logger(&self, receiver: usize, logger: MessageLogger) -> Result<(), AgentError> {
        let Some(slot) = self.slots.get(&receiver) else {
            return Err(AgentError::NoSuchReceiver(receiver));
        };
        *slot.logger.lock() = Some(logger);
        Ok(())
    }

    /// Whether `receiver` is currently registered and not disposed.
    pub fn is_registered(&self, receiver: usize) -> bool {
        self.slots.contains_key(&receiver)
    }

    /// Stops `receiver` gracefully: unregisters it, lets its consumers
    /// drain the remaining messages through the handler, and joins
    /// them. Subsequent sends for the id fail with `NoSuchReceiver`.
    ///
    /// Must not be called from one of the receiver's own handlers.
    #[instrument(skip(self))]
    pub fn dispose(&self, receiver: usize) {
        let Some((_, slot)) = self.slots.remove(&receiver) else {
            return;
        };
        {
            let mut state = slot.state.lock();
            state.disposed = true;
        }
        slot.ready.notify_all();
        let threads = std::mem::take(&mut *slot.threads.lock());
        trace!(receiver, consumers = threads.len(), "joining consumers");
        for thread in threads {
            if thread.join().is_err() {
                error!(receiver, "consumer thread ended in a panic");
            }
        }
    }

    /// Ids of all live receivers.
    pub fn receiver_ids(&self) -> Vec<usize> {
        self.slots.iter().map(|entry| *entry.key()).collect()
    }
}

impl Drop for MessageManager {
    fn drop(&mut self) {
        for receiver in self.receiver_ids() {
            self.dispose(receiver);
        }
    }
}

fn spawn_fifo_consumer(
    slot: &Arc<ReceiverSlot>,
    handler: MessageHandler,
    seed: Option<Message>,
    thread_name: &str,
) -> Result<(), AgentError> {
    let slot_ref = slot.clone();
    let thread = std::thread::Builder::new()
        .name(thread_name.to_string())
        .spawn(move || {
            if let Some(message) = seed {
                trace!(receiver = slot_ref.id, message = %message.name, "handling seed delivery");
                slot_ref.deliver(&handler, message);
            }
            loop {
                let next = {
                    let mut state = slot_ref.state.lock();
                    loop {
                        if let Some(message) = state.main.pop_front() {
                            break Some(message);
                        }
                        if state.disposed {
                            break None;
                        }
                        slot_ref.ready.wait(&mut state);
                    }
                };
                match next {
                    Some(message) => slot_ref.deliver(&handler, message),
                    None => return,
                }
            }
        })
        .map_err(|e| AgentError::Script(format!("could not spawn consumer thread: {e}")))?;
    slot.threads.lock().push(thread);
    Ok(())
}

fn spawn_lane_consumer(slot: &Arc<ReceiverSlot>, key: i64) -> Result<(), AgentError> {
    let Some(handler) = slot.handler.lock().clone() else {
        return Err(AgentError::NoSuchReceiver(slot.id));
    };
    let slot_ref = slot.clone();
    let name = format!("{}-q{key}", slot.thread_name.lock());
    let thread = std::thread::Builder::new()
        .name(name)
        .spawn(move || loop {
            let next = {
                let mut state = slot_ref.state.lock();
                loop {
                    if let Some(message) =
                        state.subs.get_mut(&key).and_then(|lane| lane.queue.pop_front())
                    {
                        break Some(message);
                    }
                    if state.disposed {
                        break None;
                    }
                    slot_ref.ready.wait(&mut state);
                }
            };
            match next {
                Some(message) => slot_ref.deliver(&handler, message),
                None => return,
            }
        })
        .map_err(|e| AgentError::Script(format!("could not spawn sub-queue consumer: {e}")))?;
    slot.threads.lock().push(thread);
    Ok(())
}
