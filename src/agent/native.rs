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

//! Native agent dispatch.
//!
//! A native agent binds a plain function over messages. The message
//! manager drives it as a FIFO consumer (or one consumer per sub-queue
//! lane); there is no replication and no interruption. The dispatcher
//! wraps every call so the in-flight counter is decremented exactly
//! once per delivered message, panics included.

use std::sync::Arc;

use crate::common::counter::{CounterGuard, InFlightCounter};
use crate::message::manager::MessageHandler;
use crate::message::Message;

/// The handler type bound by native agents.
pub type NativeHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Wraps a native handler with the counter pairing.
pub(crate) fn wrap(counter: Arc<InFlightCounter>, handler: NativeHandler) -> MessageHandler {
    Arc::new(move |message| {
        let _pending = CounterGuard::new(counter.clone());
        handler(message);
    })
}
