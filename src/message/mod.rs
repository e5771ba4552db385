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

//! Messages, the parameter-table value domain, its byte codec, and the
//! per-receiver dispatch machinery.

pub mod codec;
pub mod manager;
pub mod table;

pub use manager::{MessageManager, MessageHandler, MessageLogger, Ordering};
pub use table::{ParamTable, Value};

/// One routed unit of work: a message name plus its parameters, bound
/// to a receiver id.
#[derive(Debug, Clone)]
pub struct Message {
    /// The receiver agent's id (the routing key).
    pub agent_id: usize,
    /// The message name; for scripted agents, also the handler
    /// function name.
    pub name: String,
    /// The payload.
    pub parameters: ParamTable,
}

impl Message {
    /// Creates a message bound to a receiver id.
    pub fn new(agent_id: usize, name: impl Into<String>, parameters: ParamTable) -> Self {
        Self { agent_id, name: name.into(), parameters }
    }
}
