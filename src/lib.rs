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

#![forbid(missing_docs)] // Keep this to enforce coverage

//! # Luahive
//!
//! This crate provides an in-process agent-and-message runtime: a host
//! that owns a set of named long-lived workers ("agents"), each bound
//! to one handler (native code or a Lua script) and delivers named
//! messages with structured parameter payloads between them.
//!
//! ## Key Concepts
//!
//! - **Agents (`Agent`)**: Named workers with a message catalogue and a
//!   per-agent configuration table, registered and started through the
//!   [`AgentHost`](crate::prelude::AgentHost).
//! - **Messaging**: Each receiver id owns ordered queues drained by
//!   dedicated consumer threads; senders never block. The optional
//!   `queue` parameter selects an independently ordered sub-queue.
//! - **Replication**: A scripted worker that is kept busy may spawn
//!   replicas (additional workers on the same receiver) up to the
//!   ceiling the sender requests with the `threads` parameter.
//! - **Reply-to**: A message may carry `reply_to.agent` and
//!   `reply_to.message`; the handler's returned table is then sent on
//!   as that message, annotated with the original message.
//! - **In-flight counter**: Counts messages between enqueue and
//!   handler completion; the shutdown barrier
//!   `wait_until_empty` blocks on it.
//! - **Native call bridge**: Scripts can `import` functions from
//!   shared libraries with a typed signature and call them directly;
//!   see the [`bridge`] module.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use luahive::prelude::*;
//!
//! let host = AgentHost::new();
//! host.add_scripted_agent_from_code(
//!     "echo",
//!     r#"
//!     addmessage("ping")
//!     function ping(params)
//!         return { value = params.value + 1 }
//!     end
//!     "#,
//! )?;
//!
//! let mut params = ParamTable::new();
//! params.set("value", 7i64);
//! host.get_message("echo", "ping")?.send(params)?;
//! host.wait_until_empty();
//! host.shutdown_agents();
//! # Ok::<(), luahive::prelude::AgentError>(())
//! ```

pub(crate) mod agent;
pub(crate) mod common;
pub(crate) mod message;
pub(crate) mod script;

/// The dynamic native call bridge: shared-library resolution and
/// loading, import signatures, and the managed buffer store whose
/// allocations may outlive individual calls.
pub mod bridge;

/// A prelude module for conveniently importing the most commonly used
/// items.
///
/// # Re-exports
///
/// *   [`AgentHost`]: registry of agents and lifecycle coordinator.
/// *   [`Agent`] / [`AgentKind`]: a named worker and its handler kind.
/// *   [`AgentMessage`]: handle for one accepted message; the send path.
/// *   [`Message`]: one routed unit of work.
/// *   [`ParamTable`] / [`Value`]: the recursive payload structure.
/// *   [`MessageManager`] / [`Ordering`]: per-receiver dispatch.
/// *   [`InFlightCounter`]: the shutdown barrier.
/// *   [`IdRegistry`]: compact id allocation.
/// *   [`AgentError`]: the error taxonomy.
/// *   [`serialize`] / [`deserialize`]: the parameter-table byte codec.
/// *   [`RuntimeConfig`]: host-level configuration loaded from TOML.
pub mod prelude {
    pub use crate::agent::{Agent, AgentHost, AgentKind, AgentMessage, NativeHandler};
    pub use crate::common::{
        AgentConfiguration, AgentError, CounterGuard, IdRegistry, InFlightCounter, RuntimeConfig,
    };
    pub use crate::message::codec::{deserialize, serialize};
    pub use crate::message::{
        Message, MessageHandler, MessageLogger, MessageManager, Ordering, ParamTable, Value,
    };
}
