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

/// Represents errors that can occur while registering agents, sending
/// messages, composing replies, or binding native functions.
///
/// Construction-time programmer errors (duplicate names, bad signatures)
/// are surfaced to the caller; runtime delivery failures are handled
/// locally by the dispatch machinery, which logs them and keeps going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// A described parameter was still absent after defaults were applied.
    MissingParameter {
        /// The message whose send was rejected.
        message: String,
        /// The parameter that was neither supplied nor defaulted.
        parameter: String,
    },
    /// A message was submitted for a receiver id that is unknown or has
    /// been disposed.
    NoSuchReceiver(usize),
    /// A lookup by agent name failed.
    UnknownAgent(String),
    /// A lookup by message name failed for an existing agent.
    UnknownMessage {
        /// The agent that was asked.
        agent: String,
        /// The message name it does not know.
        message: String,
    },
    /// An agent with this name is already registered.
    DuplicateAgent(String),
    /// A native agent already accepts a message with this name.
    DuplicateMessage {
        /// The agent the message was added to.
        agent: String,
        /// The duplicated message name.
        message: String,
    },
    /// More than one registered directory plausibly provides the
    /// requested shared library.
    AmbiguousLibrary(String),
    /// The import signature is outside the supported closed set.
    UnsupportedSignature(String),
    /// A reply merge hit a scalar/sub-table collision at the same key.
    MergeConflict(String),
    /// The runtime is shutting down; the message was dropped.
    ShutdownInProgress,
    /// A script-host, I/O or loader failure, carried with context.
    Script(String),
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentError::MissingParameter { message, parameter } => {
                write!(f, "message '{message}': missing parameter value for {parameter}")
            }
            AgentError::NoSuchReceiver(id) => {
                write!(f, "no such receiver: {id} (unknown or disposed)")
            }
            AgentError::UnknownAgent(name) => write!(f, "unknown agent '{name}'"),
            AgentError::UnknownMessage { agent, message } => {
                write!(f, "message '{message}' is unknown in agent '{agent}'")
            }
            AgentError::DuplicateAgent(name) => write!(f, "agent '{name}' already exists"),
            AgentError::DuplicateMessage { agent, message } => {
                write!(f, "agent '{agent}' already accepts message '{message}'")
            }
            AgentError::AmbiguousLibrary(name) => {
                write!(f, "ambiguous path to shared library '{name}'")
            }
            AgentError::UnsupportedSignature(signature) => {
                write!(f, "unsupported signature '{signature}'")
            }
            AgentError::MergeConflict(key) => {
                write!(f, "cannot merge table with non-table value at key {key}")
            }
            AgentError::ShutdownInProgress => write!(f, "shutdown is in progress"),
            AgentError::Script(context) => write!(f, "{context}"),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<mlua::Error> for AgentError {
    fn from(value: mlua::Error) -> Self {
        AgentError::Script(value.to_string())
    }
}

impl From<std::io::Error> for AgentError {
    fn from(value: std::io::Error) -> Self {
        AgentError::Script(value.to_string())
    }
}

impl From<libloading::Error> for AgentError {
    fn from(value: libloading::Error) -> Self {
        AgentError::Script(value.to_string())
    }
}
