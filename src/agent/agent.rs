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

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::agent::descriptor::AgentMessage;
use crate::agent::host::HostCore;
use crate::common::config::AgentConfiguration;
use crate::common::error::AgentError;
use crate::common::registry::IdRegistry;
use crate::message::table::ParamTable;

/// What kind of handler an agent is bound to. Immutable once set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    /// The handler is native code supplied at registration.
    Native,
    /// The handler is a script with named entry points.
    Scripted,
}

/// A named long-lived worker with one handler binding.
///
/// An agent gains its process-unique id when it is started by the
/// host, publishes the messages it accepts through its catalogue, and
/// keeps a configuration table scripts can read and replace. The id is
/// returned to the registry when the agent is dropped.
pub struct Agent {
    name: String,
    kind: AgentKind,
    id: OnceLock<usize>,
    messages: Mutex<BTreeMap<String, AgentMessage>>,
    configuration: AgentConfiguration,
    interrupt: Arc<AtomicBool>,
    replicas: Arc<Mutex<usize>>,
    host: Weak<HostCore>,
    registry: Arc<IdRegistry>,
}

impl Agent {
    pub(crate) fn new(
        name: &str,
        kind: AgentKind,
        host: Weak<HostCore>,
        registry: Arc<IdRegistry>,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind,
            id: OnceLock::new(),
            messages: Mutex::new(BTreeMap::new()),
            configuration: AgentConfiguration::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
            replicas: Arc::new(Mutex::new(0)),
            host,
            registry,
        }
    }

    /// The agent's stable, process-unique name.
    pub fn name(&self) -> String {
        self.name.clone()
    }

    /// Whether the handler is native code or a script.
    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    /// The routing id assigned at start, or `None` before then.
    pub fn id(&self) -> Option<usize> {
        self.id.get().copied()
    }

    pub(crate) fn assign_id(&self) -> usize {
        let id = self.registry.register();
        trace!(agent = %self.name, id, "assigned agent id");
        // start() runs once per agent; a second assignment would leak
        // the first id.
        self.id.set(id).ok();
        id
    }

    /// The agent-local configuration table.
    pub fn configuration(&self) -> &AgentConfiguration {
        &self.configuration
    }

    /// Registers a message this agent accepts.
    ///
    /// `parameter_descriptions` carries one sub-table per expected
    /// parameter; a `default` entry inside a description fills that
    /// parameter when a sender leaves it unset. Native agents reject
    /// duplicate names; for scripted agents a duplicate registration
    /// keeps the first one, which lets replicas re-run registration
    /// harmlessly.
    pub fn add_message(
        &self,
        message_name: &str,
        parameter_descriptions: ParamTable,
        display_name: &str,
        description: &str,
        icon_path: &str,
    ) -> Result<(), AgentError> {
        if message_name.is_empty() {
            return Err(AgentError::Script("empty message name".to_string()));
        }
        let Some(agent_id) = self.id() else {
            return Err(AgentError::Script(format!(
                "agent '{}' must be started before messages are added",
                self.name
            )));
        };

        let mut messages = self.messages.lock();
        if messages.contains_key(message_name) {
            return match self.kind {
                AgentKind::Native => Err(AgentError::DuplicateMessage {
                    agent: self.name.clone(),
                    message: message_name.to_string(),
                }),
                AgentKind::Scripted => Ok(()),
            };
        }

        let display_name =
            if display_name.is_empty() { message_name.to_string() } else { display_name.to_string() };
        let description =
            if description.is_empty() { display_name.clone() } else { description.to_string() };

        messages.insert(
            message_name.to_string(),
            AgentMessage::new(
                agent_id,
                self.kind,
                &self.name,
                message_name,
                parameter_descriptions,
                display_name,
                description,
                icon_path.to_string(),
                self.host.clone(),
            ),
        );
        debug!(agent = %self.name, message = message_name, "registered message");
        Ok(())
    }

    /// Looks up a message of this agent by name.
    pub fn message(&self, message_name: &str) -> Result<AgentMessage, AgentError> {
        self.messages.lock().get(message_name).cloned().ok_or_else(|| {
            AgentError::UnknownMessage { agent: self.name.clone(), message: message_name.to_string() }
        })
    }

    /// The names of every registered message.
    pub fn message_names(&self) -> Vec<String> {
        self.messages.lock().keys().cloned().collect()
    }

    /// Requests cooperative interruption of the agent's scripted
    /// workers: their instruction hook raises an error at its next
    /// poll. Native handlers are not interruptible.
    pub fn interrupt(&self) {
        self.interrupt.store(true, AtomicOrdering::SeqCst);
    }

    pub(crate) fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub(crate) fn replicas(&self) -> Arc<Mutex<usize>> {
        self.replicas.clone()
    }

    /// How many workers currently serve this agent (the primary plus
    /// any replicas).
    pub fn worker_count(&self) -> usize {
        1 + *self.replicas.lock()
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("id", &self.id.get())
            .finish()
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if let Some(id) = self.id.get() {
            trace!(agent = %self.name, id, "deregistering agent id");
            self.registry.deregister(*id);
        }
    }
}
