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

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument};

use crate::agent::agent::{Agent, AgentKind};
use crate::agent::descriptor::AgentMessage;
use crate::agent::{native, scripted};
use crate::common::counter::InFlightCounter;
use crate::common::error::AgentError;
use crate::common::registry::IdRegistry;
use crate::message::manager::{MessageLogger, MessageManager, Ordering};
use crate::message::table::ParamTable;
use crate::message::Message;

/// The shared internals behind an [`AgentHost`]: the registry of
/// agents by name, the message manager, the in-flight counter and the
/// id allocator.
pub(crate) struct HostCore {
    agents: DashMap<String, Arc<Agent>>,
    manager: RwLock<Option<Arc<MessageManager>>>,
    counter: Arc<InFlightCounter>,
    registry: Arc<IdRegistry>,
    predefined: Mutex<HashMap<String, ParamTable>>,
}

impl HostCore {
    fn new() -> Self {
        Self {
            agents: DashMap::new(),
            manager: RwLock::new(Some(Arc::new(MessageManager::new()))),
            counter: Arc::new(InFlightCounter::new()),
            registry: Arc::new(IdRegistry::new()),
            predefined: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn manager(&self) -> Option<Arc<MessageManager>> {
        self.manager.read().clone()
    }

    pub(crate) fn counter(&self) -> &Arc<InFlightCounter> {
        &self.counter
    }

    pub(crate) fn predefined_globals(&self, agent_name: &str) -> Option<ParamTable> {
        self.predefined.lock().get(agent_name).cloned()
    }

    /// Resolves a message handle by agent and message name.
    pub(crate) fn get_message(
        &self,
        agent_name: &str,
        message_name: &str,
    ) -> Result<AgentMessage, AgentError> {
        let Some(agent) = self.agents.get(agent_name) else {
            return Err(AgentError::UnknownAgent(agent_name.to_string()));
        };
        agent.message(message_name)
    }

    fn register_agent(
        self: &Arc<Self>,
        name: &str,
        kind: AgentKind,
        predefined: Option<ParamTable>,
    ) -> Result<Arc<Agent>, AgentError> {
        if self.agents.contains_key(name) {
            return Err(AgentError::DuplicateAgent(name.to_string()));
        }
        let agent =
            Arc::new(Agent::new(name, kind, Arc::downgrade(self), self.registry.clone()));
        self.agents.insert(name.to_string(), agent.clone());
        if let Some(table) = predefined {
            self.predefined.lock().insert(name.to_string(), table);
        }
        Ok(agent)
    }

    fn unregister_agent(&self, name: &str) {
        self.agents.remove(name);
        self.predefined.lock().remove(name);
    }

    /// Creates and starts a scripted agent from inline code; used by
    /// the `addagent` script function, which passes its own script
    /// path as the location context for the new agent.
    pub(crate) fn add_scripted_code(
        self: &Arc<Self>,
        name: &str,
        script_path: PathBuf,
        code: String,
    ) -> Result<Arc<Agent>, AgentError> {
        self.start_scripted(name, script_path, Some(code), None)
    }

    pub(crate) fn start_scripted(
        self: &Arc<Self>,
        name: &str,
        script_path: PathBuf,
        code: Option<String>,
        predefined: Option<ParamTable>,
    ) -> Result<Arc<Agent>, AgentError> {
        let agent = self.register_agent(name, AgentKind::Scripted, predefined)?;
        let id = agent.assign_id();
        debug!(agent = name, id, script = %script_path.display(), "starting scripted agent");
        if let Err(error) = scripted::start_primary(self, &agent, script_path, code) {
            self.unregister_agent(name);
            return Err(error);
        }
        Ok(agent)
    }

    pub(crate) fn start_native(
        self: &Arc<Self>,
        name: &str,
        ordering: Ordering,
        handler: native::NativeHandler,
        predefined: Option<ParamTable>,
    ) -> Result<Arc<Agent>, AgentError> {
        let agent = self.register_agent(name, AgentKind::Native, predefined)?;
        let id = agent.assign_id();
        debug!(agent = name, id, "starting native agent");

        let Some(manager) = self.manager() else {
            self.unregister_agent(name);
            info!("did not start native agent '{name}' because shutdown had been initiated");
            return Err(AgentError::ShutdownInProgress);
        };
        if let Err(error) = manager.add_handler(
            id,
            native::wrap(self.counter.clone(), handler),
            &format!("h-{name}"),
            ordering,
            None,
        ) {
            self.unregister_agent(name);
            return Err(error);
        }
        if agent.configuration().log_messages() {
            manager.set_logger(id, message_logger())?;
        }
        Ok(agent)
    }
}

/// The logger installed for agents with `logMessages` enabled.
pub(crate) fn message_logger() -> MessageLogger {
    Arc::new(|receiver, message: &Message, sending| {
        info!(
            "Message {} to handler {receiver} was {} with parameters\n{}",
            message.name,
            if sending { "sent" } else { "received" },
            message.parameters
        );
    })
}

/// The registry of agents by name and the coordinator of the runtime's
/// lifecycle.
///
/// The host owns the message manager, the in-flight counter and the id
/// allocator. Agents are created through it, senders resolve
/// [`AgentMessage`] handles through it, and shutdown runs through it:
/// stop sending, [`wait_until_empty`](AgentHost::wait_until_empty),
/// then [`shutdown_agents`](AgentHost::shutdown_agents).
#[derive(Clone)]
pub struct AgentHost {
    core: Arc<HostCore>,
}

impl Default for AgentHost {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentHost {
    /// Creates a runtime with no agents.
    pub fn new() -> Self {
        Self { core: Arc::new(HostCore::new()) }
    }

    /// Registers and starts a native agent with FIFO dispatch.
    ///
    /// Fails with [`AgentError::DuplicateAgent`] when the name is
    /// taken. Messages the agent accepts are registered afterwards via
    /// [`Agent::add_message`].
    pub fn add_native_agent(
        &self,
        name: &str,
        handler: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<Arc<Agent>, AgentError> {
        self.core.start_native(name, Ordering::Fifo, Arc::new(handler), None)
    }

    /// Registers and starts a native agent with an explicit queue
    /// ordering mode.
    pub fn add_native_agent_ordered(
        &self,
        name: &str,
        ordering: Ordering,
        handler: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<Arc<Agent>, AgentError> {
        self.core.start_native(name, ordering, Arc::new(handler), None)
    }

    /// Registers and starts a scripted agent from a script file. The
    /// script's top level runs before this returns, so messages it
    /// registers via `addmessage` are immediately resolvable.
    pub fn add_scripted_agent(
        &self,
        name: &str,
        script_file: impl AsRef<Path>,
    ) -> Result<Arc<Agent>, AgentError> {
        self.core.start_scripted(name, script_file.as_ref().to_path_buf(), None, None)
    }

    /// Registers and starts a scripted agent from inline code.
    pub fn add_scripted_agent_from_code(
        &self,
        name: &str,
        code: &str,
    ) -> Result<Arc<Agent>, AgentError> {
        self.core.start_scripted(
            name,
            PathBuf::from(format!("{name}.lua")),
            Some(code.to_string()),
            None,
        )
    }

    /// Registers and starts a scripted agent from inline code, making
    /// each sub-table of `globals` available to the script as a global
    /// of the same name (in every worker, replicas included).
    pub fn add_scripted_agent_with_globals(
        &self,
        name: &str,
        code: &str,
        globals: ParamTable,
    ) -> Result<Arc<Agent>, AgentError> {
        self.core.start_scripted(
            name,
            PathBuf::from(format!("{name}.lua")),
            Some(code.to_string()),
            Some(globals),
        )
    }

    /// Looks up an agent by name.
    pub fn get_agent(&self, name: &str) -> Option<Arc<Agent>> {
        self.core.agents.get(name).map(|entry| entry.value().clone())
    }

    /// Resolves a message handle by agent and message name.
    pub fn get_message(
        &self,
        agent_name: &str,
        message_name: &str,
    ) -> Result<AgentMessage, AgentError> {
        self.core.get_message(agent_name, message_name)
    }

    /// Number of registered agents.
    pub fn agent_count(&self) -> usize {
        self.core.agents.len()
    }

    /// Snapshot of the in-flight message count.
    pub fn in_flight(&self) -> i64 {
        self.core.counter.size()
    }

    /// Blocks until at least one message has ever been sent.
    pub fn wait_until_first(&self) {
        self.core.counter.wait_until_first();
    }

    /// Blocks until no message is queued or being handled.
    pub fn wait_until_empty(&self) {
        info!("waiting until message queue is empty");
        self.core.counter.wait_until_empty();
        info!("detected empty message queue");
    }

    /// Shuts the runtime down: every receiver is disposed (remaining
    /// messages drain through their handlers), consumer threads are
    /// joined, agents are dropped from the registry, and registered
    /// script globals are cleared. Sends that race this log and drop.
    ///
    /// Call [`wait_until_empty`](AgentHost::wait_until_empty) first
    /// for an orderly drain; must not be called from a handler.
    #[instrument(skip(self))]
    pub fn shutdown_agents(&self) {
        let manager = self.core.manager.write().take();
        drop(manager);
        info!("detected destruction of all agent threads");
        self.core.agents.clear();
        self.core.predefined.lock().clear();
    }
}

impl std::fmt::Debug for AgentHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHost").field("agents", &self.core.agents.len()).finish()
    }
}
