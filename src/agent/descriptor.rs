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

use std::sync::Weak;

use tracing::{info, instrument, warn};

use crate::agent::agent::AgentKind;
use crate::agent::host::HostCore;
use crate::common::error::AgentError;
use crate::message::table::ParamTable;
use crate::message::Message;

/// Describes one accepted message of an agent and is the handle
/// through which senders submit it.
///
/// The descriptor is cheap to clone and remains addressable by the
/// `agent_id` routing key even while the owning agent object is
/// elsewhere. Sending applies parameter defaults, validates the
/// described parameters, and enqueues through the message manager.
#[derive(Clone)]
pub struct AgentMessage {
    agent_id: usize,
    agent_kind: AgentKind,
    agent_name: String,
    message_name: String,
    parameter_descriptions: ParamTable,
    display_name: String,
    description: String,
    icon_path: String,
    host: Weak<HostCore>,
}

impl AgentMessage {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        agent_id: usize,
        agent_kind: AgentKind,
        agent_name: &str,
        message_name: &str,
        parameter_descriptions: ParamTable,
        display_name: String,
        description: String,
        icon_path: String,
        host: Weak<HostCore>,
    ) -> Self {
        Self {
            agent_id,
            agent_kind,
            agent_name: agent_name.to_string(),
            message_name: message_name.to_string(),
            parameter_descriptions,
            display_name,
            description,
            icon_path,
            host,
        }
    }

    /// The receiving agent's routing id.
    pub fn agent_id(&self) -> usize {
        self.agent_id
    }

    /// The receiving agent's kind.
    pub fn agent_kind(&self) -> AgentKind {
        self.agent_kind
    }

    /// The receiving agent's name.
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// The message name.
    pub fn message_name(&self) -> &str {
        &self.message_name
    }

    /// The display name, defaulting to the message name.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// The human-readable description, defaulting to the display name.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The optional icon path supplied at registration.
    pub fn icon_path(&self) -> &str {
        &self.icon_path
    }

    /// The per-parameter descriptions supplied at registration.
    pub fn parameter_descriptions(&self) -> &ParamTable {
        &self.parameter_descriptions
    }

    /// Copies `default` entries from the parameter descriptions into
    /// any parameter the sender left unset.
    pub fn add_default_parameter_values(&self, parameter_values: &ParamTable) -> ParamTable {
        let mut result = parameter_values.clone();
        for (parameter, description) in &self.parameter_descriptions.sub_tables {
            if !result.data.contains_key(parameter) {
                if let Some(default) = description.get_value("default") {
                    result.data.insert(parameter.clone(), default.clone());
                }
            }
            if !result.sub_tables.contains_key(parameter) {
                if let Some(default) = description.sub_table("default") {
                    result.sub_tables.insert(parameter.clone(), default.clone());
                }
            }
        }
        result
    }

    /// Verifies that every described parameter is present.
    pub fn validate(&self, parameter_values: &ParamTable) -> Result<(), AgentError> {
        for parameter in self.parameter_descriptions.sub_tables.keys() {
            if !parameter_values.data.contains_key(parameter)
                && !parameter_values.sub_tables.contains_key(parameter)
            {
                return Err(AgentError::MissingParameter {
                    message: self.display_name.clone(),
                    parameter: parameter.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Sends this message with the given parameters.
    ///
    /// Defaults are applied and the described parameters validated
    /// first; a [`MissingParameter`](AgentError::MissingParameter)
    /// failure leaves the in-flight counter untouched. After
    /// validation the counter is incremented and the message submitted
    /// with its `queue` value as the sub-queue key. A receiver that
    /// disappeared or a runtime that is shutting down drops the
    /// message with a log line and keeps the counter invariant by
    /// decrementing again.
    #[instrument(skip(self, parameter_values), fields(agent = %self.agent_name, message = %self.message_name))]
    pub fn send(&self, parameter_values: ParamTable) -> Result<(), AgentError> {
        let parameters = self.add_default_parameter_values(&parameter_values);
        self.validate(&parameters)?;

        let Some(core) = self.host.upgrade() else {
            info!("skipped message '{}' because shutdown had been initiated", self.message_name);
            return Ok(());
        };

        core.counter().increase();

        let Some(manager) = core.manager() else {
            info!("skipped message '{}' because shutdown had been initiated", self.message_name);
            core.counter().decrease();
            return Ok(());
        };

        let sub_queue = parameters.queue_key();
        let message = Message::new(self.agent_id, self.message_name.clone(), parameters);
        match manager.send_message(self.agent_id, message, sub_queue) {
            Ok(()) => Ok(()),
            Err(error) => {
                warn!(
                    "dropping message '{}' for agent '{}': {error}",
                    self.message_name, self.agent_name
                );
                core.counter().decrease();
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for AgentMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentMessage")
            .field("agent_id", &self.agent_id)
            .field("agent_name", &self.agent_name)
            .field("message_name", &self.message_name)
            .finish()
    }
}
