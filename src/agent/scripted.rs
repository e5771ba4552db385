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

//! Scripted workers and the replication core.
//!
//! A scripted agent starts with one primary worker holding one
//! interpreter instance. When a message arrives while the worker was
//! recently busy and carries a `threads` ceiling, the worker
//! constructs a replica: a fresh interpreter initialised from the
//! same source, which registers an additional consumer on the same
//! receiver id and handles a stripped clone of the triggering message
//! as its first delivery, bypassing the queue. Replicas are never
//! joined back until the receiver is disposed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use mlua::{HookTriggers, Lua, Value as LuaValue, VmState};
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, trace};

use crate::agent::agent::Agent;
use crate::agent::host::HostCore;
use crate::bridge::{dispatch, library, managed::DelayDeallocation};
use crate::common::CONFIG;
use crate::common::counter::{CounterGuard, InFlightCounter};
use crate::common::error::AgentError;
use crate::message::manager::{MessageHandler, Ordering};
use crate::message::table::ParamTable;
use crate::message::Message;
use crate::script::{convert, extension, ScriptContext};

/// One worker of a scripted agent: an interpreter bound to the agent's
/// source, plus the shared replica bookkeeping.
pub(crate) struct ScriptedWorker {
    lua: Lua,
    ctx: Arc<ScriptContext>,
    code: Option<String>,
    counter: Arc<InFlightCounter>,
    replicas: Arc<Mutex<usize>>,
    time_of_last_message: Option<Instant>,
}

impl ScriptedWorker {
    /// Builds an interpreter for `ctx`, installs the script host
    /// surface and the interrupt hook, pushes any registered globals,
    /// and executes the agent's source. Runs on the calling thread.
    pub(crate) fn new(
        ctx: Arc<ScriptContext>,
        code: Option<String>,
        counter: Arc<InFlightCounter>,
        replicas: Arc<Mutex<usize>>,
    ) -> Result<Self, AgentError> {
        let lua = Lua::new();
        extension::install(&lua, &ctx)?;
        register_sibling_libraries(&ctx.script_path);

        if let Some(core) = ctx.host.upgrade() {
            if let Some(table) = core.predefined_globals(&ctx.agent.name()) {
                for (key, sub) in &table.sub_tables {
                    lua.globals().set(key.to_string(), convert::param_table_to_lua(&lua, sub)?)?;
                }
            }
        }

        let interrupt = ctx.agent.interrupt_flag();
        lua.set_hook(
            HookTriggers {
                every_nth_instruction: Some(CONFIG.limits.hook_instruction_interval),
                ..Default::default()
            },
            move |_lua, _debug| {
                if interrupt.load(std::sync::atomic::Ordering::SeqCst) {
                    Err(mlua::Error::RuntimeError("interrupted".to_string()))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );

        let source = match &code {
            Some(code) => code.clone(),
            None => std::fs::read_to_string(&ctx.script_path).map_err(|e| {
                AgentError::Script(format!(
                    "could not read script '{}': {e}",
                    ctx.script_path.display()
                ))
            })?,
        };
        lua.load(&source).set_name(ctx.script_path.display().to_string()).exec().map_err(|e| {
            AgentError::Script(format!(
                "exception during execution of {}: {e}",
                ctx.script_path.display()
            ))
        })?;

        debug!(
            agent = %ctx.agent.name(),
            script = %ctx.script_path.display(),
            replicated = ctx.is_replica,
            "new scripted worker"
        );

        Ok(Self { lua, ctx, code, counter, replicas, time_of_last_message: None })
    }

    /// Wraps the worker into a message-manager handler. The worker
    /// lives behind a mutex owned by its consumer, so its interpreter
    /// never runs concurrently with itself.
    pub(crate) fn into_handler(self) -> MessageHandler {
        let worker = Mutex::new(self);
        Arc::new(move |message| worker.lock().handle(message))
    }

    fn handle(&mut self, message: Message) {
        let threshold = self.ctx.agent.configuration().idle_threshold();
        // A non-positive threshold pins the worker "recently busy" so
        // fan-out is available from the first message.
        let idle = match self.time_of_last_message {
            None => threshold > 0.0,
            Some(last) => threshold > 0.0 && last.elapsed().as_secs_f64() > threshold,
        };

        let mut handled = false;
        if !idle && !message.parameters.requests_unreplicated() {
            if let Some(requested) = message.parameters.thread_request() {
                handled = self.try_replicate(&message, requested);
            }
        }

        if !handled {
            self.invoke(&message);
        }

        self.time_of_last_message = Some(Instant::now());
    }

    /// Attempts to stand up a replica for `message`. Returns whether
    /// the message was handed off.
    fn try_replicate(&self, message: &Message, requested: i64) -> bool {
        let Some(core) = self.ctx.host.upgrade() else {
            return false;
        };
        let Some(manager) = core.manager() else {
            return false;
        };

        let requested = requested.max(0) as usize;
        let mut count = self.replicas.lock();
        if *count + 1 >= requested {
            trace!(
                agent = %self.ctx.agent.name(),
                message = %message.name,
                "all {requested} replicated workers are busy"
            );
            return false;
        }

        let replica_ctx = Arc::new(ScriptContext {
            agent: self.ctx.agent.clone(),
            host: self.ctx.host.clone(),
            script_path: self.ctx.script_path.clone(),
            is_replica: true,
        });
        let replica = match ScriptedWorker::new(
            replica_ctx,
            self.code.clone(),
            self.counter.clone(),
            self.replicas.clone(),
        ) {
            Ok(replica) => replica,
            Err(error) => {
                error!(agent = %self.ctx.agent.name(), "could not replicate: {error}");
                return false;
            }
        };

        let mut seed = message.clone();
        seed.parameters.strip_thread_request();

        let thread_name = format!("rl-{}", self.ctx.agent.name());
        if let Err(error) = manager.add_handler(
            message.agent_id,
            replica.into_handler(),
            &thread_name,
            Ordering::Fifo,
            Some(seed),
        ) {
            error!(agent = %self.ctx.agent.name(), "could not add replica handler: {error}");
            return false;
        }
        *count += 1;

        if self.ctx.agent.configuration().log_replication() {
            let subject = if *count == 1 {
                format!("Agent '{}' is", self.ctx.agent.name())
            } else {
                format!("All agents '{}' are", self.ctx.agent.name())
            };
            info!(
                "{subject} busy => replicating to {} threads to process incoming message '{}' (script '{}')",
                *count + 1,
                message.name,
                self.ctx.script_path.display()
            );
        }
        true
    }

    /// Runs the script function named after the message, then composes
    /// the automatic reply when one was requested. Exactly one counter
    /// decrement happens per delivered message, via the guard.
    #[instrument(skip(self, message), fields(agent = %self.ctx.agent.name(), message = %message.name))]
    fn invoke(&self, message: &Message) {
        let _pending = CounterGuard::new(self.counter.clone());
        let _delay = DelayDeallocation::new();

        let outcome = self.call_script_function(message);
        // Imports are scoped to one invocation; dropping them releases
        // the library references taken during the call.
        dispatch::reset_imported();

        let result = match outcome {
            Ok(result) => result,
            Err(error) => {
                error!("handler failed: {error}");
                return;
            }
        };

        if let Some(reported) = result.as_ref().and_then(|table| table.get_str("error")) {
            error!("script reported error: {reported}");
            return;
        }

        let (Some(reply_agent), Some(reply_message)) =
            (message.parameters.reply_to_agent(), message.parameters.reply_to_message())
        else {
            return;
        };

        let mut reply = result.unwrap_or_default();
        reply.set_original_message(&message.name, &message.parameters);
        if let Some(merge) = message.parameters.merge_table() {
            if let Err(error) = reply.merge_from(&merge) {
                error!("reply dropped: {error}");
                return;
            }
        }

        let Some(core) = self.ctx.host.upgrade() else {
            return;
        };
        match core.get_message(&reply_agent, &reply_message) {
            Ok(agent_message) => {
                if let Err(error) = agent_message.send(reply) {
                    error!("could not send reply '{reply_message}' to '{reply_agent}': {error}");
                }
            }
            Err(error) => error!("dropping reply: {error}"),
        }
    }

    fn call_script_function(&self, message: &Message) -> Result<Option<ParamTable>, AgentError> {
        let function: mlua::Function =
            self.lua.globals().get(message.name.as_str()).map_err(|_| {
                AgentError::Script(format!(
                    "script of agent '{}' does not define function '{}'",
                    self.ctx.agent.name(),
                    message.name
                ))
            })?;
        let parameters = convert::param_table_to_lua(&self.lua, &message.parameters)?;
        let result: LuaValue = function.call(parameters)?;
        match result {
            LuaValue::Table(table) => Ok(Some(convert::lua_table_to_param(&table)?)),
            _ => Ok(None),
        }
    }
}

/// Records every shared library that sits next to the worker's script
/// so `import` can resolve them by bare name from any agent, with the
/// folder-name disambiguation applying when several script directories
/// provide the same file.
fn register_sibling_libraries(script_path: &Path) {
    let Some(directory) = script_path.parent() else {
        return;
    };
    let Ok(entries) = std::fs::read_dir(directory) else {
        return;
    };
    let extension = if cfg!(target_os = "windows") {
        "dll"
    } else if cfg!(target_os = "macos") {
        "dylib"
    } else {
        "so"
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        if let Some(file_name) = path.file_name().and_then(|f| f.to_str()) {
            library::register_library_dir(file_name, directory);
        }
    }
}

/// Builds the primary worker for a freshly registered scripted agent
/// and installs it as the consumer for the agent's id.
pub(crate) fn start_primary(
    core: &Arc<HostCore>,
    agent: &Arc<Agent>,
    script_path: PathBuf,
    code: Option<String>,
) -> Result<(), AgentError> {
    let Some(manager) = core.manager() else {
        info!("did not start scripted agent '{}' because shutdown had been initiated", agent.name());
        return Err(AgentError::ShutdownInProgress);
    };
    let Some(agent_id) = agent.id() else {
        return Err(AgentError::Script(format!("agent '{}' has no id", agent.name())));
    };

    let ctx = Arc::new(ScriptContext {
        agent: agent.clone(),
        host: Arc::downgrade(core),
        script_path,
        is_replica: false,
    });
    let stem = ctx
        .script_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| agent.name());
    let worker = ScriptedWorker::new(ctx, code, core.counter().clone(), agent.replicas())?;

    manager.add_handler(agent_id, worker.into_handler(), &format!("l-{stem}"), Ordering::Fifo, None)?;

    if agent.configuration().log_messages() {
        manager.set_logger(agent_id, crate::agent::host::message_logger())?;
    }
    Ok(())
}
