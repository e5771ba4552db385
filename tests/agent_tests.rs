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

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use luahive::prelude::*;

mod setup;

/// Native agent round-trip with parameter defaults.
///
/// **Scenario:**
/// 1. Register message `m` with parameter `x` (no default) and `y`
///    (default 10).
/// 2. Send `{x = 1}`.
///
/// **Verification:**
/// - The handler observes `x = 1` and the defaulted `y = 10`.
#[test]
fn defaults_fill_unset_parameters() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let agent = host.add_native_agent("calc", move |message| {
        sink.lock().push(message.parameters.clone());
    })?;

    let mut descriptions = ParamTable::new();
    descriptions.sub_table_mut("x");
    descriptions.sub_table_mut("y").set("default", 10i64);
    agent.add_message("m", descriptions, "", "", "")?;

    let mut params = ParamTable::new();
    params.set("x", 1i64);
    host.get_message("calc", "m")?.send(params)?;
    host.wait_until_empty();

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].get_int("x"), Some(1));
    assert_eq!(seen[0].get_int("y"), Some(10));

    host.shutdown_agents();
    Ok(())
}

/// Missing parameter: the send fails, nothing is enqueued and the
/// in-flight counter is untouched.
#[test]
fn missing_parameter_rejects_before_counting() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();

    let invocations = Arc::new(AtomicUsize::new(0));
    let sink = invocations.clone();
    let agent = host.add_native_agent("strict", move |_message| {
        sink.fetch_add(1, Ordering::SeqCst);
    })?;

    let mut descriptions = ParamTable::new();
    descriptions.sub_table_mut("x");
    agent.add_message("m", descriptions, "", "", "")?;

    let result = host.get_message("strict", "m")?.send(ParamTable::new());
    assert!(matches!(result, Err(AgentError::MissingParameter { parameter, .. }) if parameter == "x"));
    assert_eq!(host.in_flight(), 0);
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    host.shutdown_agents();
    Ok(())
}

/// Duplicate registrations are construction-time errors with no state
/// change.
#[test]
fn duplicate_agents_and_messages_are_rejected() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();

    let agent = host.add_native_agent("solo", |_message| {})?;
    assert!(matches!(
        host.add_native_agent("solo", |_message| {}),
        Err(AgentError::DuplicateAgent(name)) if name == "solo"
    ));
    assert_eq!(host.agent_count(), 1);

    agent.add_message("once", ParamTable::new(), "", "", "")?;
    assert!(matches!(
        agent.add_message("once", ParamTable::new(), "", "", ""),
        Err(AgentError::DuplicateMessage { message, .. }) if message == "once"
    ));

    host.shutdown_agents();
    Ok(())
}

/// No two live agents ever share an id.
#[test]
fn agent_ids_are_unique_while_live() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();

    let mut agents = Vec::new();
    for n in 0..12 {
        agents.push(host.add_native_agent(&format!("worker-{n}"), |_message| {})?);
    }
    let ids: HashSet<usize> = agents.iter().map(|agent| agent.id().expect("started")).collect();
    assert_eq!(ids.len(), agents.len());

    host.shutdown_agents();
    Ok(())
}

/// Lookups by unknown names surface the dedicated errors.
#[test]
fn unknown_lookups_are_reported() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();
    let agent = host.add_native_agent("known", |_message| {})?;
    agent.add_message("m", ParamTable::new(), "", "", "")?;

    assert!(matches!(host.get_message("ghost", "m"), Err(AgentError::UnknownAgent(name)) if name == "ghost"));
    assert!(matches!(
        host.get_message("known", "phantom"),
        Err(AgentError::UnknownMessage { message, .. }) if message == "phantom"
    ));

    host.shutdown_agents();
    Ok(())
}

/// Sends racing shutdown are dropped with a log line, never raised,
/// and keep the counter invariant.
#[test]
fn sends_after_shutdown_are_dropped() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();
    let agent = host.add_native_agent("latecomer", |_message| {})?;
    agent.add_message("m", ParamTable::new(), "", "", "")?;
    let handle = host.get_message("latecomer", "m")?;

    host.wait_until_empty();
    host.shutdown_agents();

    handle.send(ParamTable::new())?;
    assert_eq!(host.in_flight(), 0);
    host.wait_until_empty();
    Ok(())
}

/// The `queue` parameter selects the sub-queue on the public send
/// path: per-lane send order is preserved for an agent registered with
/// per-sub-queue ordering.
#[test]
fn queue_parameter_orders_sub_queues() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let agent = host.add_native_agent_ordered("sink", luahive::prelude::Ordering::PerSubQueue, move |message| {
        std::thread::sleep(std::time::Duration::from_millis(2));
        sink.lock().push((
            message.parameters.queue_key(),
            message.parameters.get_int("n").unwrap(),
        ));
    })?;
    agent.add_message("work", ParamTable::new(), "", "", "")?;

    let message = host.get_message("sink", "work")?;
    for n in 1..=2 {
        for lane in 1..=2 {
            let mut params = ParamTable::new();
            params.set("queue", lane as i64);
            params.set("n", n as i64);
            message.send(params)?;
        }
    }
    host.wait_until_empty();

    for lane in 1..=2 {
        let order: Vec<i64> =
            seen.lock().iter().filter(|(l, _)| *l == lane).map(|(_, n)| *n).collect();
        assert_eq!(order, vec![1, 2], "lane {lane} must preserve send order");
    }

    host.shutdown_agents();
    Ok(())
}

/// Message metadata defaults follow the registration values.
#[test]
fn descriptor_metadata_defaults() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();
    let agent = host.add_native_agent("meta", |_message| {})?;
    agent.add_message("plain", ParamTable::new(), "", "", "")?;
    agent.add_message("fancy", ParamTable::new(), "Fancy Message", "Does things", "")?;

    let plain = host.get_message("meta", "plain")?;
    assert_eq!(plain.display_name(), "plain");
    assert_eq!(plain.description(), "plain");
    assert_eq!(plain.agent_kind(), AgentKind::Native);

    let fancy = host.get_message("meta", "fancy")?;
    assert_eq!(fancy.display_name(), "Fancy Message");
    assert_eq!(fancy.description(), "Does things");

    host.shutdown_agents();
    Ok(())
}
