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

use std::time::Duration;

use luahive::prelude::*;

mod setup;

/// A scripted agent whose handler busy-works for ~100 ms, measured
/// with the script host's own clock.
const BUSY_SCRIPT: &str = r#"
addmessage("work")
function work(params)
    local started = time()
    while time() - started < 10000000 do end
end
"#;

fn zero_idle_threshold(agent: &Agent) {
    let mut table = agent.configuration().table();
    table.sub_table_mut("internal").set("luaStartNewThreadTime", 0.0f64);
    agent.configuration().set_table(table);
}

/// Replication fan-out.
///
/// **Scenario:**
/// 1. Scripted agent with `luaStartNewThreadTime = 0.0` (always
///    "recently busy") and a ~100 ms handler.
/// 2. Send 5 messages with `threads = 4`.
///
/// **Verification:**
/// - Exactly 4 workers come to exist for the agent id (primary plus
///   3 replicas), and the backlog drains shortly after.
#[test]
fn busy_workers_replicate_to_the_requested_ceiling() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();

    let agent = host.add_scripted_agent_from_code("busy", BUSY_SCRIPT)?;
    zero_idle_threshold(&agent);

    let message = host.get_message("busy", "work")?;
    for _ in 0..5 {
        let mut params = ParamTable::new();
        params.set("threads", 4i64);
        message.send(params)?;
    }

    setup::wait_for("fan-out to 4 workers", Duration::from_secs(3), || agent.worker_count() == 4);
    setup::wait_for("backlog nearly drained", Duration::from_secs(3), || host.in_flight() <= 1);

    host.wait_until_empty();
    assert_eq!(agent.worker_count(), 4, "replicas are not joined until disposal");
    assert_eq!(host.in_flight(), 0);

    host.shutdown_agents();
    Ok(())
}

/// The replica ceiling binds: `threads = 2` never creates more than
/// one replica no matter the backlog.
#[test]
fn replication_respects_the_ceiling() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();

    let agent = host.add_scripted_agent_from_code("capped", BUSY_SCRIPT)?;
    zero_idle_threshold(&agent);

    let message = host.get_message("capped", "work")?;
    for _ in 0..6 {
        let mut params = ParamTable::new();
        params.set("threads", 2i64);
        message.send(params)?;
    }

    host.wait_until_empty();
    assert_eq!(agent.worker_count(), 2);

    host.shutdown_agents();
    Ok(())
}

/// Without a `threads` request the worker never replicates, keeping
/// strict FIFO order on the single consumer.
#[test]
fn no_threads_request_means_no_replication() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();

    let agent = host.add_scripted_agent_from_code("serial", BUSY_SCRIPT)?;
    zero_idle_threshold(&agent);

    let message = host.get_message("serial", "work")?;
    for _ in 0..3 {
        message.send(ParamTable::new())?;
    }

    host.wait_until_empty();
    assert_eq!(agent.worker_count(), 1);

    host.shutdown_agents();
    Ok(())
}

/// `unreplicated = true` suppresses fan-out for that message.
#[test]
fn unreplicated_messages_do_not_fan_out() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();

    let agent = host.add_scripted_agent_from_code("loyal", BUSY_SCRIPT)?;
    zero_idle_threshold(&agent);

    let message = host.get_message("loyal", "work")?;
    for _ in 0..3 {
        let mut params = ParamTable::new();
        params.set("threads", 4i64);
        params.set("unreplicated", true);
        message.send(params)?;
    }

    host.wait_until_empty();
    assert_eq!(agent.worker_count(), 1);

    host.shutdown_agents();
    Ok(())
}

/// Replicas report themselves as replicated to the script, and the
/// first delivery to a replica is the message that triggered it.
#[test]
fn replicas_observe_their_own_state() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();

    let seen = {
        use parking_lot::Mutex;
        use std::sync::Arc;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let agent = host.add_native_agent("collect", move |message| {
            sink.lock().push(message.parameters.clone());
        })?;
        agent.add_message("deliver", ParamTable::new(), "", "", "")?;
        seen
    };

    host.add_scripted_agent_from_code(
        "mirror",
        r#"
        addmessage("work")
        function work(params)
            local started = time()
            while time() - started < 5000000 do end
            send("collect", "deliver", { replicated = isreplicated(), n = params.n })
        end
        "#,
    )?;
    let agent = host.get_agent("mirror").expect("registered");
    zero_idle_threshold(&agent);

    let message = host.get_message("mirror", "work")?;
    for n in 0..4 {
        let mut params = ParamTable::new();
        params.set("threads", 2i64);
        params.set("n", n as i64);
        message.send(params)?;
    }
    host.wait_until_empty();

    let seen = seen.lock();
    assert_eq!(seen.len(), 4, "every message is handled exactly once");
    assert!(
        seen.iter().any(|p| p.get_bool("replicated") == Some(true)),
        "at least the seed delivery runs on a replica"
    );
    assert!(
        seen.iter().any(|p| p.get_bool("replicated") == Some(false)),
        "the primary keeps handling messages too"
    );

    host.shutdown_agents();
    Ok(())
}
