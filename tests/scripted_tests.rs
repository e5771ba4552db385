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

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use luahive::prelude::*;

mod setup;

fn collector(host: &AgentHost, name: &str) -> anyhow::Result<Arc<Mutex<Vec<ParamTable>>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let agent = host.add_native_agent(name, move |message| {
        sink.lock().push(message.parameters.clone());
    })?;
    agent.add_message("deliver", ParamTable::new(), "", "", "")?;
    Ok(seen)
}

/// Round-trip reply (the ping/pong contract).
///
/// **Scenario:**
/// 1. Scripted `echo` registers `ping` returning `{value = value + 1}`.
/// 2. A native `pinger` accepts `pong`.
/// 3. Send `ping` with `value = 7` and `reply_to = {agent = "pinger",
///    message = "pong"}`.
///
/// **Verification:**
/// - `pinger.pong` runs exactly once with `value = 8` and
///   `original_message.parameters.value = 7`.
#[test]
fn reply_round_trip() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let pinger = host.add_native_agent("pinger", move |message| {
        sink.lock().push(message.parameters.clone());
    })?;
    pinger.add_message("pong", ParamTable::new(), "", "", "")?;

    host.add_scripted_agent_from_code(
        "echo",
        r#"
        addmessage("ping")
        function ping(params)
            return { value = params.value + 1 }
        end
        "#,
    )?;

    let mut params = ParamTable::new();
    params.set("value", 7i64);
    params.set_reply_to("pinger", "pong");
    host.get_message("echo", "ping")?.send(params)?;
    host.wait_until_empty();

    let seen = seen.lock();
    assert_eq!(seen.len(), 1, "pong must be invoked exactly once");
    assert_eq!(seen[0].get_int("value"), Some(8));
    assert_eq!(seen[0].original_message_name().as_deref(), Some("ping"));
    assert_eq!(seen[0].original_message_parameters().unwrap().get_int("value"), Some(7));

    host.shutdown_agents();
    Ok(())
}

/// The scripted `send` helper defaults `reply_to.agent` to the sending
/// agent's own name, enabling request/response without stating one's
/// identity.
#[test]
fn script_send_defaults_reply_agent_to_self() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();
    let seen = collector(&host, "collect")?;

    host.add_scripted_agent_from_code(
        "responder",
        r#"
        addmessage("double")
        function double(params)
            return { value = params.value * 2 }
        end
        "#,
    )?;

    host.add_scripted_agent_from_code(
        "caller",
        r#"
        addmessage("kick")
        addmessage("pong")
        function kick(params)
            send("responder", "double", { value = 21, reply_to = { message = "pong" } })
        end
        function pong(params)
            send("collect", "deliver", { value = params.value })
        end
        "#,
    )?;

    host.get_message("caller", "kick")?.send(ParamTable::new())?;
    host.wait_until_empty();

    let seen = seen.lock();
    assert_eq!(seen.len(), 1, "the reply must come back to the caller");
    assert_eq!(seen[0].get_int("value"), Some(42));

    host.shutdown_agents();
    Ok(())
}

/// `reply_to.merge` is merged into the reply payload, winning scalar
/// conflicts.
#[test]
fn reply_merge_table_is_applied() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();
    let seen = collector(&host, "collect")?;

    host.add_scripted_agent_from_code(
        "worker",
        r#"
        addmessage("job")
        function job(params)
            return { result = 5, tag = "from-handler" }
        end
        "#,
    )?;

    host.add_scripted_agent_from_code(
        "relay",
        r#"
        addmessage("answer")
        function answer(params)
            send("collect", "deliver", { result = params.result, tag = params.tag, extra = params.extra })
        end
        "#,
    )?;

    let mut params = ParamTable::new();
    params.set_reply_to("relay", "answer");
    let merge = {
        let mut merge = ParamTable::new();
        merge.set("tag", "from-merge");
        merge.set("extra", true);
        merge
    };
    params.sub_table_mut("reply_to").set_sub_table("merge", merge);
    host.get_message("worker", "job")?.send(params)?;
    host.wait_until_empty();

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].get_int("result"), Some(5));
    assert_eq!(seen[0].get_str("tag"), Some("from-merge"), "the merge table wins conflicts");
    assert_eq!(seen[0].get_bool("extra"), Some(true));

    host.shutdown_agents();
    Ok(())
}

/// A handler that returns `{error = ...}` suppresses its reply but
/// does not disturb the dispatcher.
#[test]
fn script_errors_suppress_the_reply() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();
    let seen = collector(&host, "collect")?;

    host.add_scripted_agent_from_code(
        "flaky",
        r#"
        addmessage("work")
        function work(params)
            if params.fail then
                return { error = "requested failure" }
            end
            return { ok = true }
        end
        "#,
    )?;

    let mut failing = ParamTable::new();
    failing.set("fail", true);
    failing.set_reply_to("collect", "deliver");
    host.get_message("flaky", "work")?.send(failing)?;

    let mut fine = ParamTable::new();
    fine.set_reply_to("collect", "deliver");
    host.get_message("flaky", "work")?.send(fine)?;
    host.wait_until_empty();

    let seen = seen.lock();
    assert_eq!(seen.len(), 1, "only the successful handler may reply");
    assert_eq!(seen[0].get_bool("ok"), Some(true));

    host.shutdown_agents();
    Ok(())
}

/// `addagent` from inside a script creates a reachable scripted agent
/// with the listed messages.
#[test]
fn scripts_can_add_agents() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();
    let seen = collector(&host, "collect")?;

    host.add_scripted_agent_from_code(
        "parent",
        r#"
        addagent("child", [[
            function task(params)
                send("collect", "deliver", { value = 5 })
            end
        ]], { "task" })
        "#,
    )?;

    assert!(host.get_agent("child").is_some());
    host.get_message("child", "task")?.send(ParamTable::new())?;
    host.wait_until_empty();

    assert_eq!(seen.lock().len(), 1);
    assert_eq!(seen.lock()[0].get_int("value"), Some(5));

    host.shutdown_agents();
    Ok(())
}

/// `getconfig`/`setconfig` read and replace the agent's configuration
/// table, including the runtime-interpreted internal values.
#[test]
fn scripts_can_reconfigure_their_agent() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();

    let agent = host.add_scripted_agent_from_code(
        "tunable",
        r#"
        addmessage("tune")
        function tune(params)
            local c = getconfig()
            c.internal.luaStartNewThreadTime = 0.25
            c.custom = { answer = 42 }
            setconfig(c)
        end
        "#,
    )?;

    host.get_message("tunable", "tune")?.send(ParamTable::new())?;
    host.wait_until_empty();

    assert!((agent.configuration().idle_threshold() - 0.25).abs() < f64::EPSILON);
    let custom = agent.configuration().table().sub_table("custom").cloned().unwrap();
    assert_eq!(custom.get_int("answer"), Some(42));

    host.shutdown_agents();
    Ok(())
}

/// The primary worker is not a replica, and `time()` ticks in 10⁻⁸ s
/// units.
#[test]
fn environment_probes_answer() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();
    let seen = collector(&host, "collect")?;

    host.add_scripted_agent_from_code(
        "probe",
        r#"
        addmessage("ask")
        function ask(params)
            send("collect", "deliver", {
                replicated = isreplicated(),
                cores = cores(),
                stamp = time(),
            })
        end
        "#,
    )?;

    host.get_message("probe", "ask")?.send(ParamTable::new())?;
    host.wait_until_empty();

    let seen = seen.lock();
    assert_eq!(seen[0].get_bool("replicated"), Some(false));
    assert!(seen[0].get_int("cores").unwrap() >= 1);
    // 2020-01-01 in 10^-8 s units.
    assert!(seen[0].get_int("stamp").unwrap() > 157_766_400_000_000_000);

    host.shutdown_agents();
    Ok(())
}

/// Drain on shutdown: a large backlog is fully handled by
/// `wait_until_empty`, and `shutdown_agents` returns with every queue
/// empty.
#[test]
fn drain_on_shutdown() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();

    let handled = Arc::new(AtomicUsize::new(0));
    let sink = handled.clone();
    let tally = host.add_native_agent("tally", move |_message| {
        sink.fetch_add(1, Ordering::SeqCst);
    })?;
    tally.add_message("deliver", ParamTable::new(), "", "", "")?;

    host.add_scripted_agent_from_code(
        "forwarder",
        r#"
        addmessage("consume")
        function consume(params)
            send("tally", "deliver", {})
        end
        "#,
    )?;

    let message = host.get_message("forwarder", "consume")?;
    for _ in 0..1000 {
        message.send(ParamTable::new())?;
    }
    host.wait_until_empty();
    assert_eq!(handled.load(Ordering::SeqCst), 1000);
    assert_eq!(host.in_flight(), 0);

    host.shutdown_agents();
    assert_eq!(host.in_flight(), 0);
    Ok(())
}

/// Cooperative interruption: a wedged script is aborted by the
/// instruction hook once the agent is interrupted, releasing
/// `wait_until_empty`.
#[test]
fn interrupt_releases_a_wedged_worker() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();

    let agent = host.add_scripted_agent_from_code(
        "spinner",
        r#"
        addmessage("spin")
        function spin(params)
            while true do end
        end
        "#,
    )?;

    host.get_message("spinner", "spin")?.send(ParamTable::new())?;
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(host.in_flight(), 1, "the worker must be wedged");

    agent.interrupt();
    host.wait_until_empty();
    host.shutdown_agents();
    Ok(())
}

/// Shared libraries sitting next to a script file are recorded for
/// import resolution when the script loads, so other agents can
/// resolve them by bare name.
#[test]
fn sibling_libraries_are_registered_at_load() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let dir = tempfile::tempdir()?;
    let lib_name = if cfg!(target_os = "windows") {
        "sibling.dll"
    } else if cfg!(target_os = "macos") {
        "libsibling.dylib"
    } else {
        "libsibling.so"
    };
    std::fs::write(dir.path().join(lib_name), b"stub")?;
    let script = dir.path().join("loader.lua");
    std::fs::write(
        &script,
        r#"
        addmessage("noop")
        function noop(params) end
        "#,
    )?;

    let host = AgentHost::new();
    host.add_scripted_agent("loader", &script)?;

    let resolved = luahive::bridge::library::resolve("sibling", None)?;
    assert_eq!(resolved, dir.path().join(lib_name));

    host.shutdown_agents();
    Ok(())
}

/// Registered globals are visible to the script in every worker.
#[test]
fn predefined_globals_reach_the_script() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();
    let seen = collector(&host, "collect")?;

    let mut globals = ParamTable::new();
    globals.sub_table_mut("settings").set("limit", 99i64);

    host.add_scripted_agent_with_globals(
        "preloaded",
        r#"
        addmessage("read")
        function read(params)
            send("collect", "deliver", { limit = settings.limit })
        end
        "#,
        globals,
    )?;

    host.get_message("preloaded", "read")?.send(ParamTable::new())?;
    host.wait_until_empty();

    assert_eq!(seen.lock()[0].get_int("limit"), Some(99));
    host.shutdown_agents();
    Ok(())
}
