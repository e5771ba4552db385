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

use luahive::prelude::*;

mod setup;

/// Concurrent senders against one native agent: after
/// `wait_until_empty` returns with no further sends, the counter is
/// zero and every message was handled exactly once.
///
/// **Scenario:**
/// 1. Start a native agent counting its invocations.
/// 2. Fire 8 sender threads × 50 messages each.
/// 3. `wait_until_empty`.
///
/// **Verification:**
/// - 400 handler invocations, in-flight count back at zero.
#[test]
fn counter_returns_to_zero_after_concurrent_sends() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();

    let handled = Arc::new(AtomicUsize::new(0));
    let observed = handled.clone();
    let agent = host.add_native_agent("tally", move |_message| {
        observed.fetch_add(1, Ordering::SeqCst);
    })?;
    agent.add_message("bump", ParamTable::new(), "", "", "")?;

    let mut senders = Vec::new();
    for _ in 0..8 {
        let message = host.get_message("tally", "bump")?;
        senders.push(std::thread::spawn(move || {
            for _ in 0..50 {
                message.send(ParamTable::new()).expect("send must succeed");
            }
        }));
    }
    for sender in senders {
        sender.join().expect("sender thread must not panic");
    }

    host.wait_until_empty();
    assert_eq!(handled.load(Ordering::SeqCst), 400);
    assert_eq!(host.in_flight(), 0);

    host.shutdown_agents();
    Ok(())
}

/// `wait_until_first` blocks until the very first send happens, then
/// stays satisfied forever.
#[test]
fn wait_until_first_unblocks_on_the_first_send() -> anyhow::Result<()> {
    setup::initialize_tracing();
    let host = AgentHost::new();
    let agent = host.add_native_agent("sink", |_message| {})?;
    agent.add_message("drop", ParamTable::new(), "", "", "")?;

    let waiter = {
        let host = host.clone();
        std::thread::spawn(move || host.wait_until_first())
    };
    std::thread::sleep(std::time::Duration::from_millis(30));

    host.get_message("sink", "drop")?.send(ParamTable::new())?;
    waiter.join().expect("waiter must be released");

    host.wait_until_empty();
    // Satisfied immediately once the latch is set.
    host.wait_until_first();
    host.shutdown_agents();
    Ok(())
}
