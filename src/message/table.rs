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

//! The universal payload: a recursive key/value structure whose keys
//! and values are a small tagged scalar union.
//!
//! A [`ParamTable`] is the parameter set of every message, the return
//! value of every scripted handler, and (in serialised form, see
//! [`codec`](crate::message::codec)) the `table` type of the native
//! call bridge. A handful of key names are reserved conventions read
//! by the runtime itself; helpers for those live here so callers never
//! spell the strings out.

use std::collections::BTreeMap;

use crate::bridge::managed::ManagedPtr;
use crate::common::error::AgentError;

/// Name of the sub-table that requests an automatic reply.
pub const REPLY_TO: &str = "reply_to";
/// Key under [`REPLY_TO`] naming the agent to reply to.
pub const REPLY_TO_AGENT: &str = "agent";
/// Key under [`REPLY_TO`] naming the message to send in reply.
pub const REPLY_TO_MESSAGE: &str = "message";
/// Key under [`REPLY_TO`] holding a table merged into the reply payload.
pub const REPLY_TO_MERGE: &str = "merge";
/// Data key by which a sender requests the primary, non-replicated worker.
pub const UNREPLICATED: &str = "unreplicated";
/// Data key carrying the sender-requested replication ceiling.
pub const THREADS: &str = "threads";
/// Data key selecting the sub-queue used for ordering.
pub const QUEUE: &str = "queue";
/// Name of the sub-table the runtime fills on automatic replies.
pub const ORIGINAL_MESSAGE: &str = "original_message";
/// Key under [`ORIGINAL_MESSAGE`] holding the incoming message name.
pub const ORIGINAL_MESSAGE_NAME: &str = "message_name";
/// Key under [`ORIGINAL_MESSAGE`] holding the incoming parameters.
pub const ORIGINAL_MESSAGE_PARAMETERS: &str = "parameters";

/// The tagged scalar union used for both keys and values.
///
/// Ordering ranks variants first (integer, number, boolean, string,
/// pointer) and compares within a variant second, so any mix of keys
/// has a total order. `Num` equality is bitwise, which keeps the type
/// usable as a map key; numbers round-trip exactly through the codec.
#[derive(Debug, Clone)]
pub enum Value {
    /// A signed 64-bit integer.
    Int(i64),
    /// A double-precision float.
    Num(f64),
    /// A boolean.
    Bool(bool),
    /// A UTF-8 string.
    Str(String),
    /// A pointer, ref-counted when its address is managed.
    Ptr(ManagedPtr),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Int(_) => 0,
            Value::Num(_) => 1,
            Value::Bool(_) => 2,
            Value::Str(_) => 3,
            Value::Ptr(_) => 4,
        }
    }

    /// The integer payload, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// The float payload, if this is a `Num`.
    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(value) => Some(*value),
            _ => None,
        }
    }

    /// The boolean payload, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// The string payload, if this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(value) => Some(value),
            _ => None,
        }
    }

    /// The pointer payload, if this is a `Ptr`.
    pub fn as_ptr(&self) -> Option<&ManagedPtr> {
        match self {
            Value::Ptr(value) => Some(value),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a.to_bits() == b.to_bits(),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Ptr(a), Value::Ptr(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Num(a), Value::Num(b)) => a.total_cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Ptr(a), Value::Ptr(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(value) => write!(f, "{value}"),
            Value::Num(value) => write!(f, "{value}"),
            Value::Bool(value) => write!(f, "{value}"),
            Value::Str(value) => write!(f, "{value}"),
            Value::Ptr(value) => write!(f, "{value}"),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Num(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<ManagedPtr> for Value {
    fn from(value: ManagedPtr) -> Self {
        Value::Ptr(value)
    }
}

/// A recursive key/value structure: scalar entries in `data`,
/// nested tables in `sub_tables`.
///
/// For any key, well-formed tables carry it in at most one of the two
/// maps at a single level; the enqueue path does not enforce this and
/// readers tolerate violations by preferring `data`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamTable {
    /// Scalar entries.
    pub data: BTreeMap<Value, Value>,
    /// Nested tables.
    pub sub_tables: BTreeMap<Value, ParamTable>,
}

impl ParamTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the table holds no entries at either level.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.sub_tables.is_empty()
    }

    /// Inserts a scalar entry under a string key.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.data.insert(Value::from(key), value.into());
    }

    /// Looks up a scalar entry by string key.
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.data.get(&Value::from(key))
    }

    /// Looks up a string entry by string key.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get_value(key).and_then(Value::as_str)
    }

    /// Looks up an integer entry by string key.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get_value(key).and_then(Value::as_int)
    }

    /// Looks up a boolean entry by string key.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get_value(key).and_then(Value::as_bool)
    }

    /// Looks up a nested table by string key.
    pub fn sub_table(&self, key: &str) -> Option<&ParamTable> {
        self.sub_tables.get(&Value::from(key))
    }

    /// Returns the nested table under `key`, creating it when absent.
    pub fn sub_table_mut(&mut self, key: &str) -> &mut ParamTable {
        self.sub_tables.entry(Value::from(key)).or_default()
    }

    /// Inserts a nested table under a string key.
    pub fn set_sub_table(&mut self, key: &str, table: ParamTable) {
        self.sub_tables.insert(Value::from(key), table);
    }

    /// The reply receiver requested via `reply_to.agent`, if any.
    pub fn reply_to_agent(&self) -> Option<String> {
        self.sub_table(REPLY_TO)
            .and_then(|reply| reply.get_str(REPLY_TO_AGENT))
            .map(str::to_string)
    }

    /// The reply message requested via `reply_to.message`, if any.
    pub fn reply_to_message(&self) -> Option<String> {
        self.sub_table(REPLY_TO)
            .and_then(|reply| reply.get_str(REPLY_TO_MESSAGE))
            .map(str::to_string)
    }

    /// Sets both reply-to entries.
    pub fn set_reply_to(&mut self, agent: &str, message: &str) {
        let reply = self.sub_table_mut(REPLY_TO);
        reply.set(REPLY_TO_AGENT, agent);
        reply.set(REPLY_TO_MESSAGE, message);
    }

    /// Sets `reply_to.agent`, leaving `reply_to.message` unchanged.
    pub fn set_reply_to_agent(&mut self, agent: &str) {
        self.sub_table_mut(REPLY_TO).set(REPLY_TO_AGENT, agent);
    }

    /// The table to merge into an automatic reply, if any.
    pub fn merge_table(&self) -> Option<ParamTable> {
        self.sub_table(REPLY_TO).and_then(|reply| reply.sub_table(REPLY_TO_MERGE)).cloned()
    }

    /// Whether the sender requested the primary, non-replicated worker.
    pub fn requests_unreplicated(&self) -> bool {
        self.get_bool(UNREPLICATED).unwrap_or(false)
    }

    /// The sender-requested replication ceiling, if any.
    pub fn thread_request(&self) -> Option<i64> {
        self.get_int(THREADS)
    }

    /// Removes the replication ceiling; replicas receive their first
    /// message stripped of it to prevent recursive fan-out.
    pub fn strip_thread_request(&mut self) {
        self.data.remove(&Value::from(THREADS));
    }

    /// The sub-queue selector, defaulting to `0` when unset or not an
    /// integer.
    pub fn queue_key(&self) -> i64 {
        self.get_int(QUEUE).unwrap_or(0)
    }

    /// Records the incoming message this table replies to.
    pub fn set_original_message(&mut self, name: &str, parameters: &ParamTable) {
        let original = self.sub_table_mut(ORIGINAL_MESSAGE);
        original.set(ORIGINAL_MESSAGE_NAME, name);
        original.set_sub_table(ORIGINAL_MESSAGE_PARAMETERS, parameters.clone());
    }

    /// The original message name recorded on an automatic reply, or
    /// `None` when this table is not such a reply.
    pub fn original_message_name(&self) -> Option<String> {
        self.sub_table(ORIGINAL_MESSAGE)
            .and_then(|original| original.get_str(ORIGINAL_MESSAGE_NAME))
            .map(str::to_string)
    }

    /// The original message parameters recorded on an automatic reply.
    pub fn original_message_parameters(&self) -> Option<ParamTable> {
        self.sub_table(ORIGINAL_MESSAGE)
            .and_then(|original| original.sub_table(ORIGINAL_MESSAGE_PARAMETERS))
            .cloned()
    }

    /// Merges `other` into `self`.
    ///
    /// Scalars merge shallowly with `other` winning conflicts;
    /// sub-tables merge recursively. A scalar on one side and a
    /// sub-table on the other at the same key is a
    /// [`MergeConflict`](AgentError::MergeConflict).
    pub fn merge_from(&mut self, other: &ParamTable) -> Result<(), AgentError> {
        for (key, value) in &other.data {
            if self.sub_tables.contains_key(key) {
                return Err(AgentError::MergeConflict(key.to_string()));
            }
            self.data.insert(key.clone(), value.clone());
        }
        for (key, table) in &other.sub_tables {
            if self.data.contains_key(key) {
                return Err(AgentError::MergeConflict(key.to_string()));
            }
            self.sub_tables.entry(key.clone()).or_default().merge_from(table)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ParamTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn indent(f: &mut std::fmt::Formatter<'_>, depth: usize) -> std::fmt::Result {
            for _ in 0..depth {
                write!(f, "  ")?;
            }
            Ok(())
        }
        fn render(table: &ParamTable, f: &mut std::fmt::Formatter<'_>, depth: usize) -> std::fmt::Result {
            for (key, value) in &table.data {
                indent(f, depth)?;
                writeln!(f, "{key} = {value}")?;
            }
            for (key, sub) in &table.sub_tables {
                indent(f, depth)?;
                writeln!(f, "{key}:")?;
                render(sub, f, depth + 1)?;
            }
            Ok(())
        }
        render(self, f, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_reply_keys_round_trip() {
        let mut table = ParamTable::new();
        table.set_reply_to("pinger", "pong");
        assert_eq!(table.reply_to_agent().as_deref(), Some("pinger"));
        assert_eq!(table.reply_to_message().as_deref(), Some("pong"));
        assert!(table.merge_table().is_none());
    }

    #[test]
    fn queue_and_thread_requests_default_sensibly() {
        let mut table = ParamTable::new();
        assert_eq!(table.queue_key(), 0);
        assert!(table.thread_request().is_none());
        table.set(QUEUE, 3i64);
        table.set(THREADS, 4i64);
        assert_eq!(table.queue_key(), 3);
        assert_eq!(table.thread_request(), Some(4));
        table.strip_thread_request();
        assert!(table.thread_request().is_none());
    }

    #[test]
    fn merge_prefers_the_merge_table_for_scalars() {
        let mut reply = ParamTable::new();
        reply.set("value", 1i64);
        reply.sub_table_mut("nested").set("kept", true);

        let mut merge = ParamTable::new();
        merge.set("value", 2i64);
        merge.sub_table_mut("nested").set("added", "yes");

        reply.merge_from(&merge).unwrap();
        assert_eq!(reply.get_int("value"), Some(2));
        let nested = reply.sub_table("nested").unwrap();
        assert_eq!(nested.get_bool("kept"), Some(true));
        assert_eq!(nested.get_str("added"), Some("yes"));
    }

    #[test]
    fn merge_rejects_scalar_table_collisions() {
        let mut reply = ParamTable::new();
        reply.set("clash", 1i64);
        let mut merge = ParamTable::new();
        merge.sub_table_mut("clash").set("inner", 2i64);
        assert!(matches!(reply.merge_from(&merge), Err(AgentError::MergeConflict(_))));
    }

    #[test]
    fn original_message_is_recoverable() {
        let mut incoming = ParamTable::new();
        incoming.set("value", 7i64);
        let mut reply = ParamTable::new();
        reply.set_original_message("ping", &incoming);
        assert_eq!(reply.original_message_name().as_deref(), Some("ping"));
        assert_eq!(reply.original_message_parameters().unwrap().get_int("value"), Some(7));
    }

    #[test]
    fn mixed_keys_order_totally() {
        let mut table = ParamTable::new();
        table.data.insert(Value::Int(2), Value::from("two"));
        table.data.insert(Value::from("z"), Value::from("zed"));
        table.data.insert(Value::Num(1.5), Value::from("float"));
        let keys: Vec<_> = table.data.keys().cloned().collect();
        assert_eq!(keys[0], Value::Int(2));
        assert_eq!(keys[1], Value::Num(1.5));
        assert_eq!(keys[2], Value::from("z"));
    }
}
