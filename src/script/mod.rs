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

//! Script host embedding: the functions every worker's interpreter can
//! call, and the conversions between script tables and parameter
//! tables.

pub(crate) mod convert;
pub(crate) mod extension;

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use crate::agent::agent::Agent;
use crate::agent::host::HostCore;

/// Everything a worker's registered script functions need to reach:
/// the owning agent, the host internals, and the worker's own script
/// location and replica flag.
pub(crate) struct ScriptContext {
    pub agent: Arc<Agent>,
    pub host: Weak<HostCore>,
    pub script_path: PathBuf,
    pub is_replica: bool,
}
