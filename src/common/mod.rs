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

//! Shared infrastructure: id allocation, the in-flight counter, the
//! error taxonomy and host/agent configuration.

pub mod config;
pub mod counter;
pub mod error;
pub mod registry;

pub use config::{AgentConfiguration, RuntimeConfig, CONFIG};
pub use counter::{CounterGuard, InFlightCounter};
pub use error::AgentError;
pub use registry::IdRegistry;
