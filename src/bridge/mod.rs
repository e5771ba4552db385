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

//! The dynamic native call bridge: library resolution and loading,
//! signature parsing, typed call dispatch, and the managed buffer
//! store whose addresses may outlive individual calls.

pub mod dispatch;
pub mod library;
pub mod managed;
pub mod signature;

pub use library::LoadedLibrary;
pub use managed::{DelayDeallocation, ManagedPtr};
pub use signature::{CType, Signature};
