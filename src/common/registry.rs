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

use parking_lot::Mutex;

/// Hands out compact integer ids and takes them back at teardown.
///
/// Ids are used as routing keys by the message manager and stay stable
/// for an agent's lifetime. Released ids may be reused by later
/// registrations; no ordering is guaranteed across concurrent callers.
#[derive(Debug, Default)]
pub struct IdRegistry {
    inner: Mutex<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    next: usize,
    free: Vec<usize>,
}

impl IdRegistry {
    /// Creates an empty registry; the first registration returns `0`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a small non-negative id unused by any live registrant.
    pub fn register(&self) -> usize {
        let mut state = self.inner.lock();
        if let Some(id) = state.free.pop() {
            id
        } else {
            let id = state.next;
            state.next += 1;
            id
        }
    }

    /// Returns `id` to the pool for reuse.
    pub fn deregister(&self, id: usize) {
        let mut state = self.inner.lock();
        debug_assert!(!state.free.contains(&id), "id {id} deregistered twice");
        state.free.push(id);
    }

    /// Number of ids currently handed out.
    pub fn live_count(&self) -> usize {
        let state = self.inner.lock();
        state.next - state.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_compact_and_reused() {
        let registry = IdRegistry::new();
        let a = registry.register();
        let b = registry.register();
        assert_ne!(a, b);
        registry.deregister(a);
        let c = registry.register();
        assert_eq!(c, a);
        assert_eq!(registry.live_count(), 2);
    }
}
