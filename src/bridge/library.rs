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

//! Shared library resolution and reference-counted loading.
//!
//! Resolution searches the directory of the current script first, then
//! the registered library directories, then falls back to the bare
//! name for the OS loader. Loading is cached process-wide so the same
//! path loaded twice shares one handle; a library unloads when the
//! last strong reference drops.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use lazy_static::lazy_static;
use libloading::Library;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::error::AgentError;

lazy_static! {
    static ref LOADED: Mutex<HashMap<PathBuf, Weak<LoadedLibrary>>> = Mutex::new(HashMap::new());
    static ref DIRECTORIES: Mutex<HashMap<String, BTreeSet<PathBuf>>> = Mutex::new(HashMap::new());
}

/// A loaded shared library, shared by every import that named its path.
pub struct LoadedLibrary {
    path: PathBuf,
    library: Library,
}

impl LoadedLibrary {
    /// The path the library was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Looks up an exported symbol and returns it as a raw code
    /// pointer. The pointer stays valid for as long as this handle is
    /// strongly referenced.
    pub(crate) fn symbol(&self, name: &str) -> Result<*const (), AgentError> {
        // Symbols are only used as C function entry points; the typed
        // transmute happens in the dispatcher per signature shape.
        let symbol: libloading::Symbol<'_, unsafe extern "C" fn()> = unsafe {
            self.library.get(name.as_bytes()).map_err(|e| {
                AgentError::Script(format!(
                    "could not resolve symbol '{name}' in '{}': {e}",
                    self.path.display()
                ))
            })?
        };
        Ok(*symbol as *const ())
    }
}

impl std::fmt::Debug for LoadedLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedLibrary").field("path", &self.path).finish()
    }
}

impl Drop for LoadedLibrary {
    fn drop(&mut self) {
        let mut cache = LOADED.lock();
        if cache.get(&self.path).is_some_and(|weak| weak.strong_count() == 0) {
            cache.remove(&self.path);
        }
        trace!(path = %self.path.display(), "unloading shared library");
    }
}

/// Loads (or re-uses) the shared library at `path`.
pub fn load(path: &Path) -> Result<Arc<LoadedLibrary>, AgentError> {
    let mut cache = LOADED.lock();
    if let Some(existing) = cache.get(path).and_then(Weak::upgrade) {
        trace!(path = %path.display(), "sharing already-loaded library handle");
        return Ok(existing);
    }
    let library = unsafe { Library::new(path) }.map_err(|e| {
        AgentError::Script(format!("could not load shared library '{}': {e}", path.display()))
    })?;
    debug!(path = %path.display(), "loaded shared library");
    let loaded = Arc::new(LoadedLibrary { path: path.to_path_buf(), library });
    cache.insert(path.to_path_buf(), Arc::downgrade(&loaded));
    Ok(loaded)
}

/// Whether the library at `path` is currently loaded by anyone.
pub fn is_loaded(path: &Path) -> bool {
    LOADED.lock().get(path).is_some_and(|weak| weak.strong_count() > 0)
}

/// Records that `directory` provides a library file called
/// `file_name`, for later [`resolve`] calls.
pub fn register_library_dir(file_name: &str, directory: &Path) {
    debug!(file = file_name, directory = %directory.display(), "registered library directory");
    DIRECTORIES.lock().entry(file_name.to_string()).or_default().insert(directory.to_path_buf());
}

fn normalize(text: &str) -> String {
    text.chars().filter(|c| *c != '_' && *c != ' ').collect::<String>().to_lowercase()
}

/// Platform file-name candidates for a bare library name, most
/// specific first.
fn candidate_file_names(name: &str) -> Vec<String> {
    if cfg!(target_os = "windows") {
        vec![format!("{name}.dll"), name.to_string()]
    } else if cfg!(target_os = "macos") {
        vec![format!("lib{name}.dylib"), format!("{name}.dylib"), name.to_string()]
    } else {
        vec![format!("lib{name}.so"), format!("{name}.so"), name.to_string()]
    }
}

fn pick_registered_dir(name: &str, file_name: &str, dirs: &BTreeSet<PathBuf>) -> Result<PathBuf, AgentError> {
    match dirs.len() {
        0 => Err(AgentError::Script(format!("internal error: known library '{file_name}' has no stored path"))),
        1 => Ok(dirs.iter().next().expect("one entry").join(file_name)),
        _ => {
            // Several directories provide this basename; accept the one
            // whose terminal folder name matches the bare library name
            // under normalisation.
            let wanted = normalize(name);
            let mut chosen: Option<&PathBuf> = None;
            for dir in dirs {
                let folder = dir.file_name().map(|f| f.to_string_lossy().to_string()).unwrap_or_default();
                if normalize(&folder) == wanted {
                    if chosen.is_some() {
                        return Err(AgentError::AmbiguousLibrary(name.to_string()));
                    }
                    chosen = Some(dir);
                }
            }
            match chosen {
                Some(dir) => Ok(dir.join(file_name)),
                None => Err(AgentError::AmbiguousLibrary(name.to_string())),
            }
        }
    }
}

/// Resolves a bare library name to a loadable path.
///
/// The directory of the current script wins, then the registered
/// library directories (disambiguated by normalised folder-name
/// equality when several are known), then the decorated bare name is
/// handed to the OS loader's own search path.
pub fn resolve(name: &str, script_dir: Option<&Path>) -> Result<PathBuf, AgentError> {
    let candidates = candidate_file_names(name);

    if let Some(dir) = script_dir {
        for file_name in &candidates {
            let path = dir.join(file_name);
            if path.is_file() {
                trace!(library = name, path = %path.display(), "resolved in script directory");
                return Ok(path);
            }
        }
    }

    {
        let directories = DIRECTORIES.lock();
        for file_name in &candidates {
            if let Some(dirs) = directories.get(file_name) {
                let path = pick_registered_dir(name, file_name, dirs)?;
                trace!(library = name, path = %path.display(), "resolved via registered directory");
                return Ok(path);
            }
        }
    }

    debug!(library = name, "unknown library path, deferring to OS loader search paths");
    Ok(PathBuf::from(&candidates[0]))
}
