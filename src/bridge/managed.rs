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

//! Process-wide managed buffer store.
//!
//! The store is content-addressed by buffer address: an address is
//! "known" iff this store minted it. Values tagged as pointers whose
//! address is known are carried through parameter tables as ref-counted
//! handles ([`ManagedPtr`]), which is what lets memory referenced by a
//! handler's result table outlive the call that produced it.
//!
//! Deallocation delay is scoped per guard and per thread: a release
//! that hits zero while the current thread holds a [`DelayDeallocation`]
//! guard lands in that guard's own deferral set and flushes when that
//! specific guard drops. Guards held by other worker threads neither
//! delay nor flush it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;

use lazy_static::lazy_static;
use parking_lot::Mutex;
use tracing::trace;

struct Entry {
    data: Box<[u8]>,
    refs: usize,
}

lazy_static! {
    static ref STORE: Mutex<HashMap<usize, Entry>> = Mutex::new(HashMap::new());
}

thread_local! {
    // One deferral set per live guard on this thread, innermost last.
    static DEFERRED: RefCell<Vec<Vec<usize>>> = const { RefCell::new(Vec::new()) };
}

/// Allocates a zero-initialised managed buffer of `len` bytes and
/// returns its address with a reference count of one.
pub fn alloc(len: usize) -> usize {
    alloc_from(&vec![0u8; len])
}

/// Allocates a managed buffer holding a copy of `bytes` and returns its
/// address with a reference count of one.
pub fn alloc_from(bytes: &[u8]) -> usize {
    // A zero-length box would hand out a dangling sentinel address that
    // could collide across allocations.
    let data: Box<[u8]> = if bytes.is_empty() { Box::new([0u8]) } else { bytes.into() };
    let addr = data.as_ptr() as usize;
    let mut store = STORE.lock();
    store.insert(addr, Entry { data, refs: 1 });
    trace!("minted managed buffer {addr:#x}");
    addr
}

/// Whether `addr` was minted by this store and is still alive.
pub fn is_known(addr: usize) -> bool {
    STORE.lock().contains_key(&addr)
}

/// Increments the reference count of a known address. Returns whether
/// the address was known.
pub fn retain(addr: usize) -> bool {
    let mut store = STORE.lock();
    match store.get_mut(&addr) {
        Some(entry) => {
            entry.refs += 1;
            true
        }
        None => false,
    }
}

/// Decrements the reference count of a known address, freeing the
/// buffer when it reaches zero. While the calling thread holds a
/// [`DelayDeallocation`] guard the free is parked in that guard's
/// deferral set instead. Returns whether the address was known.
pub fn release(addr: usize) -> bool {
    let mut store = STORE.lock();
    let Some(entry) = store.get_mut(&addr) else {
        return false;
    };
    entry.refs = entry.refs.saturating_sub(1);
    if entry.refs == 0 {
        let deferred = DEFERRED.with(|frames| match frames.borrow_mut().last_mut() {
            Some(frame) => {
                frame.push(addr);
                true
            }
            None => false,
        });
        if deferred {
            trace!("deferred release of managed buffer {addr:#x}");
        } else {
            store.remove(&addr);
            trace!("freed managed buffer {addr:#x}");
        }
    }
    true
}

/// Runs `f` over the bytes of a known buffer.
pub fn with_bytes<R>(addr: usize, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
    let store = STORE.lock();
    store.get(&addr).map(|entry| f(&entry.data))
}

/// Byte length of a known buffer.
pub fn len(addr: usize) -> Option<usize> {
    STORE.lock().get(&addr).map(|entry| entry.data.len())
}

/// Scoped guard that parks refcount-zero releases performed by the
/// current thread until the guard is dropped.
///
/// Dispatchers hold one around each script function invocation so that
/// buffers handed back inside a result table survive the call boundary.
/// The scope is per invocation: each guard flushes only its own
/// deferral set, on the thread that created it, independent of guards
/// other workers hold concurrently.
pub struct DelayDeallocation(PhantomData<*const ()>);

impl DelayDeallocation {
    /// Begins (or nests) a deferral scope on the current thread.
    pub fn new() -> Self {
        DEFERRED.with(|frames| frames.borrow_mut().push(Vec::new()));
        Self(PhantomData)
    }
}

impl Default for DelayDeallocation {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DelayDeallocation {
    fn drop(&mut self) {
        let frame = DEFERRED.with(|frames| frames.borrow_mut().pop()).unwrap_or_default();
        if frame.is_empty() {
            return;
        }
        let mut store = STORE.lock();
        for addr in frame {
            // Retained again while the deferral was pending.
            if store.get(&addr).is_some_and(|entry| entry.refs == 0) {
                store.remove(&addr);
                trace!("freed deferred managed buffer {addr:#x}");
            }
        }
    }
}

/// A pointer value carried through parameter tables.
///
/// When the address is known to the managed store at construction time
/// the handle participates in reference counting: clones retain, drops
/// release. Unknown addresses are carried inertly as plain numbers
/// with a pointer tag.
#[derive(Debug)]
pub struct ManagedPtr {
    addr: usize,
    managed: bool,
}

impl ManagedPtr {
    /// Wraps `addr`, retaining it when the managed store knows it.
    pub fn from_addr(addr: usize) -> Self {
        let managed = retain(addr);
        Self { addr, managed }
    }

    /// Wraps a freshly minted address without an extra retain; the
    /// handle adopts the mint's own reference.
    pub fn adopt(addr: usize) -> Self {
        Self { addr, managed: is_known(addr) }
    }

    /// The raw address.
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Whether this handle participates in reference counting.
    pub fn is_managed(&self) -> bool {
        self.managed
    }
}

impl Clone for ManagedPtr {
    fn clone(&self) -> Self {
        if self.managed {
            retain(self.addr);
        }
        Self { addr: self.addr, managed: self.managed }
    }
}

impl Drop for ManagedPtr {
    fn drop(&mut self) {
        if self.managed {
            release(self.addr);
        }
    }
}

impl PartialEq for ManagedPtr {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for ManagedPtr {}

impl PartialOrd for ManagedPtr {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ManagedPtr {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.addr.cmp(&other.addr)
    }
}

impl std::fmt::Display for ManagedPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.addr)
    }
}
