//! # Object Registry
//!
//! Host-side table of objects handed out to clients.
//!
//! An entry pins one real object for one context and counts how many times it has
//! been sent there. The client reports the same count back when its proxy dies,
//! and the entry is dropped once the count reaches zero.
//!
//! ## Invariants
//!
//! - **One Id Per Context**: An object has at most one id per context, and a
//!   different id in every context it is exposed to.
//! - **Scoped Ids**: An id only resolves for the context that was issued it.
//! - **Monotonic Numbering**: Ids come from one process-wide counter and are never reused.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use remorpc::HandleId;
use tracing::debug;
use tracing::warn;

use crate::lock;
use crate::object::Object;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

struct Entry {
    context: String,
    object: Object,
    count: u32,
}

#[derive(Default)]
struct State {
    entries: HashMap<HandleId, Entry>,
    index: HashMap<(String, usize), HandleId>,
}

#[derive(Default)]
pub struct ObjectRegistry {
    state: Mutex<State>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins `object` for `context` and returns its id, bumping the count if it is already pinned.
    pub fn add(&self, context: &str, object: &Object) -> HandleId {
        let mut state = lock(&self.state);
        let key = (context.to_string(), object.addr());

        if let Some(&id) = state.index.get(&key) {
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.count += 1;
                debug!(context, id, count = entry.count, "object re-sent");
                return id;
            }
        }

        let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
        state.entries.insert(id, Entry { context: context.to_string(), object: object.clone(), count: 1 });
        state.index.insert(key, id);
        debug!(context, id, class = object.class_name(), "object registered");
        id
    }

    /// Looks up an id issued to `context`. Ids issued to other contexts are missing.
    pub fn get(&self, context: &str, id: HandleId) -> Option<Object> {
        let state = lock(&self.state);
        state.entries.get(&id).filter(|e| e.context == context).map(|e| e.object.clone())
    }

    /// Current reference count of an entry.
    pub fn count(&self, context: &str, id: HandleId) -> Option<u32> {
        let state = lock(&self.state);
        state.entries.get(&id).filter(|e| e.context == context).map(|e| e.count)
    }

    /// Decrements an entry by `by` (at least 1), dropping it at zero.
    ///
    /// Decrementing past zero clamps and logs. Unknown ids are ignored.
    pub fn remove(&self, context: &str, id: HandleId, by: u32) {
        let by = by.max(1);
        let released = {
            let mut state = lock(&self.state);
            let Some(entry) = state.entries.get_mut(&id).filter(|e| e.context == context) else {
                debug!(context, id, "dereference of unknown object ignored");
                return;
            };

            if by > entry.count {
                warn!(context, id, count = entry.count, by, "dereference exceeds reference count, clamping to zero");
            }
            entry.count = entry.count.saturating_sub(by);
            if entry.count > 0 {
                debug!(context, id, count = entry.count, "object dereferenced");
                return;
            }

            let Some(entry) = state.entries.remove(&id) else { return };
            state.index.remove(&(entry.context.clone(), entry.object.addr()));
            debug!(context, id, "object released");
            entry.object
        };
        // Dropped outside the lock: the object may own finalizers.
        drop(released);
    }

    /// Drops every entry owned by `context`. Returns how many were dropped.
    pub fn clear(&self, context: &str) -> usize {
        let released: Vec<Object> = {
            let mut state = lock(&self.state);
            let ids: Vec<HandleId> =
                state.entries.iter().filter(|(_, e)| e.context == context).map(|(id, _)| *id).collect();
            let mut released = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(entry) = state.entries.remove(&id) {
                    state.index.remove(&(entry.context.clone(), entry.object.addr()));
                    released.push(entry.object);
                }
            }
            released
        };
        debug!(context, count = released.len(), "context cleared");
        released.len()
    }

    /// Number of live entries across all contexts.
    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
