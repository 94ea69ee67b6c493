//! # Callback Registries
//!
//! Functions that crossed the boundary, one table per direction.
//!
//! - [`CallbacksRegistry`] lives on the client and owns the local functions it
//!   sent to the host, so the host can invoke them by id later.
//! - [`CallbackCache`] lives on the host and weakly caches the stand-ins it built
//!   for those ids, so one client function maps to one host function per context.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::object::Object;
use crate::object::WeakObject;
use crate::value::Exception;
use crate::value::Value;

/// Local functions exposed to the remote side, by id.
#[derive(Default)]
pub struct CallbacksRegistry {
    next_id: AtomicU64,
    callbacks: DashMap<u64, Object>,
    ids: DashMap<usize, u64>,
    locations: DashMap<u64, String>,
}

impl CallbacksRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback`, returning its existing id if it is already known.
    ///
    /// The recorded location is the place the function was created and is never
    /// overwritten by later registrations.
    pub fn add(&self, callback: &Object) -> u64 {
        match self.ids.entry(callback.addr()) {
            Entry::Occupied(e) => *e.get(),
            Entry::Vacant(e) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                self.callbacks.insert(id, callback.clone());
                self.locations.insert(id, callback.location().to_string());
                e.insert(id);
                debug!(id, "callback registered");
                id
            }
        }
    }

    /// The callback for `id`, or a no-op function when it is unknown.
    pub fn get(&self, id: u64) -> Object {
        match self.callbacks.get(&id) {
            Some(callback) => callback.clone(),
            None => Object::function("", 0, |_| Ok(Value::Undefined)),
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.callbacks.contains_key(&id)
    }

    pub fn location(&self, id: u64) -> Option<String> {
        self.locations.get(&id).map(|l| l.clone())
    }

    /// Invokes the callback for `id` with no receiver.
    pub fn apply(&self, id: u64, args: Vec<Value>) -> Result<Value, Exception> {
        self.get(id).call(Value::Undefined, args)
    }

    pub fn remove(&self, id: u64) {
        if let Some((_, callback)) = self.callbacks.remove(&id) {
            self.ids.remove(&callback.addr());
            self.locations.remove(&id);
            debug!(id, "callback released");
        }
    }

    pub fn clear(&self) {
        self.callbacks.clear();
        self.ids.clear();
        self.locations.clear();
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

/// Weak cache of host stand-ins keyed by `(context, callback id)`.
///
/// Each entry also keeps the creation location the client reported for the
/// callback, for diagnostics after the client side is gone.
#[derive(Clone, Default)]
pub struct CallbackCache {
    entries: Arc<DashMap<(String, u64), (WeakObject, String)>>,
}

impl CallbackCache {
    pub fn get(&self, context: &str, id: u64) -> Option<Object> {
        self.lookup(context, id).map(|(stand_in, _)| stand_in)
    }

    /// The live stand-in and its reported location.
    pub fn lookup(&self, context: &str, id: u64) -> Option<(Object, String)> {
        let (weak, location) = self.entries.get(&(context.to_string(), id)).map(|e| e.clone())?;
        Some((weak.upgrade()?, location))
    }

    pub fn insert(&self, context: &str, id: u64, stand_in: &Object, location: &str) {
        self.entries.insert((context.to_string(), id), (stand_in.downgrade(), location.to_string()));
    }

    /// Drops the entry if its stand-in is gone.
    pub fn forget(&self, context: &str, id: u64) {
        self.entries.remove_if(&(context.to_string(), id), |_, (weak, _)| weak.is_dead());
    }

    /// Number of entries whose stand-in is still alive.
    pub fn live(&self) -> usize {
        self.entries.iter().filter(|e| !e.value().0.is_dead()).count()
    }
}
