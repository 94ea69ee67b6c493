//! # Event Emitter
//!
//! A listener table that can be mounted on an [`Object`]. Listeners are function
//! objects and are compared by identity, so a listener registered twice must be
//! removed twice.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use crate::lock;
use crate::object::Object;
use crate::value::Exception;
use crate::value::Value;

#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<Mutex<Vec<(String, Object)>>>,
}

impl EventEmitter {
    pub fn on(&self, event: impl Into<String>, listener: Object) {
        lock(&self.listeners).push((event.into(), listener));
    }

    /// Removes the most recently added registration of `listener` for `event`.
    pub fn remove_listener(&self, event: &str, listener: &Object) -> bool {
        let mut listeners = lock(&self.listeners);
        let found = listeners.iter().rposition(|(e, l)| e == event && Object::ptr_eq(l, listener));
        match found {
            Some(index) => {
                listeners.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn listeners(&self, event: &str) -> Vec<Object> {
        lock(&self.listeners).iter().filter(|(e, _)| e == event).map(|(_, l)| l.clone()).collect()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        lock(&self.listeners).iter().filter(|(e, _)| e == event).count()
    }

    /// Events with at least one listener, in first-registration order.
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for (event, _) in lock(&self.listeners).iter() {
            if !names.contains(event) {
                names.push(event.clone());
            }
        }
        names
    }

    /// Calls every listener for `event` in order. Returns whether any listener existed.
    ///
    /// The listener list is snapshotted first; listeners may add or remove listeners.
    pub fn emit(&self, this: Value, event: &str, args: Vec<Value>) -> Result<bool, Exception> {
        let listeners = self.listeners(event);
        for listener in &listeners {
            listener.call(this.clone(), args.clone())?;
        }
        Ok(!listeners.is_empty())
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter").field("events", &self.event_names()).finish()
    }
}
