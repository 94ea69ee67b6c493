//! # Promises
//!
//! A settle-once cell with reactions.
//!
//! Reactions run synchronously on the thread that settles the promise, outside
//! the internal lock, in registration order. Reacting to an already settled
//! promise runs immediately.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use crate::lock;
use crate::object::Object;
use crate::value::Value;

type Reaction = Box<dyn FnOnce(Result<Value, Value>) + Send>;

enum State {
    Pending(Vec<Reaction>),
    Fulfilled(Value),
    Rejected(Value),
}

/// Observable state of a promise.
#[derive(Debug, Clone, PartialEq)]
pub enum PromiseState {
    Pending,
    Fulfilled(Value),
    Rejected(Value),
}

#[derive(Clone)]
pub struct Promise {
    state: Arc<Mutex<State>>,
}

impl Promise {
    pub fn new() -> Self {
        Promise { state: Arc::new(Mutex::new(State::Pending(Vec::new()))) }
    }

    pub fn resolved(value: impl Into<Value>) -> Self {
        let promise = Promise::new();
        promise.resolve(value);
        promise
    }

    pub fn rejected(reason: impl Into<Value>) -> Self {
        let promise = Promise::new();
        promise.reject(reason);
        promise
    }

    pub fn ptr_eq(a: &Promise, b: &Promise) -> bool {
        Arc::ptr_eq(&a.state, &b.state)
    }

    pub fn state(&self) -> PromiseState {
        match &*lock(&self.state) {
            State::Pending(_) => PromiseState::Pending,
            State::Fulfilled(v) => PromiseState::Fulfilled(v.clone()),
            State::Rejected(v) => PromiseState::Rejected(v.clone()),
        }
    }

    /// Fulfills the promise. Resolving with another promise adopts its outcome.
    pub fn resolve(&self, value: impl Into<Value>) {
        match value.into() {
            Value::Promise(other) => {
                let this = self.clone();
                other.on_settled(move |outcome| this.settle(outcome));
            }
            value => self.settle(Ok(value)),
        }
    }

    pub fn reject(&self, reason: impl Into<Value>) {
        self.settle(Err(reason.into()));
    }

    fn settle(&self, outcome: Result<Value, Value>) {
        let reactions = {
            let mut state = lock(&self.state);
            let State::Pending(reactions) = &mut *state else {
                return;
            };
            let reactions = std::mem::take(reactions);
            *state = match &outcome {
                Ok(v) => State::Fulfilled(v.clone()),
                Err(v) => State::Rejected(v.clone()),
            };
            reactions
        };
        for reaction in reactions {
            reaction(outcome.clone());
        }
    }

    /// Runs `reaction` once the promise settles.
    pub fn on_settled(&self, reaction: impl FnOnce(Result<Value, Value>) + Send + 'static) {
        let outcome = {
            let mut state = lock(&self.state);
            match &mut *state {
                State::Pending(reactions) => {
                    reactions.push(Box::new(reaction));
                    return;
                }
                State::Fulfilled(v) => Ok(v.clone()),
                State::Rejected(v) => Err(v.clone()),
            }
        };
        reaction(outcome);
    }

    /// Chains function objects onto the promise.
    ///
    /// The derived promise settles with the handler's result, or rejects with what
    /// it threw. A missing handler passes the outcome through.
    pub fn then(&self, on_fulfilled: Option<Object>, on_rejected: Option<Object>) -> Promise {
        let derived = Promise::new();
        let next = derived.clone();
        self.on_settled(move |outcome| {
            let (handler, value) = match outcome {
                Ok(v) => (on_fulfilled, Ok(v)),
                Err(v) => (on_rejected, Err(v)),
            };
            match (handler, value) {
                (Some(handler), Ok(v) | Err(v)) => match handler.call(Value::Undefined, vec![v]) {
                    Ok(result) => next.resolve(result),
                    Err(thrown) => next.reject(thrown.into_value()),
                },
                (None, Ok(v)) => next.resolve(v),
                (None, Err(v)) => next.reject(v),
            }
        });
        derived
    }
}

impl Default for Promise {
    fn default() -> Self {
        Promise::new()
    }
}

impl PartialEq for Promise {
    fn eq(&self, other: &Self) -> bool {
        Promise::ptr_eq(self, other)
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Promise {{ {:?} }}", self.state())
    }
}
