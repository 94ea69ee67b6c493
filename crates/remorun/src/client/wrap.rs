//! Client values to wire metas.
//!
//! Proxies travel back as the handle they stand for. Local functions are
//! registered as callbacks and travel by id. Plain objects are copied member by
//! member, with a reference back to an enclosing object sent as `null`.

use remorpc::MetaValueFromClient;
use remorpc::Plain;
use remorpc::SerializedImage;

use super::ClientInner;
use crate::object::Object;
use crate::promise::Promise;
use crate::value::Exception;
use crate::value::Value;

impl ClientInner {
    /// Fails when reading a member of a copied object throws.
    pub(crate) fn wrap_args(&self, args: &[Value]) -> Result<Vec<MetaValueFromClient>, Exception> {
        let mut visited = Vec::new();
        args.iter().map(|arg| self.wrap(arg, &mut visited)).collect()
    }

    fn wrap(&self, value: &Value, visited: &mut Vec<usize>) -> Result<MetaValueFromClient, Exception> {
        let meta = match value {
            Value::Array(items) => {
                MetaValueFromClient::Array(items.iter().map(|v| self.wrap(v, visited)).collect::<Result<_, _>>()?)
            }
            Value::Buffer(bytes) => MetaValueFromClient::Buffer(bytes.clone()),
            Value::Date(ms) => MetaValueFromClient::Date(*ms),
            Value::Image(image) => {
                MetaValueFromClient::NativeImage(SerializedImage { representations: image.representations.clone() })
            }
            Value::Promise(promise) => self.wrap_promise(promise, visited)?,
            Value::Error(error) => {
                let mut members = vec![
                    ("name".to_string(), MetaValueFromClient::Value(Plain::String(error.name.clone()))),
                    ("message".to_string(), MetaValueFromClient::Value(Plain::String(error.message.clone()))),
                ];
                if let Some(stack) = &error.stack {
                    members.push(("stack".to_string(), MetaValueFromClient::Value(Plain::String(stack.clone()))));
                }
                for (name, prop) in &error.props {
                    members.push((name.clone(), self.wrap(prop, visited)?));
                }
                MetaValueFromClient::Object { name: error.name.clone(), members }
            }
            Value::Object(object) => return self.wrap_object(object, visited),
            other => MetaValueFromClient::Value(other.to_plain().unwrap_or(Plain::Undefined)),
        };
        Ok(meta)
    }

    fn wrap_object(&self, object: &Object, visited: &mut Vec<usize>) -> Result<MetaValueFromClient, Exception> {
        if let Some(handle) = object.remote() {
            if handle.context() == self.context_id && !handle.is_released() {
                return Ok(MetaValueFromClient::RemoteObject { id: handle.id() });
            }
        }

        if object.is_callable() {
            if let Some(value) = object.return_value() {
                return Ok(MetaValueFromClient::FunctionWithReturnValue(Box::new(self.wrap(value, visited)?)));
            }
            let length = object.callable().map_or(0, |c| c.length);
            return Ok(MetaValueFromClient::Function {
                id: self.callbacks.add(object),
                location: object.location().to_string(),
                length,
            });
        }

        if visited.contains(&object.addr()) {
            return Ok(MetaValueFromClient::null());
        }
        visited.push(object.addr());
        let members = object
            .enumerable_keys()
            .into_iter()
            .map(|key| {
                let value = object.get(&key)?;
                let meta = self.wrap(&value, visited)?;
                Ok((key, meta))
            })
            .collect::<Result<_, Exception>>();
        visited.pop();

        Ok(MetaValueFromClient::Object { name: object.class_name().to_string(), members: members? })
    }

    /// A local promise travels as a registered `then` forwarder.
    fn wrap_promise(&self, promise: &Promise, visited: &mut Vec<usize>) -> Result<MetaValueFromClient, Exception> {
        let promise = promise.clone();
        let then = Object::function("then", 2, move |inv| {
            let on_fulfilled = inv.arg(0).as_object().filter(|o| o.is_callable()).cloned();
            let on_rejected = inv.arg(1).as_object().filter(|o| o.is_callable()).cloned();
            promise.then(on_fulfilled, on_rejected);
            Ok(Value::Undefined)
        });
        Ok(MetaValueFromClient::Promise { then: Box::new(self.wrap_object(&then, visited)?) })
    }
}
