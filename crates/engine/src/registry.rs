use std::collections::HashMap;
use std::sync::Arc;

use value::{CallbackId, FunctionHandle, Value};

use crate::{Callback, Error};

/// Registry of native callbacks, addressable by interned name or by the
/// dense [`CallbackId`] carried inside guest-visible function handles.
///
/// The parent side of a sandbox consults it to dispatch callback frames by
/// name; engine adapters hold one to resolve the identity behind a handle
/// at invocation time.
#[derive(Default)]
pub struct CallbackRegistry {
    entries: Vec<(Arc<str>, Callback)>,
    by_name: HashMap<Arc<str>, CallbackId>,
}

impl CallbackRegistry {
    pub fn new() -> CallbackRegistry {
        CallbackRegistry::default()
    }

    /// Registers a callback, assigning it the next id. Registering a name
    /// twice is an error: silently shadowing an existing native function
    /// could hand guest code a different callable than the host audited.
    pub fn register(&mut self, name: &str, callback: Callback) -> Result<CallbackId, Error> {
        if self.by_name.contains_key(name) {
            return Err(Error::DuplicateCallback(name.to_string()));
        }
        let id = CallbackId(self.entries.len() as u32);
        let name: Arc<str> = name.into();
        self.by_name.insert(name.clone(), id);
        self.entries.push((name, callback));
        Ok(id)
    }

    pub fn get(&self, id: CallbackId) -> Option<&Callback> {
        self.entries.get(id.0 as usize).map(|(_, cb)| cb)
    }

    pub fn get_by_name(&self, name: &str) -> Option<(CallbackId, &Callback)> {
        let id = *self.by_name.get(name)?;
        Some((id, self.get(id)?))
    }

    /// The guest-visible handle for a registered callback.
    pub fn handle(&self, id: CallbackId) -> Option<FunctionHandle> {
        self.entries.get(id.0 as usize).map(|(name, cb)| FunctionHandle {
            id,
            name: name.clone(),
            arity: cb.arity(),
        })
    }

    /// Looks up `name` and invokes it, tagging failures with the name.
    pub fn invoke(&self, name: &str, args: &[Value]) -> Result<Value, Error> {
        let (_, callback) = self
            .get_by_name(name)
            .ok_or_else(|| Error::UnknownCallback(name.to_string()))?;
        callback.invoke(name, args)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CallbackId, &str, &Callback)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, (name, cb))| (CallbackId(i as u32), name.as_ref(), cb))
    }
}
