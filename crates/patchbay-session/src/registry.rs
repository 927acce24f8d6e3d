//! Local type registry and the dictionary-of-closures method dispatch.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use patchbay_wire::{ErrorRecord, Value};

use crate::errors::TypeConflict;

/// Future returned by a method invocation.
pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Value, ErrorRecord>> + Send>>;

/// Implementor of one named type's methods.
///
/// `invoke` returns `None` when the method name is unknown; the connection
/// turns that into a `MethodNotFound` error record, so handlers never need to
/// fabricate one themselves. The executing call's [`crate::CallContext`] is
/// ambient (`CallContext::current()`) inside the returned future.
pub trait TypeHandler: Send + Sync {
    fn invoke(&self, method: &str, args: Vec<Value>) -> Option<MethodFuture>;
}

type MethodFn = Box<dyn Fn(Vec<Value>) -> MethodFuture + Send + Sync>;

/// A [`TypeHandler`] built as a static dictionary of closures.
///
/// Dispatch is a plain map lookup, no reflection or inheritance walking.
/// Method sets are fixed at registration time.
///
/// ```ignore
/// let handler = MethodTable::new()
///     .method("add", |args| async move {
///         let a = args[0].as_int().unwrap_or(0);
///         let b = args[1].as_int().unwrap_or(0);
///         Ok(Value::Int(a + b))
///     });
/// ```
#[derive(Default)]
pub struct MethodTable {
    methods: HashMap<String, MethodFn>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Add a method. Replaces any previous entry with the same name.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorRecord>> + Send + 'static,
    {
        self.methods
            .insert(name.into(), Box::new(move |args| Box::pin(f(args))));
        self
    }

    pub fn method_names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }
}

impl TypeHandler for MethodTable {
    fn invoke(&self, method: &str, args: Vec<Value>) -> Option<MethodFuture> {
        self.methods.get(method).map(|f| f(args))
    }
}

/// Name-to-handler table for the types a single peer executes locally.
///
/// Names are exclusively owned: a second registration of a live name is
/// refused whole, naming every conflicting entry.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<HashMap<String, Arc<dyn TypeHandler>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register a batch of handlers atomically: one lock acquisition checks
    /// every name and either inserts all of them or none.
    pub fn register(
        &self,
        entries: Vec<(String, Arc<dyn TypeHandler>)>,
    ) -> Result<(), TypeConflict> {
        let mut inner = self.inner.lock().unwrap();
        let conflicts: Vec<String> = entries
            .iter()
            .filter(|(name, _)| inner.contains_key(name))
            .map(|(name, _)| name.clone())
            .collect();
        if !conflicts.is_empty() {
            return Err(TypeConflict { names: conflicts });
        }
        for (name, handler) in entries {
            inner.insert(name, handler);
        }
        Ok(())
    }

    /// Remove a name. Returns whether it was present.
    pub fn unregister(&self, name: &str) -> bool {
        self.inner.lock().unwrap().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TypeHandler>> {
        self.inner.lock().unwrap().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().unwrap().contains_key(name)
    }

    pub fn type_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().keys().cloned().collect()
    }
}
