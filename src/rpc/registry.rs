//! RPC method registration
//!
//! A handler type lists its exposed methods once in [`RpcMethods::register`].
//! The resulting [`MethodRegistry`] is cached per type, and every handler
//! instance binds it into its own [`MethodTable`].

use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
    error::Error as StdError,
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

pub type MethodResult = Result<Value, MethodError>;

type UnboundMethod<H> = Arc<dyn Fn(&H, Params) -> MethodResult + Send + Sync>;
pub(crate) type BoundMethod = Arc<dyn Fn(Params) -> MethodResult + Send + Sync>;

/// A failure raised by a method body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct MethodError {
    pub kind: String,
    pub message: String,
    pub trace: Vec<String>,
}

impl MethodError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: Vec::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new("MethodFailure", message)
    }

    pub fn arity(expected: usize, actual: usize) -> Self {
        Self::new(
            "ArityError",
            format!("expected {expected} argument(s), got {actual}"),
        )
    }

    pub fn invalid_argument(index: usize, source: &serde_json::Error) -> Self {
        Self::new("ArgumentError", format!("argument {index} is invalid: {source}"))
    }

    /// Wraps any error, using its short type name as the kind and its
    /// source chain as the trace.
    pub fn from_error<E>(error: E) -> Self
    where
        E: StdError + 'static,
    {
        let kind = type_name::<E>().rsplit("::").next().unwrap_or("Error");
        let mut trace = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            trace.push(format!("caused by: {cause}"));
            source = cause.source();
        }

        Self {
            kind: kind.to_string(),
            message: error.to_string(),
            trace,
        }
    }

    pub fn trace_text(&self) -> String {
        self.trace.join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("method name must not be empty")]
    EmptyName,
    #[error("method '{name}' is registered twice on {handler}")]
    Duplicate {
        name: &'static str,
        handler: &'static str,
    },
}

/// Positional call arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Vec<Value>);

impl Params {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn expect_len(&self, expected: usize) -> Result<(), MethodError> {
        if self.0.len() == expected {
            Ok(())
        } else {
            Err(MethodError::arity(expected, self.0.len()))
        }
    }

    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, MethodError> {
        let value = self
            .0
            .get(index)
            .cloned()
            .ok_or_else(|| MethodError::arity(index + 1, self.0.len()))?;
        serde_json::from_value(value).map_err(|error| MethodError::invalid_argument(index, &error))
    }
}

/// Types whose methods can be called over JSON-RPC.
pub trait RpcMethods: Send + Sync + Sized + 'static {
    fn register(registry: &mut MethodRegistry<Self>) -> Result<(), RegistryError>;
}

/// Method names of one handler type mapped to their implementations.
pub struct MethodRegistry<H> {
    methods: HashMap<&'static str, UnboundMethod<H>>,
}

impl<H> Default for MethodRegistry<H> {
    fn default() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }
}

impl<H> MethodRegistry<H> {
    pub fn register<F>(&mut self, name: &'static str, method: F) -> Result<(), RegistryError>
    where
        F: Fn(&H, Params) -> MethodResult + Send + Sync + 'static,
    {
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.methods.contains_key(name) {
            return Err(RegistryError::Duplicate {
                name,
                handler: type_name::<H>(),
            });
        }
        self.methods.insert(name, Arc::new(method));
        Ok(())
    }
}

type RegistryCache = Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>;

fn registry_cache() -> &'static RegistryCache {
    static CACHE: OnceLock<RegistryCache> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Returns the registry of `H`, building it on first use.
pub fn registry_for<H: RpcMethods>() -> Result<Arc<MethodRegistry<H>>, RegistryError> {
    let mut cache = registry_cache()
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

    if let Some(cached) = cache.get(&TypeId::of::<H>()) {
        if let Ok(registry) = Arc::clone(cached).downcast::<MethodRegistry<H>>() {
            return Ok(registry);
        }
    }

    let mut registry = MethodRegistry::default();
    H::register(&mut registry)?;
    let registry = Arc::new(registry);
    cache.insert(TypeId::of::<H>(), registry.clone());
    Ok(registry)
}

/// Callables bound to one handler instance. Read-only once built.
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: HashMap<&'static str, BoundMethod>,
}

impl MethodTable {
    pub fn bind<H: RpcMethods>(handler: Arc<H>) -> Result<Self, RegistryError> {
        let registry = registry_for::<H>()?;
        let methods = registry
            .methods
            .iter()
            .map(|(name, method)| {
                let method = Arc::clone(method);
                let handler = Arc::clone(&handler);
                let bound: BoundMethod = Arc::new(move |params| method(handler.as_ref(), params));
                (*name, bound)
            })
            .collect();

        Ok(Self { methods })
    }

    pub(crate) fn get(&self, name: &str) -> Option<BoundMethod> {
        self.methods.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.methods.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.names())
            .finish()
    }
}
