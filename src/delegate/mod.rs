//! Delegate invocation engine.
//!
//! A delegate is externally supplied logic the service calls into by method
//! name: resolving identifiers, choosing overlays, adding cache-key options.
//! The execution technology is behind [`DelegateProvider`]; this module adds
//! the parts that do not depend on it.
//!
//! ## Locking
//!
//! [`DelegateEngine`] keeps the provider behind one `RwLock`:
//!
//! | Call | Lock | Runs alongside |
//! |---|---|---|
//! | [`invoke`](DelegateEngine::invoke) | read | other invokes |
//! | [`load`](DelegateEngine::load) | write | nothing |
//!
//! Logic is therefore never executed while it is being replaced.
//!
//! ## Memoization
//!
//! When enabled, results are memoized in an [`InvocationCache`] keyed by the
//! method name and the canonical JSON of the arguments. Entries are
//! write-once, `null` results and failures are never stored, and a
//! successful load discards every entry while still holding the write lock.
//!
//! ## Namespace
//!
//! An engine may carry a root namespace, prepended to every method's module
//! path before dispatch unless the name already starts with it. With the
//! namespace `Server`, `resolver::source` and `Server::resolver::source`
//! reach the same method and share memoized results.
//!
//! ## Failed loads
//!
//! A load that fails leaves the provider in an unknown state. The engine
//! drops it and becomes defunct: every later call fails with
//! [`DelegateError::Defunct`]. Recovery means building a new engine.

pub mod table;

pub use table::TableDelegate;

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DelegateError {
    #[error("Delegate method not found: {0}")]
    MethodNotFound(String),
    #[error("Delegate method {method} failed: {message}")]
    Invocation { method: String, message: String },
    #[error("Failed to load delegate logic: {0}")]
    Load(String),
    #[error("Delegate engine is unusable after a failed load: {0}")]
    Defunct(String),
    #[error("Invalid delegate method name: {0:?}")]
    InvalidMethodName(String),
}

// =============================================================================
// Method names
// =============================================================================

/// A qualified delegate method name, split into module path and method.
///
/// `"resolver::source"`, `"resolver.source"` and the bare `"source"` are all
/// accepted; both separators mean the same thing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodName {
    module: Vec<String>,
    method: String,
}

impl MethodName {
    pub fn parse(name: &str) -> Result<Self, DelegateError> {
        let invalid = || DelegateError::InvalidMethodName(name.to_string());
        let mut segments: Vec<String> = name
            .split("::")
            .flat_map(|part| part.split('.'))
            .map(str::to_string)
            .collect();
        if segments.iter().any(|s| !is_identifier(s)) {
            return Err(invalid());
        }
        let method = segments.pop().ok_or_else(invalid)?;
        Ok(Self {
            module: segments,
            method,
        })
    }

    /// Containing module path, outermost first. Empty for a top-level method.
    pub fn module_path(&self) -> &[String] {
        &self.module
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// This name placed under `namespace`, unless it already lives there.
    pub fn within(&self, namespace: &[String]) -> MethodName {
        if self.module.starts_with(namespace) {
            return self.clone();
        }
        MethodName {
            module: namespace.iter().chain(&self.module).cloned().collect(),
            method: self.method.clone(),
        }
    }

    /// Normalized form using `::` separators.
    pub fn qualified(&self) -> String {
        self.module
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.method.as_str()))
            .collect::<Vec<_>>()
            .join("::")
    }
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '?' || c == '!')
}

impl fmt::Display for MethodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified())
    }
}

// =============================================================================
// Provider capability
// =============================================================================

/// Externally supplied logic the engine dispatches into.
pub trait DelegateProvider: Send + Sync {
    /// Replace the loaded logic with `code`.
    fn load(&mut self, code: &str) -> Result<(), DelegateError>;

    /// Call `method` with `args`. `Value::Null` means "no value".
    fn invoke(&self, method: &MethodName, args: &[Value]) -> Result<Value, DelegateError>;
}

// =============================================================================
// Invocation cache
// =============================================================================

/// `(qualified method name, canonical JSON of the argument list)`.
type InvocationKey = (String, String);

/// Memoized delegate results. Safe to share between threads.
#[derive(Debug, Default)]
pub struct InvocationCache {
    entries: Mutex<HashMap<InvocationKey, Value>>,
}

impl InvocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(method: &MethodName, args: &[Value]) -> InvocationKey {
        // Object keys serialize sorted, so equal arguments give equal keys
        (method.qualified(), Value::Array(args.to_vec()).to_string())
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<InvocationKey, Value>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, method: &MethodName, args: &[Value]) -> Option<Value> {
        self.entries().get(&Self::key(method, args)).cloned()
    }

    /// Store a result unless one is already present. Null is ignored.
    pub fn put(&self, method: &MethodName, args: &[Value], value: Value) {
        if value.is_null() {
            return;
        }
        self.entries()
            .entry(Self::key(method, args))
            .or_insert(value);
    }

    pub fn purge(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Engine
// =============================================================================

enum State<P> {
    Ready(P),
    Defunct(String),
}

/// Serializes invocations against loads and memoizes results.
pub struct DelegateEngine<P> {
    state: RwLock<State<P>>,
    cache: InvocationCache,
    cache_enabled: bool,
    namespace: Vec<String>,
}

impl<P: DelegateProvider> DelegateEngine<P> {
    pub fn new(provider: P, cache_enabled: bool) -> Self {
        Self {
            state: RwLock::new(State::Ready(provider)),
            cache: InvocationCache::new(),
            cache_enabled,
            namespace: Vec::new(),
        }
    }

    /// Resolve every method under the root `namespace`, e.g. `"Server"` or
    /// `"Server::delegates"`.
    pub fn with_namespace(mut self, namespace: &str) -> Result<Self, DelegateError> {
        let root = MethodName::parse(namespace)?;
        self.namespace = root.module.into_iter().chain([root.method]).collect();
        Ok(self)
    }

    pub fn invocation_cache(&self) -> &InvocationCache {
        &self.cache
    }

    pub fn is_defunct(&self) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        matches!(*state, State::Defunct(_))
    }

    /// Replace the delegate logic. Waits for in-flight invocations and
    /// blocks new ones until done.
    pub fn load(&self, code: &str) -> Result<(), DelegateError> {
        let started = Instant::now();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let provider = match &mut *state {
            State::Ready(provider) => provider,
            State::Defunct(reason) => return Err(DelegateError::Defunct(reason.clone())),
        };

        match provider.load(code) {
            Ok(()) => {
                self.cache.purge();
                info!(
                    bytes = code.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "loaded delegate logic"
                );
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "delegate load failed, engine is now defunct");
                *state = State::Defunct(e.to_string());
                Err(e)
            }
        }
    }

    /// Call a delegate method, consulting the invocation cache first when it
    /// is enabled.
    pub fn invoke(&self, method: &MethodName, args: &[Value]) -> Result<Value, DelegateError> {
        let method = &method.within(&self.namespace);
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let provider = match &*state {
            State::Ready(provider) => provider,
            State::Defunct(reason) => return Err(DelegateError::Defunct(reason.clone())),
        };

        if self.cache_enabled {
            if let Some(value) = self.cache.get(method, args) {
                debug!(%method, "delegate result from invocation cache");
                return Ok(value);
            }
        }

        let started = Instant::now();
        let value = provider.invoke(method, args)?;
        debug!(
            %method,
            elapsed_us = started.elapsed().as_micros() as u64,
            "invoked delegate method"
        );

        // Still under the read lock, so a concurrent load cannot purge
        // before this result lands
        if self.cache_enabled {
            self.cache.put(method, args, value.clone());
        }
        Ok(value)
    }

    /// [`invoke`](Self::invoke) with a name that still needs parsing.
    pub fn invoke_named(&self, name: &str, args: &[Value]) -> Result<Value, DelegateError> {
        self.invoke(&MethodName::parse(name)?, args)
    }
}

impl<P> fmt::Debug for DelegateEngine<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegateEngine")
            .field("cache_enabled", &self.cache_enabled)
            .field("namespace", &self.namespace.join("::"))
            .finish_non_exhaustive()
    }
}
