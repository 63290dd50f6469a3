// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Explicit registries mapping names to factories and services.
//!
//! Registries are populated once at process start from configuration;
//! unknown keys fail fast with a typed error. There is no dynamic
//! loading.

use std::collections::HashMap;
use std::sync::Arc;

use crate::artifact::{Factory, Service};
use crate::error::{EngineError, Result};

/// Name -> factory mapping.
#[derive(Default)]
pub struct FactoryRegistry {
    inner: HashMap<String, Arc<dyn Factory>>,
}

impl FactoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its own name. Replaces any previous
    /// registration under the same name.
    pub fn register(&mut self, factory: Arc<dyn Factory>) {
        self.inner.insert(factory.name().to_string(), factory);
    }

    /// Resolve a factory by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Factory>> {
        self.inner
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NoSuchFactory {
                factory: name.to_string(),
            })
    }

    /// Whether a factory is registered under the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    /// Registered factory names, for startup logging.
    pub fn names(&self) -> Vec<&str> {
        self.inner.keys().map(String::as_str).collect()
    }
}

/// Name -> service mapping.
#[derive(Default)]
pub struct ServiceRegistry {
    inner: HashMap<String, Arc<dyn Service>>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under its own name.
    pub fn register(&mut self, service: Arc<dyn Service>) {
        self.inner.insert(service.name().to_string(), service);
    }

    /// Resolve a service by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Service>> {
        self.inner
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NoSuchService {
                service: name.to_string(),
            })
    }

    /// Whether a service is registered under the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }
}
