// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-invocation call contexts and the post-call action protocol.
//!
//! Every request owns exactly one [`CallContext`] for its duration. The
//! context carries the action the engine performs against durable
//! storage once the business operation returns, plus two short-lived
//! collaboration surfaces: a typed clipboard and a multi-valued
//! data-provider registry. Contexts are never persisted and never shared
//! across calls.
//!
//! Finalization is owned by the engine and runs exactly once per
//! context; see [`Engine`](crate::engine::Engine).

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::store::ArtifactHandle;

/// What happens to durable state after the business operation returns.
///
/// This is the state of the context, not of the target: the caller picks
/// a default appropriate to the operation, and the target may override
/// it mid-call via [`CallContext::set_after_call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostCallAction {
    /// No persistence effect.
    Nothing,
    /// Update only the last-access timestamp, extending the TTL window
    /// without rewriting the payload.
    Touch,
    /// Full re-serialize and write-back of the in-memory object.
    Store,
    /// Protect the target from collection (locked-id set) and store it;
    /// completion happens later through the background completion path.
    Background,
}

/// What a call context is bound to.
#[derive(Debug, Clone)]
pub enum CallTarget {
    /// An artifact, addressable for post-call persistence.
    Artifact(ArtifactHandle),
    /// A collection; collection verbs persist explicitly, so post-call
    /// persistence is limited to `Nothing` and `Background` locking.
    Collection {
        /// Numeric id of the collection.
        id: i64,
        /// External id of the collection.
        uuid: Uuid,
    },
    /// No durable target (service calls).
    System,
}

impl CallTarget {
    /// Numeric id of the bound row, if any.
    pub fn numeric_id(&self) -> Option<i64> {
        match self {
            Self::Artifact(handle) => Some(handle.id),
            Self::Collection { id, .. } => Some(*id),
            Self::System => None,
        }
    }
}

/// Ephemeral per-invocation state.
pub struct CallContext {
    target: CallTarget,
    action: PostCallAction,
    clipboard: HashMap<String, Box<dyn Any + Send>>,
    providers: HashMap<String, Vec<Arc<dyn Any + Send + Sync>>>,
}

impl CallContext {
    /// Create a context bound to a target with the caller's default
    /// action.
    pub fn new(target: CallTarget, default_action: PostCallAction) -> Self {
        Self {
            target,
            action: default_action,
            clipboard: HashMap::new(),
            providers: HashMap::new(),
        }
    }

    /// The bound target.
    pub fn target(&self) -> &CallTarget {
        &self.target
    }

    /// The action finalization will dispatch on.
    pub fn action(&self) -> PostCallAction {
        self.action
    }

    /// Override the post-call action from inside the business operation.
    pub fn set_after_call(&mut self, action: PostCallAction) {
        self.action = action;
    }

    // ------------------------------------------------------------------
    // Clipboard
    // ------------------------------------------------------------------

    /// Publish a value under a well-known key for other participants of
    /// this call.
    pub fn put(&mut self, key: impl Into<String>, value: Box<dyn Any + Send>) {
        self.clipboard.insert(key.into(), value);
    }

    /// Borrow a published value, if present and of the expected type.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.clipboard.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// Remove and return a published value, if present and of the
    /// expected type.
    pub fn take<T: Any>(&mut self, key: &str) -> Option<Box<T>> {
        match self.clipboard.remove(key) {
            None => None,
            Some(value) => match value.downcast::<T>() {
                Ok(typed) => Some(typed),
                Err(original) => {
                    // Wrong type: put it back untouched.
                    self.clipboard.insert(key.to_string(), original);
                    None
                }
            },
        }
    }

    // ------------------------------------------------------------------
    // Data providers
    // ------------------------------------------------------------------

    /// Register a provider under a key. Providers accumulate in
    /// registration order.
    pub fn register_provider(&mut self, key: impl Into<String>, provider: Arc<dyn Any + Send + Sync>) {
        self.providers.entry(key.into()).or_default().push(provider);
    }

    /// All providers registered under a key, in registration order.
    /// Always a list, possibly empty, never null.
    pub fn providers(&self, key: &str) -> Vec<Arc<dyn Any + Send + Sync>> {
        self.providers.get(key).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact_target() -> CallTarget {
        CallTarget::Artifact(ArtifactHandle {
            id: 1,
            uuid: Uuid::new_v4(),
            factory: "note".to_string(),
            ttl: Some(60),
        })
    }

    #[test]
    fn test_default_action_and_override() {
        let mut ctx = CallContext::new(artifact_target(), PostCallAction::Touch);
        assert_eq!(ctx.action(), PostCallAction::Touch);

        ctx.set_after_call(PostCallAction::Background);
        assert_eq!(ctx.action(), PostCallAction::Background);
    }

    #[test]
    fn test_clipboard_roundtrip() {
        let mut ctx = CallContext::new(artifact_target(), PostCallAction::Nothing);

        ctx.put("note.count", Box::new(42u32));
        assert_eq!(ctx.get::<u32>("note.count"), Some(&42));
        assert_eq!(ctx.get::<String>("note.count"), None, "wrong type");

        let taken = ctx.take::<u32>("note.count").unwrap();
        assert_eq!(*taken, 42);
        assert!(ctx.get::<u32>("note.count").is_none());
    }

    #[test]
    fn test_clipboard_take_wrong_type_keeps_value() {
        let mut ctx = CallContext::new(artifact_target(), PostCallAction::Nothing);
        ctx.put("key", Box::new("value".to_string()));

        assert!(ctx.take::<u32>("key").is_none());
        assert_eq!(ctx.get::<String>("key"), Some(&"value".to_string()));
    }

    #[test]
    fn test_providers_ordered_never_null() {
        let mut ctx = CallContext::new(CallTarget::System, PostCallAction::Nothing);
        assert!(ctx.providers("renderers").is_empty());

        ctx.register_provider("renderers", Arc::new("first".to_string()));
        ctx.register_provider("renderers", Arc::new("second".to_string()));

        let providers = ctx.providers("renderers");
        assert_eq!(providers.len(), 2);
        let labels: Vec<&String> = providers
            .iter()
            .map(|p| p.downcast_ref::<String>().unwrap())
            .collect();
        assert_eq!(labels, [&"first".to_string(), &"second".to_string()]);
    }

    #[test]
    fn test_target_numeric_id() {
        assert_eq!(artifact_target().numeric_id(), Some(1));
        assert_eq!(CallTarget::System.numeric_id(), None);
    }
}
