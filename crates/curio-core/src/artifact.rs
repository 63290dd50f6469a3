// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live-object traits: artifacts, serializers, factories, and services.
//!
//! An [`Artifact`] is the in-memory form of a stored row. The engine
//! revives it from bytes through its [`Factory`]'s [`Serializer`], runs
//! one of the four verbs against it, and persists it (or not) according
//! to the call context's post-call action.

use std::any::Any;
use std::io::Write;

use serde_json::Value;

use crate::context::CallContext;
use crate::error::Result;

/// What a mutating verb decided about the call target.
///
/// `Replace` swaps the call target before post-call persistence runs: a
/// `Store` action then writes the replacement under the same handle, so
/// one artifact can hand over to another without the caller noticing.
pub enum Outcome {
    /// Keep the current artifact as the call target.
    Continue,
    /// Replace the call target with another artifact.
    Replace(Box<dyn Artifact>),
}

/// A stateful, serializable business object with a durable lifecycle.
pub trait Artifact: Send + Sync {
    /// Render a description of the current state.
    fn describe(&self, ctx: &mut CallContext) -> Result<Value>;

    /// Feed input into the artifact, possibly mutating it.
    fn feed(&mut self, ctx: &mut CallContext, input: Value) -> Result<Outcome>;

    /// Advance the artifact one step without external input.
    fn advance(&mut self, ctx: &mut CallContext) -> Result<Outcome>;

    /// Render the artifact to a byte sink.
    fn out(&self, ctx: &mut CallContext, sink: &mut dyn Write) -> Result<()>;

    /// End-of-life hook, invoked by the collector after the row has been
    /// deleted. Errors are logged and swallowed; delivery is best-effort.
    fn on_expire(&mut self) -> Result<()> {
        Ok(())
    }

    /// Cleanup hook, invoked before export so transient resources are not
    /// embedded in the transfer payload.
    fn sanitize(&mut self) {}

    /// Downcasting support for serializers.
    fn as_any(&self) -> &dyn Any;
}

/// Bytes <-> live object bridge. Opaque to the engine.
pub trait Serializer: Send + Sync {
    /// Serialize a live artifact to bytes.
    fn to_bytes(&self, artifact: &dyn Artifact) -> Result<Vec<u8>>;

    /// Reconstruct a live artifact from stored bytes.
    fn from_bytes(&self, bytes: &[u8]) -> Result<Box<dyn Artifact>>;
}

/// Produces live artifacts and owns their serialization format and TTL
/// policy. Factories are registered by name at process start.
pub trait Factory: Send + Sync {
    /// The name artifacts created by this factory are stored under.
    fn name(&self) -> &str;

    /// Construct a fresh artifact from creation parameters.
    fn create(&self, params: Value) -> Result<Box<dyn Artifact>>;

    /// The serializer for this factory's artifacts.
    fn serializer(&self) -> &dyn Serializer;

    /// TTL in seconds applied to new artifacts when the caller asks for
    /// the default policy. `None` means never expire.
    fn default_ttl(&self) -> Option<i64> {
        None
    }
}

/// A named singleton operation, resolved through the service registry.
pub trait Service: Send + Sync {
    /// The name this service is registered under.
    fn name(&self) -> &str;

    /// Perform the service call.
    fn perform(&self, ctx: &mut CallContext, input: Value) -> Result<Value>;
}

impl std::fmt::Debug for dyn Factory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factory").field("name", &self.name()).finish()
    }
}

impl std::fmt::Debug for dyn Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service").field("name", &self.name()).finish()
    }
}
