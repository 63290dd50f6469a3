// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Test factories and listeners for curio integration suites.
//!
//! [`NoteFactory`] produces a small JSON-serialized artifact whose verbs
//! exercise every engine path: mutation, backgrounding, replacement, and
//! an observable end-of-life hook. [`RecordingListener`] captures store
//! events for assertions.

use std::any::Any;
use std::io::Write;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use curio_core::artifact::{Artifact, Factory, Outcome, Serializer, Service};
use curio_core::context::{CallContext, PostCallAction};
use curio_core::error::{EngineError, Result};
use curio_core::events::{StoreEvent, StoreListener};

type ExpireLog = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Serialize, Deserialize)]
struct NotePayload {
    title: String,
    body: String,
    revision: u64,
}

/// A note: the simplest useful artifact.
///
/// Feed semantics:
/// - `{"title": ..., "body": ...}` updates fields and bumps the revision
/// - `{"background": true}` additionally defers completion
/// - `{"replace_with": {"title": ..., "body": ...}}` hands the call
///   target over to a fresh note
pub struct NoteArtifact {
    /// Note title; titles starting with `poison` make the end-of-life
    /// hook fail, for collector robustness tests.
    pub title: String,
    /// Note body, rendered by `out`.
    pub body: String,
    /// Bumped on every mutation.
    pub revision: u64,
    /// Transient scratch space, cleared by `sanitize` and never stored.
    pub scratch: String,
    expire_log: ExpireLog,
}

impl Artifact for NoteArtifact {
    fn describe(&self, _ctx: &mut CallContext) -> Result<Value> {
        Ok(json!({ "title": self.title, "revision": self.revision }))
    }

    fn feed(&mut self, ctx: &mut CallContext, input: Value) -> Result<Outcome> {
        if let Some(replacement) = input.get("replace_with") {
            let title = replacement
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let body = replacement
                .get("body")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Ok(Outcome::Replace(Box::new(NoteArtifact {
                title,
                body,
                revision: 0,
                scratch: String::new(),
                expire_log: self.expire_log.clone(),
            })));
        }

        if input.get("background").and_then(Value::as_bool) == Some(true) {
            ctx.set_after_call(PostCallAction::Background);
        }

        if let Some(title) = input.get("title").and_then(Value::as_str) {
            self.title = title.to_string();
        }
        if let Some(body) = input.get("body").and_then(Value::as_str) {
            self.body = body.to_string();
        }
        self.revision += 1;
        Ok(Outcome::Continue)
    }

    fn advance(&mut self, _ctx: &mut CallContext) -> Result<Outcome> {
        self.revision += 1;
        Ok(Outcome::Continue)
    }

    fn out(&self, _ctx: &mut CallContext, sink: &mut dyn Write) -> Result<()> {
        sink.write_all(self.body.as_bytes())
            .map_err(|e| EngineError::InvalidPayload {
                reason: format!("failed to render note: {}", e),
            })
    }

    fn on_expire(&mut self) -> Result<()> {
        self.expire_log
            .lock()
            .expect("expire log poisoned")
            .push(self.title.clone());
        if self.title.starts_with("poison") {
            return Err(EngineError::InvalidPayload {
                reason: format!("note '{}' refuses to die", self.title),
            });
        }
        Ok(())
    }

    fn sanitize(&mut self) {
        self.scratch.clear();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// JSON serializer for [`NoteArtifact`].
pub struct NoteSerializer {
    expire_log: ExpireLog,
}

impl Serializer for NoteSerializer {
    fn to_bytes(&self, artifact: &dyn Artifact) -> Result<Vec<u8>> {
        let note = artifact
            .as_any()
            .downcast_ref::<NoteArtifact>()
            .ok_or_else(|| EngineError::InvalidPayload {
                reason: "note serializer received a foreign artifact".to_string(),
            })?;
        let payload = NotePayload {
            title: note.title.clone(),
            body: note.body.clone(),
            revision: note.revision,
        };
        Ok(serde_json::to_vec(&payload)?)
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<Box<dyn Artifact>> {
        let payload: NotePayload = serde_json::from_slice(bytes)?;
        Ok(Box::new(NoteArtifact {
            title: payload.title,
            body: payload.body,
            revision: payload.revision,
            scratch: String::new(),
            expire_log: self.expire_log.clone(),
        }))
    }
}

/// Factory for [`NoteArtifact`]s, registered under `note`.
pub struct NoteFactory {
    default_ttl: Option<i64>,
    serializer: NoteSerializer,
    expire_log: ExpireLog,
}

impl NoteFactory {
    /// Create a factory whose notes default to the given TTL.
    pub fn new(default_ttl: Option<i64>) -> Self {
        let expire_log: ExpireLog = Arc::new(Mutex::new(Vec::new()));
        Self {
            default_ttl,
            serializer: NoteSerializer {
                expire_log: expire_log.clone(),
            },
            expire_log,
        }
    }

    /// Titles whose end-of-life hook has run, in invocation order.
    pub fn expired_titles(&self) -> Vec<String> {
        self.expire_log.lock().expect("expire log poisoned").clone()
    }
}

impl Factory for NoteFactory {
    fn name(&self) -> &str {
        "note"
    }

    fn create(&self, params: Value) -> Result<Box<dyn Artifact>> {
        let title = params
            .get("title")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::InvalidPayload {
                reason: "note creation requires a title".to_string(),
            })?
            .to_string();
        let body = params
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(Box::new(NoteArtifact {
            title,
            body,
            revision: 0,
            scratch: String::new(),
            expire_log: self.expire_log.clone(),
        }))
    }

    fn serializer(&self) -> &dyn Serializer {
        &self.serializer
    }

    fn default_ttl(&self) -> Option<i64> {
        self.default_ttl
    }
}

/// Listener that records every event it sees.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<StoreEvent>>,
}

impl RecordingListener {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events.
    pub fn events(&self) -> Vec<StoreEvent> {
        self.events.lock().expect("event log poisoned").clone()
    }

    /// All artifact ids from `ArtifactsKilled` notifications, flattened
    /// in arrival order.
    pub fn killed_artifacts(&self) -> Vec<Uuid> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                StoreEvent::ArtifactsKilled { uuids } => Some(uuids),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// All collection ids from `CollectionsKilled` notifications.
    pub fn killed_collections(&self) -> Vec<Uuid> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                StoreEvent::CollectionsKilled { uuids } => Some(uuids),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Drop everything recorded so far.
    pub fn clear(&self) {
        self.events.lock().expect("event log poisoned").clear();
    }
}

impl StoreListener for RecordingListener {
    fn on_event(&self, event: &StoreEvent) {
        self.events
            .lock()
            .expect("event log poisoned")
            .push(event.clone());
    }
}

/// Service that echoes its input, registered under `echo`.
pub struct EchoService;

impl Service for EchoService {
    fn name(&self) -> &str {
        "echo"
    }

    fn perform(&self, _ctx: &mut CallContext, input: Value) -> Result<Value> {
        Ok(json!({ "echo": input }))
    }
}
