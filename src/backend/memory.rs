use super::{Backend, InvokeFuture, ENTITIES_DELETE, ENTITIES_SAVE, ENTITY_GET, WORKSPACE_LOAD};
use crate::errors::{SyncError, SyncResult};
use crate::models::{EntityKind, RevisionEnvelope};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct InvokeRecord {
    pub channel: String,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
enum ScriptedFailure {
    Backend(String),
    Transport(String),
}

#[derive(Debug, Clone)]
struct StoredDocument {
    revision: u64,
    data: Value,
}

#[derive(Debug, Clone)]
struct SaveTarget {
    kind: EntityKind,
    id: String,
    expected_revision: u64,
    data: Value,
}

#[derive(Default)]
struct MemoryInner {
    documents: Mutex<BTreeMap<EntityKind, BTreeMap<String, StoredDocument>>>,
    calls: Mutex<Vec<InvokeRecord>>,
    failures: Mutex<VecDeque<ScriptedFailure>>,
    latency: Mutex<Duration>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

/// Revisioned document backend kept in memory. Every write checks the
/// caller's expected revision and bumps the stored one, the same contract a
/// persistent workspace process honours.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    inner: Arc<MemoryInner>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        let backend = Self::new();
        backend.set_latency(latency);
        backend
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock().expect("memory backend latency lock") = latency;
    }

    pub fn seed(&self, kind: EntityKind, id: &str, revision: u64, data: Value) {
        self.documents()
            .entry(kind)
            .or_default()
            .insert(id.to_string(), StoredDocument { revision, data });
    }

    /// Simulates a write from another client. Returns the new revision.
    pub fn external_write(&self, kind: EntityKind, id: &str, data: Value) -> u64 {
        let mut documents = self.documents();
        let entries = documents.entry(kind).or_default();
        let revision = entries.get(id).map(|doc| doc.revision).unwrap_or(0) + 1;
        entries.insert(id.to_string(), StoredDocument { revision, data });
        revision
    }

    pub fn document(&self, kind: EntityKind, id: &str) -> Option<RevisionEnvelope<Value>> {
        self.documents()
            .get(&kind)
            .and_then(|entries| entries.get(id))
            .map(|doc| RevisionEnvelope::new(id, doc.revision, doc.data.clone()))
    }

    pub fn calls(&self) -> Vec<InvokeRecord> {
        self.inner.calls.lock().expect("memory backend calls lock").clone()
    }

    pub fn calls_on(&self, channel: &str) -> Vec<InvokeRecord> {
        self.calls()
            .into_iter()
            .filter(|call| call.channel == channel)
            .collect()
    }

    /// Highest number of `invoke` calls observed in flight at once.
    pub fn max_concurrent_calls(&self) -> usize {
        self.inner.max_active.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, message: &str) {
        self.push_failure(ScriptedFailure::Backend(message.to_string()));
    }

    pub fn fail_next_transport(&self, message: &str) {
        self.push_failure(ScriptedFailure::Transport(message.to_string()));
    }

    fn push_failure(&self, failure: ScriptedFailure) {
        self.inner
            .failures
            .lock()
            .expect("memory backend failures lock")
            .push_back(failure);
    }

    fn documents(&self) -> std::sync::MutexGuard<'_, BTreeMap<EntityKind, BTreeMap<String, StoredDocument>>> {
        self.inner.documents.lock().expect("memory backend documents lock")
    }

    fn handle(&self, channel: &str, payload: &Value) -> SyncResult<Value> {
        let scripted = self
            .inner
            .failures
            .lock()
            .expect("memory backend failures lock")
            .pop_front();
        match scripted {
            Some(ScriptedFailure::Transport(message)) => return Err(SyncError::Transport(message)),
            Some(ScriptedFailure::Backend(message)) => return Ok(failure(&message)),
            None => {}
        }

        let reply = match channel {
            ENTITIES_SAVE => match parse_targets(payload) {
                Ok(targets) => self.save(targets),
                Err(message) => failure(&message),
            },
            ENTITIES_DELETE => match parse_targets(payload) {
                Ok(targets) => self.delete(targets),
                Err(message) => failure(&message),
            },
            ENTITY_GET => self.get(payload),
            WORKSPACE_LOAD => self.load_all(),
            other => failure(&format!("unknown channel {}", other)),
        };
        Ok(reply)
    }

    fn save(&self, targets: Vec<SaveTarget>) -> Value {
        let mut documents = self.documents();
        if let Some(conflict) = conflict_reply(&documents, &targets) {
            return conflict;
        }

        if let Some(empty) = targets.iter().find(|target| target.data.is_null()) {
            return failure(&format!("{} {} has no data to save", empty.kind, empty.id));
        }

        let mut reply = Map::new();
        for target in targets {
            let entries = documents.entry(target.kind).or_default();
            let revision = target.expected_revision + 1;
            entries.insert(
                target.id.clone(),
                StoredDocument {
                    revision,
                    data: target.data.clone(),
                },
            );
            reply.insert(
                target.kind.as_str().to_string(),
                json!({"id": target.id, "revision": revision, "data": target.data}),
            );
        }
        json!({"success": true, "payload": reply})
    }

    fn delete(&self, targets: Vec<SaveTarget>) -> Value {
        let mut documents = self.documents();
        if let Some(conflict) = conflict_reply(&documents, &targets) {
            return conflict;
        }

        let mut deleted: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
        for target in targets {
            if let Some(entries) = documents.get_mut(&target.kind) {
                entries.remove(&target.id);
            }
            deleted.entry(target.kind.as_str()).or_default().push(target.id);
        }
        json!({"success": true, "payload": {"deleted": deleted}})
    }

    fn get(&self, payload: &Value) -> Value {
        let kind = payload
            .get("kind")
            .and_then(Value::as_str)
            .and_then(EntityKind::from_wire);
        let id = payload.get("id").and_then(Value::as_str);
        let (Some(kind), Some(id)) = (kind, id) else {
            return failure("entity_get requires `kind` and `id`");
        };
        match self.document(kind, id) {
            Some(envelope) => json!({"success": true, "entity": envelope}),
            None => failure(&format!("NOT_FOUND: {} {}", kind, id)),
        }
    }

    fn load_all(&self) -> Value {
        let documents = self.documents();
        let mut reply = Map::new();
        reply.insert("success".to_string(), Value::Bool(true));
        for kind in EntityKind::ALL {
            let envelopes = documents
                .get(&kind)
                .map(|entries| {
                    entries
                        .iter()
                        .map(|(id, doc)| json!({"id": id, "revision": doc.revision, "data": doc.data}))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            reply.insert(kind.as_str().to_string(), Value::Array(envelopes));
        }
        Value::Object(reply)
    }
}

impl Backend for InMemoryBackend {
    fn invoke(&self, channel: &str, payload: Value) -> InvokeFuture {
        let backend = self.clone();
        let channel = channel.to_string();
        Box::pin(async move {
            backend
                .inner
                .calls
                .lock()
                .expect("memory backend calls lock")
                .push(InvokeRecord {
                    channel: channel.clone(),
                    payload: payload.clone(),
                    at: Utc::now(),
                });
            let active = backend.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
            backend.inner.max_active.fetch_max(active, Ordering::SeqCst);

            let latency = *backend.inner.latency.lock().expect("memory backend latency lock");
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            let result = backend.handle(&channel, &payload);
            backend.inner.active.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }
}

fn failure(message: &str) -> Value {
    json!({"success": false, "error": message})
}

fn parse_targets(payload: &Value) -> Result<Vec<SaveTarget>, String> {
    let Some(entities) = payload.get("payload").and_then(Value::as_object) else {
        return Err("request is missing `payload`".to_string());
    };
    entities
        .iter()
        .map(|(kind, entity)| {
            let kind = EntityKind::from_wire(kind).ok_or_else(|| format!("unknown entity kind {}", kind))?;
            let id = entity
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| format!("{} entity is missing `id`", kind))?;
            let expected_revision = entity
                .get("expectedRevision")
                .and_then(Value::as_u64)
                .ok_or_else(|| format!("{} {} is missing `expectedRevision`", kind, id))?;
            Ok(SaveTarget {
                kind,
                id: id.to_string(),
                expected_revision,
                data: entity.get("data").cloned().unwrap_or(Value::Null),
            })
        })
        .collect()
}

fn conflict_reply(
    documents: &BTreeMap<EntityKind, BTreeMap<String, StoredDocument>>,
    targets: &[SaveTarget],
) -> Option<Value> {
    let mut stale = false;
    let mut latest = Map::new();
    for target in targets {
        let current = documents.get(&target.kind).and_then(|entries| entries.get(&target.id));
        let current_revision = current.map(|doc| doc.revision).unwrap_or(0);
        if current_revision != target.expected_revision {
            stale = true;
        }
        if let Some(doc) = current {
            latest.insert(
                target.kind.as_str().to_string(),
                json!({"id": target.id, "revision": doc.revision, "data": doc.data}),
            );
        }
    }
    stale.then(|| json!({"success": false, "conflict": true, "payload": latest}))
}

#[cfg(test)]
mod tests {
    use super::InMemoryBackend;
    use crate::backend::{Backend, ENTITIES_DELETE, ENTITIES_SAVE, ENTITY_GET, WORKSPACE_LOAD};
    use crate::models::EntityKind;
    use serde_json::json;

    fn save_payload(expected: u64, title: &str) -> serde_json::Value {
        json!({"payload": {"prompt": {"id": "p1", "expectedRevision": expected, "data": {"id": "p1", "title": title}}}})
    }

    #[tokio::test]
    async fn save_increments_revision_and_detects_stale_writes() {
        let backend = InMemoryBackend::new();
        let first = backend
            .invoke(ENTITIES_SAVE, save_payload(0, "A"))
            .await
            .expect("first save");
        assert_eq!(first["payload"]["prompt"]["revision"], 1);

        let stale = backend
            .invoke(ENTITIES_SAVE, save_payload(0, "B"))
            .await
            .expect("stale save");
        assert_eq!(stale["conflict"], true);
        assert_eq!(stale["payload"]["prompt"]["data"]["title"], "A");
        assert_eq!(backend.document(EntityKind::Prompt, "p1").expect("doc").revision, 1);
    }

    #[tokio::test]
    async fn delete_and_load_round_trip() {
        let backend = InMemoryBackend::new();
        backend.seed(EntityKind::Folder, "f1", 3, json!({"id": "f1", "name": "Inbox"}));
        let loaded = backend.invoke(WORKSPACE_LOAD, json!({})).await.expect("load");
        assert_eq!(loaded["folder"][0]["revision"], 3);

        let deleted = backend
            .invoke(
                ENTITIES_DELETE,
                json!({"payload": {"folder": {"id": "f1", "expectedRevision": 3, "data": null}}}),
            )
            .await
            .expect("delete");
        assert_eq!(deleted["payload"]["deleted"]["folder"][0], "f1");

        let missing = backend
            .invoke(ENTITY_GET, json!({"kind": "folder", "id": "f1"}))
            .await
            .expect("get");
        assert_eq!(missing["success"], false);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let backend = InMemoryBackend::new();
        backend.fail_next("disk full");
        backend.fail_next_transport("socket closed");

        let reply = backend.invoke(ENTITIES_SAVE, save_payload(0, "A")).await.expect("reply");
        assert_eq!(reply["error"], "disk full");
        let err = backend
            .invoke(ENTITIES_SAVE, save_payload(0, "A"))
            .await
            .expect_err("transport");
        assert_eq!(err.code(), "TRANSPORT_FAILURE");
        assert!(backend.invoke(ENTITIES_SAVE, save_payload(0, "A")).await.is_ok());
        assert_eq!(backend.calls_on(ENTITIES_SAVE).len(), 3);
    }
}
